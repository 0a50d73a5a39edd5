// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The channel link: the service which drives a channel's commitment update
//! state machine.
//!
//! All channel state changes funnel through one serial event loop (the HTLC
//! manager), which multiplexes peer messages, switch packets, block
//! notifications, timers and control requests, applies them to the channel
//! machine, and emits the resulting wire traffic. HTLCs that need to travel
//! to another channel are handed to the switch; HTLCs terminating here are
//! settled against the invoice registry.

use bitcoin::hashes::{Hash, sha256};

use crate::chain::chaininterface::{BlockEpoch, ChainEventSubscription, FeeEstimator, PreimageCache};
use crate::ln::channel::{ChannelError, ChannelMachine, Htlc, MAX_HTLC_NUMBER, PaymentDescriptor};
use crate::ln::invoices::InvoiceRegistry;
use crate::ln::mailbox::Mailbox;
use crate::ln::msgs::{ChannelUpdate, ErrorMessage, FailureMessage, FundingLocked, Message, OnionPacket, OpaqueReason, UpdateAddHTLC, UpdateFailHTLC, UpdateFailMalformedHTLC, UpdateFee, UpdateFulfillHTLC, CommitmentSigned};
use crate::ln::onion_utils::{ErrorEncrypter, FailCode, NextHop, OnionDecoder};
use crate::ln::PaymentHash;
use crate::ln::packet_queue::PacketQueue;
use crate::ln::peer::PeerTransport;
use crate::ln::switch::{HtlcMessage, HtlcPacket, PaymentCircuit, Switch};
use crate::util::logger::Logger;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;

use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A grace period that the timeout of incoming HTLCs that pay directly to us
/// (i.e. we're the "exit node") must uphold. We reject any HTLC whose timeout
/// minus this value is less than or equal to the current block height, so
/// that if the extending party goes to chain we can still claim the HTLC.
const EXPIRY_GRACE_DELTA: u32 = 2;

/// How long we go without sending or receiving a commitment update before
/// checking whether the commitment chains have desynchronized.
const LOG_COMMIT_INTERVAL: Duration = Duration::from_millis(300);

/// How often pending updates are flushed into a new commitment even when the
/// batch stays small.
const BATCH_INTERVAL: Duration = Duration::from_millis(50);

/// How long we wait for the counterparty's channel_reestablish on reconnect.
const CHAN_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// The set of constraints a channel link adheres to when forwarding HTLCs.
/// For each incoming HTLC these constraints are consulted to ensure adequate
/// fees are paid and our time-lock parameters are respected; a violating HTLC
/// is rejected with an error possibly carrying our latest channel update.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ForwardingPolicy {
	/// The smallest HTLC that will be forwarded, in milli-satoshi.
	pub min_htlc_msat: u64,
	/// The base fee, in milli-satoshi, charged for each forwarded HTLC.
	pub base_fee_msat: u64,
	/// The proportional fee, in millionths of the forwarded amount.
	pub fee_rate_millionths: u64,
	/// The number of blocks subtracted from an incoming HTLC's time-lock to
	/// produce the outgoing HTLC's time-lock.
	pub time_lock_delta: u32,
}

/// Computes the fee a forwarded HTLC of `amount_msat` must carry to satisfy
/// the policy: `base_fee + amount * fee_rate / 1_000_000`, truncating.
pub fn expected_fee(policy: ForwardingPolicy, amount_msat: u64) -> u64 {
	policy.base_fee_msat + ((amount_msat as u128 * policy.fee_rate_millionths as u128) / 1_000_000) as u64
}

/// Returns true if the commitment fee should move to the sampled network fee,
/// which we only do when the two differ by at least 10% in either direction.
pub fn should_adjust_commit_fee(net_fee: u64, chan_fee: u64) -> bool {
	if net_fee > chan_fee && net_fee >= chan_fee + chan_fee / 10 {
		return true;
	}
	if net_fee < chan_fee && net_fee <= chan_fee - chan_fee / 10 {
		return true;
	}
	false
}

/// The per-channel signal streams handed to the chain arbitrator when the
/// link starts serving the channel.
pub struct ContractSignals {
	/// Receives the channel's active HTLC set after every revocation.
	pub htlc_updates: mpsc::Receiver<Vec<Htlc>>,
	/// The short channel id the signals belong to.
	pub short_channel_id: u64,
}

/// Errors returned by [`ChannelLink`] lifecycle operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkError {
	/// The link has already been started once.
	AlreadyStarted,
}

impl fmt::Display for LinkError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			LinkError::AlreadyStarted => write!(f, "channel link already started"),
		}
	}
}

/// Everything a [`ChannelLink`] needs to carry out its duties. All elements
/// MUST be populated for the link to operate.
pub struct ChannelLinkConfig<P: Deref, S: Deref, IR: Deref, PC: Deref, F: Deref, OD: Deref, L: Deref>
	where P::Target: PeerTransport, S::Target: Switch, IR::Target: InvoiceRegistry,
		PC::Target: PreimageCache, F::Target: FeeEstimator, OD::Target: OnionDecoder,
		L::Target: Logger,
{
	/// The initial forwarding policy; updated later through
	/// [`ChannelLink::update_forwarding_policy`].
	pub forwarding_policy: ForwardingPolicy,
	/// The node we have this channel with.
	pub peer: P,
	/// The process-wide HTLC switch packets are forwarded to.
	pub switch: S,
	/// The invoice registry consulted for exit-hop HTLCs.
	pub registry: IR,
	/// The global preimage cache shared with on-chain arbitrators.
	pub preimage_cache: PC,
	/// A live fee estimator used to keep the commitment fee competitive.
	pub fee_estimator: F,
	/// The Sphinx machinery that peels onion packets for us.
	pub onion_decoder: OD,
	/// The logger all link records are written to.
	pub logger: L,
	/// Produces our latest channel update for inclusion in failure messages,
	/// or `None` when no update is available yet.
	pub get_last_channel_update: Box<dyn Fn() -> Option<ChannelUpdate> + Send + Sync>,
	/// Publishes the channel's contract signals to the chain arbitrator.
	/// Invoked once, from a background task, when the link starts.
	pub update_contract_signals: Box<dyn FnOnce(ContractSignals) -> Result<(), ()> + Send>,
	/// The chain watcher's event subscription for this channel.
	pub chain_events: ChainEventSubscription,
	/// New best blocks, driving expiry checks and fee sampling.
	pub block_epochs: mpsc::Receiver<BlockEpoch>,
	/// When set, exit-hop amount and time-lock validation is suppressed so
	/// that HTLCs to a known debug R-hash settle in the next transition.
	pub debug_htlc: bool,
	/// When set together with `debug_htlc`, exit-hop HTLCs are left pending
	/// instead of settled. Note that such an HTLC is stranded until its
	/// expiry, as no commitment update is initiated for it.
	pub hodl_htlc: bool,
	/// Whether to run reconnection resynchronization before serving. Set
	/// this after a restart or whenever the peer has reconnected.
	pub sync_states: bool,
}

/// Control-channel requests served by the event loop.
enum LinkControl {
	UpdatePolicy {
		policy: ForwardingPolicy,
		done: oneshot::Sender<()>,
	},
	GetBandwidth {
		resp: oneshot::Sender<u64>,
	},
}

/// State deferred from construction to `start`, consumed exactly once.
struct LinkStartup<CM, P: Deref, S: Deref, IR: Deref, PC: Deref, F: Deref, OD: Deref, L: Deref>
	where CM: ChannelMachine, P::Target: PeerTransport, S::Target: Switch,
		IR::Target: InvoiceRegistry, PC::Target: PreimageCache, F::Target: FeeEstimator,
		OD::Target: OnionDecoder, L::Target: Logger,
{
	manager: HtlcManager<CM, P, S, IR, PC, F, OD, L>,
	update_contract_signals: Box<dyn FnOnce(ContractSignals) -> Result<(), ()> + Send>,
	htlc_updates_rx: mpsc::Receiver<Vec<Htlc>>,
}

/// The service which drives a single channel's commitment update state
/// machine and bridges it with the switch.
///
/// This handle is cheap to share; all mutation happens on the event-loop task
/// spawned by [`ChannelLink::start`].
pub struct ChannelLink<CM, P: Deref, S: Deref, IR: Deref, PC: Deref, F: Deref, OD: Deref, L: Deref>
	where CM: ChannelMachine, P::Target: PeerTransport, S::Target: Switch,
		IR::Target: InvoiceRegistry, PC::Target: PreimageCache, F::Target: FeeEstimator,
		OD::Target: OnionDecoder, L::Target: Logger,
{
	started: AtomicBool,
	stopped: AtomicBool,
	channel: Arc<CM>,
	peer: P,
	logger: L,
	mailbox: Mailbox,
	overflow_queue: Arc<PacketQueue>,
	control_tx: mpsc::UnboundedSender<LinkControl>,
	quit_tx: watch::Sender<bool>,
	quit_rx: watch::Receiver<bool>,
	task: Mutex<Option<JoinHandle<()>>>,
	startup: Mutex<Option<LinkStartup<CM, P, S, IR, PC, F, OD, L>>>,
}

impl<CM, P, S, IR, PC, F, OD, L> ChannelLink<CM, P, S, IR, PC, F, OD, L>
	where CM: ChannelMachine + 'static,
		P: Deref + Clone + Send + Sync + 'static, P::Target: PeerTransport,
		S: Deref + Clone + Send + Sync + 'static, S::Target: Switch,
		IR: Deref + Send + Sync + 'static, IR::Target: InvoiceRegistry,
		PC: Deref + Clone + Send + Sync + 'static, PC::Target: PreimageCache,
		F: Deref + Send + Sync + 'static, F::Target: FeeEstimator,
		OD: Deref + Send + Sync + 'static, OD::Target: OnionDecoder,
		L: Deref + Clone + Send + Sync + 'static, L::Target: Logger,
{
	/// Creates a new link over `channel`, serving it once started.
	pub fn new(cfg: ChannelLinkConfig<P, S, IR, PC, F, OD, L>, channel: Arc<CM>, best_height: u32) -> Self {
		let (mailbox, mailbox_receivers) = Mailbox::new();
		let (overflow_queue, overflow_rx) = PacketQueue::new(MAX_HTLC_NUMBER / 2);
		let overflow_queue = Arc::new(overflow_queue);
		let (control_tx, control_rx) = mpsc::unbounded_channel();
		let (quit_tx, quit_rx) = watch::channel(false);
		let (htlc_updates_tx, htlc_updates_rx) = mpsc::channel(1);

		let manager = HtlcManager {
			channel: Arc::clone(&channel),
			peer: cfg.peer.clone(),
			switch: cfg.switch,
			registry: cfg.registry,
			preimage_cache: cfg.preimage_cache,
			fee_estimator: cfg.fee_estimator,
			onion_decoder: cfg.onion_decoder,
			logger: cfg.logger.clone(),
			get_last_channel_update: cfg.get_last_channel_update,
			policy: cfg.forwarding_policy,
			debug_htlc: cfg.debug_htlc,
			hodl_htlc: cfg.hodl_htlc,
			sync_states: cfg.sync_states,
			best_height,
			batch_counter: 0,
			overflow_queue: Arc::clone(&overflow_queue),
			overflow_rx,
			upstream: mailbox_receivers.messages,
			downstream: mailbox_receivers.packets,
			control_rx,
			block_epochs: cfg.block_epochs,
			chain_events: cfg.chain_events,
			htlc_updates_tx,
			quit_rx: quit_rx.clone(),
			log_commit_sleep: Box::pin(time::sleep(LOG_COMMIT_INTERVAL)),
			log_commit_armed: false,
		};

		ChannelLink {
			started: AtomicBool::new(false),
			stopped: AtomicBool::new(false),
			channel,
			peer: cfg.peer,
			logger: cfg.logger,
			mailbox,
			overflow_queue,
			control_tx,
			quit_tx,
			quit_rx,
			task: Mutex::new(None),
			startup: Mutex::new(Some(LinkStartup {
				manager,
				update_contract_signals: cfg.update_contract_signals,
				htlc_updates_rx,
			})),
		}
	}

	/// Starts serving the channel: publishes the contract signals to the
	/// chain arbitrator and spawns the HTLC manager. Fails on double-start.
	pub fn start(&self) -> Result<(), LinkError> {
		if self.started.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
			log_warn!(self.logger, "channel link({}): already started", self.channel.short_channel_id());
			return Err(LinkError::AlreadyStarted);
		}
		let startup = match self.startup.lock().unwrap().take() {
			Some(startup) => startup,
			None => return Err(LinkError::AlreadyStarted),
		};

		log_info!(self.logger, "ChannelLink({}) is starting", self.channel.short_channel_id());

		let signals = ContractSignals {
			htlc_updates: startup.htlc_updates_rx,
			short_channel_id: self.channel.short_channel_id(),
		};
		let update_contract_signals = startup.update_contract_signals;
		let logger = self.logger.clone();
		let short_channel_id = self.channel.short_channel_id();
		tokio::spawn(async move {
			if update_contract_signals(signals).is_err() {
				log_error!(logger, "unable to update signals for ChannelLink({})", short_channel_id);
			}
		});

		let handle = tokio::spawn(startup.manager.run());
		*self.task.lock().unwrap() = Some(handle);
		Ok(())
	}

	/// Stops the link and waits for the HTLC manager to exit. A second stop
	/// is a no-op.
	pub async fn stop(&self) {
		if self.stopped.swap(true, Ordering::SeqCst) {
			log_warn!(self.logger, "channel link({}): already stopped", self.channel.short_channel_id());
			return;
		}
		log_info!(self.logger, "ChannelLink({}) is stopping", self.channel.short_channel_id());

		let _ = self.quit_tx.send(true);
		self.channel.stop();

		let task = self.task.lock().unwrap().take();
		if let Some(task) = task {
			let _ = task.await;
		}
	}

	/// Whether the channel can accept forwarding requests: we can only
	/// initiate new state once we know the counterparty's next revocation
	/// point.
	pub fn eligible_to_forward(&self) -> bool {
		self.channel.remote_next_revocation().is_some()
	}

	/// The total amount, in milli-satoshi, that can currently flow through
	/// the link: the channel's available balance minus everything waiting in
	/// the overflow queue.
	pub fn bandwidth(&self) -> u64 {
		self.channel.available_balance_msat().saturating_sub(self.overflow_queue.total_htlc_amount())
	}

	/// The location of the funding output in the chain.
	pub fn short_chan_id(&self) -> u64 {
		self.channel.short_channel_id()
	}

	/// The channel id, derived from the funding outpoint.
	pub fn chan_id(&self) -> [u8; 32] {
		self.channel.channel_id()
	}

	/// The transport to the node we have this channel with.
	pub fn peer(&self) -> &P::Target {
		self.peer.deref()
	}

	/// The channel's commitment height and lifetime sent/received totals.
	pub fn stats(&self) -> (u64, u64, u64) {
		let snapshot = self.channel.snapshot();
		(snapshot.commit_height, snapshot.total_msat_sent, snapshot.total_msat_received)
	}

	/// Replaces the non-zero fields of the forwarding policy, leaving
	/// zero-valued fields of `policy` without effect. Resolves once the
	/// event loop has applied the update, or at shutdown.
	pub async fn update_forwarding_policy(&self, policy: ForwardingPolicy) {
		let (done, done_rx) = oneshot::channel();
		if self.control_tx.send(LinkControl::UpdatePolicy { policy, done }).is_err() {
			return;
		}
		let mut quit = self.quit_rx.clone();
		tokio::select! {
			_ = done_rx => {},
			_ = quit.wait_for(|quit| *quit) => {},
		}
	}

	/// Queries the link's bandwidth through the control channel, observing
	/// it in series with the event loop. Returns `None` at shutdown.
	pub async fn query_bandwidth(&self) -> Option<u64> {
		let (resp, resp_rx) = oneshot::channel();
		if self.control_tx.send(LinkControl::GetBandwidth { resp }).is_err() {
			return None;
		}
		let mut quit = self.quit_rx.clone();
		tokio::select! {
			res = resp_rx => res.ok(),
			_ = quit.wait_for(|quit| *quit) => None,
		}
	}

	/// Hands the link a packet from the switch: a fresh add to extend over
	/// this channel, or the resolution of an HTLC we forwarded earlier.
	pub fn handle_switch_packet(&self, packet: HtlcPacket) {
		self.mailbox.add_packet(packet);
	}

	/// Hands the link a commitment-protocol wire message from the peer.
	pub fn handle_channel_update(&self, msg: Message) {
		self.mailbox.add_message(msg);
	}
}

/// One iteration's worth of work, as selected from the event sources.
enum LinkEvent {
	BlockEpoch(Option<BlockEpoch>),
	UnilateralClose(Option<()>),
	LogCommitTick,
	BatchTick,
	Overflow(Option<HtlcPacket>),
	Downstream(Option<HtlcPacket>),
	Upstream(Option<Message>),
	Control(Option<LinkControl>),
	Quit,
}

/// The serial event loop owning all channel state. Everything the loop needs
/// is moved in here at `start`; the handle keeps only thread-safe producers.
struct HtlcManager<CM, P: Deref, S: Deref, IR: Deref, PC: Deref, F: Deref, OD: Deref, L: Deref>
	where CM: ChannelMachine, P::Target: PeerTransport, S::Target: Switch,
		IR::Target: InvoiceRegistry, PC::Target: PreimageCache, F::Target: FeeEstimator,
		OD::Target: OnionDecoder, L::Target: Logger,
{
	channel: Arc<CM>,
	peer: P,
	switch: S,
	registry: IR,
	preimage_cache: PC,
	fee_estimator: F,
	onion_decoder: OD,
	logger: L,
	get_last_channel_update: Box<dyn Fn() -> Option<ChannelUpdate> + Send + Sync>,

	policy: ForwardingPolicy,
	debug_htlc: bool,
	hodl_htlc: bool,
	sync_states: bool,

	best_height: u32,
	// The number of updates applied locally but not yet included in a
	// commitment: uncommitted downstream additions plus settles sent but not
	// yet committed. Reset to zero whenever a commitment_signed goes out.
	batch_counter: u32,

	overflow_queue: Arc<PacketQueue>,
	overflow_rx: mpsc::UnboundedReceiver<HtlcPacket>,
	upstream: mpsc::UnboundedReceiver<Message>,
	downstream: mpsc::UnboundedReceiver<HtlcPacket>,
	control_rx: mpsc::UnboundedReceiver<LinkControl>,
	block_epochs: mpsc::Receiver<BlockEpoch>,
	chain_events: ChainEventSubscription,
	htlc_updates_tx: mpsc::Sender<Vec<Htlc>>,
	quit_rx: watch::Receiver<bool>,

	log_commit_sleep: Pin<Box<time::Sleep>>,
	log_commit_armed: bool,
}

impl<CM, P, S, IR, PC, F, OD, L> HtlcManager<CM, P, S, IR, PC, F, OD, L>
	where CM: ChannelMachine + 'static,
		P: Deref + Clone + Send + Sync + 'static, P::Target: PeerTransport,
		S: Deref + Clone + Send + Sync + 'static, S::Target: Switch,
		IR: Deref + Send + Sync + 'static, IR::Target: InvoiceRegistry,
		PC: Deref + Clone + Send + Sync + 'static, PC::Target: PreimageCache,
		F: Deref + Send + Sync + 'static, F::Target: FeeEstimator,
		OD: Deref + Send + Sync + 'static, OD::Target: OnionDecoder,
		L: Deref + Clone + Send + Sync + 'static, L::Target: Logger,
{
	/// The main processing loop. Runs until shutdown, channel closure or a
	/// fatal error, after which the chain-events subscription and all other
	/// event sources are released by drop.
	async fn run(mut self) {
		log_info!(self.logger, "HTLC manager for ChannelLink({}) started, bandwidth={}",
			self.channel.short_channel_id(),
			self.channel.available_balance_msat().saturating_sub(self.overflow_queue.total_htlc_amount()));

		if self.sync_states {
			if let Err(reason) = self.sync_chan_states().await {
				self.fail(&reason);
				log_info!(self.logger, "ChannelLink({}) has exited", self.channel.short_channel_id());
				return;
			}
		}

		let mut batch_ticker = time::interval_at(time::Instant::now() + BATCH_INTERVAL, BATCH_INTERVAL);
		batch_ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

		let exit_err: Option<String> = loop {
			let event = tokio::select! {
				epoch = self.block_epochs.recv() => LinkEvent::BlockEpoch(epoch),
				close = self.chain_events.unilateral_close.recv() => LinkEvent::UnilateralClose(close),
				_ = self.log_commit_sleep.as_mut(), if self.log_commit_armed => LinkEvent::LogCommitTick,
				_ = batch_ticker.tick() => LinkEvent::BatchTick,
				packet = self.overflow_rx.recv() => LinkEvent::Overflow(packet),
				packet = self.downstream.recv() => LinkEvent::Downstream(packet),
				msg = self.upstream.recv() => LinkEvent::Upstream(msg),
				cmd = self.control_rx.recv() => LinkEvent::Control(cmd),
				_ = self.quit_rx.wait_for(|quit| *quit) => LinkEvent::Quit,
			};

			match event {
				// A new block has arrived: track the height and check
				// whether the commitment fee should chase the network fee.
				LinkEvent::BlockEpoch(Some(epoch)) => self.handle_block_epoch(epoch),
				LinkEvent::BlockEpoch(None) => break None,

				// The remote peer closed the channel on-chain: wipe the
				// channel from the peer and exit.
				LinkEvent::UnilateralClose(Some(())) => {
					log_warn!(self.logger, "remote peer has closed ChannelLink({}) on-chain", self.channel.short_channel_id());
					let peer = self.peer.clone();
					let logger = self.logger.clone();
					let channel_id = self.channel.channel_id();
					tokio::spawn(async move {
						if let Err(err) = peer.wipe_channel(&channel_id) {
							log_error!(logger, "unable to wipe channel: {}", err);
						}
					});
					break None;
				},
				LinkEvent::UnilateralClose(None) => break None,

				// We went an interval without a commitment update; if the
				// chains have desynchronized, sign to converge them.
				LinkEvent::LogCommitTick => {
					self.log_commit_armed = false;
					if !self.channel.fully_synced() {
						if let Err(err) = self.update_commit_tx() {
							break Some(format!("unable to update commitment: {}", err));
						}
					}
				},

				LinkEvent::BatchTick => {
					if self.batch_counter != 0 {
						if let Err(err) = self.update_commit_tx() {
							break Some(format!("unable to update commitment: {}", err));
						}
					}
				},

				// A packet that previously overflowed the commitment is
				// eligible for processing once again.
				LinkEvent::Overflow(Some(packet)) => {
					if let Err(reason) = self.handle_downstream_pkt(packet, true) {
						break Some(reason);
					}
				},
				LinkEvent::Overflow(None) => break None,

				LinkEvent::Downstream(Some(packet)) => {
					// While the overflow queue is busy, fresh adds join it
					// rather than racing past the deferred ones.
					let is_add = matches!(packet.htlc, HtlcMessage::Add(_));
					if is_add && !self.overflow_queue.is_empty() {
						log_info!(self.logger, "downstream htlc add update added to reprocessing queue, batch: {}", self.batch_counter);
						self.overflow_queue.add_pkt(packet);
					} else if let Err(reason) = self.handle_downstream_pkt(packet, false) {
						break Some(reason);
					}
				},
				LinkEvent::Downstream(None) => break None,

				LinkEvent::Upstream(Some(msg)) => {
					if let Err(reason) = self.handle_upstream_msg(msg).await {
						break Some(reason);
					}
				},
				LinkEvent::Upstream(None) => break None,

				LinkEvent::Control(Some(cmd)) => self.handle_control(cmd),
				LinkEvent::Control(None) => break None,

				LinkEvent::Quit => break None,
			}
		};

		if let Some(reason) = exit_err {
			self.fail(&reason);
		}
		log_info!(self.logger, "ChannelLink({}) has exited", self.channel.short_channel_id());
	}

	/// Attempts to synchronize channel state with the remote party upon
	/// reconnection: exchange channel_reestablish, replay whatever the
	/// machine says was lost, then settle any HTLCs whose preimages we
	/// learned while offline.
	async fn sync_chan_states(&mut self) -> Result<(), String> {
		log_info!(self.logger, "attempting to re-synchronize ChannelLink({})", self.channel.short_channel_id());

		let local_sync_msg = self.channel.reestablish_msg()
			.map_err(|err| format!("unable to generate chan sync message: {}", err))?;
		self.peer.send_message(Message::ChannelReestablish(local_sync_msg.clone()))
			.map_err(|err| format!("unable to send chan sync message: {}", err))?;

		// The first message sent MUST be the reestablish message, otherwise
		// we terminate the connection.
		let msg = tokio::select! {
			msg = self.upstream.recv() => msg.ok_or_else(|| "mailbox closed during sync".to_string())?,
			_ = self.quit_rx.wait_for(|quit| *quit) => return Err("shutting down".to_string()),
			_ = time::sleep(CHAN_SYNC_TIMEOUT) => {
				return Err("didn't receive ChannelReestablish before deadline".to_string());
			},
		};
		let remote_sync_msg = match msg {
			Message::ChannelReestablish(msg) => msg,
			other => {
				return Err(format!("first message sent to sync should be ChannelReestablish, instead received: {}", other.name()));
			},
		};

		// If the remote party indicates that they think we haven't done any
		// state updates yet, retransmit funding_locked: we can't be sure
		// they ever received it.
		if remote_sync_msg.next_local_commitment_number == 1
			&& local_sync_msg.next_local_commitment_number == 1
			&& !self.channel.is_pending()
		{
			log_info!(self.logger, "ChannelLink({}): resending funding_locked message to peer", self.channel.short_channel_id());
			let next_per_commitment_point = self.channel.next_revocation_point()
				.map_err(|err| format!("unable to create next revocation: {}", err))?;
			self.peer.send_message(Message::FundingLocked(FundingLocked {
				channel_id: self.channel.channel_id(),
				next_per_commitment_point,
			})).map_err(|err| format!("unable to re-send funding_locked: {}", err))?;
		}

		log_info!(self.logger, "received re-establishment message from remote side for ChannelLink({})", self.channel.short_channel_id());

		let msgs_to_resend = self.channel.process_reestablish_msg(&remote_sync_msg)
			.map_err(|err| format!("unable to handle upstream reestablish message: {}", err))?;
		if !msgs_to_resend.is_empty() {
			log_info!(self.logger, "sending {} updates to synchronize the state of ChannelLink({})",
				msgs_to_resend.len(), self.channel.short_channel_id());
		}
		for msg in &msgs_to_resend {
			self.peer.send_message(msg.clone())
				.map_err(|err| format!("unable to resend message during sync: {}", err))?;
		}

		// Note which settles were just retransmitted, keyed by HTLC index,
		// so the preimage scan below doesn't issue duplicates.
		let settled_indices: HashSet<u64> = msgs_to_resend.iter().filter_map(|msg| {
			match msg {
				Message::UpdateFulfillHTLC(settle) => Some(settle.htlc_id),
				_ => None,
			}
		}).collect();

		// Settle any incoming HTLCs we learned the preimage for while the
		// connection was down.
		for htlc in self.channel.active_htlcs() {
			if !htlc.incoming || settled_indices.contains(&htlc.htlc_index) {
				continue;
			}
			let preimage = match self.preimage_cache.lookup_preimage(&htlc.payment_hash) {
				Some(preimage) => preimage,
				None => continue,
			};

			self.channel.settle_htlc(preimage, htlc.htlc_index)
				.map_err(|err| format!("unable to settle htlc: {}", err))?;
			self.registry.settle_invoice(&htlc.payment_hash)
				.map_err(|err| format!("unable to settle invoice: {}", err))?;
			self.batch_counter += 1;
			if let Err(err) = self.peer.send_message(Message::UpdateFulfillHTLC(UpdateFulfillHTLC {
				channel_id: self.channel.channel_id(),
				htlc_id: htlc.htlc_index,
				payment_preimage: preimage,
			})) {
				log_warn!(self.logger, "unable to send settle to peer: {}", err);
			}
		}

		Ok(())
	}

	/// Tracks the new best height and, if we set this channel's fees,
	/// re-negotiates the commitment fee when the network rate has drifted.
	fn handle_block_epoch(&mut self, epoch: BlockEpoch) {
		self.best_height = epoch.height;

		// If we're not the initiator of the channel we don't control the
		// fees, so there is nothing further to do.
		if !self.channel.is_initiator() {
			return;
		}

		// Sample the rate needed to get into the chain within 3 blocks,
		// converting from fee-per-weight into the native fee-per-kw.
		let fee_per_weight = match self.fee_estimator.estimate_fee_per_weight(3) {
			Some(fee) => fee,
			None => {
				log_error!(self.logger, "unable to sample network fee");
				return;
			},
		};
		let fee_per_kw = fee_per_weight * 1000;
		log_debug!(self.logger, "ChannelLink({}): sampled fee rate for 3 block conf: {} sat/kw",
			self.channel.short_channel_id(), fee_per_kw);

		let commit_fee = self.channel.commit_feerate_per_kw();
		if !should_adjust_commit_fee(fee_per_kw, commit_fee) {
			return;
		}

		if let Err(err) = self.update_channel_fee(fee_per_kw) {
			log_error!(self.logger, "unable to update fee rate: {}", err);
		}
	}

	/// Commits to a new fee-per-kw on the channel by sending update_fee and
	/// immediately locking it in with a new commitment.
	fn update_channel_fee(&mut self, fee_per_kw: u64) -> Result<(), String> {
		log_info!(self.logger, "ChannelLink({}): updating commit fee to {} sat/kw",
			self.channel.short_channel_id(), fee_per_kw);

		// A channel that can't forward yet can't carry a fee update either.
		if self.channel.remote_next_revocation().is_none() {
			log_debug!(self.logger, "ChannelLink({}): skipping fee update for inactive channel",
				self.channel.short_channel_id());
			return Ok(());
		}

		self.channel.update_fee(fee_per_kw).map_err(|err| err.to_string())?;
		self.peer.send_message(Message::UpdateFee(UpdateFee {
			channel_id: self.channel.channel_id(),
			feerate_per_kw: fee_per_kw as u32,
		})).map_err(|err| err.to_string())?;
		self.update_commit_tx().map_err(|err| format!("unable to update commitment: {}", err))
	}

	/// Processes an HTLC packet sent by the switch: a new add to extend over
	/// this channel, or a settle/fail resolving an HTLC the peer extended.
	fn handle_downstream_pkt(&mut self, packet: HtlcPacket, is_reprocess: bool) -> Result<(), String> {
		let HtlcPacket { incoming_chan_id, incoming_htlc_id, htlc, obfuscator, .. } = packet;
		let mut is_settle = false;

		match htlc {
			HtlcMessage::Add(mut add) => {
				if is_reprocess {
					log_trace!(self.logger, "reprocessing downstream add update with payment hash({})",
						log_bytes!(add.payment_hash.0));
				}
				add.channel_id = self.channel.channel_id();
				match self.channel.add_htlc(&add) {
					// The channel's spare capacity is fully allocated;
					// defer the add until a slot frees up.
					Err(ChannelError::TooManyHtlcs) => {
						log_info!(self.logger, "downstream htlc add update with payment hash({}) added to reprocessing queue, batch: {}",
							log_bytes!(add.payment_hash.0), self.batch_counter);
						let amount_msat = add.amount_msat;
						self.overflow_queue.add_pkt(HtlcPacket {
							incoming_chan_id,
							incoming_htlc_id,
							outgoing_chan_id: 0,
							outgoing_htlc_id: 0,
							amount_msat,
							htlc: HtlcMessage::Add(add),
							obfuscator,
							is_routed: false,
							local_failure: false,
						});
						return Ok(());
					},
					// The HTLC was unusable; signal the switch to cancel
					// the pending payment back towards its origin.
					Err(err) => {
						log_warn!(self.logger, "unable to handle downstream add HTLC: {}", err);

						let failure = FailureMessage::TemporaryChannelFailure { update: None };
						// Encrypt the error back to the source unless the
						// payment was generated locally.
						let (reason, local_failure) = match &obfuscator {
							Some(obfuscator) => match obfuscator.encrypt_first_hop(&failure) {
								Ok(reason) => (reason, false),
								Err(err) => {
									log_error!(self.logger, "unable to obfuscate error: {}", err);
									return Ok(());
								},
							},
							None => (OpaqueReason(failure.encode()), true),
						};

						let fail_packet = HtlcPacket {
							incoming_chan_id,
							incoming_htlc_id,
							outgoing_chan_id: 0,
							outgoing_htlc_id: 0,
							amount_msat: add.amount_msat,
							htlc: HtlcMessage::Fail(UpdateFailHTLC {
								channel_id: [0; 32],
								htlc_id: 0,
								reason,
							}),
							obfuscator: None,
							is_routed: true,
							local_failure,
						};
						let switch = self.switch.clone();
						let logger = self.logger.clone();
						tokio::spawn(async move {
							if let Err(err) = switch.forward(fail_packet) {
								log_error!(logger, "unable to forward failure packet: {}", err);
							}
						});
						return Ok(());
					},
					Ok(index) => {
						log_trace!(self.logger, "received downstream htlc: payment_hash={}, local_log_index={}, batch_size={}",
							log_bytes!(add.payment_hash.0), index, self.batch_counter + 1);

						// Remember the path so the settle/fail can be
						// routed backwards later; registered before the
						// add ever hits the wire.
						self.switch.add_circuit(PaymentCircuit {
							payment_hash: add.payment_hash,
							incoming_chan_id,
							incoming_htlc_id,
							outgoing_chan_id: self.channel.short_channel_id(),
							outgoing_htlc_id: index,
							error_encrypter: obfuscator,
						});

						add.htlc_id = index;
						if let Err(err) = self.peer.send_message(Message::UpdateAddHTLC(add)) {
							log_warn!(self.logger, "unable to send htlc add to peer: {}", err);
						}
					},
				}
			},
			// An HTLC we forwarded settled somewhere downstream; mirror the
			// settle into our state machine and relay it to the peer.
			HtlcMessage::Settle(mut settle) => {
				if let Err(err) = self.channel.settle_htlc(settle.payment_preimage, incoming_htlc_id) {
					return Err(format!("unable to settle incoming HTLC: {}", err));
				}
				settle.channel_id = self.channel.channel_id();
				settle.htlc_id = incoming_htlc_id;
				if let Err(err) = self.peer.send_message(Message::UpdateFulfillHTLC(settle)) {
					log_warn!(self.logger, "unable to send settle to peer: {}", err);
				}
				is_settle = true;
			},
			// A cancellation arrived from downstream; remove the HTLC from
			// our state machine and relay it to the peer that created it.
			HtlcMessage::Fail(mut fail) => {
				if let Err(err) = self.channel.fail_htlc(incoming_htlc_id, fail.reason.clone()) {
					log_error!(self.logger, "unable to cancel HTLC: {}", err);
					return Ok(());
				}
				fail.channel_id = self.channel.channel_id();
				fail.htlc_id = incoming_htlc_id;
				if let Err(err) = self.peer.send_message(Message::UpdateFailHTLC(fail)) {
					log_warn!(self.logger, "unable to send fail to peer: {}", err);
				}
				is_settle = true;
			},
		}

		self.batch_counter += 1;

		// If this newly added update exceeds the minimum batch size for
		// adds, or this is a settle request, initiate an update.
		if self.batch_counter >= 10 || is_settle {
			self.update_commit_tx().map_err(|err| format!("unable to update commitment: {}", err))?;
		}
		Ok(())
	}

	/// Processes a commitment-protocol wire message from the peer.
	async fn handle_upstream_msg(&mut self, msg: Message) -> Result<(), String> {
		match msg {
			Message::UpdateAddHTLC(msg) => {
				// Nothing to act on yet; the HTLC only becomes actionable
				// once it is locked in by a revocation round.
				let index = self.channel.receive_htlc(&msg)
					.map_err(|err| format!("unable to handle upstream add HTLC: {}", err))?;
				log_trace!(self.logger, "receive upstream htlc with payment hash({}), assigning index: {}",
					log_bytes!(msg.payment_hash.0), index);
			},
			Message::UpdateFulfillHTLC(msg) => {
				self.channel.receive_htlc_settle(msg.payment_preimage, msg.htlc_id)
					.map_err(|err| format!("unable to handle upstream settle HTLC: {}", err))?;

				// Hand the freshly learned preimage to the global cache so
				// any contested contracts watched on-chain can be swept.
				let preimage_cache = self.preimage_cache.clone();
				let logger = self.logger.clone();
				let preimage = msg.payment_preimage;
				tokio::spawn(async move {
					if preimage_cache.add_preimage(preimage).is_err() {
						log_error!(logger, "unable to add preimage={} to cache", log_bytes!(preimage.0));
					}
				});
			},
			Message::UpdateFailMalformedHTLC(msg) => {
				// The remote side couldn't parse an onion we relayed;
				// translate the malformed failure into an ordinary opaque
				// failure and feed it through the usual path.
				let failure = match FailureMessage::from_malformed_code(msg.failure_code, msg.sha256_of_onion) {
					Some(failure) => failure,
					None => {
						log_error!(self.logger, "unknown failure code: {}", msg.failure_code);
						FailureMessage::TemporaryChannelFailure { update: None }
					},
				};
				self.channel.receive_fail_htlc(msg.htlc_id, OpaqueReason(failure.encode()))
					.map_err(|err| format!("unable to handle upstream fail HTLC: {}", err))?;
			},
			Message::UpdateFailHTLC(msg) => {
				self.channel.receive_fail_htlc(msg.htlc_id, msg.reason)
					.map_err(|err| format!("unable to handle upstream fail HTLC: {}", err))?;
			},
			Message::CommitmentSigned(msg) => {
				if let Err(err) = self.channel.receive_new_commitment(msg.signature, msg.htlc_signatures) {
					// A provably bad signature deserves an explicit error
					// message before we pull the plug.
					if let ChannelError::InvalidCommitSig(ref desc) = err {
						let _ = self.peer.send_message(Message::Error(ErrorMessage {
							channel_id: self.channel.channel_id(),
							data: desc.clone(),
						}));
					}
					return Err(format!("unable to accept new commitment: {}", err));
				}

				// Having accepted the new state, immediately revoke our
				// prior commitment; no other message may interleave.
				let (revocation, current_htlcs) = match self.channel.revoke_current_commitment() {
					Ok(res) => res,
					Err(err) => {
						log_error!(self.logger, "unable to revoke commitment: {}", err);
						return Ok(());
					},
				};
				if let Err(err) = self.peer.send_message(Message::RevokeAndACK(revocation)) {
					log_warn!(self.logger, "unable to send revocation to peer: {}", err);
				}

				// Our commitment just changed; let the chain arbitrator
				// know which HTLCs are now live on it.
				if !self.publish_htlc_updates(current_htlcs).await {
					return Ok(());
				}

				// Restart the log-commit timer so the main loop wakes up to
				// check whether we still owe a signature.
				self.log_commit_sleep.as_mut().reset(time::Instant::now() + LOG_COMMIT_INTERVAL);
				self.log_commit_armed = true;

				// If both chains are fully synced from our PoV there's no
				// signature owed; otherwise the remote party initiated this
				// transition and we reply with our own.
				if self.channel.fully_synced() {
					return Ok(());
				}
				self.update_commit_tx().map_err(|err| format!("unable to update commitment: {}", err))?;
			},
			Message::RevokeAndACK(msg) => {
				// A valid revocation moves the remote chain forward and
				// tells us which updates are now locked into both sides.
				let descriptors = self.channel.receive_revocation(&msg)
					.map_err(|err| format!("unable to accept revocation: {}", err))?;

				let packets = self.process_locked_in_htlcs(descriptors)?;
				let switch = self.switch.clone();
				let logger = self.logger.clone();
				let short_channel_id = self.channel.short_channel_id();
				tokio::spawn(async move {
					log_debug!(logger, "ChannelLink({}) forwarding {} HTLCs", short_channel_id, packets.len());
					for packet in packets {
						if let Err(err) = switch.forward(packet) {
							log_error!(logger, "channel link({}): unhandled error while forwarding htlc packet over htlc switch: {}",
								short_channel_id, err);
						}
					}
				});
			},
			Message::UpdateFee(msg) => {
				// Acceptance policy (the initiator never takes a fee update
				// from the peer) is enforced by the machine itself.
				self.channel.receive_update_fee(msg.feerate_per_kw as u64)
					.map_err(|err| format!("error receiving fee update: {}", err))?;
			},
			other @ (Message::ChannelReestablish(_) | Message::FundingLocked(_)) => {
				log_warn!(self.logger, "ignoring {} message received outside of sync", other.name());
			},
			Message::Error(msg) => {
				log_warn!(self.logger, "received error message from peer: {}", msg.data);
			},
		}
		Ok(())
	}

	/// Applies a control-channel request.
	fn handle_control(&mut self, cmd: LinkControl) {
		match cmd {
			LinkControl::UpdatePolicy { policy, done } => {
				// Only adopt sub-policies that are actually initialized, so
				// a zeroed field never clobbers a valid value.
				if policy.base_fee_msat != 0 {
					self.policy.base_fee_msat = policy.base_fee_msat;
				}
				if policy.fee_rate_millionths != 0 {
					self.policy.fee_rate_millionths = policy.fee_rate_millionths;
				}
				if policy.time_lock_delta != 0 {
					self.policy.time_lock_delta = policy.time_lock_delta;
				}
				if policy.min_htlc_msat != 0 {
					self.policy.min_htlc_msat = policy.min_htlc_msat;
				}
				let _ = done.send(());
			},
			LinkControl::GetBandwidth { resp } => {
				let bandwidth = self.channel.available_balance_msat()
					.saturating_sub(self.overflow_queue.total_htlc_amount());
				let _ = resp.send(bandwidth);
			},
		}
	}

	/// Serially examines each update which has just been locked in, i.e.
	/// fully committed on both sides, and acts on it: settles and failures
	/// of HTLCs we forwarded travel backwards, while incoming adds are
	/// settled here, forwarded onwards, or rejected against the policy.
	fn process_locked_in_htlcs(&mut self, descriptors: Vec<PaymentDescriptor>) -> Result<Vec<HtlcPacket>, String> {
		let mut need_update = false;
		let mut packets_to_forward = Vec::new();

		for descriptor in descriptors {
			match descriptor {
				PaymentDescriptor::Settle { parent_index, amount_msat, payment_preimage } => {
					packets_to_forward.push(HtlcPacket {
						incoming_chan_id: 0,
						incoming_htlc_id: 0,
						outgoing_chan_id: self.channel.short_channel_id(),
						outgoing_htlc_id: parent_index,
						amount_msat,
						htlc: HtlcMessage::Settle(UpdateFulfillHTLC {
							channel_id: [0; 32],
							htlc_id: 0,
							payment_preimage,
						}),
						obfuscator: None,
						is_routed: false,
						local_failure: false,
					});
					// A commitment slot just opened up.
					self.overflow_queue.signal_free_slot();
				},
				PaymentDescriptor::Fail { parent_index, amount_msat, reason } => {
					packets_to_forward.push(HtlcPacket {
						incoming_chan_id: 0,
						incoming_htlc_id: 0,
						outgoing_chan_id: self.channel.short_channel_id(),
						outgoing_htlc_id: parent_index,
						amount_msat,
						htlc: HtlcMessage::Fail(UpdateFailHTLC {
							channel_id: [0; 32],
							htlc_id: 0,
							reason,
						}),
						obfuscator: None,
						is_routed: false,
						local_failure: false,
					});
					self.overflow_queue.signal_free_slot();
				},
				PaymentDescriptor::Add { htlc_index, amount_msat, payment_hash, cltv_expiry, onion_routing_packet } => {
					if self.process_locked_in_add(htlc_index, amount_msat, payment_hash, cltv_expiry,
							&onion_routing_packet, &mut packets_to_forward)? {
						need_update = true;
					}
				},
			}
		}

		if need_update {
			// With the settle/cancel updates added to both HTLC logs,
			// initiate a state transition.
			self.update_commit_tx().map_err(|err| format!("unable to update commitment: {}", err))?;
		}

		Ok(packets_to_forward)
	}

	/// Acts on one locked-in incoming add: settle it if we're the exit hop,
	/// queue it for the switch if it checks out for forwarding, or fail it.
	/// Returns whether a commitment update became necessary.
	fn process_locked_in_add(&mut self, htlc_index: u64, amount_msat: u64, payment_hash: PaymentHash,
		cltv_expiry: u32, onion_routing_packet: &OnionPacket, packets_to_forward: &mut Vec<HtlcPacket>)
		-> Result<bool, String>
	{
		// Recover the failure obfuscator first so any rejection below can be
		// encrypted towards the sender.
		let obfuscator = match self.onion_decoder.decode_error_encrypter(onion_routing_packet) {
			Ok(obfuscator) => {
				let obfuscator: Arc<dyn ErrorEncrypter> = Arc::from(obfuscator);
				obfuscator
			},
			Err(code) => {
				log_error!(self.logger, "unable to decode onion obfuscator: {}", code);
				self.send_malformed_htlc_error(htlc_index, code, onion_routing_packet);
				return Ok(true);
			},
		};

		// Decode the routing layer, with the payment hash as associated
		// data: a replayed packet is thereby forced to reuse its payment
		// hash, forfeiting the payment.
		let hop_iterator = match self.onion_decoder.decode_hop_iterator(onion_routing_packet, &payment_hash) {
			Ok(hop_iterator) => hop_iterator,
			Err(code) => {
				log_error!(self.logger, "unable to decode onion hop iterator: {}", code);
				self.send_malformed_htlc_error(htlc_index, code, onion_routing_packet);
				return Ok(true);
			},
		};

		let height_now = self.best_height;
		let fwd_info = hop_iterator.forwarding_instructions();
		match fwd_info.next_hop {
			// We're the designated payment destination.
			NextHop::Exit => {
				if self.debug_htlc && self.hodl_htlc {
					log_warn!(self.logger, "hodl HTLC mode enabled, will not attempt to settle HTLC with sender");
					return Ok(false);
				}

				// Too close to expiry: if the extending party went to chain
				// now we could no longer claim the HTLC safely.
				if cltv_expiry.saturating_sub(EXPIRY_GRACE_DELTA) <= height_now {
					log_error!(self.logger, "htlc({}) has an expiry that's too soon: expiry={}, best_height={}",
						log_bytes!(payment_hash.0), cltv_expiry, height_now);
					self.send_htlc_error(htlc_index, FailureMessage::FinalIncorrectCltvExpiry { cltv_expiry: 0 }, &*obfuscator);
					return Ok(true);
				}

				let invoice = match self.registry.lookup_invoice(&payment_hash) {
					Ok(invoice) => invoice,
					Err(err) => {
						log_error!(self.logger, "unable to query invoice registry: {}", err);
						self.send_htlc_error(htlc_index, FailureMessage::UnknownPaymentHash, &*obfuscator);
						return Ok(true);
					},
				};

				// An invoice is never paid twice.
				if invoice.settled {
					log_warn!(self.logger, "rejecting duplicate payment for hash={}", log_bytes!(payment_hash.0));
					self.send_htlc_error(htlc_index, FailureMessage::UnknownPaymentHash, &*obfuscator);
					return Ok(true);
				}

				// A zero-value invoice lets the payer choose the amount, so
				// the amount checks only apply to valued invoices.
				if !self.debug_htlc && invoice.value_msat > 0 && amount_msat < invoice.value_msat {
					log_error!(self.logger, "rejecting htlc due to incorrect amount: expected {}, received {}",
						invoice.value_msat, amount_msat);
					self.send_htlc_error(htlc_index, FailureMessage::IncorrectPaymentAmount, &*obfuscator);
					return Ok(true);
				}
				if !self.debug_htlc && invoice.value_msat > 0 && fwd_info.amount_to_forward != invoice.value_msat {
					log_error!(self.logger, "onion payload of incoming htlc({}) has incorrect value: expected {}, got {}",
						log_bytes!(payment_hash.0), invoice.value_msat, fwd_info.amount_to_forward);
					self.send_htlc_error(htlc_index, FailureMessage::IncorrectPaymentAmount, &*obfuscator);
					return Ok(true);
				}

				// The sender must also have computed our final time-lock
				// correctly, and the HTLC must actually carry it.
				if !self.debug_htlc {
					let expected_height = height_now + self.policy.time_lock_delta;
					if fwd_info.outgoing_cltv < expected_height {
						log_error!(self.logger, "onion payload of incoming htlc({}) has incorrect time-lock: expected {}, got {}",
							log_bytes!(payment_hash.0), expected_height, fwd_info.outgoing_cltv);
						self.send_htlc_error(htlc_index,
							FailureMessage::FinalIncorrectCltvExpiry { cltv_expiry: fwd_info.outgoing_cltv }, &*obfuscator);
						return Ok(true);
					}
					if cltv_expiry != fwd_info.outgoing_cltv {
						log_error!(self.logger, "htlc({}) has incorrect time-lock: expected {}, got {}",
							log_bytes!(payment_hash.0), cltv_expiry, fwd_info.outgoing_cltv);
						self.send_htlc_error(htlc_index,
							FailureMessage::FinalIncorrectCltvExpiry { cltv_expiry: fwd_info.outgoing_cltv }, &*obfuscator);
						return Ok(true);
					}
				}

				self.channel.settle_htlc(invoice.payment_preimage, htlc_index)
					.map_err(|err| format!("unable to settle htlc: {}", err))?;
				self.registry.settle_invoice(&payment_hash)
					.map_err(|err| format!("unable to settle invoice: {}", err))?;

				if let Err(err) = self.peer.send_message(Message::UpdateFulfillHTLC(UpdateFulfillHTLC {
					channel_id: self.channel.channel_id(),
					htlc_id: htlc_index,
					payment_preimage: invoice.payment_preimage,
				})) {
					log_warn!(self.logger, "unable to send settle to peer: {}", err);
				}
				Ok(true)
			},

			// There are additional channels left within the route; verify
			// our forwarding constraints before passing the HTLC onwards.
			NextHop::Channel(outgoing_chan_id) => {
				let time_delta = self.policy.time_lock_delta;

				// Avoid forwarding an HTLC that would expire in the near
				// future on the outgoing leg.
				if cltv_expiry.saturating_sub(time_delta) <= height_now {
					log_error!(self.logger, "htlc({}) has an expiry that's too soon: outgoing_expiry={}, best_height={}",
						log_bytes!(payment_hash.0), cltv_expiry.saturating_sub(time_delta), height_now);
					let failure = match (self.get_last_channel_update)() {
						Some(update) => FailureMessage::ExpiryTooSoon { update },
						None => FailureMessage::TemporaryChannelFailure { update: None },
					};
					self.send_htlc_error(htlc_index, failure, &*obfuscator);
					return Ok(true);
				}

				if amount_msat < self.policy.min_htlc_msat {
					log_error!(self.logger, "incoming htlc({}) is too small: min_htlc={}, htlc_value={}",
						log_bytes!(payment_hash.0), self.policy.min_htlc_msat, amount_msat);
					// Attach our latest routing policy so the sender
					// obtains up-to-date data.
					let failure = match (self.get_last_channel_update)() {
						Some(update) => FailureMessage::AmountBelowMinimum { htlc_msat: amount_msat, update },
						None => FailureMessage::TemporaryChannelFailure { update: None },
					};
					self.send_htlc_error(htlc_index, failure, &*obfuscator);
					return Ok(true);
				}

				// The incoming amount minus our fee must cover what the
				// onion instructs us to forward; anything less means stale
				// or tampered forwarding data.
				let expected_fee = expected_fee(self.policy, fwd_info.amount_to_forward);
				if amount_msat.saturating_sub(expected_fee) < fwd_info.amount_to_forward {
					log_error!(self.logger, "incoming htlc({}) has insufficient fee: expected {}, got {}",
						log_bytes!(payment_hash.0), expected_fee,
						amount_msat as i64 - fwd_info.amount_to_forward as i64);
					let failure = match (self.get_last_channel_update)() {
						Some(update) => FailureMessage::FeeInsufficient { htlc_msat: amount_msat, update },
						None => FailureMessage::TemporaryChannelFailure { update: None },
					};
					self.send_htlc_error(htlc_index, failure, &*obfuscator);
					return Ok(true);
				}

				// The incoming time-lock minus our delta must cover the
				// outgoing time-lock the onion asks for.
				if cltv_expiry.saturating_sub(time_delta) < fwd_info.outgoing_cltv {
					log_error!(self.logger, "incoming htlc({}) has incorrect time-lock value: expected at least {} block delta, got {} block delta",
						log_bytes!(payment_hash.0), time_delta, cltv_expiry.saturating_sub(fwd_info.outgoing_cltv));
					let update = (self.get_last_channel_update)()
						.ok_or_else(|| "unable to create channel update while handling the error".to_string())?;
					self.send_htlc_error(htlc_index, FailureMessage::IncorrectCltvExpiry { cltv_expiry, update }, &*obfuscator);
					return Ok(true);
				}

				// All forwarding constraints met; build the outgoing add
				// with the onion for the next hop.
				let onion = match hop_iterator.encode_next_hop() {
					Ok(onion) => onion,
					Err(err) => {
						log_error!(self.logger, "unable to encode the remaining route: {}", err);
						self.send_htlc_error(htlc_index, FailureMessage::TemporaryChannelFailure { update: None }, &*obfuscator);
						return Ok(true);
					},
				};
				let add = UpdateAddHTLC {
					channel_id: [0; 32],
					htlc_id: 0,
					amount_msat: fwd_info.amount_to_forward,
					payment_hash,
					cltv_expiry: fwd_info.outgoing_cltv,
					onion_routing_packet: onion,
				};
				packets_to_forward.push(HtlcPacket {
					incoming_chan_id: self.channel.short_channel_id(),
					incoming_htlc_id: htlc_index,
					outgoing_chan_id,
					outgoing_htlc_id: 0,
					amount_msat: add.amount_msat,
					htlc: HtlcMessage::Add(add),
					obfuscator: Some(obfuscator),
					is_routed: false,
					local_failure: false,
				});
				Ok(false)
			},
		}
	}

	/// Signs and sends a commitment covering every update processed so far.
	/// An exhausted revocation window is not an error; the sign is retried
	/// once the counterparty's next revocation opens the window again.
	fn update_commit_tx(&mut self) -> Result<(), ChannelError> {
		let (signature, htlc_signatures) = match self.channel.sign_next_commitment() {
			Err(ChannelError::NoRevocationWindow) => {
				log_trace!(self.logger, "revocation window exhausted, unable to send {}", self.batch_counter);
				return Ok(());
			},
			Err(err) => return Err(err),
			Ok(sigs) => sigs,
		};

		if let Err(err) = self.peer.send_message(Message::CommitmentSigned(CommitmentSigned {
			channel_id: self.channel.channel_id(),
			signature,
			htlc_signatures,
		})) {
			log_warn!(self.logger, "unable to send commitment to peer: {}", err);
		}

		// We just initiated a state transition; the log-commit timer only
		// tracks updates we owe, so disarm it and clear the batch.
		self.log_commit_armed = false;
		self.batch_counter = 0;
		Ok(())
	}

	/// Publishes the channel's active HTLC set to the chain arbitrator.
	/// Returns false when the link is shutting down instead.
	async fn publish_htlc_updates(&mut self, htlcs: Vec<Htlc>) -> bool {
		tokio::select! {
			res = self.htlc_updates_tx.send(htlcs) => {
				// An absent subscriber just means nobody cares anymore.
				let _ = res;
				true
			},
			_ = self.quit_rx.wait_for(|quit| *quit) => false,
		}
	}

	/// Cancels an HTLC and sends the encrypted cancellation back to the peer
	/// the HTLC was received from.
	fn send_htlc_error(&mut self, htlc_index: u64, failure: FailureMessage, obfuscator: &dyn ErrorEncrypter) {
		let reason = match obfuscator.encrypt_first_hop(&failure) {
			Ok(reason) => reason,
			Err(err) => {
				log_error!(self.logger, "unable to obfuscate error: {}", err);
				return;
			},
		};

		if let Err(err) = self.channel.fail_htlc(htlc_index, reason.clone()) {
			log_error!(self.logger, "unable to cancel htlc: {}", err);
			return;
		}

		if let Err(err) = self.peer.send_message(Message::UpdateFailHTLC(UpdateFailHTLC {
			channel_id: self.channel.channel_id(),
			htlc_id: htlc_index,
			reason,
		})) {
			log_warn!(self.logger, "unable to send fail to peer: {}", err);
		}
	}

	/// Rejects an HTLC whose onion we could not read at all; the failure
	/// travels unencrypted since no shared secret could be derived.
	fn send_malformed_htlc_error(&mut self, htlc_index: u64, code: FailCode, onion_routing_packet: &OnionPacket) {
		let sha256_of_onion = sha256::Hash::hash(onion_routing_packet.as_bytes()).to_byte_array();
		if let Err(err) = self.channel.malformed_fail_htlc(htlc_index, code.wire_code(), sha256_of_onion) {
			log_error!(self.logger, "unable to cancel htlc: {}", err);
			return;
		}

		if let Err(err) = self.peer.send_message(Message::UpdateFailMalformedHTLC(UpdateFailMalformedHTLC {
			channel_id: self.channel.channel_id(),
			htlc_id: htlc_index,
			sha256_of_onion,
			failure_code: code.wire_code(),
		})) {
			log_warn!(self.logger, "unable to send malformed fail to peer: {}", err);
		}
	}

	/// Encapsulates the action necessary for a proper teardown on a fatal
	/// error: log the reason and disconnect the peer with it.
	fn fail(&self, reason: &str) {
		log_error!(self.logger, "ChannelLink({}): {}", self.channel.short_channel_id(), reason);
		self.peer.disconnect(reason);
	}
}
