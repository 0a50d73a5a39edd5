// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::secp256k1::ecdsa::Signature;

use crate::chain::chaininterface::{FeeEstimator, PreimageCache};
use crate::ln::{PaymentHash, PaymentPreimage};
use crate::ln::channel::{ChannelError, ChannelMachine, ChannelSnapshot, Htlc, PaymentDescriptor};
use crate::ln::invoices::{Invoice, InvoiceRegistry, RegistryError};
use crate::ln::msgs::{ChannelReestablish, FailureMessage, Message, OnionPacket, OpaqueReason, RevokeAndACK, UpdateAddHTLC, ONION_PACKET_SIZE};
use crate::ln::onion_utils::{ErrorEncrypter, FailCode, ForwardingInfo, HopIterator, NextHop, OnionDecoder, OnionEncodeError};
use crate::ln::peer::{PeerError, PeerTransport};
use crate::ln::switch::{HtlcPacket, PaymentCircuit, Switch, SwitchError};
use crate::util::logger::{Logger, Record};

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

pub fn pubkey(byte: u8) -> PublicKey {
	let secp_ctx = Secp256k1::new();
	PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[byte; 32]).unwrap())
}

pub fn sig() -> Signature {
	Signature::from_compact(&[1; 64]).unwrap()
}

pub struct TestLogger {
	pub lines: Mutex<Vec<String>>,
}

impl TestLogger {
	pub fn new() -> TestLogger {
		TestLogger { lines: Mutex::new(Vec::new()) }
	}
}

impl Logger for TestLogger {
	fn log(&self, record: &Record) {
		let line = format!("{:<5} [{} : {}] {}", record.level, record.module_path, record.line, record.args);
		println!("{}", line);
		self.lines.lock().unwrap().push(line);
	}
}

pub struct TestFeeEstimator {
	pub sat_per_weight: Mutex<Option<u64>>,
	pub calls: AtomicUsize,
}

impl TestFeeEstimator {
	pub fn new(sat_per_weight: Option<u64>) -> TestFeeEstimator {
		TestFeeEstimator { sat_per_weight: Mutex::new(sat_per_weight), calls: AtomicUsize::new(0) }
	}
}

impl FeeEstimator for TestFeeEstimator {
	fn estimate_fee_per_weight(&self, _confirmation_target: u32) -> Option<u64> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		*self.sat_per_weight.lock().unwrap()
	}
}

pub struct TestPreimageCache {
	pub preimages: Mutex<HashMap<PaymentHash, PaymentPreimage>>,
	pub added: Mutex<Vec<PaymentPreimage>>,
}

impl TestPreimageCache {
	pub fn new() -> TestPreimageCache {
		TestPreimageCache { preimages: Mutex::new(HashMap::new()), added: Mutex::new(Vec::new()) }
	}

	pub fn insert(&self, payment_hash: PaymentHash, preimage: PaymentPreimage) {
		self.preimages.lock().unwrap().insert(payment_hash, preimage);
	}
}

impl PreimageCache for TestPreimageCache {
	fn lookup_preimage(&self, payment_hash: &PaymentHash) -> Option<PaymentPreimage> {
		self.preimages.lock().unwrap().get(payment_hash).copied()
	}

	fn add_preimage(&self, preimage: PaymentPreimage) -> Result<(), ()> {
		self.added.lock().unwrap().push(preimage);
		Ok(())
	}
}

pub struct TestInvoiceRegistry {
	pub invoices: Mutex<HashMap<PaymentHash, Invoice>>,
	pub settled: Mutex<Vec<PaymentHash>>,
}

impl TestInvoiceRegistry {
	pub fn new() -> TestInvoiceRegistry {
		TestInvoiceRegistry { invoices: Mutex::new(HashMap::new()), settled: Mutex::new(Vec::new()) }
	}

	pub fn add_invoice(&self, payment_hash: PaymentHash, invoice: Invoice) {
		self.invoices.lock().unwrap().insert(payment_hash, invoice);
	}
}

impl InvoiceRegistry for TestInvoiceRegistry {
	fn lookup_invoice(&self, payment_hash: &PaymentHash) -> Result<Invoice, RegistryError> {
		self.invoices.lock().unwrap().get(payment_hash).cloned().ok_or(RegistryError::UnknownPaymentHash)
	}

	fn settle_invoice(&self, payment_hash: &PaymentHash) -> Result<(), RegistryError> {
		let mut invoices = self.invoices.lock().unwrap();
		let invoice = invoices.get_mut(payment_hash).ok_or(RegistryError::UnknownPaymentHash)?;
		invoice.settled = true;
		self.settled.lock().unwrap().push(*payment_hash);
		Ok(())
	}
}

pub struct TestPeer {
	pub msgs: Mutex<Vec<Message>>,
	pub disconnects: Mutex<Vec<String>>,
	pub wiped: Mutex<Vec<[u8; 32]>>,
	node_id: PublicKey,
}

impl TestPeer {
	pub fn new() -> TestPeer {
		TestPeer {
			msgs: Mutex::new(Vec::new()),
			disconnects: Mutex::new(Vec::new()),
			wiped: Mutex::new(Vec::new()),
			node_id: pubkey(13),
		}
	}

	pub fn sent(&self) -> Vec<Message> {
		self.msgs.lock().unwrap().clone()
	}

	pub fn sent_count<F: Fn(&Message) -> bool>(&self, pred: F) -> usize {
		self.msgs.lock().unwrap().iter().filter(|msg| pred(msg)).count()
	}
}

impl PeerTransport for TestPeer {
	fn send_message(&self, msg: Message) -> Result<(), PeerError> {
		self.msgs.lock().unwrap().push(msg);
		Ok(())
	}

	fn disconnect(&self, reason: &str) {
		self.disconnects.lock().unwrap().push(reason.to_string());
	}

	fn wipe_channel(&self, channel_id: &[u8; 32]) -> Result<(), PeerError> {
		self.wiped.lock().unwrap().push(*channel_id);
		Ok(())
	}

	fn node_id(&self) -> PublicKey {
		self.node_id
	}
}

pub struct TestSwitch {
	pub forwarded: Mutex<Vec<HtlcPacket>>,
	/// Each registered circuit, along with how many adds had already been
	/// sent to the peer at registration time (when a peer is attached).
	pub circuits: Mutex<Vec<(PaymentCircuit, usize)>>,
	pub peer: Mutex<Option<Arc<TestPeer>>>,
}

impl TestSwitch {
	pub fn new() -> TestSwitch {
		TestSwitch {
			forwarded: Mutex::new(Vec::new()),
			circuits: Mutex::new(Vec::new()),
			peer: Mutex::new(None),
		}
	}

	pub fn watch_peer(&self, peer: Arc<TestPeer>) {
		*self.peer.lock().unwrap() = Some(peer);
	}
}

impl Switch for TestSwitch {
	fn forward(&self, packet: HtlcPacket) -> Result<(), SwitchError> {
		self.forwarded.lock().unwrap().push(packet);
		Ok(())
	}

	fn add_circuit(&self, circuit: PaymentCircuit) {
		let adds_already_sent = match &*self.peer.lock().unwrap() {
			Some(peer) => peer.sent_count(|msg| matches!(msg, Message::UpdateAddHTLC(_))),
			None => 0,
		};
		self.circuits.lock().unwrap().push((circuit, adds_already_sent));
	}
}

// Test onions are tiny structured payloads in the first packet bytes:
// byte 0 selects the decode outcome (see below), bytes 1..9 carry the next
// hop's short channel id (0 = exit hop), bytes 9..17 the amount to forward
// and bytes 17..21 the outgoing cltv.
pub const ONION_OK: u8 = 1;
pub const ONION_BAD_OBFUSCATOR: u8 = 0;
pub const ONION_BAD_ROUTE: u8 = 2;

pub fn build_onion(outcome: u8, next_hop_scid: u64, amount_to_forward: u64, outgoing_cltv: u32) -> OnionPacket {
	let mut bytes = [0; ONION_PACKET_SIZE];
	bytes[0] = outcome;
	bytes[1..9].copy_from_slice(&next_hop_scid.to_be_bytes());
	bytes[9..17].copy_from_slice(&amount_to_forward.to_be_bytes());
	bytes[17..21].copy_from_slice(&outgoing_cltv.to_be_bytes());
	OnionPacket(Box::new(bytes))
}

/// The marker byte `encode_next_hop` stamps into forwarded onions.
pub const NEXT_HOP_ONION_MARKER: u8 = 0xee;

pub struct TestHopIterator {
	info: ForwardingInfo,
}

impl HopIterator for TestHopIterator {
	fn forwarding_instructions(&self) -> ForwardingInfo {
		self.info
	}

	fn encode_next_hop(&self) -> Result<OnionPacket, OnionEncodeError> {
		let mut bytes = [0; ONION_PACKET_SIZE];
		bytes[0] = NEXT_HOP_ONION_MARKER;
		Ok(OnionPacket(Box::new(bytes)))
	}
}

pub struct TestErrorEncrypter {
	failures: Arc<Mutex<Vec<FailureMessage>>>,
}

impl ErrorEncrypter for TestErrorEncrypter {
	fn encrypt_first_hop(&self, failure: &FailureMessage) -> Result<OpaqueReason, OnionEncodeError> {
		self.failures.lock().unwrap().push(failure.clone());
		let mut reason = vec![0xaa];
		reason.extend_from_slice(&failure.encode());
		Ok(OpaqueReason(reason))
	}
}

pub struct TestOnionDecoder {
	/// Every failure any derived encrypter was asked to wrap.
	pub encrypted_failures: Arc<Mutex<Vec<FailureMessage>>>,
}

impl TestOnionDecoder {
	pub fn new() -> TestOnionDecoder {
		TestOnionDecoder { encrypted_failures: Arc::new(Mutex::new(Vec::new())) }
	}
}

impl OnionDecoder for TestOnionDecoder {
	fn decode_hop_iterator(&self, onion: &OnionPacket, _payment_hash: &PaymentHash) -> Result<Box<dyn HopIterator>, FailCode> {
		let bytes = onion.as_bytes();
		if bytes[0] != ONION_OK {
			return Err(FailCode::InvalidOnionHmac);
		}
		let scid = u64::from_be_bytes(bytes[1..9].try_into().unwrap());
		let amount_to_forward = u64::from_be_bytes(bytes[9..17].try_into().unwrap());
		let outgoing_cltv = u32::from_be_bytes(bytes[17..21].try_into().unwrap());
		let next_hop = if scid == 0 { NextHop::Exit } else { NextHop::Channel(scid) };
		Ok(Box::new(TestHopIterator {
			info: ForwardingInfo { next_hop, amount_to_forward, outgoing_cltv },
		}))
	}

	fn decode_error_encrypter(&self, onion: &OnionPacket) -> Result<Box<dyn ErrorEncrypter>, FailCode> {
		if onion.as_bytes()[0] == ONION_BAD_OBFUSCATOR {
			return Err(FailCode::InvalidOnionVersion);
		}
		Ok(Box::new(TestErrorEncrypter { failures: Arc::clone(&self.encrypted_failures) }))
	}
}

struct MachineState {
	max_pending_adds: usize,
	pending_adds: usize,
	next_local_index: u64,
	next_remote_index: u64,
	fully_synced: bool,
	initiator: bool,
	pending_funding: bool,
	invalid_commit_sig: bool,
	no_window: bool,
	stopped: bool,
	available_balance_msat: u64,
	commit_feerate_per_kw: u64,
	remote_next_revocation: Option<PublicKey>,
	active_htlcs: Vec<Htlc>,
	locked_in: VecDeque<Vec<PaymentDescriptor>>,
	resend_msgs: Vec<Message>,
	reestablish: ChannelReestablish,
	snapshot: ChannelSnapshot,

	settles: Vec<(PaymentPreimage, u64)>,
	fails: Vec<(u64, OpaqueReason)>,
	malformed_fails: Vec<(u64, u16, [u8; 32])>,
	received_adds: Vec<UpdateAddHTLC>,
	received_settles: Vec<(PaymentPreimage, u64)>,
	received_fails: Vec<(u64, OpaqueReason)>,
	fee_updates: Vec<u64>,
	received_fee_updates: Vec<u64>,
	sign_count: usize,
	revoke_count: usize,
}

/// A scriptable stand-in for the commitment engine. Adds succeed until the
/// configured capacity is reached, revocations hand out whatever descriptor
/// batches the test queued, and every mutation is recorded for inspection.
pub struct TestChannelMachine {
	short_channel_id: u64,
	channel_id: [u8; 32],
	state: Mutex<MachineState>,
}

impl TestChannelMachine {
	pub fn new(short_channel_id: u64) -> TestChannelMachine {
		let mut channel_id = [0; 32];
		channel_id[..8].copy_from_slice(&short_channel_id.to_be_bytes());
		TestChannelMachine {
			short_channel_id,
			channel_id,
			state: Mutex::new(MachineState {
				max_pending_adds: usize::max_value(),
				pending_adds: 0,
				next_local_index: 0,
				next_remote_index: 0,
				fully_synced: true,
				initiator: false,
				pending_funding: false,
				invalid_commit_sig: false,
				no_window: false,
				stopped: false,
				available_balance_msat: 10_000_000,
				commit_feerate_per_kw: 50_000,
				remote_next_revocation: Some(pubkey(7)),
				active_htlcs: Vec::new(),
				locked_in: VecDeque::new(),
				resend_msgs: Vec::new(),
				reestablish: ChannelReestablish {
					channel_id,
					next_local_commitment_number: 2,
					next_remote_commitment_number: 2,
					your_last_per_commitment_secret: None,
					my_current_per_commitment_point: None,
				},
				snapshot: ChannelSnapshot { commit_height: 1, total_msat_sent: 0, total_msat_received: 0 },

				settles: Vec::new(),
				fails: Vec::new(),
				malformed_fails: Vec::new(),
				received_adds: Vec::new(),
				received_settles: Vec::new(),
				received_fails: Vec::new(),
				fee_updates: Vec::new(),
				received_fee_updates: Vec::new(),
				sign_count: 0,
				revoke_count: 0,
			}),
		}
	}

	pub fn set_max_pending_adds(&self, max: usize) {
		self.state.lock().unwrap().max_pending_adds = max;
	}

	pub fn set_fully_synced(&self, synced: bool) {
		self.state.lock().unwrap().fully_synced = synced;
	}

	pub fn set_initiator(&self, initiator: bool) {
		self.state.lock().unwrap().initiator = initiator;
	}

	pub fn set_invalid_commit_sig(&self) {
		self.state.lock().unwrap().invalid_commit_sig = true;
	}

	pub fn set_no_window(&self, no_window: bool) {
		self.state.lock().unwrap().no_window = no_window;
	}

	pub fn set_active_htlcs(&self, htlcs: Vec<Htlc>) {
		self.state.lock().unwrap().active_htlcs = htlcs;
	}

	pub fn set_resend_msgs(&self, msgs: Vec<Message>) {
		self.state.lock().unwrap().resend_msgs = msgs;
	}

	pub fn push_locked_in(&self, descriptors: Vec<PaymentDescriptor>) {
		self.state.lock().unwrap().locked_in.push_back(descriptors);
	}

	pub fn settles(&self) -> Vec<(PaymentPreimage, u64)> {
		self.state.lock().unwrap().settles.clone()
	}

	pub fn fails(&self) -> Vec<(u64, OpaqueReason)> {
		self.state.lock().unwrap().fails.clone()
	}

	pub fn malformed_fails(&self) -> Vec<(u64, u16, [u8; 32])> {
		self.state.lock().unwrap().malformed_fails.clone()
	}

	pub fn received_adds(&self) -> Vec<UpdateAddHTLC> {
		self.state.lock().unwrap().received_adds.clone()
	}

	pub fn received_settles(&self) -> Vec<(PaymentPreimage, u64)> {
		self.state.lock().unwrap().received_settles.clone()
	}

	pub fn received_fails(&self) -> Vec<(u64, OpaqueReason)> {
		self.state.lock().unwrap().received_fails.clone()
	}

	pub fn fee_updates(&self) -> Vec<u64> {
		self.state.lock().unwrap().fee_updates.clone()
	}

	pub fn received_fee_updates(&self) -> Vec<u64> {
		self.state.lock().unwrap().received_fee_updates.clone()
	}

	pub fn sign_count(&self) -> usize {
		self.state.lock().unwrap().sign_count
	}

	pub fn revoke_count(&self) -> usize {
		self.state.lock().unwrap().revoke_count
	}

	pub fn stopped(&self) -> bool {
		self.state.lock().unwrap().stopped
	}
}

impl ChannelMachine for TestChannelMachine {
	fn add_htlc(&self, htlc: &UpdateAddHTLC) -> Result<u64, ChannelError> {
		let mut state = self.state.lock().unwrap();
		if state.pending_adds >= state.max_pending_adds {
			return Err(ChannelError::TooManyHtlcs);
		}
		assert_eq!(htlc.channel_id, self.channel_id);
		state.pending_adds += 1;
		let index = state.next_local_index;
		state.next_local_index += 1;
		Ok(index)
	}

	fn receive_htlc(&self, htlc: &UpdateAddHTLC) -> Result<u64, ChannelError> {
		let mut state = self.state.lock().unwrap();
		state.received_adds.push(htlc.clone());
		let index = state.next_remote_index;
		state.next_remote_index += 1;
		Ok(index)
	}

	fn settle_htlc(&self, preimage: PaymentPreimage, htlc_index: u64) -> Result<(), ChannelError> {
		self.state.lock().unwrap().settles.push((preimage, htlc_index));
		Ok(())
	}

	fn receive_htlc_settle(&self, preimage: PaymentPreimage, htlc_index: u64) -> Result<(), ChannelError> {
		self.state.lock().unwrap().received_settles.push((preimage, htlc_index));
		Ok(())
	}

	fn fail_htlc(&self, htlc_index: u64, reason: OpaqueReason) -> Result<(), ChannelError> {
		self.state.lock().unwrap().fails.push((htlc_index, reason));
		Ok(())
	}

	fn receive_fail_htlc(&self, htlc_index: u64, reason: OpaqueReason) -> Result<(), ChannelError> {
		self.state.lock().unwrap().received_fails.push((htlc_index, reason));
		Ok(())
	}

	fn malformed_fail_htlc(&self, htlc_index: u64, failure_code: u16, sha256_of_onion: [u8; 32]) -> Result<(), ChannelError> {
		self.state.lock().unwrap().malformed_fails.push((htlc_index, failure_code, sha256_of_onion));
		Ok(())
	}

	fn sign_next_commitment(&self) -> Result<(Signature, Vec<Signature>), ChannelError> {
		let mut state = self.state.lock().unwrap();
		if state.no_window {
			return Err(ChannelError::NoRevocationWindow);
		}
		state.sign_count += 1;
		Ok((sig(), Vec::new()))
	}

	fn receive_new_commitment(&self, _commitment_sig: Signature, _htlc_sigs: Vec<Signature>) -> Result<(), ChannelError> {
		let state = self.state.lock().unwrap();
		if state.invalid_commit_sig {
			return Err(ChannelError::InvalidCommitSig("commit sig mismatch".to_string()));
		}
		Ok(())
	}

	fn revoke_current_commitment(&self) -> Result<(RevokeAndACK, Vec<Htlc>), ChannelError> {
		let mut state = self.state.lock().unwrap();
		state.revoke_count += 1;
		let revocation = RevokeAndACK {
			channel_id: self.channel_id,
			per_commitment_secret: [0; 32],
			next_per_commitment_point: pubkey(9),
		};
		Ok((revocation, state.active_htlcs.clone()))
	}

	fn receive_revocation(&self, _msg: &RevokeAndACK) -> Result<Vec<PaymentDescriptor>, ChannelError> {
		let mut state = self.state.lock().unwrap();
		Ok(state.locked_in.pop_front().unwrap_or_default())
	}

	fn update_fee(&self, feerate_per_kw: u64) -> Result<(), ChannelError> {
		self.state.lock().unwrap().fee_updates.push(feerate_per_kw);
		Ok(())
	}

	fn receive_update_fee(&self, feerate_per_kw: u64) -> Result<(), ChannelError> {
		self.state.lock().unwrap().received_fee_updates.push(feerate_per_kw);
		Ok(())
	}

	fn reestablish_msg(&self) -> Result<ChannelReestablish, ChannelError> {
		Ok(self.state.lock().unwrap().reestablish.clone())
	}

	fn process_reestablish_msg(&self, _msg: &ChannelReestablish) -> Result<Vec<Message>, ChannelError> {
		Ok(self.state.lock().unwrap().resend_msgs.clone())
	}

	fn active_htlcs(&self) -> Vec<Htlc> {
		self.state.lock().unwrap().active_htlcs.clone()
	}

	fn available_balance_msat(&self) -> u64 {
		self.state.lock().unwrap().available_balance_msat
	}

	fn commit_feerate_per_kw(&self) -> u64 {
		self.state.lock().unwrap().commit_feerate_per_kw
	}

	fn fully_synced(&self) -> bool {
		self.state.lock().unwrap().fully_synced
	}

	fn is_initiator(&self) -> bool {
		self.state.lock().unwrap().initiator
	}

	fn is_pending(&self) -> bool {
		self.state.lock().unwrap().pending_funding
	}

	fn next_revocation_point(&self) -> Result<PublicKey, ChannelError> {
		Ok(pubkey(11))
	}

	fn remote_next_revocation(&self) -> Option<PublicKey> {
		self.state.lock().unwrap().remote_next_revocation
	}

	fn short_channel_id(&self) -> u64 {
		self.short_channel_id
	}

	fn channel_id(&self) -> [u8; 32] {
		self.channel_id
	}

	fn snapshot(&self) -> ChannelSnapshot {
		self.state.lock().unwrap().snapshot
	}

	fn stop(&self) {
		self.state.lock().unwrap().stopped = true;
	}
}
