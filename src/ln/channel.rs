// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The interface to the cryptographic commitment engine driven by the link.
//!
//! The engine owns the channel's commitment transactions, signatures,
//! revocation keys and balance tracking. The link is its sole mutator and
//! sequences every call through its serial event loop; implementations must
//! nonetheless be internally synchronized because read-only accessors
//! (balance, snapshots) may be called from other tasks.

use bitcoin::secp256k1::PublicKey;
use bitcoin::secp256k1::ecdsa::Signature;

use crate::ln::{PaymentHash, PaymentPreimage};
use crate::ln::msgs::{ChannelReestablish, Message, OnionPacket, OpaqueReason, RevokeAndACK, UpdateAddHTLC};

use std::fmt;

/// The maximum combined number of HTLCs the commitment transaction can carry
/// in both directions.
pub const MAX_HTLC_NUMBER: usize = 966;

/// Errors surfaced by the commitment engine.
///
/// Only [`ChannelError::TooManyHtlcs`] and [`ChannelError::NoRevocationWindow`]
/// are recoverable by the link; everything else tears the channel down.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelError {
	/// The commitment transaction has no free HTLC slots. The offending add
	/// is diverted to the overflow queue until a slot frees up.
	TooManyHtlcs,
	/// The revocation window is exhausted, so no new commitment can be
	/// signed until the counterparty's next revocation arrives.
	NoRevocationWindow,
	/// The counterparty's commitment signature failed validation. The peer
	/// is told via a wire error message before the channel is failed.
	InvalidCommitSig(String),
	/// An unrecoverable violation of the channel state machine.
	Close(String),
}

impl fmt::Display for ChannelError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			ChannelError::TooManyHtlcs => write!(f, "commitment transaction is out of HTLC slots"),
			ChannelError::NoRevocationWindow => write!(f, "revocation window exhausted"),
			ChannelError::InvalidCommitSig(err) => write!(f, "invalid commitment signature: {}", err),
			ChannelError::Close(err) => write!(f, "{}", err),
		}
	}
}

/// An HTLC currently committed to the channel state.
#[derive(Clone, Debug, PartialEq)]
pub struct Htlc {
	/// Whether the HTLC was offered by the counterparty.
	pub incoming: bool,
	/// The HTLC value in milli-satoshi.
	pub amount_msat: u64,
	/// The payment hash.
	pub payment_hash: PaymentHash,
	/// The absolute block height at which the HTLC expires.
	pub cltv_expiry: u32,
	/// The index of the HTLC within the channel's update log.
	pub htlc_index: u64,
}

/// An update that just became locked-in (present in both commitments) as a
/// result of a received revocation, and can now be acted upon.
#[derive(Clone, Debug)]
pub enum PaymentDescriptor {
	/// A settle for an HTLC we previously forwarded; its preimage travels
	/// backwards through the circuit.
	Settle {
		/// The update-log index of the HTLC being settled.
		parent_index: u64,
		/// The HTLC value in milli-satoshi.
		amount_msat: u64,
		/// The revealed payment preimage.
		payment_preimage: PaymentPreimage,
	},
	/// A failure for an HTLC we previously forwarded; the opaque reason
	/// travels backwards through the circuit.
	Fail {
		/// The update-log index of the HTLC being failed.
		parent_index: u64,
		/// The HTLC value in milli-satoshi.
		amount_msat: u64,
		/// The encrypted failure reason as received.
		reason: OpaqueReason,
	},
	/// An incoming HTLC now safe to act on: forward it, settle it, or fail
	/// it, subject to our forwarding policy.
	Add {
		/// The index assigned to the HTLC by the channel's update log.
		htlc_index: u64,
		/// The HTLC value in milli-satoshi.
		amount_msat: u64,
		/// The payment hash.
		payment_hash: PaymentHash,
		/// The absolute block height at which the HTLC expires.
		cltv_expiry: u32,
		/// The onion routing packet that came with the HTLC.
		onion_routing_packet: OnionPacket,
	},
}

/// A point-in-time summary of the channel's commitment state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChannelSnapshot {
	/// The current commitment height.
	pub commit_height: u64,
	/// Total milli-satoshi sent over the channel's lifetime.
	pub total_msat_sent: u64,
	/// Total milli-satoshi received over the channel's lifetime.
	pub total_msat_received: u64,
}

/// The commitment engine for a single channel.
///
/// The operation set mirrors the add/commit/revoke rounds of the protocol:
/// `add_*`/`settle_*`/`fail_*` mutate the update logs, `sign_next_commitment`
/// extends the remote commitment chain, `receive_new_commitment` validates an
/// extension of ours, and the revocation pair advances the chains and reports
/// which updates locked in.
pub trait ChannelMachine: Sync + Send {
	/// Adds an outgoing HTLC to the update log, returning its assigned index.
	fn add_htlc(&self, htlc: &UpdateAddHTLC) -> Result<u64, ChannelError>;
	/// Adds an incoming HTLC to the update log, returning its assigned index.
	fn receive_htlc(&self, htlc: &UpdateAddHTLC) -> Result<u64, ChannelError>;
	/// Settles the incoming HTLC at `htlc_index` with its preimage.
	fn settle_htlc(&self, preimage: PaymentPreimage, htlc_index: u64) -> Result<(), ChannelError>;
	/// Applies the counterparty's settle of our outgoing HTLC `htlc_index`.
	fn receive_htlc_settle(&self, preimage: PaymentPreimage, htlc_index: u64) -> Result<(), ChannelError>;
	/// Fails the incoming HTLC at `htlc_index` with an opaque reason.
	fn fail_htlc(&self, htlc_index: u64, reason: OpaqueReason) -> Result<(), ChannelError>;
	/// Applies the counterparty's failure of our outgoing HTLC `htlc_index`.
	fn receive_fail_htlc(&self, htlc_index: u64, reason: OpaqueReason) -> Result<(), ChannelError>;
	/// Fails the incoming HTLC at `htlc_index` because its onion was
	/// unreadable, recording the failure code and onion digest.
	fn malformed_fail_htlc(&self, htlc_index: u64, failure_code: u16, sha256_of_onion: [u8; 32]) -> Result<(), ChannelError>;

	/// Signs the next remote commitment including all pending updates,
	/// returning the commitment signature and the per-HTLC signatures.
	fn sign_next_commitment(&self) -> Result<(Signature, Vec<Signature>), ChannelError>;
	/// Validates and applies the counterparty's new commitment signatures.
	fn receive_new_commitment(&self, commitment_sig: Signature, htlc_sigs: Vec<Signature>) -> Result<(), ChannelError>;
	/// Revokes our current commitment, returning the revocation message for
	/// the peer and the set of HTLCs active on the new commitment.
	fn revoke_current_commitment(&self) -> Result<(RevokeAndACK, Vec<Htlc>), ChannelError>;
	/// Applies the counterparty's revocation, advancing the remote chain and
	/// returning the updates which just became locked-in.
	fn receive_revocation(&self, msg: &RevokeAndACK) -> Result<Vec<PaymentDescriptor>, ChannelError>;

	/// Commits to a new local fee rate, in satoshi per 1000 weight units.
	fn update_fee(&self, feerate_per_kw: u64) -> Result<(), ChannelError>;
	/// Applies a counterparty-initiated fee update. Implementations are
	/// responsible for rejecting updates from a non-initiator.
	fn receive_update_fee(&self, feerate_per_kw: u64) -> Result<(), ChannelError>;

	/// Produces our reconnection summary for the counterparty.
	fn reestablish_msg(&self) -> Result<ChannelReestablish, ChannelError>;
	/// Processes the counterparty's reconnection summary, returning the
	/// messages we must retransmit, in their original send order.
	fn process_reestablish_msg(&self, msg: &ChannelReestablish) -> Result<Vec<Message>, ChannelError>;

	/// All HTLCs on the current commitment, in both directions.
	fn active_htlcs(&self) -> Vec<Htlc>;
	/// The balance available for new outgoing HTLCs, in milli-satoshi.
	fn available_balance_msat(&self) -> u64;
	/// The fee rate of the current commitment transaction, per 1000 weight.
	fn commit_feerate_per_kw(&self) -> u64;
	/// Whether both commitment chains are at the same height with no pending
	/// updates, i.e. neither side owes the other a signature.
	fn fully_synced(&self) -> bool;
	/// Whether the local node funded (and thus sets fees for) the channel.
	fn is_initiator(&self) -> bool;
	/// Whether the funding transaction has yet to confirm.
	fn is_pending(&self) -> bool;
	/// Our next per-commitment point, re-sent in funding_locked on resync.
	fn next_revocation_point(&self) -> Result<PublicKey, ChannelError>;
	/// The counterparty's next revocation point, if they have shared one. A
	/// channel without one cannot initiate new state and must not forward.
	fn remote_next_revocation(&self) -> Option<PublicKey>;
	/// The channel's location in the chain, as a short channel id.
	fn short_channel_id(&self) -> u64;
	/// The channel id, derived from the funding outpoint.
	fn channel_id(&self) -> [u8; 32];
	/// A snapshot of commitment height and lifetime totals.
	fn snapshot(&self) -> ChannelSnapshot;
	/// Signals the engine to release its resources; called once on link
	/// shutdown.
	fn stop(&self);
}
