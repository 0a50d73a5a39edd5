// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Wire messages exchanged over a channel, plus the typed HTLC failure
//! messages used to reject payments.
//!
//! Byte-level (BOLT 2) serialization is the transport layer's concern and is
//! not defined here; messages are plain structs handed to the
//! [`PeerTransport`]. The one exception is [`FailureMessage::encode`], which
//! produces the deterministic opaque payload that failure messages travel in
//! on their way back to the payment origin.
//!
//! [`PeerTransport`]: crate::ln::peer::PeerTransport

use bitcoin::secp256k1::PublicKey;
use bitcoin::secp256k1::ecdsa::Signature;

use crate::ln::{PaymentHash, PaymentPreimage};

use std::fmt;

/// The fixed size of a Sphinx onion routing packet.
pub const ONION_PACKET_SIZE: usize = 1366;

/// An opaque Sphinx onion routing packet, peeled one layer per hop.
#[derive(Clone, PartialEq, Eq)]
pub struct OnionPacket(pub Box<[u8; ONION_PACKET_SIZE]>);

impl OnionPacket {
	/// An all-zero packet, useful as a placeholder before the next hop's
	/// onion has been encoded into it.
	pub fn blank() -> OnionPacket {
		OnionPacket(Box::new([0; ONION_PACKET_SIZE]))
	}

	/// The raw packet bytes.
	pub fn as_bytes(&self) -> &[u8] {
		&self.0[..]
	}
}

impl fmt::Debug for OnionPacket {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "OnionPacket({} bytes)", self.0.len())
	}
}

/// An encrypted failure reason, opaque to every hop but the payment origin.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct OpaqueReason(pub Vec<u8>);

/// Tells the counterparty the channel is in an unrecoverable state. The link
/// sends one before tearing down when a commitment signature fails to
/// validate.
#[derive(Clone, PartialEq, Debug)]
pub struct ErrorMessage {
	/// The channel ID involved in the error
	pub channel_id: [u8; 32],
	/// A possibly human-readable error description
	pub data: String,
}

/// Announces that the funding transaction has confirmed and the channel is
/// usable. Re-sent during resynchronization when the counterparty may have
/// missed the original.
#[derive(Clone, PartialEq, Debug)]
pub struct FundingLocked {
	/// The channel ID
	pub channel_id: [u8; 32],
	/// The per-commitment point of the second commitment transaction
	pub next_per_commitment_point: PublicKey,
}

/// Offers a new HTLC over the channel. The receiver may only act on it
/// (forward, settle or fail) once a full commitment round has locked it into
/// both sides' commitments.
#[derive(Clone, PartialEq, Debug)]
pub struct UpdateAddHTLC {
	/// The channel ID
	pub channel_id: [u8; 32],
	/// The HTLC ID
	pub htlc_id: u64,
	/// The HTLC value in milli-satoshi
	pub amount_msat: u64,
	/// The payment hash, the pre-image of which controls HTLC redemption
	pub payment_hash: PaymentHash,
	/// The expiry height of the HTLC
	pub cltv_expiry: u32,
	/// The onion routing packet with encrypted data for the next hop
	pub onion_routing_packet: OnionPacket,
}

/// Settles a pending HTLC by revealing its payment preimage, releasing the
/// HTLC's value to the sender of this message.
#[derive(Clone, PartialEq, Debug)]
pub struct UpdateFulfillHTLC {
	/// The channel ID
	pub channel_id: [u8; 32],
	/// The HTLC ID
	pub htlc_id: u64,
	/// The pre-image of the payment hash, allowing HTLC redemption
	pub payment_preimage: PaymentPreimage,
}

/// Removes a pending HTLC, carrying the encrypted reason back towards the
/// payment origin hop by hop.
#[derive(Clone, PartialEq, Debug)]
pub struct UpdateFailHTLC {
	/// The channel ID
	pub channel_id: [u8; 32],
	/// The HTLC ID
	pub htlc_id: u64,
	/// The reason field, encrypted for the payment origin
	pub reason: OpaqueReason,
}

/// Rejects an HTLC whose onion packet could not be processed at all. Since
/// no shared secret could be derived, the failure travels unencrypted with a
/// digest of the offending onion.
#[derive(Clone, PartialEq, Debug)]
pub struct UpdateFailMalformedHTLC {
	/// The channel ID
	pub channel_id: [u8; 32],
	/// The HTLC ID
	pub htlc_id: u64,
	/// SHA256 of the onion routing packet we could not process
	pub sha256_of_onion: [u8; 32],
	/// The failure code
	pub failure_code: u16,
}

/// Extends the receiver's commitment chain with a new commitment covering
/// every update exchanged so far, signed by the sender. Answered with a
/// revocation of the now-stale commitment.
#[derive(Clone, PartialEq, Debug)]
pub struct CommitmentSigned {
	/// The channel ID
	pub channel_id: [u8; 32],
	/// A signature on the commitment transaction
	pub signature: Signature,
	/// Signatures on the HTLC transactions
	pub htlc_signatures: Vec<Signature>,
}

/// Invalidates the sender's previous commitment by disclosing its
/// per-commitment secret. Receipt of this message is what locks the covered
/// updates in and makes them actionable.
#[derive(Clone, PartialEq, Debug)]
pub struct RevokeAndACK {
	/// The channel ID
	pub channel_id: [u8; 32],
	/// The secret corresponding to the per-commitment point of the revoked
	/// commitment transaction
	pub per_commitment_secret: [u8; 32],
	/// The next sender-broadcast commitment transaction's per-commitment point
	pub next_per_commitment_point: PublicKey,
}

/// Commits the channel to a new fee rate for its commitment transactions.
/// Only the channel initiator may originate one.
#[derive(Clone, PartialEq, Debug)]
pub struct UpdateFee {
	/// The channel ID
	pub channel_id: [u8; 32],
	/// Fee rate per 1000-weight of the transaction
	pub feerate_per_kw: u32,
}

/// Summarizes the sender's view of the commitment chains on reconnection, so
/// both sides can detect and retransmit whatever the disconnect swallowed.
/// Must be the first channel message after a reconnect.
#[derive(Clone, PartialEq, Debug)]
pub struct ChannelReestablish {
	/// The channel ID
	pub channel_id: [u8; 32],
	/// The next commitment number for the sender
	pub next_local_commitment_number: u64,
	/// The next commitment number for the recipient
	pub next_remote_commitment_number: u64,
	/// Proof that the sender knows the per-commitment secret of the last
	/// revoked commitment transaction, when one exists
	pub your_last_per_commitment_secret: Option<[u8; 32]>,
	/// The sender's per-commitment point for their current commitment
	/// transaction
	pub my_current_per_commitment_point: Option<PublicKey>,
}

/// All the wire messages a channel link sends or receives, as a closed sum so
/// that dispatch over message kinds is checked exhaustively at compile time.
#[derive(Clone, PartialEq, Debug)]
#[allow(missing_docs)]
pub enum Message {
	ChannelReestablish(ChannelReestablish),
	FundingLocked(FundingLocked),
	UpdateAddHTLC(UpdateAddHTLC),
	UpdateFulfillHTLC(UpdateFulfillHTLC),
	UpdateFailHTLC(UpdateFailHTLC),
	UpdateFailMalformedHTLC(UpdateFailMalformedHTLC),
	CommitmentSigned(CommitmentSigned),
	RevokeAndACK(RevokeAndACK),
	UpdateFee(UpdateFee),
	Error(ErrorMessage),
}

impl Message {
	/// The BOLT name of the message, for log records.
	pub fn name(&self) -> &'static str {
		match self {
			Message::ChannelReestablish(_) => "channel_reestablish",
			Message::FundingLocked(_) => "funding_locked",
			Message::UpdateAddHTLC(_) => "update_add_htlc",
			Message::UpdateFulfillHTLC(_) => "update_fulfill_htlc",
			Message::UpdateFailHTLC(_) => "update_fail_htlc",
			Message::UpdateFailMalformedHTLC(_) => "update_fail_malformed_htlc",
			Message::CommitmentSigned(_) => "commitment_signed",
			Message::RevokeAndACK(_) => "revoke_and_ack",
			Message::UpdateFee(_) => "update_fee",
			Message::Error(_) => "error",
		}
	}
}

/// The channel update distributed through gossip, included in failure
/// messages so the payment origin can refresh its view of our policy.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ChannelUpdate {
	/// The short channel ID
	pub short_channel_id: u64,
	/// A strictly monotonic announcement counter
	pub timestamp: u32,
	/// Channel flags
	pub flags: u16,
	/// The number of blocks to subtract from incoming HTLC cltv_expiry values
	pub cltv_expiry_delta: u16,
	/// The minimum HTLC size incoming to the sender, in milli-satoshi
	pub htlc_minimum_msat: u64,
	/// The base HTLC fee charged by the sender, in milli-satoshi
	pub fee_base_msat: u32,
	/// The amount to fee multiplier, in micro-satoshi
	pub fee_proportional_millionths: u32,
}

impl ChannelUpdate {
	/// Serializes the update for inclusion in a failure message payload.
	pub fn encode(&self) -> Vec<u8> {
		let mut res = Vec::with_capacity(32);
		res.extend_from_slice(&self.short_channel_id.to_be_bytes());
		res.extend_from_slice(&self.timestamp.to_be_bytes());
		res.extend_from_slice(&self.flags.to_be_bytes());
		res.extend_from_slice(&self.cltv_expiry_delta.to_be_bytes());
		res.extend_from_slice(&self.htlc_minimum_msat.to_be_bytes());
		res.extend_from_slice(&self.fee_base_msat.to_be_bytes());
		res.extend_from_slice(&self.fee_proportional_millionths.to_be_bytes());
		res
	}
}

/// The failure code flag marking onion-level failures the erring node could
/// not even attribute to a hop payload.
pub const BADONION: u16 = 0x8000;
/// The failure code flag for permanent failures.
pub const PERM: u16 = 0x4000;
/// The failure code flag for failures carrying a channel update.
pub const UPDATE: u16 = 0x1000;

/// A typed HTLC failure, carrying everything needed to build the opaque
/// failure payload returned to the payment origin.
#[derive(Clone, PartialEq, Debug)]
pub enum FailureMessage {
	/// The onion version byte was not understood.
	InvalidOnionVersion {
		/// SHA256 of the onion we could not process.
		sha256_of_onion: [u8; 32],
	},
	/// The onion HMAC did not verify.
	InvalidOnionHmac {
		/// SHA256 of the onion we could not process.
		sha256_of_onion: [u8; 32],
	},
	/// The onion ephemeral key was unparseable.
	InvalidOnionKey {
		/// SHA256 of the onion we could not process.
		sha256_of_onion: [u8; 32],
	},
	/// A transient failure of the forwarding channel, e.g. it is at capacity.
	TemporaryChannelFailure {
		/// Our latest channel update, when one is available.
		update: Option<ChannelUpdate>,
	},
	/// The HTLC does not reach our advertised minimum.
	AmountBelowMinimum {
		/// The amount of the offending HTLC.
		htlc_msat: u64,
		/// Our latest channel update.
		update: ChannelUpdate,
	},
	/// The HTLC does not pay our advertised fee.
	FeeInsufficient {
		/// The amount of the offending HTLC.
		htlc_msat: u64,
		/// Our latest channel update.
		update: ChannelUpdate,
	},
	/// The incoming and outgoing time-locks do not respect our delta.
	IncorrectCltvExpiry {
		/// The time-lock of the offending HTLC.
		cltv_expiry: u32,
		/// Our latest channel update.
		update: ChannelUpdate,
	},
	/// The HTLC expires too close to the current height to forward safely.
	ExpiryTooSoon {
		/// Our latest channel update.
		update: ChannelUpdate,
	},
	/// We are the destination but have no (unsettled) invoice for the hash.
	UnknownPaymentHash,
	/// We are the destination but the amount does not match the invoice.
	IncorrectPaymentAmount,
	/// We are the destination but the final time-lock is wrong or too soon.
	FinalIncorrectCltvExpiry {
		/// The time-lock named by the onion payload, or zero when the HTLC
		/// itself was rejected for expiring too soon.
		cltv_expiry: u32,
	},
}

impl FailureMessage {
	/// The BOLT 4 failure code for this failure.
	pub fn failure_code(&self) -> u16 {
		match self {
			FailureMessage::InvalidOnionVersion { .. } => BADONION | PERM | 4,
			FailureMessage::InvalidOnionHmac { .. } => BADONION | PERM | 5,
			FailureMessage::InvalidOnionKey { .. } => BADONION | PERM | 6,
			FailureMessage::TemporaryChannelFailure { .. } => UPDATE | 7,
			FailureMessage::AmountBelowMinimum { .. } => UPDATE | 11,
			FailureMessage::FeeInsufficient { .. } => UPDATE | 12,
			FailureMessage::IncorrectCltvExpiry { .. } => UPDATE | 13,
			FailureMessage::ExpiryTooSoon { .. } => UPDATE | 14,
			FailureMessage::UnknownPaymentHash => PERM | 15,
			FailureMessage::IncorrectPaymentAmount => PERM | 16,
			FailureMessage::FinalIncorrectCltvExpiry { .. } => 18,
		}
	}

	/// Translates the failure code of an update_fail_malformed_htlc into the
	/// typed failure to relay backwards, or `None` for codes we don't know
	/// (the caller substitutes [`FailureMessage::TemporaryChannelFailure`]).
	pub fn from_malformed_code(failure_code: u16, sha256_of_onion: [u8; 32]) -> Option<FailureMessage> {
		match failure_code {
			c if c == BADONION | PERM | 4 => Some(FailureMessage::InvalidOnionVersion { sha256_of_onion }),
			c if c == BADONION | PERM | 5 => Some(FailureMessage::InvalidOnionHmac { sha256_of_onion }),
			c if c == BADONION | PERM | 6 => Some(FailureMessage::InvalidOnionKey { sha256_of_onion }),
			_ => None,
		}
	}

	/// Serializes the failure into its opaque payload: the failure code
	/// followed by the variant's data, with channel updates length-prefixed.
	pub fn encode(&self) -> Vec<u8> {
		let mut res = Vec::with_capacity(40);
		res.extend_from_slice(&self.failure_code().to_be_bytes());
		fn push_update(res: &mut Vec<u8>, update: &ChannelUpdate) {
			let encoded = update.encode();
			res.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
			res.extend_from_slice(&encoded);
		}
		match self {
			FailureMessage::InvalidOnionVersion { sha256_of_onion } |
			FailureMessage::InvalidOnionHmac { sha256_of_onion } |
			FailureMessage::InvalidOnionKey { sha256_of_onion } => {
				res.extend_from_slice(sha256_of_onion);
			},
			FailureMessage::TemporaryChannelFailure { update } => {
				if let Some(update) = update {
					push_update(&mut res, update);
				}
			},
			FailureMessage::AmountBelowMinimum { htlc_msat, update } |
			FailureMessage::FeeInsufficient { htlc_msat, update } => {
				res.extend_from_slice(&htlc_msat.to_be_bytes());
				push_update(&mut res, update);
			},
			FailureMessage::IncorrectCltvExpiry { cltv_expiry, update } => {
				res.extend_from_slice(&cltv_expiry.to_be_bytes());
				push_update(&mut res, update);
			},
			FailureMessage::ExpiryTooSoon { update } => {
				push_update(&mut res, update);
			},
			FailureMessage::UnknownPaymentHash => {},
			FailureMessage::IncorrectPaymentAmount => {},
			FailureMessage::FinalIncorrectCltvExpiry { cltv_expiry } => {
				res.extend_from_slice(&cltv_expiry.to_be_bytes());
			},
		}
		res
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn dummy_update() -> ChannelUpdate {
		ChannelUpdate {
			short_channel_id: 42,
			timestamp: 1000,
			flags: 0,
			cltv_expiry_delta: 144,
			htlc_minimum_msat: 1000,
			fee_base_msat: 1000,
			fee_proportional_millionths: 1,
		}
	}

	#[test]
	fn failure_codes_match_bolt4() {
		assert_eq!(FailureMessage::InvalidOnionVersion { sha256_of_onion: [0; 32] }.failure_code(), 0xc004);
		assert_eq!(FailureMessage::InvalidOnionHmac { sha256_of_onion: [0; 32] }.failure_code(), 0xc005);
		assert_eq!(FailureMessage::InvalidOnionKey { sha256_of_onion: [0; 32] }.failure_code(), 0xc006);
		assert_eq!(FailureMessage::TemporaryChannelFailure { update: None }.failure_code(), 0x1007);
		assert_eq!(FailureMessage::AmountBelowMinimum { htlc_msat: 0, update: dummy_update() }.failure_code(), 0x100b);
		assert_eq!(FailureMessage::FeeInsufficient { htlc_msat: 0, update: dummy_update() }.failure_code(), 0x100c);
		assert_eq!(FailureMessage::IncorrectCltvExpiry { cltv_expiry: 0, update: dummy_update() }.failure_code(), 0x100d);
		assert_eq!(FailureMessage::ExpiryTooSoon { update: dummy_update() }.failure_code(), 0x100e);
		assert_eq!(FailureMessage::UnknownPaymentHash.failure_code(), 0x400f);
		assert_eq!(FailureMessage::IncorrectPaymentAmount.failure_code(), 0x4010);
		assert_eq!(FailureMessage::FinalIncorrectCltvExpiry { cltv_expiry: 0 }.failure_code(), 18);
	}

	#[test]
	fn malformed_code_translation() {
		let sha = [7; 32];
		assert_eq!(FailureMessage::from_malformed_code(0xc004, sha),
			Some(FailureMessage::InvalidOnionVersion { sha256_of_onion: sha }));
		assert_eq!(FailureMessage::from_malformed_code(0xc005, sha),
			Some(FailureMessage::InvalidOnionHmac { sha256_of_onion: sha }));
		assert_eq!(FailureMessage::from_malformed_code(0xc006, sha),
			Some(FailureMessage::InvalidOnionKey { sha256_of_onion: sha }));
		// Anything else is unknown and left to the caller to downgrade.
		assert_eq!(FailureMessage::from_malformed_code(0x4001, sha), None);
		assert_eq!(FailureMessage::from_malformed_code(0, sha), None);
	}

	#[test]
	fn encoded_failure_starts_with_code() {
		let failure = FailureMessage::FeeInsufficient { htlc_msat: 999_500, update: dummy_update() };
		let encoded = failure.encode();
		assert_eq!(u16::from_be_bytes([encoded[0], encoded[1]]), 0x100c);
		assert_eq!(u64::from_be_bytes(encoded[2..10].try_into().unwrap()), 999_500);

		let plain = FailureMessage::UnknownPaymentHash.encode();
		assert_eq!(plain, vec![0x40, 0x0f]);
	}
}
