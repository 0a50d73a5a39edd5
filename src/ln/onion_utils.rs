// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The seams between the link and the Sphinx onion machinery.
//!
//! The link never performs onion cryptography itself: the host supplies an
//! [`OnionDecoder`] which peels packets into a [`HopIterator`] (routing
//! instructions plus the next hop's onion) and an [`ErrorEncrypter`] (the
//! per-HTLC wrapper that encrypts failures back towards the payment origin).

use crate::ln::PaymentHash;
use crate::ln::msgs::{BADONION, FailureMessage, OnionPacket, OpaqueReason, PERM};

use std::fmt;

/// The destination a decoded onion payload routes its HTLC to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NextHop {
	/// The HTLC terminates at this node; we are the payee.
	Exit,
	/// The HTLC continues over the channel with the given short channel id.
	Channel(u64),
}

/// The routing instructions extracted from our layer of the onion.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ForwardingInfo {
	/// Where the HTLC goes next.
	pub next_hop: NextHop,
	/// The amount, in milli-satoshi, to forward to the next hop.
	pub amount_to_forward: u64,
	/// The absolute time-lock the outgoing HTLC must carry.
	pub outgoing_cltv: u32,
}

/// Failure of onion-level processing, reported to the sender through an
/// update_fail_malformed_htlc since we cannot read the packet at all.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FailCode {
	/// The version byte of the onion was not understood.
	InvalidOnionVersion,
	/// The HMAC of the onion did not verify.
	InvalidOnionHmac,
	/// The ephemeral key of the onion was unparseable.
	InvalidOnionKey,
}

impl FailCode {
	/// The BOLT 4 wire code for this failure.
	pub fn wire_code(&self) -> u16 {
		match self {
			FailCode::InvalidOnionVersion => BADONION | PERM | 4,
			FailCode::InvalidOnionHmac => BADONION | PERM | 5,
			FailCode::InvalidOnionKey => BADONION | PERM | 6,
		}
	}
}

impl fmt::Display for FailCode {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			FailCode::InvalidOnionVersion => write!(f, "invalid onion version"),
			FailCode::InvalidOnionHmac => write!(f, "invalid onion hmac"),
			FailCode::InvalidOnionKey => write!(f, "invalid onion key"),
		}
	}
}

/// The onion machinery failed to produce output (encrypt a failure or encode
/// the next hop's packet).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OnionEncodeError;

impl fmt::Display for OnionEncodeError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "onion encoding failed")
	}
}

/// Our peeled layer of an HTLC's onion: the routing instructions for this
/// hop, and the packet to pass along if the HTLC is forwarded.
pub trait HopIterator: Send {
	/// The routing instructions for this hop.
	fn forwarding_instructions(&self) -> ForwardingInfo;
	/// Encodes the onion packet for the next hop.
	fn encode_next_hop(&self) -> Result<OnionPacket, OnionEncodeError>;
}

/// The per-HTLC symmetric wrapper used to encrypt failure messages back to
/// the payment origin. Shared with the switch through the payment circuit so
/// downstream failures can be wrapped too.
pub trait ErrorEncrypter: Send + Sync {
	/// Encrypts a failure originating at this hop.
	fn encrypt_first_hop(&self, failure: &FailureMessage) -> Result<OpaqueReason, OnionEncodeError>;
}

/// Decodes onion packets into the capabilities above. Implemented over the
/// node's Sphinx router; the payment hash is passed as associated data so
/// replayed packets are forced to reuse their hash.
pub trait OnionDecoder: Sync + Send {
	/// Decodes the routing layer of `onion`, authenticated against
	/// `payment_hash`.
	fn decode_hop_iterator(&self, onion: &OnionPacket, payment_hash: &PaymentHash) -> Result<Box<dyn HopIterator>, FailCode>;
	/// Derives the failure-encryption wrapper from `onion`.
	fn decode_error_encrypter(&self, onion: &OnionPacket) -> Result<Box<dyn ErrorEncrypter>, FailCode>;
}

#[cfg(test)]
mod tests {
	use super::FailCode;

	#[test]
	fn wire_codes_are_badonion() {
		for code in [FailCode::InvalidOnionVersion, FailCode::InvalidOnionHmac, FailCode::InvalidOnionKey] {
			assert_ne!(code.wire_code() & super::BADONION, 0);
			assert_ne!(code.wire_code() & super::PERM, 0);
		}
		assert_eq!(FailCode::InvalidOnionVersion.wire_code(), 0xc004);
		assert_eq!(FailCode::InvalidOnionHmac.wire_code(), 0xc005);
		assert_eq!(FailCode::InvalidOnionKey.wire_code(), 0xc006);
	}
}
