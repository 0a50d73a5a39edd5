// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The link's view of the process-wide HTLC switch.
//!
//! The link and the switch reference each other: the link publishes forwarded
//! packets and circuits into the switch, while the switch feeds packets into
//! the link's mailbox. Each direction is a one-way capability (the switch
//! implements [`Switch`], the link exposes `handle_switch_packet`), so
//! neither side owns the other.

use crate::ln::PaymentHash;
use crate::ln::msgs::{UpdateAddHTLC, UpdateFailHTLC, UpdateFulfillHTLC};
use crate::ln::onion_utils::ErrorEncrypter;

use std::fmt;
use std::sync::Arc;

/// The wire payload a switch packet carries.
#[derive(Clone)]
pub enum HtlcMessage {
	/// Extend a new HTLC over this link.
	Add(UpdateAddHTLC),
	/// Settle an HTLC previously extended over this link.
	Settle(UpdateFulfillHTLC),
	/// Fail an HTLC previously extended over this link.
	Fail(UpdateFailHTLC),
}

/// The internal routing envelope exchanged between links and the switch.
#[derive(Clone)]
pub struct HtlcPacket {
	/// The channel the HTLC entered the node through.
	pub incoming_chan_id: u64,
	/// The HTLC's index on the incoming channel.
	pub incoming_htlc_id: u64,
	/// The channel the HTLC leaves the node through, when known.
	pub outgoing_chan_id: u64,
	/// The HTLC's index on the outgoing channel, when known.
	pub outgoing_htlc_id: u64,
	/// The HTLC value in milli-satoshi.
	pub amount_msat: u64,
	/// The wire payload.
	pub htlc: HtlcMessage,
	/// The failure wrapper for the incoming HTLC. `None` marks a locally
	/// originated payment, whose failures stay unencrypted.
	pub obfuscator: Option<Arc<dyn ErrorEncrypter>>,
	/// Whether the packet has already been routed by the switch.
	pub is_routed: bool,
	/// Whether the contained failure was produced locally, un-obfuscated.
	pub local_failure: bool,
}

impl fmt::Debug for HtlcPacket {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		let kind = match self.htlc {
			HtlcMessage::Add(_) => "add",
			HtlcMessage::Settle(_) => "settle",
			HtlcMessage::Fail(_) => "fail",
		};
		write!(f, "HtlcPacket({}, in {}:{}, out {}:{}, {} msat)", kind,
			self.incoming_chan_id, self.incoming_htlc_id,
			self.outgoing_chan_id, self.outgoing_htlc_id, self.amount_msat)
	}
}

/// The switch's memory of an in-flight forwarded payment, registered by the
/// link before the outgoing add hits the wire and consulted to route the
/// settle or failure backwards. Lives until that resolution passes through.
#[derive(Clone)]
pub struct PaymentCircuit {
	/// The payment hash of the forwarded HTLC.
	pub payment_hash: PaymentHash,
	/// The channel the HTLC entered the node through.
	pub incoming_chan_id: u64,
	/// The HTLC's index on the incoming channel.
	pub incoming_htlc_id: u64,
	/// The channel the HTLC left the node through.
	pub outgoing_chan_id: u64,
	/// The HTLC's index on the outgoing channel.
	pub outgoing_htlc_id: u64,
	/// The failure wrapper for the incoming half, `None` for local payments.
	pub error_encrypter: Option<Arc<dyn ErrorEncrypter>>,
}

impl fmt::Debug for PaymentCircuit {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "PaymentCircuit({} -> {}:{} -> {}:{})", log_bytes!(self.payment_hash.0),
			self.incoming_chan_id, self.incoming_htlc_id,
			self.outgoing_chan_id, self.outgoing_htlc_id)
	}
}

/// Errors returned when handing a packet to the switch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SwitchError {
	/// No live link serves the packet's destination channel.
	LinkNotFound(u64),
	/// The switch is shutting down.
	Shutdown,
}

impl fmt::Display for SwitchError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			SwitchError::LinkNotFound(chan) => write!(f, "no link found for channel {}", chan),
			SwitchError::Shutdown => write!(f, "switch is shutting down"),
		}
	}
}

/// The capabilities the switch exposes to each link.
pub trait Switch: Sync + Send {
	/// Routes a packet towards the link serving its destination, or towards
	/// the payment origin for settles and failures.
	fn forward(&self, packet: HtlcPacket) -> Result<(), SwitchError>;
	/// Records the path of a forwarded HTLC so its resolution can be routed
	/// backwards. Always called before the corresponding wire add is sent.
	fn add_circuit(&self, circuit: PaymentCircuit);
}
