// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The link's in-tray: two queues between the concurrent outside world and
//! the one serial consumer.
//!
//! Upstream wire messages (from the peer's socket handler) and downstream
//! packets (from the switch) are produced by different tasks at arbitrary
//! times; the link's event loop is the single consumer of both. Each stream
//! is FIFO on its own; no ordering holds across the two.

use crate::ln::msgs::Message;
use crate::ln::switch::HtlcPacket;

use tokio::sync::mpsc;

/// The producer half of a link's mailbox. Cheap to clone, safe to call from
/// any task.
#[derive(Clone)]
pub struct Mailbox {
	message_tx: mpsc::UnboundedSender<Message>,
	packet_tx: mpsc::UnboundedSender<HtlcPacket>,
}

/// The consumer half, owned by the link's event loop.
pub(crate) struct MailboxReceivers {
	pub(crate) messages: mpsc::UnboundedReceiver<Message>,
	pub(crate) packets: mpsc::UnboundedReceiver<HtlcPacket>,
}

impl Mailbox {
	/// Creates a connected producer/consumer pair.
	pub(crate) fn new() -> (Mailbox, MailboxReceivers) {
		let (message_tx, messages) = mpsc::unbounded_channel();
		let (packet_tx, packets) = mpsc::unbounded_channel();
		(Mailbox { message_tx, packet_tx }, MailboxReceivers { messages, packets })
	}

	/// Delivers a wire message from the peer. Messages sent after the link
	/// has exited are dropped.
	pub fn add_message(&self, msg: Message) {
		let _ = self.message_tx.send(msg);
	}

	/// Delivers a packet from the switch. Packets sent after the link has
	/// exited are dropped.
	pub fn add_packet(&self, packet: HtlcPacket) {
		let _ = self.packet_tx.send(packet);
	}
}
