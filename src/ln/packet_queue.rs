// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The overflow queue for downstream adds that found the commitment
//! transaction full.
//!
//! While the queue is non-empty, every fresh downstream add is appended to it
//! instead of touching the channel machine, preserving FIFO order across
//! backpressure. Each time an active HTLC resolves, the link signals the
//! queue and the head packet re-enters the event loop for reprocessing.

use crate::ln::switch::HtlcPacket;

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

/// A FIFO of deferred downstream add packets.
///
/// The queue itself is only pushed and popped by the link's event loop, but
/// the pending total is read concurrently by bandwidth queries, so it is
/// tracked in an atomic alongside.
pub struct PacketQueue {
	queue: Mutex<VecDeque<HtlcPacket>>,
	total_msat: AtomicU64,
	outgoing_tx: mpsc::UnboundedSender<HtlcPacket>,
}

impl PacketQueue {
	/// Creates a queue sized for `capacity` deferred adds, along with the
	/// receiver the event loop selects re-emitted packets from.
	pub(crate) fn new(capacity: usize) -> (PacketQueue, mpsc::UnboundedReceiver<HtlcPacket>) {
		let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
		let queue = PacketQueue {
			queue: Mutex::new(VecDeque::with_capacity(capacity)),
			total_msat: AtomicU64::new(0),
			outgoing_tx,
		};
		(queue, outgoing_rx)
	}

	/// Appends a deferred add to the tail of the queue.
	pub(crate) fn add_pkt(&self, packet: HtlcPacket) {
		self.total_msat.fetch_add(packet.amount_msat, Ordering::AcqRel);
		self.queue.lock().unwrap().push_back(packet);
	}

	/// Notifies the queue that a commitment slot has been freed; the head
	/// packet, if any, is re-emitted into the event loop.
	pub(crate) fn signal_free_slot(&self) {
		let head = self.queue.lock().unwrap().pop_front();
		if let Some(packet) = head {
			self.total_msat.fetch_sub(packet.amount_msat, Ordering::AcqRel);
			let _ = self.outgoing_tx.send(packet);
		}
	}

	/// The number of adds currently deferred.
	pub fn len(&self) -> usize {
		self.queue.lock().unwrap().len()
	}

	/// Whether any adds are currently deferred.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// The total value of all deferred adds, in milli-satoshi. Subtracted
	/// from the channel balance when reporting link bandwidth.
	pub fn total_htlc_amount(&self) -> u64 {
		self.total_msat.load(Ordering::Acquire)
	}
}

#[cfg(test)]
mod tests {
	use super::PacketQueue;
	use crate::ln::msgs::{OnionPacket, UpdateAddHTLC};
	use crate::ln::PaymentHash;
	use crate::ln::switch::{HtlcMessage, HtlcPacket};

	fn add_pkt(id: u64, amount_msat: u64) -> HtlcPacket {
		HtlcPacket {
			incoming_chan_id: 7, incoming_htlc_id: id,
			outgoing_chan_id: 0, outgoing_htlc_id: 0,
			amount_msat,
			htlc: HtlcMessage::Add(UpdateAddHTLC {
				channel_id: [0; 32], htlc_id: 0, amount_msat,
				payment_hash: PaymentHash([id as u8; 32]),
				cltv_expiry: 100, onion_routing_packet: OnionPacket::blank(),
			}),
			obfuscator: None, is_routed: false, local_failure: false,
		}
	}

	#[tokio::test]
	async fn signal_reemits_in_fifo_order() {
		let (queue, mut outgoing) = PacketQueue::new(4);
		queue.add_pkt(add_pkt(1, 1000));
		queue.add_pkt(add_pkt(2, 2000));
		queue.add_pkt(add_pkt(3, 4000));
		assert_eq!(queue.len(), 3);
		assert_eq!(queue.total_htlc_amount(), 7000);

		queue.signal_free_slot();
		queue.signal_free_slot();
		assert_eq!(outgoing.recv().await.unwrap().incoming_htlc_id, 1);
		assert_eq!(outgoing.recv().await.unwrap().incoming_htlc_id, 2);
		assert_eq!(queue.len(), 1);
		assert_eq!(queue.total_htlc_amount(), 4000);
	}

	#[test]
	fn signal_on_empty_queue_is_a_noop() {
		let (queue, mut outgoing) = PacketQueue::new(4);
		queue.signal_free_slot();
		assert_eq!(queue.total_htlc_amount(), 0);
		assert!(outgoing.try_recv().is_err());
	}
}
