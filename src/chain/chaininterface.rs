// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Traits and types which let the link observe the chain without knowing how
//! the host node watches it.
//!
//! Includes feerate information requests, per-block notifications, the
//! per-channel chain-watcher event subscription and the global preimage
//! cache shared with on-chain arbitrators.

use crate::ln::{PaymentHash, PaymentPreimage};

use tokio::sync::mpsc;

/// The fee oracle the link samples when deciding whether the commitment
/// transaction still pays a competitive rate.
///
/// The link queries it from inside its event loop on every new block, so
/// implementations must tolerate being called at any time and from any task;
/// a slow or blocking estimate stalls the channel it serves.
pub trait FeeEstimator: Sync + Send {
	/// Gets the estimated satoshis of fee required per weight unit for a transaction to confirm
	/// within `confirmation_target` blocks, or `None` if no estimate is currently available.
	fn estimate_fee_per_weight(&self, confirmation_target: u32) -> Option<u64>;
}

/// A new best block on the main chain, delivered over the block-epoch stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockEpoch {
	/// The height of the new best block.
	pub height: u32,
}

/// An active subscription to the chain watcher for a single channel.
///
/// The link observes the `unilateral_close` stream to learn that the remote
/// party has gone to chain, at which point the channel is wiped from the peer
/// and the link exits. The subscription is cancelled when this struct is
/// dropped, on every link exit path.
pub struct ChainEventSubscription {
	/// Fires when the counterparty unilaterally closes the channel on-chain.
	pub unilateral_close: mpsc::Receiver<()>,
	/// Host-provided cancellation hook, invoked exactly once on drop.
	pub cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for ChainEventSubscription {
	fn drop(&mut self) {
		if let Some(cancel) = self.cancel.take() {
			cancel();
		}
	}
}

/// A global cache of HTLC preimages learned by any link in the node.
///
/// On-chain arbitrators subscribe to this cache so that contested HTLC
/// outputs can be swept once their preimage is known. The cache must be
/// thread-safe; the link makes no ordering assumptions about it.
pub trait PreimageCache: Sync + Send {
	/// Returns the preimage for the given payment hash, if known.
	fn lookup_preimage(&self, payment_hash: &PaymentHash) -> Option<PaymentPreimage>;
	/// Adds a newly-learned preimage to the cache.
	fn add_preimage(&self, preimage: PaymentPreimage) -> Result<(), ()>;
}

#[cfg(test)]
mod tests {
	use super::ChainEventSubscription;

	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use tokio::sync::mpsc;

	#[test]
	fn subscription_cancels_once_on_drop() {
		let cancels = Arc::new(AtomicUsize::new(0));
		let (_tx, rx) = mpsc::channel(1);
		let cancels_hook = Arc::clone(&cancels);
		let sub = ChainEventSubscription {
			unilateral_close: rx,
			cancel: Some(Box::new(move || { cancels_hook.fetch_add(1, Ordering::SeqCst); })),
		};
		drop(sub);
		assert_eq!(cancels.load(Ordering::SeqCst), 1);
	}
}
