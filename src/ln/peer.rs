// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The link's view of the transport to its counterparty.

use bitcoin::secp256k1::PublicKey;

use crate::ln::msgs::Message;

use std::fmt;

/// A transport-level send failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerError(pub String);

impl fmt::Display for PeerError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// The connection to the remote node on the other end of the channel.
///
/// `send_message` may apply backpressure by blocking the calling task; the
/// link accepts that, as it only serializes traffic to this one peer.
pub trait PeerTransport: Sync + Send {
	/// Queues a message for delivery to the peer.
	fn send_message(&self, msg: Message) -> Result<(), PeerError>;
	/// Tears down the connection, telling the peer why.
	fn disconnect(&self, reason: &str);
	/// Removes the channel from the peer's active set after it has been
	/// closed on-chain.
	fn wipe_channel(&self, channel_id: &[u8; 32]) -> Result<(), PeerError>;
	/// The peer's node public key.
	fn node_id(&self) -> PublicKey;
}
