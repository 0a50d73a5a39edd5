// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

#![crate_name = "lightning_link"]

//! The per-channel engine that drives the Lightning commitment update protocol
//! for a single bilateral channel.
//!
//! For each channel a node holds, one [`ChannelLink`] owns the commitment
//! state machine, mediates all wire traffic with the counterparty on that
//! channel, and bridges the channel with a process-wide HTLC switch. The link
//! itself is a single serial event loop fed by a thread-safe mailbox; every
//! external collaborator (the commitment engine, the switch, the peer
//! transport, the invoice registry, the preimage cache, the fee estimator and
//! the onion machinery) is a capability supplied through
//! [`ChannelLinkConfig`], so the crate carries no networking, persistence or
//! cryptographic machinery of its own.
//!
//! [`ChannelLink`]: ln::link::ChannelLink
//! [`ChannelLinkConfig`]: ln::link::ChannelLinkConfig

#![deny(missing_docs)]
#![forbid(unsafe_code)]

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

extern crate bitcoin;
extern crate tokio;

#[macro_use]
pub mod util;
pub mod chain;
pub mod ln;
