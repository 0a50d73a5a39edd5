// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The link's view of the node's invoice registry, consulted when an
//! incoming HTLC terminates here.

use crate::ln::{PaymentHash, PaymentPreimage};

use std::fmt;

/// The payment terms of an invoice known to the registry.
#[derive(Clone, Debug, PartialEq)]
pub struct Invoice {
	/// The preimage that settles HTLCs paying this invoice.
	pub payment_preimage: PaymentPreimage,
	/// The requested amount in milli-satoshi. Zero lets the payer choose the
	/// amount, in which case no amount validation is performed.
	pub value_msat: u64,
	/// Whether the invoice has already been settled. A settled invoice is
	/// never paid twice.
	pub settled: bool,
}

/// Errors surfaced by the invoice registry.
#[derive(Clone, Debug, PartialEq)]
pub enum RegistryError {
	/// No invoice exists for the queried payment hash.
	UnknownPaymentHash,
	/// The registry's backing store failed.
	Storage(String),
}

impl fmt::Display for RegistryError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			RegistryError::UnknownPaymentHash => write!(f, "no invoice for payment hash"),
			RegistryError::Storage(err) => write!(f, "invoice storage error: {}", err),
		}
	}
}

/// The node-wide invoice registry. Must be thread-safe; the link makes no
/// ordering assumptions about it.
pub trait InvoiceRegistry: Sync + Send {
	/// Looks up the invoice for a payment hash.
	fn lookup_invoice(&self, payment_hash: &PaymentHash) -> Result<Invoice, RegistryError>;
	/// Marks the invoice for a payment hash as settled.
	fn settle_invoice(&self, payment_hash: &PaymentHash) -> Result<(), RegistryError>;
}
