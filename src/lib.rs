// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Proxy Payments - Payment Lifecycle and Verification Engine
//!
//! This crate brokers payments for a residential-proxy reseller across a fiat
//! gateway (EPS) and a crypto gateway (MixPay), and grants reseller balance
//! once a fiat payment is confirmed.
//!
//! ## Modules
//!
//! - `payments` - Fiat and crypto orchestrators, callback reconciliation, reads
//! - `providers` - HTTP clients for the gateways and the reseller API
//! - `storage` - Audit-logged payment store (redb)
//! - `signing` - HMAC-SHA512 request signatures
//! - `directory` - User directory collaborator
//! - `expiry` - Background sweep of stale pending payments

pub mod config;
pub mod directory;
pub mod error;
pub mod expiry;
pub mod payments;
pub mod providers;
pub mod signing;
pub mod state;
pub mod storage;

#[cfg(test)]
mod testing;
