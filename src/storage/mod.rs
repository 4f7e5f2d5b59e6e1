// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Payment Store
//!
//! Durable persistence for fiat payments, crypto payments, their append-only
//! audit logs, payment metadata and balance-grant outcomes.
//!
//! The store is the sole writer of payment status. Status updates are
//! conditional and run inside a single write transaction, so two concurrent
//! requests can never move the same payment out of a terminal state.

pub mod crypto;
pub mod database;
pub mod ownership;
pub mod payments;
pub mod purchases;

pub use crypto::{
    CryptoCompletion, CryptoLogEntry, CryptoPayment, CryptoPaymentAction, CryptoPaymentLog,
    CryptoPaymentStatus, CryptoSettlement, NewCryptoPayment,
};
pub use database::{DuplicateKey, PaymentStore, StoreError, StoreResult};
pub use ownership::{AccessError, OwnedResource, OwnershipCheck};
pub use payments::{
    CustomerDetails, NewPayment, Payment, PaymentAction, PaymentLog, PaymentLogEntry,
    PaymentMetadata, PaymentStatistics, PaymentStatus, ProductDetails, ReturnUrls,
    ShipmentDetails, StatusUpdate, TransactionType,
};
pub use purchases::{ProxyPurchase, ProxyPurchaseLog};
