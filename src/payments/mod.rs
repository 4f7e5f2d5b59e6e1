// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Payment Orchestration
//!
//! - `fiat` - token, initialize and verify against the fiat gateway
//! - `packages` - server-priced package checkout on top of `fiat`
//! - `crypto` - one-time payment creation and settlement checks
//! - `callbacks` - gateway callbacks, webhooks and manual verification
//! - `queries` - read projections for callers and operators
//! - `token_cache` - the fiat gateway's bearer token

pub mod callbacks;
pub mod crypto;
pub mod fiat;
pub mod packages;
pub mod queries;
pub mod token_cache;

pub use callbacks::{
    is_allowed_source, Acknowledgement, CallbackOutcome, CryptoReconciliation, PaymentReconciler,
};
pub use crypto::{CreatedCryptoPayment, CryptoPaymentRequest, CryptoPaymentService, CryptoVerification};
pub use fiat::{
    ClientInfo, FiatPaymentService, InitializePaymentRequest, InitializedPayment, ProductItem,
    VerificationOutcome,
};
pub use packages::{find_package, Package, PackageCheckout, PACKAGES};
pub use queries::{CryptoPaymentDetails, PaymentDetails, PaymentQueries};
pub use token_cache::GatewayTokenCache;
