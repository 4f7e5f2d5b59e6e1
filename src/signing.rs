// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! HMAC-SHA512 signing for the fiat gateway.
//!
//! The gateway authenticates every request with an `x-hash` header holding
//! `Base64(HMAC-SHA512(key, data))`. Token requests sign the merchant
//! username; initialize and status-check requests sign the merchant
//! transaction id.
//!
//! The same primitive produces the local verification hash stored on each
//! payment row as tamper evidence. That hash is never sent to the gateway.

use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha512;

type HmacSha512 = Hmac<Sha512>;

/// Timestamp layout folded into the verification hash.
const VERIFICATION_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
}

/// Sign `data` with `key` and return the Base64 encoded MAC.
pub fn sign(data: &str, key: &str) -> Result<String, SigningError> {
    let mut mac = HmacSha512::new_from_slice(key.as_bytes())
        .map_err(|e| SigningError::InvalidKey(e.to_string()))?;
    mac.update(data.as_bytes());
    let digest = mac.finalize().into_bytes();
    Ok(Base64::encode_string(&digest))
}

/// Compute the tamper-evidence hash for a payment's critical fields.
///
/// Input layout: `{merchant_transaction_id}:{amount}:{user_id}:{yyyyMMddHHmmss}`.
pub fn verification_hash(
    merchant_transaction_id: &str,
    amount: &str,
    user_id: &str,
    at: DateTime<Utc>,
    key: &str,
) -> Result<String, SigningError> {
    let data = format!(
        "{merchant_transaction_id}:{amount}:{user_id}:{}",
        at.format(VERIFICATION_TIMESTAMP_FORMAT)
    );
    sign(&data, key)
}
