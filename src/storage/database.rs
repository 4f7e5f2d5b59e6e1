// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Embedded payment database backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `payments`: payment id → serialized Payment
//! - `payment_by_merchant_txn`: merchant transaction id → payment id
//! - `payment_by_order`: customer order id → payment id
//! - `payment_by_gateway_txn`: gateway transaction id → payment id
//! - `user_payment_index`: composite key (user|!created_at|id) → payment id
//! - `payment_logs`: (payment id, log id) → serialized PaymentLog
//! - `payment_metadata`: payment id → serialized PaymentMetadata
//! - `crypto_payments`: crypto payment id → serialized CryptoPayment
//! - `crypto_by_order`: order id → crypto payment id
//! - `crypto_payment_logs`: (crypto payment id, log id) → serialized CryptoPaymentLog
//! - `proxy_purchases`: purchase id → serialized ProxyPurchase
//! - `proxy_purchase_logs`: log id → serialized ProxyPurchaseLog
//! - `sequences`: sequence name → last issued id
//!
//! Every public operation runs in exactly one redb transaction, so a
//! multi-table write either lands completely or not at all.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::{de::DeserializeOwned, Serialize};

// =============================================================================
// Table Definitions
// =============================================================================

pub(super) const PAYMENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("payments");

pub(super) const PAYMENT_BY_MERCHANT_TXN: TableDefinition<&str, u64> =
    TableDefinition::new("payment_by_merchant_txn");

pub(super) const PAYMENT_BY_ORDER: TableDefinition<&str, u64> =
    TableDefinition::new("payment_by_order");

pub(super) const PAYMENT_BY_GATEWAY_TXN: TableDefinition<&str, u64> =
    TableDefinition::new("payment_by_gateway_txn");

/// Key format: `user_id|!created_at_be|id_be` for newest-first range scans.
pub(super) const USER_PAYMENT_INDEX: TableDefinition<&[u8], u64> =
    TableDefinition::new("user_payment_index");

pub(super) const PAYMENT_LOGS: TableDefinition<(u64, u64), &[u8]> =
    TableDefinition::new("payment_logs");

pub(super) const PAYMENT_METADATA: TableDefinition<u64, &[u8]> =
    TableDefinition::new("payment_metadata");

pub(super) const CRYPTO_PAYMENTS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("crypto_payments");

pub(super) const CRYPTO_BY_ORDER: TableDefinition<&str, u64> =
    TableDefinition::new("crypto_by_order");

pub(super) const CRYPTO_PAYMENT_LOGS: TableDefinition<(u64, u64), &[u8]> =
    TableDefinition::new("crypto_payment_logs");

pub(super) const PROXY_PURCHASES: TableDefinition<u64, &[u8]> =
    TableDefinition::new("proxy_purchases");

pub(super) const PROXY_PURCHASE_LOGS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("proxy_purchase_logs");

const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

// =============================================================================
// Error Type
// =============================================================================

/// Unique key that a create operation collided with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateKey {
    MerchantTransactionId,
    CustomerOrderId,
    CryptoOrderId,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate key: {0:?}")]
    Duplicate(DuplicateKey),
}

pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// Row Helpers
// =============================================================================

pub(super) fn encode<T: Serialize>(row: &T) -> StoreResult<Vec<u8>> {
    Ok(serde_json::to_vec(row)?)
}

pub(super) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Load a JSON row keyed by numeric id.
pub(super) fn get_row<T: DeserializeOwned>(
    table: &impl ReadableTable<u64, &'static [u8]>,
    id: u64,
) -> StoreResult<Option<T>> {
    match table.get(id)? {
        Some(value) => Ok(Some(decode(value.value())?)),
        None => Ok(None),
    }
}

/// Resolve a secondary index entry to a row id.
pub(super) fn get_index(
    table: &impl ReadableTable<&'static str, u64>,
    key: &str,
) -> StoreResult<Option<u64>> {
    Ok(table.get(key)?.map(|value| value.value()))
}

/// Decode every row of a numeric-keyed JSON table.
pub(super) fn scan_rows<T: DeserializeOwned>(
    table: &impl ReadableTable<u64, &'static [u8]>,
) -> StoreResult<Vec<T>> {
    let mut rows = Vec::new();
    for entry in table.iter()? {
        let (_, value) = entry?;
        rows.push(decode(value.value())?);
    }
    Ok(rows)
}

/// Decode the log rows that belong to one parent id, oldest first.
pub(super) fn scan_child_rows<T: DeserializeOwned>(
    table: &impl ReadableTable<(u64, u64), &'static [u8]>,
    parent_id: u64,
) -> StoreResult<Vec<T>> {
    let mut rows = Vec::new();
    for entry in table.range((parent_id, 0)..=(parent_id, u64::MAX))? {
        let (_, value) = entry?;
        rows.push(decode(value.value())?);
    }
    Ok(rows)
}

/// Issue the next id from a named sequence inside an open write transaction.
pub(super) fn next_id(txn: &WriteTransaction, sequence: &str) -> StoreResult<u64> {
    let mut table = txn.open_table(SEQUENCES)?;
    let next = table.get(sequence)?.map(|value| value.value()).unwrap_or(0) + 1;
    table.insert(sequence, next)?;
    Ok(next)
}

// =============================================================================
// Index Key Helpers
// =============================================================================

/// Build a composite key for the user payment index.
///
/// Format: `user_id_len_be_u32 | user_id | inverted_timestamp_be_bytes | id_be_bytes`
///
/// The length prefix keeps one user's range from covering ids that merely
/// start with the same bytes.
pub(super) fn make_user_index_key(user_id: &str, timestamp: i64, id: u64) -> Vec<u8> {
    let mut key = make_user_prefix(user_id);
    key.extend_from_slice(&(!timestamp as u64).to_be_bytes());
    key.extend_from_slice(&id.to_be_bytes());
    key
}

/// Lower bound for a range scan over one user's payments.
pub(super) fn make_user_prefix(user_id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(4 + user_id.len() + 8 + 8);
    prefix.extend_from_slice(&(user_id.len() as u32).to_be_bytes());
    prefix.extend_from_slice(user_id.as_bytes());
    prefix
}

/// Upper bound for a range scan over one user's payments.
pub(super) fn make_user_prefix_end(user_id: &str) -> Vec<u8> {
    let mut end = make_user_prefix(user_id);
    end.extend_from_slice(&[0xFF; 17]);
    end
}

// =============================================================================
// PaymentStore
// =============================================================================

/// Durable store for fiat payments, crypto payments and their audit trails.
///
/// Operations live in the `payments`, `crypto` and `purchases` modules.
pub struct PaymentStore {
    pub(super) db: Database,
}

impl PaymentStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(PAYMENTS)?;
            let _ = write_txn.open_table(PAYMENT_BY_MERCHANT_TXN)?;
            let _ = write_txn.open_table(PAYMENT_BY_ORDER)?;
            let _ = write_txn.open_table(PAYMENT_BY_GATEWAY_TXN)?;
            let _ = write_txn.open_table(USER_PAYMENT_INDEX)?;
            let _ = write_txn.open_table(PAYMENT_LOGS)?;
            let _ = write_txn.open_table(PAYMENT_METADATA)?;
            let _ = write_txn.open_table(CRYPTO_PAYMENTS)?;
            let _ = write_txn.open_table(CRYPTO_BY_ORDER)?;
            let _ = write_txn.open_table(CRYPTO_PAYMENT_LOGS)?;
            let _ = write_txn.open_table(PROXY_PURCHASES)?;
            let _ = write_txn.open_table(PROXY_PURCHASE_LOGS)?;
            let _ = write_txn.open_table(SEQUENCES)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }
}

#[cfg(test)]
pub(crate) fn temp_store() -> (PaymentStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = PaymentStore::open(&dir.path().join("test.redb")).unwrap();
    (store, dir)
}
