// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Crypto payment records and their audit log.

use chrono::{DateTime, Utc};
use redb::{ReadableDatabase, ReadableTable};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::database::{
    decode, encode, get_index, get_row, next_id, scan_child_rows, scan_rows, DuplicateKey,
    PaymentStore, StoreError, StoreResult, CRYPTO_BY_ORDER, CRYPTO_PAYMENTS, CRYPTO_PAYMENT_LOGS,
};
use super::ownership::OwnedResource;

/// Crypto payments only ever move from `Pending` to `Success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CryptoPaymentStatus {
    Pending,
    Success,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CryptoPaymentAction {
    Initialize,
    CallbackReceived,
    VerificationSuccess,
    VerificationFailed,
    CallbackError,
    ManualVerifySuccess,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CryptoPayment {
    pub id: u64,
    pub user_id: String,
    pub order_id: String,
    /// Gateway trace id, known after verification.
    pub trace_id: Option<String>,
    /// Quoted amount in `quote_asset_id`.
    pub amount: Decimal,
    pub quote_asset_id: String,
    pub payee_id: String,
    pub settlement_asset_id: String,
    /// Asset the payer actually used.
    pub payment_asset_id: Option<String>,
    /// Amount of `payment_asset_id` the payer sent, as reported.
    pub payment_amount: Option<String>,
    pub txid: Option<String>,
    pub block_explorer_url: Option<String>,
    pub status: CryptoPaymentStatus,
    pub payment_code: Option<String>,
    pub payment_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl OwnedResource for CryptoPayment {
    fn owner_user_id(&self) -> &str {
        &self.user_id
    }
}

#[derive(Debug, Clone)]
pub struct NewCryptoPayment {
    pub user_id: String,
    pub order_id: String,
    pub amount: Decimal,
    pub quote_asset_id: String,
    pub payee_id: String,
    pub settlement_asset_id: String,
    pub payment_code: Option<String>,
    pub payment_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Settlement details reported by the gateway for a verified order.
///
/// `None` fields never overwrite a value already stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CryptoSettlement {
    pub trace_id: Option<String>,
    pub payment_asset_id: Option<String>,
    pub payment_amount: Option<String>,
    pub txid: Option<String>,
    pub block_explorer_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CryptoPaymentLog {
    pub id: u64,
    pub crypto_payment_id: u64,
    pub action: CryptoPaymentAction,
    pub previous_status: Option<CryptoPaymentStatus>,
    pub new_status: Option<CryptoPaymentStatus>,
    pub request_data: Option<String>,
    pub response_data: Option<String>,
    pub error_message: Option<String>,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Builder for a crypto log row that has not been written yet.
#[derive(Debug, Clone)]
pub struct CryptoLogEntry {
    action: CryptoPaymentAction,
    previous_status: Option<CryptoPaymentStatus>,
    new_status: Option<CryptoPaymentStatus>,
    request_data: Option<String>,
    response_data: Option<String>,
    error_message: Option<String>,
    ip_address: Option<String>,
    created_at: DateTime<Utc>,
}

impl CryptoLogEntry {
    pub fn new(action: CryptoPaymentAction) -> Self {
        Self {
            action,
            previous_status: None,
            new_status: None,
            request_data: None,
            response_data: None,
            error_message: None,
            ip_address: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_transition(
        mut self,
        previous: Option<CryptoPaymentStatus>,
        new: Option<CryptoPaymentStatus>,
    ) -> Self {
        self.previous_status = previous;
        self.new_status = new;
        self
    }

    pub fn with_request(mut self, data: impl Into<String>) -> Self {
        self.request_data = Some(data.into());
        self
    }

    pub fn with_response(mut self, data: impl Into<String>) -> Self {
        self.response_data = Some(data.into());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_ip(mut self, ip_address: Option<&str>) -> Self {
        self.ip_address = ip_address.map(str::to_string);
        self
    }

    fn into_log(self, id: u64, crypto_payment_id: u64) -> CryptoPaymentLog {
        CryptoPaymentLog {
            id,
            crypto_payment_id,
            action: self.action,
            previous_status: self.previous_status,
            new_status: self.new_status,
            request_data: self.request_data,
            response_data: self.response_data,
            error_message: self.error_message,
            ip_address: self.ip_address,
            created_at: self.created_at,
        }
    }
}

/// Result of [`PaymentStore::complete_crypto_payment`].
#[derive(Debug, Clone)]
pub struct CryptoCompletion {
    pub payment: CryptoPayment,
    /// False when the order was already `Success`.
    pub applied: bool,
}

impl PaymentStore {
    pub fn crypto_order_exists(&self, order_id: &str) -> StoreResult<bool> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(CRYPTO_BY_ORDER)?;
        Ok(get_index(&index, order_id)?.is_some())
    }

    /// Insert a pending crypto payment and its `Initialize` log atomically.
    pub fn create_crypto_payment(
        &self,
        new: NewCryptoPayment,
        first_log: CryptoLogEntry,
    ) -> StoreResult<(CryptoPayment, CryptoPaymentLog)> {
        let write_txn = self.db.begin_write()?;

        {
            let index = write_txn.open_table(CRYPTO_BY_ORDER)?;
            if get_index(&index, &new.order_id)?.is_some() {
                return Err(StoreError::Duplicate(DuplicateKey::CryptoOrderId));
            }
        }

        let id = next_id(&write_txn, "crypto_payments")?;
        let log_id = next_id(&write_txn, "crypto_payment_logs")?;

        let payment = CryptoPayment {
            id,
            user_id: new.user_id,
            order_id: new.order_id,
            trace_id: None,
            amount: new.amount,
            quote_asset_id: new.quote_asset_id,
            payee_id: new.payee_id,
            settlement_asset_id: new.settlement_asset_id,
            payment_asset_id: None,
            payment_amount: None,
            txid: None,
            block_explorer_url: None,
            status: CryptoPaymentStatus::Pending,
            payment_code: new.payment_code,
            payment_url: new.payment_url,
            created_at: new.created_at,
            updated_at: None,
            completed_at: None,
        };
        let log = first_log.into_log(log_id, id);

        {
            let mut payments = write_txn.open_table(CRYPTO_PAYMENTS)?;
            payments.insert(id, encode(&payment)?.as_slice())?;

            let mut index = write_txn.open_table(CRYPTO_BY_ORDER)?;
            index.insert(payment.order_id.as_str(), id)?;

            let mut logs = write_txn.open_table(CRYPTO_PAYMENT_LOGS)?;
            logs.insert((id, log_id), encode(&log)?.as_slice())?;
        }
        write_txn.commit()?;

        Ok((payment, log))
    }

    pub fn find_crypto_by_order_id(&self, order_id: &str) -> StoreResult<Option<CryptoPayment>> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(CRYPTO_BY_ORDER)?;
        let Some(id) = get_index(&index, order_id)? else {
            return Ok(None);
        };
        let payments = read_txn.open_table(CRYPTO_PAYMENTS)?;
        get_row(&payments, id)
    }

    /// Newest-first page of one user's crypto payments.
    pub fn list_crypto_by_user(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<CryptoPayment>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CRYPTO_PAYMENTS)?;
        let mut payments: Vec<CryptoPayment> = scan_rows::<CryptoPayment>(&table)?
            .into_iter()
            .filter(|p| p.user_id == user_id)
            .collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(payments.into_iter().skip(offset).take(limit).collect())
    }

    /// Mark a `Pending` order as `Success`, merging in settlement details.
    ///
    /// Already-settled orders are returned unchanged with `applied == false`.
    pub fn complete_crypto_payment(
        &self,
        order_id: &str,
        settlement: CryptoSettlement,
        now: DateTime<Utc>,
    ) -> StoreResult<CryptoCompletion> {
        let write_txn = self.db.begin_write()?;
        let completion = {
            let index = write_txn.open_table(CRYPTO_BY_ORDER)?;
            let id = get_index(&index, order_id)?
                .ok_or_else(|| StoreError::NotFound(format!("Crypto order {order_id}")))?;

            let mut table = write_txn.open_table(CRYPTO_PAYMENTS)?;
            let existing_bytes = {
                let existing = table
                    .get(id)?
                    .ok_or_else(|| StoreError::NotFound(format!("Crypto payment {id}")))?;
                existing.value().to_vec()
            };
            let mut payment: CryptoPayment = decode(&existing_bytes)?;

            if payment.status == CryptoPaymentStatus::Success {
                CryptoCompletion {
                    payment,
                    applied: false,
                }
            } else {
                payment.status = CryptoPaymentStatus::Success;
                merge(&mut payment.trace_id, settlement.trace_id);
                merge(&mut payment.payment_asset_id, settlement.payment_asset_id);
                merge(&mut payment.payment_amount, settlement.payment_amount);
                merge(&mut payment.txid, settlement.txid);
                merge(&mut payment.block_explorer_url, settlement.block_explorer_url);
                payment.updated_at = Some(now);
                payment.completed_at = Some(now);
                table.insert(id, encode(&payment)?.as_slice())?;
                CryptoCompletion {
                    payment,
                    applied: true,
                }
            }
        };
        write_txn.commit()?;
        Ok(completion)
    }

    pub fn append_crypto_log(
        &self,
        crypto_payment_id: u64,
        entry: CryptoLogEntry,
    ) -> StoreResult<CryptoPaymentLog> {
        let write_txn = self.db.begin_write()?;
        let log_id = next_id(&write_txn, "crypto_payment_logs")?;
        let log = entry.into_log(log_id, crypto_payment_id);
        {
            let mut logs = write_txn.open_table(CRYPTO_PAYMENT_LOGS)?;
            logs.insert((crypto_payment_id, log_id), encode(&log)?.as_slice())?;
        }
        write_txn.commit()?;
        Ok(log)
    }

    pub fn crypto_logs_for_payment(&self, crypto_payment_id: u64) -> StoreResult<Vec<CryptoPaymentLog>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CRYPTO_PAYMENT_LOGS)?;
        scan_child_rows(&table, crypto_payment_id)
    }
}

/// Keep the existing value when the update carries none.
fn merge(slot: &mut Option<String>, update: Option<String>) {
    if update.is_some() {
        *slot = update;
    }
}

#[cfg(test)]
pub(crate) fn sample_new_crypto_payment(order_id: &str) -> NewCryptoPayment {
    NewCryptoPayment {
        user_id: "user-1".to_string(),
        order_id: order_id.to_string(),
        amount: Decimal::new(100000, 4),
        quote_asset_id: "usd".to_string(),
        payee_id: "payee-merchant".to_string(),
        settlement_asset_id: "usdt".to_string(),
        payment_code: Some("abc123".to_string()),
        payment_url: Some("https://mixpay.me/code/abc123".to_string()),
        created_at: Utc::now(),
    }
}
