// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Fiat payment records, their audit log and metadata.

use std::fmt;

use chrono::{DateTime, Utc};
use redb::{ReadableDatabase, ReadableTable};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::database::{
    decode, encode, get_index, get_row, make_user_index_key, make_user_prefix,
    make_user_prefix_end, next_id, scan_child_rows, scan_rows, DuplicateKey, PaymentStore,
    StoreError, StoreResult, PAYMENTS, PAYMENT_BY_GATEWAY_TXN, PAYMENT_BY_MERCHANT_TXN,
    PAYMENT_BY_ORDER, PAYMENT_LOGS, PAYMENT_METADATA, USER_PAYMENT_INDEX,
};
use super::ownership::OwnedResource;

// =============================================================================
// Enumerations
// =============================================================================

/// Fiat payment lifecycle status.
///
/// `Pending` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
    Expired,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Success => "Success",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
            Self::Expired => "Expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }

    /// Map a gateway-reported status string onto the lifecycle.
    ///
    /// Unknown strings yield `None` and leave the payment where it is.
    pub fn from_gateway(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "success" | "successful" | "completed" => Some(Self::Success),
            "failed" | "fail" | "failure" | "declined" => Some(Self::Failed),
            "cancelled" | "canceled" | "cancel" => Some(Self::Cancelled),
            "expired" => Some(Self::Expired),
            "pending" | "processing" | "initiated" => Some(Self::Pending),
            _ => None,
        }
    }

    /// Whether a stored payment in `self` may move to `next`.
    ///
    /// Re-applying the current status is allowed and has no effect.
    pub fn can_transition_to(self, next: Self) -> bool {
        self == next || self == Self::Pending
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel the customer pays through, encoded as the gateway's numeric id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TransactionType {
    #[default]
    Web,
    Android,
    Ios,
}

impl TryFrom<u8> for TransactionType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Web),
            2 => Ok(Self::Android),
            3 => Ok(Self::Ios),
            other => Err(format!("unknown transaction type id {other}")),
        }
    }
}

impl From<TransactionType> for u8 {
    fn from(value: TransactionType) -> Self {
        match value {
            TransactionType::Web => 1,
            TransactionType::Android => 2,
            TransactionType::Ios => 3,
        }
    }
}

/// Audit actions recorded against a fiat payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentAction {
    Initialize,
    InitializeError,
    InitializeSuccess,
    Verify,
    VerifyError,
    StatusChange,
    SuccessCallback,
    FailCallback,
    CancelCallback,
}

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductDetails {
    pub name: String,
    pub profile: Option<String>,
    pub category: Option<String>,
    pub quantity: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerDetails {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postcode: Option<String>,
    pub country: Option<String>,
}

/// Browser redirect targets registered with the gateway.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReturnUrls {
    pub success: Option<String>,
    pub fail: Option<String>,
    pub cancel: Option<String>,
}

/// Persisted fiat payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: u64,
    pub user_id: String,
    pub customer_order_id: String,
    pub merchant_transaction_id: String,
    /// Assigned by the gateway once initialize succeeds.
    pub eps_transaction_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub transaction_type: TransactionType,
    pub status: PaymentStatus,
    /// Filled from the gateway's financial entity after verification.
    pub payment_method: Option<String>,
    pub product: ProductDetails,
    pub customer: CustomerDetails,
    pub return_urls: ReturnUrls,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub verification_hash: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub verification_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Set if and only if the status is `Success`.
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Set while a reseller balance grant is in flight and kept once it
    /// succeeds. Cleared again when the grant does not happen.
    pub balance_granted_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl OwnedResource for Payment {
    fn owner_user_id(&self) -> &str {
        &self.user_id
    }
}

/// Input for [`PaymentStore::create_payment`]. The store assigns the id.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub user_id: String,
    pub customer_order_id: String,
    pub merchant_transaction_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub transaction_type: TransactionType,
    pub product: ProductDetails,
    pub customer: CustomerDetails,
    pub return_urls: ReturnUrls,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub verification_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewPayment {
    fn into_pending(self, id: u64) -> Payment {
        Payment {
            id,
            user_id: self.user_id,
            customer_order_id: self.customer_order_id,
            merchant_transaction_id: self.merchant_transaction_id,
            eps_transaction_id: None,
            amount: self.amount,
            currency: self.currency,
            transaction_type: self.transaction_type,
            status: PaymentStatus::Pending,
            payment_method: None,
            product: self.product,
            customer: self.customer,
            return_urls: self.return_urls,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            verification_hash: self.verification_hash,
            verified_at: None,
            verification_attempts: 0,
            created_at: self.created_at,
            updated_at: None,
            completed_at: None,
            expires_at: self.expires_at,
            balance_granted_at: None,
            error_code: None,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShipmentDetails {
    pub name: Option<String>,
    pub address: Option<String>,
    pub address2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postcode: Option<String>,
    pub country: Option<String>,
}

impl ShipmentDetails {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Gateway-specific extension of a payment, written at most once at creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentMetadata {
    pub payment_id: u64,
    pub value_a: Option<String>,
    pub value_b: Option<String>,
    pub value_c: Option<String>,
    pub value_d: Option<String>,
    pub shipment: ShipmentDetails,
    pub shipping_method: Option<String>,
    pub product_list_json: Option<String>,
    pub gateway_response_json: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Immutable audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentLog {
    pub id: u64,
    pub payment_id: u64,
    pub action: PaymentAction,
    pub previous_status: Option<PaymentStatus>,
    pub new_status: Option<PaymentStatus>,
    pub request_data: Option<String>,
    pub response_data: Option<String>,
    pub error_message: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Builder for a log row that has not been written yet.
#[derive(Debug, Clone)]
pub struct PaymentLogEntry {
    action: PaymentAction,
    previous_status: Option<PaymentStatus>,
    new_status: Option<PaymentStatus>,
    request_data: Option<String>,
    response_data: Option<String>,
    error_message: Option<String>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    created_at: DateTime<Utc>,
}

impl PaymentLogEntry {
    pub fn new(action: PaymentAction) -> Self {
        Self {
            action,
            previous_status: None,
            new_status: None,
            request_data: None,
            response_data: None,
            error_message: None,
            ip_address: None,
            user_agent: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_transition(
        mut self,
        previous: Option<PaymentStatus>,
        new: Option<PaymentStatus>,
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

    pub fn with_client(mut self, ip_address: Option<&str>, user_agent: Option<&str>) -> Self {
        self.ip_address = ip_address.map(str::to_string);
        self.user_agent = user_agent.map(str::to_string);
        self
    }

    fn into_log(self, id: u64, payment_id: u64) -> PaymentLog {
        PaymentLog {
            id,
            payment_id,
            action: self.action,
            previous_status: self.previous_status,
            new_status: self.new_status,
            request_data: self.request_data,
            response_data: self.response_data,
            error_message: self.error_message,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            created_at: self.created_at,
        }
    }
}

/// Result of a conditional status update.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub payment: Payment,
    pub previous: PaymentStatus,
    /// False when the stored status forbade the transition.
    pub applied: bool,
}

impl StatusUpdate {
    pub fn changed(&self) -> bool {
        self.applied && self.previous != self.payment.status
    }
}

/// Aggregate counters over a set of payments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentStatistics {
    pub total_payments: u64,
    pub successful_payments: u64,
    pub failed_payments: u64,
    pub pending_payments: u64,
    pub cancelled_payments: u64,
    pub expired_payments: u64,
    /// Sum of `Success` amounts.
    pub total_revenue: Decimal,
    /// Mean amount across every counted payment.
    pub average_transaction_amount: Decimal,
    /// Successful share of all payments, in percent with two decimals.
    pub success_rate: Decimal,
}

impl PaymentStatistics {
    pub fn from_payments<'a>(payments: impl IntoIterator<Item = &'a Payment>) -> Self {
        let mut stats = Self::default();
        let mut amount_sum = Decimal::ZERO;
        for payment in payments {
            stats.total_payments += 1;
            amount_sum += payment.amount;
            match payment.status {
                PaymentStatus::Success => {
                    stats.successful_payments += 1;
                    stats.total_revenue += payment.amount;
                }
                PaymentStatus::Failed => stats.failed_payments += 1,
                PaymentStatus::Pending => stats.pending_payments += 1,
                PaymentStatus::Cancelled => stats.cancelled_payments += 1,
                PaymentStatus::Expired => stats.expired_payments += 1,
            }
        }
        if stats.total_payments > 0 {
            let total = Decimal::from(stats.total_payments);
            stats.average_transaction_amount = (amount_sum / total).round_dp(2);
            stats.success_rate =
                (Decimal::from(stats.successful_payments) * Decimal::ONE_HUNDRED / total)
                    .round_dp(2);
        }
        stats
    }
}

// =============================================================================
// Store Operations
// =============================================================================

impl PaymentStore {
    // =========================================================================
    // Idempotency checks
    // =========================================================================

    pub fn merchant_transaction_id_exists(&self, merchant_transaction_id: &str) -> StoreResult<bool> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(PAYMENT_BY_MERCHANT_TXN)?;
        Ok(get_index(&index, merchant_transaction_id)?.is_some())
    }

    pub fn customer_order_id_exists(&self, customer_order_id: &str) -> StoreResult<bool> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(PAYMENT_BY_ORDER)?;
        Ok(get_index(&index, customer_order_id)?.is_some())
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Insert a pending payment, its optional metadata and its first log row
    /// in one transaction.
    ///
    /// The unique indexes are re-checked inside the write transaction; a
    /// collision aborts the whole write with [`StoreError::Duplicate`].
    pub fn create_payment(
        &self,
        new: NewPayment,
        metadata: Option<PaymentMetadata>,
        first_log: PaymentLogEntry,
    ) -> StoreResult<(Payment, PaymentLog)> {
        let write_txn = self.db.begin_write()?;

        {
            let by_txn = write_txn.open_table(PAYMENT_BY_MERCHANT_TXN)?;
            if get_index(&by_txn, &new.merchant_transaction_id)?.is_some() {
                return Err(StoreError::Duplicate(DuplicateKey::MerchantTransactionId));
            }
            let by_order = write_txn.open_table(PAYMENT_BY_ORDER)?;
            if get_index(&by_order, &new.customer_order_id)?.is_some() {
                return Err(StoreError::Duplicate(DuplicateKey::CustomerOrderId));
            }
        }

        let payment_id = next_id(&write_txn, "payments")?;
        let log_id = next_id(&write_txn, "payment_logs")?;
        let payment = new.into_pending(payment_id);
        let log = first_log.into_log(log_id, payment_id);

        {
            let mut payments = write_txn.open_table(PAYMENTS)?;
            payments.insert(payment_id, encode(&payment)?.as_slice())?;

            let mut by_txn = write_txn.open_table(PAYMENT_BY_MERCHANT_TXN)?;
            by_txn.insert(payment.merchant_transaction_id.as_str(), payment_id)?;

            let mut by_order = write_txn.open_table(PAYMENT_BY_ORDER)?;
            by_order.insert(payment.customer_order_id.as_str(), payment_id)?;

            let mut by_user = write_txn.open_table(USER_PAYMENT_INDEX)?;
            let key = make_user_index_key(
                &payment.user_id,
                payment.created_at.timestamp_millis(),
                payment_id,
            );
            by_user.insert(key.as_slice(), payment_id)?;

            if let Some(mut metadata) = metadata {
                metadata.payment_id = payment_id;
                metadata.created_at.get_or_insert(payment.created_at);
                let mut table = write_txn.open_table(PAYMENT_METADATA)?;
                table.insert(payment_id, encode(&metadata)?.as_slice())?;
            }

            let mut logs = write_txn.open_table(PAYMENT_LOGS)?;
            logs.insert((payment_id, log_id), encode(&log)?.as_slice())?;
        }
        write_txn.commit()?;

        Ok((payment, log))
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub fn get_payment(&self, id: u64) -> StoreResult<Option<Payment>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PAYMENTS)?;
        get_row(&table, id)
    }

    pub fn find_by_merchant_transaction_id(
        &self,
        merchant_transaction_id: &str,
    ) -> StoreResult<Option<Payment>> {
        self.find_via_index(PAYMENT_BY_MERCHANT_TXN, merchant_transaction_id)
    }

    pub fn find_by_customer_order_id(&self, customer_order_id: &str) -> StoreResult<Option<Payment>> {
        self.find_via_index(PAYMENT_BY_ORDER, customer_order_id)
    }

    pub fn find_by_eps_transaction_id(
        &self,
        eps_transaction_id: &str,
    ) -> StoreResult<Option<Payment>> {
        self.find_via_index(PAYMENT_BY_GATEWAY_TXN, eps_transaction_id)
    }

    fn find_via_index(
        &self,
        index: redb::TableDefinition<'static, &'static str, u64>,
        key: &str,
    ) -> StoreResult<Option<Payment>> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(index)?;
        let Some(id) = get_index(&index, key)? else {
            return Ok(None);
        };
        let payments = read_txn.open_table(PAYMENTS)?;
        get_row(&payments, id)
    }

    /// Newest-first page of one user's payments.
    pub fn list_by_user(&self, user_id: &str, limit: usize, offset: usize) -> StoreResult<Vec<Payment>> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(USER_PAYMENT_INDEX)?;
        let payments = read_txn.open_table(PAYMENTS)?;

        let prefix = make_user_prefix(user_id);
        let prefix_end = make_user_prefix_end(user_id);

        let mut results = Vec::with_capacity(limit);
        for entry in index
            .range(prefix.as_slice()..prefix_end.as_slice())?
            .skip(offset)
            .take(limit)
        {
            let (_, id) = entry?;
            if let Some(payment) = get_row(&payments, id.value())? {
                results.push(payment);
            }
        }
        Ok(results)
    }

    /// Newest-first page of one user's payments in `status`.
    pub fn list_by_user_with_status(
        &self,
        user_id: &str,
        status: PaymentStatus,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Payment>> {
        let mut payments: Vec<Payment> = self
            .all_payments()?
            .into_iter()
            .filter(|p| p.user_id == user_id && p.status == status)
            .collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(payments.into_iter().skip(offset).take(limit).collect())
    }

    pub fn all_payments(&self) -> StoreResult<Vec<Payment>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PAYMENTS)?;
        scan_rows(&table)
    }

    pub fn metadata_for_payment(&self, payment_id: u64) -> StoreResult<Option<PaymentMetadata>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PAYMENT_METADATA)?;
        get_row(&table, payment_id)
    }

    // =========================================================================
    // Updates
    // =========================================================================

    /// Read-modify-write a single payment inside one write transaction.
    fn modify_payment<R>(
        &self,
        id: u64,
        apply: impl FnOnce(&mut Payment) -> R,
    ) -> StoreResult<(Payment, R)> {
        let write_txn = self.db.begin_write()?;
        let (payment, outcome) = {
            let mut table = write_txn.open_table(PAYMENTS)?;

            let existing_bytes = {
                let existing = table
                    .get(id)?
                    .ok_or_else(|| StoreError::NotFound(format!("Payment {id}")))?;
                existing.value().to_vec()
            };

            let mut payment: Payment = decode(&existing_bytes)?;
            let outcome = apply(&mut payment);
            table.insert(id, encode(&payment)?.as_slice())?;
            (payment, outcome)
        };
        write_txn.commit()?;
        Ok((payment, outcome))
    }

    /// Record the gateway-assigned transaction id. The status stays `Pending`.
    pub fn assign_gateway_transaction_id(
        &self,
        id: u64,
        eps_transaction_id: &str,
    ) -> StoreResult<Payment> {
        let write_txn = self.db.begin_write()?;
        let payment = {
            let mut table = write_txn.open_table(PAYMENTS)?;
            let existing_bytes = {
                let existing = table
                    .get(id)?
                    .ok_or_else(|| StoreError::NotFound(format!("Payment {id}")))?;
                existing.value().to_vec()
            };

            let mut payment: Payment = decode(&existing_bytes)?;
            payment.eps_transaction_id = Some(eps_transaction_id.to_string());
            payment.updated_at = Some(Utc::now());
            table.insert(id, encode(&payment)?.as_slice())?;

            let mut index = write_txn.open_table(PAYMENT_BY_GATEWAY_TXN)?;
            index.insert(eps_transaction_id, id)?;
            payment
        };
        write_txn.commit()?;
        Ok(payment)
    }

    pub fn increment_verification_attempts(&self, id: u64) -> StoreResult<Payment> {
        let (payment, ()) = self.modify_payment(id, |payment| {
            payment.verification_attempts = payment.verification_attempts.saturating_add(1);
            payment.updated_at = Some(Utc::now());
        })?;
        Ok(payment)
    }

    /// Apply a gateway-verified status.
    ///
    /// Only a `Pending` payment can change status; re-applying the stored
    /// status refreshes `verified_at` and the payment method.
    pub fn mark_verified(
        &self,
        id: u64,
        status: PaymentStatus,
        payment_method: Option<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<StatusUpdate> {
        let (payment, (previous, applied)) = self.modify_payment(id, |payment| {
            let previous = payment.status;
            if !previous.can_transition_to(status) {
                return (previous, false);
            }
            payment.status = status;
            if payment_method.is_some() {
                payment.payment_method = payment_method;
            }
            payment.verified_at = Some(now);
            payment.updated_at = Some(now);
            if status == PaymentStatus::Success {
                payment.completed_at.get_or_insert(now);
            }
            (previous, true)
        })?;
        Ok(StatusUpdate {
            payment,
            previous,
            applied,
        })
    }

    /// Move a `Pending` payment to a terminal status with an error code.
    pub fn transition_status(
        &self,
        id: u64,
        status: PaymentStatus,
        error_code: Option<&str>,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<StatusUpdate> {
        let (payment, (previous, applied)) = self.modify_payment(id, |payment| {
            let previous = payment.status;
            if previous != PaymentStatus::Pending {
                return (previous, false);
            }
            payment.status = status;
            payment.error_code = error_code.map(str::to_string);
            payment.error_message = error_message.map(str::to_string);
            payment.updated_at = Some(now);
            if status == PaymentStatus::Success {
                payment.completed_at = Some(now);
            }
            (previous, true)
        })?;
        Ok(StatusUpdate {
            payment,
            previous,
            applied,
        })
    }

    /// Claim the one-time balance grant for a successful payment.
    ///
    /// Returns `false` if the grant was already claimed or the payment is
    /// not `Success`.
    pub fn claim_balance_grant(&self, id: u64, now: DateTime<Utc>) -> StoreResult<bool> {
        let (_, claimed) = self.modify_payment(id, |payment| {
            if payment.status != PaymentStatus::Success || payment.balance_granted_at.is_some() {
                return false;
            }
            payment.balance_granted_at = Some(now);
            true
        })?;
        Ok(claimed)
    }

    /// Give back a claim taken by [`claim_balance_grant`](Self::claim_balance_grant)
    /// whose grant did not go through, so a later callback can retry it.
    pub fn release_balance_grant(&self, id: u64) -> StoreResult<bool> {
        let (_, released) = self.modify_payment(id, |payment| {
            payment.balance_granted_at.take().is_some()
        })?;
        Ok(released)
    }

    /// Expire every `Pending` payment created before `cutoff`.
    ///
    /// Each expired payment also gets a `StatusChange` log row. Returns the
    /// updated payments.
    pub fn expire_pending_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Payment>> {
        let write_txn = self.db.begin_write()?;

        let stale: Vec<Payment> = {
            let table = write_txn.open_table(PAYMENTS)?;
            scan_rows::<Payment>(&table)?
                .into_iter()
                .filter(|p| p.status == PaymentStatus::Pending && p.created_at < cutoff)
                .collect()
        };

        let mut expired = Vec::with_capacity(stale.len());
        for mut payment in stale {
            let log_id = next_id(&write_txn, "payment_logs")?;
            payment.status = PaymentStatus::Expired;
            payment.updated_at = Some(now);

            let log = PaymentLogEntry::new(PaymentAction::StatusChange)
                .with_transition(Some(PaymentStatus::Pending), Some(PaymentStatus::Expired))
                .with_error("Payment expired before completion")
                .into_log(log_id, payment.id);

            let mut payments = write_txn.open_table(PAYMENTS)?;
            payments.insert(payment.id, encode(&payment)?.as_slice())?;
            let mut logs = write_txn.open_table(PAYMENT_LOGS)?;
            logs.insert((payment.id, log_id), encode(&log)?.as_slice())?;

            expired.push(payment);
        }
        write_txn.commit()?;

        Ok(expired)
    }

    // =========================================================================
    // Logs
    // =========================================================================

    pub fn append_log(&self, payment_id: u64, entry: PaymentLogEntry) -> StoreResult<PaymentLog> {
        let write_txn = self.db.begin_write()?;
        let log_id = next_id(&write_txn, "payment_logs")?;
        let log = entry.into_log(log_id, payment_id);
        {
            let mut logs = write_txn.open_table(PAYMENT_LOGS)?;
            logs.insert((payment_id, log_id), encode(&log)?.as_slice())?;
        }
        write_txn.commit()?;
        Ok(log)
    }

    /// Logs for one payment in the order they were written.
    pub fn logs_for_payment(&self, payment_id: u64) -> StoreResult<Vec<PaymentLog>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PAYMENT_LOGS)?;
        scan_child_rows(&table, payment_id)
    }

    /// Most recent log rows across all payments, newest first.
    pub fn recent_logs(&self, limit: usize) -> StoreResult<Vec<PaymentLog>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PAYMENT_LOGS)?;

        let mut logs: Vec<PaymentLog> = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            logs.push(decode(value.value())?);
        }
        logs.sort_by(|a, b| b.id.cmp(&a.id));
        logs.truncate(limit);
        Ok(logs)
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    pub fn statistics_for_user(&self, user_id: &str) -> StoreResult<PaymentStatistics> {
        let payments = self.all_payments()?;
        Ok(PaymentStatistics::from_payments(
            payments.iter().filter(|p| p.user_id == user_id),
        ))
    }

    /// Statistics over payments created in `[from, to)`, optionally for one user.
    pub fn statistics_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        user_id: Option<&str>,
    ) -> StoreResult<PaymentStatistics> {
        let payments = self.all_payments()?;
        Ok(PaymentStatistics::from_payments(payments.iter().filter(
            |p| {
                p.created_at >= from
                    && p.created_at < to
                    && user_id.is_none_or(|user| p.user_id == user)
            },
        )))
    }

    /// `Failed` payments created at or after `since`, newest first.
    pub fn recent_failed(&self, since: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Payment>> {
        let mut failed: Vec<Payment> = self
            .all_payments()?
            .into_iter()
            .filter(|p| p.status == PaymentStatus::Failed && p.created_at >= since)
            .collect();
        failed.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        failed.truncate(limit);
        Ok(failed)
    }

    /// `Pending` payments created before `cutoff`.
    pub fn pending_created_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Payment>> {
        Ok(self
            .all_payments()?
            .into_iter()
            .filter(|p| p.status == PaymentStatus::Pending && p.created_at < cutoff)
            .collect())
    }
}

#[cfg(test)]
pub(crate) fn sample_new_payment(merchant_transaction_id: &str, customer_order_id: &str) -> NewPayment {
    NewPayment {
        user_id: "user-1".to_string(),
        customer_order_id: customer_order_id.to_string(),
        merchant_transaction_id: merchant_transaction_id.to_string(),
        amount: Decimal::new(10000, 2),
        currency: "BDT".to_string(),
        transaction_type: TransactionType::Web,
        product: ProductDetails {
            name: "Residential 10GB".to_string(),
            quantity: 1,
            ..Default::default()
        },
        customer: CustomerDetails {
            name: "Rahim Uddin".to_string(),
            email: "rahim@example.com".to_string(),
            phone: "01700000000".to_string(),
            ..Default::default()
        },
        return_urls: ReturnUrls::default(),
        ip_address: Some("203.0.113.7".to_string()),
        user_agent: None,
        verification_hash: None,
        created_at: Utc::now(),
        expires_at: None,
    }
}
