// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Read projections over the payment store.
//!
//! Lookups of a single payment are restricted to its owner. The reporting
//! queries at the bottom span every user and are meant for operators.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::PaymentError;
use crate::storage::{
    CryptoPayment, CryptoPaymentLog, OwnershipCheck, Payment, PaymentLog, PaymentMetadata,
    PaymentStatistics, PaymentStatus, PaymentStore,
};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

/// Clamp a requested page size to `1..=MAX_PAGE_SIZE`.
pub fn page_limit(requested: Option<usize>) -> usize {
    requested.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

/// `now - window`, rejecting negative or unrepresentable windows.
fn window_start(window: Option<Duration>, field: &str) -> Result<DateTime<Utc>, PaymentError> {
    window
        .filter(|window| *window >= Duration::zero())
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .ok_or_else(|| PaymentError::Validation(format!("{field} is out of range")))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentDetails {
    pub payment: Payment,
    pub metadata: Option<PaymentMetadata>,
    pub logs: Vec<PaymentLog>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CryptoPaymentDetails {
    pub payment: CryptoPayment,
    pub logs: Vec<CryptoPaymentLog>,
}

pub struct PaymentQueries {
    store: Arc<PaymentStore>,
}

impl PaymentQueries {
    pub fn new(store: Arc<PaymentStore>) -> Self {
        Self { store }
    }

    /// Newest-first page of the caller's fiat payments.
    pub fn history(
        &self,
        user_id: &str,
        limit: Option<usize>,
        offset: usize,
        status: Option<PaymentStatus>,
    ) -> Result<Vec<Payment>, PaymentError> {
        let limit = page_limit(limit);
        let payments = match status {
            Some(status) => self
                .store
                .list_by_user_with_status(user_id, status, limit, offset)?,
            None => self.store.list_by_user(user_id, limit, offset)?,
        };
        Ok(payments)
    }

    pub fn statistics(&self, user_id: &str) -> Result<PaymentStatistics, PaymentError> {
        Ok(self.store.statistics_for_user(user_id)?)
    }

    /// Statistics for the caller's payments created in `[from, to)`.
    pub fn statistics_between(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<PaymentStatistics, PaymentError> {
        if from >= to {
            return Err(PaymentError::Validation(
                "Start date must be before end date".to_string(),
            ));
        }
        Ok(self.store.statistics_between(from, to, Some(user_id))?)
    }

    pub fn details(
        &self,
        user_id: &str,
        merchant_transaction_id: &str,
    ) -> Result<PaymentDetails, PaymentError> {
        let payment = self
            .store
            .find_by_merchant_transaction_id(merchant_transaction_id)?
            .verify_owner(user_id)?;
        let metadata = self.store.metadata_for_payment(payment.id)?;
        let logs = self.store.logs_for_payment(payment.id)?;
        Ok(PaymentDetails {
            payment,
            metadata,
            logs,
        })
    }

    pub fn by_gateway_transaction_id(
        &self,
        user_id: &str,
        eps_transaction_id: &str,
    ) -> Result<Payment, PaymentError> {
        Ok(self
            .store
            .find_by_eps_transaction_id(eps_transaction_id)?
            .verify_owner(user_id)?)
    }

    pub fn by_customer_order_id(
        &self,
        user_id: &str,
        customer_order_id: &str,
    ) -> Result<Payment, PaymentError> {
        Ok(self
            .store
            .find_by_customer_order_id(customer_order_id)?
            .verify_owner(user_id)?)
    }

    pub fn crypto_history(
        &self,
        user_id: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<CryptoPayment>, PaymentError> {
        Ok(self
            .store
            .list_crypto_by_user(user_id, page_limit(limit), offset)?)
    }

    pub fn crypto_details(
        &self,
        user_id: &str,
        order_id: &str,
    ) -> Result<CryptoPaymentDetails, PaymentError> {
        let payment = self
            .store
            .find_crypto_by_order_id(order_id)?
            .verify_owner(user_id)?;
        let logs = self.store.crypto_logs_for_payment(payment.id)?;
        Ok(CryptoPaymentDetails { payment, logs })
    }

    // =========================================================================
    // Operator reporting
    // =========================================================================

    /// `Failed` payments from the last `hours` hours, newest first.
    pub fn recent_failed(&self, hours: i64, limit: usize) -> Result<Vec<Payment>, PaymentError> {
        let since = window_start(Duration::try_hours(hours), "hours")?;
        Ok(self.store.recent_failed(since, limit)?)
    }

    pub fn recent_logs(&self, limit: usize) -> Result<Vec<PaymentLog>, PaymentError> {
        Ok(self.store.recent_logs(limit)?)
    }

    /// `Pending` payments older than `older_than_minutes`, not yet swept.
    pub fn expired_pending(&self, older_than_minutes: i64) -> Result<Vec<Payment>, PaymentError> {
        let cutoff = window_start(Duration::try_minutes(older_than_minutes), "minutes")?;
        Ok(self.store.pending_created_before(cutoff)?)
    }
}
