// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Expiry Sweeper
//!
//! Background task that closes fiat payments nobody finished.
//!
//! Every `interval` (default 5 min) the sweeper moves each `Pending` fiat
//! payment older than the threshold (default 1440 minutes) to `Expired` and
//! writes a `StatusChange` log row for it. Crypto orders are never swept.
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken` for graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::storage::{Payment, PaymentStore, StoreResult};

pub const DEFAULT_THRESHOLD_MINUTES: i64 = 1440;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

pub struct ExpirySweeper {
    store: Arc<PaymentStore>,
    threshold_minutes: i64,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(store: Arc<PaymentStore>) -> Self {
        Self {
            store,
            threshold_minutes: DEFAULT_THRESHOLD_MINUTES,
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn with_threshold_minutes(mut self, minutes: i64) -> Self {
        self.threshold_minutes = minutes;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_SWEEP_INTERVAL);
        self
    }

    /// Run the sweep loop until the cancellation token is triggered.
    ///
    /// Should be spawned as a background task:
    /// ```rust,ignore
    /// tokio::spawn(sweeper.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            threshold_minutes = self.threshold_minutes,
            "Expiry sweeper starting"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Expiry sweeper shutting down");
                return;
            }

            if let Err(e) = self.sweep_once() {
                warn!(error = %e, "Expiry sweep failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Expiry sweeper shutting down");
                    return;
                }
            }
        }
    }

    /// Expire every stale pending payment. Returns the expired payments.
    ///
    /// A non-positive or unrepresentable threshold expires nothing.
    pub fn sweep_once(&self) -> StoreResult<Vec<Payment>> {
        let now = Utc::now();
        let Some(cutoff) = chrono::Duration::try_minutes(self.threshold_minutes)
            .filter(|threshold| *threshold > chrono::Duration::zero())
            .and_then(|threshold| now.checked_sub_signed(threshold))
        else {
            warn!(
                threshold_minutes = self.threshold_minutes,
                "Expiry threshold out of range, sweep skipped"
            );
            return Ok(Vec::new());
        };
        let expired = self.store.expire_pending_before(cutoff, now)?;

        if !expired.is_empty() {
            info!(count = expired.len(), "Expired stale pending payments");
        }
        for payment in &expired {
            info!(
                payment_id = payment.id,
                merchant_transaction_id = %payment.merchant_transaction_id,
                "Payment expired"
            );
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::temp_store;
    use crate::storage::payments::sample_new_payment;
    use crate::storage::{PaymentAction, PaymentLogEntry, PaymentStatus};

    fn seed_aged(store: &PaymentStore, mtid: &str, order: &str, age: chrono::Duration) -> Payment {
        let mut new = sample_new_payment(mtid, order);
        new.created_at = Utc::now() - age;
        store
            .create_payment(new, None, PaymentLogEntry::new(PaymentAction::Initialize))
            .unwrap()
            .0
    }

    #[test]
    fn sweep_expires_only_stale_pending() {
        let (store, _dir) = temp_store();
        let store = Arc::new(store);
        let stale = seed_aged(&store, "TXN_0000000001", "ORDER-1", chrono::Duration::hours(25));
        let fresh = seed_aged(&store, "TXN_0000000002", "ORDER-2", chrono::Duration::hours(1));

        let sweeper = ExpirySweeper::new(store.clone()).with_threshold_minutes(1440);
        let expired = sweeper.sweep_once().unwrap();

        assert_eq!(expired.len(), 1);
        assert_eq!(
            store.get_payment(stale.id).unwrap().unwrap().status,
            PaymentStatus::Expired
        );
        assert_eq!(
            store.get_payment(fresh.id).unwrap().unwrap().status,
            PaymentStatus::Pending
        );

        let last = store.logs_for_payment(stale.id).unwrap().pop().unwrap();
        assert_eq!(last.action, PaymentAction::StatusChange);
        assert_eq!(last.new_status, Some(PaymentStatus::Expired));
    }

    #[test]
    fn sweep_leaves_terminal_payments_alone() {
        let (store, _dir) = temp_store();
        let store = Arc::new(store);
        let paid = seed_aged(&store, "TXN_0000000001", "ORDER-1", chrono::Duration::hours(30));
        store
            .mark_verified(paid.id, PaymentStatus::Success, None, Utc::now())
            .unwrap();

        let expired = ExpirySweeper::new(store.clone()).sweep_once().unwrap();

        assert!(expired.is_empty());
        assert_eq!(
            store.get_payment(paid.id).unwrap().unwrap().status,
            PaymentStatus::Success
        );
    }

    #[test]
    fn out_of_range_threshold_expires_nothing() {
        let (store, _dir) = temp_store();
        let store = Arc::new(store);
        let fresh = seed_aged(&store, "TXN_0000000001", "ORDER-1", chrono::Duration::minutes(5));

        for minutes in [0, -60, i64::MAX] {
            let expired = ExpirySweeper::new(store.clone())
                .with_threshold_minutes(minutes)
                .sweep_once()
                .unwrap();
            assert!(expired.is_empty());
        }
        assert_eq!(
            store.get_payment(fresh.id).unwrap().unwrap().status,
            PaymentStatus::Pending
        );
    }

    #[test]
    fn zero_interval_is_raised_to_the_floor() {
        let (store, _dir) = temp_store();
        let sweeper = ExpirySweeper::new(Arc::new(store)).with_interval(Duration::ZERO);
        assert_eq!(sweeper.interval, MIN_SWEEP_INTERVAL);
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let (store, _dir) = temp_store();
        let shutdown = CancellationToken::new();
        let sweeper = ExpirySweeper::new(Arc::new(store)).with_interval(Duration::from_secs(3600));

        let handle = tokio::spawn(sweeper.run(shutdown.clone()));
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
