// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Outcome records of the reseller balance grant that follows a paid order.

use chrono::{DateTime, Utc};
use redb::ReadableDatabase;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::database::{
    encode, next_id, scan_rows, PaymentStore, StoreResult, PROXY_PURCHASES, PROXY_PURCHASE_LOGS,
};

/// A balance grant that the reseller accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyPurchase {
    pub id: u64,
    pub payment_id: u64,
    pub username: String,
    pub email: String,
    /// Amount the customer paid.
    pub amount: Decimal,
    /// Balance granted on the reseller side.
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
}

/// A balance grant that failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyPurchaseLog {
    pub id: u64,
    pub payment_id: u64,
    pub username: String,
    pub amount: Decimal,
    pub balance: Decimal,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
}

impl PaymentStore {
    pub fn record_proxy_purchase(
        &self,
        payment_id: u64,
        username: &str,
        email: &str,
        amount: Decimal,
        balance: Decimal,
    ) -> StoreResult<ProxyPurchase> {
        let write_txn = self.db.begin_write()?;
        let id = next_id(&write_txn, "proxy_purchases")?;
        let purchase = ProxyPurchase {
            id,
            payment_id,
            username: username.to_string(),
            email: email.to_string(),
            amount,
            balance,
            created_at: Utc::now(),
        };
        {
            let mut table = write_txn.open_table(PROXY_PURCHASES)?;
            table.insert(id, encode(&purchase)?.as_slice())?;
        }
        write_txn.commit()?;
        Ok(purchase)
    }

    pub fn record_proxy_purchase_failure(
        &self,
        payment_id: u64,
        username: &str,
        amount: Decimal,
        balance: Decimal,
        error_message: &str,
    ) -> StoreResult<ProxyPurchaseLog> {
        let write_txn = self.db.begin_write()?;
        let id = next_id(&write_txn, "proxy_purchase_logs")?;
        let log = ProxyPurchaseLog {
            id,
            payment_id,
            username: username.to_string(),
            amount,
            balance,
            error_message: error_message.to_string(),
            created_at: Utc::now(),
        };
        {
            let mut table = write_txn.open_table(PROXY_PURCHASE_LOGS)?;
            table.insert(id, encode(&log)?.as_slice())?;
        }
        write_txn.commit()?;
        Ok(log)
    }

    pub fn proxy_purchases_for_payment(&self, payment_id: u64) -> StoreResult<Vec<ProxyPurchase>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PROXY_PURCHASES)?;
        Ok(scan_rows::<ProxyPurchase>(&table)?
            .into_iter()
            .filter(|p| p.payment_id == payment_id)
            .collect())
    }

    pub fn proxy_purchase_failures_for_payment(
        &self,
        payment_id: u64,
    ) -> StoreResult<Vec<ProxyPurchaseLog>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PROXY_PURCHASE_LOGS)?;
        Ok(scan_rows::<ProxyPurchaseLog>(&table)?
            .into_iter()
            .filter(|p| p.payment_id == payment_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::temp_store;

    #[test]
    fn purchases_and_failures_are_kept_apart() {
        let (store, _dir) = temp_store();
        store
            .record_proxy_purchase(1, "sub-rahim", "rahim@example.com", Decimal::from(15), Decimal::from(120))
            .unwrap();
        store
            .record_proxy_purchase_failure(2, "sub-karim", Decimal::from(65), Decimal::from(520), "quota exceeded")
            .unwrap();

        let purchases = store.proxy_purchases_for_payment(1).unwrap();
        assert_eq!(purchases.len(), 1);
        assert_eq!(purchases[0].balance, Decimal::from(120));
        assert!(store.proxy_purchase_failures_for_payment(1).unwrap().is_empty());

        let failures = store.proxy_purchase_failures_for_payment(2).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error_message, "quota exceeded");
    }
}
