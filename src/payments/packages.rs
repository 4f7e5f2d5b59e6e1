// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Server-priced package checkout.
//!
//! The caller picks a package id; price, product fields, callback URLs and
//! the merchant transaction id are all decided here.

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::Deserialize;

use super::fiat::{ClientInfo, FiatPaymentService, InitializePaymentRequest, InitializedPayment};
use crate::config::EpsConfig;
use crate::error::PaymentError;
use crate::storage::TransactionType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Package {
    pub id: &'static str,
    pub name: &'static str,
    /// Price in minor units (two decimal places).
    price_minor: i64,
}

impl Package {
    pub fn price(&self) -> Decimal {
        Decimal::new(self.price_minor, 2)
    }
}

pub const PACKAGES: [Package; 4] = [
    Package {
        id: "res_10gb",
        name: "Residential 10GB",
        price_minor: 1500,
    },
    Package {
        id: "res_50gb",
        name: "Residential 50GB",
        price_minor: 6500,
    },
    Package {
        id: "res_100gb",
        name: "Residential 100GB",
        price_minor: 12000,
    },
    Package {
        id: "premium_pkg",
        name: "Premium Package",
        price_minor: 100050,
    },
];

pub fn find_package(id: &str) -> Option<&'static Package> {
    PACKAGES.iter().find(|package| package.id == id)
}

/// `TXN_{yyyyMMddHHmmss}_{nnnn}`.
pub fn generate_merchant_transaction_id(now: DateTime<Utc>) -> String {
    let suffix: u16 = rand::thread_rng().gen_range(1000..10_000);
    format!("TXN_{}_{suffix}", now.format("%Y%m%d%H%M%S"))
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageCheckout {
    pub package_id: String,
    pub customer_order_id: String,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: String,
    #[serde(default)]
    pub customer_address: String,
    #[serde(default)]
    pub customer_city: String,
    #[serde(default)]
    pub customer_state: String,
    #[serde(default)]
    pub customer_postcode: String,
    pub customer_country: Option<String>,
}

impl PackageCheckout {
    fn into_request(
        self,
        package: &Package,
        config: &EpsConfig,
        now: DateTime<Utc>,
    ) -> InitializePaymentRequest {
        InitializePaymentRequest {
            customer_order_id: self.customer_order_id,
            merchant_transaction_id: generate_merchant_transaction_id(now),
            transaction_type: TransactionType::Web,
            total_amount: package.price(),
            success_url: config.success_url.clone(),
            fail_url: config.fail_url.clone(),
            cancel_url: config.cancel_url.clone(),
            customer_name: self.customer_name,
            customer_email: self.customer_email,
            customer_address: self.customer_address,
            customer_city: self.customer_city,
            customer_state: self.customer_state,
            customer_postcode: self.customer_postcode,
            customer_country: self
                .customer_country
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| "BD".to_string()),
            customer_phone: self.customer_phone,
            product_name: package.name.to_string(),
            product_profile: Some("general".to_string()),
            product_category: Some("Proxy".to_string()),
            ..Default::default()
        }
    }
}

impl FiatPaymentService {
    /// Initialize a payment for a catalog package at its server-side price.
    pub async fn initialize_package_payment(
        &self,
        checkout: PackageCheckout,
        user_id: &str,
        client: &ClientInfo,
    ) -> Result<InitializedPayment, PaymentError> {
        let package = find_package(checkout.package_id.trim()).ok_or(PaymentError::InvalidPackage)?;
        let request = checkout.into_request(package, self.config(), Utc::now());
        self.initialize_payment(request, user_id, client).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::fiat::fiat_service;
    use crate::testing::{eps_config, FakeFiatGateway};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn checkout(package_id: &str) -> PackageCheckout {
        PackageCheckout {
            package_id: package_id.to_string(),
            customer_order_id: "ORDER-PKG-1".to_string(),
            customer_name: "Rahim Uddin".to_string(),
            customer_email: "rahim@example.com".to_string(),
            customer_phone: "01700000000".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn catalog_prices() {
        assert_eq!(find_package("res_10gb").unwrap().price(), Decimal::new(1500, 2));
        assert_eq!(
            find_package("premium_pkg").unwrap().price().to_string(),
            "1000.50"
        );
        assert!(find_package("res_1tb").is_none());
    }

    #[test]
    fn merchant_transaction_id_format() {
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 9, 8, 7).unwrap();
        let id = generate_merchant_transaction_id(now);
        assert!(id.starts_with("TXN_20260501090807_"));
        let suffix: u16 = id.rsplit('_').next().unwrap().parse().unwrap();
        assert!((1000..10_000).contains(&suffix));
    }

    #[test]
    fn request_defaults() {
        let request = checkout("res_50gb").into_request(
            find_package("res_50gb").unwrap(),
            &eps_config(),
            Utc::now(),
        );
        assert_eq!(request.total_amount, Decimal::new(6500, 2));
        assert_eq!(request.product_name, "Residential 50GB");
        assert_eq!(request.product_profile.as_deref(), Some("general"));
        assert_eq!(request.product_category.as_deref(), Some("Proxy"));
        assert_eq!(request.customer_country, "BD");
        assert_eq!(request.transaction_type, TransactionType::Web);
        assert_eq!(request.success_url, eps_config().success_url);
    }

    #[tokio::test]
    async fn unknown_package_is_rejected() {
        let gateway = Arc::new(FakeFiatGateway::new());
        let (service, _store, _dir) = fiat_service(&gateway);
        let err = service
            .initialize_package_payment(checkout("res_1tb"), "user-1", &ClientInfo::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_PACKAGE");
        assert_eq!(gateway.token_calls(), 0);
    }

    #[tokio::test]
    async fn package_checkout_uses_server_price() {
        let gateway = Arc::new(FakeFiatGateway::new());
        let (service, store, _dir) = fiat_service(&gateway);
        let result = service
            .initialize_package_payment(checkout("res_100gb"), "user-1", &ClientInfo::default())
            .await
            .unwrap();

        let payment = store.get_payment(result.payment_id).unwrap().unwrap();
        assert_eq!(payment.amount, Decimal::new(12000, 2));
        assert!(payment.merchant_transaction_id.starts_with("TXN_"));
        assert_eq!(payment.product.category.as_deref(), Some("Proxy"));
    }
}
