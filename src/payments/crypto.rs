// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Crypto Payment Orchestrator
//!
//! Creates MixPay one-time payments and verifies their settlement.
//!
//! Verification re-queries the gateway and only accepts a result that is
//! settled, addressed to this merchant's payee id, and (when expectations
//! are given) quoted in the expected asset and amount. Webhook bodies are
//! never trusted on their own.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::MixPayConfig;
use crate::error::PaymentError;
use crate::providers::mixpay::{CryptoGateway, OneTimePaymentReply, PaymentResult};
use crate::storage::{
    CryptoLogEntry, CryptoPayment, CryptoPaymentAction, CryptoPaymentStatus, CryptoSettlement,
    NewCryptoPayment, PaymentStore,
};

/// Decimal places of the quote amount sent to the gateway.
const QUOTE_DECIMALS: u32 = 2;

/// Largest accepted difference between expected and reported quote amounts.
pub fn amount_tolerance() -> Decimal {
    Decimal::new(1, 4)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CryptoPaymentRequest {
    /// Generated when absent.
    pub order_id: Option<String>,
    pub amount: Decimal,
    pub quote_asset_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatedCryptoPayment {
    pub payment_id: u64,
    pub order_id: String,
    pub payment_code: String,
    pub payment_url: String,
}

/// Outcome of a settlement query. Never an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CryptoVerification {
    pub verified: bool,
    /// Parsed gateway result, when one was available.
    pub result: Option<PaymentResult>,
    /// Raw gateway body, kept for the audit log.
    pub raw_response: Option<String>,
    /// Why verification failed.
    pub failure: Option<String>,
}

impl CryptoVerification {
    fn rejected(failure: impl Into<String>, raw_response: Option<String>) -> Self {
        Self {
            verified: false,
            result: None,
            raw_response,
            failure: Some(failure.into()),
        }
    }

    /// Settlement fields to merge into the stored payment.
    pub fn settlement(&self) -> CryptoSettlement {
        let Some(result) = &self.result else {
            return CryptoSettlement::default();
        };
        CryptoSettlement {
            trace_id: result.trace_id.clone(),
            payment_asset_id: result.payment_asset_id.clone(),
            payment_amount: result.payment_amount.clone(),
            txid: result.txid.clone(),
            block_explorer_url: result.block_explorer_url.clone(),
        }
    }
}

/// Check a gateway result against this merchant and the stored order.
///
/// Returns the first failed check.
pub fn check_result(
    result: &PaymentResult,
    payee_id: &str,
    expected_amount: Option<Decimal>,
    expected_asset_id: Option<&str>,
) -> Result<(), String> {
    if !result.is_settled() {
        return Err(format!(
            "status is {}",
            result.status.as_deref().unwrap_or("missing")
        ));
    }
    if result.payee_id.as_deref() != Some(payee_id) {
        return Err("payee id mismatch".to_string());
    }
    if let Some(expected) = expected_asset_id {
        let matches = result
            .quote_asset_id
            .as_deref()
            .is_some_and(|actual| actual.eq_ignore_ascii_case(expected));
        if !matches {
            return Err("quote asset mismatch".to_string());
        }
    }
    if let Some(expected) = expected_amount {
        let actual = result
            .quote_amount
            .as_deref()
            .ok_or_else(|| "quote amount missing".to_string())?;
        let actual = Decimal::from_str(actual.trim())
            .map_err(|_| format!("quote amount {actual} is not a number"))?;
        if (actual - expected).abs() >= amount_tolerance() {
            return Err(format!("quote amount {actual} does not match {expected}"));
        }
    }
    Ok(())
}

/// Append `orderId` to the return URL unless it already carries one.
fn return_url_for(return_url: &str, order_id: &str) -> String {
    if return_url.contains("orderId=") {
        return return_url.to_string();
    }
    match Url::parse(return_url) {
        Ok(mut url) => {
            url.query_pairs_mut().append_pair("orderId", order_id);
            url.to_string()
        }
        Err(_) => {
            let separator = if return_url.contains('?') { '&' } else { '?' };
            format!("{return_url}{separator}orderId={order_id}")
        }
    }
}

fn generate_order_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "CRYPTO_{}_{}",
        Utc::now().format("%Y%m%d%H%M%S"),
        &suffix[..8]
    )
}

pub struct CryptoPaymentService {
    store: Arc<PaymentStore>,
    gateway: Arc<dyn CryptoGateway>,
    config: MixPayConfig,
}

impl CryptoPaymentService {
    pub fn new(store: Arc<PaymentStore>, gateway: Arc<dyn CryptoGateway>, config: MixPayConfig) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    pub fn config(&self) -> &MixPayConfig {
        &self.config
    }

    /// Create a one-time payment and persist it as `Pending`.
    ///
    /// Nothing is written unless the gateway returns a payment code.
    pub async fn create_payment(
        &self,
        request: CryptoPaymentRequest,
        user_id: &str,
        ip_address: Option<&str>,
    ) -> Result<CreatedCryptoPayment, PaymentError> {
        if request.amount <= Decimal::ZERO {
            return Err(PaymentError::Validation(
                "Amount must be greater than 0".to_string(),
            ));
        }
        // The quote is sent with two decimals; the stored amount must match it.
        if request.amount.normalize().scale() > QUOTE_DECIMALS {
            return Err(PaymentError::Validation(format!(
                "Amount must have at most {QUOTE_DECIMALS} decimal places"
            )));
        }
        let order_id = request
            .order_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_order_id);
        if self.store.crypto_order_exists(&order_id)? {
            return Err(PaymentError::DuplicateOrderId);
        }
        let quote_asset_id = request
            .quote_asset_id
            .filter(|asset| !asset.trim().is_empty())
            .unwrap_or_else(|| self.config.default_quote_asset.clone());

        let form = vec![
            ("payeeId", self.config.payee_id.clone()),
            ("settlementAssetId", self.config.settlement_asset_id.clone()),
            ("quoteAssetId", quote_asset_id.clone()),
            ("quoteAmount", format!("{:.2}", request.amount)),
            ("orderId", order_id.clone()),
            ("returnTo", return_url_for(&self.config.return_url, &order_id)),
            ("callbackUrl", self.config.callback_url.clone()),
        ];
        let request_json = serde_json::Value::Object(
            form.iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.clone())))
                .collect(),
        )
        .to_string();

        info!(order_id = %order_id, amount = %request.amount, "Creating crypto payment");

        let reply = self
            .gateway
            .create_one_time_payment(&form)
            .await
            .map_err(|e| PaymentError::GatewayUnavailable(e.to_string()))?;
        if !reply.is_success() {
            warn!(order_id = %order_id, status = reply.status, "Crypto gateway rejected payment");
            return Err(PaymentError::Gateway {
                upstream_code: reply.upstream_code(),
                message: reply.body,
            });
        }

        let parsed = reply
            .json()
            .map(|body| OneTimePaymentReply::parse(&body))
            .ok_or_else(|| PaymentError::Parse("payment response is not JSON".to_string()))?;
        if !parsed.success {
            let message = parsed
                .message
                .unwrap_or_else(|| "MixPay API error".to_string());
            warn!(order_id = %order_id, error = %message, "Crypto gateway returned unsuccessful reply");
            return Err(PaymentError::Gateway {
                upstream_code: "MIXPAY_ERROR".to_string(),
                message,
            });
        }
        let Some(payment_code) = parsed.code else {
            return Err(PaymentError::Parse(
                "payment response carries no code".to_string(),
            ));
        };
        let payment_url = self.config.payment_url_template.replace("{code}", &payment_code);

        let (payment, _) = self.store.create_crypto_payment(
            NewCryptoPayment {
                user_id: user_id.to_string(),
                order_id: order_id.clone(),
                amount: request.amount,
                quote_asset_id,
                payee_id: self.config.payee_id.clone(),
                settlement_asset_id: self.config.settlement_asset_id.clone(),
                payment_code: Some(payment_code.clone()),
                payment_url: Some(payment_url.clone()),
                created_at: Utc::now(),
            },
            CryptoLogEntry::new(CryptoPaymentAction::Initialize)
                .with_transition(None, Some(CryptoPaymentStatus::Pending))
                .with_request(request_json)
                .with_response(reply.body)
                .with_ip(ip_address),
        )?;

        info!(order_id = %order_id, payment_url = %payment_url, "Crypto payment created");

        Ok(CreatedCryptoPayment {
            payment_id: payment.id,
            order_id,
            payment_code,
            payment_url,
        })
    }

    /// Query and check the settlement of `order_id`.
    pub async fn verify_payment(
        &self,
        order_id: &str,
        expected_amount: Option<Decimal>,
        expected_asset_id: Option<&str>,
    ) -> CryptoVerification {
        let reply = match self
            .gateway
            .payment_result(order_id, &self.config.payee_id)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(order_id, error = %e, "Crypto result query failed");
                return CryptoVerification::rejected(e.to_string(), None);
            }
        };
        if !reply.is_success() {
            warn!(order_id, status = reply.status, "Crypto result query rejected");
            return CryptoVerification::rejected(
                format!("{}: {}", reply.upstream_code(), reply.body),
                Some(reply.body),
            );
        }

        let Some(result) = reply.json().and_then(|body| PaymentResult::parse(&body)) else {
            warn!(order_id, "Crypto result is unsuccessful or unreadable");
            return CryptoVerification::rejected("result unavailable", Some(reply.body));
        };

        match check_result(&result, &self.config.payee_id, expected_amount, expected_asset_id) {
            Ok(()) => {
                info!(order_id, trace_id = ?result.trace_id, "Crypto payment verified");
                CryptoVerification {
                    verified: true,
                    result: Some(result),
                    raw_response: Some(reply.body),
                    failure: None,
                }
            }
            Err(failure) => {
                warn!(order_id, reason = %failure, "Crypto payment failed verification");
                CryptoVerification {
                    verified: false,
                    result: Some(result),
                    raw_response: Some(reply.body),
                    failure: Some(failure),
                }
            }
        }
    }

    pub fn find_by_order_id(&self, order_id: &str) -> Result<Option<CryptoPayment>, PaymentError> {
        Ok(self.store.find_crypto_by_order_id(order_id)?)
    }
}

#[cfg(test)]
pub(crate) fn crypto_service(
    gateway: &Arc<crate::testing::FakeCryptoGateway>,
) -> (CryptoPaymentService, Arc<PaymentStore>, tempfile::TempDir) {
    let (store, dir) = crate::storage::database::temp_store();
    let store = Arc::new(store);
    let service =
        CryptoPaymentService::new(store.clone(), gateway.clone(), crate::testing::mixpay_config());
    (service, store, dir)
}
