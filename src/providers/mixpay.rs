// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! MixPay crypto payment gateway integration.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::{bool_field, build_http_client, lookup, string_field, GatewayReply};

const ONE_TIME_PAYMENT_PATH: &str = "/v1/one_time_payment";
const PAYMENT_RESULT_PATH: &str = "/v1/payments_result";

/// Status string the gateway reports for a settled payment.
pub const SUCCESS_STATUS: &str = "success";

#[derive(Debug, thiserror::Error)]
pub enum MixPayError {
    #[error("MixPay client setup failed: {0}")]
    Setup(String),

    #[error("MixPay request failed: {0}")]
    Request(String),
}

#[async_trait]
pub trait CryptoGateway: Send + Sync {
    /// Submit a form-encoded one-time payment request.
    async fn create_one_time_payment(
        &self,
        form: &[(&str, String)],
    ) -> Result<GatewayReply, MixPayError>;

    /// Query the settlement result for `order_id` under `payee_id`.
    async fn payment_result(
        &self,
        order_id: &str,
        payee_id: &str,
    ) -> Result<GatewayReply, MixPayError>;
}

#[derive(Debug, Clone)]
pub struct MixPayClient {
    base_url: String,
    http: Client,
}

impl MixPayClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, MixPayError> {
        let http = build_http_client(timeout)
            .map_err(|e| MixPayError::Setup(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl CryptoGateway for MixPayClient {
    async fn create_one_time_payment(
        &self,
        form: &[(&str, String)],
    ) -> Result<GatewayReply, MixPayError> {
        let response = self
            .http
            .post(format!("{}{ONE_TIME_PAYMENT_PATH}", self.base_url))
            .form(form)
            .send()
            .await
            .map_err(|e| MixPayError::Request(format!("one_time_payment failed: {e}")))?;
        GatewayReply::from_response(response)
            .await
            .map_err(|e| MixPayError::Request(format!("one_time_payment response unreadable: {e}")))
    }

    async fn payment_result(
        &self,
        order_id: &str,
        payee_id: &str,
    ) -> Result<GatewayReply, MixPayError> {
        let response = self
            .http
            .get(format!("{}{PAYMENT_RESULT_PATH}", self.base_url))
            .query(&[("orderId", order_id), ("payeeId", payee_id)])
            .send()
            .await
            .map_err(|e| MixPayError::Request(format!("payments_result failed: {e}")))?;
        GatewayReply::from_response(response)
            .await
            .map_err(|e| MixPayError::Request(format!("payments_result response unreadable: {e}")))
    }
}

// =============================================================================
// Response parsing
// =============================================================================

/// Envelope of the `one_time_payment` reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OneTimePaymentReply {
    pub success: bool,
    pub message: Option<String>,
    pub code: Option<String>,
}

impl OneTimePaymentReply {
    pub fn parse(body: &Value) -> Self {
        Self {
            success: bool_field(body, "success").unwrap_or(false),
            message: string_field(body, "message"),
            code: lookup(body, "data").and_then(|data| string_field(data, "code")),
        }
    }
}

/// Settlement details reported by `payments_result`.
///
/// Every field is read on its own; the gateway omits fields freely while a
/// payment is still in flight.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaymentResult {
    pub status: Option<String>,
    pub trace_id: Option<String>,
    pub payee_id: Option<String>,
    pub quote_amount: Option<String>,
    pub quote_asset_id: Option<String>,
    pub payment_asset_id: Option<String>,
    pub payment_amount: Option<String>,
    pub txid: Option<String>,
    pub block_explorer_url: Option<String>,
}

impl PaymentResult {
    /// Parse the reply envelope. Returns `None` unless `success` is true.
    pub fn parse(body: &Value) -> Option<Self> {
        if !bool_field(body, "success").unwrap_or(false) {
            return None;
        }
        let data = lookup(body, "data")?;
        Some(Self {
            status: string_field(data, "status"),
            trace_id: string_field(data, "traceId"),
            payee_id: string_field(data, "payeeId"),
            quote_amount: string_field(data, "quoteAmount"),
            quote_asset_id: string_field(data, "quoteAssetId"),
            payment_asset_id: string_field(data, "paymentAssetId"),
            payment_amount: string_field(data, "paymentAmount"),
            txid: string_field(data, "txid"),
            block_explorer_url: string_field(data, "blockExplorerUrl"),
        })
    }

    pub fn is_settled(&self) -> bool {
        self.status.as_deref() == Some(SUCCESS_STATUS)
    }
}

/// Order id from a webhook body shaped `{"data": {"orderId": ...}}`.
pub fn callback_order_id(body: &Value) -> Option<String> {
    lookup(body, "data").and_then(|data| string_field(data, "orderId"))
}
