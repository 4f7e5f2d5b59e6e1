// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-process fakes for the gateway traits, with call counters.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{json, Value};

use crate::config::{EpsConfig, MixPayConfig};
use crate::providers::eps::{EpsError, FiatGateway};
use crate::providers::mixpay::{CryptoGateway, MixPayError};
use crate::providers::reseller::{BalanceGrant, ResellerProvisioning};
use crate::providers::GatewayReply;

pub(crate) const TEST_HASH_KEY: &str = "test-hash-key";
pub(crate) const TEST_PAYEE_ID: &str = "payee-merchant";

pub(crate) fn eps_config() -> EpsConfig {
    EpsConfig {
        base_url: "https://eps.test".to_string(),
        username: "merchant-user".to_string(),
        password: "merchant-pass".to_string(),
        hash_key: TEST_HASH_KEY.to_string(),
        merchant_id: "merchant-1".to_string(),
        store_id: "store-1".to_string(),
        success_url: "https://api.test/callback/success".to_string(),
        fail_url: "https://api.test/callback/fail".to_string(),
        cancel_url: "https://api.test/callback/cancel".to_string(),
        frontend_url: "https://app.test".to_string(),
        payment_ttl: chrono::Duration::hours(24),
    }
}

pub(crate) fn mixpay_config() -> MixPayConfig {
    MixPayConfig {
        api_base_url: "https://mixpay.test".to_string(),
        payee_id: TEST_PAYEE_ID.to_string(),
        settlement_asset_id: "usdt".to_string(),
        callback_url: "https://api.test/crypto/callback".to_string(),
        return_url: "https://app.test/crypto/return".to_string(),
        payment_url_template: "https://mixpay.me/code/{code}".to_string(),
        default_quote_asset: "usd".to_string(),
        allowlist_enabled: false,
        callback_ips: Vec::new(),
    }
}

// =============================================================================
// Fiat gateway
// =============================================================================

/// `None` in a reply slot simulates a transport failure.
pub(crate) struct FakeFiatGateway {
    token_reply: Mutex<Option<GatewayReply>>,
    initialize_reply: Mutex<Option<GatewayReply>>,
    status_reply: Mutex<Option<GatewayReply>>,
    token_delay: Duration,
    pub token_calls: AtomicUsize,
    pub initialize_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub last_initialize: Mutex<Option<(String, String, Value)>>,
    pub last_status_hash: Mutex<Option<String>>,
}

impl FakeFiatGateway {
    pub fn new() -> Self {
        let expires = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        Self {
            token_reply: Mutex::new(Some(GatewayReply::new(
                200,
                json!({"token": "bearer-1", "expireDate": expires}).to_string(),
            ))),
            initialize_reply: Mutex::new(Some(GatewayReply::new(
                200,
                json!({"TransactionId": "EPS123", "RedirectURL": "https://pay.eps.test/EPS123"})
                    .to_string(),
            ))),
            status_reply: Mutex::new(Some(Self::status_body("Success"))),
            token_delay: Duration::ZERO,
            token_calls: AtomicUsize::new(0),
            initialize_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            last_initialize: Mutex::new(None),
            last_status_hash: Mutex::new(None),
        }
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn status_body(status: &str) -> GatewayReply {
        GatewayReply::new(
            200,
            json!({
                "Status": status,
                "FinancialEntity": "bKash",
                "TotalAmount": "100.00",
                "TransactionDate": "2026-05-01 10:00:00"
            })
            .to_string(),
        )
    }

    pub fn set_token(&self, reply: Option<GatewayReply>) {
        *self.token_reply.lock().unwrap() = reply;
    }

    pub fn set_initialize(&self, reply: Option<GatewayReply>) {
        *self.initialize_reply.lock().unwrap() = reply;
    }

    pub fn set_status(&self, reply: Option<GatewayReply>) {
        *self.status_reply.lock().unwrap() = reply;
    }

    pub fn token_calls(&self) -> usize {
        self.token_calls.load(Ordering::SeqCst)
    }

    pub fn initialize_calls(&self) -> usize {
        self.initialize_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FiatGateway for FakeFiatGateway {
    async fn get_token(
        &self,
        _x_hash: &str,
        _user_name: &str,
        _password: &str,
    ) -> Result<GatewayReply, EpsError> {
        self.token_calls.fetch_add(1, Ordering::SeqCst);
        if !self.token_delay.is_zero() {
            tokio::time::sleep(self.token_delay).await;
        }
        self.token_reply
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| EpsError::Request("connection refused".to_string()))
    }

    async fn initialize(
        &self,
        x_hash: &str,
        bearer_token: &str,
        payload: &Value,
    ) -> Result<GatewayReply, EpsError> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_initialize.lock().unwrap() =
            Some((x_hash.to_string(), bearer_token.to_string(), payload.clone()));
        self.initialize_reply
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| EpsError::Request("operation timed out".to_string()))
    }

    async fn check_status(
        &self,
        x_hash: &str,
        _bearer_token: &str,
        _merchant_transaction_id: &str,
    ) -> Result<GatewayReply, EpsError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_status_hash.lock().unwrap() = Some(x_hash.to_string());
        self.status_reply
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| EpsError::Request("operation timed out".to_string()))
    }
}

// =============================================================================
// Crypto gateway
// =============================================================================

pub(crate) struct FakeCryptoGateway {
    create_reply: Mutex<Option<GatewayReply>>,
    result_replies: Mutex<VecDeque<GatewayReply>>,
    default_result: Mutex<Option<GatewayReply>>,
    pub create_calls: AtomicUsize,
    pub result_calls: AtomicUsize,
    pub last_form: Mutex<Vec<(String, String)>>,
}

impl FakeCryptoGateway {
    pub fn new() -> Self {
        Self {
            create_reply: Mutex::new(Some(GatewayReply::new(
                200,
                json!({"code": 0, "success": true, "message": "", "data": {"code": "abc123"}})
                    .to_string(),
            ))),
            result_replies: Mutex::new(VecDeque::new()),
            default_result: Mutex::new(Some(Self::settled("10.0000", "usd", TEST_PAYEE_ID))),
            create_calls: AtomicUsize::new(0),
            result_calls: AtomicUsize::new(0),
            last_form: Mutex::new(Vec::new()),
        }
    }

    /// A settled `payments_result` reply.
    pub fn settled(quote_amount: &str, quote_asset: &str, payee_id: &str) -> GatewayReply {
        GatewayReply::new(
            200,
            json!({
                "code": 0,
                "success": true,
                "data": {
                    "status": "success",
                    "traceId": "trace-1",
                    "payeeId": payee_id,
                    "quoteAmount": quote_amount,
                    "quoteAssetId": quote_asset,
                    "paymentAssetId": "btc",
                    "paymentAmount": "0.00015",
                    "txid": "0xabc",
                    "blockExplorerUrl": "https://explorer.test/tx/0xabc"
                }
            })
            .to_string(),
        )
    }

    pub fn set_create(&self, reply: Option<GatewayReply>) {
        *self.create_reply.lock().unwrap() = reply;
    }

    pub fn set_result(&self, reply: Option<GatewayReply>) {
        *self.default_result.lock().unwrap() = reply;
    }

    pub fn push_result(&self, reply: GatewayReply) {
        self.result_replies.lock().unwrap().push_back(reply);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn result_calls(&self) -> usize {
        self.result_calls.load(Ordering::SeqCst)
    }

    pub fn form_value(&self, key: &str) -> Option<String> {
        self.last_form
            .lock()
            .unwrap()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }
}

#[async_trait]
impl CryptoGateway for FakeCryptoGateway {
    async fn create_one_time_payment(
        &self,
        form: &[(&str, String)],
    ) -> Result<GatewayReply, MixPayError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_form.lock().unwrap() = form
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        self.create_reply
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| MixPayError::Request("connection refused".to_string()))
    }

    async fn payment_result(
        &self,
        _order_id: &str,
        _payee_id: &str,
    ) -> Result<GatewayReply, MixPayError> {
        self.result_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reply) = self.result_replies.lock().unwrap().pop_front() {
            return Ok(reply);
        }
        self.default_result
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| MixPayError::Request("connection refused".to_string()))
    }
}

// =============================================================================
// Reseller
// =============================================================================

pub(crate) struct FakeReseller {
    succeed: AtomicBool,
    pub calls: AtomicUsize,
    pub grants: Mutex<Vec<(String, Decimal)>>,
}

impl FakeReseller {
    pub fn accepting() -> Self {
        Self {
            succeed: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            grants: Mutex::new(Vec::new()),
        }
    }

    pub fn refusing() -> Self {
        Self {
            succeed: AtomicBool::new(false),
            ..Self::accepting()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_succeed(&self, succeed: bool) {
        self.succeed.store(succeed, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResellerProvisioning for FakeReseller {
    async fn grant_balance(&self, account: &str, balance: Decimal) -> BalanceGrant {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.grants
            .lock()
            .unwrap()
            .push((account.to_string(), balance));
        if self.succeed.load(Ordering::SeqCst) {
            BalanceGrant::granted("Balance granted")
        } else {
            BalanceGrant::refused("Reseller rejected balance grant (HTTP_500): upstream down")
        }
    }
}
