// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Proxy reseller provisioning.
//!
//! The payment core only grants balance to an existing sub-account after a
//! confirmed fiat payment. Account creation lives outside this crate.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::json;

use super::{build_http_client, string_field, GatewayReply};

const GIVE_BALANCE_PATH: &str = "/v2/reseller/sub_users/give_balance";

#[derive(Debug, thiserror::Error)]
pub enum ResellerError {
    #[error("reseller client setup failed: {0}")]
    Setup(String),
}

/// Outcome of a balance grant. Failures are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceGrant {
    pub success: bool,
    pub message: String,
}

impl BalanceGrant {
    pub fn granted(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }

    /// Interpret a raw reseller reply.
    pub fn from_reply(reply: &GatewayReply) -> Self {
        if reply.is_success() {
            let message = reply
                .json()
                .and_then(|body| string_field(&body, "message"))
                .unwrap_or_else(|| "Balance granted".to_string());
            Self::granted(message)
        } else {
            Self::refused(format!(
                "Reseller rejected balance grant ({}): {}",
                reply.upstream_code(),
                reply.body
            ))
        }
    }
}

#[async_trait]
pub trait ResellerProvisioning: Send + Sync {
    async fn grant_balance(&self, account: &str, balance: Decimal) -> BalanceGrant;
}

#[derive(Debug, Clone)]
pub struct ResellerClient {
    base_url: String,
    api_key: String,
    http: Client,
}

impl ResellerClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, ResellerError> {
        let http = build_http_client(timeout)
            .map_err(|e| ResellerError::Setup(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http,
        })
    }
}

#[async_trait]
impl ResellerProvisioning for ResellerClient {
    async fn grant_balance(&self, account: &str, balance: Decimal) -> BalanceGrant {
        let result = self
            .http
            .put(format!("{}{GIVE_BALANCE_PATH}", self.base_url))
            .header("X-API-KEY", &self.api_key)
            .json(&json!({ "username": account, "balance": balance }))
            .send()
            .await;

        match result {
            Ok(response) => match GatewayReply::from_response(response).await {
                Ok(reply) => BalanceGrant::from_reply(&reply),
                Err(e) => BalanceGrant::refused(format!("Error reading reseller API reply: {e}")),
            },
            Err(e) => BalanceGrant::refused(format!("Error calling reseller API: {e}")),
        }
    }
}
