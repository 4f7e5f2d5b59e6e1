// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Gateway Token Cache
//!
//! Holds the fiat gateway's bearer token for the life of the process.
//!
//! A cached token is considered valid until five minutes before the
//! gateway's stated expiry. Tokens issued with five minutes or less left are
//! cached for one minute. When the gateway's expiry cannot be parsed the
//! token is cached for one hour.
//!
//! Refreshes are serialized by a dedicated mutex and re-check the cache after
//! acquiring it, so a burst of cold-cache callers results in a single token
//! request.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::EpsConfig;
use crate::error::PaymentError;
use crate::providers::eps::{FiatGateway, TokenGrant};
use crate::signing::sign;

const SAFETY_MARGIN_MINUTES: i64 = 5;
const MIN_LIFETIME_MINUTES: i64 = 1;
const DEFAULT_LIFETIME_MINUTES: i64 = 60;

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    valid_until: DateTime<Utc>,
}

/// How long a token issued at `now` may be served from cache.
pub fn cache_lifetime(now: DateTime<Utc>, gateway_expiry: Option<DateTime<Utc>>) -> Duration {
    let Some(expiry) = gateway_expiry else {
        return Duration::minutes(DEFAULT_LIFETIME_MINUTES);
    };
    let margin = Duration::minutes(SAFETY_MARGIN_MINUTES);
    let remaining = expiry - now;
    if remaining > margin {
        remaining - margin
    } else {
        Duration::minutes(MIN_LIFETIME_MINUTES)
    }
}

pub struct GatewayTokenCache {
    gateway: Arc<dyn FiatGateway>,
    username: String,
    password: String,
    hash_key: String,
    cached: RwLock<Option<CachedToken>>,
    refresh: Mutex<()>,
}

impl GatewayTokenCache {
    pub fn new(gateway: Arc<dyn FiatGateway>, config: &EpsConfig) -> Self {
        Self {
            gateway,
            username: config.username.clone(),
            password: config.password.clone(),
            hash_key: config.hash_key.clone(),
            cached: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    /// Return a valid bearer token, fetching a new one if needed.
    pub async fn get_token(&self) -> Result<String, PaymentError> {
        if let Some(token) = self.cached_token(Utc::now()).await {
            return Ok(token);
        }

        let _guard = self.refresh.lock().await;
        if let Some(token) = self.cached_token(Utc::now()).await {
            return Ok(token);
        }

        let fresh = self.fetch().await?;
        let token = fresh.token.clone();
        *self.cached.write().await = Some(fresh);
        Ok(token)
    }

    /// Drop the cached token. The next caller fetches a new one.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    async fn cached_token(&self, now: DateTime<Utc>) -> Option<String> {
        self.cached
            .read()
            .await
            .as_ref()
            .filter(|cached| cached.valid_until > now)
            .map(|cached| cached.token.clone())
    }

    async fn fetch(&self) -> Result<CachedToken, PaymentError> {
        let x_hash = sign(&self.username, &self.hash_key)?;
        let reply = self
            .gateway
            .get_token(&x_hash, &self.username, &self.password)
            .await
            .map_err(|e| PaymentError::Token(e.to_string()))?;

        if !reply.is_success() {
            warn!(status = reply.status, "Fiat gateway refused token request");
            return Err(PaymentError::Token(format!(
                "{}: {}",
                reply.upstream_code(),
                reply.body
            )));
        }

        let body = reply
            .json()
            .ok_or_else(|| PaymentError::Token("token response is not JSON".to_string()))?;
        let grant = TokenGrant::parse(&body);
        let Some(token) = grant.token.clone() else {
            let message = grant
                .error_message
                .or(grant.error_code)
                .unwrap_or_else(|| "token missing from response".to_string());
            warn!(error = %message, "Fiat gateway returned no token");
            return Err(PaymentError::Token(message));
        };

        let now = Utc::now();
        let valid_until = now + cache_lifetime(now, grant.expires_at());
        info!(valid_until = %valid_until, "Fiat gateway token refreshed");

        Ok(CachedToken { token, valid_until })
    }
}
