// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Configuration is loaded from the environment at startup. Missing merchant
//! credentials are a deployment defect and fail startup with
//! [`ConfigError::Missing`]. Numeric settings outside their accepted range
//! (zero, negative or absurdly large) fail with [`ConfigError::Invalid`].
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Directory holding the payment database | `./data` |
//! | `EPS_BASE_URL` | Fiat gateway API root | `https://sandboxpgapi.eps.com.bd` |
//! | `EPS_USERNAME` | Fiat gateway merchant username | Required |
//! | `EPS_PASSWORD` | Fiat gateway merchant password | Required |
//! | `EPS_HASH_KEY` | HMAC key for the `x-hash` header | Required |
//! | `EPS_MERCHANT_ID` | Merchant id sent on initialize | Required |
//! | `EPS_STORE_ID` | Store id sent on initialize | Required |
//! | `EPS_SUCCESS_URL` | Success callback for package checkouts | `https://api.realproxy.net/api/Payment/callback/success` |
//! | `EPS_FAIL_URL` | Fail callback for package checkouts | `https://api.realproxy.net/api/Payment/callback/fail` |
//! | `EPS_CANCEL_URL` | Cancel callback for package checkouts | `https://api.realproxy.net/api/Payment/callback/cancel` |
//! | `EPS_FRONTEND_URL` | Frontend root used for callback redirects | `http://localhost:3002` |
//! | `PAYMENT_TTL_HOURS` | Lifetime of a new fiat payment | `24` |
//! | `MIXPAY_API_BASE_URL` | Crypto gateway API root | `https://api.mixpay.me` |
//! | `MIXPAY_PAYEE_ID` | Merchant payee id | Required |
//! | `MIXPAY_SETTLEMENT_ASSET_ID` | Settlement asset id | Required |
//! | `MIXPAY_CALLBACK_URL` | Webhook URL handed to the gateway | Required |
//! | `MIXPAY_RETURN_URL` | Browser return URL after payment | Required |
//! | `MIXPAY_PAYMENT_URL_TEMPLATE` | Browsable payment URL, `{code}` is substituted | `https://mixpay.me/code/{code}` |
//! | `MIXPAY_DEFAULT_QUOTE_ASSET` | Quote asset when none is given | `usd` |
//! | `MIXPAY_CALLBACK_IP_ALLOWLIST_ENABLED` | Enforce the webhook source allowlist | `false` |
//! | `MIXPAY_CALLBACK_IPS` | Comma-separated gateway egress IPs | empty |
//! | `RESELLER_API_BASE_URL` | Proxy reseller API root | `https://reseller.evomi.com` |
//! | `RESELLER_API_KEY` | Proxy reseller API key | Required |
//! | `RESELLER_BALANCE_MULTIPLIER` | Balance granted per currency unit paid | `8` |
//! | `GATEWAY_TIMEOUT_SECS` | Timeout for every outbound call | `20` |
//! | `EXPIRY_THRESHOLD_MINUTES` | Age after which pending fiat payments expire | `1440` |
//! | `EXPIRY_SWEEP_INTERVAL_SECS` | Period of the expiry sweeper | `300` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info` |

use std::{net::IpAddr, ops::RangeInclusive, path::PathBuf, str::FromStr, time::Duration};

use rust_decimal::Decimal;

pub const DATA_DIR_ENV: &str = "DATA_DIR";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_EPS_BASE_URL: &str = "https://sandboxpgapi.eps.com.bd";
const DEFAULT_EPS_SUCCESS_URL: &str = "https://api.realproxy.net/api/Payment/callback/success";
const DEFAULT_EPS_FAIL_URL: &str = "https://api.realproxy.net/api/Payment/callback/fail";
const DEFAULT_EPS_CANCEL_URL: &str = "https://api.realproxy.net/api/Payment/callback/cancel";
const DEFAULT_FRONTEND_URL: &str = "http://localhost:3002";
const DEFAULT_PAYMENT_TTL_HOURS: i64 = 24;
const DEFAULT_MIXPAY_API_BASE_URL: &str = "https://api.mixpay.me";
const DEFAULT_MIXPAY_PAYMENT_URL_TEMPLATE: &str = "https://mixpay.me/code/{code}";
const DEFAULT_QUOTE_ASSET: &str = "usd";
const DEFAULT_RESELLER_API_BASE_URL: &str = "https://reseller.evomi.com";
const DEFAULT_BALANCE_MULTIPLIER: i64 = 8;
const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 20;
const DEFAULT_EXPIRY_THRESHOLD_MINUTES: i64 = 1440;
const DEFAULT_EXPIRY_SWEEP_INTERVAL_SECS: u64 = 300;

const PAYMENT_TTL_HOURS_RANGE: RangeInclusive<i64> = 1..=8_760;
const GATEWAY_TIMEOUT_SECS_RANGE: RangeInclusive<u64> = 1..=300;
const EXPIRY_THRESHOLD_MINUTES_RANGE: RangeInclusive<i64> = 1..=525_600;
const EXPIRY_SWEEP_INTERVAL_SECS_RANGE: RangeInclusive<u64> = 1..=86_400;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required configuration missing: {0}")]
    Missing(String),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: String, value: String },
}

/// Fiat gateway merchant configuration.
#[derive(Debug, Clone)]
pub struct EpsConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub hash_key: String,
    pub merchant_id: String,
    pub store_id: String,
    pub success_url: String,
    pub fail_url: String,
    pub cancel_url: String,
    pub frontend_url: String,
    pub payment_ttl: chrono::Duration,
}

impl EpsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: env_or_default("EPS_BASE_URL", DEFAULT_EPS_BASE_URL),
            username: env_required("EPS_USERNAME")?,
            password: env_required("EPS_PASSWORD")?,
            hash_key: env_required("EPS_HASH_KEY")?,
            merchant_id: env_required("EPS_MERCHANT_ID")?,
            store_id: env_required("EPS_STORE_ID")?,
            success_url: env_or_default("EPS_SUCCESS_URL", DEFAULT_EPS_SUCCESS_URL),
            fail_url: env_or_default("EPS_FAIL_URL", DEFAULT_EPS_FAIL_URL),
            cancel_url: env_or_default("EPS_CANCEL_URL", DEFAULT_EPS_CANCEL_URL),
            frontend_url: env_or_default("EPS_FRONTEND_URL", DEFAULT_FRONTEND_URL),
            payment_ttl: chrono::Duration::hours(env_bounded(
                "PAYMENT_TTL_HOURS",
                DEFAULT_PAYMENT_TTL_HOURS,
                PAYMENT_TTL_HOURS_RANGE,
            )?),
        })
    }
}

/// Crypto gateway merchant configuration.
#[derive(Debug, Clone)]
pub struct MixPayConfig {
    pub api_base_url: String,
    pub payee_id: String,
    pub settlement_asset_id: String,
    pub callback_url: String,
    pub return_url: String,
    pub payment_url_template: String,
    pub default_quote_asset: String,
    pub allowlist_enabled: bool,
    pub callback_ips: Vec<IpAddr>,
}

impl MixPayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_base_url: env_or_default("MIXPAY_API_BASE_URL", DEFAULT_MIXPAY_API_BASE_URL),
            payee_id: env_required("MIXPAY_PAYEE_ID")?,
            settlement_asset_id: env_required("MIXPAY_SETTLEMENT_ASSET_ID")?,
            callback_url: env_required("MIXPAY_CALLBACK_URL")?,
            return_url: env_required("MIXPAY_RETURN_URL")?,
            payment_url_template: env_or_default(
                "MIXPAY_PAYMENT_URL_TEMPLATE",
                DEFAULT_MIXPAY_PAYMENT_URL_TEMPLATE,
            ),
            default_quote_asset: env_or_default("MIXPAY_DEFAULT_QUOTE_ASSET", DEFAULT_QUOTE_ASSET),
            allowlist_enabled: env_parse_or("MIXPAY_CALLBACK_IP_ALLOWLIST_ENABLED", false)?,
            callback_ips: parse_ip_list(
                "MIXPAY_CALLBACK_IPS",
                &env_optional("MIXPAY_CALLBACK_IPS").unwrap_or_default(),
            )?,
        })
    }
}

/// Proxy reseller API configuration.
#[derive(Debug, Clone)]
pub struct ResellerConfig {
    pub api_base_url: String,
    pub api_key: String,
    pub balance_multiplier: Decimal,
}

impl ResellerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_base_url: env_or_default("RESELLER_API_BASE_URL", DEFAULT_RESELLER_API_BASE_URL),
            api_key: env_required("RESELLER_API_KEY")?,
            balance_multiplier: env_parse_or(
                "RESELLER_BALANCE_MULTIPLIER",
                Decimal::from(DEFAULT_BALANCE_MULTIPLIER),
            )?,
        })
    }
}

/// Process-level settings for the worker binary.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub data_dir: PathBuf,
    pub gateway_timeout: Duration,
    pub expiry_threshold_minutes: i64,
    pub expiry_sweep_interval: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            data_dir: PathBuf::from(env_or_default(DATA_DIR_ENV, DEFAULT_DATA_DIR)),
            gateway_timeout: Duration::from_secs(env_bounded(
                "GATEWAY_TIMEOUT_SECS",
                DEFAULT_GATEWAY_TIMEOUT_SECS,
                GATEWAY_TIMEOUT_SECS_RANGE,
            )?),
            expiry_threshold_minutes: env_bounded(
                "EXPIRY_THRESHOLD_MINUTES",
                DEFAULT_EXPIRY_THRESHOLD_MINUTES,
                EXPIRY_THRESHOLD_MINUTES_RANGE,
            )?,
            expiry_sweep_interval: Duration::from_secs(env_bounded(
                "EXPIRY_SWEEP_INTERVAL_SECS",
                DEFAULT_EXPIRY_SWEEP_INTERVAL_SECS,
                EXPIRY_SWEEP_INTERVAL_SECS_RANGE,
            )?),
        })
    }

    /// Path of the redb payment database inside the data directory.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("payments.redb")
    }
}

pub fn env_required(name: &str) -> Result<String, ConfigError> {
    env_optional(name).ok_or_else(|| ConfigError::Missing(name.to_string()))
}

pub fn env_optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn env_or_default(name: &str, default: &str) -> String {
    env_optional(name).unwrap_or_else(|| default.to_string())
}

pub fn env_parse_or<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env_optional(name) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            name: name.to_string(),
            value: raw,
        }),
        None => Ok(default),
    }
}

/// Like [`env_parse_or`], but the value must also fall inside `range`.
pub fn env_bounded<T>(name: &str, default: T, range: RangeInclusive<T>) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + ToString,
{
    check_bounded(name, env_parse_or(name, default)?, &range)
}

fn check_bounded<T>(name: &str, value: T, range: &RangeInclusive<T>) -> Result<T, ConfigError>
where
    T: PartialOrd + ToString,
{
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            name: name.to_string(),
            value: value.to_string(),
        })
    }
}

fn parse_ip_list(name: &str, raw: &str) -> Result<Vec<IpAddr>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry.parse().map_err(|_| ConfigError::Invalid {
                name: name.to_string(),
                value: entry.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ip_list_skips_blank_entries() {
        let ips = parse_ip_list("X", " 10.0.0.1, ,2001:db8::1,").unwrap();
        assert_eq!(ips.len(), 2);
        assert_eq!(ips[0], "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn parse_ip_list_rejects_garbage() {
        let err = parse_ip_list("MIXPAY_CALLBACK_IPS", "10.0.0.1,not-an-ip").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref value, .. } if value == "not-an-ip"));
    }

    #[test]
    fn missing_required_variable_is_reported_by_name() {
        let err = env_required("PROXY_PAYMENTS_TEST_UNSET_VARIABLE").unwrap_err();
        assert_eq!(
            err.to_string(),
            "required configuration missing: PROXY_PAYMENTS_TEST_UNSET_VARIABLE"
        );
    }

    #[test]
    fn env_parse_or_falls_back_to_default() {
        let value: u64 = env_parse_or("PROXY_PAYMENTS_TEST_UNSET_NUMBER", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn bounded_values_reject_zero_negative_and_huge() {
        let threshold = &EXPIRY_THRESHOLD_MINUTES_RANGE;
        assert_eq!(check_bounded("EXPIRY_THRESHOLD_MINUTES", 1440, threshold).unwrap(), 1440);
        for bad in [0, -60, i64::MAX] {
            let err = check_bounded("EXPIRY_THRESHOLD_MINUTES", bad, threshold).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { ref value, .. } if *value == bad.to_string()));
        }

        let interval = &EXPIRY_SWEEP_INTERVAL_SECS_RANGE;
        assert!(check_bounded("EXPIRY_SWEEP_INTERVAL_SECS", 0, interval).is_err());
        assert!(check_bounded("PAYMENT_TTL_HOURS", i64::MAX, &PAYMENT_TTL_HOURS_RANGE).is_err());
        assert!(check_bounded("GATEWAY_TIMEOUT_SECS", 0, &GATEWAY_TIMEOUT_SECS_RANGE).is_err());
    }

    #[test]
    fn bounded_default_is_used_when_unset() {
        let value = env_bounded("PROXY_PAYMENTS_TEST_UNSET_BOUNDED", 300u64, 1..=86_400).unwrap();
        assert_eq!(value, 300);
    }

    #[test]
    fn database_path_lives_in_data_dir() {
        let config = WorkerConfig {
            data_dir: PathBuf::from("/var/lib/payments"),
            gateway_timeout: Duration::from_secs(1),
            expiry_threshold_minutes: 1440,
            expiry_sweep_interval: Duration::from_secs(1),
        };
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/payments/payments.redb")
        );
    }
}
