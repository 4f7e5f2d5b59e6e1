// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Outbound integrations: fiat gateway, crypto gateway and proxy reseller.
//!
//! Each integration is a trait so the orchestrators can run against
//! in-process fakes in tests. Clients return the raw HTTP status and body;
//! interpretation (and audit logging of the raw body) is the caller's job.

pub mod eps;
pub mod mixpay;
pub mod reseller;

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

/// Raw HTTP reply from an upstream service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayReply {
    pub status: u16,
    pub body: String,
}

impl GatewayReply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body parsed as JSON, if it is JSON.
    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.body).ok()
    }

    /// Error code for a non-success reply, e.g. `HTTP_401`.
    pub fn upstream_code(&self) -> String {
        format!("HTTP_{}", self.status)
    }

    /// Read the whole reply. A body that cannot be read is a transport
    /// failure, not an empty reply.
    pub(crate) async fn from_response(response: reqwest::Response) -> Result<Self, reqwest::Error> {
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(Self { status, body })
    }
}

pub(crate) fn build_http_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder().timeout(timeout).build()
}

// =============================================================================
// Defensive field extraction
// =============================================================================
//
// Upstream gateways do not guarantee every field, nor a stable key casing.
// Each field is read on its own so one missing or oddly typed value never
// prevents reading the others.

/// Look up `key` in a JSON object, ignoring ASCII case.
pub(crate) fn lookup<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    let object = value.as_object()?;
    object.get(key).or_else(|| {
        object
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    })
}

/// Read a field as a non-empty string. Numbers and booleans are stringified.
pub(crate) fn string_field(value: &Value, key: &str) -> Option<String> {
    match lookup(value, key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Read a field as a boolean, accepting `"true"`/`"false"` strings.
pub(crate) fn bool_field(value: &Value, key: &str) -> Option<bool> {
    match lookup(value, key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_ignores_key_case() {
        let body = json!({"TransactionId": "EPS123"});
        assert_eq!(string_field(&body, "transactionId").as_deref(), Some("EPS123"));
        assert_eq!(string_field(&body, "TransactionId").as_deref(), Some("EPS123"));
    }

    #[test]
    fn string_field_accepts_numbers_and_skips_blank() {
        let body = json!({"amount": 10.5, "blank": "  ", "nothing": null});
        assert_eq!(string_field(&body, "amount").as_deref(), Some("10.5"));
        assert_eq!(string_field(&body, "blank"), None);
        assert_eq!(string_field(&body, "nothing"), None);
        assert_eq!(string_field(&body, "absent"), None);
    }

    #[test]
    fn fields_on_non_objects_are_absent() {
        assert_eq!(string_field(&json!([1, 2]), "a"), None);
        assert_eq!(bool_field(&json!("true"), "a"), None);
    }

    #[test]
    fn bool_field_accepts_strings() {
        let body = json!({"success": "true", "flag": false});
        assert_eq!(bool_field(&body, "success"), Some(true));
        assert_eq!(bool_field(&body, "flag"), Some(false));
    }

    #[test]
    fn reply_classifies_status() {
        assert!(GatewayReply::new(200, "{}").is_success());
        let reply = GatewayReply::new(401, "nope");
        assert!(!reply.is_success());
        assert_eq!(reply.upstream_code(), "HTTP_401");
        assert!(reply.json().is_none());
    }
}
