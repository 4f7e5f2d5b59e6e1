// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! EPS fiat payment gateway integration.
//!
//! Three calls make up the protocol, each authenticated with an `x-hash`
//! header (see [`crate::signing`]):
//!
//! 1. `POST /v1/Auth/GetToken` issues a bearer token.
//! 2. `POST /v1/EPSEngine/InitializeEPS` registers a payment and returns
//!    the hosted checkout URL.
//! 3. `GET /v1/EPSEngine/CheckMerchantTransactionStatus` reports the
//!    authoritative status of a merchant transaction.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::Client;
use serde_json::{json, Value};

use super::{build_http_client, string_field, GatewayReply};

const TOKEN_PATH: &str = "/v1/Auth/GetToken";
const INITIALIZE_PATH: &str = "/v1/EPSEngine/InitializeEPS";
const STATUS_PATH: &str = "/v1/EPSEngine/CheckMerchantTransactionStatus";

#[derive(Debug, thiserror::Error)]
pub enum EpsError {
    #[error("EPS client setup failed: {0}")]
    Setup(String),

    #[error("EPS request failed: {0}")]
    Request(String),
}

/// Transport to the fiat gateway.
///
/// Implementations only move bytes; signing and token handling belong to
/// the orchestrator.
#[async_trait]
pub trait FiatGateway: Send + Sync {
    async fn get_token(
        &self,
        x_hash: &str,
        user_name: &str,
        password: &str,
    ) -> Result<GatewayReply, EpsError>;

    async fn initialize(
        &self,
        x_hash: &str,
        bearer_token: &str,
        payload: &Value,
    ) -> Result<GatewayReply, EpsError>;

    async fn check_status(
        &self,
        x_hash: &str,
        bearer_token: &str,
        merchant_transaction_id: &str,
    ) -> Result<GatewayReply, EpsError>;
}

#[derive(Debug, Clone)]
pub struct EpsClient {
    base_url: String,
    http: Client,
}

impl EpsClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, EpsError> {
        let http = build_http_client(timeout)
            .map_err(|e| EpsError::Setup(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl FiatGateway for EpsClient {
    async fn get_token(
        &self,
        x_hash: &str,
        user_name: &str,
        password: &str,
    ) -> Result<GatewayReply, EpsError> {
        let response = self
            .http
            .post(self.url(TOKEN_PATH))
            .header("x-hash", x_hash)
            .json(&json!({ "userName": user_name, "password": password }))
            .send()
            .await
            .map_err(|e| EpsError::Request(format!("token request failed: {e}")))?;
        GatewayReply::from_response(response)
            .await
            .map_err(|e| EpsError::Request(format!("token response unreadable: {e}")))
    }

    async fn initialize(
        &self,
        x_hash: &str,
        bearer_token: &str,
        payload: &Value,
    ) -> Result<GatewayReply, EpsError> {
        let response = self
            .http
            .post(self.url(INITIALIZE_PATH))
            .header("x-hash", x_hash)
            .bearer_auth(bearer_token)
            .json(payload)
            .send()
            .await
            .map_err(|e| EpsError::Request(format!("initialize request failed: {e}")))?;
        GatewayReply::from_response(response)
            .await
            .map_err(|e| EpsError::Request(format!("initialize response unreadable: {e}")))
    }

    async fn check_status(
        &self,
        x_hash: &str,
        bearer_token: &str,
        merchant_transaction_id: &str,
    ) -> Result<GatewayReply, EpsError> {
        let response = self
            .http
            .get(self.url(STATUS_PATH))
            .query(&[("merchantTransactionId", merchant_transaction_id)])
            .header("x-hash", x_hash)
            .bearer_auth(bearer_token)
            .send()
            .await
            .map_err(|e| EpsError::Request(format!("status request failed: {e}")))?;
        GatewayReply::from_response(response)
            .await
            .map_err(|e| EpsError::Request(format!("status response unreadable: {e}")))
    }
}

// =============================================================================
// Response parsing
// =============================================================================

/// Parsed `GetToken` body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenGrant {
    pub token: Option<String>,
    /// Raw expiry string as sent by the gateway.
    pub expire_date: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl TokenGrant {
    pub fn parse(body: &Value) -> Self {
        Self {
            token: string_field(body, "token"),
            expire_date: string_field(body, "expireDate"),
            error_code: string_field(body, "errorCode"),
            error_message: string_field(body, "errorMessage"),
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expire_date.as_deref().and_then(parse_gateway_datetime)
    }
}

/// Parsed `InitializeEPS` body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitializeReply {
    pub transaction_id: Option<String>,
    pub redirect_url: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl InitializeReply {
    pub fn parse(body: &Value) -> Self {
        Self {
            transaction_id: string_field(body, "transactionId"),
            redirect_url: string_field(body, "redirectURL"),
            error_code: string_field(body, "errorCode"),
            error_message: string_field(body, "errorMessage"),
        }
    }
}

/// Parsed `CheckMerchantTransactionStatus` body. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionStatusReport {
    pub merchant_transaction_id: Option<String>,
    pub status: Option<String>,
    pub total_amount: Option<String>,
    pub transaction_date: Option<String>,
    pub transaction_type: Option<String>,
    pub financial_entity: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub customer_id: Option<String>,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub customer_address: Option<String>,
    pub customer_city: Option<String>,
    pub customer_state: Option<String>,
    pub customer_postcode: Option<String>,
    pub customer_country: Option<String>,
    pub product_name: Option<String>,
    pub product_profile: Option<String>,
    pub product_category: Option<String>,
    pub value_a: Option<String>,
    pub value_b: Option<String>,
    pub value_c: Option<String>,
    pub value_d: Option<String>,
}

impl TransactionStatusReport {
    pub fn parse(body: &Value) -> Self {
        Self {
            merchant_transaction_id: string_field(body, "merchantTransactionId"),
            status: string_field(body, "status"),
            total_amount: string_field(body, "totalAmount"),
            transaction_date: string_field(body, "transactionDate"),
            transaction_type: string_field(body, "transactionType"),
            financial_entity: string_field(body, "financialEntity"),
            error_code: string_field(body, "errorCode"),
            error_message: string_field(body, "errorMessage"),
            customer_id: string_field(body, "customerId"),
            customer_name: string_field(body, "customerName"),
            customer_email: string_field(body, "customerEmail"),
            customer_phone: string_field(body, "customerPhone"),
            customer_address: string_field(body, "customerAddress"),
            customer_city: string_field(body, "customerCity"),
            customer_state: string_field(body, "customerState"),
            customer_postcode: string_field(body, "customerPostcode"),
            customer_country: string_field(body, "customerCountry"),
            product_name: string_field(body, "productName"),
            product_profile: string_field(body, "productProfile"),
            product_category: string_field(body, "productCategory"),
            value_a: string_field(body, "valueA"),
            value_b: string_field(body, "valueB"),
            value_c: string_field(body, "valueC"),
            value_d: string_field(body, "valueD"),
        }
    }
}

/// Parse a gateway timestamp. Offset-less values are taken as UTC.
pub fn parse_gateway_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%m/%d/%Y %I:%M:%S %p",
        "%d %b %Y %I:%M:%S %p",
    ];
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::{Read, Write};

    /// Answer one HTTP request on a local socket with `reply`, then hang up.
    fn serve_once(reply: &'static str) -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let read = stream.read(&mut buf).unwrap();
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..read]);
            }
            stream.write_all(reply.as_bytes()).unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn complete_reply_is_returned_verbatim() {
        let base = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}",
        );
        let client = EpsClient::new(&base, Duration::from_secs(5)).unwrap();

        let reply = client.check_status("hash", "token", "TXN_ABCDEFGHIJ").await.unwrap();
        assert_eq!(reply, GatewayReply::new(200, "{}"));
    }

    #[tokio::test]
    async fn truncated_body_is_a_transport_error() {
        let base = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\n{\"Status\"",
        );
        let client = EpsClient::new(&base, Duration::from_secs(5)).unwrap();

        let err = client
            .check_status("hash", "token", "TXN_ABCDEFGHIJ")
            .await
            .unwrap_err();
        assert!(matches!(err, EpsError::Request(ref message) if message.contains("unreadable")));
    }

    #[test]
    fn token_grant_reads_fields_in_any_case() {
        let grant = TokenGrant::parse(&json!({
            "Token": "abc",
            "ExpireDate": "2026-05-01T10:00:00Z",
            "errorCode": null
        }));
        assert_eq!(grant.token.as_deref(), Some("abc"));
        assert_eq!(
            grant.expires_at(),
            Some(Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap())
        );
        assert!(grant.error_code.is_none());
    }

    #[test]
    fn initialize_reply_tolerates_missing_fields() {
        let reply = InitializeReply::parse(&json!({"TransactionId": "EPS123"}));
        assert_eq!(reply.transaction_id.as_deref(), Some("EPS123"));
        assert!(reply.redirect_url.is_none());

        let reply = InitializeReply::parse(&json!({
            "errorCode": "E01",
            "errorMessage": "Invalid store"
        }));
        assert!(reply.transaction_id.is_none());
        assert_eq!(reply.error_message.as_deref(), Some("Invalid store"));
    }

    #[test]
    fn status_report_parses_independently() {
        let report = TransactionStatusReport::parse(&json!({
            "Status": "Success",
            "TotalAmount": 100.0,
            "FinancialEntity": "bKash",
            "CustomerName": ["unexpected", "array"]
        }));
        assert_eq!(report.status.as_deref(), Some("Success"));
        assert_eq!(report.total_amount.as_deref(), Some("100.0"));
        assert_eq!(report.financial_entity.as_deref(), Some("bKash"));
        assert!(report.customer_name.is_none());
    }

    #[test]
    fn gateway_datetime_formats() {
        let expected = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(parse_gateway_datetime("2026-05-01T10:00:00"), Some(expected));
        assert_eq!(parse_gateway_datetime("2026-05-01 10:00:00"), Some(expected));
        assert_eq!(parse_gateway_datetime("2026-05-01T12:00:00+02:00"), Some(expected));
        assert_eq!(parse_gateway_datetime("05/01/2026 10:00:00 AM"), Some(expected));
        assert_eq!(parse_gateway_datetime("tomorrow"), None);
    }

    #[test]
    fn client_trims_trailing_slash() {
        let client = EpsClient::new("https://sandboxpgapi.eps.com.bd/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.url(TOKEN_PATH),
            "https://sandboxpgapi.eps.com.bd/v1/Auth/GetToken"
        );
    }
}
