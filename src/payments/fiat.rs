// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Fiat Payment Orchestrator
//!
//! Drives the EPS protocol: token, initialize, verify.
//!
//! ## Lifecycle
//!
//! ```text
//! Pending ──► Success
//!    │──────► Failed      (gateway rejection, fail callback)
//!    │──────► Cancelled   (cancel callback)
//!    └──────► Expired     (expiry sweep)
//! ```
//!
//! A payment is written as `Pending` with its first audit row before the
//! gateway is contacted. Every status change goes through the store's
//! conditional updates, so a terminal payment never moves again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::token_cache::GatewayTokenCache;
use crate::config::EpsConfig;
use crate::error::PaymentError;
use crate::providers::eps::{FiatGateway, InitializeReply, TransactionStatusReport};
use crate::providers::GatewayReply;
use crate::signing::{sign, verification_hash};
use crate::storage::{
    CustomerDetails, NewPayment, Payment, PaymentAction, PaymentLogEntry, PaymentMetadata,
    PaymentStatus, PaymentStore, ProductDetails, ReturnUrls, ShipmentDetails, TransactionType,
};

/// Minimum length of a caller-supplied merchant transaction id.
pub const MIN_MERCHANT_TRANSACTION_ID_LEN: usize = 10;

const DEFAULT_CURRENCY: &str = "BDT";

// =============================================================================
// Request and response types
// =============================================================================

/// One line of the gateway's optional product list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductItem {
    pub product_name: String,
    pub no_of_item: String,
    pub product_profile: Option<String>,
    pub product_category: Option<String>,
    pub product_price: String,
}

/// Full initialize request. Serialized as-is into the gateway payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializePaymentRequest {
    /// Filled from configuration when blank.
    #[serde(default)]
    pub merchant_id: String,
    #[serde(default)]
    pub store_id: String,
    pub customer_order_id: String,
    pub merchant_transaction_id: String,
    #[serde(rename = "transactionTypeId", default)]
    pub transaction_type: TransactionType,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_amount: Decimal,
    pub success_url: String,
    pub fail_url: String,
    pub cancel_url: String,
    pub customer_name: String,
    pub customer_email: String,
    #[serde(default)]
    pub customer_address: String,
    pub customer_address2: Option<String>,
    #[serde(default)]
    pub customer_city: String,
    #[serde(default)]
    pub customer_state: String,
    #[serde(default)]
    pub customer_postcode: String,
    #[serde(default)]
    pub customer_country: String,
    pub customer_phone: String,
    pub shipment_name: Option<String>,
    pub shipment_address: Option<String>,
    pub shipment_address2: Option<String>,
    pub shipment_city: Option<String>,
    pub shipment_state: Option<String>,
    pub shipment_postcode: Option<String>,
    pub shipment_country: Option<String>,
    pub value_a: Option<String>,
    pub value_b: Option<String>,
    pub value_c: Option<String>,
    pub value_d: Option<String>,
    pub shipping_method: Option<String>,
    pub no_of_item: Option<String>,
    pub product_name: String,
    pub product_profile: Option<String>,
    pub product_category: Option<String>,
    pub product_list: Option<Vec<ProductItem>>,
}

impl InitializePaymentRequest {
    /// Trim the identifiers that are stored, signed and sent upstream.
    fn normalize_ids(&mut self) {
        for id in [&mut self.merchant_transaction_id, &mut self.customer_order_id] {
            let trimmed = id.trim();
            if trimmed.len() != id.len() {
                *id = trimmed.to_string();
            }
        }
    }

    fn validate(&self) -> Result<(), PaymentError> {
        let required = [
            (&self.customer_order_id, "CustomerOrderId is required"),
            (&self.product_name, "ProductName is required"),
            (&self.customer_name, "CustomerName is required"),
            (&self.customer_email, "CustomerEmail is required"),
            (&self.customer_phone, "CustomerPhone is required"),
        ];
        if let Some((_, message)) = required.iter().find(|(v, _)| v.trim().is_empty()) {
            return Err(PaymentError::Validation((*message).to_string()));
        }
        if self.merchant_transaction_id.len() < MIN_MERCHANT_TRANSACTION_ID_LEN {
            return Err(PaymentError::Validation(format!(
                "MerchantTransactionId must be at least {MIN_MERCHANT_TRANSACTION_ID_LEN} characters"
            )));
        }
        if self.total_amount <= Decimal::ZERO {
            return Err(PaymentError::Validation(
                "Amount must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    fn shipment(&self) -> ShipmentDetails {
        ShipmentDetails {
            name: self.shipment_name.clone(),
            address: self.shipment_address.clone(),
            address2: self.shipment_address2.clone(),
            city: self.shipment_city.clone(),
            state: self.shipment_state.clone(),
            postcode: self.shipment_postcode.clone(),
            country: self.shipment_country.clone(),
        }
    }

    /// Metadata row for the request, if it carries any extension fields.
    fn metadata(&self) -> Option<PaymentMetadata> {
        let shipment = self.shipment();
        let has_values = [&self.value_a, &self.value_b, &self.value_c, &self.value_d]
            .iter()
            .any(|v| v.is_some());
        if shipment.is_empty() && !has_values {
            return None;
        }
        Some(PaymentMetadata {
            value_a: self.value_a.clone(),
            value_b: self.value_b.clone(),
            value_c: self.value_c.clone(),
            value_d: self.value_d.clone(),
            shipment,
            shipping_method: self.shipping_method.clone(),
            product_list_json: self
                .product_list
                .as_ref()
                .and_then(|list| serde_json::to_string(list).ok()),
            ..Default::default()
        })
    }

    fn to_new_payment(
        &self,
        user_id: &str,
        client: &ClientInfo,
        verification_hash: String,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> NewPayment {
        let optional = |s: &str| (!s.trim().is_empty()).then(|| s.to_string());
        NewPayment {
            user_id: user_id.to_string(),
            customer_order_id: self.customer_order_id.clone(),
            merchant_transaction_id: self.merchant_transaction_id.clone(),
            amount: self.total_amount,
            currency: DEFAULT_CURRENCY.to_string(),
            transaction_type: self.transaction_type,
            product: ProductDetails {
                name: self.product_name.clone(),
                profile: self.product_profile.clone(),
                category: self.product_category.clone(),
                quantity: self
                    .no_of_item
                    .as_deref()
                    .and_then(|n| n.trim().parse().ok())
                    .unwrap_or(1),
            },
            customer: CustomerDetails {
                name: self.customer_name.clone(),
                email: self.customer_email.clone(),
                phone: self.customer_phone.clone(),
                address: optional(&self.customer_address),
                city: optional(&self.customer_city),
                state: optional(&self.customer_state),
                postcode: optional(&self.customer_postcode),
                country: optional(&self.customer_country),
            },
            return_urls: ReturnUrls {
                success: optional(&self.success_url),
                fail: optional(&self.fail_url),
                cancel: optional(&self.cancel_url),
            },
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
            verification_hash: Some(verification_hash),
            created_at: now,
            expires_at: Some(now + ttl),
        }
    }
}

/// Caller network details recorded on payments and audit rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientInfo {
    pub fn new(ip_address: Option<&str>, user_agent: Option<&str>) -> Self {
        Self {
            ip_address: ip_address.map(str::to_string),
            user_agent: user_agent.map(str::to_string),
        }
    }

    fn ip(&self) -> Option<&str> {
        self.ip_address.as_deref()
    }

    fn agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InitializedPayment {
    pub payment_id: u64,
    pub merchant_transaction_id: String,
    pub transaction_id: String,
    pub redirect_url: Option<String>,
}

/// Result of a verify call, either fresh from the gateway or cached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationOutcome {
    pub merchant_transaction_id: String,
    pub status: PaymentStatus,
    /// Raw status string reported by the gateway. `None` on the cached path.
    pub gateway_status: Option<String>,
    pub payment_method: Option<String>,
    pub amount: Decimal,
    pub transaction_date: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub verification_attempts: u32,
    pub from_cache: bool,
}

impl VerificationOutcome {
    fn cached(payment: &Payment) -> Self {
        Self {
            merchant_transaction_id: payment.merchant_transaction_id.clone(),
            status: payment.status,
            gateway_status: None,
            payment_method: payment.payment_method.clone(),
            amount: payment.amount,
            transaction_date: None,
            verified_at: payment.verified_at,
            verification_attempts: payment.verification_attempts,
            from_cache: true,
        }
    }

    fn from_report(payment: &Payment, report: TransactionStatusReport) -> Self {
        Self {
            merchant_transaction_id: payment.merchant_transaction_id.clone(),
            status: payment.status,
            gateway_status: report.status,
            payment_method: payment.payment_method.clone(),
            amount: payment.amount,
            transaction_date: report.transaction_date,
            verified_at: payment.verified_at,
            verification_attempts: payment.verification_attempts,
            from_cache: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == PaymentStatus::Success
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct FiatPaymentService {
    store: Arc<PaymentStore>,
    gateway: Arc<dyn FiatGateway>,
    tokens: GatewayTokenCache,
    config: EpsConfig,
}

impl FiatPaymentService {
    pub fn new(store: Arc<PaymentStore>, gateway: Arc<dyn FiatGateway>, config: EpsConfig) -> Self {
        let tokens = GatewayTokenCache::new(gateway.clone(), &config);
        Self {
            store,
            gateway,
            tokens,
            config,
        }
    }

    pub fn config(&self) -> &EpsConfig {
        &self.config
    }

    pub fn store(&self) -> &PaymentStore {
        &self.store
    }

    /// Current bearer token, from cache when still valid.
    pub async fn auth_token(&self) -> Result<String, PaymentError> {
        self.tokens.get_token().await
    }

    async fn ensure_unique(
        &self,
        merchant_transaction_id: &str,
        customer_order_id: &str,
    ) -> Result<(), PaymentError> {
        if self
            .store
            .merchant_transaction_id_exists(merchant_transaction_id)?
        {
            warn!(merchant_transaction_id, "Duplicate merchant transaction id");
            return Err(PaymentError::DuplicateTransactionId);
        }
        if self.store.customer_order_id_exists(customer_order_id)? {
            warn!(customer_order_id, "Duplicate customer order id");
            return Err(PaymentError::DuplicateOrderId);
        }
        Ok(())
    }

    /// Register a payment with the gateway and return its checkout redirect.
    pub async fn initialize_payment(
        &self,
        mut request: InitializePaymentRequest,
        user_id: &str,
        client: &ClientInfo,
    ) -> Result<InitializedPayment, PaymentError> {
        request.normalize_ids();
        request.validate()?;
        if request.merchant_id.trim().is_empty() {
            request.merchant_id = self.config.merchant_id.clone();
        }
        if request.store_id.trim().is_empty() {
            request.store_id = self.config.store_id.clone();
        }

        let merchant_transaction_id = request.merchant_transaction_id.clone();
        let (token, uniqueness) = tokio::join!(
            self.tokens.get_token(),
            self.ensure_unique(&merchant_transaction_id, &request.customer_order_id)
        );
        uniqueness?;
        let token = token?;

        let now = Utc::now();
        let hash = verification_hash(
            &merchant_transaction_id,
            &request.total_amount.to_string(),
            user_id,
            now,
            &self.config.hash_key,
        )?;

        let payload = serde_json::to_value(&request)
            .map_err(|e| PaymentError::Validation(format!("Invalid payment request: {e}")))?;
        let request_json = payload.to_string();

        let new = request.to_new_payment(user_id, client, hash, now, self.config.payment_ttl);
        let first_log = PaymentLogEntry::new(PaymentAction::Initialize)
            .with_transition(None, Some(PaymentStatus::Pending))
            .with_request(request_json.clone())
            .with_client(client.ip(), client.agent());
        let (payment, _) = self.store.create_payment(new, request.metadata(), first_log)?;

        info!(
            payment_id = payment.id,
            merchant_transaction_id = %merchant_transaction_id,
            amount = %payment.amount,
            "Payment created, initializing with gateway"
        );

        let x_hash = sign(&merchant_transaction_id, &self.config.hash_key)?;
        let reply = match self.gateway.initialize(&x_hash, &token, &payload).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    payment_id = payment.id,
                    error = %e,
                    "Initialize call failed without a response, payment left pending"
                );
                self.store.append_log(
                    payment.id,
                    PaymentLogEntry::new(PaymentAction::InitializeError)
                        .with_request(request_json)
                        .with_error(e.to_string())
                        .with_client(client.ip(), client.agent()),
                )?;
                return Err(PaymentError::GatewayUnavailable(e.to_string()));
            }
        };

        if !reply.is_success() {
            if reply.status == 401 {
                self.tokens.invalidate().await;
            }
            let message = format!("EPS Error: {}", reply.body);
            self.fail_initialize(
                &payment,
                &reply,
                &reply.upstream_code(),
                &message,
                format!("HTTP {}: {}", reply.status, reply.body),
                client,
            )?;
            return Err(PaymentError::Gateway {
                upstream_code: reply.upstream_code(),
                message,
            });
        }

        let parsed = reply
            .json()
            .map(|body| InitializeReply::parse(&body))
            .unwrap_or_default();
        let Some(transaction_id) = parsed.transaction_id else {
            let upstream_code = parsed
                .error_code
                .unwrap_or_else(|| "NO_TRANSACTION_ID".to_string());
            let message = parsed
                .error_message
                .unwrap_or_else(|| "Gateway returned no transaction id".to_string());
            self.fail_initialize(
                &payment,
                &reply,
                &upstream_code,
                &message,
                message.clone(),
                client,
            )?;
            return Err(PaymentError::Gateway {
                upstream_code,
                message,
            });
        };

        let payment = self
            .store
            .assign_gateway_transaction_id(payment.id, &transaction_id)?;
        self.store.append_log(
            payment.id,
            PaymentLogEntry::new(PaymentAction::InitializeSuccess)
                .with_transition(Some(PaymentStatus::Pending), Some(PaymentStatus::Pending))
                .with_response(reply.body)
                .with_client(client.ip(), client.agent()),
        )?;

        info!(
            payment_id = payment.id,
            merchant_transaction_id = %merchant_transaction_id,
            transaction_id = %transaction_id,
            "Payment initialized"
        );

        Ok(InitializedPayment {
            payment_id: payment.id,
            merchant_transaction_id,
            transaction_id,
            redirect_url: parsed.redirect_url,
        })
    }

    fn fail_initialize(
        &self,
        payment: &Payment,
        reply: &GatewayReply,
        error_code: &str,
        message: &str,
        log_error: String,
        client: &ClientInfo,
    ) -> Result<(), PaymentError> {
        warn!(
            payment_id = payment.id,
            status = reply.status,
            error_code,
            "Gateway rejected payment initialization"
        );
        self.store.append_log(
            payment.id,
            PaymentLogEntry::new(PaymentAction::InitializeError)
                .with_transition(Some(PaymentStatus::Pending), Some(PaymentStatus::Failed))
                .with_response(reply.body.clone())
                .with_error(log_error)
                .with_client(client.ip(), client.agent()),
        )?;
        self.store.transition_status(
            payment.id,
            PaymentStatus::Failed,
            Some(error_code),
            Some(message),
            Utc::now(),
        )?;
        Ok(())
    }

    /// Ask the gateway for the authoritative status of a payment.
    ///
    /// A payment already verified as `Success` is answered from the store.
    pub async fn verify_transaction(
        &self,
        merchant_transaction_id: &str,
        ip_address: Option<&str>,
    ) -> Result<VerificationOutcome, PaymentError> {
        let payment = self
            .store
            .find_by_merchant_transaction_id(merchant_transaction_id)?
            .ok_or(PaymentError::NotFound)?;
        let payment = self.store.increment_verification_attempts(payment.id)?;

        if payment.status == PaymentStatus::Success && payment.verified_at.is_some() {
            debug!(
                payment_id = payment.id,
                attempts = payment.verification_attempts,
                "Payment already verified, returning cached result"
            );
            return Ok(VerificationOutcome::cached(&payment));
        }

        let token = self.tokens.get_token().await?;
        let x_hash = sign(merchant_transaction_id, &self.config.hash_key)?;
        let reply = match self
            .gateway
            .check_status(&x_hash, &token, merchant_transaction_id)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(payment_id = payment.id, error = %e, "Status check failed");
                self.store.append_log(
                    payment.id,
                    PaymentLogEntry::new(PaymentAction::VerifyError)
                        .with_error(e.to_string())
                        .with_client(ip_address, None),
                )?;
                return Err(PaymentError::GatewayUnavailable(e.to_string()));
            }
        };

        self.store.append_log(
            payment.id,
            PaymentLogEntry::new(PaymentAction::Verify)
                .with_transition(Some(payment.status), None)
                .with_response(reply.body.clone())
                .with_client(ip_address, None),
        )?;

        if !reply.is_success() {
            if reply.status == 401 {
                self.tokens.invalidate().await;
            }
            warn!(
                payment_id = payment.id,
                status = reply.status,
                "Gateway rejected status check"
            );
            self.store.append_log(
                payment.id,
                PaymentLogEntry::new(PaymentAction::VerifyError)
                    .with_error(format!("HTTP {}: {}", reply.status, reply.body))
                    .with_client(ip_address, None),
            )?;
            return Err(PaymentError::Gateway {
                upstream_code: reply.upstream_code(),
                message: reply.body,
            });
        }

        let report = reply
            .json()
            .map(|body| TransactionStatusReport::parse(&body))
            .ok_or_else(|| PaymentError::Parse("status response is not JSON".to_string()))?;
        let Some(raw_status) = report.status.clone() else {
            return Err(PaymentError::Parse(
                "status response carries no status".to_string(),
            ));
        };

        let Some(status) = PaymentStatus::from_gateway(&raw_status) else {
            warn!(
                payment_id = payment.id,
                gateway_status = %raw_status,
                "Unknown gateway status, payment left unchanged"
            );
            return Ok(VerificationOutcome::from_report(&payment, report));
        };

        let update = self.store.mark_verified(
            payment.id,
            status,
            report.financial_entity.clone(),
            Utc::now(),
        )?;

        if update.changed() {
            self.store.append_log(
                payment.id,
                PaymentLogEntry::new(PaymentAction::StatusChange)
                    .with_transition(Some(update.previous), Some(update.payment.status))
                    .with_client(ip_address, None),
            )?;
            info!(
                payment_id = payment.id,
                previous = %update.previous,
                status = %update.payment.status,
                "Payment status updated from gateway"
            );
        } else if !update.applied {
            warn!(
                payment_id = payment.id,
                stored = %update.previous,
                reported = %status,
                "Gateway status conflicts with terminal payment, ignored"
            );
        }

        Ok(VerificationOutcome::from_report(&update.payment, report))
    }
}

#[cfg(test)]
pub(crate) fn sample_request(merchant_transaction_id: &str, customer_order_id: &str) -> InitializePaymentRequest {
    InitializePaymentRequest {
        customer_order_id: customer_order_id.to_string(),
        merchant_transaction_id: merchant_transaction_id.to_string(),
        total_amount: Decimal::new(10000, 2),
        success_url: "https://api.test/callback/success".to_string(),
        fail_url: "https://api.test/callback/fail".to_string(),
        cancel_url: "https://api.test/callback/cancel".to_string(),
        customer_name: "Rahim Uddin".to_string(),
        customer_email: "rahim@example.com".to_string(),
        customer_phone: "01700000000".to_string(),
        customer_city: "Dhaka".to_string(),
        customer_country: "BD".to_string(),
        product_name: "Residential 10GB".to_string(),
        ..Default::default()
    }
}

#[cfg(test)]
pub(crate) fn fiat_service(
    gateway: &Arc<crate::testing::FakeFiatGateway>,
) -> (FiatPaymentService, Arc<PaymentStore>, tempfile::TempDir) {
    let (store, dir) = crate::storage::database::temp_store();
    let store = Arc::new(store);
    let service = FiatPaymentService::new(store.clone(), gateway.clone(), crate::testing::eps_config());
    (service, store, dir)
}
