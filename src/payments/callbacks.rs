// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Callback Reconciler
//!
//! Handles the "after the fact" paths of both gateways: the fiat gateway's
//! success/fail/cancel browser redirects, the crypto gateway's webhook, and
//! manual crypto verification.
//!
//! Gateways deliver notifications at least once, so every handler must be
//! safe to run repeatedly:
//!
//! - A fiat success callback re-verifies with the gateway before anything is
//!   granted. The balance grant is claimed once per payment in the store.
//! - Fail and cancel callbacks only move a `Pending` payment.
//! - A crypto order that is already `Success` is acknowledged without a
//!   gateway call.
//!
//! Balance-grant failures are recorded in the purchase log and never touch
//! the payment status.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use url::Url;

use super::crypto::CryptoPaymentService;
use super::fiat::FiatPaymentService;
use crate::directory::UserDirectory;
use crate::error::PaymentError;
use crate::providers::mixpay::callback_order_id;
use crate::providers::reseller::ResellerProvisioning;
use crate::storage::{
    CryptoLogEntry, CryptoPayment, CryptoPaymentAction, CryptoPaymentStatus, OwnershipCheck,
    Payment, PaymentAction, PaymentLogEntry, PaymentStatus, PaymentStore,
};

/// Where to send the customer's browser after a fiat callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallbackOutcome {
    pub redirect_url: String,
}

/// Body returned to the crypto gateway for every webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Acknowledgement {
    pub code: &'static str,
}

impl Acknowledgement {
    fn received() -> Self {
        Self { code: "SUCCESS" }
    }
}

/// Result of reconciling one crypto order.
#[derive(Debug, Clone, PartialEq)]
pub enum CryptoReconciliation {
    /// This call moved the order to `Success`.
    Settled(CryptoPayment),
    /// The order was already `Success`. Nothing was queried or written.
    AlreadySettled(CryptoPayment),
    /// The gateway did not confirm the payment. The order stays `Pending`.
    Unverified {
        payment: CryptoPayment,
        reason: String,
    },
}

impl CryptoReconciliation {
    pub fn is_settled(&self) -> bool {
        !matches!(self, CryptoReconciliation::Unverified { .. })
    }

    pub fn payment(&self) -> &CryptoPayment {
        match self {
            CryptoReconciliation::Settled(payment)
            | CryptoReconciliation::AlreadySettled(payment)
            | CryptoReconciliation::Unverified { payment, .. } => payment,
        }
    }
}

/// Whether a webhook from `source` may be processed.
///
/// Configured gateway egress addresses, loopback and private ranges pass.
pub fn is_allowed_source(source: IpAddr, allowed: &[IpAddr]) -> bool {
    if allowed.contains(&source) || source.is_loopback() {
        return true;
    }
    match source {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

fn frontend_redirect(frontend_url: &str, path: &str, query: &[(&str, &str)]) -> String {
    let base = format!("{}{path}", frontend_url.trim_end_matches('/'));
    match Url::parse(&base) {
        Ok(mut url) => {
            if !query.is_empty() {
                url.query_pairs_mut().extend_pairs(query);
            }
            url.to_string()
        }
        Err(_) => {
            let pairs: Vec<String> = query.iter().map(|(k, v)| format!("{k}={v}")).collect();
            if pairs.is_empty() {
                base
            } else {
                format!("{base}?{}", pairs.join("&"))
            }
        }
    }
}

/// Gateway identifiers carried by a fiat callback, as written to the audit log.
fn callback_reference(transaction_id: Option<&str>, merchant_transaction_id: &str) -> String {
    format!(
        "TransactionId: {}, MerchantTransactionId: {merchant_transaction_id}",
        transaction_id.map(str::trim).unwrap_or("")
    )
}

pub struct PaymentReconciler {
    store: Arc<PaymentStore>,
    fiat: Arc<FiatPaymentService>,
    crypto: Arc<CryptoPaymentService>,
    directory: Arc<dyn UserDirectory>,
    reseller: Arc<dyn ResellerProvisioning>,
    balance_multiplier: Decimal,
}

impl PaymentReconciler {
    pub fn new(
        store: Arc<PaymentStore>,
        fiat: Arc<FiatPaymentService>,
        crypto: Arc<CryptoPaymentService>,
        directory: Arc<dyn UserDirectory>,
        reseller: Arc<dyn ResellerProvisioning>,
        balance_multiplier: Decimal,
    ) -> Self {
        Self {
            store,
            fiat,
            crypto,
            directory,
            reseller,
            balance_multiplier,
        }
    }

    fn redirect(&self, path: &str, query: &[(&str, &str)]) -> CallbackOutcome {
        CallbackOutcome {
            redirect_url: frontend_redirect(&self.fiat.config().frontend_url, path, query),
        }
    }

    fn internal_error(&self) -> CallbackOutcome {
        self.redirect("/payment/failed", &[("error", "InternalError")])
    }

    // =========================================================================
    // Fiat callbacks
    // =========================================================================

    /// Handle the gateway's success redirect.
    ///
    /// Fails only for a blank or unknown merchant transaction id. Every
    /// other failure becomes a redirect to the failure page.
    pub async fn handle_success_callback(
        &self,
        merchant_transaction_id: &str,
        transaction_id: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<CallbackOutcome, PaymentError> {
        let merchant_transaction_id = merchant_transaction_id.trim();
        if merchant_transaction_id.is_empty() {
            return Err(PaymentError::Validation(
                "Merchant transaction id is required".to_string(),
            ));
        }

        let payment = match self
            .store
            .find_by_merchant_transaction_id(merchant_transaction_id)
        {
            Ok(Some(payment)) => payment,
            Ok(None) => {
                warn!(merchant_transaction_id, "Success callback for unknown payment");
                return Err(PaymentError::NotFound);
            }
            Err(e) => {
                error!(merchant_transaction_id, error = %e, "Success callback lookup failed");
                return Ok(self.internal_error());
            }
        };

        match self.confirm_success(&payment, transaction_id, ip_address).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(
                    payment_id = payment.id,
                    error = %e,
                    "Success callback processing failed"
                );
                Ok(self.internal_error())
            }
        }
    }

    async fn confirm_success(
        &self,
        payment: &Payment,
        transaction_id: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<CallbackOutcome, PaymentError> {
        let mtid = payment.merchant_transaction_id.as_str();
        info!(payment_id = payment.id, merchant_transaction_id = mtid, "Success callback received");

        self.store.append_log(
            payment.id,
            PaymentLogEntry::new(PaymentAction::SuccessCallback)
                .with_transition(Some(payment.status), None)
                .with_response(callback_reference(transaction_id, mtid))
                .with_client(ip_address, None),
        )?;

        let verified = match self.fiat.verify_transaction(mtid, ip_address).await {
            Ok(outcome) => outcome.is_success(),
            Err(e @ PaymentError::Store(_)) => return Err(e),
            Err(e) => {
                warn!(payment_id = payment.id, error = %e, "Verification after success callback failed");
                false
            }
        };

        if !verified {
            return Ok(self.redirect(
                "/payment/failed",
                &[
                    ("merchantTransactionId", mtid),
                    ("error", "VerificationFailed"),
                ],
            ));
        }

        if let Err(e) = self.grant_balance(payment).await {
            error!(payment_id = payment.id, error = %e, "Balance grant bookkeeping failed");
        }

        Ok(self.redirect(
            "/payment/success",
            &[("merchantTransactionId", mtid), ("status", "Success")],
        ))
    }

    /// Grant reseller balance for a confirmed payment, at most once.
    ///
    /// The claim is released when the grant does not go through, so the next
    /// success callback for the payment retries it.
    async fn grant_balance(&self, payment: &Payment) -> Result<(), PaymentError> {
        if !self.store.claim_balance_grant(payment.id, Utc::now())? {
            debug!(payment_id = payment.id, "Balance already granted");
            return Ok(());
        }

        let balance = payment.amount * self.balance_multiplier;
        let user = self.directory.find_by_id(&payment.user_id).await;
        let Some((user, account)) =
            user.and_then(|user| user.reseller_account.clone().map(|account| (user, account)))
        else {
            warn!(payment_id = payment.id, user_id = %payment.user_id, "User has no reseller account");
            self.store.record_proxy_purchase_failure(
                payment.id,
                "",
                payment.amount,
                balance,
                "User has no reseller account",
            )?;
            self.store.release_balance_grant(payment.id)?;
            return Ok(());
        };

        let grant = self.reseller.grant_balance(&account, balance).await;
        if grant.success {
            self.store
                .record_proxy_purchase(payment.id, &account, &user.email, payment.amount, balance)?;
            info!(payment_id = payment.id, account = %account, balance = %balance, "Balance granted");
        } else {
            warn!(
                payment_id = payment.id,
                account = %account,
                error = %grant.message,
                "Balance grant failed"
            );
            self.store.record_proxy_purchase_failure(
                payment.id,
                &account,
                payment.amount,
                balance,
                &grant.message,
            )?;
            self.store.release_balance_grant(payment.id)?;
        }
        Ok(())
    }

    /// Handle the gateway's failure redirect.
    pub async fn handle_fail_callback(
        &self,
        merchant_transaction_id: &str,
        transaction_id: Option<&str>,
        ip_address: Option<&str>,
    ) -> CallbackOutcome {
        let mtid = merchant_transaction_id.trim();
        let recorded = self.record_negative_outcome(
            mtid,
            transaction_id,
            PaymentAction::FailCallback,
            PaymentStatus::Failed,
            "PAYMENT_FAILED",
            "Payment was declined or failed",
            ip_address,
        );
        match recorded {
            Ok(()) => self.redirect(
                "/payment/failed",
                &[("merchantTransactionId", mtid), ("status", "Failed")],
            ),
            Err(e) => {
                error!(merchant_transaction_id = mtid, error = %e, "Fail callback processing failed");
                self.internal_error()
            }
        }
    }

    /// Handle the gateway's cancel redirect.
    pub async fn handle_cancel_callback(
        &self,
        merchant_transaction_id: &str,
        transaction_id: Option<&str>,
        ip_address: Option<&str>,
    ) -> CallbackOutcome {
        let mtid = merchant_transaction_id.trim();
        let recorded = self.record_negative_outcome(
            mtid,
            transaction_id,
            PaymentAction::CancelCallback,
            PaymentStatus::Cancelled,
            "USER_CANCELLED",
            "Payment was cancelled by user",
            ip_address,
        );
        match recorded {
            Ok(()) => self.redirect("/payment/cancelled", &[("merchantTransactionId", mtid)]),
            Err(e) => {
                error!(merchant_transaction_id = mtid, error = %e, "Cancel callback processing failed");
                self.internal_error()
            }
        }
    }

    fn record_negative_outcome(
        &self,
        merchant_transaction_id: &str,
        transaction_id: Option<&str>,
        action: PaymentAction,
        status: PaymentStatus,
        error_code: &str,
        error_message: &str,
        ip_address: Option<&str>,
    ) -> Result<(), PaymentError> {
        let Some(payment) = self
            .store
            .find_by_merchant_transaction_id(merchant_transaction_id)?
        else {
            warn!(merchant_transaction_id, ?action, "Callback for unknown payment");
            return Ok(());
        };

        let update = self.store.transition_status(
            payment.id,
            status,
            Some(error_code),
            Some(error_message),
            Utc::now(),
        )?;

        let mut entry = PaymentLogEntry::new(action)
            .with_transition(Some(update.previous), Some(update.payment.status))
            .with_response(callback_reference(transaction_id, merchant_transaction_id))
            .with_client(ip_address, None);
        if update.applied {
            info!(payment_id = payment.id, status = %status, "Payment closed by gateway callback");
        } else {
            warn!(
                payment_id = payment.id,
                current = %update.previous,
                requested = %status,
                "Callback ignored for settled payment"
            );
            entry = entry.with_error(format!(
                "Payment already {}, callback ignored",
                update.previous
            ));
        }
        self.store.append_log(payment.id, entry)?;
        Ok(())
    }

    // =========================================================================
    // Crypto reconciliation
    // =========================================================================

    /// Process a crypto gateway webhook. Always acknowledges.
    pub async fn handle_crypto_webhook(
        &self,
        body: &Value,
        source: Option<IpAddr>,
    ) -> Acknowledgement {
        let config = self.crypto.config();
        if config.allowlist_enabled {
            let allowed = source.is_some_and(|ip| is_allowed_source(ip, &config.callback_ips));
            if !allowed {
                warn!(source = ?source, "Crypto webhook from unlisted source ignored");
                return Acknowledgement::received();
            }
        }

        let Some(order_id) = callback_order_id(body) else {
            warn!("Crypto webhook without order id ignored");
            return Acknowledgement::received();
        };
        let ip = source.map(|ip| ip.to_string());

        match self
            .reconcile_crypto_order(
                &order_id,
                ip.as_deref(),
                Some(body.to_string()),
                CryptoPaymentAction::VerificationSuccess,
            )
            .await
        {
            Ok(CryptoReconciliation::AlreadySettled(_)) => {
                debug!(order_id = %order_id, "Crypto webhook for settled order");
            }
            Ok(_) => {}
            Err(PaymentError::NotFound) => {
                warn!(order_id = %order_id, "Crypto webhook for unknown order");
            }
            Err(e) => {
                error!(order_id = %order_id, error = %e, "Crypto webhook processing failed");
                if let Ok(Some(payment)) = self.store.find_crypto_by_order_id(&order_id) {
                    let logged = self.store.append_crypto_log(
                        payment.id,
                        CryptoLogEntry::new(CryptoPaymentAction::CallbackError)
                            .with_request(body.to_string())
                            .with_error(e.to_string())
                            .with_ip(ip.as_deref()),
                    );
                    if let Err(log_err) = logged {
                        error!(order_id = %order_id, error = %log_err, "Failed to record webhook error");
                    }
                }
            }
        }

        Acknowledgement::received()
    }

    /// Verify and settle a crypto order on the owner's request.
    pub async fn verify_and_complete(
        &self,
        order_id: &str,
        user_id: &str,
        ip_address: Option<&str>,
    ) -> Result<CryptoReconciliation, PaymentError> {
        self.store
            .find_crypto_by_order_id(order_id)?
            .verify_owner(user_id)?;
        self.reconcile_crypto_order(
            order_id,
            ip_address,
            None,
            CryptoPaymentAction::ManualVerifySuccess,
        )
        .await
    }

    async fn reconcile_crypto_order(
        &self,
        order_id: &str,
        ip_address: Option<&str>,
        callback_body: Option<String>,
        success_action: CryptoPaymentAction,
    ) -> Result<CryptoReconciliation, PaymentError> {
        let payment = self
            .store
            .find_crypto_by_order_id(order_id)?
            .ok_or(PaymentError::NotFound)?;
        if payment.status == CryptoPaymentStatus::Success {
            return Ok(CryptoReconciliation::AlreadySettled(payment));
        }

        if let Some(body) = callback_body {
            self.store.append_crypto_log(
                payment.id,
                CryptoLogEntry::new(CryptoPaymentAction::CallbackReceived)
                    .with_transition(Some(payment.status), None)
                    .with_request(body)
                    .with_ip(ip_address),
            )?;
        }

        let verification = self
            .crypto
            .verify_payment(order_id, Some(payment.amount), Some(&payment.quote_asset_id))
            .await;

        if !verification.verified {
            let reason = verification
                .failure
                .clone()
                .unwrap_or_else(|| "not verified".to_string());
            let mut entry = CryptoLogEntry::new(CryptoPaymentAction::VerificationFailed)
                .with_error(reason.clone())
                .with_ip(ip_address);
            if let Some(raw) = verification.raw_response {
                entry = entry.with_response(raw);
            }
            self.store.append_crypto_log(payment.id, entry)?;
            return Ok(CryptoReconciliation::Unverified { payment, reason });
        }

        let completion =
            self.store
                .complete_crypto_payment(order_id, verification.settlement(), Utc::now())?;
        if !completion.applied {
            return Ok(CryptoReconciliation::AlreadySettled(completion.payment));
        }

        let mut entry = CryptoLogEntry::new(success_action)
            .with_transition(
                Some(CryptoPaymentStatus::Pending),
                Some(CryptoPaymentStatus::Success),
            )
            .with_ip(ip_address);
        if let Some(raw) = verification.raw_response {
            entry = entry.with_response(raw);
        }
        self.store.append_crypto_log(completion.payment.id, entry)?;
        info!(
            order_id,
            trace_id = ?completion.payment.trace_id,
            "Crypto payment settled"
        );

        Ok(CryptoReconciliation::Settled(completion.payment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{InMemoryUserDirectory, NewUser};
    use crate::payments::fiat::{sample_request, ClientInfo};
    use crate::providers::GatewayReply;
    use crate::storage::crypto::sample_new_crypto_payment;
    use crate::storage::database::temp_store;
    use crate::testing::{
        eps_config, mixpay_config, FakeCryptoGateway, FakeFiatGateway, FakeReseller,
    };
    use serde_json::json;
    use std::net::{Ipv4Addr, Ipv6Addr};

    struct Harness {
        reconciler: PaymentReconciler,
        store: Arc<PaymentStore>,
        fiat: Arc<FiatPaymentService>,
        fiat_gateway: Arc<FakeFiatGateway>,
        crypto_gateway: Arc<FakeCryptoGateway>,
        reseller: Arc<FakeReseller>,
        directory: Arc<InMemoryUserDirectory>,
        _dir: tempfile::TempDir,
    }

    fn harness_with(reseller: FakeReseller, allowlist: Option<Vec<IpAddr>>) -> Harness {
        let (store, dir) = temp_store();
        let store = Arc::new(store);
        let fiat_gateway = Arc::new(FakeFiatGateway::new());
        let crypto_gateway = Arc::new(FakeCryptoGateway::new());
        let reseller = Arc::new(reseller);
        let directory = Arc::new(InMemoryUserDirectory::new());

        let mut crypto_config = mixpay_config();
        if let Some(ips) = allowlist {
            crypto_config.allowlist_enabled = true;
            crypto_config.callback_ips = ips;
        }

        let fiat = Arc::new(FiatPaymentService::new(
            store.clone(),
            fiat_gateway.clone(),
            eps_config(),
        ));
        let crypto = Arc::new(CryptoPaymentService::new(
            store.clone(),
            crypto_gateway.clone(),
            crypto_config,
        ));
        let reconciler = PaymentReconciler::new(
            store.clone(),
            fiat.clone(),
            crypto,
            directory.clone(),
            reseller.clone(),
            Decimal::from(8),
        );
        Harness {
            reconciler,
            store,
            fiat,
            fiat_gateway,
            crypto_gateway,
            reseller,
            directory,
            _dir: dir,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeReseller::accepting(), None)
    }

    impl Harness {
        async fn customer(&self, reseller_account: Option<&str>) -> String {
            self.directory
                .create(NewUser {
                    email: "rahim@example.com".to_string(),
                    password_hash: "hash".to_string(),
                    reseller_account: reseller_account.map(str::to_string),
                })
                .await
                .unwrap()
                .id
        }

        async fn pending_fiat(&self, user_id: &str) -> Payment {
            let initialized = self
                .fiat
                .initialize_payment(
                    sample_request("TXN_ABCDEFGHIJ", "ORDER-1"),
                    user_id,
                    &ClientInfo::default(),
                )
                .await
                .unwrap();
            self.store.get_payment(initialized.payment_id).unwrap().unwrap()
        }

        fn pending_crypto(&self, order_id: &str) -> CryptoPayment {
            self.store
                .create_crypto_payment(
                    sample_new_crypto_payment(order_id),
                    CryptoLogEntry::new(CryptoPaymentAction::Initialize),
                )
                .unwrap()
                .0
        }

        fn crypto_actions(&self, payment_id: u64) -> Vec<CryptoPaymentAction> {
            self.store
                .crypto_logs_for_payment(payment_id)
                .unwrap()
                .into_iter()
                .map(|log| log.action)
                .collect()
        }
    }

    fn webhook(order_id: &str) -> Value {
        json!({"data": {"orderId": order_id, "status": "success"}})
    }

    #[test]
    fn allowlist_accepts_configured_and_private_sources() {
        let gateway_ip = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 20));
        let allowed = [gateway_ip];
        assert!(is_allowed_source(gateway_ip, &allowed));
        assert!(is_allowed_source(IpAddr::V4(Ipv4Addr::LOCALHOST), &allowed));
        assert!(is_allowed_source(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)), &allowed));
        assert!(is_allowed_source(
            IpAddr::V6("fd00::1".parse::<Ipv6Addr>().unwrap()),
            &allowed
        ));
        assert!(!is_allowed_source(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)), &allowed));
    }

    #[test]
    fn redirects_are_built_from_frontend_url() {
        assert_eq!(
            frontend_redirect(
                "https://app.test/",
                "/payment/success",
                &[("merchantTransactionId", "TXN_1"), ("status", "Success")]
            ),
            "https://app.test/payment/success?merchantTransactionId=TXN_1&status=Success"
        );
        assert_eq!(
            frontend_redirect("https://app.test", "/payment/cancelled", &[]),
            "https://app.test/payment/cancelled"
        );
    }

    #[tokio::test]
    async fn success_callback_verifies_and_grants_balance() {
        let h = harness();
        let user_id = h.customer(Some("sub-rahim")).await;
        let payment = h.pending_fiat(&user_id).await;

        let outcome = h
            .reconciler
            .handle_success_callback("TXN_ABCDEFGHIJ", Some("EPS123"), Some("203.0.113.7"))
            .await
            .unwrap();

        assert_eq!(
            outcome.redirect_url,
            "https://app.test/payment/success?merchantTransactionId=TXN_ABCDEFGHIJ&status=Success"
        );
        let stored = h.store.get_payment(payment.id).unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Success);
        assert!(stored.balance_granted_at.is_some());

        let grants = h.reseller.grants.lock().unwrap().clone();
        assert_eq!(grants, vec![("sub-rahim".to_string(), Decimal::new(80000, 2))]);
        let purchases = h.store.proxy_purchases_for_payment(payment.id).unwrap();
        assert_eq!(purchases.len(), 1);
        assert_eq!(purchases[0].email, "rahim@example.com");

        let logs = h.store.logs_for_payment(payment.id).unwrap();
        assert!(logs.iter().any(|log| log.action == PaymentAction::SuccessCallback));
    }

    #[tokio::test]
    async fn duplicate_success_callback_grants_once() {
        let h = harness();
        let user_id = h.customer(Some("sub-rahim")).await;
        h.pending_fiat(&user_id).await;

        for _ in 0..2 {
            h.reconciler
                .handle_success_callback("TXN_ABCDEFGHIJ", None, None)
                .await
                .unwrap();
        }

        assert_eq!(h.reseller.calls(), 1);
        assert_eq!(h.fiat_gateway.status_calls(), 1);
    }

    #[tokio::test]
    async fn failed_grant_keeps_success_and_is_logged() {
        let h = harness_with(FakeReseller::refusing(), None);
        let user_id = h.customer(Some("sub-rahim")).await;
        let payment = h.pending_fiat(&user_id).await;

        let outcome = h
            .reconciler
            .handle_success_callback("TXN_ABCDEFGHIJ", None, None)
            .await
            .unwrap();

        assert!(outcome.redirect_url.contains("/payment/success"));
        let stored = h.store.get_payment(payment.id).unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Success);

        let failures = h.store.proxy_purchase_failures_for_payment(payment.id).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].username, "sub-rahim");
        assert!(failures[0].error_message.contains("HTTP_500"));
        assert!(h.store.proxy_purchases_for_payment(payment.id).unwrap().is_empty());
        assert!(stored.balance_granted_at.is_none());
    }

    #[tokio::test]
    async fn failed_grant_is_retried_by_next_success_callback() {
        let h = harness_with(FakeReseller::refusing(), None);
        let user_id = h.customer(Some("sub-rahim")).await;
        let payment = h.pending_fiat(&user_id).await;

        h.reconciler
            .handle_success_callback("TXN_ABCDEFGHIJ", None, None)
            .await
            .unwrap();
        h.reseller.set_succeed(true);
        h.reconciler
            .handle_success_callback("TXN_ABCDEFGHIJ", None, None)
            .await
            .unwrap();
        h.reconciler
            .handle_success_callback("TXN_ABCDEFGHIJ", None, None)
            .await
            .unwrap();

        assert_eq!(h.reseller.calls(), 2);
        assert_eq!(h.store.proxy_purchases_for_payment(payment.id).unwrap().len(), 1);
        let stored = h.store.get_payment(payment.id).unwrap().unwrap();
        assert!(stored.balance_granted_at.is_some());
    }

    #[tokio::test]
    async fn missing_reseller_account_is_logged() {
        let h = harness();
        let user_id = h.customer(None).await;
        let payment = h.pending_fiat(&user_id).await;

        h.reconciler
            .handle_success_callback("TXN_ABCDEFGHIJ", None, None)
            .await
            .unwrap();

        assert_eq!(h.reseller.calls(), 0);
        let failures = h.store.proxy_purchase_failures_for_payment(payment.id).unwrap();
        assert_eq!(failures[0].error_message, "User has no reseller account");
        let stored = h.store.get_payment(payment.id).unwrap().unwrap();
        assert!(stored.balance_granted_at.is_none());
    }

    #[tokio::test]
    async fn unconfirmed_success_redirects_to_failure() {
        let h = harness();
        let user_id = h.customer(Some("sub-rahim")).await;
        let payment = h.pending_fiat(&user_id).await;
        h.fiat_gateway.set_status(Some(FakeFiatGateway::status_body("Failed")));

        let outcome = h
            .reconciler
            .handle_success_callback("TXN_ABCDEFGHIJ", None, None)
            .await
            .unwrap();

        assert_eq!(
            outcome.redirect_url,
            "https://app.test/payment/failed?merchantTransactionId=TXN_ABCDEFGHIJ&error=VerificationFailed"
        );
        assert_eq!(h.reseller.calls(), 0);
        assert_eq!(
            h.store.get_payment(payment.id).unwrap().unwrap().status,
            PaymentStatus::Failed
        );
    }

    #[tokio::test]
    async fn gateway_outage_during_success_callback_keeps_pending() {
        let h = harness();
        let user_id = h.customer(Some("sub-rahim")).await;
        let payment = h.pending_fiat(&user_id).await;
        h.fiat_gateway.set_status(None);

        let outcome = h
            .reconciler
            .handle_success_callback("TXN_ABCDEFGHIJ", None, None)
            .await
            .unwrap();

        assert!(outcome.redirect_url.contains("error=VerificationFailed"));
        assert_eq!(
            h.store.get_payment(payment.id).unwrap().unwrap().status,
            PaymentStatus::Pending
        );
    }

    #[tokio::test]
    async fn success_callback_for_unknown_payment_is_not_found() {
        let h = harness();
        let err = h
            .reconciler
            .handle_success_callback("TXN_UNKNOWN_1", None, None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "TRANSACTION_NOT_FOUND");

        let err = h
            .reconciler
            .handle_success_callback("  ", None, None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn fail_callback_closes_pending_payment() {
        let h = harness();
        let payment = h.pending_fiat("user-1").await;

        let outcome = h
            .reconciler
            .handle_fail_callback("TXN_ABCDEFGHIJ", Some("EPS123"), Some("203.0.113.7"))
            .await;

        assert_eq!(
            outcome.redirect_url,
            "https://app.test/payment/failed?merchantTransactionId=TXN_ABCDEFGHIJ&status=Failed"
        );
        let stored = h.store.get_payment(payment.id).unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Failed);
        assert_eq!(stored.error_code.as_deref(), Some("PAYMENT_FAILED"));
        assert!(stored.completed_at.is_none());

        let last = h.store.logs_for_payment(payment.id).unwrap().pop().unwrap();
        assert_eq!(last.action, PaymentAction::FailCallback);
        assert_eq!(last.previous_status, Some(PaymentStatus::Pending));
        assert_eq!(last.new_status, Some(PaymentStatus::Failed));
        assert_eq!(
            last.response_data.as_deref(),
            Some("TransactionId: EPS123, MerchantTransactionId: TXN_ABCDEFGHIJ")
        );
    }

    #[tokio::test]
    async fn cancel_callback_closes_pending_payment() {
        let h = harness();
        let payment = h.pending_fiat("user-1").await;

        let outcome = h
            .reconciler
            .handle_cancel_callback("TXN_ABCDEFGHIJ", Some("EPS456"), None)
            .await;

        assert_eq!(
            outcome.redirect_url,
            "https://app.test/payment/cancelled?merchantTransactionId=TXN_ABCDEFGHIJ"
        );
        let stored = h.store.get_payment(payment.id).unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Cancelled);
        assert_eq!(stored.error_message.as_deref(), Some("Payment was cancelled by user"));

        let last = h.store.logs_for_payment(payment.id).unwrap().pop().unwrap();
        assert_eq!(last.action, PaymentAction::CancelCallback);
        assert_eq!(
            last.response_data.as_deref(),
            Some("TransactionId: EPS456, MerchantTransactionId: TXN_ABCDEFGHIJ")
        );
    }

    #[tokio::test]
    async fn fail_and_cancel_cannot_override_success() {
        let h = harness();
        let user_id = h.customer(Some("sub-rahim")).await;
        let payment = h.pending_fiat(&user_id).await;
        h.reconciler
            .handle_success_callback("TXN_ABCDEFGHIJ", None, None)
            .await
            .unwrap();

        h.reconciler.handle_fail_callback("TXN_ABCDEFGHIJ", None, None).await;
        h.reconciler.handle_cancel_callback("TXN_ABCDEFGHIJ", None, None).await;

        let stored = h.store.get_payment(payment.id).unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Success);
        assert!(stored.error_code.is_none());

        let last = h.store.logs_for_payment(payment.id).unwrap().pop().unwrap();
        assert_eq!(last.action, PaymentAction::CancelCallback);
        assert_eq!(last.new_status, Some(PaymentStatus::Success));
        assert!(last.error_message.unwrap().contains("callback ignored"));
    }

    #[tokio::test]
    async fn fail_callback_for_unknown_payment_still_redirects() {
        let h = harness();
        let outcome = h.reconciler.handle_fail_callback("TXN_UNKNOWN_1", None, None).await;
        assert!(outcome.redirect_url.ends_with("status=Failed"));
    }

    #[tokio::test]
    async fn crypto_webhook_settles_order() {
        let h = harness();
        let payment = h.pending_crypto("CRYPTO-1");

        let ack = h
            .reconciler
            .handle_crypto_webhook(&webhook("CRYPTO-1"), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)))
            .await;

        assert_eq!(ack, Acknowledgement::received());
        let stored = h.store.find_crypto_by_order_id("CRYPTO-1").unwrap().unwrap();
        assert_eq!(stored.status, CryptoPaymentStatus::Success);
        assert_eq!(stored.trace_id.as_deref(), Some("trace-1"));
        assert_eq!(stored.txid.as_deref(), Some("0xabc"));
        assert_eq!(
            h.crypto_actions(payment.id),
            vec![
                CryptoPaymentAction::Initialize,
                CryptoPaymentAction::CallbackReceived,
                CryptoPaymentAction::VerificationSuccess,
            ]
        );
    }

    #[tokio::test]
    async fn repeated_crypto_webhook_is_short_circuited() {
        let h = harness();
        let payment = h.pending_crypto("CRYPTO-1");

        h.reconciler.handle_crypto_webhook(&webhook("CRYPTO-1"), None).await;
        assert_eq!(h.crypto_gateway.result_calls(), 1);

        let ack = h.reconciler.handle_crypto_webhook(&webhook("CRYPTO-1"), None).await;

        assert_eq!(ack, Acknowledgement::received());
        assert_eq!(h.crypto_gateway.result_calls(), 1);
        let successes = h
            .crypto_actions(payment.id)
            .into_iter()
            .filter(|action| *action == CryptoPaymentAction::VerificationSuccess)
            .count();
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn spoofed_crypto_result_leaves_order_pending() {
        let h = harness();
        let payment = h.pending_crypto("CRYPTO-1");
        h.crypto_gateway
            .set_result(Some(FakeCryptoGateway::settled("10.0000", "usd", "attacker")));

        h.reconciler.handle_crypto_webhook(&webhook("CRYPTO-1"), None).await;

        let stored = h.store.find_crypto_by_order_id("CRYPTO-1").unwrap().unwrap();
        assert_eq!(stored.status, CryptoPaymentStatus::Pending);
        let logs = h.store.crypto_logs_for_payment(payment.id).unwrap();
        let last = logs.last().unwrap();
        assert_eq!(last.action, CryptoPaymentAction::VerificationFailed);
        assert_eq!(last.error_message.as_deref(), Some("payee id mismatch"));
    }

    #[tokio::test]
    async fn wrong_amount_leaves_order_pending_until_retry() {
        let h = harness();
        h.pending_crypto("CRYPTO-1");
        h.crypto_gateway
            .push_result(FakeCryptoGateway::settled("9.5000", "usd", crate::testing::TEST_PAYEE_ID));

        h.reconciler.handle_crypto_webhook(&webhook("CRYPTO-1"), None).await;
        assert_eq!(
            h.store.find_crypto_by_order_id("CRYPTO-1").unwrap().unwrap().status,
            CryptoPaymentStatus::Pending
        );

        h.reconciler.handle_crypto_webhook(&webhook("CRYPTO-1"), None).await;
        assert_eq!(
            h.store.find_crypto_by_order_id("CRYPTO-1").unwrap().unwrap().status,
            CryptoPaymentStatus::Success
        );
    }

    #[tokio::test]
    async fn unlisted_source_is_acknowledged_but_ignored() {
        let allowed = vec![IpAddr::V4(Ipv4Addr::new(198, 51, 100, 20))];
        let h = harness_with(FakeReseller::accepting(), Some(allowed));
        h.pending_crypto("CRYPTO-1");

        let ack = h
            .reconciler
            .handle_crypto_webhook(
                &webhook("CRYPTO-1"),
                Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))),
            )
            .await;
        assert_eq!(ack, Acknowledgement::received());
        assert_eq!(h.crypto_gateway.result_calls(), 0);

        h.reconciler
            .handle_crypto_webhook(
                &webhook("CRYPTO-1"),
                Some(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 20))),
            )
            .await;
        assert_eq!(h.crypto_gateway.result_calls(), 1);
    }

    #[tokio::test]
    async fn malformed_or_unknown_webhooks_are_acknowledged() {
        let h = harness();
        let ack = h.reconciler.handle_crypto_webhook(&json!({"foo": 1}), None).await;
        assert_eq!(ack, Acknowledgement::received());
        let ack = h.reconciler.handle_crypto_webhook(&webhook("NOPE"), None).await;
        assert_eq!(ack, Acknowledgement::received());
        assert_eq!(h.crypto_gateway.result_calls(), 0);
    }

    #[tokio::test]
    async fn manual_verify_settles_for_owner_only() {
        let h = harness();
        let payment = h.pending_crypto("CRYPTO-1");

        let err = h
            .reconciler
            .verify_and_complete("CRYPTO-1", "user-2", None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "FORBIDDEN");
        assert_eq!(h.crypto_gateway.result_calls(), 0);

        let result = h
            .reconciler
            .verify_and_complete("CRYPTO-1", "user-1", Some("203.0.113.7"))
            .await
            .unwrap();
        assert!(matches!(result, CryptoReconciliation::Settled(_)));
        assert_eq!(
            h.crypto_actions(payment.id).last(),
            Some(&CryptoPaymentAction::ManualVerifySuccess)
        );

        let again = h
            .reconciler
            .verify_and_complete("CRYPTO-1", "user-1", None)
            .await
            .unwrap();
        assert!(matches!(again, CryptoReconciliation::AlreadySettled(_)));
        assert_eq!(h.crypto_gateway.result_calls(), 1);
    }

    #[tokio::test]
    async fn manual_verify_reports_unverified() {
        let h = harness();
        h.pending_crypto("CRYPTO-1");
        h.crypto_gateway.set_result(Some(GatewayReply::new(
            200,
            json!({"success": true, "data": {"status": "pending"}}).to_string(),
        )));

        let result = h
            .reconciler
            .verify_and_complete("CRYPTO-1", "user-1", None)
            .await
            .unwrap();
        assert!(!result.is_settled());
        assert_eq!(result.payment().status, CryptoPaymentStatus::Pending);
    }
}
