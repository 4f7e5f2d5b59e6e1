// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use crate::config::{ConfigError, EpsConfig, MixPayConfig, ResellerConfig, WorkerConfig};
use crate::directory::{InMemoryUserDirectory, UserDirectory};
use crate::expiry::ExpirySweeper;
use crate::payments::{CryptoPaymentService, FiatPaymentService, PaymentQueries, PaymentReconciler};
use crate::providers::eps::{EpsClient, EpsError};
use crate::providers::mixpay::{MixPayClient, MixPayError};
use crate::providers::reseller::{ResellerClient, ResellerError};
use crate::storage::{PaymentStore, StoreError};

/// Failure while wiring the application together.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Eps(#[from] EpsError),

    #[error(transparent)]
    MixPay(#[from] MixPayError),

    #[error(transparent)]
    Reseller(#[from] ResellerError),
}

/// Every service of the payment engine, sharing one store.
#[derive(Clone)]
pub struct AppState {
    pub worker: WorkerConfig,
    pub store: Arc<PaymentStore>,
    pub fiat: Arc<FiatPaymentService>,
    pub crypto: Arc<CryptoPaymentService>,
    pub reconciler: Arc<PaymentReconciler>,
    pub queries: Arc<PaymentQueries>,
    pub directory: Arc<dyn UserDirectory>,
}

impl AppState {
    /// Build the state from environment configuration with real gateway
    /// clients and an in-memory user directory.
    pub fn from_env() -> Result<Self, StartupError> {
        let worker = WorkerConfig::from_env()?;
        let eps = EpsConfig::from_env()?;
        let mixpay = MixPayConfig::from_env()?;
        let reseller = ResellerConfig::from_env()?;
        let store = Arc::new(PaymentStore::open(&worker.database_path())?);

        let timeout = worker.gateway_timeout;
        let fiat_gateway = Arc::new(EpsClient::new(&eps.base_url, timeout)?);
        let crypto_gateway = Arc::new(MixPayClient::new(&mixpay.api_base_url, timeout)?);
        let reseller_client = Arc::new(ResellerClient::new(
            &reseller.api_base_url,
            &reseller.api_key,
            timeout,
        )?);

        let fiat = Arc::new(FiatPaymentService::new(store.clone(), fiat_gateway, eps));
        let crypto = Arc::new(CryptoPaymentService::new(
            store.clone(),
            crypto_gateway,
            mixpay,
        ));
        let directory: Arc<dyn UserDirectory> = Arc::new(InMemoryUserDirectory::new());
        let reconciler = Arc::new(PaymentReconciler::new(
            store.clone(),
            fiat.clone(),
            crypto.clone(),
            directory.clone(),
            reseller_client,
            reseller.balance_multiplier,
        ));
        let queries = Arc::new(PaymentQueries::new(store.clone()));

        Ok(Self {
            worker,
            store,
            fiat,
            crypto,
            reconciler,
            queries,
            directory,
        })
    }

    /// Sweeper for stale fiat payments, configured from the worker settings.
    pub fn expiry_sweeper(&self) -> ExpirySweeper {
        ExpirySweeper::new(self.store.clone())
            .with_threshold_minutes(self.worker.expiry_threshold_minutes)
            .with_interval(self.worker.expiry_sweep_interval)
    }
}
