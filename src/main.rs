// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::env;
use std::process::ExitCode;

use proxy_payments::config::LOG_FORMAT_ENV;
use proxy_payments::state::AppState;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = env::var(LOG_FORMAT_ENV).is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let state = match AppState::from_env() {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "Failed to start payment engine");
            return ExitCode::FAILURE;
        }
    };
    info!(
        database = %state.worker.database_path().display(),
        "Payment engine started"
    );

    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(state.expiry_sweeper().run(shutdown.clone()));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown requested");
    shutdown.cancel();

    if let Err(e) = sweeper.await {
        error!(error = %e, "Expiry sweeper task failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
