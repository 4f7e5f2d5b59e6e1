// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Payment errors with stable machine-readable codes.

use serde::Serialize;

use crate::signing::SigningError;
use crate::storage::{AccessError, DuplicateKey, StoreError};

/// Error returned by the payment orchestrators and read projections.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    /// Request failed validation before any external call.
    #[error("{0}")]
    Validation(String),

    #[error("Transaction ID already exists")]
    DuplicateTransactionId,

    #[error("Customer Order ID already exists")]
    DuplicateOrderId,

    #[error("Invalid Package ID selected.")]
    InvalidPackage,

    /// The fiat gateway refused to issue a bearer token.
    #[error("Failed to obtain authentication token: {0}")]
    Token(String),

    /// The gateway answered with a non-success status or an error body.
    #[error("Gateway error ({upstream_code}): {message}")]
    Gateway {
        upstream_code: String,
        message: String,
    },

    /// The gateway could not be reached.
    #[error("Gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Failed to parse gateway response: {0}")]
    Parse(String),

    #[error("Transaction not found")]
    NotFound,

    #[error("Payment belongs to another user")]
    Forbidden,

    #[error("Signing failed: {0}")]
    Signing(#[from] SigningError),

    #[error("Storage failure: {0}")]
    Store(StoreError),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub error_code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_code: Option<String>,
}

impl PaymentError {
    /// Stable code exposed to callers.
    pub fn error_code(&self) -> &'static str {
        match self {
            PaymentError::Validation(_) => "VALIDATION_ERROR",
            PaymentError::DuplicateTransactionId => "DUPLICATE_TRANSACTION_ID",
            PaymentError::DuplicateOrderId => "DUPLICATE_ORDER_ID",
            PaymentError::InvalidPackage => "INVALID_PACKAGE",
            PaymentError::Token(_) => "TOKEN_ERROR",
            PaymentError::Gateway { .. } => "GATEWAY_ERROR",
            PaymentError::GatewayUnavailable(_) => "GATEWAY_UNAVAILABLE",
            PaymentError::Parse(_) => "PARSE_ERROR",
            PaymentError::NotFound => "TRANSACTION_NOT_FOUND",
            PaymentError::Forbidden => "FORBIDDEN",
            PaymentError::Signing(_) => "SIGNING_ERROR",
            PaymentError::Store(_) => "STORAGE_ERROR",
        }
    }

    /// HTTP status class for the controller layer.
    pub fn status_code(&self) -> u16 {
        match self {
            PaymentError::Validation(_) | PaymentError::InvalidPackage => 400,
            PaymentError::Forbidden => 403,
            PaymentError::NotFound => 404,
            PaymentError::DuplicateTransactionId | PaymentError::DuplicateOrderId => 409,
            PaymentError::Token(_)
            | PaymentError::Gateway { .. }
            | PaymentError::GatewayUnavailable(_)
            | PaymentError::Parse(_) => 502,
            PaymentError::Signing(_) | PaymentError::Store(_) => 500,
        }
    }

    /// Response body safe to show to the caller.
    ///
    /// Internal failures are reduced to a generic message.
    pub fn to_body(&self) -> ErrorBody {
        let error = match self {
            PaymentError::Signing(_) | PaymentError::Store(_) => {
                "An internal error occurred".to_string()
            }
            PaymentError::GatewayUnavailable(_) => "Payment gateway is unavailable".to_string(),
            PaymentError::Gateway { .. } => "Payment gateway rejected the request".to_string(),
            other => other.to_string(),
        };
        let upstream_code = match self {
            PaymentError::Gateway { upstream_code, .. } => Some(upstream_code.clone()),
            _ => None,
        };
        ErrorBody {
            error,
            error_code: self.error_code(),
            upstream_code,
        }
    }
}

impl From<StoreError> for PaymentError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(DuplicateKey::MerchantTransactionId) => {
                PaymentError::DuplicateTransactionId
            }
            StoreError::Duplicate(DuplicateKey::CustomerOrderId)
            | StoreError::Duplicate(DuplicateKey::CryptoOrderId) => PaymentError::DuplicateOrderId,
            other => PaymentError::Store(other),
        }
    }
}

impl From<AccessError> for PaymentError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::NotFound => PaymentError::NotFound,
            AccessError::Forbidden { .. } => PaymentError::Forbidden,
        }
    }
}
