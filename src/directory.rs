// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! User directory collaborator.
//!
//! Registration, login and credential hashing live outside the payment core.
//! The core only needs to find a user's reseller account handle before a
//! balance grant. [`InMemoryUserDirectory`] backs the worker binary and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    /// Opaque credential hash, produced and checked by the auth service.
    pub password_hash: String,
    /// Sub-account handle on the proxy reseller. Absent until provisioned.
    pub reseller_account: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
    pub reseller_account: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("email {0} is already registered")]
    EmailTaken(String),

    #[error("user {0} not found")]
    NotFound(String),
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Option<User>;

    async fn find_by_id(&self, id: &str) -> Option<User>;

    async fn create(&self, new: NewUser) -> Result<User, DirectoryError>;

    async fn update_password(&self, id: &str, password_hash: &str) -> Result<(), DirectoryError>;
}

#[derive(Debug, Default)]
pub struct InMemoryUserDirectory {
    users: RwLock<HashMap<String, User>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find_by_email(&self, email: &str) -> Option<User> {
        self.users
            .read()
            .await
            .values()
            .find(|user| user.email.eq_ignore_ascii_case(email))
            .cloned()
    }

    async fn find_by_id(&self, id: &str) -> Option<User> {
        self.users.read().await.get(id).cloned()
    }

    async fn create(&self, new: NewUser) -> Result<User, DirectoryError> {
        let mut users = self.users.write().await;
        if users
            .values()
            .any(|user| user.email.eq_ignore_ascii_case(&new.email))
        {
            return Err(DirectoryError::EmailTaken(new.email));
        }

        let user = User {
            id: Uuid::new_v4().to_string(),
            email: new.email,
            password_hash: new.password_hash,
            reseller_account: new.reseller_account,
            created_at: Utc::now(),
        };
        users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn update_password(&self, id: &str, password_hash: &str) -> Result<(), DirectoryError> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(id)
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))?;
        user.password_hash = password_hash.to_string();
        Ok(())
    }
}
