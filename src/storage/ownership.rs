// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Ownership enforcement for caller-facing reads.
//!
//! Callers are identified by an opaque user id issued by the API's own
//! authentication layer. A payment is only visible to the user who created it.

/// Trait for records that belong to one user.
pub trait OwnedResource {
    /// Get the owner's user ID.
    fn owner_user_id(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    #[error("resource not found")]
    NotFound,

    #[error("user {user_id} does not own this resource")]
    Forbidden { user_id: String },
}

/// Verify ownership of an optional lookup result.
pub trait OwnershipCheck<T> {
    /// Return the resource if it exists and belongs to `user_id`.
    fn verify_owner(self, user_id: &str) -> Result<T, AccessError>;
}

impl<T: OwnedResource> OwnershipCheck<T> for Option<T> {
    fn verify_owner(self, user_id: &str) -> Result<T, AccessError> {
        match self {
            Some(resource) if resource.owner_user_id() == user_id => Ok(resource),
            Some(_) => Err(AccessError::Forbidden {
                user_id: user_id.to_string(),
            }),
            None => Err(AccessError::NotFound),
        }
    }
}
