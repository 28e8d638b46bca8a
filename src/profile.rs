//! Profile documents and the store contract.
//!
//! DESIGN
//! ======
//! `ProfileRecord` mirrors the stored document, one per identity uid.
//! `ProfilePatch` is the partial-merge payload: fields left `None` are not
//! touched by a write. `uid`, `email` and `age` are only set inside the
//! crate (provisioning and age derivation); stores read them through the
//! accessors.

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use crate::error::ErrorCode;

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

// =============================================================================
// RECORD
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRecord {
    pub uid: String,
    pub email: String,
    pub display_name: Option<String>,
    #[serde(rename = "photoURL")]
    pub photo_url: Option<String>,
    pub address: Option<String>,
    #[serde(with = "iso_date::option", default)]
    pub birth_date: Option<Date>,
    pub age: Option<i32>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ProfileRecord {
    /// Empty record stamped at `now`, as a store creates it before merging.
    #[must_use]
    pub fn blank(uid: &str, now: OffsetDateTime) -> Self {
        Self {
            uid: uid.to_owned(),
            email: String::new(),
            display_name: None,
            photo_url: None,
            address: None,
            birth_date: None,
            age: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply the fields present in `patch`, leaving the rest untouched.
    /// Timestamps are the store's concern and are not changed here.
    pub fn merge(&mut self, patch: &ProfilePatch) {
        if let Some(uid) = &patch.uid {
            self.uid.clone_from(uid);
        }
        if let Some(email) = &patch.email {
            self.email.clone_from(email);
        }
        if let Some(name) = &patch.display_name {
            self.display_name = Some(name.clone());
        }
        if let Some(photo) = &patch.photo_url {
            self.photo_url = Some(photo.clone());
        }
        if let Some(address) = &patch.address {
            self.address = Some(address.clone());
        }
        if let Some(birth_date) = patch.birth_date {
            self.birth_date = Some(birth_date);
        }
        if let Some(age) = patch.age {
            self.age = Some(age);
        }
    }
}

// =============================================================================
// PATCH
// =============================================================================

/// Partial profile update. Build with the setter methods.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(rename = "photoURL", skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(with = "iso_date::option", skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<Date>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) age: Option<i32>,
}

impl ProfilePatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn display_name(mut self, value: impl Into<String>) -> Self {
        self.display_name = Some(value.into());
        self
    }

    #[must_use]
    pub fn photo_url(mut self, value: impl Into<String>) -> Self {
        self.photo_url = Some(value.into());
        self
    }

    #[must_use]
    pub fn address(mut self, value: impl Into<String>) -> Self {
        self.address = Some(value.into());
        self
    }

    #[must_use]
    pub fn birth_date(mut self, value: Date) -> Self {
        self.birth_date = Some(value);
        self
    }

    #[must_use]
    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    #[must_use]
    pub fn age(&self) -> Option<i32> {
        self.age
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Document field names this patch writes, in a stable order.
    #[must_use]
    pub fn field_paths(&self) -> Vec<&'static str> {
        let present = [
            ("uid", self.uid.is_some()),
            ("email", self.email.is_some()),
            ("displayName", self.display_name.is_some()),
            ("photoURL", self.photo_url.is_some()),
            ("address", self.address.is_some()),
            ("birthDate", self.birth_date.is_some()),
            ("age", self.age.is_some()),
        ];
        present
            .into_iter()
            .filter_map(|(name, set)| set.then_some(name))
            .collect()
    }
}

// =============================================================================
// STORE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("permission denied")]
    PermissionDenied,
    #[error("no credentials for the profile store")]
    Unauthenticated,
    #[error("profile store unavailable: {0}")]
    Unavailable(String),
    /// The record was absent right after a successful write.
    #[error("profile {uid} missing after write")]
    Missing { uid: String },
    #[error("backend error {code}: {message}")]
    Backend { code: String, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("document decode failed: {0}")]
    Decode(String),
}

impl ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "E_PERMISSION_DENIED",
            Self::Unauthenticated => "E_STORE_UNAUTHENTICATED",
            Self::Unavailable(_) => "E_STORE_UNAVAILABLE",
            Self::Missing { .. } => "E_PROFILE_MISSING",
            Self::Backend { .. } => "E_STORE_BACKEND",
            Self::Transport(_) => "E_STORE_TRANSPORT",
            Self::Decode(_) => "E_STORE_DECODE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Transport(_))
    }
}

/// Document store holding one profile per identity uid.
#[async_trait::async_trait]
pub trait ProfileStore: Send + Sync {
    async fn read(&self, uid: &str) -> Result<Option<ProfileRecord>, StoreError>;

    /// Create the document if absent, otherwise merge `patch` into it.
    /// `createdAt` is stamped only on creation; `updatedAt` on every write.
    async fn write_merge(&self, uid: &str, patch: &ProfilePatch) -> Result<(), StoreError>;
}

#[cfg(test)]
#[path = "profile_test.rs"]
mod tests;
