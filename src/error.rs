//! Reconciler error taxonomy.
//!
//! DESIGN
//! ======
//! Collaborator failures are wrapped, never flattened: presentation code
//! matches on `ReconcileError::Identity(IdentityError::...)` to pick a
//! message, and every variant carries a grepable code via [`ErrorCode`].

use crate::identity::IdentityError;
use crate::profile::StoreError;

/// Grepable error code and retryable flag for structured error reporting.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The operation needs a signed-in identity and there is none.
    #[error("not authenticated")]
    NotAuthenticated,

    /// A required email/password parameter was absent or blank.
    #[error("missing credentials: {0} is required")]
    MissingCredentials(&'static str),

    /// Unlinking would leave the identity with no way to sign in again.
    #[error("cannot unlink {provider_id}: it is the last linked sign-in method")]
    LastLinkedProvider { provider_id: String },

    /// Birth date is malformed or lies in the future.
    #[error("invalid birth date: {0}")]
    InvalidBirthDate(String),

    #[error("identity source: {0}")]
    Identity(#[from] IdentityError),

    #[error("profile store: {0}")]
    Store(#[from] StoreError),
}

impl ReconcileError {
    /// True for failures reported by the identity source or profile store.
    #[must_use]
    pub fn is_collaborator_failure(&self) -> bool {
        matches!(self, Self::Identity(_) | Self::Store(_))
    }
}

impl ErrorCode for ReconcileError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotAuthenticated => "E_NOT_AUTHENTICATED",
            Self::MissingCredentials(_) => "E_MISSING_CREDENTIALS",
            Self::LastLinkedProvider { .. } => "E_LAST_LINKED_PROVIDER",
            Self::InvalidBirthDate(_) => "E_INVALID_BIRTH_DATE",
            Self::Identity(e) => e.error_code(),
            Self::Store(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Identity(e) => e.retryable(),
            Self::Store(e) => e.retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;
