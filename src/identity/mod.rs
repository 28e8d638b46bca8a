//! Identity session source: the external authentication collaborator.
//!
//! DESIGN
//! ======
//! The source owns the signed-in [`Identity`] and hands out `Arc`s to it;
//! consumers hold the reference and never rebuild it. Session changes are
//! pushed through [`hub::Subscription`] channels.

pub mod hub;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
pub use hub::{IdentityEvent, SubscriberHub, Subscription};

// =============================================================================
// IDENTITY
// =============================================================================

/// The authenticated user as reported by the identity source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub uid: String,
    pub display_name: Option<String>,
    #[serde(rename = "photoURL")]
    pub photo_url: Option<String>,
    pub email: Option<String>,
    /// Linked provider ids in link order (e.g. `"password"`, `"google.com"`).
    pub providers: Vec<String>,
}

impl Identity {
    #[must_use]
    pub fn has_provider(&self, provider_id: &str) -> bool {
        self.providers.iter().any(|p| p == provider_id)
    }
}

// =============================================================================
// PROVIDERS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Password,
    Google,
    Facebook,
}

impl ProviderKind {
    pub const ALL: [Self; 3] = [Self::Password, Self::Google, Self::Facebook];

    /// Canonical provider id as stored on the identity.
    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::Google => "google.com",
            Self::Facebook => "facebook.com",
        }
    }

    /// Human-facing name for account settings screens.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Password => "Email/Password",
            Self::Google => "Google",
            Self::Facebook => "Facebook",
        }
    }

    #[must_use]
    pub fn from_id(provider_id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.id() == provider_id)
    }

    #[must_use]
    pub fn is_federated(self) -> bool {
        !matches!(self, Self::Password)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Token returned by a federated consent screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderToken {
    IdToken(String),
    AccessToken(String),
}

impl ProviderToken {
    #[must_use]
    pub fn secret(&self) -> &str {
        match self {
            Self::IdToken(t) | Self::AccessToken(t) => t,
        }
    }
}

/// Optional profile hints the provider shares alongside its token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FederatedProfile {
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
}

/// Outcome of a completed federated consent flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederatedCredential {
    pub provider: ProviderKind,
    pub token: ProviderToken,
    pub profile: FederatedProfile,
}

/// What to attach to an existing identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkRequest {
    EmailPassword { email: String, password: String },
    /// The source runs its consent flow for this provider.
    Federated(ProviderKind),
}

impl LinkRequest {
    #[must_use]
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::EmailPassword { .. } => ProviderKind::Password,
            Self::Federated(kind) => *kind,
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("invalid email address")]
    InvalidEmail,
    #[error("email already in use")]
    EmailAlreadyInUse,
    #[error("weak password: {0}")]
    WeakPassword(String),
    #[error("sign-in popup closed by user")]
    PopupClosedByUser,
    #[error("an account already exists with the same email but different sign-in credentials")]
    AccountExistsWithDifferentCredential,
    #[error("credential already associated with a different account")]
    CredentialAlreadyInUse,
    #[error("provider {0} is already linked")]
    ProviderAlreadyLinked(String),
    #[error("provider {0} is not linked")]
    NoSuchProvider(String),
    #[error("recent sign-in required")]
    RequiresRecentLogin,
    #[error("no signed-in session")]
    NotSignedIn,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("backend error {code}: {message}")]
    Backend { code: String, message: String },
    #[error("transport error: {0}")]
    Transport(String),
}

impl IdentityError {
    /// Message suitable for showing to the person at the keyboard.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidCredentials => "The email or password is incorrect.".into(),
            Self::InvalidEmail => "Please enter a valid email address.".into(),
            Self::EmailAlreadyInUse => "An account with this email already exists.".into(),
            Self::WeakPassword(_) => "Password should be at least 6 characters.".into(),
            Self::PopupClosedByUser => "Sign-in was cancelled before it finished.".into(),
            Self::AccountExistsWithDifferentCredential => {
                "An account already exists with this email. Sign in with your original method, then link this one."
                    .into()
            }
            Self::CredentialAlreadyInUse => "This credential is already associated with a different user account.".into(),
            Self::ProviderAlreadyLinked(provider) => {
                let name = provider_name(provider);
                format!("{name} is already linked to your account.")
            }
            Self::NoSuchProvider(provider) => {
                let name = provider_name(provider);
                format!("{name} is not linked to your account.")
            }
            Self::RequiresRecentLogin => "Please sign in again to complete this action.".into(),
            Self::NotSignedIn => "You are not signed in.".into(),
            Self::Unsupported(_) => "This sign-in method is not available.".into(),
            Self::Backend { .. } | Self::Transport(_) => "Something went wrong. Please try again.".into(),
        }
    }
}

/// Display label for a provider id, or the id itself when unknown.
fn provider_name(provider_id: &str) -> &str {
    match ProviderKind::from_id(provider_id) {
        Some(kind) => kind.label(),
        None => provider_id,
    }
}

impl ErrorCode for IdentityError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "E_INVALID_CREDENTIALS",
            Self::InvalidEmail => "E_INVALID_EMAIL",
            Self::EmailAlreadyInUse => "E_EMAIL_ALREADY_IN_USE",
            Self::WeakPassword(_) => "E_WEAK_PASSWORD",
            Self::PopupClosedByUser => "E_POPUP_CLOSED_BY_USER",
            Self::AccountExistsWithDifferentCredential => "E_ACCOUNT_EXISTS_WITH_DIFFERENT_CREDENTIAL",
            Self::CredentialAlreadyInUse => "E_CREDENTIAL_ALREADY_IN_USE",
            Self::ProviderAlreadyLinked(_) => "E_PROVIDER_ALREADY_LINKED",
            Self::NoSuchProvider(_) => "E_NO_SUCH_PROVIDER",
            Self::RequiresRecentLogin => "E_REQUIRES_RECENT_LOGIN",
            Self::NotSignedIn => "E_NOT_SIGNED_IN",
            Self::Unsupported(_) => "E_UNSUPPORTED",
            Self::Backend { .. } => "E_IDENTITY_BACKEND",
            Self::Transport(_) => "E_IDENTITY_TRANSPORT",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

// =============================================================================
// COLLABORATOR TRAITS
// =============================================================================

/// Authentication backend contract consumed by the reconciler.
#[async_trait::async_trait]
pub trait IdentitySource: Send + Sync {
    async fn sign_up(&self, email: &str, password: &str) -> Result<Arc<Identity>, IdentityError>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<Arc<Identity>, IdentityError>;

    /// Run the interactive consent flow for `kind` and sign in with its result.
    async fn sign_in_federated(&self, kind: ProviderKind) -> Result<Arc<Identity>, IdentityError>;

    async fn sign_out(&self) -> Result<(), IdentityError>;

    async fn link(&self, identity: &Identity, request: LinkRequest) -> Result<Arc<Identity>, IdentityError>;

    async fn unlink(&self, identity: &Identity, provider_id: &str) -> Result<Arc<Identity>, IdentityError>;

    /// Open a subscription. The current session is delivered first, then
    /// every sign-in and sign-out.
    async fn subscribe(&self) -> Subscription;
}

/// Interactive consent screen for a federated provider.
#[async_trait::async_trait]
pub trait ConsentFlow: Send + Sync {
    async fn obtain(&self, kind: ProviderKind) -> Result<FederatedCredential, IdentityError>;
}

/// Lowercase and trim an email, rejecting obviously malformed input.
#[must_use]
pub fn normalize_email(email: &str) -> Option<String> {
    let normalized = email.trim().to_ascii_lowercase();
    let (local, domain) = normalized.split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }
    Some(normalized)
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
