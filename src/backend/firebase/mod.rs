//! Hosted backend over the Firebase REST APIs.
//!
//! `FirebaseAuth` talks to Identity Toolkit and Secure Token; `FirestoreProfiles`
//! talks to the Firestore documents endpoint. Each is a thin HTTP wrapper;
//! request building and response parsing are pure functions so they can be
//! tested without a network.

pub mod auth;
pub mod firestore;

use std::time::Duration;

use tracing::debug;

use crate::config::{env_parse, env_string};

pub use auth::FirebaseAuth;
pub use firestore::FirestoreProfiles;

pub const DEFAULT_PROFILE_COLLECTION: &str = "users";
pub const DEFAULT_AUTH_URL: &str = "https://identitytoolkit.googleapis.com/v1";
pub const DEFAULT_TOKEN_URL: &str = "https://securetoken.googleapis.com/v1";
pub const DEFAULT_FIRESTORE_URL: &str = "https://firestore.googleapis.com/v1";
pub const DEFAULT_IDP_REQUEST_URI: &str = "http://localhost";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirebaseConfig {
    pub api_key: String,
    pub project_id: String,
    pub collection: String,
    pub auth_url: String,
    pub token_url: String,
    pub firestore_url: String,
    /// `requestUri` sent with federated sign-in.
    pub idp_request_uri: String,
    pub timeouts: HttpTimeouts,
}

impl FirebaseConfig {
    /// Build typed config from environment variables. `None` when the
    /// hosted backend is not configured.
    ///
    /// Required:
    /// - `FIREBASE_API_KEY`
    /// - `FIREBASE_PROJECT_ID`
    ///
    /// Optional:
    /// - `FIREBASE_PROFILE_COLLECTION`: default `users`
    /// - `FIREBASE_AUTH_URL`, `FIREBASE_TOKEN_URL`, `FIREBASE_FIRESTORE_URL`:
    ///   API base URLs, for emulators
    /// - `FIREBASE_IDP_REQUEST_URI`: default `http://localhost`
    /// - `FIREBASE_REQUEST_TIMEOUT_SECS`: default 30
    /// - `FIREBASE_CONNECT_TIMEOUT_SECS`: default 10
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let timeouts = HttpTimeouts {
            request_secs: env_parse("FIREBASE_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_secs: env_parse("FIREBASE_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS),
        };
        Self::from_lookup(env_string, timeouts)
    }

    /// Same as [`FirebaseConfig::from_env`] with an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>, timeouts: HttpTimeouts) -> Option<Self> {
        let api_key = lookup("FIREBASE_API_KEY")?;
        let project_id = lookup("FIREBASE_PROJECT_ID")?;
        let base = |key: &str, default: &str| {
            lookup(key)
                .unwrap_or_else(|| default.to_owned())
                .trim_end_matches('/')
                .to_owned()
        };

        Some(Self {
            api_key,
            project_id,
            collection: lookup("FIREBASE_PROFILE_COLLECTION").unwrap_or_else(|| DEFAULT_PROFILE_COLLECTION.to_owned()),
            auth_url: base("FIREBASE_AUTH_URL", DEFAULT_AUTH_URL),
            token_url: base("FIREBASE_TOKEN_URL", DEFAULT_TOKEN_URL),
            firestore_url: base("FIREBASE_FIRESTORE_URL", DEFAULT_FIRESTORE_URL),
            idp_request_uri: lookup("FIREBASE_IDP_REQUEST_URI").unwrap_or_else(|| DEFAULT_IDP_REQUEST_URI.to_owned()),
            timeouts,
        })
    }

    pub(crate) fn http_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeouts.request_secs))
            .connect_timeout(Duration::from_secs(self.timeouts.connect_secs))
            .build()
    }
}

/// Supplies the signed-in user's ID token for authorizing document calls.
#[async_trait::async_trait]
pub trait IdTokenSource: Send + Sync {
    /// A token valid for at least the next minute, or `None` when signed out.
    async fn id_token(&self) -> Option<String>;
}

/// The `error` object every Google REST API returns on failure.
#[derive(Debug, serde::Deserialize)]
pub(crate) struct ApiErrorBody {
    pub error: ApiError,
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct ApiError {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: String,
}

/// Extract the error object from a failure body, if it has one.
pub(crate) fn parse_api_error(body: &str) -> Option<ApiError> {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => Some(parsed.error),
        Err(e) => {
            debug!(error = %e, "failure body is not a Google API error");
            None
        }
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
