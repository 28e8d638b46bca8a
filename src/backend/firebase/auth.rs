//! Identity Toolkit client.
//!
//! Holds one session (ID token, refresh token, expiry) and publishes it
//! through a `SubscriberHub` the same way the in-process source does. The
//! ID token is refreshed through Secure Token when it is within a minute of
//! expiring. Federated credentials come from a `ConsentFlow`; this client
//! only exchanges them via `accounts:signInWithIdp`.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::{FirebaseConfig, IdTokenSource, parse_api_error};
use crate::clock::Clock;
use crate::identity::{
    ConsentFlow, FederatedCredential, Identity, IdentityError, IdentitySource, LinkRequest, ProviderKind,
    ProviderToken, SubscriberHub, Subscription, normalize_email,
};

const REFRESH_MARGIN_SECS: i64 = 60;
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

// =============================================================================
// CLIENT
// =============================================================================

struct AuthSession {
    identity: Arc<Identity>,
    id_token: String,
    refresh_token: String,
    expires_at: OffsetDateTime,
}

pub struct FirebaseAuth {
    http: reqwest::Client,
    config: FirebaseConfig,
    clock: Arc<dyn Clock>,
    session: Mutex<Option<AuthSession>>,
    hub: SubscriberHub,
    consent: Option<Arc<dyn ConsentFlow>>,
}

impl FirebaseAuth {
    /// # Errors
    ///
    /// `Transport` if the HTTP client cannot be built.
    pub fn new(config: FirebaseConfig, clock: Arc<dyn Clock>) -> Result<Self, IdentityError> {
        let http = config.http_client().map_err(transport)?;
        Ok(Self { http, config, clock, session: Mutex::new(None), hub: SubscriberHub::new(), consent: None })
    }

    #[must_use]
    pub fn with_consent(mut self, consent: Arc<dyn ConsentFlow>) -> Self {
        self.consent = Some(consent);
        self
    }

    fn session(&self) -> std::sync::MutexGuard<'_, Option<AuthSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accounts_url(&self, method: &str) -> String {
        format!("{}/accounts:{method}?key={}", self.config.auth_url, self.config.api_key)
    }

    async fn call<B, R>(&self, url: &str, body: &B) -> Result<R, IdentityError>
    where
        B: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(transport)?;
        if status != 200 {
            return Err(error_from_response(status, &text));
        }
        serde_json::from_str(&text).map_err(|e| IdentityError::Backend { code: "DECODE".into(), message: e.to_string() })
    }

    async fn lookup(&self, id_token: &str) -> Result<Identity, IdentityError> {
        let response: LookupResponse = self
            .call(&self.accounts_url("lookup"), &serde_json::json!({ "idToken": id_token }))
            .await?;
        let user = response
            .users
            .into_iter()
            .next()
            .ok_or(IdentityError::NotSignedIn)?;
        Ok(identity_from_user(user))
    }

    /// Adopt fresh tokens as the session. Publishes when the uid changed.
    async fn establish(&self, grant: TokenGrant) -> Result<Arc<Identity>, IdentityError> {
        let identity = Arc::new(self.lookup(&grant.id_token).await?);
        let expires_at = expiry(self.clock.now(), &grant.expires_in);
        let changed = {
            let mut session = self.session();
            let changed = session.as_ref().map(|s| s.identity.uid.as_str()) != Some(identity.uid.as_str());
            *session = Some(AuthSession {
                identity: Arc::clone(&identity),
                id_token: grant.id_token,
                refresh_token: grant.refresh_token,
                expires_at,
            });
            changed
        };
        if changed {
            info!(uid = %identity.uid, "firebase session established");
            self.hub.publish(&Some(Arc::clone(&identity)));
        }
        Ok(identity)
    }

    /// Current ID token, refreshed first when close to expiry.
    async fn fresh_token(&self) -> Result<Option<String>, IdentityError> {
        let (id_token, refresh_token, expires_at) = {
            let session = self.session();
            let Some(s) = session.as_ref() else {
                return Ok(None);
            };
            (s.id_token.clone(), s.refresh_token.clone(), s.expires_at)
        };
        let now = self.clock.now();
        if !needs_refresh(expires_at, now) {
            return Ok(Some(id_token));
        }

        debug!("refreshing firebase id token");
        let url = format!("{}/token?key={}", self.config.token_url, self.config.api_key);
        let body = serde_json::json!({ "grant_type": "refresh_token", "refresh_token": refresh_token });
        let refreshed: RefreshResponse = self.call(&url, &body).await?;
        let expires_at = expiry(now, &refreshed.expires_in);
        if let Some(s) = self.session().as_mut() {
            s.id_token.clone_from(&refreshed.id_token);
            s.refresh_token = refreshed.refresh_token;
            s.expires_at = expires_at;
        }
        Ok(Some(refreshed.id_token))
    }

    /// Token for an operation on `identity`, which must be the session user.
    async fn token_for(&self, identity: &Identity) -> Result<String, IdentityError> {
        let current = self.session().as_ref().map(|s| s.identity.uid.clone());
        if current.as_deref() != Some(identity.uid.as_str()) {
            return Err(IdentityError::NotSignedIn);
        }
        self.fresh_token().await?.ok_or(IdentityError::NotSignedIn)
    }

    async fn run_consent(&self, kind: ProviderKind) -> Result<FederatedCredential, IdentityError> {
        let Some(consent) = &self.consent else {
            return Err(IdentityError::Unsupported(format!("no consent flow configured for {kind}")));
        };
        consent.obtain(kind).await
    }

    async fn exchange_idp(&self, credential: &FederatedCredential, id_token: Option<String>) -> Result<TokenGrant, IdentityError> {
        let request = IdpRequest {
            post_body: idp_post_body(credential)?,
            request_uri: &self.config.idp_request_uri,
            return_secure_token: true,
            return_idp_credential: true,
            id_token,
        };
        let response: IdpResponse = self
            .call(&self.accounts_url("signInWithIdp"), &request)
            .await?;
        response.into_grant()
    }
}

#[async_trait::async_trait]
impl IdentitySource for FirebaseAuth {
    async fn sign_up(&self, email: &str, password: &str) -> Result<Arc<Identity>, IdentityError> {
        let email = normalize_email(email).ok_or(IdentityError::InvalidEmail)?;
        let grant: TokenGrant = self
            .call(&self.accounts_url("signUp"), &PasswordRequest { email: &email, password, return_secure_token: true })
            .await?;
        self.establish(grant).await
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Arc<Identity>, IdentityError> {
        let email = normalize_email(email).ok_or(IdentityError::InvalidEmail)?;
        let grant: TokenGrant = self
            .call(
                &self.accounts_url("signInWithPassword"),
                &PasswordRequest { email: &email, password, return_secure_token: true },
            )
            .await?;
        self.establish(grant).await
    }

    async fn sign_in_federated(&self, kind: ProviderKind) -> Result<Arc<Identity>, IdentityError> {
        let credential = self.run_consent(kind).await?;
        let grant = self.exchange_idp(&credential, None).await?;
        self.establish(grant).await
    }

    async fn sign_out(&self) -> Result<(), IdentityError> {
        let ended = self.session().take();
        if let Some(session) = ended {
            info!(uid = %session.identity.uid, "firebase session ended");
            self.hub.publish(&None);
        }
        Ok(())
    }

    async fn link(&self, identity: &Identity, request: LinkRequest) -> Result<Arc<Identity>, IdentityError> {
        let id_token = self.token_for(identity).await?;
        let grant = match request {
            LinkRequest::EmailPassword { email, password } => {
                let email = normalize_email(&email).ok_or(IdentityError::InvalidEmail)?;
                let body = serde_json::json!({
                    "idToken": id_token,
                    "email": email,
                    "password": password,
                    "returnSecureToken": true,
                });
                self.call(&self.accounts_url("update"), &body).await?
            }
            LinkRequest::Federated(kind) => {
                let credential = self.run_consent(kind).await?;
                self.exchange_idp(&credential, Some(id_token)).await?
            }
        };
        self.establish(grant).await
    }

    async fn unlink(&self, identity: &Identity, provider_id: &str) -> Result<Arc<Identity>, IdentityError> {
        if !identity.has_provider(provider_id) {
            return Err(IdentityError::NoSuchProvider(provider_id.to_owned()));
        }
        let id_token = self.token_for(identity).await?;
        let body = serde_json::json!({ "idToken": id_token, "deleteProvider": [provider_id] });
        let _response: serde_json::Value = self.call(&self.accounts_url("update"), &body).await?;

        let updated = Arc::new(self.lookup(&id_token).await?);
        if let Some(s) = self
            .session()
            .as_mut()
            .filter(|s| s.identity.uid == updated.uid)
        {
            s.identity = Arc::clone(&updated);
        }
        Ok(updated)
    }

    async fn subscribe(&self) -> Subscription {
        let current = self.session().as_ref().map(|s| Arc::clone(&s.identity));
        self.hub.subscribe(current)
    }
}

#[async_trait::async_trait]
impl IdTokenSource for FirebaseAuth {
    async fn id_token(&self) -> Option<String> {
        match self.fresh_token().await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "id token refresh failed; continuing unauthenticated");
                None
            }
        }
    }
}

fn transport(e: reqwest::Error) -> IdentityError {
    IdentityError::Transport(e.to_string())
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PasswordRequest<'a> {
    email: &'a str,
    password: &'a str,
    return_secure_token: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IdpRequest<'a> {
    post_body: String,
    request_uri: &'a str,
    return_secure_token: bool,
    return_idp_credential: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    id_token: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenGrant {
    id_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: String,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdpResponse {
    id_token: Option<String>,
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: String,
    #[serde(default)]
    need_confirmation: bool,
    error_message: Option<String>,
}

impl IdpResponse {
    fn into_grant(self) -> Result<TokenGrant, IdentityError> {
        if self.need_confirmation {
            return Err(IdentityError::AccountExistsWithDifferentCredential);
        }
        if let Some(message) = self.error_message {
            return Err(map_auth_error(&message));
        }
        match (self.id_token, self.refresh_token) {
            (Some(id_token), Some(refresh_token)) => Ok(TokenGrant { id_token, refresh_token, expires_in: self.expires_in }),
            _ => Err(IdentityError::Backend { code: "MISSING_TOKENS".into(), message: "signInWithIdp returned no tokens".into() }),
        }
    }
}

/// Secure Token uses snake_case, unlike Identity Toolkit.
#[derive(Debug, serde::Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: String,
}

#[derive(Debug, serde::Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<LookupUser>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupUser {
    local_id: String,
    email: Option<String>,
    display_name: Option<String>,
    photo_url: Option<String>,
    #[serde(default)]
    provider_user_info: Vec<ProviderUserInfo>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderUserInfo {
    provider_id: String,
}

// =============================================================================
// PARSING
// =============================================================================

fn identity_from_user(user: LookupUser) -> Identity {
    let mut providers: Vec<String> = Vec::with_capacity(user.provider_user_info.len());
    for info in user.provider_user_info {
        if !providers.contains(&info.provider_id) {
            providers.push(info.provider_id);
        }
    }
    Identity {
        uid: user.local_id,
        display_name: user.display_name.filter(|s| !s.is_empty()),
        photo_url: user.photo_url.filter(|s| !s.is_empty()),
        email: user.email.filter(|s| !s.is_empty()),
        providers,
    }
}

/// Map an Identity Toolkit error message (`CODE` or `CODE : detail`).
fn map_auth_error(message: &str) -> IdentityError {
    let (code, detail) = match message.split_once(':') {
        Some((code, detail)) => (code.trim(), detail.trim()),
        None => (message.trim(), ""),
    };
    match code {
        "EMAIL_EXISTS" => IdentityError::EmailAlreadyInUse,
        "INVALID_LOGIN_CREDENTIALS" | "INVALID_PASSWORD" | "EMAIL_NOT_FOUND" | "INVALID_IDP_RESPONSE" => {
            IdentityError::InvalidCredentials
        }
        "INVALID_EMAIL" | "MISSING_EMAIL" => IdentityError::InvalidEmail,
        "WEAK_PASSWORD" => IdentityError::WeakPassword(detail.to_owned()),
        "FEDERATED_USER_ID_ALREADY_LINKED" | "CREDENTIAL_ALREADY_IN_USE" => IdentityError::CredentialAlreadyInUse,
        "CREDENTIAL_TOO_OLD_LOGIN_AGAIN" => IdentityError::RequiresRecentLogin,
        "TOKEN_EXPIRED" | "INVALID_ID_TOKEN" | "INVALID_REFRESH_TOKEN" | "USER_NOT_FOUND" | "USER_DISABLED" => {
            IdentityError::NotSignedIn
        }
        "OPERATION_NOT_ALLOWED" => IdentityError::Unsupported(message.to_owned()),
        _ => IdentityError::Backend { code: code.to_owned(), message: detail.to_owned() },
    }
}

fn error_from_response(status: u16, body: &str) -> IdentityError {
    match parse_api_error(body) {
        Some(err) => map_auth_error(&err.message),
        None if status >= 500 => IdentityError::Transport(format!("HTTP {status}")),
        None => IdentityError::Backend { code: status.to_string(), message: body.chars().take(200).collect() },
    }
}

/// Form-encoded `postBody` for `accounts:signInWithIdp`.
fn idp_post_body(credential: &FederatedCredential) -> Result<String, IdentityError> {
    let token_param = match credential.token {
        ProviderToken::IdToken(_) => "id_token",
        ProviderToken::AccessToken(_) => "access_token",
    };
    let params = [(token_param, credential.token.secret()), ("providerId", credential.provider.id())];
    let url = reqwest::Url::parse_with_params("http://localhost/", &params)
        .map_err(|e| IdentityError::Backend { code: "POST_BODY".into(), message: e.to_string() })?;
    Ok(url.query().unwrap_or_default().to_owned())
}

/// Absolute expiry from a relative `expiresIn` (seconds, as a string).
fn expiry(now: OffsetDateTime, expires_in: &str) -> OffsetDateTime {
    let secs = expires_in
        .trim()
        .parse::<i64>()
        .unwrap_or(DEFAULT_EXPIRES_IN_SECS);
    now + time::Duration::seconds(secs)
}

fn needs_refresh(expires_at: OffsetDateTime, now: OffsetDateTime) -> bool {
    expires_at - now <= time::Duration::seconds(REFRESH_MARGIN_SECS)
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
