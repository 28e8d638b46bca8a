//! Session/profile reconciler. Joins the signed-in identity to its profile.
//!
//! ARCHITECTURE
//! ============
//! `Reconciler::start` opens the single identity subscription and hands it
//! to a driver task. The driver turns each identity event into a state
//! transition (fetching or provisioning the profile first) and publishes
//! the result on a `watch` channel that presentation code reads.
//!
//! Every state mutation runs under one async write gate: identity events,
//! profile updates, refreshes, link and unlink. Overlapping calls therefore
//! complete in the order they acquire the gate, and the last one to finish
//! defines the held state.
//!
//! ERROR HANDLING
//! ==============
//! Collaborator errors are logged with context and returned unchanged.
//! State changes only after a collaborator call succeeds; a failed write
//! leaves the held profile as it was. Results for an identity that is no
//! longer current are discarded.

mod provision;
mod state;

use std::sync::Arc;

use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::age::age_on;
use crate::clock::Clock;
use crate::config::ReconcilerConfig;
use crate::error::{ErrorCode, ReconcileError};
use crate::identity::{Identity, IdentityEvent, IdentitySource, LinkRequest, ProviderKind, Subscription, normalize_email};
use crate::profile::{ProfilePatch, ProfileRecord, ProfileStore};
pub use state::SessionState;

// =============================================================================
// RECONCILER
// =============================================================================

/// Owner of the combined identity + profile view.
///
/// Construct one per application session and pass it to presentation code
/// explicitly. Dropping it (or calling [`Reconciler::shutdown`]) releases
/// the identity subscription.
pub struct Reconciler {
    shared: Arc<Shared>,
    shutdown: Option<oneshot::Sender<()>>,
    driver: Option<JoinHandle<()>>,
}

struct Shared {
    identity: Arc<dyn IdentitySource>,
    profiles: Arc<dyn ProfileStore>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
    state: watch::Sender<SessionState>,
    gate: Mutex<()>,
}

impl Reconciler {
    /// Subscribe to `identity` and start reconciling. The state is
    /// [`SessionState::Loading`] until the first event has been handled.
    pub async fn start(
        identity: Arc<dyn IdentitySource>,
        profiles: Arc<dyn ProfileStore>,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
    ) -> Self {
        let subscription = identity.subscribe().await;
        let (state, _) = watch::channel(SessionState::Loading);
        let shared = Arc::new(Shared { identity, profiles, clock, config, state, gate: Mutex::new(()) });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let driver = tokio::spawn(drive(Arc::clone(&shared), subscription, shutdown_rx));
        info!("reconciler started");

        Self { shared, shutdown: Some(shutdown_tx), driver: Some(driver) }
    }

    /// Stop listening and wait for the subscription to be released.
    pub async fn shutdown(mut self) {
        drop(self.shutdown.take());
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                warn!(error = %e, "reconciler driver ended abnormally");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Presentation reads
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state.borrow().clone()
    }

    #[must_use]
    pub fn identity(&self) -> Option<Arc<Identity>> {
        self.shared.state.borrow().identity().cloned()
    }

    #[must_use]
    pub fn profile(&self) -> Option<ProfileRecord> {
        self.shared.state.borrow().profile().cloned()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.shared.state.borrow().is_loading()
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Wait until the state is no longer `Loading` and return it.
    pub async fn settled(&self) -> SessionState {
        let mut rx = self.shared.state.subscribe();
        match rx.wait_for(|s| !s.is_loading()).await {
            Ok(state) => SessionState::clone(&state),
            Err(_) => self.state(),
        }
    }

    /// Ordered provider ids of the signed-in identity, or empty.
    #[must_use]
    pub fn linked_providers(&self) -> Vec<String> {
        self.shared.state.borrow().linked_providers()
    }

    // -------------------------------------------------------------------------
    // Session wrappers
    // -------------------------------------------------------------------------

    /// Create an email/password account and wait for the session to settle.
    ///
    /// # Errors
    ///
    /// `MissingCredentials` for blank input; otherwise the identity
    /// source's error unchanged.
    pub async fn sign_up(&self, email: &str, password: &str) -> Result<Arc<Identity>, ReconcileError> {
        let email = required_email(email)?;
        let password = required_password(password)?;
        let identity = self
            .shared
            .identity
            .sign_up(&email, password)
            .await
            .inspect_err(|e| warn!(error = %e, code = e.error_code(), "sign-up failed"))?;
        info!(uid = %identity.uid, "signed up");
        self.settle_on(Some(&identity.uid)).await;
        Ok(identity)
    }

    /// Sign in with email/password and wait for the session to settle.
    ///
    /// # Errors
    ///
    /// `MissingCredentials` for blank input; otherwise the identity
    /// source's error unchanged.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Arc<Identity>, ReconcileError> {
        let email = required_email(email)?;
        let password = required_password(password)?;
        let identity = self
            .shared
            .identity
            .sign_in(&email, password)
            .await
            .inspect_err(|e| warn!(error = %e, code = e.error_code(), "sign-in failed"))?;
        info!(uid = %identity.uid, "signed in");
        self.settle_on(Some(&identity.uid)).await;
        Ok(identity)
    }

    /// Sign in through a federated provider's consent flow.
    ///
    /// # Errors
    ///
    /// `MissingCredentials` when `kind` is the password provider; otherwise
    /// the identity source's error unchanged (e.g. `PopupClosedByUser`).
    pub async fn sign_in_federated(&self, kind: ProviderKind) -> Result<Arc<Identity>, ReconcileError> {
        if !kind.is_federated() {
            return Err(ReconcileError::MissingCredentials("email and password"));
        }
        let identity = self
            .shared
            .identity
            .sign_in_federated(kind)
            .await
            .inspect_err(|e| warn!(provider = %kind, error = %e, code = e.error_code(), "federated sign-in failed"))?;
        info!(uid = %identity.uid, provider = %kind, "signed in");
        self.settle_on(Some(&identity.uid)).await;
        Ok(identity)
    }

    /// Sign out and wait for the profile to be cleared.
    ///
    /// # Errors
    ///
    /// The identity source's error unchanged.
    pub async fn sign_out(&self) -> Result<(), ReconcileError> {
        self.shared
            .identity
            .sign_out()
            .await
            .inspect_err(|e| warn!(error = %e, code = e.error_code(), "sign-out failed"))?;
        info!("signed out");
        self.settle_on(None).await;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Profile operations
    // -------------------------------------------------------------------------

    /// Merge `patch` into the signed-in profile and hold the re-read record.
    ///
    /// A patch carrying `birth_date` also writes the derived `age`. When the
    /// profile was unavailable, the default document is provisioned first.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated`, `InvalidBirthDate` for dates after today, or the
    /// store's error unchanged. The held profile is untouched on failure.
    pub async fn update_profile(&self, patch: ProfilePatch) -> Result<ProfileRecord, ReconcileError> {
        let _gate = self.shared.gate.lock().await;
        let identity = self.shared.current_identity()?;

        let mut patch = patch;
        patch.uid = None;
        patch.email = None;
        patch.age = None;
        if let Some(birth_date) = patch.birth_date {
            let today = self.shared.clock.today();
            if birth_date > today {
                return Err(ReconcileError::InvalidBirthDate(format!("{birth_date} is after {today}")));
            }
            patch.age = Some(age_on(birth_date, today));
        }

        // The document may never have been provisioned; a bare merge would
        // create it without the defaults.
        let unavailable = matches!(*self.shared.state.borrow(), SessionState::ProfileUnavailable { .. });
        if unavailable {
            provision::load_or_provision(self.shared.profiles.as_ref(), &identity)
                .await
                .inspect_err(|e| error!(uid = %identity.uid, error = %e, "profile provisioning before update failed"))?;
        }

        self.shared
            .profiles
            .write_merge(&identity.uid, &patch)
            .await
            .inspect_err(|e| {
                error!(uid = %identity.uid, fields = ?patch.field_paths(), error = %e, "profile write failed");
            })?;
        let profile = provision::read_back(self.shared.profiles.as_ref(), &identity.uid)
            .await
            .inspect_err(|e| error!(uid = %identity.uid, error = %e, "profile re-read failed"))?;

        self.shared.hold_profile(&identity.uid, profile.clone());
        info!(uid = %identity.uid, fields = ?patch.field_paths(), "profile updated");
        Ok(profile)
    }

    /// Re-read the signed-in profile, provisioning it if it is missing.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated`, or the store's error unchanged.
    pub async fn refresh_profile(&self) -> Result<ProfileRecord, ReconcileError> {
        let _gate = self.shared.gate.lock().await;
        let identity = self.shared.current_identity()?;
        let profile = provision::load_or_provision(self.shared.profiles.as_ref(), &identity)
            .await
            .inspect_err(|e| error!(uid = %identity.uid, error = %e, "profile refresh failed"))?;
        self.shared.hold_profile(&identity.uid, profile.clone());
        Ok(profile)
    }

    // -------------------------------------------------------------------------
    // Provider linking
    // -------------------------------------------------------------------------

    /// Attach another sign-in method to the signed-in identity.
    ///
    /// The password kind needs both `email` and `password`; federated kinds
    /// ignore them and run the provider's consent flow.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated`, `MissingCredentials` (no collaborator call is
    /// made), or the identity source's error unchanged.
    pub async fn link_provider(
        &self,
        kind: ProviderKind,
        email: Option<&str>,
        password: Option<&str>,
    ) -> Result<Arc<Identity>, ReconcileError> {
        let _gate = self.shared.gate.lock().await;
        let identity = self.shared.current_identity()?;

        let request = match kind {
            ProviderKind::Password => {
                let email = required_email(email.unwrap_or_default())?;
                let password = required_password(password.unwrap_or_default())?;
                LinkRequest::EmailPassword { email, password: password.to_owned() }
            }
            federated => LinkRequest::Federated(federated),
        };

        let linked = self
            .shared
            .identity
            .link(&identity, request)
            .await
            .inspect_err(|e| {
                warn!(uid = %identity.uid, provider = %kind, error = %e, code = e.error_code(), "link failed");
            })?;
        self.shared.hold_identity(Arc::clone(&linked));
        info!(uid = %linked.uid, provider = %kind, "provider linked");
        Ok(linked)
    }

    /// Detach a sign-in method. The last remaining method cannot be removed.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated`, `LastLinkedProvider`, or the identity source's
    /// error unchanged.
    pub async fn unlink_provider(&self, provider_id: &str) -> Result<Arc<Identity>, ReconcileError> {
        let _gate = self.shared.gate.lock().await;
        let identity = self.shared.current_identity()?;

        if identity.has_provider(provider_id) && identity.providers.len() == 1 {
            warn!(uid = %identity.uid, provider = provider_id, "refusing to unlink last sign-in method");
            return Err(ReconcileError::LastLinkedProvider { provider_id: provider_id.to_owned() });
        }

        let unlinked = self
            .shared
            .identity
            .unlink(&identity, provider_id)
            .await
            .inspect_err(|e| {
                warn!(uid = %identity.uid, provider = provider_id, error = %e, code = e.error_code(), "unlink failed");
            })?;
        self.shared.hold_identity(Arc::clone(&unlinked));
        info!(uid = %unlinked.uid, provider = provider_id, "provider unlinked");
        Ok(unlinked)
    }

    /// Wait until the state shows `uid` (or signed out for `None`), bounded
    /// by the configured settle timeout.
    async fn settle_on(&self, uid: Option<&str>) {
        let mut rx = self.shared.state.subscribe();
        let wait = rx.wait_for(|s| !s.is_loading() && s.uid() == uid);
        let settled = tokio::time::timeout(self.shared.config.settle_timeout, wait)
            .await
            .is_ok_and(|r| r.is_ok());
        if !settled {
            warn!(
                uid = uid.unwrap_or("<signed out>"),
                timeout_ms = u64::try_from(self.shared.config.settle_timeout.as_millis()).unwrap_or(u64::MAX),
                "session state did not settle in time"
            );
        }
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        // Closing the shutdown channel stops the driver, which releases the
        // subscription on its way out.
        drop(self.shutdown.take());
    }
}

// =============================================================================
// DRIVER
// =============================================================================

async fn drive(shared: Arc<Shared>, mut subscription: Subscription, mut shutdown: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            event = subscription.next() => {
                let Some(event) = event else {
                    warn!("identity source closed the subscription");
                    break;
                };
                shared.apply_identity(event).await;
            }
        }
    }
    subscription.unsubscribe();
    info!("identity subscription released");
}

impl Shared {
    fn current_identity(&self) -> Result<Arc<Identity>, ReconcileError> {
        self.state
            .borrow()
            .identity()
            .cloned()
            .ok_or(ReconcileError::NotAuthenticated)
    }

    async fn apply_identity(&self, event: IdentityEvent) {
        let _gate = self.gate.lock().await;

        let Some(identity) = event else {
            let was = self.state.send_replace(SessionState::SignedOut);
            if let Some(uid) = was.uid() {
                info!(uid, "session ended; profile cleared");
            }
            return;
        };

        let current_uid = self.state.borrow().uid().map(str::to_owned);
        let same_uid = current_uid.as_deref() == Some(identity.uid.as_str());
        if !same_uid {
            self.state.send_replace(SessionState::Loading);
        }

        match provision::load_or_provision(self.profiles.as_ref(), &identity).await {
            Ok(profile) => {
                info!(uid = %identity.uid, "session settled");
                self.state
                    .send_replace(SessionState::SignedIn { identity, profile });
            }
            Err(e) if same_uid => {
                // Keep the profile we already hold; only the identity moves.
                error!(uid = %identity.uid, error = %e, code = e.error_code(), "profile reload failed");
                self.hold_identity(identity);
            }
            Err(e) => {
                error!(uid = %identity.uid, error = %e, code = e.error_code(), "profile load failed");
                self.state
                    .send_replace(SessionState::ProfileUnavailable { identity, reason: e.to_string() });
            }
        }
    }

    /// Replace the held profile if `uid` is still the signed-in identity.
    fn hold_profile(&self, uid: &str, profile: ProfileRecord) -> bool {
        self.state.send_if_modified(|state| {
            let identity = match state {
                SessionState::SignedIn { identity, .. } | SessionState::ProfileUnavailable { identity, .. }
                    if identity.uid == uid =>
                {
                    Arc::clone(identity)
                }
                _ => return false,
            };
            *state = SessionState::SignedIn { identity, profile };
            true
        })
    }

    /// Swap in a newer identity object for the same uid.
    fn hold_identity(&self, next: Arc<Identity>) -> bool {
        self.state.send_if_modified(|state| match state {
            SessionState::SignedIn { identity, .. } | SessionState::ProfileUnavailable { identity, .. }
                if identity.uid == next.uid =>
            {
                *identity = next;
                true
            }
            _ => false,
        })
    }
}

fn required_email(email: &str) -> Result<String, ReconcileError> {
    let trimmed = email.trim();
    if trimmed.is_empty() {
        return Err(ReconcileError::MissingCredentials("email"));
    }
    // Malformed addresses pass through for the identity source to reject.
    Ok(normalize_email(trimmed).unwrap_or_else(|| trimmed.to_owned()))
}

fn required_password(password: &str) -> Result<&str, ReconcileError> {
    if password.is_empty() {
        return Err(ReconcileError::MissingCredentials("password"));
    }
    Ok(password)
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
