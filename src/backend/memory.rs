//! In-process identity source and profile store.
//!
//! DESIGN
//! ======
//! Both collaborators keep their data behind a `std::sync::Mutex` and never
//! hold it across an `.await`; the consent flow is awaited between two
//! short critical sections and its result is re-validated afterwards.
//!
//! Behavior follows the hosted backend closely enough for the reconciler
//! to be exercised end to end: salted password hashes, one federated
//! subject per account and provider, merge writes that stamp `createdAt`
//! once and `updatedAt` on every write. Call counters and failure switches
//! exist for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;
use crate::identity::{
    ConsentFlow, FederatedCredential, FederatedProfile, Identity, IdentityError, IdentitySource, LinkRequest,
    ProviderKind, ProviderToken, SubscriberHub, Subscription, normalize_email,
};
use crate::profile::{ProfilePatch, ProfileRecord, ProfileStore, StoreError};

const MIN_PASSWORD_LEN: usize = 6;

fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect::<String>()
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    bytes_to_hex(&hasher.finalize())
}

fn check_password_strength(password: &str) -> Result<(), IdentityError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(IdentityError::WeakPassword(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

// =============================================================================
// ACCOUNTS
// =============================================================================

struct PasswordHash {
    salt: String,
    digest: String,
}

impl PasswordHash {
    fn new(password: &str) -> Self {
        let salt_bytes: [u8; 16] = rand::rng().random();
        let salt = bytes_to_hex(&salt_bytes);
        let digest = hash_password(&salt, password);
        Self { salt, digest }
    }

    fn verify(&self, password: &str) -> bool {
        hash_password(&self.salt, password) == self.digest
    }
}

struct Account {
    identity: Arc<Identity>,
    password: Option<PasswordHash>,
    /// Federated subjects (provider token) linked to this account.
    federated: Vec<(ProviderKind, String)>,
}

impl Account {
    /// Rebuild the shared identity after a change.
    fn update(&mut self, change: impl FnOnce(&mut Identity)) -> Arc<Identity> {
        let mut next = Identity::clone(&self.identity);
        change(&mut next);
        self.identity = Arc::new(next);
        Arc::clone(&self.identity)
    }
}

#[derive(Default)]
struct AuthBook {
    accounts: HashMap<String, Account>,
    current: Option<String>,
}

impl AuthBook {
    fn uid_by_email(&self, email: &str) -> Option<String> {
        self.accounts
            .iter()
            .find(|(_, a)| a.identity.email.as_deref() == Some(email))
            .map(|(uid, _)| uid.clone())
    }

    fn uid_by_subject(&self, kind: ProviderKind, subject: &str) -> Option<String> {
        self.accounts
            .iter()
            .find(|(_, a)| a.federated.iter().any(|(k, s)| *k == kind && s == subject))
            .map(|(uid, _)| uid.clone())
    }

    fn current_identity(&self) -> Option<Arc<Identity>> {
        let uid = self.current.as_ref()?;
        self.accounts.get(uid).map(|a| Arc::clone(&a.identity))
    }

    /// Make `uid` current. Returns the identity when the session changed.
    fn sign_in_as(&mut self, uid: &str) -> Result<(Arc<Identity>, bool), IdentityError> {
        let identity = self
            .accounts
            .get(uid)
            .map(|a| Arc::clone(&a.identity))
            .ok_or(IdentityError::InvalidCredentials)?;
        let changed = self.current.as_deref() != Some(uid);
        self.current = Some(uid.to_owned());
        Ok((identity, changed))
    }
}

// =============================================================================
// IDENTITY SOURCE
// =============================================================================

/// Identity source backed by an in-process account book.
pub struct InMemoryIdentitySource {
    book: Mutex<AuthBook>,
    hub: SubscriberHub,
    consent: Option<Arc<dyn ConsentFlow>>,
    calls: AtomicUsize,
}

impl Default for InMemoryIdentitySource {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryIdentitySource {
    #[must_use]
    pub fn new() -> Self {
        Self { book: Mutex::new(AuthBook::default()), hub: SubscriberHub::new(), consent: None, calls: AtomicUsize::new(0) }
    }

    /// Use `consent` for federated sign-in and linking.
    #[must_use]
    pub fn with_consent(mut self, consent: Arc<dyn ConsentFlow>) -> Self {
        self.consent = Some(consent);
        self
    }

    /// Number of collaborator operations invoked (subscriptions excluded).
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    #[must_use]
    pub fn current(&self) -> Option<Arc<Identity>> {
        self.book().current_identity()
    }

    fn book(&self) -> std::sync::MutexGuard<'_, AuthBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn count_call(&self, op: &'static str) {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(op, calls = n, "in-memory identity call");
    }

    fn notify(&self, identity: Option<Arc<Identity>>) {
        self.hub.publish(&identity);
    }

    async fn run_consent(&self, kind: ProviderKind) -> Result<FederatedCredential, IdentityError> {
        let Some(consent) = &self.consent else {
            return Err(IdentityError::Unsupported(format!("no consent flow configured for {kind}")));
        };
        let credential = consent.obtain(kind).await?;
        if credential.provider != kind {
            return Err(IdentityError::Backend {
                code: "PROVIDER_MISMATCH".into(),
                message: format!("asked for {kind}, consent returned {}", credential.provider),
            });
        }
        Ok(credential)
    }
}

#[async_trait::async_trait]
impl IdentitySource for InMemoryIdentitySource {
    async fn sign_up(&self, email: &str, password: &str) -> Result<Arc<Identity>, IdentityError> {
        self.count_call("sign_up");
        let email = normalize_email(email).ok_or(IdentityError::InvalidEmail)?;
        check_password_strength(password)?;

        let identity = {
            let mut book = self.book();
            if book.uid_by_email(&email).is_some() {
                return Err(IdentityError::EmailAlreadyInUse);
            }
            let uid = Uuid::new_v4().simple().to_string();
            let identity = Arc::new(Identity {
                uid: uid.clone(),
                display_name: None,
                photo_url: None,
                email: Some(email),
                providers: vec![ProviderKind::Password.id().to_owned()],
            });
            book.accounts.insert(
                uid.clone(),
                Account { identity: Arc::clone(&identity), password: Some(PasswordHash::new(password)), federated: Vec::new() },
            );
            book.current = Some(uid);
            identity
        };

        self.notify(Some(Arc::clone(&identity)));
        Ok(identity)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Arc<Identity>, IdentityError> {
        self.count_call("sign_in");
        let email = normalize_email(email).ok_or(IdentityError::InvalidEmail)?;

        let (identity, changed) = {
            let mut book = self.book();
            let uid = book
                .uid_by_email(&email)
                .ok_or(IdentityError::InvalidCredentials)?;
            let verified = book
                .accounts
                .get(&uid)
                .and_then(|a| a.password.as_ref())
                .is_some_and(|hash| hash.verify(password));
            if !verified {
                return Err(IdentityError::InvalidCredentials);
            }
            book.sign_in_as(&uid)?
        };

        if changed {
            self.notify(Some(Arc::clone(&identity)));
        }
        Ok(identity)
    }

    async fn sign_in_federated(&self, kind: ProviderKind) -> Result<Arc<Identity>, IdentityError> {
        self.count_call("sign_in_federated");
        let credential = self.run_consent(kind).await?;
        let subject = credential.token.secret().to_owned();

        let (identity, changed) = {
            let mut book = self.book();
            if let Some(uid) = book.uid_by_subject(kind, &subject) {
                book.sign_in_as(&uid)?
            } else {
                let email = credential
                    .profile
                    .email
                    .as_deref()
                    .and_then(normalize_email);
                if let Some(email) = &email {
                    if book.uid_by_email(email).is_some() {
                        return Err(IdentityError::AccountExistsWithDifferentCredential);
                    }
                }
                let uid = Uuid::new_v4().simple().to_string();
                let identity = Arc::new(Identity {
                    uid: uid.clone(),
                    display_name: credential.profile.display_name.clone(),
                    photo_url: credential.profile.photo_url.clone(),
                    email,
                    providers: vec![kind.id().to_owned()],
                });
                book.accounts.insert(
                    uid.clone(),
                    Account { identity: Arc::clone(&identity), password: None, federated: vec![(kind, subject)] },
                );
                book.current = Some(uid);
                (identity, true)
            }
        };

        if changed {
            self.notify(Some(Arc::clone(&identity)));
        }
        Ok(identity)
    }

    async fn sign_out(&self) -> Result<(), IdentityError> {
        self.count_call("sign_out");
        let was_signed_in = self.book().current.take().is_some();
        if was_signed_in {
            self.notify(None);
        }
        Ok(())
    }

    async fn link(&self, identity: &Identity, request: LinkRequest) -> Result<Arc<Identity>, IdentityError> {
        self.count_call("link");
        let kind = request.kind();
        {
            let book = self.book();
            let account = book
                .accounts
                .get(&identity.uid)
                .ok_or(IdentityError::NotSignedIn)?;
            if account.identity.has_provider(kind.id()) {
                return Err(IdentityError::ProviderAlreadyLinked(kind.id().to_owned()));
            }
        }

        match request {
            LinkRequest::EmailPassword { email, password } => {
                let email = normalize_email(&email).ok_or(IdentityError::InvalidEmail)?;
                check_password_strength(&password)?;

                let mut book = self.book();
                if book
                    .uid_by_email(&email)
                    .is_some_and(|owner| owner != identity.uid)
                {
                    return Err(IdentityError::CredentialAlreadyInUse);
                }
                let account = book
                    .accounts
                    .get_mut(&identity.uid)
                    .ok_or(IdentityError::NotSignedIn)?;
                if account.identity.has_provider(kind.id()) {
                    return Err(IdentityError::ProviderAlreadyLinked(kind.id().to_owned()));
                }
                account.password = Some(PasswordHash::new(&password));
                Ok(account.update(|i| {
                    i.email = Some(email);
                    i.providers.push(kind.id().to_owned());
                }))
            }
            LinkRequest::Federated(kind) => {
                let credential = self.run_consent(kind).await?;
                let subject = credential.token.secret().to_owned();

                let mut book = self.book();
                if book
                    .uid_by_subject(kind, &subject)
                    .is_some_and(|owner| owner != identity.uid)
                {
                    return Err(IdentityError::CredentialAlreadyInUse);
                }
                let account = book
                    .accounts
                    .get_mut(&identity.uid)
                    .ok_or(IdentityError::NotSignedIn)?;
                if account.identity.has_provider(kind.id()) {
                    return Err(IdentityError::ProviderAlreadyLinked(kind.id().to_owned()));
                }
                account.federated.push((kind, subject));
                let FederatedProfile { display_name, photo_url, .. } = credential.profile;
                Ok(account.update(|i| {
                    if i.display_name.is_none() {
                        i.display_name = display_name;
                    }
                    if i.photo_url.is_none() {
                        i.photo_url = photo_url;
                    }
                    i.providers.push(kind.id().to_owned());
                }))
            }
        }
    }

    async fn unlink(&self, identity: &Identity, provider_id: &str) -> Result<Arc<Identity>, IdentityError> {
        self.count_call("unlink");
        let mut book = self.book();
        let account = book
            .accounts
            .get_mut(&identity.uid)
            .ok_or(IdentityError::NotSignedIn)?;
        if !account.identity.has_provider(provider_id) {
            return Err(IdentityError::NoSuchProvider(provider_id.to_owned()));
        }
        match ProviderKind::from_id(provider_id) {
            Some(ProviderKind::Password) => account.password = None,
            Some(kind) => account.federated.retain(|(k, _)| *k != kind),
            None => {}
        }
        Ok(account.update(|i| i.providers.retain(|p| p != provider_id)))
    }

    async fn subscribe(&self) -> Subscription {
        let current = self.book().current_identity();
        self.hub.subscribe(current)
    }
}

// =============================================================================
// CONSENT
// =============================================================================

/// Consent flow that replays queued outcomes, one per call.
#[derive(Default)]
pub struct ScriptedConsent {
    outcomes: Mutex<VecDeque<Result<FederatedCredential, IdentityError>>>,
}

impl ScriptedConsent {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an approval for `kind` as the provider account `subject`.
    pub fn approve(&self, kind: ProviderKind, subject: &str, profile: FederatedProfile) {
        let credential = FederatedCredential { provider: kind, token: ProviderToken::IdToken(subject.to_owned()), profile };
        self.push(Ok(credential));
    }

    /// Queue the user dismissing the consent screen.
    pub fn dismiss(&self) {
        self.push(Err(IdentityError::PopupClosedByUser));
    }

    fn push(&self, outcome: Result<FederatedCredential, IdentityError>) {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(outcome);
    }
}

#[async_trait::async_trait]
impl ConsentFlow for ScriptedConsent {
    async fn obtain(&self, _kind: ProviderKind) -> Result<FederatedCredential, IdentityError> {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(Err(IdentityError::PopupClosedByUser))
    }
}

// =============================================================================
// PROFILE STORE
// =============================================================================

/// Profile store backed by an in-process map.
pub struct InMemoryProfileStore {
    docs: Mutex<HashMap<String, ProfileRecord>>,
    clock: Arc<dyn Clock>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl InMemoryProfileStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            docs: Mutex::new(HashMap::new()),
            clock,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Peek at a stored record without counting a read.
    #[must_use]
    pub fn get(&self, uid: &str) -> Option<ProfileRecord> {
        self.docs().get(uid).cloned()
    }

    /// Seed a record directly.
    pub fn insert(&self, record: ProfileRecord) {
        self.docs().insert(record.uid.clone(), record);
    }

    #[must_use]
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every subsequent read fail with `Unavailable`.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write fail with `Unavailable`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn docs(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProfileRecord>> {
        self.docs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn read(&self, uid: &str) -> Result<Option<ProfileRecord>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("read failure injected".into()));
        }
        Ok(self.docs().get(uid).cloned())
    }

    async fn write_merge(&self, uid: &str, patch: &ProfilePatch) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("write failure injected".into()));
        }
        let now = self.clock.now();
        let mut docs = self.docs();
        let record = docs
            .entry(uid.to_owned())
            .or_insert_with(|| ProfileRecord::blank(uid, now));
        record.merge(patch);
        record.updated_at = now.max(record.updated_at);
        Ok(())
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
