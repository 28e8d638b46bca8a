use std::time::Duration;

use time::macros::{date, datetime};

use super::*;
use crate::backend::memory::{InMemoryIdentitySource, InMemoryProfileStore, ScriptedConsent};
use crate::clock::FixedClock;
use crate::identity::{ConsentFlow, FederatedProfile, IdentityError};
use crate::profile::StoreError;

// =============================================================================
// HARNESS
// =============================================================================

struct Harness {
    source: Arc<InMemoryIdentitySource>,
    store: Arc<InMemoryProfileStore>,
    clock: Arc<FixedClock>,
    consent: Arc<ScriptedConsent>,
    reconciler: Reconciler,
}

async fn harness() -> Harness {
    let clock = Arc::new(FixedClock::new(datetime!(2024-01-01 09:30 UTC)));
    let consent = Arc::new(ScriptedConsent::new());
    let source = Arc::new(InMemoryIdentitySource::new().with_consent(Arc::clone(&consent) as Arc<dyn ConsentFlow>));
    let store = Arc::new(InMemoryProfileStore::new(Arc::clone(&clock) as Arc<dyn Clock>));
    let config = ReconcilerConfig { settle_timeout: Duration::from_secs(2) };
    let reconciler = Reconciler::start(
        Arc::clone(&source) as Arc<dyn IdentitySource>,
        Arc::clone(&store) as Arc<dyn ProfileStore>,
        Arc::clone(&clock) as Arc<dyn Clock>,
        config,
    )
    .await;
    assert_eq!(reconciler.settled().await, SessionState::SignedOut);
    Harness { source, store, clock, consent, reconciler }
}

async fn signed_in_harness() -> Harness {
    let h = harness().await;
    h.reconciler
        .sign_up("alice@example.com", "secret1")
        .await
        .unwrap();
    h
}

fn alice_hints() -> FederatedProfile {
    FederatedProfile {
        email: Some("alice@example.com".into()),
        display_name: Some("Alice".into()),
        photo_url: Some("https://example.com/a.png".into()),
    }
}

// =============================================================================
// startup and session changes
// =============================================================================

#[tokio::test]
async fn starts_loading_then_signed_out() {
    let h = harness().await;
    assert!(!h.reconciler.is_loading());
    assert!(h.reconciler.identity().is_none());
    assert!(h.reconciler.profile().is_none());
    assert!(h.reconciler.linked_providers().is_empty());
}

#[tokio::test]
async fn starts_signed_in_when_source_already_has_a_session() {
    let clock = Arc::new(FixedClock::on(date!(2024 - 01 - 01)));
    let source = Arc::new(InMemoryIdentitySource::new());
    let store = Arc::new(InMemoryProfileStore::new(Arc::clone(&clock) as Arc<dyn Clock>));
    let identity = source.sign_up("bob@example.com", "secret1").await.unwrap();

    let reconciler = Reconciler::start(
        Arc::clone(&source) as Arc<dyn IdentitySource>,
        Arc::clone(&store) as Arc<dyn ProfileStore>,
        clock as Arc<dyn Clock>,
        ReconcilerConfig::default(),
    )
    .await;
    let state = reconciler.settled().await;
    assert_eq!(state.uid(), Some(identity.uid.as_str()));
    assert_eq!(state.profile().unwrap().email, "bob@example.com");
}

#[tokio::test]
async fn alice_sign_up_provisions_default_profile_and_derives_age() {
    let h = harness().await;
    let identity = h
        .reconciler
        .sign_up("alice@example.com", "secret1")
        .await
        .unwrap();

    let state = h.reconciler.state();
    let SessionState::SignedIn { identity: held, profile } = &state else {
        panic!("expected SignedIn, got {state:?}");
    };
    assert_eq!(held.uid, identity.uid);
    assert_eq!(profile.uid, identity.uid);
    assert_eq!(profile.email, "alice@example.com");
    assert_eq!(profile.display_name.as_deref(), Some(""));
    assert_eq!(profile.photo_url.as_deref(), Some(""));
    assert!(profile.age.is_none());

    let updated = h
        .reconciler
        .update_profile(ProfilePatch::new().birth_date(date!(1990 - 01 - 01)))
        .await
        .unwrap();
    // The birthday falls on today, so the year counts.
    assert_eq!(updated.age, Some(34));
    assert_eq!(updated.birth_date, Some(date!(1990 - 01 - 01)));
    assert_eq!(h.reconciler.profile(), Some(updated));
}

#[tokio::test]
async fn birthday_tomorrow_is_not_yet_counted() {
    let h = signed_in_harness().await;
    let updated = h
        .reconciler
        .update_profile(ProfilePatch::new().birth_date(date!(1990 - 01 - 02)))
        .await
        .unwrap();
    assert_eq!(updated.age, Some(33));
}

#[tokio::test]
async fn external_sign_out_clears_profile() {
    let h = signed_in_harness().await;
    let mut rx = h.reconciler.watch();
    h.source.sign_out().await.unwrap();
    rx.wait_for(|s| *s == SessionState::SignedOut).await.unwrap();
    assert!(h.reconciler.profile().is_none());
}

#[tokio::test]
async fn sign_out_empties_providers_and_profile() {
    let h = signed_in_harness().await;
    assert_eq!(h.reconciler.linked_providers(), vec!["password".to_owned()]);

    h.reconciler.sign_out().await.unwrap();
    assert_eq!(h.reconciler.state(), SessionState::SignedOut);
    assert!(h.reconciler.linked_providers().is_empty());
    assert!(h.reconciler.profile().is_none());
}

#[tokio::test]
async fn sign_in_again_loads_existing_profile() {
    let h = signed_in_harness().await;
    h.reconciler
        .update_profile(ProfilePatch::new().address("1 Main St"))
        .await
        .unwrap();
    h.reconciler.sign_out().await.unwrap();
    let writes = h.store.write_count();

    h.reconciler
        .sign_in("alice@example.com", "secret1")
        .await
        .unwrap();
    let profile = h.reconciler.profile().unwrap();
    assert_eq!(profile.address.as_deref(), Some("1 Main St"));
    assert_eq!(h.store.write_count(), writes);
}

#[tokio::test]
async fn blank_credentials_are_rejected_before_any_call() {
    let h = harness().await;
    let err = h.reconciler.sign_in("  ", "secret1").await.unwrap_err();
    assert!(matches!(err, ReconcileError::MissingCredentials("email")));
    let err = h.reconciler.sign_up("alice@example.com", "").await.unwrap_err();
    assert!(matches!(err, ReconcileError::MissingCredentials("password")));
    assert_eq!(h.source.call_count(), 0);
}

#[tokio::test]
async fn wrong_password_is_returned_unchanged() {
    let h = signed_in_harness().await;
    h.reconciler.sign_out().await.unwrap();
    let err = h
        .reconciler
        .sign_in("alice@example.com", "nope-nope")
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Identity(IdentityError::InvalidCredentials)));
    assert_eq!(h.reconciler.state(), SessionState::SignedOut);
}

// =============================================================================
// federated
// =============================================================================

#[tokio::test]
async fn federated_sign_in_provisions_from_provider_hints() {
    let h = harness().await;
    h.consent.approve(ProviderKind::Google, "g-1", alice_hints());
    h.reconciler
        .sign_in_federated(ProviderKind::Google)
        .await
        .unwrap();

    let profile = h.reconciler.profile().unwrap();
    assert_eq!(profile.display_name.as_deref(), Some("Alice"));
    assert_eq!(profile.photo_url.as_deref(), Some("https://example.com/a.png"));
    assert_eq!(h.reconciler.linked_providers(), vec!["google.com".to_owned()]);
}

#[tokio::test]
async fn dismissed_popup_leaves_state_signed_out() {
    let h = harness().await;
    h.consent.dismiss();
    let err = h
        .reconciler
        .sign_in_federated(ProviderKind::Facebook)
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Identity(IdentityError::PopupClosedByUser)));
    assert_eq!(h.reconciler.state(), SessionState::SignedOut);
}

#[tokio::test]
async fn federated_sign_in_with_password_kind_is_missing_credentials() {
    let h = harness().await;
    let err = h
        .reconciler
        .sign_in_federated(ProviderKind::Password)
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::MissingCredentials(_)));
    assert_eq!(h.source.call_count(), 0);
}

// =============================================================================
// update_profile / refresh_profile
// =============================================================================

#[tokio::test]
async fn update_requires_sign_in() {
    let h = harness().await;
    let err = h
        .reconciler
        .update_profile(ProfilePatch::new().address("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::NotAuthenticated));
    assert!(matches!(h.reconciler.refresh_profile().await, Err(ReconcileError::NotAuthenticated)));
    assert_eq!(h.store.write_count(), 0);
}

#[tokio::test]
async fn address_update_keeps_age_and_birth_date() {
    let h = signed_in_harness().await;
    h.reconciler
        .update_profile(ProfilePatch::new().birth_date(date!(2000 - 06 - 15)))
        .await
        .unwrap();

    let updated = h
        .reconciler
        .update_profile(ProfilePatch::new().address("42 Elm St"))
        .await
        .unwrap();
    assert_eq!(updated.address.as_deref(), Some("42 Elm St"));
    assert_eq!(updated.birth_date, Some(date!(2000 - 06 - 15)));
    assert_eq!(updated.age, Some(23));
}

#[tokio::test]
async fn birth_date_update_recomputes_age_against_the_clock() {
    let h = signed_in_harness().await;
    h.clock.set(datetime!(2024-06-15 12:00 UTC));
    let updated = h
        .reconciler
        .update_profile(ProfilePatch::new().birth_date(date!(2000 - 06 - 15)))
        .await
        .unwrap();
    assert_eq!(updated.age, Some(24));
}

#[tokio::test]
async fn future_birth_date_is_rejected_without_writing() {
    let h = signed_in_harness().await;
    let writes = h.store.write_count();
    let err = h
        .reconciler
        .update_profile(ProfilePatch::new().birth_date(date!(2024 - 01 - 02)))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::InvalidBirthDate(_)));
    assert_eq!(h.store.write_count(), writes);
}

#[tokio::test]
async fn update_bumps_updated_at_only() {
    let h = signed_in_harness().await;
    let before = h.reconciler.profile().unwrap();
    h.clock.advance(time::Duration::minutes(10));
    let after = h
        .reconciler
        .update_profile(ProfilePatch::new().display_name("Alice"))
        .await
        .unwrap();
    assert_eq!(after.created_at, before.created_at);
    assert!(after.updated_at > before.updated_at);
    assert_eq!(after.email, before.email);
}

#[tokio::test]
async fn failed_write_leaves_state_unchanged() {
    let h = signed_in_harness().await;
    let before = h.reconciler.state();
    h.store.set_fail_writes(true);

    let err = h
        .reconciler
        .update_profile(ProfilePatch::new().address("nowhere"))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Store(StoreError::Unavailable(_))));
    assert!(err.is_collaborator_failure());
    assert_eq!(h.reconciler.state(), before);
}

#[tokio::test]
async fn overlapping_updates_both_land() {
    let h = signed_in_harness().await;
    let (a, b) = tokio::join!(
        h.reconciler
            .update_profile(ProfilePatch::new().address("1 Main St")),
        h.reconciler
            .update_profile(ProfilePatch::new().display_name("Alice")),
    );
    a.unwrap();
    b.unwrap();

    let held = h.reconciler.profile().unwrap();
    assert_eq!(held.address.as_deref(), Some("1 Main St"));
    assert_eq!(held.display_name.as_deref(), Some("Alice"));
    assert_eq!(Some(held), h.store.get(&h.reconciler.identity().unwrap().uid));
}

#[tokio::test]
async fn store_failure_on_sign_in_is_profile_unavailable_until_refresh() {
    let h = harness().await;
    h.store.set_fail_reads(true);
    h.reconciler
        .sign_up("alice@example.com", "secret1")
        .await
        .unwrap();

    let state = h.reconciler.state();
    assert!(matches!(state, SessionState::ProfileUnavailable { .. }), "got {state:?}");
    assert!(h.reconciler.profile().is_none());
    assert_eq!(h.reconciler.linked_providers(), vec!["password".to_owned()]);

    assert!(h.reconciler.refresh_profile().await.is_err());
    h.store.set_fail_reads(false);
    let profile = h.reconciler.refresh_profile().await.unwrap();
    assert_eq!(profile.email, "alice@example.com");
    assert!(matches!(h.reconciler.state(), SessionState::SignedIn { .. }));
}

#[tokio::test]
async fn update_while_profile_unavailable_provisions_defaults_first() {
    let h = harness().await;
    h.store.set_fail_writes(true);
    h.reconciler
        .sign_up("alice@example.com", "secret1")
        .await
        .unwrap();
    assert!(matches!(h.reconciler.state(), SessionState::ProfileUnavailable { .. }));

    h.store.set_fail_writes(false);
    let profile = h
        .reconciler
        .update_profile(ProfilePatch::new().address("1 Main St"))
        .await
        .unwrap();

    assert_eq!(profile.email, "alice@example.com");
    assert_eq!(profile.display_name.as_deref(), Some(""));
    assert_eq!(profile.photo_url.as_deref(), Some(""));
    assert_eq!(profile.address.as_deref(), Some("1 Main St"));
    assert!(matches!(h.reconciler.state(), SessionState::SignedIn { .. }));

    let refreshed = h.reconciler.refresh_profile().await.unwrap();
    assert_eq!(refreshed.email, "alice@example.com");
    assert_eq!(refreshed.address.as_deref(), Some("1 Main St"));
}

#[tokio::test]
async fn update_while_profile_unavailable_fails_when_provisioning_fails() {
    let h = harness().await;
    h.store.set_fail_writes(true);
    h.reconciler
        .sign_up("alice@example.com", "secret1")
        .await
        .unwrap();

    let err = h
        .reconciler
        .update_profile(ProfilePatch::new().address("1 Main St"))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Store(_)), "got {err:?}");
    let uid = h.reconciler.identity().unwrap().uid.clone();
    assert!(h.store.get(&uid).is_none());
    assert!(matches!(h.reconciler.state(), SessionState::ProfileUnavailable { .. }));
}

#[tokio::test]
async fn refresh_picks_up_external_changes() {
    let h = signed_in_harness().await;
    let uid = h.reconciler.identity().unwrap().uid.clone();
    let mut record = h.store.get(&uid).unwrap();
    record.address = Some("changed elsewhere".into());
    h.store.insert(record);

    let refreshed = h.reconciler.refresh_profile().await.unwrap();
    assert_eq!(refreshed.address.as_deref(), Some("changed elsewhere"));
    assert_eq!(h.reconciler.profile(), Some(refreshed));
}

// =============================================================================
// link / unlink
// =============================================================================

#[tokio::test]
async fn link_password_without_password_makes_no_call() {
    let h = harness().await;
    h.consent.approve(ProviderKind::Facebook, "fb-1", FederatedProfile::default());
    h.reconciler
        .sign_in_federated(ProviderKind::Facebook)
        .await
        .unwrap();
    let calls = h.source.call_count();

    let err = h
        .reconciler
        .link_provider(ProviderKind::Password, Some("alice@example.com"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::MissingCredentials("password")));
    let err = h
        .reconciler
        .link_provider(ProviderKind::Password, None, Some("secret1"))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::MissingCredentials("email")));
    assert_eq!(h.source.call_count(), calls);
}

#[tokio::test]
async fn link_requires_sign_in() {
    let h = harness().await;
    let err = h
        .reconciler
        .link_provider(ProviderKind::Google, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::NotAuthenticated));
}

#[tokio::test]
async fn link_and_unlink_update_providers_in_order() {
    let h = signed_in_harness().await;
    h.consent.approve(ProviderKind::Google, "g-1", alice_hints());

    let linked = h
        .reconciler
        .link_provider(ProviderKind::Google, None, None)
        .await
        .unwrap();
    assert_eq!(linked.providers, vec!["password".to_owned(), "google.com".to_owned()]);
    assert_eq!(h.reconciler.linked_providers(), linked.providers);
    // The profile is kept across identity refreshes for the same uid.
    assert!(h.reconciler.profile().is_some());

    h.reconciler.unlink_provider("password").await.unwrap();
    assert_eq!(h.reconciler.linked_providers(), vec!["google.com".to_owned()]);
}

#[tokio::test]
async fn link_password_to_federated_account() {
    let h = harness().await;
    h.consent.approve(ProviderKind::Facebook, "fb-1", FederatedProfile::default());
    h.reconciler
        .sign_in_federated(ProviderKind::Facebook)
        .await
        .unwrap();

    h.reconciler
        .link_provider(ProviderKind::Password, Some("carol@example.com"), Some("secret1"))
        .await
        .unwrap();
    assert_eq!(h.reconciler.linked_providers(), vec!["facebook.com".to_owned(), "password".to_owned()]);
}

#[tokio::test]
async fn link_error_is_returned_unchanged() {
    let h = signed_in_harness().await;
    h.consent.dismiss();
    let before = h.reconciler.state();
    let err = h
        .reconciler
        .link_provider(ProviderKind::Google, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Identity(IdentityError::PopupClosedByUser)));
    assert_eq!(h.reconciler.state(), before);
}

#[tokio::test]
async fn unlinking_the_last_provider_is_refused() {
    let h = signed_in_harness().await;
    let calls = h.source.call_count();
    let err = h
        .reconciler
        .unlink_provider("password")
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::LastLinkedProvider { ref provider_id } if provider_id == "password"));
    assert_eq!(h.source.call_count(), calls);
    assert_eq!(h.reconciler.linked_providers(), vec!["password".to_owned()]);
}

#[tokio::test]
async fn unlinking_an_unknown_provider_is_the_source_error() {
    let h = signed_in_harness().await;
    let err = h
        .reconciler
        .unlink_provider("google.com")
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Identity(IdentityError::NoSuchProvider(_))));
}

// =============================================================================
// teardown
// =============================================================================

#[tokio::test]
async fn shutdown_releases_the_subscription() {
    let h = harness().await;
    assert_eq!(h.source.subscriber_count(), 1);
    h.reconciler.shutdown().await;
    assert_eq!(h.source.subscriber_count(), 0);
}

#[tokio::test]
async fn drop_releases_the_subscription() {
    let Harness { source, reconciler, .. } = harness().await;
    drop(reconciler);
    tokio::time::timeout(Duration::from_secs(2), async {
        while source.subscriber_count() > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn events_after_shutdown_are_ignored() {
    let h = signed_in_harness().await;
    let Harness { source, reconciler, .. } = h;
    let rx = reconciler.watch();
    reconciler.shutdown().await;
    source.sign_out().await.unwrap();
    assert!(!rx.has_changed().unwrap_or(false));
}
