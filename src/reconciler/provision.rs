//! Default profile provisioning.
//!
//! A missing profile is written as a merge of the identity's email, display
//! name and photo (empty strings when absent), then read back so the held
//! copy carries the store's timestamps. Merging keeps the step idempotent:
//! fields the default does not name are never touched.

use tracing::info;

use crate::identity::Identity;
use crate::profile::{ProfilePatch, ProfileRecord, ProfileStore, StoreError};

pub(crate) fn default_patch(identity: &Identity) -> ProfilePatch {
    ProfilePatch {
        uid: Some(identity.uid.clone()),
        email: Some(identity.email.clone().unwrap_or_default()),
        display_name: Some(identity.display_name.clone().unwrap_or_default()),
        photo_url: Some(identity.photo_url.clone().unwrap_or_default()),
        ..ProfilePatch::default()
    }
}

/// Read the identity's profile, provisioning the default when absent.
pub(crate) async fn load_or_provision(store: &dyn ProfileStore, identity: &Identity) -> Result<ProfileRecord, StoreError> {
    match store.read(&identity.uid).await? {
        Some(existing) => Ok(existing),
        None => provision(store, identity).await,
    }
}

pub(crate) async fn provision(store: &dyn ProfileStore, identity: &Identity) -> Result<ProfileRecord, StoreError> {
    info!(uid = %identity.uid, "provisioning default profile");
    store
        .write_merge(&identity.uid, &default_patch(identity))
        .await?;
    read_back(store, &identity.uid).await
}

/// Read a record that a successful write just produced.
pub(crate) async fn read_back(store: &dyn ProfileStore, uid: &str) -> Result<ProfileRecord, StoreError> {
    store
        .read(uid)
        .await?
        .ok_or_else(|| StoreError::Missing { uid: uid.to_owned() })
}

#[cfg(test)]
#[path = "provision_test.rs"]
mod tests;
