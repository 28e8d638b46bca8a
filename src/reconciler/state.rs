//! The combined identity + profile view handed to presentation code.

use std::sync::Arc;

use serde::Serialize;

use crate::identity::Identity;
use crate::profile::ProfileRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionState {
    /// No settled answer yet: startup, or a new identity's profile in flight.
    Loading,
    SignedOut,
    SignedIn { identity: Arc<Identity>, profile: ProfileRecord },
    /// Signed in, but the profile could not be read or provisioned.
    ProfileUnavailable { identity: Arc<Identity>, reason: String },
}

impl SessionState {
    #[must_use]
    pub fn identity(&self) -> Option<&Arc<Identity>> {
        match self {
            Self::SignedIn { identity, .. } | Self::ProfileUnavailable { identity, .. } => Some(identity),
            Self::Loading | Self::SignedOut => None,
        }
    }

    #[must_use]
    pub fn profile(&self) -> Option<&ProfileRecord> {
        match self {
            Self::SignedIn { profile, .. } => Some(profile),
            _ => None,
        }
    }

    #[must_use]
    pub fn uid(&self) -> Option<&str> {
        self.identity().map(|i| i.uid.as_str())
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    /// Provider ids linked to the current identity; empty when signed out.
    #[must_use]
    pub fn linked_providers(&self) -> Vec<String> {
        self.identity()
            .map(|i| i.providers.clone())
            .unwrap_or_default()
    }
}
