//! Keeps an authenticated identity and its profile document in step.
//!
//! The [`Reconciler`] subscribes to an [`IdentitySource`], provisions a
//! default profile in a [`ProfileStore`] the first time an identity signs
//! in, and exposes one combined [`SessionState`] to presentation code.
//! Collaborators are traits; `backend` holds an in-process implementation
//! and REST adapters for Firebase.

pub mod age;
pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod profile;
pub mod reconciler;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::ReconcilerConfig;
pub use error::{ErrorCode, ReconcileError};
pub use identity::{Identity, IdentityError, IdentitySource, ProviderKind};
pub use profile::{ProfilePatch, ProfileRecord, ProfileStore, StoreError};
pub use reconciler::{Reconciler, SessionState};
