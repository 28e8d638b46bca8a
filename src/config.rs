//! Reconciler configuration parsed from environment variables.

use std::env::VarError;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_SETTLE_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// How long sign-in/sign-out wrappers wait for the session state to
    /// reflect the change before returning anyway.
    pub settle_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { settle_timeout: Duration::from_millis(DEFAULT_SETTLE_TIMEOUT_MS) }
    }
}

impl ReconcilerConfig {
    /// Optional:
    /// - `PROFILE_SYNC_SETTLE_TIMEOUT_MS`: default 10000
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            settle_timeout: Duration::from_millis(env_parse(
                "PROFILE_SYNC_SETTLE_TIMEOUT_MS",
                DEFAULT_SETTLE_TIMEOUT_MS,
            )),
        }
    }
}

/// Parse `key` as `T`, falling back to `default` when unset or malformed.
pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    match env_string(key) {
        Some(raw) => match raw.parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, raw = %raw, "malformed environment value; using default");
                default
            }
        },
        None => default,
    }
}

/// Read `key`, treating unset and blank values alike.
pub(crate) fn env_string(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => Some(raw.trim().to_owned()),
        Ok(_) | Err(VarError::NotPresent) => None,
        Err(VarError::NotUnicode(_)) => {
            warn!(key, "environment value is not valid unicode; ignoring");
            None
        }
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
