//! The retention store: sessions, observations, summaries and prompts in SQLite.
//!
//! Functions in the submodules take a borrowed [`rusqlite::Connection`] and are
//! synchronous. [`retention::RetentionStore`] wraps them for async callers and
//! runs eviction after each write.

pub mod eviction;
pub mod keywords;
pub mod observations;
pub mod prompts;
pub mod retention;
pub mod sessions;
pub mod summaries;
pub mod types;

pub use retention::{CleanupCallback, RetentionStore, StoreStats};
pub use types::*;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Current time as (RFC 3339 string, epoch millis).
pub(crate) fn now() -> (String, i64) {
    let now = chrono::Utc::now();
    (now.to_rfc3339(), now.timestamp_millis())
}

/// `?, ?, ?` for an `IN (...)` list of `n` values.
pub(crate) fn id_placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("failed to serialize JSON column")
}

/// Decode a JSON text column. Malformed content decodes to the default value.
pub(crate) fn from_json<T: DeserializeOwned + Default>(text: &str) -> T {
    match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "malformed JSON column, using default");
            T::default()
        }
    }
}
