//! Session-document persistence: the state gateway trait and its backends.
//!
//! Every durable mutation in the system flows through [`DocumentStore`]. The
//! store guarantees that each operation is a single server-side atomic step,
//! so concurrent writers (request handling, analysis completion, market
//! updates) can never interleave their read/modify/write phases. The
//! [`repository::PortfolioRepository`] facade adds typing and validation on
//! top; nothing else in the workspace issues store commands.

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod redis;
pub mod repository;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;
pub use self::repository::{PortfolioRepository, SessionDefaults};

/// Convenience alias for gateway results.
pub type StateResult<T> = Result<T, StateError>;

/// Common error type returned by store backends and the repository.
#[derive(Debug, Error)]
pub enum StateError {
    /// The session document does not exist (or has expired).
    #[error("session not found: {0}")]
    NotFound(String),
    /// Transport-level failures: network, timeouts, protocol.
    #[error("transport error: {0}")]
    Transport(String),
    /// The stored payload (or a caller payload) failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The caller supplied input the repository refuses to persist.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl StateError {
    /// True when the error simply means the key is gone.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound(_))
    }
}

/// Prefix shared by every session key in the store.
pub const KEY_PREFIX: &str = "portfolio:";

/// Build the store key for a session id.
#[must_use]
pub fn session_key(session_id: &str) -> String {
    format!("{KEY_PREFIX}{session_id}")
}

/// Recover the session id from a store key, if it carries our prefix.
#[must_use]
pub fn session_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(KEY_PREFIX)
}

/// Narrow interface onto the document store.
///
/// All mutating operations refresh the key's TTL to the configured session
/// TTL and return the full post-mutation document as raw JSON. Timestamps
/// cross this boundary as RFC 3339 strings; the repository owns the typed
/// view.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create the document if the key is absent, then return what is stored.
    async fn ensure(&self, session_id: &str, initial_json: &str) -> StateResult<String>;

    /// Read the full document, refreshing its TTL.
    async fn read(&self, session_id: &str) -> StateResult<String>;

    /// Atomically set `current_analysis` and `last_activity`, returning the
    /// post-mutation document used as the run's snapshot.
    async fn begin_analysis(
        &self,
        session_id: &str,
        ticker: &str,
        started_at: &str,
    ) -> StateResult<String>;

    /// Atomically append one result record to `analysis_results` (O(1),
    /// path-addressed) and set `last_activity`.
    async fn append_result(
        &self,
        session_id: &str,
        result_json: &str,
        last_activity: &str,
    ) -> StateResult<String>;

    /// Atomically recompute `total_value` from `holdings` and the supplied
    /// prices, setting `last_activity` in the same step.
    async fn apply_market_update(
        &self,
        session_id: &str,
        prices_json: &str,
        last_activity: &str,
    ) -> StateResult<String>;

    /// Snapshot of the ids of all live sessions.
    async fn list_sessions(&self) -> StateResult<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trip() {
        let key = session_key("s-1-aaaa");
        assert_eq!(key, "portfolio:s-1-aaaa");
        assert_eq!(session_id_from_key(&key), Some("s-1-aaaa"));
        assert_eq!(session_id_from_key("other:s-1-aaaa"), None);
    }
}
