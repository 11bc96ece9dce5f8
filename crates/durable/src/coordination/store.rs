//! CoordinationStore trait definition

use std::time::Duration;

use async_trait::async_trait;

/// Error type for coordination store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected or failed a command
    #[error("coordination store command failed: {0}")]
    Command(String),

    /// The store answered with something we could not interpret
    #[error("unexpected reply from coordination store: {0}")]
    UnexpectedReply(String),
}

/// Outcome of an atomic sliding-window admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    /// The caller's timestamp was added; a slot is reserved
    Admitted,

    /// The window is full; `oldest_ms` is the score of the oldest live entry
    Rejected { oldest_ms: i64 },
}

/// Shared key-value store used as the only synchronization primitive
/// between worker processes.
///
/// Implementations must be safe for concurrent use from many tasks, and
/// every single method must be atomic with respect to other callers on the
/// same store instance.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    // =========================================================================
    // Plain keys
    // =========================================================================

    /// Read a live key
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set `key` to `value` with expiry, only if it does not already exist
    ///
    /// Returns `true` when this call created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Delete a key unconditionally. Returns `true` if it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Reset the expiry of an existing key. Returns `false` if it is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Reset the expiry only if the current value equals `expected`
    async fn expire_if_value(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Delete only if the current value equals `expected`
    async fn delete_if_value(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    // =========================================================================
    // Sorted sets (members ordered by integer score)
    // =========================================================================

    /// Add a member with the given score (replaces the score of an existing member)
    async fn sorted_add(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError>;

    /// Remove every member whose score is `<= max_score`. Returns the number removed.
    async fn sorted_remove_up_to(&self, key: &str, max_score: i64) -> Result<u64, StoreError>;

    /// Number of members in the set
    async fn sorted_count(&self, key: &str) -> Result<u64, StoreError>;

    /// The member with the lowest score, with its score
    async fn sorted_oldest(&self, key: &str) -> Result<Option<(String, i64)>, StoreError>;

    /// Prune, count and conditionally add in one atomic step
    ///
    /// Removes members with score `<= now_ms - window`, then adds `member`
    /// at `now_ms` if fewer than `capacity` members remain.
    async fn window_admit(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window: Duration,
        capacity: u32,
    ) -> Result<WindowDecision, StoreError>;
}
