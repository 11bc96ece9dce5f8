//! Distributed mutex backed by the coordination store

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::coordination::{CoordinationStore, StoreError};

/// Key prefix for job locks
pub const LOCK_KEY_PREFIX: &str = "cronJobLock:";

/// Error types for mutex operations
#[derive(Debug, Error)]
pub enum LockError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Proof of ownership for a held lock
///
/// The token is stored as the lock value; renew and release only act while
/// the stored value still matches it, so a holder whose lock expired and was
/// re-acquired elsewhere cannot extend or delete the new owner's lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    name: String,
    key: String,
    token: String,
}

impl LockLease {
    /// Lock name (job name)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store key holding the lock
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Holder token stored as the lock value
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Named lock shared by every process connected to the same store
///
/// # Example
///
/// ```ignore
/// use jobguard_durable::lock::DistributedMutex;
///
/// let mutex = DistributedMutex::new(store);
///
/// if let Some(lease) = mutex.acquire("createRewards", Duration::from_secs(40)).await? {
///     // ... exclusive work, calling mutex.renew(&lease, ttl) periodically
///     mutex.release(&lease).await?;
/// }
/// ```
#[derive(Clone)]
pub struct DistributedMutex {
    store: Arc<dyn CoordinationStore>,
    key_prefix: String,
}

impl DistributedMutex {
    /// Create a mutex using the default `cronJobLock:` key prefix
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            key_prefix: LOCK_KEY_PREFIX.to_string(),
        }
    }

    /// Use a different key prefix (e.g. per-run locks)
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Store key for a lock name
    pub fn key_for(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }

    /// Try to take the lock without waiting
    ///
    /// Returns `None` when another holder owns it.
    #[instrument(skip(self))]
    pub async fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockLease>, LockError> {
        let key = self.key_for(name);
        let token = Uuid::now_v7().to_string();

        if self.store.set_if_absent(&key, &token, ttl).await? {
            debug!(lock = %name, "lock acquired");
            Ok(Some(LockLease {
                name: name.to_string(),
                key,
                token,
            }))
        } else {
            debug!(lock = %name, "lock held elsewhere");
            Ok(None)
        }
    }

    /// Extend the TTL of a held lock
    ///
    /// Returns `false` if the lock expired or now belongs to someone else.
    pub async fn renew(&self, lease: &LockLease, ttl: Duration) -> Result<bool, LockError> {
        Ok(self
            .store
            .expire_if_value(&lease.key, &lease.token, ttl)
            .await?)
    }

    /// Release a held lock
    ///
    /// Returns `false` if the lock was no longer ours (already expired or
    /// taken over); in that case nothing is deleted.
    pub async fn release(&self, lease: &LockLease) -> Result<bool, LockError> {
        let released = self.store.delete_if_value(&lease.key, &lease.token).await?;
        debug!(lock = %lease.name, released, "lock released");
        Ok(released)
    }

    /// Delete a lock regardless of holder
    ///
    /// Only for operator cleanup of locks left by crashed workers.
    pub async fn force_release(&self, name: &str) -> Result<bool, LockError> {
        Ok(self.store.delete(&self.key_for(name)).await?)
    }

    /// Whether any holder currently owns the lock
    pub async fn is_locked(&self, name: &str) -> Result<bool, LockError> {
        Ok(self.store.get(&self.key_for(name)).await?.is_some())
    }
}
