//! Distributed locking
//!
//! [`DistributedMutex`] guarantees at most one live holder per lock name
//! across every process sharing the coordination store. Locks expire on
//! their own, so a crashed holder never blocks the fleet for longer than
//! its TTL.

mod mutex;

pub use mutex::{DistributedMutex, LockError, LockLease, LOCK_KEY_PREFIX};
