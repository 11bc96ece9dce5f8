//! Coordination store layer
//!
//! This module provides:
//! - [`CoordinationStore`] trait for the shared key-value store
//! - [`InMemoryCoordinationStore`] for testing
//! - [`RedisCoordinationStore`] for production

mod memory;
mod redis_store;
mod store;

pub use memory::InMemoryCoordinationStore;
pub use redis_store::RedisCoordinationStore;
pub use store::{CoordinationStore, StoreError, WindowDecision};
