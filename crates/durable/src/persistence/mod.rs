//! Persistence layer for callback tasks
//!
//! This module provides:
//! - [`CallbackStore`] trait for task and run persistence
//! - [`InMemoryCallbackStore`] for testing
//! - [`PostgresCallbackStore`] for production, with [`migrate`]

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryCallbackStore;
pub use postgres::{migrate, PostgresCallbackStore};
pub use store::{CallbackStore, CallbackStoreError};
