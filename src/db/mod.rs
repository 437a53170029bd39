//! Queue store: the shared table of outreach items.
//!
//! This module is split into submodules:
//! - `model`: claim filters and field updates passed to a store.
//! - `repo`: the PostgreSQL store (`FOR UPDATE SKIP LOCKED`).
//! - `memory`: an in-process store with the same locking contract.
//!
//! Stages only talk to the [`QueueStore`] / [`QueueTx`] traits.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{ItemId, OutreachItem, OutreachStatus};

pub mod memory;
pub mod model;
pub mod repo;

pub use memory::MemoryQueueStore;
pub use model::{ClaimFilter, ItemUpdate, OrderKey};
pub use repo::{init_pool, run_migrations, PgQueueStore, Pool};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("item {id} is no longer {expected}")]
    Conflict { id: ItemId, expected: OutreachStatus },
    #[error("item {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: ItemId,
        from: OutreachStatus,
        to: OutreachStatus,
    },
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Opens transactions against the shared queue.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn QueueTx>, StoreError>;
}

/// One open transaction. Dropping it without `commit` rolls it back and
/// releases every row it claimed.
#[async_trait]
pub trait QueueTx: Send {
    /// Lock and return up to `filter.limit` eligible rows, skipping rows
    /// locked by other transactions. An empty result is not an error.
    async fn claim(&mut self, filter: &ClaimFilter) -> Result<Vec<OutreachItem>, StoreError>;

    async fn update(&mut self, id: &ItemId, change: ItemUpdate) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Shared precondition for both store implementations.
pub(crate) fn check_transition(id: &ItemId, change: &ItemUpdate) -> Result<(), StoreError> {
    if !change.expected.can_advance_to(change.status) {
        return Err(StoreError::InvalidTransition {
            id: *id,
            from: change.expected,
            to: change.status,
        });
    }
    Ok(())
}
