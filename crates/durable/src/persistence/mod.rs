//! Persistence layer
//!
//! This module provides:
//! - [`WorkflowStorage`] trait, implemented by [`PersistentStorage`]
//! - [`DatabaseDialect`] and [`TransactionController`] backend seams
//! - [`InMemoryDialect`] for tests and single-process use
//! - [`PostgresDialect`] for production
//! - [`CommandWriter`] write paths (synchronous or batching)

pub(crate) mod config;
mod dialect;
mod memory;
mod postgres;
mod storage;
mod store;
mod txn;
mod writer;

pub use config::{BatcherConfig, QueueBackoff, StorageConfig};
pub use dialect::{BatchCommand, DatabaseDialect};
pub use memory::{InMemoryDialect, InMemoryStore, InMemoryTransactionController, MemoryTx};
pub use postgres::{run_migrations, PgTransactionController, PostgresDialect};
pub use storage::PersistentStorage;
pub use store::{StoreError, WorkflowStorage};
pub use txn::TransactionController;
pub use writer::{BatchingCommandWriter, CommandWriter, SyncCommandWriter};
