//! The reconciliation engine: turns scan events into database state.

pub mod events;
pub mod runner;
mod worker;

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::ScanConfig;
use crate::handlers::HandlerRegistry;

pub use events::CommitEvent;

/// How many connections may write to the database at once.
///
/// Sqlite serializes writers at the database level, so running several
/// workers against one file mostly produces lock contention. Databases in
/// WAL mode on fast storage can opt in to concurrent workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterConcurrency {
    SingleWriter,
    Concurrent,
}

/// Shared state threaded through every commit: the connection pool, the
/// handler registry and scan configuration.
#[derive(Debug, Clone)]
pub struct ScanContext {
    pub pool: SqlitePool,
    pub handlers: Arc<HandlerRegistry>,
    pub config: ScanConfig,
    pub concurrency: WriterConcurrency,
}

impl ScanContext {
    pub fn new(pool: SqlitePool, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            pool,
            handlers,
            config: ScanConfig::default(),
            concurrency: WriterConcurrency::SingleWriter,
        }
    }

    pub fn with_config(mut self, config: ScanConfig) -> Self {
        self.config = config;
        self
    }

    /// Allow multiple workers to write concurrently. Only sensible for
    /// databases that support it (WAL-mode files, not in-memory databases).
    pub fn with_concurrent_writes(mut self) -> Self {
        self.concurrency = WriterConcurrency::Concurrent;
        self
    }
}
