//! Library scanning and file-event reconciliation.
//!
//! A [`LibraryHandle`] ties a storage backend to the catalog database. Full
//! scans and live watching both produce [`ScanEvent`](kura_model::ScanEvent)s
//! which the engine commits one transaction at a time, grouping files into
//! assets by content identity and consulting [`ContentHandler`]s for
//! membership decisions.

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod library;
pub mod scanner;
pub mod storage;

pub use config::ScanConfig;
pub use error::{Result, ScanError};
pub use handlers::{ContentHandler, GenericFileHandler, HandlerRegistry};
pub use library::LibraryHandle;
pub use scanner::runner::{ErrorPolicy, RunOptions, ScanStats, run};
pub use scanner::{CommitEvent, ScanContext, WriterConcurrency};
pub use storage::memory::MemoryStore;
pub use storage::{EventSource, StorageBackend, StorageRegistry, WatchPoll};
