//! Core data model definitions shared across Kura crates.

pub mod error;
pub mod event;
pub mod ids;
pub mod library;
pub mod records;

pub use error::{ModelError, Result as ModelResult};
pub use event::ScanEvent;
pub use ids::{AssetId, FileId, LibraryId};
pub use library::{Library, Visibility};
pub use records::{AssetKind, AssetRecord, FileRecord};
