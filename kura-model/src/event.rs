//! The storage-agnostic event vocabulary produced by backends and consumed by
//! the reconciliation engine.
//!
//! Events are immutable values. They are produced once (by a watch stream or
//! a full-scan diff) and committed exactly once against a library. Because
//! the parallel runner hands them to worker tasks through a queue, they must
//! stay cheap to clone and serializable.

/// A single observed filesystem change, normalized across storage backends.
///
/// All paths are relative to the library root and never start with a slash.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum ScanEvent {
    /// A new file, or a file whose content is known to need (re)scanning.
    ///
    /// This is the catch-all event: files moved in from outside the library,
    /// files in a directory that stopped being ignored, and files found by a
    /// full scan all surface as `File`.
    File { path: String },
    /// An existing file may have been modified in place.
    ///
    /// Committing this for an untracked path behaves like [`ScanEvent::File`].
    FileModified { path: String },
    /// A file was renamed or moved while staying inside the library.
    FileMoved { old_path: String, new_path: String },
    /// A file was deleted or moved out of the library.
    FileRemoved { path: String },
    /// A directory was renamed or moved while staying inside the library.
    DirectoryMoved { old_path: String, new_path: String },
    /// A directory was deleted or moved out of the library.
    DirectoryRemoved { path: String },
}

impl ScanEvent {
    /// The path most useful for diagnostics: the destination for moves, the
    /// affected path otherwise.
    pub fn path(&self) -> &str {
        match self {
            ScanEvent::File { path }
            | ScanEvent::FileModified { path }
            | ScanEvent::FileRemoved { path }
            | ScanEvent::DirectoryRemoved { path } => path,
            ScanEvent::FileMoved { new_path, .. }
            | ScanEvent::DirectoryMoved { new_path, .. } => new_path,
        }
    }

    /// Short human-readable label used in log messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ScanEvent::File { .. } => "file",
            ScanEvent::FileModified { .. } => "file-modified",
            ScanEvent::FileMoved { .. } => "file-moved",
            ScanEvent::FileRemoved { .. } => "file-removed",
            ScanEvent::DirectoryMoved { .. } => "directory-moved",
            ScanEvent::DirectoryRemoved { .. } => "directory-removed",
        }
    }
}

impl std::fmt::Display for ScanEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanEvent::FileMoved { old_path, new_path }
            | ScanEvent::DirectoryMoved { old_path, new_path } => {
                write!(f, "{}({old_path:?} -> {new_path:?})", self.kind_name())
            }
            other => write!(f, "{}({:?})", other.kind_name(), other.path()),
        }
    }
}
