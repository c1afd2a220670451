//! Local-filesystem storage backend (`file://` URIs), including the
//! notify-based watch stream.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use url::Url;

use kura_model::records::validate_relative_path;

use crate::error::{Result, ScanError};
use crate::storage::watch::FsWatchStream;
use crate::storage::{EventSource, StorageBackend};

/// Storage rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_url(url: &Url) -> Result<Self> {
        let root = url
            .to_file_path()
            .map_err(|_| ScanError::Validation(format!("invalid file URI: {url}")))?;
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn absolute(&self, path: &str) -> Result<PathBuf> {
        if path.is_empty() {
            return Ok(self.root.clone());
        }
        validate_relative_path(path)?;
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    async fn check(&self) -> Result<()> {
        let metadata = tokio::fs::metadata(&self.root).await.map_err(|_| {
            ScanError::Validation(format!(
                "the specified path {} does not exist",
                self.root.display()
            ))
        })?;
        if !metadata.is_dir() {
            return Err(ScanError::Validation(format!(
                "the specified path {} is not a directory",
                self.root.display()
            )));
        }
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.absolute(path)?).await?)
    }

    async fn get_modified_time(&self, path: &str) -> Result<DateTime<Utc>> {
        let metadata = tokio::fs::metadata(self.absolute(path)?).await?;
        let modified = metadata.modified()?;
        Ok(modified.into())
    }

    async fn exists(&self, path: &str) -> bool {
        match self.absolute(path) {
            Ok(absolute) => tokio::fs::try_exists(absolute).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn list_dir(&self, path: &str) -> Result<(Vec<String>, Vec<String>)> {
        let mut directories = Vec::new();
        let mut files = Vec::new();

        let mut entries = tokio::fs::read_dir(self.absolute(path)?).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                // Paths are tracked as UTF-8 strings; skip names that aren't.
                continue;
            };
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                directories.push(name);
            } else if file_type.is_file() {
                files.push(name);
            }
        }

        Ok((directories, files))
    }

    async fn watch(&self) -> Result<Box<dyn EventSource>> {
        let stream = FsWatchStream::start(self.root.clone()).await?;
        Ok(Box::new(stream))
    }
}

/// Snapshot of every directory under `root`, as library-relative paths.
/// The watch translator needs this because removal and rename-from
/// notifications no longer have anything on disk to stat.
pub(crate) fn directory_snapshot(root: &Path) -> HashSet<String> {
    let mut directories = HashSet::new();
    let mut queue = vec![PathBuf::new()];

    while let Some(relative) = queue.pop() {
        let Ok(entries) = std::fs::read_dir(root.join(&relative)) else {
            continue;
        };
        for entry in entries.flatten() {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let child = relative.join(entry.file_name());
            if let Some(as_string) = relative_string(&child) {
                directories.insert(as_string);
            }
            queue.push(child);
        }
    }

    directories
}

pub(crate) fn relative_string(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            std::path::Component::Normal(segment) => parts.push(segment.to_str()?),
            std::path::Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn check_rejects_missing_and_non_directory_paths() {
        let tmp = tempfile::tempdir().unwrap();

        let missing = FilesystemBackend::new(tmp.path().join("nope"));
        assert!(matches!(
            missing.check().await,
            Err(ScanError::Validation(_))
        ));

        let file_path = tmp.path().join("plain.txt");
        std::fs::write(&file_path, b"x").unwrap();
        let not_a_dir = FilesystemBackend::new(file_path);
        assert!(matches!(
            not_a_dir.check().await,
            Err(ScanError::Validation(_))
        ));

        let valid = FilesystemBackend::new(tmp.path());
        assert!(valid.check().await.is_ok());
    }

    #[tokio::test]
    async fn walk_files_descends_recursively() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("a/b")).unwrap();
        std::fs::write(tmp.path().join("top.txt"), b"1").unwrap();
        std::fs::write(tmp.path().join("a/one.txt"), b"2").unwrap();
        std::fs::write(tmp.path().join("a/b/two.txt"), b"3").unwrap();

        let backend = FilesystemBackend::new(tmp.path());
        let mut paths = backend.walk_files("", true).await.unwrap();
        paths.sort();
        assert_eq!(paths, vec!["a/b/two.txt", "a/one.txt", "top.txt"]);
    }

    #[test]
    fn directory_snapshot_collects_nested_directories() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("x/y")).unwrap();
        std::fs::create_dir_all(tmp.path().join("z")).unwrap();
        std::fs::write(tmp.path().join("file.txt"), b"f").unwrap();

        let snapshot = directory_snapshot(tmp.path());
        assert_eq!(
            snapshot,
            HashSet::from(["x".to_string(), "x/y".to_string(), "z".to_string()])
        );
    }
}
