use chrono::{DateTime, Utc};

use crate::error::{ModelError, Result};
use crate::ids::{AssetId, FileId, LibraryId};
use crate::library::Visibility;

/// The concrete shape of an asset, determined by whichever content handler
/// claimed its first file. A tagged variant instead of a subtype hierarchy:
/// new kinds are added here plus a handler, nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum AssetKind {
    /// Opaque binary content grouped purely by digest.
    Generic,
    Photo,
    Note,
}

impl AssetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AssetKind::Generic => "generic",
            AssetKind::Photo => "photo",
            AssetKind::Note => "note",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "generic" => Ok(AssetKind::Generic),
            "photo" => Ok(AssetKind::Photo),
            "note" => Ok(AssetKind::Note),
            other => Err(ModelError::InvalidAssetKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for AssetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A piece of content in a library, owning one or more files.
///
/// Assets survive the removal of individual files; an asset whose files are
/// all unavailable is logically dead but kept so re-found content can attach
/// back to it.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AssetRecord {
    pub id: AssetId,
    pub library_id: LibraryId,
    pub kind: AssetKind,
    /// Content digest that defines this asset's identity. Every available
    /// file attached to the asset is expected to hash to this value; files
    /// that diverge are split off by the owning handler.
    pub identity_digest: String,
    pub visibility: Visibility,
}

/// One path inside one library, pointing at exactly one asset.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FileRecord {
    pub id: FileId,
    pub asset_id: AssetId,
    pub library_id: LibraryId,
    /// Path relative to the library root, without a leading slash.
    pub path: String,
    /// Content hash used to identify changes and duplicates.
    pub digest: String,
    /// Time the file was last confirmed present on the backend. `None` means
    /// the file is known but currently missing.
    pub availability: Option<DateTime<Utc>>,
}

impl FileRecord {
    pub fn available(&self) -> bool {
        self.availability.is_some()
    }

    /// Name of the directory the file sits in, relative to the library root.
    /// Empty for files directly under the root.
    pub fn directory_name(&self) -> &str {
        match self.path.rfind('/') {
            Some(index) => &self.path[..index],
            None => "",
        }
    }
}

/// Validate a library-relative path: relative, slash-separated, no parent or
/// current-directory components.
pub fn validate_relative_path(path: &str) -> Result<()> {
    if path.is_empty() || path.starts_with('/') || path.ends_with('/') {
        return Err(ModelError::InvalidPath(path.to_string()));
    }
    if path.split('/').any(|part| matches!(part, "" | "." | "..")) {
        return Err(ModelError::InvalidPath(path.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_name_splits_on_last_slash() {
        let file = FileRecord {
            id: FileId::new(),
            asset_id: AssetId::new(),
            library_id: LibraryId::new(),
            path: "a/b/c.txt".to_string(),
            digest: String::new(),
            availability: None,
        };
        assert_eq!(file.directory_name(), "a/b");

        let root_file = FileRecord {
            path: "c.txt".to_string(),
            ..file
        };
        assert_eq!(root_file.directory_name(), "");
    }

    #[test]
    fn relative_path_validation() {
        assert!(validate_relative_path("foo/bar.txt").is_ok());
        assert!(validate_relative_path("foo").is_ok());
        assert!(validate_relative_path("/foo").is_err());
        assert!(validate_relative_path("foo/").is_err());
        assert!(validate_relative_path("foo//bar").is_err());
        assert!(validate_relative_path("foo/../bar").is_err());
        assert!(validate_relative_path("").is_err());
    }
}
