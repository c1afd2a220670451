use chrono::{DateTime, Utc};

use crate::error::{ModelError, Result};
use crate::ids::LibraryId;

/// Visibility settings shared by libraries and their assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Visibility {
    Public,
    Internal,
    Members,
    Owners,
    /// Use the owning library's default. Only valid on assets, never as a
    /// library default.
    Inherit,
}

impl Visibility {
    pub fn as_i64(self) -> i64 {
        match self {
            Visibility::Public => 0,
            Visibility::Internal => 1,
            Visibility::Members => 2,
            Visibility::Owners => 3,
            Visibility::Inherit => 10,
        }
    }

    pub fn from_i64(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Visibility::Public),
            1 => Ok(Visibility::Internal),
            2 => Ok(Visibility::Members),
            3 => Ok(Visibility::Owners),
            10 => Ok(Visibility::Inherit),
            other => Err(ModelError::InvalidVisibility(other)),
        }
    }
}

/// A library is a scan root: one storage backend URI plus a context string
/// that selects which content handlers may claim its files.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Library {
    pub id: LibraryId,
    /// URI for the configured storage backend, e.g. `file:///mnt/photos`.
    pub source: String,
    /// Identifies the content types to expect in this library. Handlers
    /// decline files from contexts they do not understand.
    pub context: String,
    pub default_visibility: Visibility,
    pub created_at: DateTime<Utc>,
}

impl Library {
    pub fn new(source: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            id: LibraryId::new(),
            source: source.into(),
            context: context.into(),
            default_visibility: Visibility::Members,
            created_at: Utc::now(),
        }
    }

    /// Libraries cannot inherit their visibility from anywhere.
    pub fn validate_default_visibility(&self) -> Result<()> {
        if self.default_visibility == Visibility::Inherit {
            return Err(ModelError::InvalidVisibility(Visibility::Inherit.as_i64()));
        }
        Ok(())
    }
}

impl std::fmt::Display for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "library {} ({})", self.id, self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visibility_round_trips_through_storage_values() {
        for visibility in [
            Visibility::Public,
            Visibility::Internal,
            Visibility::Members,
            Visibility::Owners,
            Visibility::Inherit,
        ] {
            assert_eq!(
                Visibility::from_i64(visibility.as_i64()).unwrap(),
                visibility
            );
        }
        assert!(Visibility::from_i64(42).is_err());
    }

    #[test]
    fn libraries_reject_inherited_visibility() {
        let mut library = Library::new("memory://test", "test");
        assert!(library.validate_default_visibility().is_ok());
        library.default_visibility = Visibility::Inherit;
        assert!(library.validate_default_visibility().is_err());
    }
}
