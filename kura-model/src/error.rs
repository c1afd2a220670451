use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("invalid visibility value: {0}")]
    InvalidVisibility(i64),

    #[error("invalid asset kind: {0}")]
    InvalidAssetKind(String),

    #[error("invalid library path {0:?}: paths must be relative and must not contain parent components")]
    InvalidPath(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;
