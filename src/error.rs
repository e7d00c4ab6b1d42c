use std::path::PathBuf;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum BaycatError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("destination {0} exists, but is not a directory")]
    DestinationNotADirectory(PathBuf),

    #[error("manifest is rooted at {root}, but the selector is rooted at {selector}")]
    DifferentRootPath { root: String, selector: String },

    #[error("there is already a manifest at {0}; re-run with overwrite to replace it")]
    ManifestAlreadyExists(PathBuf),

    #[error("manifest has no selectors, so there is nothing to walk")]
    VacuousManifest,

    #[error("checksum comparison requested, but no digest is present for {0}")]
    ChecksumMissing(String),

    #[error("incommensurable checksum kinds ({0} vs {1}), must regenerate the manifest")]
    ChecksumKind(String, String),

    #[error("entry paths do not match: {0} vs {1}")]
    PathMismatch(String, String),

    #[error("\"{0}\" collides with the directory placeholder name and will not be synced")]
    ReservedName(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BaycatError {
    /// True when the error is a lookup miss, which manifest loading converts
    /// into "start from an empty manifest".
    pub fn is_not_found(&self) -> bool {
        match self {
            BaycatError::Store(e) => e.is_not_found(),
            BaycatError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
