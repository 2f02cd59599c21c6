//! Error taxonomy.
//!
//! Errors are scoped: an [`ImageError`] or [`DispatchError`] concerns one
//! image, a [`SourceError`] concerns one source. The runner catches both at
//! the image/source boundary so that siblings keep going. Conditions that
//! are expected control flow (expired images, images already fetched in this
//! run) are result variants, not errors.

use std::path::PathBuf;

/// Failures tied to a single image's local bytes.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    /// No local copy where one was expected. Recoverable by re-fetching.
    #[error("image not found on disk: {0}")]
    NotFound(PathBuf),

    /// Local bytes do not hash to the expected digest.
    #[error("image '{id}' failed verification: expected '{expected}', obtained '{obtained}'")]
    VerificationFailed {
        id: String,
        expected: String,
        obtained: String,
    },

    #[error("malformed content hash '{0}', expected '<algorithm>:<hexdigest>'")]
    MalformedHash(String),

    #[error("unsupported digest algorithm '{0}'")]
    UnsupportedAlgorithm(String),

    #[error("download failed ({code}): {reason}")]
    DownloadFailed { code: i32, reason: String },

    /// The external conversion tool exited unsuccessfully.
    #[error("image conversion failed ({code}): {diagnostics}")]
    ConversionFailed { code: i32, diagnostics: String },

    /// A container payload (OVA) could not be scanned for its disk.
    #[error("cannot read disk from container '{path}': {reason}")]
    Container { path: PathBuf, reason: String },

    /// Another process holds the identifier's writer lock.
    #[error("image '{identifier}' is locked by another process: {path}")]
    Locked { identifier: String, path: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures that abort one source's discovery.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("listing failed ({code}): {reason}")]
    ListingFailed { code: u16, reason: String },

    #[error("invalid image list: {0}")]
    InvalidImageList(String),

    #[error("invalid source configuration: {0}")]
    InvalidConfig(String),
}

/// Failures reported by the image catalog service.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("catalog returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("catalog transport error: {0}")]
    Transport(String),

    #[error("cannot decode catalog response: {0}")]
    Decode(String),
}

/// Failures while reconciling one descriptor against the catalog.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// More than one managed entry carries the same identifier. Needs an
    /// operator; nothing is deleted automatically.
    #[error("several catalog entries for '{identifier}', remove them manually: {ids:?}")]
    DuplicateEntry { identifier: String, ids: Vec<String> },

    #[error("insufficient permissions to {action} catalog entry")]
    PermissionDenied { action: String },

    /// A caller-supplied property would overwrite a computed one.
    #[error("overwriting property '{key}' is not supported")]
    MetadataCollision { key: String },

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl CatalogError {
    pub fn is_forbidden(&self) -> bool {
        matches!(self, CatalogError::Forbidden(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, CatalogError::Conflict(_))
    }
}
