//! Error types for arbor-core

use std::path::PathBuf;

/// Failure to derive an object's checksum
#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    /// The stored encoding could not be parsed
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The caller's interrupt predicate fired mid-computation
    #[error("Checksum computation interrupted")]
    Interrupted,
}

/// Errors raised by repository operations
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("Not a repository: {0}")]
    NotARepository(PathBuf),

    #[error("Repository already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Invalid repository config: {0}")]
    Config(String),

    #[error("Invalid object: {0}")]
    InvalidObject(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The object set itself could not be listed
    #[error("Failed to enumerate objects: {0}")]
    Enumeration(#[source] walkdir::Error),

    #[error(transparent)]
    Checksum(#[from] ChecksumError),
}

/// Per-object verification failure found by fsck
#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    /// Content object in an archive repository without the archival suffix
    #[error("Invalid archive filename '{}'", .0.display())]
    Naming(PathBuf),

    #[error(transparent)]
    Checksum(#[from] ChecksumError),

    #[error("corrupted object '{expected}': recomputed checksum {actual}")]
    Mismatch { expected: String, actual: String },
}

/// Fatal fsck failure; per-object problems never surface here
#[derive(Debug, thiserror::Error)]
pub enum FsckError {
    #[error(transparent)]
    Enumeration(RepoError),

    #[error("Consistency check interrupted")]
    Interrupted,
}
