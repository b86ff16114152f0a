//! Error types for the orchestration core.
//!
//! Every core operation fails with a [`CareError`]. The variant tells the
//! caller what kind of failure happened (see [`ErrorKind`]) and the `Display`
//! text is the short human-readable detail shown to the user.

use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main error type for CARE operations.
#[derive(Error, Debug)]
pub enum CareError {
    /// A user supplied path resolved outside of its sandbox root
    #[error("Invalid path: {} escapes {}", .path.display(), .base.display())]
    InvalidPath { base: PathBuf, path: PathBuf },

    /// Target file, folder or key does not exist
    #[error("{what} not found")]
    NotFound { what: String },

    /// Expected a directory, found a file
    #[error("Path is a file, not a directory: {}", .path.display())]
    NotADirectory { path: PathBuf },

    /// Expected a file, found a directory
    #[error("Path is a directory, not a file: {}", .path.display())]
    NotAFile { path: PathBuf },

    /// The requested file is not an image
    #[error("The requested file is not an image: {}", .path.display())]
    NotAnImage { path: PathBuf },

    /// Required identifying parameters were absent
    #[error("Missing one or more parameters: {0}")]
    MissingParams(String),

    /// Caller supplied data that cannot be accepted
    #[error("{0}")]
    InvalidInput(String),

    /// Rename target already exists
    #[error("Key \"{key}\" already exists. Choose a different name.")]
    DuplicateKey { key: String },

    /// The AI subprocess exited unsuccessfully
    #[error("{task} AI model error (exit code {}), please contact support.", .code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()))]
    AiProcess { task: String, code: Option<i32> },

    /// The AI subprocess was terminated before it finished
    #[error("{task} was terminated")]
    Terminated { task: String },

    /// The AI subprocess could not be started
    #[error("Failed to start AI process {}: {source}", .program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Unexpected file-system failure
    #[error("{op} failed for {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A JSON file could not be read or written
    #[error("Invalid JSON in {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Zip archive could not be written
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

/// Coarse classification of a [`CareError`], serialised into failure
/// responses so that callers can branch without matching on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidPath,
    NotFound,
    NotADirectory,
    NotAFile,
    NotAnImage,
    MissingParams,
    InvalidInput,
    DuplicateKey,
    AiProcessError,
    Terminated,
    IoError,
}

impl CareError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CareError::InvalidPath { .. } => ErrorKind::InvalidPath,
            CareError::NotFound { .. } => ErrorKind::NotFound,
            CareError::NotADirectory { .. } => ErrorKind::NotADirectory,
            CareError::NotAFile { .. } => ErrorKind::NotAFile,
            CareError::NotAnImage { .. } => ErrorKind::NotAnImage,
            CareError::MissingParams(_) => ErrorKind::MissingParams,
            CareError::InvalidInput(_) => ErrorKind::InvalidInput,
            CareError::DuplicateKey { .. } => ErrorKind::DuplicateKey,
            CareError::AiProcess { .. } | CareError::Launch { .. } => ErrorKind::AiProcessError,
            CareError::Terminated { .. } => ErrorKind::Terminated,
            CareError::Io { .. } | CareError::Json { .. } | CareError::Archive(_) => {
                ErrorKind::IoError
            }
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        CareError::NotFound { what: what.into() }
    }

    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CareError::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

impl Serialize for CareError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Attach an operation name and path to raw `std::io` errors.
pub trait IoContext<T> {
    fn io_context(self, op: &'static str, path: &Path) -> CareResult<T>;
}

impl<T> IoContext<T> for Result<T, std::io::Error> {
    fn io_context(self, op: &'static str, path: &Path) -> CareResult<T> {
        self.map_err(|e| CareError::io(op, path, e))
    }
}

pub type CareResult<T> = Result<T, CareError>;
