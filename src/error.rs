//! Error types for the versioning compiler

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompilerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: builder field '{field}' is not set")]
    MissingField { field: &'static str },

    #[error("Compilation with {backend} failed: {message} (see {})", log.display())]
    CompileFailed {
        backend: String,
        log: PathBuf,
        message: String,
    },

    #[error("Failed to spawn '{program}': {message}")]
    Spawn { program: String, message: String },

    #[error("'{program}' did not finish within {seconds}s and was killed")]
    Timeout { program: String, seconds: u64 },

    #[error("Failed to load '{}': {message}", path.display())]
    Load { path: PathBuf, message: String },

    #[error("Backend error: {message}")]
    Backend { message: String },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid format: {message}")]
    InvalidFormat { message: String },

    #[error("{failed} of {total} variants failed")]
    VariantsFailed { failed: usize, total: usize },
}

pub type Result<T> = std::result::Result<T, CompilerError>;

impl CompilerError {
    pub fn compile_failed(
        backend: impl Into<String>,
        log: impl AsRef<Path>,
        message: impl Into<String>,
    ) -> Self {
        Self::CompileFailed {
            backend: backend.into(),
            log: log.as_ref().to_path_buf(),
            message: message.into(),
        }
    }

    pub fn load(path: impl AsRef<Path>, message: impl Into<String>) -> Self {
        Self::Load {
            path: path.as_ref().to_path_buf(),
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Whether this error came from the compile step itself rather than from setup.
    pub fn is_compile_failure(&self) -> bool {
        matches!(
            self,
            Self::CompileFailed { .. } | Self::Spawn { .. } | Self::Timeout { .. }
        )
    }
}
