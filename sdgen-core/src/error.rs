//! Error types for sdgen.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Failure category of a run, one per [`SdgenError`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    MissingCapability,
    ModelLoad,
    Generation,
    Io,
    Other,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MissingCapability => "MissingCapability",
            Self::ModelLoad => "ModelLoadFailure",
            Self::Generation => "GenerationFailure",
            Self::Io => "IOFailure",
            Self::Other => "Error",
        };
        f.write_str(name)
    }
}

/// Main error type for the sdgen library.
#[derive(Error, Debug)]
pub enum SdgenError {
    /// A runtime asset or compiled-in backend the generator needs is unavailable.
    #[error("missing capability: {what}: {source:#}")]
    MissingCapability {
        what: String,
        #[source]
        source: anyhow::Error,
    },

    /// The checkpoint could not be opened, parsed or mapped onto the device.
    #[error("failed to load model from {path}: {source:#}")]
    ModelLoad {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// The backend failed during the generation pass.
    #[error("generation failed: {source:#}")]
    Generation {
        #[source]
        source: anyhow::Error,
    },

    /// Creating the output directory failed.
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The image encoder rejected the output path or failed to write it.
    #[error("failed to save image to {path}: {source}")]
    ImageSave {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Writing the result record failed.
    #[error("failed to write result record: {0}")]
    Report(#[source] std::io::Error),

    /// Anything else surfaced by a collaborator.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SdgenError {
    pub fn model_load(path: impl Into<PathBuf>, source: impl Into<anyhow::Error>) -> Self {
        Self::ModelLoad {
            path: path.into(),
            source: source.into(),
        }
    }

    pub fn generation(source: impl Into<anyhow::Error>) -> Self {
        Self::Generation {
            source: source.into(),
        }
    }

    pub fn missing_capability(what: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::MissingCapability {
            what: what.into(),
            source: source.into(),
        }
    }

    /// The category callers branch on.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MissingCapability { .. } => ErrorCategory::MissingCapability,
            Self::ModelLoad { .. } => ErrorCategory::ModelLoad,
            Self::Generation { .. } => ErrorCategory::Generation,
            Self::CreateDir { .. } | Self::ImageSave { .. } | Self::Report(_) => ErrorCategory::Io,
            Self::Other(_) => ErrorCategory::Other,
        }
    }
}

/// Result type alias for sdgen operations.
pub type Result<T> = std::result::Result<T, SdgenError>;
