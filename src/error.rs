//! Error types surfaced by the stack-alignment core.
//!
//! Two layers: [`EngineError`] covers failures reported by the external
//! registration engine (or its I/O), while [`StackError`] covers the
//! orchestrator itself. Engine failures are never masked; the refiner
//! annotates them with the slide identity and iteration before re-raising.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StackError>;

/// Failure reported by a registration engine or its image I/O.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O failure on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot decode {}: {reason}", .path.display())]
    Decode { path: PathBuf, reason: String },
    #[error("unresolved image reference '{0}'")]
    UnknownInput(String),
    #[error("{0}")]
    Failed(String),
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn decode(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Decode {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the orchestrator core.
#[derive(Debug, Error)]
pub enum StackError {
    /// Malformed manifest or a manifest entry pointing at a missing file.
    #[error("manifest: {0}")]
    Manifest(String),

    /// Cannot read or write under the project root.
    #[error("project I/O on {}: {source}", .path.display())]
    ProjectIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A cached image exists under the requested key but with another type.
    #[error("cached image {} has the wrong type", .path.display())]
    CacheTypeMismatch { path: PathBuf },

    /// Engine failure attached to a slide. Iterations are 1-based; the
    /// reconstruction stage reports `iteration` 0.
    #[error("registration of slide {slide} (iteration {iteration}) failed: {source}")]
    Registration {
        slide: String,
        iteration: u32,
        #[source]
        source: EngineError,
    },

    /// No path from the chosen root to the named slide.
    #[error("no path from the chosen root to slide {slide}")]
    GraphDisconnected { slide: String },

    /// Invalid option combination, e.g. an iteration range outside the
    /// affine-plus-deformable schedule.
    #[error("{0}")]
    Argument(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl StackError {
    pub(crate) fn project_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::ProjectIo {
            path: path.into(),
            source,
        }
    }

    /// A required input from an earlier stage or iteration is absent.
    pub(crate) fn missing_prerequisite(path: &Path) -> Self {
        Self::ProjectIo {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::NotFound, "prerequisite file does not exist"),
        }
    }
}
