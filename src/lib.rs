#![doc = include_str!("../README.md")]

// Public modules (stable-ish surface)
pub mod cache;
pub mod engine;
pub mod error;
pub mod graph;
pub mod image;
pub mod manifest;
pub mod project;

// Pipeline stages – public so tools can drive them individually.
pub mod recon;
pub mod volmatch;
pub mod voliter;

// --- High-level re-exports -------------------------------------------------

// Main entry points: the project plus the stage options.
pub use crate::error::{EngineError, Result, StackError};
pub use crate::project::{ProjectStore, StackProject};
pub use crate::recon::{ReconOptions, ReconSummary};
pub use crate::voliter::RefineOptions;
pub use crate::volmatch::VolMatchOptions;

// The engine seam and the bundled reference implementation.
pub use crate::engine::{ImageIo, ReferenceEngine, RegistrationEngine};

// --- Prelude ---------------------------------------------------------------

/// Small prelude for quick experiments.
///
/// ```no_run
/// use histostack::prelude::*;
/// use std::path::Path;
///
/// # fn main() -> histostack::Result<()> {
/// let project = StackProject::initialize(
///     "block07",
///     Path::new("manifest.txt"),
///     "exr",
///     false,
/// )?;
/// let mut engine = ReferenceEngine::new();
/// let summary = project.reconstruct(&mut engine, &ReconOptions {
///     z_range: 0.06,
///     z_epsilon: 0.1,
///     ..Default::default()
/// })?;
/// println!("root slide ordinal: {}", summary.root);
/// # Ok(())
/// # }
/// ```
pub mod prelude {
    pub use crate::engine::{ReferenceEngine, RegistrationEngine};
    pub use crate::project::StackProject;
    pub use crate::recon::ReconOptions;
    pub use crate::voliter::RefineOptions;
    pub use crate::volmatch::VolMatchOptions;
}
