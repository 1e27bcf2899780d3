//! Interface to the external 2D/3D registration engine.
//!
//! The orchestrator never optimizes anything itself: pairwise rigid
//! matching, affine and deformable refinement, and reslicing are delegated
//! to an engine behind the [`RegistrationEngine`] trait. Images move across
//! the boundary either as filesystem paths or as transient by-name cached
//! objects registered before a run and dropped when the run returns.
//!
//! Modules
//! - `params` – the parameter block describing one invocation.
//! - `reference` – a bundled initialization-only engine used by the CLI and
//!   the test-suite; production deployments supply their own backend.

pub mod params;
pub mod reference;

use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use nalgebra::Matrix3;

use crate::cache::CachedImage;
use crate::error::EngineError;
use crate::image::io::ensure_parent_dir;
use crate::image::{SlideImage, Volume};

use self::params::RegistrationParams;

pub use self::reference::ReferenceEngine;

/// Destination slot for an in-memory reslice output. The engine fills the
/// slot instead of writing a file when the job's output names a registered
/// slot.
pub type OutputSlot = Rc<RefCell<Option<SlideImage>>>;

/// Multi-component metric summary of the last engine run. `components`
/// holds one entry per input pair, in input order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricReport {
    pub total: f64,
    pub components: Vec<f64>,
}

/// Image reading and writing in whatever formats the engine understands.
/// Split out so the image cache can load through the engine without seeing
/// the rest of the interface.
pub trait ImageIo {
    fn read_slide(&self, path: &Path) -> Result<SlideImage, EngineError>;
    fn write_slide(&self, path: &Path, image: &SlideImage) -> Result<(), EngineError>;
    fn read_volume(&self, path: &Path) -> Result<Volume, EngineError>;
}

/// The external registration engine driven by the pipeline stages.
///
/// Cached inputs and outputs registered through `add_cached_*` are scoped
/// to the next `run_*` call: the engine consumes them at the start of the
/// run and starts the following run with a clean slate.
pub trait RegistrationEngine: ImageIo {
    /// Pass the configured worker count through to the engine. `0` keeps
    /// the engine's own default.
    fn configure_threads(&mut self, threads: usize);

    fn add_cached_input(&mut self, name: &str, image: CachedImage);

    fn add_cached_output(&mut self, name: &str, slot: OutputSlot, allow_replace: bool);

    /// Linear registration; writes the resulting matrix to `params.output`.
    fn run_affine(&mut self, params: &RegistrationParams) -> Result<(), EngineError>;

    /// Deformable registration; writes the warp field to `params.output`.
    fn run_deformable(&mut self, params: &RegistrationParams) -> Result<(), EngineError>;

    /// Push images through `params.reslice`.
    fn run_reslice(&mut self, params: &RegistrationParams) -> Result<(), EngineError>;

    /// Metric summary of the most recent registration run, if any.
    fn last_metric_report(&self) -> Option<&MetricReport>;

    fn read_affine(&self, path: &Path) -> Result<Matrix3<f64>, EngineError> {
        read_affine_text(path)
    }

    fn write_affine(&self, path: &Path, matrix: &Matrix3<f64>) -> Result<(), EngineError> {
        write_affine_text(path, matrix)
    }
}

/// Read a 3×3 homogeneous affine from the whitespace text format: three
/// lines of three decimal values.
pub fn read_affine_text(path: &Path) -> Result<Matrix3<f64>, EngineError> {
    let text = fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
    let values: Vec<f64> = text
        .split_whitespace()
        .map(|tok| {
            tok.parse::<f64>()
                .map_err(|_| EngineError::decode(path, format!("bad matrix entry '{tok}'")))
        })
        .collect::<Result<_, _>>()?;
    if values.len() != 9 {
        return Err(EngineError::decode(
            path,
            format!("expected 9 matrix entries, found {}", values.len()),
        ));
    }
    Ok(Matrix3::from_row_slice(&values))
}

/// Write a 3×3 homogeneous affine in the whitespace text format.
pub fn write_affine_text(path: &Path, matrix: &Matrix3<f64>) -> Result<(), EngineError> {
    ensure_parent_dir(path)?;
    let mut text = String::new();
    for r in 0..3 {
        for c in 0..3 {
            if c > 0 {
                text.push(' ');
            }
            text.push_str(&format!("{}", matrix[(r, c)]));
        }
        text.push('\n');
    }
    fs::write(path, text).map_err(|e| EngineError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix3;

    #[test]
    fn affine_text_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.mat");
        let m = Matrix3::new(0.5, -0.25, 10.0, 0.125, 2.0, -3.5, 0.0, 0.0, 1.0);
        write_affine_text(&path, &m).unwrap();
        let back = read_affine_text(&path).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn affine_text_rejects_short_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.mat");
        std::fs::write(&path, "1 0 0\n0 1 0\n").unwrap();
        assert!(read_affine_text(&path).is_err());
    }
}
