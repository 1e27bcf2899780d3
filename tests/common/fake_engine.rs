//! Scriptable registration engine for driving the orchestrator in tests.
//!
//! Metrics come from a per-pair table (keyed by the fixed/moving reference
//! strings) instead of pixels, transforms written to disk come from a
//! per-output table (identity by default), reslicing passes the moving
//! image through unchanged, and every run is recorded so tests can assert
//! on initialization modes, pre-transforms, weights, and transform chains.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use nalgebra::Matrix3;

use histostack::cache::CachedImage;
use histostack::engine::params::{AffineInit, RegistrationParams};
use histostack::engine::{
    read_affine_text, write_affine_text, ImageIo, MetricReport, OutputSlot, RegistrationEngine,
};
use histostack::error::EngineError;
use histostack::image::io::{load_slide, save_slide};
use histostack::image::{Geometry3, SlideImage, Volume};

/// Raw-metric scale mirrored from the engine convention the pipeline
/// normalizes against.
pub const RAW_SCALE: f64 = -10000.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    Affine,
    Deformable,
    Reslice,
}

/// One recorded engine invocation.
#[derive(Clone, Debug)]
pub struct CallRecord {
    pub kind: CallKind,
    pub init: AffineInit,
    pub inputs: Vec<(String, String, f64)>,
    pub output: Option<PathBuf>,
    pub pre_transforms: Vec<PathBuf>,
    pub reslice_transforms: Vec<PathBuf>,
}

pub struct FakeEngine {
    /// Normalized per-pair similarity, keyed `(fixed, moving)`; pairs not
    /// listed score `default_metric`.
    pair_metrics: HashMap<(String, String), f64>,
    default_metric: f64,
    /// Matrices to write, keyed by output file name; identity otherwise.
    affine_outputs: HashMap<String, Matrix3<f64>>,
    /// Synthetic volume returned by `read_volume`.
    volume: Volume,
    pub calls: Vec<CallRecord>,
    inputs: HashMap<String, CachedImage>,
    outputs: HashMap<String, (OutputSlot, bool)>,
    last_report: Option<MetricReport>,
}

impl FakeEngine {
    pub fn new() -> Self {
        // A small layered volume: plane z holds value z / depth.
        let mut volume = Volume::new(8, 8, 4, 1).with_geometry(Geometry3::default());
        for z in 0..4 {
            for y in 0..8 {
                for x in 0..8 {
                    volume.voxel_mut(x, y, z)[0] = z as f32 / 4.0;
                }
            }
        }
        Self {
            pair_metrics: HashMap::new(),
            default_metric: 1.0,
            affine_outputs: HashMap::new(),
            volume,
            calls: Vec::new(),
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            last_report: None,
        }
    }

    pub fn set_pair_metric(&mut self, fixed: &str, moving: &str, metric: f64) {
        self.pair_metrics
            .insert((fixed.to_string(), moving.to_string()), metric);
    }

    pub fn set_default_metric(&mut self, metric: f64) {
        self.default_metric = metric;
    }

    /// Script the matrix written for an output whose file name matches.
    pub fn set_affine_output(&mut self, file_name: &str, matrix: Matrix3<f64>) {
        self.affine_outputs.insert(file_name.to_string(), matrix);
    }

    pub fn calls_of(&self, kind: CallKind) -> Vec<&CallRecord> {
        self.calls.iter().filter(|c| c.kind == kind).collect()
    }

    fn record(&mut self, kind: CallKind, params: &RegistrationParams) {
        self.calls.push(CallRecord {
            kind,
            init: params.init.clone(),
            inputs: params
                .inputs
                .iter()
                .map(|p| (p.fixed.clone(), p.moving.clone(), p.weight))
                .collect(),
            output: params.output.clone(),
            pre_transforms: params.moving_pre_transforms.clone(),
            reslice_transforms: params
                .reslice
                .as_ref()
                .map(|r| r.transforms.clone())
                .unwrap_or_default(),
        });
    }

    fn report_for(&mut self, params: &RegistrationParams) {
        let components: Vec<f64> = params
            .inputs
            .iter()
            .map(|p| {
                let metric = self
                    .pair_metrics
                    .get(&(p.fixed.clone(), p.moving.clone()))
                    .copied()
                    .unwrap_or(self.default_metric);
                p.weight * RAW_SCALE * metric
            })
            .collect();
        self.last_report = Some(MetricReport {
            total: components.iter().sum(),
            components,
        });
    }

    fn scripted_matrix(&self, output: &Path) -> Matrix3<f64> {
        output
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| self.affine_outputs.get(n))
            .copied()
            .unwrap_or_else(Matrix3::identity)
    }

    fn resolve(&self, inputs: &HashMap<String, CachedImage>, name: &str) -> Result<SlideImage, EngineError> {
        match inputs.get(name) {
            Some(CachedImage::Slide(img)) => Ok(img.as_ref().clone()),
            Some(CachedImage::Volume(_)) => {
                Err(EngineError::Failed(format!("'{name}' is not a 2D image")))
            }
            None => load_slide(Path::new(name)),
        }
    }
}

impl ImageIo for FakeEngine {
    fn read_slide(&self, path: &Path) -> Result<SlideImage, EngineError> {
        load_slide(path)
    }

    fn write_slide(&self, path: &Path, image: &SlideImage) -> Result<(), EngineError> {
        save_slide(image, path)
    }

    fn read_volume(&self, _path: &Path) -> Result<Volume, EngineError> {
        Ok(self.volume.clone())
    }
}

impl RegistrationEngine for FakeEngine {
    fn configure_threads(&mut self, _threads: usize) {}

    fn add_cached_input(&mut self, name: &str, image: CachedImage) {
        self.inputs.insert(name.to_string(), image);
    }

    fn add_cached_output(&mut self, name: &str, slot: OutputSlot, allow_replace: bool) {
        self.outputs.insert(name.to_string(), (slot, allow_replace));
    }

    fn run_affine(&mut self, params: &RegistrationParams) -> Result<(), EngineError> {
        self.inputs.clear();
        self.outputs.clear();
        self.record(CallKind::Affine, params);
        let output = params
            .output
            .as_deref()
            .ok_or_else(|| EngineError::Failed("affine output path missing".to_string()))?;
        write_affine_text(output, &self.scripted_matrix(output))?;
        self.report_for(params);
        Ok(())
    }

    fn run_deformable(&mut self, params: &RegistrationParams) -> Result<(), EngineError> {
        self.inputs.clear();
        self.outputs.clear();
        self.record(CallKind::Deformable, params);
        let output = params
            .output
            .as_deref()
            .ok_or_else(|| EngineError::Failed("deformable output path missing".to_string()))?;
        std::fs::write(output, b"zero displacement field\n")
            .map_err(|e| EngineError::io(output, e))?;
        self.report_for(params);
        Ok(())
    }

    fn run_reslice(&mut self, params: &RegistrationParams) -> Result<(), EngineError> {
        let inputs = std::mem::take(&mut self.inputs);
        let outputs = std::mem::take(&mut self.outputs);
        self.record(CallKind::Reslice, params);
        let plan = params
            .reslice
            .as_ref()
            .ok_or_else(|| EngineError::Failed("no reslice plan".to_string()))?;
        for job in &plan.images {
            // Pass-through reslice: geometry games are not what the
            // orchestrator tests exercise.
            let moving = self.resolve(&inputs, &job.moving)?;
            match outputs.get(job.output.as_str()) {
                Some((slot, _)) => *slot.borrow_mut() = Some(moving),
                None => save_slide(&moving, Path::new(&job.output))?,
            }
        }
        Ok(())
    }

    fn last_metric_report(&self) -> Option<&MetricReport> {
        self.last_report.as_ref()
    }

    fn read_affine(&self, path: &Path) -> Result<Matrix3<f64>, EngineError> {
        read_affine_text(path)
    }

    fn write_affine(&self, path: &Path, matrix: &Matrix3<f64>) -> Result<(), EngineError> {
        write_affine_text(path, matrix)
    }
}
