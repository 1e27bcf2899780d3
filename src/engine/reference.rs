//! Bundled initialization-only registration engine.
//!
//! Implements [`RegistrationEngine`] far enough to drive the whole pipeline
//! end to end: transforms come straight from the configured initialization
//! (image centres, a file, or identity), deformable runs produce a zero
//! displacement field, and the metric is evaluated at that solution. There
//! is no optimizer here; production deployments plug a real backend in
//! behind the trait. Reslicing, transform chaining, and image I/O are fully
//! functional, which is what the orchestrator and the test-suite need.
//!
//! Conventions shared with production engines:
//! - A transform file with the `mat` extension is a 3×3 text matrix mapping
//!   fixed physical coordinates to moving physical coordinates; anything
//!   else is a displacement field image (components 0 and 1, fixed frame).
//! - The raw NCC metric accumulates `-10000` per component per unit of
//!   correlation, so downstream normalization by `-10000 × n_components`
//!   recovers the mean correlation (higher is better, at most 1).

use std::collections::HashMap;
use std::mem;
use std::path::Path;
use std::sync::Arc;

use log::debug;
use nalgebra::{Matrix3, Vector2, Vector3};

use crate::cache::CachedImage;
use crate::error::EngineError;
use crate::image::{io, SlideImage, Volume};

use super::params::{AffineInit, ImagePair, MetricKind, RegistrationParams};
use super::{ImageIo, MetricReport, OutputSlot, RegistrationEngine};

/// Raw-metric scale per component of correlation.
const NCC_SCALE: f64 = -10000.0;

/// One step of a resolved transform chain.
enum TransformStep {
    Affine(Matrix3<f64>),
    Warp(Arc<SlideImage>),
}

impl TransformStep {
    /// Map a point one step from fixed space toward moving space.
    fn apply(&self, p: Vector2<f64>) -> Option<Vector2<f64>> {
        match self {
            TransformStep::Affine(m) => {
                let q = m * Vector3::new(p.x, p.y, 1.0);
                Some(Vector2::new(q.x, q.y))
            }
            TransformStep::Warp(field) => {
                let idx = field.geometry.physical_to_index(&p)?;
                let mut disp = vec![0.0f32; field.components];
                field.sample_bilinear(idx.x, idx.y, &mut disp);
                Some(Vector2::new(p.x + disp[0] as f64, p.y + disp[1] as f64))
            }
        }
    }
}

pub struct ReferenceEngine {
    inputs: HashMap<String, CachedImage>,
    outputs: HashMap<String, (OutputSlot, bool)>,
    last_report: Option<MetricReport>,
}

impl Default for ReferenceEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceEngine {
    pub fn new() -> Self {
        Self {
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            last_report: None,
        }
    }

    fn resolve_slide(
        inputs: &HashMap<String, CachedImage>,
        name: &str,
    ) -> Result<Arc<SlideImage>, EngineError> {
        match inputs.get(name) {
            Some(CachedImage::Slide(img)) => Ok(Arc::clone(img)),
            Some(CachedImage::Volume(_)) => Err(EngineError::Failed(format!(
                "cached object '{name}' is a volume where a 2D image is required"
            ))),
            None => {
                let path = Path::new(name);
                if path.is_file() {
                    Ok(Arc::new(io::load_slide(path)?))
                } else {
                    Err(EngineError::UnknownInput(name.to_string()))
                }
            }
        }
    }

    fn load_transform(&self, path: &Path) -> Result<TransformStep, EngineError> {
        let is_matrix = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("mat"));
        if is_matrix {
            Ok(TransformStep::Affine(self.read_affine(path)?))
        } else {
            Ok(TransformStep::Warp(Arc::new(io::load_slide(path)?)))
        }
    }

    fn load_chain(&self, files: &[std::path::PathBuf]) -> Result<Vec<TransformStep>, EngineError> {
        files.iter().map(|f| self.load_transform(f)).collect()
    }

    /// Map a fixed-space physical point through the chain, in list order.
    fn map_point(chain: &[TransformStep], p: Vector2<f64>) -> Option<Vector2<f64>> {
        let mut q = p;
        for step in chain {
            q = step.apply(q)?;
        }
        Some(q)
    }

    /// Resample `moving` onto the grid of `reference` through `chain`.
    fn resample(
        reference: &SlideImage,
        moving: &SlideImage,
        chain: &[TransformStep],
    ) -> Result<SlideImage, EngineError> {
        let mut out = SlideImage::new(reference.width, reference.height, moving.components)
            .with_geometry(reference.geometry.clone());
        let mut sample = vec![0.0f32; moving.components];
        for y in 0..out.height {
            for x in 0..out.width {
                let p = reference.geometry.index_to_physical(x as f64, y as f64);
                let Some(q) = Self::map_point(chain, p) else {
                    continue;
                };
                let Some(idx) = moving.geometry.physical_to_index(&q) else {
                    return Err(EngineError::Failed(
                        "moving image has a singular direction matrix".to_string(),
                    ));
                };
                moving.sample_bilinear(idx.x, idx.y, &mut sample);
                out.pixel_mut(x, y).copy_from_slice(&sample);
            }
        }
        Ok(out)
    }

    /// Evaluate the raw metric of one pair at the given chain.
    fn pair_metric(
        fixed: &SlideImage,
        moving: &SlideImage,
        chain: &[TransformStep],
        metric: &MetricKind,
    ) -> f64 {
        let comps = moving.components.min(fixed.components);
        let mut sample = vec![0.0f32; moving.components];

        // Accumulators per component over the valid overlap.
        let mut n = 0.0f64;
        let mut sum_f = vec![0.0f64; comps];
        let mut sum_m = vec![0.0f64; comps];
        let mut sum_ff = vec![0.0f64; comps];
        let mut sum_mm = vec![0.0f64; comps];
        let mut sum_fm = vec![0.0f64; comps];
        let mut ssd = 0.0f64;

        for y in 0..fixed.height {
            for x in 0..fixed.width {
                let p = fixed.geometry.index_to_physical(x as f64, y as f64);
                let Some(q) = Self::map_point(chain, p) else {
                    continue;
                };
                let Some(idx) = moving.geometry.physical_to_index(&q) else {
                    continue;
                };
                if !moving.sample_bilinear(idx.x, idx.y, &mut sample) {
                    continue;
                }
                let fpx = fixed.pixel(x, y);
                n += 1.0;
                for c in 0..comps {
                    let (f, m) = (fpx[c] as f64, sample[c] as f64);
                    sum_f[c] += f;
                    sum_m[c] += m;
                    sum_ff[c] += f * f;
                    sum_mm[c] += m * m;
                    sum_fm[c] += f * m;
                    ssd += (f - m) * (f - m);
                }
            }
        }

        if n == 0.0 {
            return 0.0;
        }
        match metric {
            MetricKind::Ncc { .. } => {
                let mut total = 0.0;
                for c in 0..comps {
                    let var_f = sum_ff[c] - sum_f[c] * sum_f[c] / n;
                    let var_m = sum_mm[c] - sum_m[c] * sum_m[c] / n;
                    let cov = sum_fm[c] - sum_f[c] * sum_m[c] / n;
                    let denom = (var_f * var_m).sqrt();
                    let ncc = if denom > 1e-12 {
                        cov / denom
                    } else {
                        // Flat overlap: count it as matching when the means
                        // agree, which keeps identical images at 1.
                        let mean_gap = (sum_f[c] - sum_m[c]).abs() / n;
                        if mean_gap < 1e-6 {
                            1.0
                        } else {
                            0.0
                        }
                    };
                    total += NCC_SCALE * ncc;
                }
                total
            }
            MetricKind::Ssd => ssd / n,
        }
    }

    /// Initialization matrix for a linear run.
    fn init_matrix(
        &self,
        init: &AffineInit,
        fixed: &SlideImage,
        moving: &SlideImage,
    ) -> Result<Matrix3<f64>, EngineError> {
        match init {
            AffineInit::VoxelIdentity => Ok(Matrix3::identity()),
            AffineInit::ImageCenters => {
                let delta = moving.center_physical() - fixed.center_physical();
                let mut m = Matrix3::identity();
                m[(0, 2)] = delta.x;
                m[(1, 2)] = delta.y;
                Ok(m)
            }
            AffineInit::FromFile(path) => self.read_affine(path),
        }
    }

    fn first_pair<'p>(params: &'p RegistrationParams) -> Result<&'p ImagePair, EngineError> {
        params
            .inputs
            .first()
            .ok_or_else(|| EngineError::Failed("registration has no input pairs".to_string()))
    }

    /// Evaluate all pairs at `chain` and record the multi-component report.
    fn record_metrics(
        &mut self,
        inputs: &HashMap<String, CachedImage>,
        params: &RegistrationParams,
        chain: &[TransformStep],
    ) -> Result<(), EngineError> {
        let mut components = Vec::with_capacity(params.inputs.len());
        for pair in &params.inputs {
            let fixed = Self::resolve_slide(inputs, &pair.fixed)?;
            let moving = Self::resolve_slide(inputs, &pair.moving)?;
            components.push(pair.weight * Self::pair_metric(&fixed, &moving, chain, &params.metric));
        }
        let total = components.iter().sum();
        self.last_report = Some(MetricReport { total, components });
        Ok(())
    }
}

impl ImageIo for ReferenceEngine {
    fn read_slide(&self, path: &Path) -> Result<SlideImage, EngineError> {
        io::load_slide(path)
    }

    fn write_slide(&self, path: &Path, image: &SlideImage) -> Result<(), EngineError> {
        io::save_slide(image, path)
    }

    fn read_volume(&self, path: &Path) -> Result<Volume, EngineError> {
        io::load_volume(path)
    }
}

impl RegistrationEngine for ReferenceEngine {
    fn configure_threads(&mut self, threads: usize) {
        // This engine runs single-threaded; accepted for interface parity.
        debug!("reference engine ignores thread count {threads}");
    }

    fn add_cached_input(&mut self, name: &str, image: CachedImage) {
        self.inputs.insert(name.to_string(), image);
    }

    fn add_cached_output(&mut self, name: &str, slot: OutputSlot, allow_replace: bool) {
        self.outputs.insert(name.to_string(), (slot, allow_replace));
    }

    fn run_affine(&mut self, params: &RegistrationParams) -> Result<(), EngineError> {
        let inputs = mem::take(&mut self.inputs);
        self.outputs.clear();

        let pair = Self::first_pair(params)?;
        let fixed = Self::resolve_slide(&inputs, &pair.fixed)?;
        let moving = Self::resolve_slide(&inputs, &pair.moving)?;
        let matrix = self.init_matrix(&params.init, &fixed, &moving)?;

        let output = params.output.as_deref().ok_or_else(|| {
            EngineError::Failed("affine registration needs an output path".to_string())
        })?;
        self.write_affine(output, &matrix)?;
        debug!(
            "reference affine: dof={:?} wrote {}",
            params.dof,
            output.display()
        );

        let mut chain = vec![TransformStep::Affine(matrix)];
        chain.extend(self.load_chain(&params.moving_pre_transforms)?);
        self.record_metrics(&inputs, params, &chain)
    }

    fn run_deformable(&mut self, params: &RegistrationParams) -> Result<(), EngineError> {
        let inputs = mem::take(&mut self.inputs);
        self.outputs.clear();

        let pair = Self::first_pair(params)?;
        let fixed = Self::resolve_slide(&inputs, &pair.fixed)?;

        // The "optimized" field is identically zero; only its grid matters.
        let warp = SlideImage::new(fixed.width, fixed.height, 2)
            .with_geometry(fixed.geometry.clone());
        let output = params.output.as_deref().ok_or_else(|| {
            EngineError::Failed("deformable registration needs an output path".to_string())
        })?;
        io::save_slide(&warp, output)?;
        debug!("reference deformable: wrote {}", output.display());

        let mut chain = vec![TransformStep::Warp(Arc::new(warp))];
        chain.extend(self.load_chain(&params.moving_pre_transforms)?);
        self.record_metrics(&inputs, params, &chain)
    }

    fn run_reslice(&mut self, params: &RegistrationParams) -> Result<(), EngineError> {
        let inputs = mem::take(&mut self.inputs);
        let outputs = mem::take(&mut self.outputs);

        let plan = params.reslice.as_ref().ok_or_else(|| {
            EngineError::Failed("run_reslice called without a reslice plan".to_string())
        })?;
        let reference = Self::resolve_slide(&inputs, &plan.reference)?;
        let chain = self.load_chain(&plan.transforms)?;

        for job in &plan.images {
            let moving = Self::resolve_slide(&inputs, &job.moving)?;
            let resliced = Self::resample(&reference, &moving, &chain)?;
            match outputs.get(job.output.as_str()) {
                Some((slot, allow_replace)) => {
                    let mut cell = slot.borrow_mut();
                    if cell.is_some() && !allow_replace {
                        return Err(EngineError::Failed(format!(
                            "cached output '{}' is already filled",
                            job.output
                        )));
                    }
                    *cell = Some(resliced);
                }
                None => io::save_slide(&resliced, Path::new(&job.output))?,
            }
        }
        Ok(())
    }

    fn last_metric_report(&self) -> Option<&MetricReport> {
        self.last_report.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::params::{ImagePair, PerLevel, ReslicePlan, ResliceJob};
    use nalgebra::Vector2;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn gradient(width: usize, height: usize) -> SlideImage {
        let mut img = SlideImage::new(width, height, 1);
        for y in 0..height {
            for x in 0..width {
                img.pixel_mut(x, y)[0] = (x + 2 * y) as f32 / 16.0;
            }
        }
        img
    }

    fn params_for(fixed: &str, moving: &str, output: Option<std::path::PathBuf>) -> RegistrationParams {
        RegistrationParams {
            inputs: vec![ImagePair::new(fixed, moving, 1.0)],
            output,
            iterations: PerLevel::Uniform(10),
            ..RegistrationParams::default()
        }
    }

    #[test]
    fn identity_init_on_identical_images_scores_perfect_ncc() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("t.mat");
        let img = Arc::new(gradient(8, 8));

        let mut engine = ReferenceEngine::new();
        engine.add_cached_input("fixed", CachedImage::Slide(Arc::clone(&img)));
        engine.add_cached_input("moving", CachedImage::Slide(img));
        engine
            .run_affine(&params_for("fixed", "moving", Some(out.clone())))
            .unwrap();

        let report = engine.last_metric_report().unwrap();
        let normalized = report.total / (NCC_SCALE * 1.0);
        assert!((normalized - 1.0).abs() < 1e-9);
        assert_eq!(engine.read_affine(&out).unwrap(), Matrix3::identity());
    }

    #[test]
    fn image_centers_init_translates_between_grids() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("t.mat");
        let fixed = Arc::new(gradient(8, 8));
        let mut moving = gradient(8, 8);
        moving.geometry.origin = Vector2::new(5.0, -2.0);

        let mut engine = ReferenceEngine::new();
        engine.add_cached_input("fixed", CachedImage::Slide(fixed));
        engine.add_cached_input("moving", CachedImage::Slide(Arc::new(moving)));
        let mut params = params_for("fixed", "moving", Some(out.clone()));
        params.init = AffineInit::ImageCenters;
        engine.run_affine(&params).unwrap();

        let m = engine.read_affine(&out).unwrap();
        assert!((m[(0, 2)] - 5.0).abs() < 1e-12);
        assert!((m[(1, 2)] + 2.0).abs() < 1e-12);
    }

    #[test]
    fn reslice_into_a_registered_output_slot() {
        let img = Arc::new(gradient(6, 4));
        let slot: OutputSlot = Rc::new(RefCell::new(None));

        let mut engine = ReferenceEngine::new();
        engine.add_cached_input("ref", CachedImage::Slide(Arc::clone(&img)));
        engine.add_cached_input("mov", CachedImage::Slide(Arc::clone(&img)));
        engine.add_cached_output("out", Rc::clone(&slot), false);

        let params = RegistrationParams {
            reslice: Some(ReslicePlan {
                reference: "ref".to_string(),
                images: vec![ResliceJob {
                    moving: "mov".to_string(),
                    output: "out".to_string(),
                }],
                transforms: Vec::new(), // empty chain = identity
            }),
            ..RegistrationParams::default()
        };
        engine.run_reslice(&params).unwrap();

        let resliced = slot.borrow_mut().take().unwrap();
        assert_eq!(resliced.width, 6);
        assert_eq!(resliced.data, img.data);
    }

    #[test]
    fn cached_objects_are_scoped_to_one_run() {
        let dir = tempfile::tempdir().unwrap();
        let img = Arc::new(gradient(4, 4));
        let mut engine = ReferenceEngine::new();
        engine.add_cached_input("fixed", CachedImage::Slide(Arc::clone(&img)));
        engine.add_cached_input("moving", CachedImage::Slide(img));
        engine
            .run_affine(&params_for("fixed", "moving", Some(dir.path().join("t.mat"))))
            .unwrap();
        // The names are gone for the next run.
        let err = engine
            .run_affine(&params_for("fixed", "moving", Some(dir.path().join("u.mat"))))
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownInput(_)));
    }
}
