//! Iterative refinement of per-slide transforms against the volume.
//!
//! Coordinate descent: each iteration visits the slides in a fresh random
//! order and re-optimizes one slide at a time against two pulls, the
//! matched volume slice (weight `w_volume`) and the immediate z-neighbors
//! resliced with their previous-iteration transforms (weight 1 each).
//! Breaking the joint problem into per-slide sub-problems trades global
//! optimality for tractability and for skippable, resumable work units.
//!
//! The schedule runs `n_affine` linear iterations followed by `n_deform`
//! deformable iterations. Deformable iterations freeze the last affine and
//! optimize a warp on top of it. A restart range re-enters the schedule at
//! any point as long as the previous iteration's outputs exist.
//!
//! Failure semantics: an engine failure abandons the current slide and the
//! iteration continues; a missing prerequisite transform is fatal.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::cache::{CacheLimits, CachedImage, ImageCache};
use crate::engine::params::{AffineDof, AffineInit, ImagePair, RegistrationParams, ReslicePlan, ResliceJob};
use crate::engine::{MetricReport, OutputSlot, RegistrationEngine};
use crate::error::{Result, StackError};
use crate::project::{IterIntent, SlideIntent, StackProject};

/// Cached-input names used during one per-slide optimization.
const MOVING_NAME: &str = "moving";
const VOLUME_SLICE_NAME: &str = "volume_slice";
const RESLICE_OUTPUT_NAME: &str = "output";

/// Options for the refinement stage.
#[derive(Clone, Debug)]
pub struct RefineOptions {
    /// Number of affine iterations at the front of the schedule.
    pub n_affine: u32,
    /// Number of deformable iterations after the affine ones.
    pub n_deform: u32,
    /// Restart range `[first, last]`, 1-based and inclusive; `None` runs
    /// the whole schedule.
    pub range: Option<(u32, u32)>,
    /// Weight of the volume slice relative to each neighbor's weight of 1.
    pub w_volume: f64,
    /// Seed for the per-iteration slide shuffle; `None` draws from entropy.
    pub seed: Option<u64>,
    /// Worker count handed through to the engine; `0` keeps its default.
    pub threads: usize,
    pub cache: CacheLimits,
    /// Template engine parameters for registration and reslice runs.
    pub base: RegistrationParams,
}

impl Default for RefineOptions {
    fn default() -> Self {
        Self {
            n_affine: 5,
            n_deform: 5,
            range: None,
            w_volume: 4.0,
            seed: None,
            threads: 0,
            cache: CacheLimits::default(),
            base: RegistrationParams::default(),
        }
    }
}

impl StackProject {
    /// Run the refinement schedule (or the configured restart range).
    pub fn refine_to_volume<E: RegistrationEngine>(
        &self,
        engine: &mut E,
        opts: &RefineOptions,
    ) -> Result<()> {
        let span = opts.n_affine + opts.n_deform;
        let (i_first, i_last) = opts.range.unwrap_or((1, span));
        if i_first == 0 || i_first > i_last || i_last > span {
            return Err(StackError::Argument(format!(
                "iteration range ({i_first}, {i_last}) is out of range [1, {span}]"
            )));
        }
        engine.configure_threads(opts.threads);

        let mut cache = ImageCache::new(opts.cache);
        let mut rng = match opts.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        for iteration in i_first..=i_last {
            let mut ordering: Vec<u32> = (0..self.slides.len() as u32).collect();
            ordering.shuffle(&mut rng);

            let mut total_volume_metric = 0.0;
            let mut total_neighbor_metric = 0.0;

            for &k in &ordering {
                match self.refine_slide(engine, &mut cache, opts, iteration, k) {
                    Ok(Some(report)) => {
                        if let Some(&volume) = report.components.first() {
                            total_volume_metric += volume;
                        }
                        total_neighbor_metric += report.components.iter().skip(1).sum::<f64>();
                    }
                    Ok(None) => {} // output already present, skipped
                    Err(err @ StackError::Registration { .. }) => {
                        warn!("{err}; continuing with the next slide");
                    }
                    Err(fatal) => return Err(fatal),
                }
            }

            info!(
                "iter {iteration:3} total_vol_metric = {total_volume_metric:8.4} \
                 total_nbr_metric = {total_neighbor_metric:8.4}"
            );
        }
        Ok(())
    }

    /// Optimize one slide for one iteration. `Ok(None)` means the output
    /// already existed and was skipped.
    fn refine_slide<E: RegistrationEngine>(
        &self,
        engine: &mut E,
        cache: &mut ImageCache,
        opts: &RefineOptions,
        iteration: u32,
        k: u32,
    ) -> Result<Option<MetricReport>> {
        let slide = self.slide(k);
        let affine_stage = iteration <= opts.n_affine;
        let fn_result = if affine_stage {
            self.store
                .iter_path(slide, IterIntent::VolIterMatrix, iteration)?
        } else {
            self.store
                .iter_path(slide, IterIntent::VolIterWarp, iteration)?
        };
        if self.store.can_skip(&fn_result) {
            return Ok(None);
        }

        let img_slide = cache.get_slide(engine, &slide.raw_path)?;
        let fn_vol_slide = self.store.slide_path(slide, SlideIntent::VolSlide)?;
        if !fn_vol_slide.is_file() {
            return Err(StackError::missing_prerequisite(&fn_vol_slide));
        }
        let vol_slice = cache.get_slide(engine, &fn_vol_slide)?;

        // Registration happens in the volume-slice frame: it is large
        // enough to cover the histology and it is the space a mask would
        // live in.
        let mut params = opts.base.clone();
        params.inputs = vec![ImagePair::new(
            VOLUME_SLICE_NAME,
            MOVING_NAME,
            opts.w_volume,
        )];

        // At most one slide strictly before and one strictly after in
        // z-order contributes a neighbor pull.
        let neighbors: Vec<u32> = [self.index.prev_of(k), self.index.next_of(k)]
            .into_iter()
            .flatten()
            .collect();
        let mut resliced = Vec::with_capacity(neighbors.len());
        for j in neighbors {
            let image = self.reslice_neighbor(engine, opts, iteration, j, &vol_slice, slide)?;
            resliced.push((format!("neighbor_{j:03}"), image));
        }

        // Resolve prerequisite transforms before registering any cached
        // inputs, so a fatal absence leaves the engine clean.
        if affine_stage {
            params.dof = AffineDof::Affine;
            params.init = AffineInit::FromFile(self.prior_transform(
                slide,
                IterIntent::VolIterMatrix,
                iteration - 1,
            )?);
            params.rigid_search = None;
        } else {
            // Optimize a warp on top of the frozen final affine.
            params.moving_pre_transforms = vec![self.prior_transform(
                slide,
                IterIntent::VolIterMatrix,
                opts.n_affine,
            )?];
            params.init = AffineInit::VoxelIdentity;
        }

        engine.add_cached_input(MOVING_NAME, CachedImage::Slide(Arc::clone(&img_slide)));
        engine.add_cached_input(
            VOLUME_SLICE_NAME,
            CachedImage::Slide(Arc::clone(&vol_slice)),
        );
        for (name, image) in &resliced {
            engine.add_cached_input(name, CachedImage::Slide(Arc::clone(image)));
            params.inputs.push(ImagePair::new(name.clone(), MOVING_NAME, 1.0));
        }

        info!("iter {iteration}: refining slide {}", slide.unique_id);
        params.output = Some(fn_result);
        let run = if affine_stage {
            engine.run_affine(&params)
        } else {
            engine.run_deformable(&params)
        };
        run.map_err(|e| StackError::Registration {
            slide: slide.unique_id.clone(),
            iteration,
            source: e,
        })?;

        let report = engine
            .last_metric_report()
            .cloned()
            .ok_or_else(|| {
                StackError::Engine(crate::error::EngineError::Failed(
                    "engine produced no metric report".to_string(),
                ))
            })?;

        let fn_metric = self
            .store
            .iter_path(slide, IterIntent::IterMetricDump, iteration)?;
        let components = report
            .components
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        std::fs::write(&fn_metric, format!("{}\n{}\n", report.total, components))
            .map_err(|e| StackError::project_io(fn_metric, e))?;

        Ok(Some(report))
    }

    /// Reslice neighbor `j`'s raw image into the volume-slice frame using
    /// its previous-iteration transform chain.
    fn reslice_neighbor<E: RegistrationEngine>(
        &self,
        engine: &mut E,
        opts: &RefineOptions,
        iteration: u32,
        j: u32,
        vol_slice: &Arc<crate::image::SlideImage>,
        current: &crate::manifest::Slide,
    ) -> Result<Arc<crate::image::SlideImage>> {
        let neighbor = self.slide(j);
        let transforms = if iteration - 1 <= opts.n_affine {
            vec![self.prior_transform(neighbor, IterIntent::VolIterMatrix, iteration - 1)?]
        } else {
            vec![
                self.prior_transform(neighbor, IterIntent::VolIterWarp, iteration - 1)?,
                self.prior_transform(neighbor, IterIntent::VolIterMatrix, opts.n_affine)?,
            ]
        };

        let slot: OutputSlot = Rc::new(RefCell::new(None));
        engine.add_cached_input(
            VOLUME_SLICE_NAME,
            CachedImage::Slide(Arc::clone(vol_slice)),
        );
        engine.add_cached_output(RESLICE_OUTPUT_NAME, Rc::clone(&slot), false);

        let mut params = opts.base.clone();
        params.reslice = Some(ReslicePlan {
            reference: VOLUME_SLICE_NAME.to_string(),
            images: vec![ResliceJob {
                moving: neighbor.raw_path.display().to_string(),
                output: RESLICE_OUTPUT_NAME.to_string(),
            }],
            transforms,
        });
        engine
            .run_reslice(&params)
            .map_err(|e| StackError::Registration {
                slide: current.unique_id.clone(),
                iteration,
                source: e,
            })?;

        let image = slot.borrow_mut().take().ok_or_else(|| {
            StackError::Registration {
                slide: current.unique_id.clone(),
                iteration,
                source: crate::error::EngineError::Failed(
                    "engine did not fill the reslice output slot".to_string(),
                ),
            }
        })?;
        Ok(Arc::new(image))
    }

    /// Path of an earlier iteration's transform; its absence is fatal.
    fn prior_transform(
        &self,
        slide: &crate::manifest::Slide,
        intent: IterIntent,
        iteration: u32,
    ) -> Result<PathBuf> {
        let path = self.store.iter_path(slide, intent, iteration)?;
        if !path.is_file() {
            return Err(StackError::missing_prerequisite(&path));
        }
        Ok(path)
    }
}
