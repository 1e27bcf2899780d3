//! Initial match of the reconstructed stack to the reference volume.
//!
//! For every slide a matched 2D slice is extracted from the volume at the
//! slide's z-position and the accumulated reslice is registered to it with
//! a full affine. The per-slide affines are then condensed into a single
//! consensus transform: the 1-medoid under entry-wise L1 distance, a
//! robust stand-in for the geometric median in transform space. Iteration
//! zero of the refinement schedule is seeded with `accumulated · median`
//! per slide.

use std::sync::Arc;

use log::info;
use nalgebra::Matrix3;

use crate::cache::CachedImage;
use crate::engine::params::{AffineDof, AffineInit, ImagePair, RegistrationParams};
use crate::engine::RegistrationEngine;
use crate::error::{Result, StackError};
use crate::project::{GlobalIntent, IterIntent, SlideIntent, StackProject};

/// Cached-input name under which the extracted slice is registered.
const VOL_SLICE_NAME: &str = "vol_slice";

/// Options for the volume-match stage.
#[derive(Clone, Debug)]
pub struct VolMatchOptions {
    /// Worker count handed through to the engine; `0` keeps its default.
    pub threads: usize,
    /// Template engine parameters for the per-slide affine runs.
    pub base: RegistrationParams,
}

impl Default for VolMatchOptions {
    fn default() -> Self {
        Self {
            threads: 0,
            base: RegistrationParams::default(),
        }
    }
}

/// Index of the matrix minimizing the summed entry-wise L1 distance to all
/// others; ties resolve to the lowest index.
pub fn median_affine_index(matrices: &[Matrix3<f64>]) -> usize {
    let n = matrices.len();
    let mut row_sums = vec![0.0f64; n];
    for i in 0..n {
        for j in 0..i {
            let d = (matrices[i] - matrices[j]).abs().sum();
            row_sums[i] += d;
            row_sums[j] += d;
        }
    }
    let mut best = 0usize;
    for (i, &sum) in row_sums.iter().enumerate() {
        if sum < row_sums[best] {
            best = i;
        }
    }
    best
}

impl StackProject {
    /// Run the volume-match stage against the volume at `volume_path`.
    pub fn match_to_volume<E: RegistrationEngine>(
        &self,
        engine: &mut E,
        volume_path: &std::path::Path,
        opts: &VolMatchOptions,
    ) -> Result<()> {
        if self.slides.is_empty() {
            return Err(StackError::Argument("project has no slides".to_string()));
        }
        engine.configure_threads(opts.threads);

        let volume = engine.read_volume(volume_path)?;

        for slide in &self.slides {
            let fn_vol_slide = self.store.slide_path(slide, SlideIntent::VolSlide)?;
            let fn_vol_init = self.store.slide_path(slide, SlideIntent::VolInitMatrix)?;
            if self.store.can_skip(&fn_vol_slide) && self.store.can_skip(&fn_vol_init) {
                continue;
            }

            let slice_2d = volume.extract_slice(slide.z_pos);
            engine.write_slide(&fn_vol_slide, &slice_2d)?;

            // The volume may carry a mask, so the volume slice acts as the
            // fixed image and the reconstructed slide as moving.
            let fn_accum_reslice = self.store.slide_path(slide, SlideIntent::AccumReslice)?;
            engine.add_cached_input(VOL_SLICE_NAME, CachedImage::Slide(Arc::new(slice_2d)));

            info!("matching slide {} to its volume slice", slide.unique_id);
            let mut params = opts.base.clone();
            params.inputs = vec![ImagePair::new(
                VOL_SLICE_NAME,
                fn_accum_reslice.display().to_string(),
                1.0,
            )];
            params.dof = AffineDof::Affine;
            params.init = AffineInit::ImageCenters;
            params.output = Some(fn_vol_init);
            engine
                .run_affine(&params)
                .map_err(|e| StackError::Registration {
                    slide: slide.unique_id.clone(),
                    iteration: 0,
                    source: e,
                })?;
        }

        // Consensus transform over all per-slide affines.
        let mut vol_affine = Vec::with_capacity(self.slides.len());
        for slide in &self.slides {
            let path = self.store.slide_path(slide, SlideIntent::VolInitMatrix)?;
            vol_affine.push(engine.read_affine(&path)?);
        }
        let medoid = median_affine_index(&vol_affine);
        let median = vol_affine[medoid];
        info!(
            "median volume affine comes from slide {}",
            self.slides[medoid].unique_id
        );
        engine.write_affine(
            &self.store.global_path(GlobalIntent::VolMedianInitMatrix)?,
            &median,
        )?;

        // Seed iteration zero: accumulated transform composed with the
        // consensus affine.
        for slide in &self.slides {
            let fn_accum = self.store.slide_path(slide, SlideIntent::AccumMatrix)?;
            let m_root = engine.read_affine(&fn_accum)?;
            let m_vol = m_root * median;
            engine.write_affine(
                &self.store.iter_path(slide, IterIntent::VolIterMatrix, 0)?,
                &m_vol,
            )?;
        }
        Ok(())
    }
}
