//! Stack reconstruction: mutual co-registration of neighboring slides into
//! a coherent block.
//!
//! The stage builds the z-local neighbor graph, registers every directed
//! edge rigidly, converts metrics into edge weights, picks the root slide
//! minimizing the summed shortest-path distance to the rest, and composes
//! each slide's accumulated transform along its tree path. Every per-slide
//! result (accumulated matrix plus a reslice into the padded root frame)
//! lands in the project store.

use std::path::Path;
use std::sync::Arc;

use log::{debug, info};
use nalgebra::Matrix3;

use crate::cache::{CacheLimits, CachedImage, ImageCache};
use crate::engine::params::{AffineDof, AffineInit, ImagePair, RegistrationParams, ReslicePlan, ResliceJob};
use crate::engine::RegistrationEngine;
use crate::error::{Result, StackError};
use crate::graph::{edge_weight, DijkstraSolver, NeighborGraph, NO_PATH};
use crate::project::{PairIntent, SlideIntent, StackProject};

/// Raw-metric divisor per image component; matches the engine convention
/// of accumulating −10000 per component. Normalized metrics satisfy
/// "higher is better, at most 1".
pub const DEFAULT_METRIC_NORMALIZATION: f64 = -10000.0;

/// Cached-input name for the padded root image during reslicing.
const ROOT_SLICE_NAME: &str = "root_slice_padded";

/// Options for the reconstruction stage.
#[derive(Clone, Debug)]
pub struct ReconOptions {
    /// Neighborhood reach in z; each direction always contributes at least
    /// one neighbor regardless.
    pub z_range: f64,
    /// Per-unit-z growth factor of edge weights.
    pub z_epsilon: f64,
    /// Divisor applied to raw engine metrics, per component.
    pub metric_normalization: f64,
    /// Worker count handed through to the engine; `0` keeps its default.
    pub threads: usize,
    pub cache: CacheLimits,
    /// Template engine parameters; the stage overrides inputs, DOF,
    /// initialization, and outputs per edge.
    pub base: RegistrationParams,
}

impl Default for ReconOptions {
    fn default() -> Self {
        Self {
            z_range: 0.0,
            z_epsilon: 0.1,
            metric_normalization: DEFAULT_METRIC_NORMALIZATION,
            threads: 0,
            cache: CacheLimits::default(),
            base: RegistrationParams::default(),
        }
    }
}

/// Outcome of the reconstruction stage.
#[derive(Clone, Copy, Debug)]
pub struct ReconSummary {
    /// Ordinal of the selected root slide.
    pub root: u32,
    /// Summed shortest-path distance from the root to every slide.
    pub root_distance: f64,
}

/// Pick the root: the node minimizing the total shortest-path distance to
/// all others, ties broken by the lowest index.
pub fn select_root(graph: &NeighborGraph) -> (u32, f64) {
    let mut solver = DijkstraSolver::new(graph);
    let mut best = (0u32, f64::INFINITY);
    for node in 0..graph.node_count() as u32 {
        solver.compute(node);
        let total: f64 = solver.distance().iter().sum();
        debug!("root distance {node}: {total}");
        if node == 0 || total < best.1 {
            best = (node, total);
        }
    }
    best
}

fn write_metric(path: &Path, value: f64) -> Result<()> {
    std::fs::write(path, format!("{value}\n")).map_err(|e| StackError::project_io(path, e))
}

fn read_metric(path: &Path) -> Result<f64> {
    let text = std::fs::read_to_string(path).map_err(|e| StackError::project_io(path, e))?;
    let value: f64 = text.trim().parse().map_err(|_| {
        StackError::project_io(
            path,
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("metric value '{}' does not parse", text.trim()),
            ),
        )
    })?;
    if !value.is_finite() {
        return Err(StackError::project_io(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidData, "metric value is not finite"),
        ));
    }
    Ok(value)
}

impl StackProject {
    /// Run the reconstruction stage.
    pub fn reconstruct<E: RegistrationEngine>(
        &self,
        engine: &mut E,
        opts: &ReconOptions,
    ) -> Result<ReconSummary> {
        if self.slides.is_empty() {
            return Err(StackError::Argument("project has no slides".to_string()));
        }
        engine.configure_threads(opts.threads);
        self.store.save_config("Z_Range", &opts.z_range)?;
        self.store.save_config("Z_Epsilon", &opts.z_epsilon)?;

        let mut graph = NeighborGraph::build(&self.index, opts.z_range);
        let mut cache = ImageCache::new(opts.cache);

        // Register every directed edge in z order of the reference slide,
        // which keeps cache churn low.
        for (_, ordinal) in self.index.iter() {
            let edges: Vec<(usize, u32)> = graph
                .edge_slots(ordinal)
                .map(|slot| (slot, graph.target(slot)))
                .collect();
            for (slot, target) in edges {
                let metric = self.register_pair(engine, &mut cache, opts, ordinal, target)?;
                let dz = self.slide(target).z_pos - self.slide(ordinal).z_pos;
                graph.set_weight(slot, edge_weight(metric, dz, opts.z_epsilon));
            }
        }

        let (root, root_distance) = select_root(&graph);
        info!(
            "reconstruction root: slide {} (total distance {root_distance})",
            self.slide(root).unique_id
        );

        let mut solver = DijkstraSolver::new(&graph);
        solver.compute(root);

        // Pad the root so rotated neighbors stay inside the frame.
        let img_root = cache.get_slide(engine, &self.slide(root).raw_path)?;
        let margin = img_root.width.max(img_root.height) / 4;
        let padded = Arc::new(img_root.pad_replicate(margin));

        for ordinal in 0..self.slides.len() as u32 {
            self.compose_chain(engine, &mut cache, opts, solver.predecessor(), ordinal, &padded)?;
        }

        Ok(ReconSummary {
            root,
            root_distance,
        })
    }

    /// Register one directed edge, or reuse its stored metric. Returns the
    /// normalized metric.
    fn register_pair<E: RegistrationEngine>(
        &self,
        engine: &mut E,
        cache: &mut ImageCache,
        opts: &ReconOptions,
        reference: u32,
        moving: u32,
    ) -> Result<f64> {
        let (ref_slide, mov_slide) = (self.slide(reference), self.slide(moving));
        let i_ref = cache.get_slide(engine, &ref_slide.raw_path)?;
        let i_mov = cache.get_slide(engine, &mov_slide.raw_path)?;

        let fn_matrix = self
            .store
            .pair_path(ref_slide, mov_slide, PairIntent::AffineMatrix)?;
        let fn_metric = self
            .store
            .pair_path(ref_slide, mov_slide, PairIntent::MetricValue)?;

        if self.store.can_skip(&fn_matrix) && self.store.can_skip(&fn_metric) {
            return read_metric(&fn_metric);
        }
        let ref_name = ref_slide.raw_path.display().to_string();
        let mov_name = mov_slide.raw_path.display().to_string();

        info!(
            "rigid registration: fixed {} moving {}",
            ref_slide.unique_id, mov_slide.unique_id
        );
        engine.add_cached_input(&ref_name, CachedImage::Slide(Arc::clone(&i_ref)));
        engine.add_cached_input(&mov_name, CachedImage::Slide(i_mov));

        let mut params = opts.base.clone();
        params.inputs = vec![ImagePair::new(ref_name, mov_name, 1.0)];
        params.dof = AffineDof::Rigid;
        params.init = AffineInit::ImageCenters;
        params.output = Some(fn_matrix);
        engine
            .run_affine(&params)
            .map_err(|e| StackError::Registration {
                slide: ref_slide.unique_id.clone(),
                iteration: 0,
                source: e,
            })?;

        let raw = engine
            .last_metric_report()
            .map(|r| r.total)
            .ok_or_else(|| {
                StackError::Engine(crate::error::EngineError::Failed(
                    "engine produced no metric report".to_string(),
                ))
            })?;
        debug!("raw pair metric: {raw}");

        let metric = raw / (opts.metric_normalization * i_ref.components as f64);
        write_metric(&fn_metric, metric)?;
        Ok(metric)
    }

    /// Compose the transform chain from the root down to `ordinal`, persist
    /// the accumulated matrix, and reslice the slide into the padded-root
    /// frame.
    fn compose_chain<E: RegistrationEngine>(
        &self,
        engine: &mut E,
        cache: &mut ImageCache,
        opts: &ReconOptions,
        predecessor: &[u32],
        ordinal: u32,
        padded_root: &Arc<crate::image::SlideImage>,
    ) -> Result<()> {
        let slide = self.slide(ordinal);
        if predecessor[ordinal as usize] == NO_PATH {
            return Err(StackError::GraphDisconnected {
                slide: slide.unique_id.clone(),
            });
        }

        let mut t_accum = Matrix3::identity();
        let mut i_curr = ordinal;
        let mut i_prev = predecessor[i_curr as usize];
        while i_prev != i_curr {
            let fn_matrix = self.store.pair_path(
                self.slide(i_prev),
                self.slide(i_curr),
                PairIntent::AffineMatrix,
            )?;
            let t_step = engine.read_affine(&fn_matrix)?;
            t_accum *= t_step;
            i_curr = i_prev;
            i_prev = predecessor[i_curr as usize];
        }
        debug!(
            "accumulated chain for slide {}: ends at {}",
            slide.unique_id,
            self.slide(i_curr).unique_id
        );

        let fn_accum = self.store.slide_path(slide, SlideIntent::AccumMatrix)?;
        engine.write_affine(&fn_accum, &t_accum)?;

        let fn_reslice = self.store.slide_path(slide, SlideIntent::AccumReslice)?;
        if self.store.can_skip(&fn_reslice) {
            return Ok(());
        }

        let raw_name = slide.raw_path.display().to_string();
        let image = cache.get_slide(engine, &slide.raw_path)?;
        engine.add_cached_input(ROOT_SLICE_NAME, CachedImage::Slide(Arc::clone(padded_root)));
        engine.add_cached_input(&raw_name, CachedImage::Slide(image));

        let mut params = opts.base.clone();
        params.reslice = Some(ReslicePlan {
            reference: ROOT_SLICE_NAME.to_string(),
            images: vec![ResliceJob {
                moving: raw_name,
                output: fn_reslice.display().to_string(),
            }],
            transforms: vec![fn_accum],
        });
        engine
            .run_reslice(&params)
            .map_err(|e| StackError::Registration {
                slide: slide.unique_id.clone(),
                iteration: 0,
                source: e,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NeighborGraph;

    #[test]
    fn middle_node_wins_root_selection() {
        // weight(0,1) = 1, weight(1,2) = 1, weight(0,2) = 10, symmetric.
        let graph = NeighborGraph::from_parts(
            vec![0, 2, 4, 6],
            vec![1, 2, 0, 2, 0, 1],
            vec![1.0, 10.0, 1.0, 1.0, 10.0, 1.0],
        );
        let (root, total) = select_root(&graph);
        assert_eq!(root, 1);
        assert_eq!(total, 2.0);
    }

    #[test]
    fn equal_weights_break_ties_low() {
        // Two nodes, equal weights both ways: totals tie, index 0 wins.
        let graph = NeighborGraph::from_parts(vec![0, 1, 2], vec![1, 0], vec![1.0, 1.0]);
        let (root, _) = select_root(&graph);
        assert_eq!(root, 0);
    }

    #[test]
    fn metric_files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metric.txt");
        write_metric(&path, 0.875).unwrap();
        assert_eq!(read_metric(&path).unwrap(), 0.875);
        std::fs::write(&path, "inf\n").unwrap();
        assert!(read_metric(&path).is_err());
    }
}
