mod common;

use common::fake_engine::FakeEngine;
use common::{init_logger, project_with_slides, snapshot_files};
use histostack::project::{PairIntent, SlideIntent};
use histostack::{ReconOptions, StackProject};

fn recon_opts(z_range: f64, z_epsilon: f64) -> ReconOptions {
    ReconOptions {
        z_range,
        z_epsilon,
        ..ReconOptions::default()
    }
}

#[test]
fn five_identical_slides_tie_break_to_the_first_root() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let (project, _) = project_with_slides(dir.path(), &[0.0, 1.0, 2.0, 3.0, 4.0], false);

    // Perfect similarity everywhere: all edge weights are zero, every root
    // candidate ties, and the lowest index wins.
    let mut engine = FakeEngine::new();
    let summary = project
        .reconstruct(&mut engine, &recon_opts(1.0, 0.0))
        .unwrap();
    assert_eq!(summary.root, 0);
    assert_eq!(summary.root_distance, 0.0);
}

#[test]
fn weighted_chain_prefers_the_middle_root() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let (project, _) = project_with_slides(dir.path(), &[0.0, 1.0, 2.0], false);

    let mut engine = FakeEngine::new();
    engine.set_default_metric(0.5); // every edge costs 0.5
    let summary = project
        .reconstruct(&mut engine, &recon_opts(1.0, 0.0))
        .unwrap();

    // Totals are 1.5 / 1.0 / 1.5 over the chain: the middle slide wins.
    assert_eq!(summary.root, 1);
    assert!((summary.root_distance - 1.0).abs() < 1e-12);

    // Every directed edge left a transform and a parseable finite metric.
    for (reference, moving) in [(0u32, 1u32), (1, 0), (1, 2), (2, 1)] {
        let matrix = project
            .store
            .pair_path(
                project.slide(reference),
                project.slide(moving),
                PairIntent::AffineMatrix,
            )
            .unwrap();
        assert!(matrix.is_file(), "missing {}", matrix.display());
        let metric = project
            .store
            .pair_path(
                project.slide(reference),
                project.slide(moving),
                PairIntent::MetricValue,
            )
            .unwrap();
        let value: f64 = std::fs::read_to_string(&metric)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(value.is_finite());
        assert_eq!(value, 0.5);
    }

    // Every slide got an accumulated matrix and a reslice.
    for slide in &project.slides {
        assert!(project
            .store
            .slide_path(slide, SlideIntent::AccumMatrix)
            .unwrap()
            .is_file());
        assert!(project
            .store
            .slide_path(slide, SlideIntent::AccumReslice)
            .unwrap()
            .is_file());
    }
}

#[test]
fn wide_gap_is_still_bridged_by_the_minimum_neighbor_rule() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let (project, _) = project_with_slides(dir.path(), &[0.0, 10.0], false);

    let mut engine = FakeEngine::new();
    project
        .reconstruct(&mut engine, &recon_opts(0.5, 0.1))
        .unwrap();

    for (reference, moving) in [(0u32, 1u32), (1, 0)] {
        let matrix = project
            .store
            .pair_path(
                project.slide(reference),
                project.slide(moving),
                PairIntent::AffineMatrix,
            )
            .unwrap();
        assert!(matrix.is_file());
    }
}

#[test]
fn reuse_mode_is_byte_for_byte_idempotent() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let (project, _) = project_with_slides(dir.path(), &[0.0, 1.0, 2.0], false);
    let opts = recon_opts(1.0, 0.1);

    let mut engine = FakeEngine::new();
    engine.set_default_metric(0.75);
    project.reconstruct(&mut engine, &opts).unwrap();
    let first = snapshot_files(project.store.root());

    // Second run in reuse mode with a fresh engine: nothing may change.
    let reopened = StackProject::restore(project.store.root(), true).unwrap();
    let mut engine = FakeEngine::new();
    engine.set_default_metric(0.75);
    reopened.reconstruct(&mut engine, &opts).unwrap();
    let second = snapshot_files(reopened.store.root());

    assert_eq!(first, second);
}
