mod common;

use common::fake_engine::FakeEngine;
use common::{init_logger, project_with_slides};
use histostack::project::{GlobalIntent, IterIntent, SlideIntent};
use histostack::{ReconOptions, VolMatchOptions};
use nalgebra::Matrix3;

#[test]
fn volume_match_persists_slices_affines_and_iteration_zero() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let (project, _) = project_with_slides(dir.path(), &[0.5, 1.5, 2.5], false);

    let mut engine = FakeEngine::new();
    project
        .reconstruct(
            &mut engine,
            &ReconOptions {
                z_range: 1.0,
                z_epsilon: 0.0,
                ..ReconOptions::default()
            },
        )
        .unwrap();
    project
        .match_to_volume(
            &mut engine,
            dir.path().join("volume").as_path(),
            &VolMatchOptions::default(),
        )
        .unwrap();

    for slide in &project.slides {
        assert!(project
            .store
            .slide_path(slide, SlideIntent::VolSlide)
            .unwrap()
            .is_file());
        assert!(project
            .store
            .slide_path(slide, SlideIntent::VolInitMatrix)
            .unwrap()
            .is_file());
        assert!(project
            .store
            .iter_path(slide, IterIntent::VolIterMatrix, 0)
            .unwrap()
            .is_file());
    }
    assert!(project
        .store
        .global_path(GlobalIntent::VolMedianInitMatrix)
        .unwrap()
        .is_file());
}

#[test]
fn iteration_zero_composes_accumulated_with_the_median() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let (project, _) = project_with_slides(dir.path(), &[0.5, 1.5, 2.5], false);

    let mut engine = FakeEngine::new();
    project
        .reconstruct(
            &mut engine,
            &ReconOptions {
                z_range: 1.0,
                z_epsilon: 0.0,
                ..ReconOptions::default()
            },
        )
        .unwrap();

    // Two per-slide volume affines agree; the third is far away in L1.
    // The medoid must be the agreeing transform, written for slide s0.
    let mut shift = Matrix3::identity();
    shift[(0, 2)] = 2.0;
    let mut outlier = Matrix3::identity();
    outlier[(0, 2)] = 50.0;
    engine.set_affine_output("affine_refvol_mov_s0.mat", shift);
    engine.set_affine_output("affine_refvol_mov_s1.mat", shift);
    engine.set_affine_output("affine_refvol_mov_s2.mat", outlier);

    project
        .match_to_volume(
            &mut engine,
            dir.path().join("volume").as_path(),
            &VolMatchOptions::default(),
        )
        .unwrap();

    let median_path = project
        .store
        .global_path(GlobalIntent::VolMedianInitMatrix)
        .unwrap();
    let median = histostack::engine::read_affine_text(&median_path).unwrap();
    assert_eq!(median, shift);

    // Iteration zero equals accumulated · median; accumulated matrices are
    // identity under the fake engine.
    for slide in &project.slides {
        let iter0 = project
            .store
            .iter_path(slide, IterIntent::VolIterMatrix, 0)
            .unwrap();
        let m = histostack::engine::read_affine_text(&iter0).unwrap();
        assert_eq!(m, shift);
    }
}
