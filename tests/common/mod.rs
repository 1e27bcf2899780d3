//! Shared scaffolding for the integration tests: synthetic projects on a
//! temp directory plus the scriptable fake engine.

// Each integration-test binary compiles its own copy of this module and
// uses a different subset of it.
#![allow(dead_code)]

pub mod fake_engine;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use histostack::image::io::save_slide;
use histostack::image::SlideImage;
use histostack::StackProject;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Small gray gradient with a per-slide phase so slides are not all equal.
pub fn gradient_slide(width: usize, height: usize, phase: usize) -> SlideImage {
    let mut img = SlideImage::new(width, height, 1);
    for y in 0..height {
        for x in 0..width {
            img.pixel_mut(x, y)[0] = ((x + 2 * y + phase) % 17) as f32 / 16.0;
        }
    }
    img
}

/// Write slide rasters plus a manifest and initialize a project using the
/// `png` image extension. Returns the project and the raw slide paths.
pub fn project_with_slides(dir: &Path, zs: &[f64], reuse: bool) -> (StackProject, Vec<PathBuf>) {
    let mut raw_paths = Vec::new();
    let mut manifest_text = String::new();
    for (i, &z) in zs.iter().enumerate() {
        let raw = dir.join(format!("slide_{i}.png"));
        save_slide(&gradient_slide(8, 8, i), &raw).unwrap();
        manifest_text.push_str(&format!("s{i} {z} {}\n", raw.display()));
        raw_paths.push(raw);
    }
    let manifest = dir.join("manifest.txt");
    std::fs::write(&manifest, manifest_text).unwrap();

    let project = StackProject::initialize(dir.join("proj"), &manifest, "png", reuse).unwrap();
    (project, raw_paths)
}

/// Snapshot every file under `dir` as path → bytes.
pub fn snapshot_files(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    let mut out = BTreeMap::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.insert(path.clone(), std::fs::read(&path).unwrap());
            }
        }
    }
    out
}
