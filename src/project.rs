//! Project store: the durable directory every stage reads and writes.
//!
//! A project is a directory holding the manifest copy, a config dict, and
//! the per-slide transforms, reslices, and metric dumps produced by the
//! stages. The store resolves logical intents to concrete paths following a
//! fixed layout and creates missing parent directories as a side effect, so
//! callers never touch `create_dir_all` themselves.
//!
//! Layout, relative to the project root with image extension `ext`:
//!
//! ```text
//! config/manifest.txt
//! config/dict/<key>
//! recon/nbr/affine_ref_<rid>_mov_<mid>.mat        (+ _metric.txt)
//! recon/accum/accum_affine_<sid>.mat              (+ _reslice.<ext>)
//! vol/match/affine_refvol_median.mat
//! vol/match/affine_refvol_mov_<sid>.mat
//! vol/slides/vol_slide_<sid>.<ext>
//! vol/iter<II>/affine_refvol_mov_<sid>_iter<II>.mat
//! vol/iter<II>/warp_refvol_mov_<sid>_iter<II>.<ext>
//! vol/iter<II>/metric_refvol_mov_<sid>_iter<II>.txt
//! ```

use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::info;

use crate::error::{Result, StackError};
use crate::manifest::{read_manifest, write_manifest, Slide, SlideIndex};

/// Image extension used when none has been recorded in the project yet.
pub const DEFAULT_IMAGE_EXT: &str = "exr";

/// Files keyed by an ordered slide pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairIntent {
    /// Rigid transform mapping the moving slide onto the reference slide.
    AffineMatrix,
    /// Normalized similarity metric of that registration.
    MetricValue,
}

/// Files keyed by a single slide.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlideIntent {
    /// Transform accumulated along the tree path from the root.
    AccumMatrix,
    /// The slide resliced into the padded-root frame.
    AccumReslice,
    /// Initial affine from the reconstructed slide to its volume slice.
    VolInitMatrix,
    /// The 2D slice extracted from the reference volume at the slide's z.
    VolSlide,
}

/// Files keyed by a slide and a refinement iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterIntent {
    VolIterMatrix,
    VolIterWarp,
    IterMetricDump,
}

/// Project-global files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GlobalIntent {
    Manifest,
    VolMedianInitMatrix,
}

/// Path resolution plus the reuse/skip policy. No state beyond the root,
/// the image extension, and the reuse flag.
#[derive(Clone, Debug)]
pub struct ProjectStore {
    root: PathBuf,
    ext: String,
    reuse: bool,
}

impl ProjectStore {
    pub fn new(root: impl Into<PathBuf>, ext: impl Into<String>, reuse: bool) -> Self {
        Self {
            root: root.into(),
            ext: ext.into(),
            reuse,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn image_ext(&self) -> &str {
        &self.ext
    }

    /// True iff reuse mode is on and the file already exists, meaning the
    /// work that would produce it can be skipped.
    pub fn can_skip(&self, path: &Path) -> bool {
        self.reuse && path.is_file()
    }

    pub fn pair_path(&self, reference: &Slide, moving: &Slide, intent: PairIntent) -> Result<PathBuf> {
        let (rid, mid) = (&reference.unique_id, &moving.unique_id);
        let rel = match intent {
            PairIntent::AffineMatrix => format!("recon/nbr/affine_ref_{rid}_mov_{mid}.mat"),
            PairIntent::MetricValue => format!("recon/nbr/affine_ref_{rid}_mov_{mid}_metric.txt"),
        };
        self.resolve(&rel)
    }

    pub fn slide_path(&self, slide: &Slide, intent: SlideIntent) -> Result<PathBuf> {
        let sid = &slide.unique_id;
        let ext = &self.ext;
        let rel = match intent {
            SlideIntent::AccumMatrix => format!("recon/accum/accum_affine_{sid}.mat"),
            SlideIntent::AccumReslice => format!("recon/accum/accum_affine_{sid}_reslice.{ext}"),
            SlideIntent::VolInitMatrix => format!("vol/match/affine_refvol_mov_{sid}.mat"),
            SlideIntent::VolSlide => format!("vol/slides/vol_slide_{sid}.{ext}"),
        };
        self.resolve(&rel)
    }

    pub fn iter_path(&self, slide: &Slide, intent: IterIntent, iteration: u32) -> Result<PathBuf> {
        let sid = &slide.unique_id;
        let ext = &self.ext;
        let rel = match intent {
            IterIntent::VolIterMatrix => {
                format!("vol/iter{iteration:02}/affine_refvol_mov_{sid}_iter{iteration:02}.mat")
            }
            IterIntent::VolIterWarp => {
                format!("vol/iter{iteration:02}/warp_refvol_mov_{sid}_iter{iteration:02}.{ext}")
            }
            IterIntent::IterMetricDump => {
                format!("vol/iter{iteration:02}/metric_refvol_mov_{sid}_iter{iteration:02}.txt")
            }
        };
        self.resolve(&rel)
    }

    pub fn global_path(&self, intent: GlobalIntent) -> Result<PathBuf> {
        let rel = match intent {
            GlobalIntent::Manifest => "config/manifest.txt".to_string(),
            GlobalIntent::VolMedianInitMatrix => "vol/match/affine_refvol_median.mat".to_string(),
        };
        self.resolve(&rel)
    }

    pub fn config_path(&self, key: &str) -> Result<PathBuf> {
        self.resolve(&format!("config/dict/{key}"))
    }

    /// Store one config value as its bare textual representation.
    pub fn save_config<T: Display>(&self, key: &str, value: &T) -> Result<()> {
        let path = self.config_path(key)?;
        fs::write(&path, format!("{value}")).map_err(|e| StackError::project_io(path, e))
    }

    /// Load one config value, falling back to `default` when the key has
    /// never been written.
    pub fn load_config<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        let path = self.config_path(key)?;
        if !path.is_file() {
            return Ok(default);
        }
        let text = fs::read_to_string(&path).map_err(|e| StackError::project_io(&path, e))?;
        text.trim().parse::<T>().map_err(|_| {
            StackError::project_io(
                &path,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("config value '{}' does not parse", text.trim()),
                ),
            )
        })
    }

    fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StackError::project_io(parent, e))?;
        }
        Ok(path)
    }
}

/// A loaded project: the store plus the slide list and its z-order.
#[derive(Clone, Debug)]
pub struct StackProject {
    pub store: ProjectStore,
    pub slides: Vec<Slide>,
    pub index: SlideIndex,
}

impl StackProject {
    /// Create a project directory from a user manifest: parse it, write the
    /// project copy, and record the default image extension.
    pub fn initialize(
        root: impl Into<PathBuf>,
        manifest: &Path,
        ext: impl Into<String>,
        reuse: bool,
    ) -> Result<Self> {
        let slides = read_manifest(manifest)?;
        let store = ProjectStore::new(root, ext, reuse);
        write_manifest(&store.global_path(GlobalIntent::Manifest)?, &slides)?;
        store.save_config("DefaultImageExt", &store.image_ext().to_string())?;
        info!("project initialized in {}", store.root().display());
        let index = SlideIndex::new(&slides);
        Ok(Self {
            store,
            slides,
            index,
        })
    }

    /// Reopen an initialized project from its own manifest copy and
    /// recorded extension.
    pub fn restore(root: impl Into<PathBuf>, reuse: bool) -> Result<Self> {
        let mut store = ProjectStore::new(root, DEFAULT_IMAGE_EXT, reuse);
        store.ext = store.load_config("DefaultImageExt", DEFAULT_IMAGE_EXT.to_string())?;
        let slides = read_manifest(&store.global_path(GlobalIntent::Manifest)?)?;
        let index = SlideIndex::new(&slides);
        Ok(Self {
            store,
            slides,
            index,
        })
    }

    pub fn slide(&self, ordinal: u32) -> &Slide {
        &self.slides[ordinal as usize]
    }
}
