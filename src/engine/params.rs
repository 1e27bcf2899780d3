//! Parameter types handed to the registration engine.
//!
//! Models the subset of an engine invocation the orchestrator drives:
//! weighted image pairs, metric choice, degrees of freedom, initialization,
//! optional rigid search, moving pre-transforms, per-level schedules, and
//! reslice plans. Image references are plain strings resolved by the engine
//! first against its transient cached inputs, then as filesystem paths.

use std::path::PathBuf;

/// Similarity metric evaluated by the engine.
#[derive(Clone, Debug, PartialEq)]
pub enum MetricKind {
    /// Normalized cross-correlation over a square window of the given
    /// half-width in pixels.
    Ncc { radius: u32 },
    /// Sum of squared differences.
    Ssd,
}

impl Default for MetricKind {
    fn default() -> Self {
        // Matches the engine default the reconstruction stage relies on.
        Self::Ncc { radius: 4 }
    }
}

/// Degrees of freedom for the linear stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AffineDof {
    Rigid,
    Similarity,
    Affine,
}

/// How the linear transform is initialized.
#[derive(Clone, Debug, PartialEq)]
pub enum AffineInit {
    /// Identity in voxel space.
    VoxelIdentity,
    /// Translation matching the image centres, identity rotation.
    ImageCenters,
    /// Matrix loaded from a file in physical space.
    FromFile(PathBuf),
}

/// Randomized rigid search performed before local optimization.
#[derive(Clone, Debug, PartialEq)]
pub struct RigidSearch {
    pub iterations: u32,
    pub sigma_xyz: f64,
    pub sigma_angle_deg: f64,
}

/// A value that is either shared by all pyramid levels or scheduled
/// one-per-level.
#[derive(Clone, Debug, PartialEq)]
pub enum PerLevel<T> {
    Uniform(T),
    Schedule(Vec<T>),
}

impl<T: Copy> PerLevel<T> {
    /// Value for `level`; schedules shorter than the pyramid repeat their
    /// last entry.
    pub fn at(&self, level: usize) -> T {
        match self {
            PerLevel::Uniform(v) => *v,
            PerLevel::Schedule(vs) => vs
                .get(level)
                .copied()
                .or_else(|| vs.last().copied())
                .unwrap_or_else(|| panic!("empty per-level schedule")),
        }
    }
}

/// One fixed/moving pairing contributing to the objective with a weight.
#[derive(Clone, Debug, PartialEq)]
pub struct ImagePair {
    pub fixed: String,
    pub moving: String,
    pub weight: f64,
}

impl ImagePair {
    pub fn new(fixed: impl Into<String>, moving: impl Into<String>, weight: f64) -> Self {
        Self {
            fixed: fixed.into(),
            moving: moving.into(),
            weight,
        }
    }
}

/// One image to push through a reslice plan.
#[derive(Clone, Debug, PartialEq)]
pub struct ResliceJob {
    /// Source image, name-or-path.
    pub moving: String,
    /// Destination: a registered cached output name, or a path to write.
    pub output: String,
}

/// Reslicing request: map each job's image into the reference frame through
/// the transform chain (applied in list order, warps and matrices mixed).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReslicePlan {
    pub reference: String,
    pub images: Vec<ResliceJob>,
    pub transforms: Vec<PathBuf>,
}

/// Full parameter block for one engine invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct RegistrationParams {
    pub inputs: Vec<ImagePair>,
    /// Output path for the transform produced by `run_affine` or
    /// `run_deformable`.
    pub output: Option<PathBuf>,
    pub metric: MetricKind,
    pub dof: AffineDof,
    pub init: AffineInit,
    pub rigid_search: Option<RigidSearch>,
    pub iterations: PerLevel<u32>,
    /// Transforms applied to the moving image before deformable
    /// optimization starts.
    pub moving_pre_transforms: Vec<PathBuf>,
    pub reslice: Option<ReslicePlan>,
}

impl Default for RegistrationParams {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            output: None,
            metric: MetricKind::default(),
            dof: AffineDof::Affine,
            init: AffineInit::VoxelIdentity,
            rigid_search: None,
            iterations: PerLevel::Uniform(100),
            moving_pre_transforms: Vec::new(),
            reslice: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_level_uniform_applies_everywhere() {
        let p = PerLevel::Uniform(40u32);
        assert_eq!(p.at(0), 40);
        assert_eq!(p.at(7), 40);
    }

    #[test]
    fn per_level_schedule_repeats_last() {
        let p = PerLevel::Schedule(vec![100u32, 50, 10]);
        assert_eq!(p.at(0), 100);
        assert_eq!(p.at(2), 10);
        assert_eq!(p.at(5), 10);
    }
}
