//! Physical-space metadata for 2D slides and 3D volumes.
//!
//! An image grid maps index space to physical space via
//! `p = origin + direction * (spacing .* index)`, the convention used by
//! medical image headers. Registration transforms operate in physical
//! coordinates, so every buffer carries one of these.

use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};

/// Placement of a 2D grid in physical space.
#[derive(Clone, Debug, PartialEq)]
pub struct Geometry2 {
    pub origin: Vector2<f64>,
    pub spacing: Vector2<f64>,
    /// Unit column directions of the x and y grid axes.
    pub direction: Matrix2<f64>,
}

impl Default for Geometry2 {
    fn default() -> Self {
        Self {
            origin: Vector2::zeros(),
            spacing: Vector2::new(1.0, 1.0),
            direction: Matrix2::identity(),
        }
    }
}

impl Geometry2 {
    /// Physical position of the continuous index `(x, y)`.
    pub fn index_to_physical(&self, x: f64, y: f64) -> Vector2<f64> {
        self.origin + self.direction * Vector2::new(x * self.spacing.x, y * self.spacing.y)
    }

    /// Continuous index of a physical point, or `None` for a singular
    /// direction matrix.
    pub fn physical_to_index(&self, p: &Vector2<f64>) -> Option<Vector2<f64>> {
        let inv = self.direction.try_inverse()?;
        let d = inv * (p - self.origin);
        Some(Vector2::new(d.x / self.spacing.x, d.y / self.spacing.y))
    }
}

/// Placement of a 3D grid in physical space.
#[derive(Clone, Debug, PartialEq)]
pub struct Geometry3 {
    pub origin: Vector3<f64>,
    pub spacing: Vector3<f64>,
    pub direction: Matrix3<f64>,
}

impl Default for Geometry3 {
    fn default() -> Self {
        Self {
            origin: Vector3::zeros(),
            spacing: Vector3::new(1.0, 1.0, 1.0),
            direction: Matrix3::identity(),
        }
    }
}

impl Geometry3 {
    /// In-plane geometry: the xy origin, spacing, and the 2×2 direction
    /// submatrix. Used when a volume slice collapses to a 2D image.
    pub fn in_plane(&self) -> Geometry2 {
        Geometry2 {
            origin: Vector2::new(self.origin.x, self.origin.y),
            spacing: Vector2::new(self.spacing.x, self.spacing.y),
            direction: Matrix2::new(
                self.direction[(0, 0)],
                self.direction[(0, 1)],
                self.direction[(1, 0)],
                self.direction[(1, 1)],
            ),
        }
    }
}
