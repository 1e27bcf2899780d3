//! Owned 3D reference volume with single-slice extraction.

use super::geometry::Geometry3;
use super::slide::SlideImage;

/// The 3D reference volume the stack is aligned against. Storage is
/// x-fastest, then y, then z, channel-interleaved like [`SlideImage`].
#[derive(Clone, Debug, PartialEq)]
pub struct Volume {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub components: usize,
    pub data: Vec<f32>,
    pub geometry: Geometry3,
}

impl Volume {
    pub fn new(width: usize, height: usize, depth: usize, components: usize) -> Self {
        Self {
            width,
            height,
            depth,
            components,
            data: vec![0.0; width * height * depth * components],
            geometry: Geometry3::default(),
        }
    }

    pub fn with_geometry(mut self, geometry: Geometry3) -> Self {
        self.geometry = geometry;
        self
    }

    #[inline]
    fn base(&self, x: usize, y: usize, z: usize) -> usize {
        ((z * self.height + y) * self.width + x) * self.components
    }

    #[inline]
    pub fn voxel(&self, x: usize, y: usize, z: usize) -> &[f32] {
        let i = self.base(x, y, z);
        &self.data[i..i + self.components]
    }

    #[inline]
    pub fn voxel_mut(&mut self, x: usize, y: usize, z: usize) -> &mut [f32] {
        let i = self.base(x, y, z);
        let c = self.components;
        &mut self.data[i..i + c]
    }

    pub fn byte_len(&self) -> u64 {
        (self.data.len() * std::mem::size_of::<f32>()) as u64
    }

    /// Extract the single slice at physical z-position `z_pos`.
    ///
    /// Conceptually a one-voxel-thick grid whose z-origin is moved to
    /// `z_pos`, sampled with linear interpolation and no in-plane warp,
    /// then collapsed to 2D keeping the in-plane origin, spacing, and the
    /// 2×2 direction block. A `z_pos` outside the volume extent yields a
    /// zero image.
    pub fn extract_slice(&self, z_pos: f64) -> SlideImage {
        let mut out = SlideImage::new(self.width, self.height, self.components)
            .with_geometry(self.geometry.in_plane());

        // Continuous z index of the requested physical position. The z grid
        // axis must not be degenerate.
        let dz = self.geometry.direction[(2, 2)] * self.geometry.spacing.z;
        if dz == 0.0 {
            return out;
        }
        let kz = (z_pos - self.geometry.origin.z) / dz;
        if kz < 0.0 || kz > (self.depth - 1) as f64 {
            return out;
        }

        let z0 = kz.floor() as usize;
        let z1 = (z0 + 1).min(self.depth - 1);
        let fz = (kz - z0 as f64) as f32;
        for y in 0..self.height {
            for x in 0..self.width {
                let lo = self.voxel(x, y, z0);
                let hi = self.voxel(x, y, z1);
                let px = out.pixel_mut(x, y);
                for c in 0..self.components {
                    px[c] = lo[c] * (1.0 - fz) + hi[c] * fz;
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Vector2, Vector3};

    fn layered(depth: usize) -> Volume {
        // Each z plane is constant, equal to its index.
        let mut vol = Volume::new(2, 2, depth, 1);
        for z in 0..depth {
            for y in 0..2 {
                for x in 0..2 {
                    vol.voxel_mut(x, y, z)[0] = z as f32;
                }
            }
        }
        vol
    }

    #[test]
    fn slice_interpolates_between_planes() {
        let mut vol = layered(4);
        vol.geometry.origin = Vector3::new(0.0, 0.0, 10.0);
        vol.geometry.spacing = Vector3::new(1.0, 1.0, 2.0);

        let slice = vol.extract_slice(13.0); // index 1.5
        assert!((slice.pixel(0, 0)[0] - 1.5).abs() < 1e-6);
        assert_eq!(slice.geometry.origin, Vector2::zeros());
    }

    #[test]
    fn slice_outside_extent_is_zero() {
        let vol = layered(3);
        let slice = vol.extract_slice(-0.5);
        assert!(slice.data.iter().all(|&v| v == 0.0));
        let slice = vol.extract_slice(2.5);
        assert!(slice.data.iter().all(|&v| v == 0.0));
    }
}
