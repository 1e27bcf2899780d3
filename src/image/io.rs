//! Raster I/O helpers for slides and volumes.
//!
//! - `load_slide` / `save_slide`: 2D rasters through the `image` crate.
//!   Grayscale sources load as one component, everything else as three.
//!   Float data (warps, resliced sections) round-trips losslessly only
//!   with the `exr` extension; other formats quantize to 8-bit.
//! - Geometry rides in a JSON sidecar (`<file>.json`), written whenever the
//!   placement differs from the identity default.
//! - `load_volume`: a volume is a directory with a `volume.json` descriptor
//!   listing its slices bottom to top plus the 3D placement.

use image::{DynamicImage, GrayImage, Rgb32FImage, RgbImage};
use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::EngineError;

use super::geometry::{Geometry2, Geometry3};
use super::slide::SlideImage;
use super::volume::Volume;

#[derive(Serialize, Deserialize)]
struct GeometrySidecar {
    origin: [f64; 2],
    spacing: [f64; 2],
    direction: [[f64; 2]; 2],
}

impl From<&Geometry2> for GeometrySidecar {
    fn from(g: &Geometry2) -> Self {
        Self {
            origin: [g.origin.x, g.origin.y],
            spacing: [g.spacing.x, g.spacing.y],
            direction: [
                [g.direction[(0, 0)], g.direction[(0, 1)]],
                [g.direction[(1, 0)], g.direction[(1, 1)]],
            ],
        }
    }
}

impl From<GeometrySidecar> for Geometry2 {
    fn from(s: GeometrySidecar) -> Self {
        Self {
            origin: Vector2::new(s.origin[0], s.origin[1]),
            spacing: Vector2::new(s.spacing[0], s.spacing[1]),
            direction: Matrix2::new(
                s.direction[0][0],
                s.direction[0][1],
                s.direction[1][0],
                s.direction[1][1],
            ),
        }
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".json");
    PathBuf::from(s)
}

fn is_float_format(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("exr"))
}

/// Load a 2D raster into an owned [`SlideImage`], picking up the geometry
/// sidecar when present.
pub fn load_slide(path: &Path) -> Result<SlideImage, EngineError> {
    let dynimg = image::open(path).map_err(|e| EngineError::decode(path, e.to_string()))?;
    let mut slide = match dynimg.color() {
        image::ColorType::L8 | image::ColorType::L16 | image::ColorType::La8
        | image::ColorType::La16 => {
            let gray = dynimg.to_luma32f();
            let (w, h) = (gray.width() as usize, gray.height() as usize);
            SlideImage {
                width: w,
                height: h,
                components: 1,
                data: gray.into_raw(),
                geometry: Geometry2::default(),
            }
        }
        _ => {
            let rgb = dynimg.to_rgb32f();
            let (w, h) = (rgb.width() as usize, rgb.height() as usize);
            SlideImage {
                width: w,
                height: h,
                components: 3,
                data: rgb.into_raw(),
                geometry: Geometry2::default(),
            }
        }
    };

    let sidecar = sidecar_path(path);
    if sidecar.is_file() {
        let text =
            fs::read_to_string(&sidecar).map_err(|e| EngineError::io(sidecar.clone(), e))?;
        let parsed: GeometrySidecar = serde_json::from_str(&text)
            .map_err(|e| EngineError::decode(sidecar, e.to_string()))?;
        slide.geometry = parsed.into();
    }
    Ok(slide)
}

/// Save a [`SlideImage`] to disk, writing the geometry sidecar when the
/// placement is not the identity default.
pub fn save_slide(image: &SlideImage, path: &Path) -> Result<(), EngineError> {
    ensure_parent_dir(path)?;
    let (w, h) = (image.width as u32, image.height as u32);

    if is_float_format(path) {
        let mut out = Rgb32FImage::new(w, h);
        for y in 0..image.height {
            for x in 0..image.width {
                let px = image.pixel(x, y);
                let rgb = match image.components {
                    1 => [px[0], px[0], px[0]],
                    2 => [px[0], px[1], 0.0],
                    3 => [px[0], px[1], px[2]],
                    n => {
                        return Err(EngineError::decode(
                            path,
                            format!("cannot encode {n}-component image"),
                        ))
                    }
                };
                out.put_pixel(x as u32, y as u32, image::Rgb(rgb));
            }
        }
        DynamicImage::ImageRgb32F(out)
            .save(path)
            .map_err(|e| EngineError::decode(path, e.to_string()))?;
    } else {
        let quantize = |v: f32| (v * 255.0).clamp(0.0, 255.0) as u8;
        match image.components {
            1 => {
                let mut out = GrayImage::new(w, h);
                for y in 0..image.height {
                    for x in 0..image.width {
                        out.put_pixel(x as u32, y as u32, image::Luma([quantize(
                            image.pixel(x, y)[0],
                        )]));
                    }
                }
                out.save(path)
                    .map_err(|e| EngineError::decode(path, e.to_string()))?;
            }
            2 | 3 => {
                let mut out = RgbImage::new(w, h);
                for y in 0..image.height {
                    for x in 0..image.width {
                        let px = image.pixel(x, y);
                        let b = if image.components == 3 { quantize(px[2]) } else { 0 };
                        out.put_pixel(
                            x as u32,
                            y as u32,
                            image::Rgb([quantize(px[0]), quantize(px[1]), b]),
                        );
                    }
                }
                out.save(path)
                    .map_err(|e| EngineError::decode(path, e.to_string()))?;
            }
            n => {
                return Err(EngineError::decode(
                    path,
                    format!("cannot encode {n}-component image"),
                ))
            }
        }
    }

    if image.geometry != Geometry2::default() {
        let sidecar = sidecar_path(path);
        let json = serde_json::to_string_pretty(&GeometrySidecar::from(&image.geometry))
            .map_err(|e| EngineError::decode(sidecar.clone(), e.to_string()))?;
        fs::write(&sidecar, json).map_err(|e| EngineError::io(sidecar, e))?;
    }
    Ok(())
}

fn default_origin() -> [f64; 3] {
    [0.0; 3]
}

fn default_spacing() -> [f64; 3] {
    [1.0; 3]
}

fn default_direction() -> [[f64; 3]; 3] {
    [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]
}

/// Descriptor sitting at `<dir>/volume.json`.
#[derive(Deserialize)]
struct VolumeDescriptor {
    #[serde(default = "default_origin")]
    origin: [f64; 3],
    #[serde(default = "default_spacing")]
    spacing: [f64; 3],
    #[serde(default = "default_direction")]
    direction: [[f64; 3]; 3],
    /// Slice rasters in ascending z order, relative to the directory.
    slices: Vec<String>,
}

/// Load a reference volume from a descriptor directory.
pub fn load_volume(dir: &Path) -> Result<Volume, EngineError> {
    let descriptor_path = dir.join("volume.json");
    let text = fs::read_to_string(&descriptor_path)
        .map_err(|e| EngineError::io(descriptor_path.clone(), e))?;
    let desc: VolumeDescriptor = serde_json::from_str(&text)
        .map_err(|e| EngineError::decode(descriptor_path.clone(), e.to_string()))?;
    let mut volume: Option<Volume> = None;
    for (z, name) in desc.slices.iter().enumerate() {
        let slice_path = dir.join(name);
        let slice = load_slide(&slice_path)?;
        let vol = volume.get_or_insert_with(|| {
            let d = desc.direction;
            Volume::new(slice.width, slice.height, desc.slices.len(), slice.components)
                .with_geometry(Geometry3 {
                    origin: Vector3::new(desc.origin[0], desc.origin[1], desc.origin[2]),
                    spacing: Vector3::new(desc.spacing[0], desc.spacing[1], desc.spacing[2]),
                    direction: Matrix3::new(
                        d[0][0], d[0][1], d[0][2], d[1][0], d[1][1], d[1][2], d[2][0], d[2][1],
                        d[2][2],
                    ),
                })
        });
        if slice.width != vol.width
            || slice.height != vol.height
            || slice.components != vol.components
        {
            return Err(EngineError::decode(
                slice_path,
                "slice dimensions disagree with the rest of the volume",
            ));
        }
        for y in 0..vol.height {
            for x in 0..vol.width {
                vol.voxel_mut(x, y, z).copy_from_slice(slice.pixel(x, y));
            }
        }
    }
    volume.ok_or_else(|| EngineError::decode(descriptor_path, "volume lists no slices"))
}

pub(crate) fn ensure_parent_dir(path: &Path) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| EngineError::io(parent.to_path_buf(), e))?;
        }
    }
    Ok(())
}
