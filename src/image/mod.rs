//! Image module: owned pixel buffers with physical-space geometry.
//!
//! Components
//! - `geometry`: origin/spacing/direction metadata mapping voxel indices to
//!   physical coordinates in 2D and 3D.
//! - `slide`: owned multi-component f32 buffer for one histology section,
//!   with bilinear sampling and replicate padding.
//! - `volume`: owned 3D buffer for the reference volume, with single-slice
//!   extraction at an arbitrary physical z.
//! - `io`: raster load/save helpers plus JSON geometry sidecars.
//!
//! Design goals
//! - Keep hot loops simple and cache-friendly via flat row-major storage.
//! - Make ownership explicit: buffers own their data; sharing across the
//!   cache and engine calls goes through `Arc`.

pub mod geometry;
pub mod io;
pub mod slide;
pub mod volume;

pub use self::geometry::{Geometry2, Geometry3};
pub use self::slide::SlideImage;
pub use self::volume::Volume;
