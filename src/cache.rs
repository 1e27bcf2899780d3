//! Bounded LRU cache of on-demand-loaded images.
//!
//! Slides and volumes are cycled in and out of memory based on when they
//! were last accessed. Both a byte budget and an image-count budget are
//! enforced (`0` disables either); eviction runs eagerly before an insert
//! and drops least-recently-used entries until the new image fits or the
//! cache is empty. Entries hand out `Arc` clones, so callers keep loaded
//! images alive independently of cache residency.
//!
//! Single-threaded by contract: wrap in external synchronization if shared.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::engine::ImageIo;
use crate::error::{Result, StackError};
use crate::image::{SlideImage, Volume};

/// Payload stored under one cache key. Also the currency of the engine's
/// transient cached-input registrations.
#[derive(Clone, Debug)]
pub enum CachedImage {
    Slide(Arc<SlideImage>),
    Volume(Arc<Volume>),
}

impl CachedImage {
    pub fn byte_len(&self) -> u64 {
        match self {
            CachedImage::Slide(img) => img.byte_len(),
            CachedImage::Volume(vol) => vol.byte_len(),
        }
    }
}

/// Cache budgets. `0` disables the corresponding cap.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct CacheLimits {
    pub max_bytes: u64,
    pub max_images: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_bytes: 0,
            max_images: 20,
        }
    }
}

struct Entry {
    stamp: u64,
    bytes: u64,
    payload: CachedImage,
}

/// LRU image cache keyed by source path.
pub struct ImageCache {
    entries: HashMap<PathBuf, Entry>,
    limits: CacheLimits,
    used_bytes: u64,
    counter: u64,
}

impl ImageCache {
    pub fn new(limits: CacheLimits) -> Self {
        Self {
            entries: HashMap::new(),
            limits,
            used_bytes: 0,
            counter: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    /// Drop every entry.
    pub fn purge(&mut self) {
        self.entries.clear();
        self.used_bytes = 0;
    }

    /// Fetch a slide, loading through `io` on a miss.
    pub fn get_slide<R: ImageIo + ?Sized>(&mut self, io: &R, path: &Path) -> Result<Arc<SlideImage>> {
        if let Some(entry) = self.entries.get_mut(path) {
            entry.stamp = self.counter;
            self.counter += 1;
            return match &entry.payload {
                CachedImage::Slide(img) => Ok(Arc::clone(img)),
                CachedImage::Volume(_) => Err(StackError::CacheTypeMismatch {
                    path: path.to_path_buf(),
                }),
            };
        }
        let img = Arc::new(io.read_slide(path)?);
        self.insert(path, CachedImage::Slide(Arc::clone(&img)));
        Ok(img)
    }

    /// Fetch a volume, loading through `io` on a miss.
    pub fn get_volume<R: ImageIo + ?Sized>(&mut self, io: &R, path: &Path) -> Result<Arc<Volume>> {
        if let Some(entry) = self.entries.get_mut(path) {
            entry.stamp = self.counter;
            self.counter += 1;
            return match &entry.payload {
                CachedImage::Volume(vol) => Ok(Arc::clone(vol)),
                CachedImage::Slide(_) => Err(StackError::CacheTypeMismatch {
                    path: path.to_path_buf(),
                }),
            };
        }
        let vol = Arc::new(io.read_volume(path)?);
        self.insert(path, CachedImage::Volume(Arc::clone(&vol)));
        Ok(vol)
    }

    fn insert(&mut self, path: &Path, payload: CachedImage) {
        let bytes = payload.byte_len();
        self.shrink(bytes, 1);
        self.used_bytes += bytes;
        self.entries.insert(
            path.to_path_buf(),
            Entry {
                stamp: self.counter,
                bytes,
                payload,
            },
        );
        self.counter += 1;
    }

    /// Evict least-recently-used entries until `new_bytes`/`new_images`
    /// would fit, or the cache is empty.
    fn shrink(&mut self, new_bytes: u64, new_images: usize) {
        while self.is_full(new_bytes, new_images) && !self.entries.is_empty() {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.stamp)
                .map(|(k, _)| k.clone());
            if let Some(key) = oldest {
                if let Some(entry) = self.entries.remove(&key) {
                    self.used_bytes -= entry.bytes;
                }
            }
        }
    }

    fn is_full(&self, new_bytes: u64, new_images: usize) -> bool {
        if self.limits.max_bytes > 0 && self.used_bytes + new_bytes > self.limits.max_bytes {
            return true;
        }
        if self.limits.max_images > 0 && self.entries.len() + new_images > self.limits.max_images {
            return true;
        }
        false
    }
}
