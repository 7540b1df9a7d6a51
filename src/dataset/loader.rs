use super::ManifestEntry;
use crate::result::Result;
use ndarray::Array5;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The shape of one sample.
///
/// A sample is a group of `clips`, each `frames` images of `channels` x `height` x `width`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipShape {
    /// Clips per sample.
    pub clips: usize,
    /// Frames per clip.
    pub frames: usize,
    /// Channels per frame.
    pub channels: usize,
    /// Frame height.
    pub height: usize,
    /// Frame width.
    pub width: usize,
}

impl ClipShape {
    /// [clips, frames, channels, height, width]
    pub fn dim(&self) -> [usize; 5] {
        [
            self.clips,
            self.frames,
            self.channels,
            self.height,
            self.width,
        ]
    }
    /// The number of elements.
    pub fn len(&self) -> usize {
        self.dim().iter().product()
    }
    /// Whether any dimension is 0.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ClipShape {
    fn default() -> Self {
        Self {
            clips: 1,
            frames: 64,
            channels: 3,
            height: 224,
            width: 224,
        }
    }
}

/// Decodes and transforms clips.
///
/// Implement this to read real video. The output must have the loader's [`ClipShape`].
pub trait ClipLoader: Send + Sync {
    /// The shape of each loaded sample.
    fn shape(&self) -> ClipShape;
    /// Loads the sample for `entry`. `root` is the clips directory.
    ///
    /// **Errors**
    /// The clip could not be read or decoded.
    fn load(&self, root: &Path, entry: &ManifestEntry) -> Result<Array5<f32>>;
}

/// Generates deterministic clips without touching the filesystem.
///
/// Each clip is seeded from its path. Deceptive clips are offset by `+signal` and truthful clips by
/// `-signal`, so the classes are separable.
#[derive(Debug, Clone)]
pub struct SyntheticLoader {
    shape: ClipShape,
    signal: f32,
}

impl SyntheticLoader {
    /// Creates a loader producing samples of `shape`.
    pub fn new(shape: ClipShape) -> Self {
        Self { shape, signal: 0.5 }
    }
    /// The class offset. Defaults to 0.5.
    pub fn signal(self, signal: f32) -> Self {
        Self { signal, ..self }
    }
}

// FNV-1a, stable across runs and platforms.
fn path_seed(path: &str) -> u64 {
    path.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

impl ClipLoader for SyntheticLoader {
    fn shape(&self) -> ClipShape {
        self.shape
    }
    fn load(&self, _root: &Path, entry: &ManifestEntry) -> Result<Array5<f32>> {
        let mut rng = StdRng::seed_from_u64(path_seed(&entry.path));
        let offset = if entry.label == 1 {
            self.signal
        } else {
            -self.signal
        };
        Ok(Array5::from_shape_simple_fn(self.shape.dim(), || {
            offset + rng.gen_range(-1f32..1.)
        }))
    }
}
