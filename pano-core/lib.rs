#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Row-major 8-bit grayscale image
pub type Image = Vec<u8>;

/// Key-point ≙ FAST corner + orientation (radians) with subpixel precision,
/// expressed in the coordinates of the image the detector was run on
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,      // Subpixel x coordinate
    pub y: f32,      // Subpixel y coordinate
    pub angle: f32,
    pub response: f32,
    pub octave: usize,
}

impl Keypoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            angle: 0.0,
            response: 0.0,
            octave: 0,
        }
    }
}

/// 256-bit binary descriptor = 32 bytes
pub type Descriptor = [u8; 32];

/// Number of differing bits between two binary descriptors
#[inline]
pub fn hamming_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Features of one image in the global image list.
///
/// `keypoints[i]` is described by `descriptors[i]`; `img_size` is the
/// (width, height) of the image the features were detected on.
#[derive(Debug, Clone, Default)]
pub struct ImageFeatures {
    pub img_idx: usize,
    pub img_size: (u32, u32),
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
}

impl ImageFeatures {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FeatureConfig {
    pub threshold: u8,
    pub patch_size: usize,
    pub n_threads: usize,
    /// Upper bound on features kept per image across all pyramid levels
    pub n_features: usize,
    pub n_levels: usize,
    pub scale_factor: f32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            threshold: 20,
            patch_size: 31,
            n_threads: num_cpus::get().max(1),
            n_features: 1500,
            n_levels: 8,
            scale_factor: 1.2,
        }
    }
}

/// Initialize Rayon thread pool with the specified number of threads.
///
/// The global pool can only be built once per process; later calls return
/// the build error, which callers may ignore.
pub fn init_thread_pool(n_threads: usize) -> Result<(), rayon::ThreadPoolBuildError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(n_threads)
        .build_global()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hamming_distance() {
        let a = [0u8; 32];
        let mut b = [0u8; 32];
        assert_eq!(hamming_distance(&a, &b), 0);
        b[0] = 0b1011_0000;
        b[31] = 0xff;
        assert_eq!(hamming_distance(&a, &b), 11);
        assert_eq!(hamming_distance(&b, &a), 11);
    }

    #[test]
    fn test_default_config() {
        let cfg = FeatureConfig::default();
        assert!(cfg.n_threads >= 1);
        assert_eq!(cfg.patch_size % 2, 1);
        assert!(cfg.scale_factor > 1.0);
    }

    #[test]
    fn test_image_features_len() {
        let mut f = ImageFeatures::default();
        assert!(f.is_empty());
        f.keypoints.push(Keypoint::new(1.0, 2.0));
        f.descriptors.push([0; 32]);
        assert_eq!(f.len(), 1);
    }
}
