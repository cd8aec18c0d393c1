use pano_core::FeatureConfig;

use crate::error::FeatureResult;
use crate::orb::OrbExtractor;

/// Builder for creating an `OrbExtractor`
#[derive(Debug, Clone)]
pub struct OrbBuilder {
    config: FeatureConfig,
    nms_distance: f32,
    subpixel_refinement: bool,
}

impl Default for OrbBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrbBuilder {
    pub fn new() -> Self {
        Self {
            config: FeatureConfig::default(),
            nms_distance: 3.0,
            subpixel_refinement: true,
        }
    }

    /// Start from an existing feature configuration
    pub fn from_config(config: FeatureConfig) -> Self {
        Self {
            config,
            ..Self::new()
        }
    }

    /// Set the FAST threshold (1-127)
    pub fn threshold(mut self, threshold: u8) -> Self {
        self.config.threshold = threshold;
        self
    }

    /// Set the (odd) patch size used for orientation and BRIEF
    pub fn patch_size(mut self, patch_size: usize) -> Self {
        self.config.patch_size = patch_size;
        self
    }

    pub fn threads(mut self, n_threads: usize) -> Self {
        self.config.n_threads = n_threads;
        self
    }

    /// Maximum number of features kept per image
    pub fn features(mut self, n_features: usize) -> Self {
        self.config.n_features = n_features;
        self
    }

    pub fn levels(mut self, n_levels: usize) -> Self {
        self.config.n_levels = n_levels;
        self
    }

    pub fn scale_factor(mut self, scale_factor: f32) -> Self {
        self.config.scale_factor = scale_factor;
        self
    }

    /// Set the non-maximum suppression (NMS) distance
    pub fn nms_distance(mut self, distance: f32) -> Self {
        self.nms_distance = distance;
        self
    }

    /// Enable or disable subpixel refinement
    pub fn subpixel_refinement(mut self, enable: bool) -> Self {
        self.subpixel_refinement = enable;
        self
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    pub fn build(self) -> FeatureResult<OrbExtractor> {
        OrbExtractor::with_options(self.config, self.nms_distance, self.subpixel_refinement)
    }

    /// One-line summary of the builder's configuration
    pub fn summary(&self) -> String {
        format!(
            "ORB: threshold={}, patch={}, features={}, levels={}x{:.2}, nms={:.1}, subpixel={}, threads={}",
            self.config.threshold,
            self.config.patch_size,
            self.config.n_features,
            self.config.n_levels,
            self.config.scale_factor,
            self.nms_distance,
            self.subpixel_refinement,
            self.config.n_threads,
        )
    }
}
