//! Per-image feature finding on color images.

use image::imageops::grayscale;
use image::RgbImage;
use log::{debug, warn};
use pano_core::{FeatureConfig, ImageFeatures};
use pano_features::{FeatureError, OrbBuilder, OrbExtractor};

use crate::error::{StitchError, StitchResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeaturesKind {
    Orb,
}

impl FeaturesKind {
    pub fn from_name(name: &str) -> StitchResult<Self> {
        match name {
            "orb" => Ok(Self::Orb),
            other => Err(StitchError::UnknownFeaturesKind(other.to_string())),
        }
    }

    pub fn create(&self, cfg: &FeatureConfig) -> StitchResult<Box<dyn FeaturesFinder>> {
        match self {
            Self::Orb => Ok(Box::new(OrbFeaturesFinder::new(cfg.clone())?)),
        }
    }
}

pub trait FeaturesFinder: Send + Sync {
    /// Features of `img`, tagged with `img_idx`
    fn find(&self, img: &RgbImage, img_idx: usize) -> StitchResult<ImageFeatures>;
}

pub struct OrbFeaturesFinder {
    orb: OrbExtractor,
}

impl OrbFeaturesFinder {
    pub fn new(cfg: FeatureConfig) -> StitchResult<Self> {
        let orb = OrbBuilder::from_config(cfg).build()?;
        Ok(Self { orb })
    }
}

impl FeaturesFinder for OrbFeaturesFinder {
    fn find(&self, img: &RgbImage, img_idx: usize) -> StitchResult<ImageFeatures> {
        let gray = grayscale(img);
        let (w, h) = gray.dimensions();
        let mut features = ImageFeatures {
            img_idx,
            img_size: (w, h),
            ..ImageFeatures::default()
        };
        match self.orb.detect_and_compute(gray.as_raw(), w as usize, h as usize) {
            Ok((keypoints, descriptors)) => {
                features.keypoints = keypoints;
                features.descriptors = descriptors;
            }
            // A tiny image just contributes nothing to matching
            Err(FeatureError::ImageTooSmall { min_size, .. }) => {
                warn!("Image #{} ({}x{}) is below {}px, no features", img_idx + 1, w, h, min_size);
            }
            Err(e) => return Err(e.into()),
        }
        debug!("Features in image #{}: {}", img_idx + 1, features.len());
        Ok(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    /// Blocks of pseudo-random brightness; block corners are FAST corners
    fn blocks(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            let cell = (x / 7) as usize * 31 + (y / 7) as usize * 17;
            let v = ((cell * 2654435761usize >> 7) % 200 + 30) as u8;
            Rgb([v, v, v / 2])
        })
    }

    #[test]
    fn test_unknown_kind() {
        assert!(matches!(
            FeaturesKind::from_name("surf"),
            Err(StitchError::UnknownFeaturesKind(name)) if name == "surf"
        ));
    }

    #[test]
    fn test_orb_finder_tags_index() {
        let finder = FeaturesKind::Orb.create(&FeatureConfig::default()).unwrap();
        let f = finder.find(&blocks(128, 96), 3).unwrap();
        assert_eq!(f.img_idx, 3);
        assert_eq!(f.img_size, (128, 96));
        assert!(!f.is_empty());
        assert_eq!(f.keypoints.len(), f.descriptors.len());
    }

    #[test]
    fn test_tiny_image_yields_no_features() {
        let finder = OrbFeaturesFinder::new(FeatureConfig::default()).unwrap();
        let f = finder.find(&blocks(12, 12), 0).unwrap();
        assert!(f.is_empty());
        assert_eq!(f.img_size, (12, 12));
    }
}
