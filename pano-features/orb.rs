use image::GrayImage;
use imageproc::filter::gaussian_blur_f32;
use log::debug;
use pano_core::{Descriptor, FeatureConfig, Image, Keypoint};
use rayon::prelude::*;

use crate::brief::BriefGenerator;
use crate::detector::FastDetector;
use crate::error::{FeatureError, FeatureResult};
use crate::pyramid::{ImagePyramid, ScaleLevel};
use crate::refinement::KeypointRefinement;

/// Sigma of the smoothing applied before sampling BRIEF tests
const BRIEF_SMOOTHING_SIGMA: f32 = 2.0;

/// Multi-scale ORB extractor: FAST corners on every pyramid level, ranked,
/// oriented by intensity centroid and described by steered BRIEF
pub struct OrbExtractor {
    cfg: FeatureConfig,
    nms_distance: f32,
    subpixel_refinement: bool,
    brief: BriefGenerator,
}

impl OrbExtractor {
    pub fn new(cfg: FeatureConfig) -> FeatureResult<Self> {
        Self::with_options(cfg, 3.0, true)
    }

    pub(crate) fn with_options(cfg: FeatureConfig, nms_distance: f32, subpixel_refinement: bool) -> FeatureResult<Self> {
        if cfg.threshold == 0 || cfg.threshold > 127 {
            return Err(FeatureError::InvalidThreshold(cfg.threshold));
        }
        if cfg.patch_size < 7 || cfg.patch_size % 2 == 0 {
            return Err(FeatureError::InvalidPatchSize(cfg.patch_size));
        }
        if cfg.n_levels == 0 || cfg.scale_factor <= 1.0 {
            return Err(FeatureError::InvalidPyramid {
                n_levels: cfg.n_levels,
                scale_factor: cfg.scale_factor,
            });
        }
        let brief = BriefGenerator::new(cfg.patch_size);
        Ok(Self {
            cfg,
            nms_distance,
            subpixel_refinement,
            brief,
        })
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.cfg
    }

    /// Keypoints in base-image coordinates and their descriptors
    pub fn detect_and_compute(&self, img: &Image, width: usize, height: usize) -> FeatureResult<(Vec<Keypoint>, Vec<Descriptor>)> {
        if width == 0 || height == 0 {
            return Err(FeatureError::InvalidImageSize { width, height });
        }
        if img.len() != width * height {
            return Err(FeatureError::InvalidImageData {
                expected_len: width * height,
                actual_len: img.len(),
            });
        }

        let border = self.cfg.patch_size / 2 + 1;
        let min_size = 2 * border + FastDetector::MIN_SIZE;
        let levels = ImagePyramid::generate_scale_levels(
            width,
            height,
            self.cfg.n_levels,
            self.cfg.scale_factor,
            min_size,
        );
        if levels.is_empty() {
            return Err(FeatureError::ImageTooSmall { width, height, min_size });
        }

        let pyramid = ImagePyramid::build_image_pyramid(img, &levels);
        let quotas = self.level_quotas(levels.len());

        let per_level: Vec<(Vec<Keypoint>, Vec<Descriptor>)> = levels
            .par_iter()
            .zip(pyramid.par_iter())
            .zip(quotas.par_iter())
            .map(|((level, level_img), &quota)| self.process_level(level, level_img, border, quota))
            .collect::<FeatureResult<_>>()?;

        let mut keypoints = Vec::new();
        let mut descriptors = Vec::new();
        for (kps, descs) in per_level {
            keypoints.extend(kps);
            descriptors.extend(descs);
        }

        debug!(
            "ORB: {} keypoints over {} levels ({}x{})",
            keypoints.len(),
            levels.len(),
            width,
            height
        );
        Ok((keypoints, descriptors))
    }

    fn process_level(
        &self,
        level: &ScaleLevel,
        level_img: &Image,
        border: usize,
        quota: usize,
    ) -> FeatureResult<(Vec<Keypoint>, Vec<Descriptor>)> {
        let detector = FastDetector::new(self.cfg.clone(), level.width, level.height)?;
        let candidates: Vec<Keypoint> = detector
            .detect_keypoints_with_response(level_img)?
            .into_iter()
            .filter(|kp| {
                let (x, y) = (kp.x as usize, kp.y as usize);
                x >= border && y >= border && x + border < level.width && y + border < level.height
            })
            .collect();

        let mut kept = KeypointRefinement::non_maximum_suppression(&candidates, self.nms_distance);
        kept.truncate(quota);

        let half = (self.cfg.patch_size / 2) as i32;
        for kp in kept.iter_mut() {
            if self.subpixel_refinement {
                *kp = detector.refine_subpixel(level_img, *kp);
            }
            kp.angle = KeypointRefinement::compute_orientation(
                level_img,
                level.width,
                level.height,
                kp.x,
                kp.y,
                half,
            );
            kp.octave = level.level;
        }

        let smoothed = smooth(level_img, level.width, level.height)?;
        let descriptors = self
            .brief
            .generate_descriptors(&smoothed, level.width, level.height, &kept);

        let keypoints = kept
            .into_iter()
            .map(|kp| {
                let (x, y) = level.to_base(kp.x, kp.y);
                Keypoint { x, y, ..kp }
            })
            .collect();

        Ok((keypoints, descriptors))
    }

    /// Split `n_features` over the levels proportionally to level area
    /// (geometric series in 1/scale_factor²)
    fn level_quotas(&self, n_levels: usize) -> Vec<usize> {
        let factor = 1.0 / (self.cfg.scale_factor as f64 * self.cfg.scale_factor as f64);
        let total: f64 = (0..n_levels).map(|i| factor.powi(i as i32)).sum();
        let mut quotas: Vec<usize> = (0..n_levels)
            .map(|i| (self.cfg.n_features as f64 * factor.powi(i as i32) / total).round() as usize)
            .collect();
        let assigned: usize = quotas.iter().sum();
        if assigned < self.cfg.n_features {
            quotas[0] += self.cfg.n_features - assigned;
        }
        quotas
    }
}

fn smooth(img: &Image, width: usize, height: usize) -> FeatureResult<Image> {
    let gray = GrayImage::from_raw(width as u32, height as u32, img.clone()).ok_or(
        FeatureError::InvalidImageData {
            expected_len: width * height,
            actual_len: img.len(),
        },
    )?;
    Ok(gaussian_blur_f32(&gray, BRIEF_SMOOTHING_SIGMA).into_raw())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn textured_image(w: usize, h: usize) -> Image {
        // Blocky pseudo-random texture with plenty of corners
        (0..w * h)
            .map(|i| {
                let (x, y) = (i % w, i / w);
                let cell = (x / 6) * 31 + (y / 6) * 17;
                ((cell * 2654435761usize >> 7) % 200 + 30) as u8
            })
            .collect()
    }

    fn config() -> FeatureConfig {
        FeatureConfig {
            n_threads: 1,
            n_features: 300,
            ..FeatureConfig::default()
        }
    }

    #[test]
    fn test_invalid_config() {
        let mut cfg = config();
        cfg.patch_size = 8;
        assert!(matches!(OrbExtractor::new(cfg), Err(FeatureError::InvalidPatchSize(8))));
        let mut cfg = config();
        cfg.scale_factor = 1.0;
        assert!(matches!(OrbExtractor::new(cfg), Err(FeatureError::InvalidPyramid { .. })));
    }

    #[test]
    fn test_too_small_image() {
        let orb = OrbExtractor::new(config()).unwrap();
        let img = vec![0u8; 20 * 20];
        assert!(matches!(
            orb.detect_and_compute(&img, 20, 20),
            Err(FeatureError::ImageTooSmall { .. })
        ));
    }

    #[test]
    fn test_detect_and_compute() {
        let (w, h) = (160, 120);
        let orb = OrbExtractor::new(config()).unwrap();
        let (kps, desc) = orb.detect_and_compute(&textured_image(w, h), w, h).unwrap();
        assert_eq!(kps.len(), desc.len());
        assert!(!kps.is_empty());
        assert!(kps.len() <= 300);
        for kp in &kps {
            assert!(kp.x >= 0.0 && kp.x < w as f32);
            assert!(kp.y >= 0.0 && kp.y < h as f32);
            assert!(kp.angle.is_finite());
        }
    }

    #[test]
    fn test_level_quotas_sum() {
        let orb = OrbExtractor::new(config()).unwrap();
        let quotas = orb.level_quotas(8);
        assert_eq!(quotas.iter().sum::<usize>(), 300);
        assert!(quotas.windows(2).all(|w| w[0] >= w[1]));
    }
}
