use pano_core::{FeatureConfig, Image, Keypoint};
use crate::error::{FeatureError, FeatureResult};
use crate::refinement::KeypointRefinement;
use rayon::prelude::*;

/// FAST-9 segment test on a Bresenham circle of radius 3
pub struct FastDetector {
    cfg: FeatureConfig,
    w: usize,
    h: usize,
}

impl FastDetector {
    /// Circle offsets in clockwise order starting at 12 o'clock
    pub const CIRCLE: [(i32, i32); 16] = [
        (0, -3), (1, -3), (2, -2), (3, -1),
        (3, 0), (3, 1), (2, 2), (1, 3),
        (0, 3), (-1, 3), (-2, 2), (-3, 1),
        (-3, 0), (-3, -1), (-2, -2), (-1, -3),
    ];

    /// Contiguous arc length required for a corner
    pub const ARC_LENGTH: u32 = 9;

    /// FAST requires at least 7x7 image (3-pixel border on each side)
    pub const MIN_SIZE: usize = 7;

    /// Creates a new FAST detector with validation
    pub fn new(cfg: FeatureConfig, width: usize, height: usize) -> FeatureResult<Self> {
        if width == 0 || height == 0 {
            return Err(FeatureError::InvalidImageSize { width, height });
        }

        if width < Self::MIN_SIZE || height < Self::MIN_SIZE {
            return Err(FeatureError::ImageTooSmall {
                width,
                height,
                min_size: Self::MIN_SIZE,
            });
        }

        // 0 would accept every pixel, >127 overflows the signed comparisons below
        if cfg.threshold == 0 || cfg.threshold > 127 {
            return Err(FeatureError::InvalidThreshold(cfg.threshold));
        }

        Ok(Self {
            cfg,
            w: width,
            h: height,
        })
    }

    fn validate_image(&self, img: &Image) -> FeatureResult<()> {
        let expected_len = self.w * self.h;
        if img.len() != expected_len {
            return Err(FeatureError::InvalidImageData {
                expected_len,
                actual_len: img.len(),
            });
        }
        Ok(())
    }

    /// Detect keypoints, suppress non-maxima and refine to subpixel accuracy
    pub fn detect_keypoints(&self, img: &Image, nms_distance: f32) -> FeatureResult<Vec<Keypoint>> {
        let scored = self.detect_keypoints_with_response(img)?;
        let suppressed = KeypointRefinement::non_maximum_suppression(&scored, nms_distance);
        Ok(suppressed
            .into_iter()
            .map(|kp| self.refine_subpixel(img, kp))
            .collect())
    }

    /// Detect FAST corners with their response, no suppression
    pub fn detect_keypoints_with_response(&self, img: &Image) -> FeatureResult<Vec<Keypoint>> {
        self.validate_image(img)?;

        let rows = 3..self.h - 3;
        let keypoints = rows
            .into_par_iter()
            .flat_map_iter(|y| {
                let mut v = Vec::new();
                for x in 3..self.w - 3 {
                    if let Some(response) = self.corner_score(img, x, y) {
                        let mut kp = Keypoint::new(x as f32, y as f32);
                        kp.response = response;
                        v.push(kp);
                    }
                }
                v
            })
            .collect();

        Ok(keypoints)
    }

    /// Segment-test score at (x, y): sum of absolute differences over the
    /// circle pixels on the winning side, `None` when (x, y) is no corner.
    /// The caller guarantees a 3-pixel border.
    pub fn corner_score(&self, img: &Image, x: usize, y: usize) -> Option<f32> {
        let p = img[y * self.w + x] as i16;
        let t = self.cfg.threshold as i16;

        // At least two of the four compass pixels lie on any 9-pixel arc
        let mut compass_bright = 0;
        let mut compass_dark = 0;
        for i in (0..16).step_by(4) {
            let q = self.circle_pixel(img, x, y, i);
            if q >= p + t {
                compass_bright += 1;
            } else if q <= p - t {
                compass_dark += 1;
            }
        }
        if compass_bright < 2 && compass_dark < 2 {
            return None;
        }

        let mut bright = 0u16;
        let mut dark = 0u16;
        let mut bright_sum = 0i32;
        let mut dark_sum = 0i32;
        for i in 0..16 {
            let q = self.circle_pixel(img, x, y, i);
            if q >= p + t {
                bright |= 1 << i;
                bright_sum += (q - p) as i32;
            } else if q <= p - t {
                dark |= 1 << i;
                dark_sum += (p - q) as i32;
            }
        }

        if has_arc(bright, Self::ARC_LENGTH) {
            Some(bright_sum as f32)
        } else if has_arc(dark, Self::ARC_LENGTH) {
            Some(dark_sum as f32)
        } else {
            None
        }
    }

    #[inline]
    fn circle_pixel(&self, img: &Image, x: usize, y: usize, i: usize) -> i16 {
        let (dx, dy) = Self::CIRCLE[i];
        let xx = (x as i32 + dx) as usize;
        let yy = (y as i32 + dy) as usize;
        img[yy * self.w + xx] as i16
    }

    /// Fit a quadratic to the score surface around the keypoint
    pub fn refine_subpixel(&self, img: &Image, kp: Keypoint) -> Keypoint {
        let x = kp.x.round() as usize;
        let y = kp.y.round() as usize;
        if x < 4 || y < 4 || x + 4 >= self.w || y + 4 >= self.h {
            return kp;
        }

        let mut samples = [[0.0f32; 3]; 3];
        for (j, row) in samples.iter_mut().enumerate() {
            for (i, s) in row.iter_mut().enumerate() {
                *s = self
                    .corner_score(img, x + i - 1, y + j - 1)
                    .unwrap_or(0.0);
            }
        }

        KeypointRefinement::refine_quadratic(&samples, kp)
    }

    /// Get detector configuration
    pub fn config(&self) -> &FeatureConfig {
        &self.cfg
    }

    /// Get image dimensions
    pub fn dimensions(&self) -> (usize, usize) {
        (self.w, self.h)
    }
}

/// True if `mask` (one bit per circle pixel) holds a circular run of at
/// least `run` set bits
pub fn has_arc(mask: u16, run: u32) -> bool {
    if run == 0 || run > 16 {
        return false;
    }
    let mut acc = mask;
    for i in 1..run {
        acc &= mask.rotate_right(i);
        if acc == 0 {
            return false;
        }
    }
    acc != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> FeatureConfig {
        FeatureConfig {
            threshold: 20,
            patch_size: 15,
            n_threads: 1,
            ..FeatureConfig::default()
        }
    }

    fn create_corner_image(width: usize, height: usize) -> Image {
        let mut img = vec![50; width * height];
        // Bright square whose corners trigger the segment test
        let (cx, cy) = (width / 2, height / 2);
        for y in cy - 2..=cy + 2 {
            for x in cx - 2..=cx + 2 {
                img[y * width + x] = 255;
            }
        }
        img
    }

    #[test]
    fn test_invalid_dimensions() {
        let result = FastDetector::new(create_test_config(), 0, 100);
        assert!(matches!(result, Err(FeatureError::InvalidImageSize { .. })));
        let result = FastDetector::new(create_test_config(), 6, 6);
        assert!(matches!(result, Err(FeatureError::ImageTooSmall { .. })));
    }

    #[test]
    fn test_invalid_threshold() {
        let mut cfg = create_test_config();
        cfg.threshold = 0;
        assert!(matches!(
            FastDetector::new(cfg.clone(), 100, 100),
            Err(FeatureError::InvalidThreshold(0))
        ));
        cfg.threshold = 200;
        assert!(matches!(
            FastDetector::new(cfg, 100, 100),
            Err(FeatureError::InvalidThreshold(200))
        ));
    }

    #[test]
    fn test_invalid_image_data() {
        let detector = FastDetector::new(create_test_config(), 10, 10).unwrap();
        let img = vec![0; 50];
        assert!(matches!(
            detector.detect_keypoints(&img, 3.0),
            Err(FeatureError::InvalidImageData { expected_len: 100, actual_len: 50 })
        ));
    }

    #[test]
    fn test_uniform_image_has_no_corners() {
        let detector = FastDetector::new(create_test_config(), 20, 20).unwrap();
        let img = vec![128; 400];
        assert!(detector.detect_keypoints(&img, 3.0).unwrap().is_empty());
    }

    #[test]
    fn test_corner_detection() {
        let detector = FastDetector::new(create_test_config(), 20, 20).unwrap();
        let img = create_corner_image(20, 20);
        let keypoints = detector.detect_keypoints(&img, 3.0).unwrap();
        assert!(!keypoints.is_empty());
        for kp in &keypoints {
            assert!(kp.response > 0.0);
            // Corners of the bright square are at distance <= 3 from the center
            assert!((kp.x - 10.0).abs() <= 4.0 && (kp.y - 10.0).abs() <= 4.0);
        }
    }

    #[test]
    fn test_parallel_results_are_stable() {
        let detector = FastDetector::new(create_test_config(), 64, 64).unwrap();
        let img = create_corner_image(64, 64);
        let first = detector.detect_keypoints_with_response(&img).unwrap();
        for _ in 0..5 {
            assert_eq!(detector.detect_keypoints_with_response(&img).unwrap(), first);
        }
    }

    #[test]
    fn test_arc_simple() {
        let mask: u16 = 0b0000_0001_1111_1111;
        assert!(has_arc(mask, 9));
        assert!(!has_arc(mask, 10));
    }

    #[test]
    fn test_arc_wrap_around() {
        // Bits 12..16 and 0..5 form one run of 9 across the wrap
        let mask: u16 = 0b1111_0000_0001_1111;
        assert!(has_arc(mask, 9));
        assert!(!has_arc(0b0101_0101_0101_0101, 2));
        assert!(has_arc(u16::MAX, 16));
        assert!(!has_arc(u16::MAX, 0));
    }
}
