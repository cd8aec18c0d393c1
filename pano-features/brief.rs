use pano_core::{Descriptor, Keypoint};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use crate::refinement::KeypointRefinement;

const DESCRIPTOR_BITS: usize = 256;
const PATTERN_SEED: u64 = 0x0b5e_55ed;

/// Steered BRIEF: 256 intensity comparisons on a smoothed patch, rotated by
/// the keypoint orientation
pub struct BriefGenerator {
    pattern: Vec<(f32, f32, f32, f32)>,
}

impl BriefGenerator {
    /// Sample the test pattern inside a disc that still fits the patch after
    /// rotation. The pattern is fixed by a constant seed so descriptors from
    /// different runs and images are comparable.
    pub fn new(patch_size: usize) -> Self {
        assert!(patch_size >= 7);
        let radius = (patch_size / 2) as f32 - 1.0;
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let sample = |rng: &mut StdRng| loop {
            let x: f32 = rng.random_range(-radius..=radius);
            let y: f32 = rng.random_range(-radius..=radius);
            if x * x + y * y <= radius * radius {
                return (x.round(), y.round());
            }
        };

        let pattern = (0..DESCRIPTOR_BITS)
            .map(|_| {
                let (x1, y1) = sample(&mut rng);
                let (x2, y2) = sample(&mut rng);
                (x1, y1, x2, y2)
            })
            .collect();

        Self { pattern }
    }

    /// Descriptors for keypoints given in the coordinates of `img`
    pub fn generate_descriptors(&self, img: &[u8], width: usize, height: usize, kps: &[Keypoint]) -> Vec<Descriptor> {
        assert!(width > 0 && height > 0);
        kps.par_iter()
            .map(|kp| {
                let (s, c) = kp.angle.sin_cos();
                let (cx, cy) = (kp.x, kp.y);
                let mut d = [0u8; 32];

                for (i, &(dx1, dy1, dx2, dy2)) in self.pattern.iter().enumerate() {
                    let (rx1, ry1) = (cx + c * dx1 - s * dy1, cy + s * dx1 + c * dy1);
                    let (rx2, ry2) = (cx + c * dx2 - s * dy2, cy + s * dx2 + c * dy2);

                    let val1 = KeypointRefinement::bilinear_sample(img, width, height, rx1, ry1);
                    let val2 = KeypointRefinement::bilinear_sample(img, width, height, rx2, ry2);

                    let bit = (val1 < val2) as u8;
                    d[i / 8] |= bit << (i % 8);
                }
                d
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pano_core::hamming_distance;

    fn gradient_image(w: usize, h: usize) -> Vec<u8> {
        (0..w * h)
            .map(|i| {
                let (x, y) = (i % w, i / w);
                ((x * 7 + y * 13 + (x * y) % 17) % 256) as u8
            })
            .collect()
    }

    #[test]
    fn test_pattern_is_deterministic() {
        let a = BriefGenerator::new(31);
        let b = BriefGenerator::new(31);
        assert_eq!(a.pattern, b.pattern);
        assert_eq!(a.pattern.len(), 256);
        for &(x1, y1, x2, y2) in &a.pattern {
            assert!(x1 * x1 + y1 * y1 <= 15.0 * 15.0);
            assert!(x2 * x2 + y2 * y2 <= 15.0 * 15.0);
        }
    }

    #[test]
    fn test_same_patch_same_descriptor() {
        let (w, h) = (80, 80);
        let img = gradient_image(w, h);
        let brief = BriefGenerator::new(31);
        let kp = Keypoint::new(40.0, 40.0);
        let d = brief.generate_descriptors(&img, w, h, &[kp, kp]);
        assert_eq!(d.len(), 2);
        assert_eq!(hamming_distance(&d[0], &d[1]), 0);
    }

    #[test]
    fn test_translated_patch_matches() {
        let (w, h) = (100, 100);
        let img = gradient_image(w, h);
        // Shift the image by (5, 3) and describe the same scene point
        let mut shifted = vec![0u8; w * h];
        for y in 3..h {
            for x in 5..w {
                shifted[y * w + x] = img[(y - 3) * w + (x - 5)];
            }
        }
        let brief = BriefGenerator::new(31);
        let a = brief.generate_descriptors(&img, w, h, &[Keypoint::new(40.0, 40.0)]);
        let b = brief.generate_descriptors(&shifted, w, h, &[Keypoint::new(45.0, 43.0)]);
        assert_eq!(hamming_distance(&a[0], &b[0]), 0);
    }

    proptest::proptest! {
        #[test]
        fn prop_descriptor_per_keypoint(
            pts in proptest::collection::vec((0.0f32..64.0, 0.0f32..48.0, -3.2f32..3.2), 0..20)
        ) {
            let (w, h) = (64, 48);
            let img = gradient_image(w, h);
            let brief = BriefGenerator::new(15);
            let kps: Vec<Keypoint> = pts
                .iter()
                .map(|&(x, y, angle)| Keypoint { angle, ..Keypoint::new(x, y) })
                .collect();
            let a = brief.generate_descriptors(&img, w, h, &kps);
            let b = brief.generate_descriptors(&img, w, h, &kps);
            proptest::prop_assert_eq!(a.len(), kps.len());
            for (da, db) in a.iter().zip(&b) {
                proptest::prop_assert_eq!(hamming_distance(da, db), 0);
            }
        }
    }
}
