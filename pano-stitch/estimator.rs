//! Initial camera estimate from the pairwise homographies.

use log::{debug, info};
use nalgebra::Matrix3;
use pano_core::ImageFeatures;

use crate::camera::CameraParams;
use crate::graph::SpanningTree;
use crate::matcher::PairwiseMatches;

/// Focal lengths of the two cameras of a pure-rotation homography
/// `h: centered src -> centered dst` as `(f_src, f_dst)`; `None` where the
/// homography does not constrain the value
pub fn focals_from_homography(hm: &Matrix3<f64>) -> (Option<f64>, Option<f64>) {
    let h = |k: usize| hm[(k / 3, k % 3)];

    let pick = |d1: f64, d2: f64, v1: f64, v2: f64| -> Option<f64> {
        let (v1, v2) = if v1 < v2 { (v2, v1) } else { (v1, v2) };
        let f = if v1 > 0.0 && v2 > 0.0 {
            if d1.abs() > d2.abs() { v1.sqrt() } else { v2.sqrt() }
        } else if v1 > 0.0 {
            v1.sqrt()
        } else {
            return None;
        };
        f.is_finite().then_some(f)
    };

    let d1 = h(6) * h(7);
    let d2 = (h(7) - h(6)) * (h(7) + h(6));
    let v1 = -(h(0) * h(1) + h(3) * h(4)) / d1;
    let v2 = (h(0) * h(0) + h(3) * h(3) - h(1) * h(1) - h(4) * h(4)) / d2;
    let f1 = pick(d1, d2, v1, v2);

    let d1 = h(0) * h(3) + h(1) * h(4);
    let d2 = h(0) * h(0) + h(1) * h(1) - h(3) * h(3) - h(4) * h(4);
    let v1 = -h(2) * h(5) / d1;
    let v2 = (h(5) * h(5) - h(2) * h(2)) / d2;
    let f0 = pick(d1, d2, v1, v2);

    (f0, f1)
}

/// One focal length shared by all cameras: the median of the per-pair
/// estimates when there are enough of them, otherwise the mean image
/// half-perimeter
pub fn estimate_focal(features: &[ImageFeatures], matches: &PairwiseMatches) -> f64 {
    let n = features.len();
    let mut all_focals: Vec<f64> = matches
        .iter()
        .filter(|m| m.src_img_idx != m.dst_img_idx)
        .filter_map(|m| m.h.as_ref())
        .filter_map(|h| match focals_from_homography(h) {
            (Some(f0), Some(f1)) => Some((f0 * f1).sqrt()),
            _ => None,
        })
        .collect();

    if n > 0 && all_focals.len() + 1 >= n {
        all_focals.sort_by(|a, b| a.total_cmp(b));
        let f = all_focals[all_focals.len() / 2];
        debug!("Focal from {} homographies: {:.2}", all_focals.len(), f);
        f
    } else {
        let sum: f64 = features
            .iter()
            .map(|f| f.img_size.0 as f64 + f.img_size.1 as f64)
            .sum();
        let f = sum / n.max(1) as f64;
        info!(
            "Only {} focal estimates for {} images, using image size: {:.2}",
            all_focals.len(),
            n,
            f
        );
        f
    }
}

/// Chains pairwise homographies over the maximum spanning tree, starting
/// from the tree center with the identity rotation
#[derive(Debug, Clone, Default)]
pub struct HomographyBasedEstimator;

impl HomographyBasedEstimator {
    pub fn estimate(&self, features: &[ImageFeatures], matches: &PairwiseMatches) -> Vec<CameraParams> {
        let n = features.len();
        let focal = estimate_focal(features, matches);
        let mut cameras: Vec<CameraParams> = (0..n)
            .map(|_| CameraParams { focal, ..CameraParams::default() })
            .collect();
        if n == 0 {
            return cameras;
        }

        let tree = SpanningTree::find_max(matches);
        let mut rotations = vec![Matrix3::<f64>::identity(); n];
        let center = tree.center();
        tree.walk_breadth_first(center, |from, to| {
            let k_from = cameras[from].k();
            let k_to = cameras[to].k();
            let h = matches.get(from, to).h;
            let step = match (k_from.try_inverse(), h.and_then(|h| h.try_inverse())) {
                (Some(k_from_inv), Some(h_inv)) => k_from_inv * h_inv * k_to,
                _ => Matrix3::identity(),
            };
            rotations[to] = rotations[from] * step;
        });

        for ((cam, r), f) in cameras.iter_mut().zip(&rotations).zip(features) {
            cam.set_r64(r);
            cam.ppx += 0.5 * f.img_size.0 as f64;
            cam.ppy += 0.5 * f.img_size.1 as f64;
        }
        debug!("Initial cameras from tree center {}", center);
        cameras
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::MatchesInfo;
    use nalgebra::Rotation3;

    fn k(f: f64) -> Matrix3<f64> {
        Matrix3::new(f, 0.0, 0.0, 0.0, f, 0.0, 0.0, 0.0, 1.0)
    }

    /// Homography of a camera rotating by `yaw` (centered coordinates)
    fn rotation_homography(f: f64, yaw: f64, pitch: f64) -> Matrix3<f64> {
        let r = Rotation3::from_euler_angles(pitch, yaw, 0.0).into_inner();
        k(f) * r * k(f).try_inverse().unwrap()
    }

    #[test]
    fn test_focals_from_rotation_homography() {
        let h = rotation_homography(700.0, 0.2, 0.05);
        let (f0, f1) = focals_from_homography(&h);
        assert!((f0.unwrap() - 700.0).abs() < 1.0, "{:?}", f0);
        assert!((f1.unwrap() - 700.0).abs() < 1.0, "{:?}", f1);
    }

    #[test]
    fn test_translation_gives_no_focal() {
        let h = Matrix3::new(1.0, 0.0, 30.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0);
        assert_eq!(focals_from_homography(&h), (None, None));
    }

    #[test]
    fn test_estimate_recovers_rotation() {
        let f = 600.0;
        let features: Vec<ImageFeatures> = (0..2)
            .map(|i| ImageFeatures { img_idx: i, img_size: (640, 480), ..Default::default() })
            .collect();
        let mut table = PairwiseMatches::empty(2);
        table.set_pair(MatchesInfo {
            src_img_idx: 0,
            dst_img_idx: 1,
            num_inliers: 50,
            confidence: 2.0,
            h: Some(rotation_homography(f, 0.3, 0.08)),
            ..Default::default()
        });

        let cams = HomographyBasedEstimator.estimate(&features, &table);
        assert_eq!(cams.len(), 2);
        assert!((cams[0].focal - f).abs() < 1.0);
        assert_eq!((cams[0].ppx, cams[0].ppy), (320.0, 240.0));
        // Relative rotation is orthonormal and undoes the homography's rotation
        let rel = cams[0].r64().transpose() * cams[1].r64();
        assert!((rel * rel.transpose() - Matrix3::identity()).norm() < 1e-3);
        assert!(rel[(0, 0)] < 0.99);
    }

    #[test]
    fn test_focal_fallback() {
        let features: Vec<ImageFeatures> = (0..3)
            .map(|i| ImageFeatures { img_idx: i, img_size: (100, 50), ..Default::default() })
            .collect();
        let table = PairwiseMatches::empty(3);
        assert_eq!(estimate_focal(&features, &table), 150.0);
    }
}
