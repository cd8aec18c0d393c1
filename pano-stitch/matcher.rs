//! Pairwise feature matching with geometric verification.

use log::debug;
use nalgebra::Matrix3;
use pano_core::{hamming_distance, Descriptor, ImageFeatures};
use rayon::prelude::*;

use crate::homography::{dlt_homography, find_homography_ransac, Pt2, RansacOptions};

/// One descriptor correspondence: `query_idx` indexes the source image's
/// features, `train_idx` the destination's
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DMatch {
    pub query_idx: usize,
    pub train_idx: usize,
    pub distance: f32,
}

/// Verified matches between two images.
///
/// `h` maps centered source coordinates to centered destination coordinates
/// and is only set when the pair passed both count thresholds.
#[derive(Debug, Clone, Default)]
pub struct MatchesInfo {
    pub src_img_idx: usize,
    pub dst_img_idx: usize,
    pub matches: Vec<DMatch>,
    pub inliers_mask: Vec<bool>,
    pub num_inliers: usize,
    pub h: Option<Matrix3<f64>>,
    pub confidence: f64,
}

impl MatchesInfo {
    /// The same pair seen from the other side
    pub fn mirrored(&self) -> MatchesInfo {
        MatchesInfo {
            src_img_idx: self.dst_img_idx,
            dst_img_idx: self.src_img_idx,
            matches: self
                .matches
                .iter()
                .map(|m| DMatch {
                    query_idx: m.train_idx,
                    train_idx: m.query_idx,
                    distance: m.distance,
                })
                .collect(),
            inliers_mask: self.inliers_mask.clone(),
            num_inliers: self.num_inliers,
            h: self.h.and_then(|h| h.try_inverse()),
            confidence: self.confidence,
        }
    }

    /// Iterate over inlier matches only
    pub fn inliers(&self) -> impl Iterator<Item = &DMatch> {
        self.matches
            .iter()
            .zip(&self.inliers_mask)
            .filter_map(|(m, &keep)| keep.then_some(m))
    }
}

/// Dense N x N table of pairwise results, row-major by (src, dst)
#[derive(Debug, Clone, Default)]
pub struct PairwiseMatches {
    num_images: usize,
    entries: Vec<MatchesInfo>,
}

impl PairwiseMatches {
    /// Table with empty entries carrying their own (src, dst) indices
    pub fn empty(num_images: usize) -> Self {
        let entries = (0..num_images * num_images)
            .map(|k| MatchesInfo {
                src_img_idx: k / num_images,
                dst_img_idx: k % num_images,
                ..MatchesInfo::default()
            })
            .collect();
        Self { num_images, entries }
    }

    pub fn num_images(&self) -> usize {
        self.num_images
    }

    pub fn get(&self, src: usize, dst: usize) -> &MatchesInfo {
        &self.entries[src * self.num_images + dst]
    }

    /// Store `info` at (src, dst) and its mirror at (dst, src)
    pub fn set_pair(&mut self, info: MatchesInfo) {
        let (i, j) = (info.src_img_idx, info.dst_img_idx);
        let n = self.num_images;
        self.entries[j * n + i] = info.mirrored();
        self.entries[i * n + j] = info;
    }

    /// Restrict to `indices` (ascending), renumbering images 0..k-1
    pub fn subset(&self, indices: &[usize]) -> PairwiseMatches {
        let k = indices.len();
        let mut entries = Vec::with_capacity(k * k);
        for (new_i, &i) in indices.iter().enumerate() {
            for (new_j, &j) in indices.iter().enumerate() {
                let mut info = self.get(i, j).clone();
                info.src_img_idx = new_i;
                info.dst_img_idx = new_j;
                entries.push(info);
            }
        }
        PairwiseMatches { num_images: k, entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = &MatchesInfo> {
        self.entries.iter()
    }
}

/// Best-of-two-nearest matcher: Lowe ratio test in both directions, then
/// RANSAC homography verification
#[derive(Debug, Clone)]
pub struct BestOf2NearestMatcher {
    match_conf: f32,
    /// Minimum number of matches before a homography is estimated
    num_matches_thresh1: usize,
    /// Minimum number of inliers before the homography is kept and refined
    num_matches_thresh2: usize,
    ransac: RansacOptions,
}

impl BestOf2NearestMatcher {
    pub fn new(match_conf: f32) -> Self {
        Self {
            match_conf,
            num_matches_thresh1: 6,
            num_matches_thresh2: 6,
            ransac: RansacOptions::default(),
        }
    }

    /// Match every unordered pair in parallel. Each pair seeds its own RNG
    /// from its indices, so the table does not depend on scheduling.
    pub fn match_all(&self, features: &[ImageFeatures]) -> PairwiseMatches {
        let n = features.len();
        let pairs: Vec<(usize, usize)> = (0..n)
            .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
            .collect();

        let results: Vec<MatchesInfo> = pairs
            .par_iter()
            .map(|&(i, j)| {
                let mut info = self.match_pair(&features[i], &features[j], pair_seed(self.ransac.seed, i, j));
                // Table indices are positions in `features`
                info.src_img_idx = i;
                info.dst_img_idx = j;
                info
            })
            .collect();

        let mut table = PairwiseMatches::empty(n);
        for info in results {
            table.set_pair(info);
        }
        table
    }

    /// Match two feature sets
    pub fn match_pair(&self, f1: &ImageFeatures, f2: &ImageFeatures, seed: u64) -> MatchesInfo {
        let mut info = MatchesInfo {
            src_img_idx: f1.img_idx,
            dst_img_idx: f2.img_idx,
            ..MatchesInfo::default()
        };

        info.matches = self.mutual_ratio_matches(&f1.descriptors, &f2.descriptors);
        debug!(
            "{} matches between image {} and {}",
            info.matches.len(),
            f1.img_idx,
            f2.img_idx
        );
        if info.matches.len() < self.num_matches_thresh1 {
            return info;
        }

        let (src, dst) = centered_points(f1, f2, info.matches.iter());
        let opts = RansacOptions { seed, ..self.ransac.clone() };
        let Some(result) = find_homography_ransac(&src, &dst, &opts) else {
            return info;
        };
        if result.h.determinant().abs() < f64::EPSILON {
            return info;
        }

        info.inliers_mask = result.inlier_mask;
        info.num_inliers = result.num_inliers;
        if info.num_inliers < self.num_matches_thresh2 {
            return info;
        }

        // Coefficients from Brown and Lowe; more than 3 means a duplicate image
        let confidence = info.num_inliers as f64 / (8.0 + 0.3 * info.matches.len() as f64);
        info.confidence = if confidence > 3.0 { 0.0 } else { confidence };

        let (src_in, dst_in) = centered_points(f1, f2, info.inliers());
        info.h = dlt_homography(&src_in, &dst_in).or(Some(result.h));
        info
    }

    /// Correspondences passing the ratio test both ways and agreeing on each other
    fn mutual_ratio_matches(&self, d1: &[Descriptor], d2: &[Descriptor]) -> Vec<DMatch> {
        let ratio = 1.0 - self.match_conf;
        let forward = ratio_test(d1, d2, ratio);
        let backward = ratio_test(d2, d1, ratio);

        forward
            .iter()
            .enumerate()
            .filter_map(|(q, best)| {
                let (t, dist) = (*best)?;
                match backward[t] {
                    Some((back, _)) if back == q => Some(DMatch {
                        query_idx: q,
                        train_idx: t,
                        distance: dist as f32,
                    }),
                    _ => None,
                }
            })
            .collect()
    }
}

/// For every query descriptor, its nearest train descriptor if it beats the
/// second nearest by `ratio`
fn ratio_test(query: &[Descriptor], train: &[Descriptor], ratio: f32) -> Vec<Option<(usize, u32)>> {
    query
        .par_iter()
        .map(|q| {
            let mut best = (usize::MAX, u32::MAX);
            let mut second = u32::MAX;
            for (i, t) in train.iter().enumerate() {
                let d = hamming_distance(q, t);
                if d < best.1 {
                    second = best.1;
                    best = (i, d);
                } else if d < second {
                    second = d;
                }
            }
            if best.0 == usize::MAX || second == u32::MAX {
                return None;
            }
            ((best.1 as f32) < ratio * second as f32).then_some(best)
        })
        .collect()
}

fn centered_points<'a>(
    f1: &ImageFeatures,
    f2: &ImageFeatures,
    matches: impl Iterator<Item = &'a DMatch>,
) -> (Vec<Pt2>, Vec<Pt2>) {
    let (c1x, c1y) = (f1.img_size.0 as f64 * 0.5, f1.img_size.1 as f64 * 0.5);
    let (c2x, c2y) = (f2.img_size.0 as f64 * 0.5, f2.img_size.1 as f64 * 0.5);
    matches
        .map(|m| {
            let p = f1.keypoints[m.query_idx];
            let q = f2.keypoints[m.train_idx];
            (
                Pt2::new(p.x as f64 - c1x, p.y as f64 - c1y),
                Pt2::new(q.x as f64 - c2x, q.y as f64 - c2y),
            )
        })
        .unzip()
}

fn pair_seed(base: u64, i: usize, j: usize) -> u64 {
    base ^ ((i as u64) << 32 | j as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15)
}
