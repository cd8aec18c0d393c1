//! Planar homography estimation: normalized DLT and a seeded RANSAC loop.

use nalgebra::{Matrix3, Point2, SMatrix, SymmetricEigen, Vector3};
use rand::prelude::IndexedRandom;
use rand::{rngs::StdRng, SeedableRng};

pub type Pt2 = Point2<f64>;

const MIN_SAMPLES: usize = 4;

/// Configuration of the RANSAC homography search
#[derive(Debug, Clone)]
pub struct RansacOptions {
    pub max_iters: usize,
    /// Inlier reprojection threshold in pixels
    pub thresh: f64,
    /// Desired probability of drawing at least one outlier-free sample
    pub confidence: f64,
    pub seed: u64,
}

impl Default for RansacOptions {
    fn default() -> Self {
        Self {
            max_iters: 2000,
            thresh: 3.0,
            confidence: 0.995,
            seed: 0x5eed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RansacResult {
    /// Best model, mapping `src` to `dst`
    pub h: Matrix3<f64>,
    /// One flag per correspondence
    pub inlier_mask: Vec<bool>,
    pub num_inliers: usize,
    pub iters: usize,
}

/// Estimate H with `dst ~ H src` from at least 4 correspondences by the
/// normalized direct linear transform. The null vector is taken from the
/// 9x9 normal matrix so a minimal sample of exactly 4 points also works.
pub fn dlt_homography(src: &[Pt2], dst: &[Pt2]) -> Option<Matrix3<f64>> {
    let n = src.len();
    if n < MIN_SAMPLES || dst.len() != n {
        return None;
    }

    let ts = normalizing_transform(src)?;
    let td = normalizing_transform(dst)?;

    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for (ps, pd) in src.iter().zip(dst) {
        let s = ts * Vector3::new(ps.x, ps.y, 1.0);
        let d = td * Vector3::new(pd.x, pd.y, 1.0);
        let (x, y, u, v) = (s.x, s.y, d.x, d.y);

        let r0 = [-x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, u];
        let r1 = [0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v];
        for row in [r0, r1] {
            for i in 0..9 {
                for j in 0..9 {
                    ata[(i, j)] += row[i] * row[j];
                }
            }
        }
    }

    let eig = SymmetricEigen::new(ata);
    let (min_idx, _) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let h = eig.eigenvectors.column(min_idx);

    let hn = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);
    let mut hm = td.try_inverse()? * hn * ts;

    let scale = hm[(2, 2)];
    if scale.abs() > f64::EPSILON {
        hm /= scale;
    }
    hm.iter().all(|v| v.is_finite()).then_some(hm)
}

/// Similarity moving the centroid to the origin with mean distance sqrt(2)
fn normalizing_transform(pts: &[Pt2]) -> Option<Matrix3<f64>> {
    let n = pts.len() as f64;
    let (cx, cy) = pts.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.x, acc.1 + p.y));
    let (cx, cy) = (cx / n, cy / n);
    let mean_dist = pts
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist < 1e-12 {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Some(Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0))
}

/// Apply H to a point; `None` when it maps to infinity
pub fn project(h: &Matrix3<f64>, p: &Pt2) -> Option<Pt2> {
    let v = h * Vector3::new(p.x, p.y, 1.0);
    if v.z.abs() < 1e-12 {
        return None;
    }
    Some(Pt2::new(v.x / v.z, v.y / v.z))
}

/// Euclidean reprojection error of one correspondence
pub fn transfer_error(h: &Matrix3<f64>, src: &Pt2, dst: &Pt2) -> f64 {
    match project(h, src) {
        Some(p) => (p - dst).norm(),
        None => f64::INFINITY,
    }
}

fn is_degenerate(pts: &[Pt2], idx: &[usize]) -> bool {
    for a in 0..idx.len() {
        for b in a + 1..idx.len() {
            for c in b + 1..idx.len() {
                let (p, q, r) = (pts[idx[a]], pts[idx[b]], pts[idx[c]]);
                let area = (q.x - p.x) * (r.y - p.y) - (q.y - p.y) * (r.x - p.x);
                if area.abs() < 1e-6 {
                    return true;
                }
            }
        }
    }
    false
}

fn required_iterations(confidence: f64, inlier_ratio: f64, max_iters: usize) -> usize {
    if inlier_ratio <= 0.0 {
        return max_iters;
    }
    let denom = (1.0 - inlier_ratio.powi(MIN_SAMPLES as i32)).max(1e-12).ln();
    if denom >= 0.0 {
        return max_iters;
    }
    let n = ((1.0 - confidence).ln() / denom).ceil();
    if n.is_finite() && n >= 0.0 {
        (n as usize).min(max_iters)
    } else {
        max_iters
    }
}

/// Robust homography search. Returns `None` when fewer than 4
/// correspondences are given or no non-degenerate sample was found.
pub fn find_homography_ransac(src: &[Pt2], dst: &[Pt2], opts: &RansacOptions) -> Option<RansacResult> {
    let n = src.len();
    if n < MIN_SAMPLES || dst.len() != n {
        return None;
    }

    let all: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(opts.seed);
    let mut best: Option<RansacResult> = None;
    let mut best_err = f64::INFINITY;
    let mut max_iters = opts.max_iters;
    let mut iters = 0;
    let mut sample = [0usize; MIN_SAMPLES];

    while iters < max_iters {
        iters += 1;
        all.choose_multiple(&mut rng, MIN_SAMPLES)
            .enumerate()
            .for_each(|(k, &i)| sample[k] = i);

        if is_degenerate(src, &sample) || is_degenerate(dst, &sample) {
            continue;
        }
        let s: Vec<Pt2> = sample.iter().map(|&i| src[i]).collect();
        let d: Vec<Pt2> = sample.iter().map(|&i| dst[i]).collect();
        let Some(h) = dlt_homography(&s, &d) else {
            continue;
        };

        let mut mask = vec![false; n];
        let mut count = 0;
        let mut err = 0.0;
        for i in 0..n {
            let e = transfer_error(&h, &src[i], &dst[i]);
            if e <= opts.thresh {
                mask[i] = true;
                count += 1;
                err += e;
            }
        }

        let better = match &best {
            None => count >= MIN_SAMPLES,
            Some(b) => count > b.num_inliers || (count == b.num_inliers && err < best_err),
        };
        if better {
            best_err = err;
            max_iters = required_iterations(opts.confidence, count as f64 / n as f64, opts.max_iters).max(iters);
            best = Some(RansacResult {
                h,
                inlier_mask: mask,
                num_inliers: count,
                iters,
            });
        }
    }

    best.map(|b| RansacResult { iters, ..b })
}
