//! Bundle adjustment of camera intrinsics and rotations by
//! Levenberg-Marquardt over all confident image pairs.

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector, Matrix3, Rotation3, Vector3};
use pano_core::ImageFeatures;

use crate::camera::CameraParams;
use crate::error::{StitchError, StitchResult};
use crate::graph::SpanningTree;
use crate::matcher::PairwiseMatches;

/// Residual used by the adjuster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaCostFunction {
    /// Reprojection error in pixels; refines focal, principal point,
    /// aspect and rotation
    Reproj,
    /// Distance between the unit rays of matched points, scaled by focal;
    /// refines focal and rotation
    Ray,
}

impl BaCostFunction {
    pub fn from_name(name: &str) -> StitchResult<Self> {
        match name {
            "reproj" => Ok(Self::Reproj),
            "ray" => Ok(Self::Ray),
            other => Err(StitchError::UnknownCostFunction(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Reproj => "reproj",
            Self::Ray => "ray",
        }
    }

    fn params_per_camera(&self) -> usize {
        match self {
            Self::Reproj => 7,
            Self::Ray => 4,
        }
    }

    fn residuals_per_match(&self) -> usize {
        match self {
            Self::Reproj => 2,
            Self::Ray => 3,
        }
    }
}

/// Which intrinsics are refined, written as five characters for
/// fx, skew, ppx, aspect, ppy: `x` refines, `_` keeps the value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefinementMask {
    pub focal: bool,
    pub skew: bool,
    pub ppx: bool,
    pub aspect: bool,
    pub ppy: bool,
}

impl RefinementMask {
    pub fn parse(mask: &str) -> StitchResult<Self> {
        let flags: Vec<bool> = mask
            .chars()
            .map(|c| match c {
                'x' => Ok(true),
                '_' => Ok(false),
                _ => Err(StitchError::InvalidRefinementMask(mask.to_string())),
            })
            .collect::<StitchResult<_>>()?;
        if flags.len() != 5 {
            return Err(StitchError::InvalidRefinementMask(mask.to_string()));
        }
        Ok(Self {
            focal: flags[0],
            skew: flags[1],
            ppx: flags[2],
            aspect: flags[3],
            ppy: flags[4],
        })
    }
}

impl Default for RefinementMask {
    fn default() -> Self {
        Self {
            focal: true,
            skew: true,
            ppx: true,
            aspect: true,
            ppy: true,
        }
    }
}

impl std::fmt::Display for RefinementMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for flag in [self.focal, self.skew, self.ppx, self.aspect, self.ppy] {
            write!(f, "{}", if flag { 'x' } else { '_' })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct BundleAdjuster {
    cost: BaCostFunction,
    conf_thresh: f64,
    mask: RefinementMask,
    max_iters: usize,
}

struct Problem<'a> {
    cost: BaCostFunction,
    features: &'a [ImageFeatures],
    matches: &'a PairwiseMatches,
    edges: Vec<(usize, usize)>,
    /// Principal points held fixed by the ray cost
    principal_points: Vec<(f64, f64)>,
}

impl BundleAdjuster {
    pub fn new(cost: BaCostFunction, conf_thresh: f64, mask: RefinementMask) -> Self {
        Self {
            cost,
            conf_thresh,
            mask,
            max_iters: 100,
        }
    }

    /// Refined copies of `cameras`, rotated so the spanning-tree center has
    /// the identity rotation
    pub fn adjust(
        &self,
        features: &[ImageFeatures],
        matches: &PairwiseMatches,
        cameras: &[CameraParams],
    ) -> Vec<CameraParams> {
        let n = cameras.len();
        let mut edges = Vec::new();
        for i in 0..n {
            for j in i + 1..n {
                if matches.get(i, j).confidence >= self.conf_thresh {
                    edges.push((i, j));
                }
            }
        }

        let problem = Problem {
            cost: self.cost,
            features,
            matches,
            edges,
            principal_points: cameras.iter().map(|c| (c.ppx, c.ppy)).collect(),
        };

        let mut refined = cameras.to_vec();
        if problem.edges.is_empty() {
            warn!("Bundle adjustment skipped: no pair above confidence {}", self.conf_thresh);
        } else {
            let params = self.levenberg_marquardt(&problem, problem.pack(cameras));
            problem.unpack(&params, &mut refined);
        }

        normalize_to_center(matches, &mut refined);
        refined
    }

    fn fixed_params(&self, n: usize) -> Vec<bool> {
        let per_camera: Vec<bool> = match self.cost {
            BaCostFunction::Reproj => vec![
                !self.mask.focal,
                !self.mask.ppx,
                !self.mask.ppy,
                !self.mask.aspect,
                false,
                false,
                false,
            ],
            BaCostFunction::Ray => vec![false; 4],
        };
        (0..n).flat_map(|_| per_camera.iter().copied()).collect()
    }

    fn levenberg_marquardt(&self, problem: &Problem, mut params: DVector<f64>) -> DVector<f64> {
        let n_cams = problem.features.len();
        let fixed = self.fixed_params(n_cams);
        let mut cost = problem.total_cost(&params);
        let n_residuals = problem.num_residuals().max(1);
        info!(
            "Bundle adjustment ({}), {} pairs, initial RMS error: {:.4}",
            self.cost.name(),
            problem.edges.len(),
            (cost / n_residuals as f64).sqrt()
        );

        let mut lambda = 1e-3;
        let mut iters = 0;
        while iters < self.max_iters {
            iters += 1;
            let (mut a, mut g) = problem.normal_equations(&params);
            for k in 0..params.len() {
                if fixed[k] || a[(k, k)] <= 0.0 {
                    a.row_mut(k).fill(0.0);
                    a.column_mut(k).fill(0.0);
                    a[(k, k)] = 1.0;
                    g[k] = 0.0;
                }
            }

            let mut improved = None;
            while lambda < 1e12 {
                let mut damped = a.clone();
                for k in 0..params.len() {
                    damped[(k, k)] += lambda * a[(k, k)];
                }
                let Some(chol) = damped.cholesky() else {
                    lambda *= 10.0;
                    continue;
                };
                let delta = chol.solve(&(-&g));
                let trial = &params + &delta;
                let trial_cost = problem.total_cost(&trial);
                if trial_cost.is_finite() && trial_cost < cost {
                    lambda = (lambda / 10.0).max(1e-9);
                    improved = Some((trial, trial_cost));
                    break;
                }
                lambda *= 10.0;
            }

            let Some((trial, trial_cost)) = improved else {
                break;
            };
            let gain = cost - trial_cost;
            params = trial;
            cost = trial_cost;
            if gain <= f64::EPSILON * cost.max(1.0) {
                break;
            }
        }

        info!(
            "Bundle adjustment finished after {} iterations, RMS error: {:.4}",
            iters,
            (cost / n_residuals as f64).sqrt()
        );
        params
    }
}

impl Problem<'_> {
    fn np(&self) -> usize {
        self.cost.params_per_camera()
    }

    fn pack(&self, cameras: &[CameraParams]) -> DVector<f64> {
        let np = self.np();
        let mut p = DVector::zeros(cameras.len() * np);
        for (i, cam) in cameras.iter().enumerate() {
            let rvec = Rotation3::from_matrix(&cam.r64()).scaled_axis();
            let values: Vec<f64> = match self.cost {
                BaCostFunction::Reproj => vec![cam.focal, cam.ppx, cam.ppy, cam.aspect, rvec.x, rvec.y, rvec.z],
                BaCostFunction::Ray => vec![cam.focal, rvec.x, rvec.y, rvec.z],
            };
            for (k, v) in values.into_iter().enumerate() {
                p[i * np + k] = v;
            }
        }
        p
    }

    fn unpack(&self, p: &DVector<f64>, cameras: &mut [CameraParams]) {
        let np = self.np();
        for (i, cam) in cameras.iter_mut().enumerate() {
            let c = &p.as_slice()[i * np..(i + 1) * np];
            cam.focal = c[0];
            if self.cost == BaCostFunction::Reproj {
                cam.ppx = c[1];
                cam.ppy = c[2];
                cam.aspect = c[3];
            }
            cam.set_r64(&rotation(&c[np - 3..]));
        }
    }

    fn num_residuals(&self) -> usize {
        self.edges
            .iter()
            .map(|&(i, j)| self.matches.get(i, j).num_inliers * self.cost.residuals_per_match())
            .sum()
    }

    fn total_cost(&self, p: &DVector<f64>) -> f64 {
        let np = self.np();
        let mut out = Vec::new();
        self.edges
            .iter()
            .map(|&(i, j)| {
                out.clear();
                self.edge_residuals(i, j, &p.as_slice()[i * np..(i + 1) * np], &p.as_slice()[j * np..(j + 1) * np], &mut out);
                out.iter().map(|r| r * r).sum::<f64>()
            })
            .sum()
    }

    /// JᵀJ and Jᵀr with the Jacobian taken by central differences, one
    /// edge block at a time
    fn normal_equations(&self, p: &DVector<f64>) -> (DMatrix<f64>, DVector<f64>) {
        let np = self.np();
        let n = p.len();
        let mut a = DMatrix::zeros(n, n);
        let mut g = DVector::zeros(n);
        let mut r0 = Vec::new();
        let mut plus = Vec::new();
        let mut minus = Vec::new();

        for &(i, j) in &self.edges {
            let mut ci = p.as_slice()[i * np..(i + 1) * np].to_vec();
            let mut cj = p.as_slice()[j * np..(j + 1) * np].to_vec();
            r0.clear();
            self.edge_residuals(i, j, &ci, &cj, &mut r0);
            if r0.is_empty() {
                continue;
            }

            let mut jac = DMatrix::zeros(r0.len(), 2 * np);
            for k in 0..2 * np {
                let (cam, idx) = if k < np { (&mut ci, k) } else { (&mut cj, k - np) };
                let orig = cam[idx];
                let step = 1e-5 * (1.0 + orig.abs());
                cam[idx] = orig + step;
                plus.clear();
                minus.clear();
                self.edge_residuals(i, j, &ci, &cj, &mut plus);
                let cam = if k < np { &mut ci } else { &mut cj };
                cam[idx] = orig - step;
                self.edge_residuals(i, j, &ci, &cj, &mut minus);
                let cam = if k < np { &mut ci } else { &mut cj };
                cam[idx] = orig;
                for r in 0..r0.len() {
                    jac[(r, k)] = (plus[r] - minus[r]) / (2.0 * step);
                }
            }

            let jtj = jac.transpose() * &jac;
            let jtr = jac.transpose() * DVector::from_column_slice(&r0);
            let global = |k: usize| if k < np { i * np + k } else { j * np + k - np };
            for x in 0..2 * np {
                g[global(x)] += jtr[x];
                for y in 0..2 * np {
                    a[(global(x), global(y))] += jtj[(x, y)];
                }
            }
        }
        (a, g)
    }

    fn edge_residuals(&self, i: usize, j: usize, ci: &[f64], cj: &[f64], out: &mut Vec<f64>) {
        let m = self.matches.get(i, j);
        let (f1, f2) = (&self.features[i], &self.features[j]);
        match self.cost {
            BaCostFunction::Reproj => {
                let k1 = intrinsics(ci[0], ci[1], ci[2], ci[3]);
                let k2 = intrinsics(cj[0], cj[1], cj[2], cj[3]);
                let (r1, r2) = (rotation(&ci[4..7]), rotation(&cj[4..7]));
                let Some(k1_inv) = k1.try_inverse() else {
                    out.extend(std::iter::repeat(f64::INFINITY).take(m.num_inliers * 2));
                    return;
                };
                let h = k2 * r2.transpose() * r1 * k1_inv;
                for dm in m.inliers() {
                    let p1 = f1.keypoints[dm.query_idx];
                    let p2 = f2.keypoints[dm.train_idx];
                    let v = h * Vector3::new(p1.x as f64, p1.y as f64, 1.0);
                    out.push(p2.x as f64 - v.x / v.z);
                    out.push(p2.y as f64 - v.y / v.z);
                }
            }
            BaCostFunction::Ray => {
                let (ppx1, ppy1) = self.principal_points[i];
                let (ppx2, ppy2) = self.principal_points[j];
                let k1_inv = inverse_intrinsics(ci[0], ppx1, ppy1);
                let k2_inv = inverse_intrinsics(cj[0], ppx2, ppy2);
                let h1 = rotation(&ci[1..4]) * k1_inv;
                let h2 = rotation(&cj[1..4]) * k2_inv;
                let mult = (ci[0] * cj[0]).abs().sqrt();
                for dm in m.inliers() {
                    let p1 = f1.keypoints[dm.query_idx];
                    let p2 = f2.keypoints[dm.train_idx];
                    let x1 = (h1 * Vector3::new(p1.x as f64, p1.y as f64, 1.0)).normalize();
                    let x2 = (h2 * Vector3::new(p2.x as f64, p2.y as f64, 1.0)).normalize();
                    let d = (x1 - x2) * mult;
                    out.extend_from_slice(&[d.x, d.y, d.z]);
                }
            }
        }
    }
}

fn intrinsics(focal: f64, ppx: f64, ppy: f64, aspect: f64) -> Matrix3<f64> {
    Matrix3::new(focal, 0.0, ppx, 0.0, focal * aspect, ppy, 0.0, 0.0, 1.0)
}

fn inverse_intrinsics(focal: f64, ppx: f64, ppy: f64) -> Matrix3<f64> {
    Matrix3::new(
        1.0 / focal,
        0.0,
        -ppx / focal,
        0.0,
        1.0 / focal,
        -ppy / focal,
        0.0,
        0.0,
        1.0,
    )
}

fn rotation(rvec: &[f64]) -> Matrix3<f64> {
    Rotation3::new(Vector3::new(rvec[0], rvec[1], rvec[2])).into_inner()
}

/// Rotate all cameras so the spanning-tree center looks straight ahead
fn normalize_to_center(matches: &PairwiseMatches, cameras: &mut [CameraParams]) {
    if cameras.is_empty() {
        return;
    }
    let center = SpanningTree::find_max(matches).center().min(cameras.len() - 1);
    let r_inv = cameras[center].r64().transpose();
    for cam in cameras.iter_mut() {
        let r = r_inv * cam.r64();
        cam.set_r64(&r);
    }
    debug!("Rotations normalized to camera {}", center);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{DMatch, MatchesInfo};
    use pano_core::Keypoint;

    #[test]
    fn test_refinement_mask() {
        let mask = RefinementMask::parse("x_x_x").unwrap();
        assert!(mask.focal && !mask.skew && mask.ppx && !mask.aspect && mask.ppy);
        assert_eq!(mask.to_string(), "x_x_x");
        assert_eq!(RefinementMask::parse("xxxxx").unwrap(), RefinementMask::default());
        assert!(matches!(RefinementMask::parse("xxxx"), Err(StitchError::InvalidRefinementMask(_))));
        assert!(matches!(RefinementMask::parse("xxoxx"), Err(StitchError::InvalidRefinementMask(_))));
    }

    #[test]
    fn test_cost_names() {
        assert_eq!(BaCostFunction::from_name("ray").unwrap(), BaCostFunction::Ray);
        assert_eq!(BaCostFunction::from_name("reproj").unwrap().name(), "reproj");
        assert!(matches!(
            BaCostFunction::from_name("affine"),
            Err(StitchError::UnknownCostFunction(_))
        ));
    }

    /// Two cameras with focal 500 rotated by `yaw`, observing a grid of rays
    fn synthetic_pair(yaw: f64) -> (Vec<ImageFeatures>, PairwiseMatches, Vec<CameraParams>) {
        let f = 500.0;
        let (w, h) = (400u32, 300u32);
        let truth = [
            CameraParams { focal: f, ppx: 200.0, ppy: 150.0, ..Default::default() },
            CameraParams {
                focal: f,
                ppx: 200.0,
                ppy: 150.0,
                r: Rotation3::from_euler_angles(0.0, yaw, 0.0).into_inner().cast::<f32>(),
                ..Default::default()
            },
        ];
        let mut feats: Vec<ImageFeatures> = (0..2)
            .map(|i| ImageFeatures { img_idx: i, img_size: (w, h), ..Default::default() })
            .collect();
        let mut matches = Vec::new();
        for gy in 0..6 {
            for gx in 0..8 {
                let p = Vector3::new(150.0 + gx as f64 * 25.0, 40.0 + gy as f64 * 40.0, 1.0);
                let ray = truth[0].r64() * truth[0].k().try_inverse().unwrap() * p;
                let q = truth[1].k() * truth[1].r64().transpose() * ray;
                let idx = feats[0].keypoints.len();
                feats[0].keypoints.push(Keypoint::new(p.x as f32, p.y as f32));
                feats[1].keypoints.push(Keypoint::new((q.x / q.z) as f32, (q.y / q.z) as f32));
                matches.push(DMatch { query_idx: idx, train_idx: idx, distance: 0.0 });
            }
        }
        let mut table = PairwiseMatches::empty(2);
        let n = matches.len();
        table.set_pair(MatchesInfo {
            src_img_idx: 0,
            dst_img_idx: 1,
            inliers_mask: vec![true; n],
            num_inliers: n,
            matches,
            confidence: 2.0,
            h: Some(Matrix3::identity()),
        });
        (feats, table, truth.to_vec())
    }

    fn perturbed(truth: &[CameraParams]) -> Vec<CameraParams> {
        let mut cams = truth.to_vec();
        for c in cams.iter_mut() {
            c.focal = 470.0;
        }
        let r = Rotation3::from_euler_angles(0.01, 0.0, 0.0).into_inner() * cams[1].r64();
        cams[1].set_r64(&r);
        cams
    }

    #[test]
    fn test_ray_recovers_focal() {
        let (feats, table, truth) = synthetic_pair(0.25);
        let ba = BundleAdjuster::new(BaCostFunction::Ray, 1.0, RefinementMask::default());
        let refined = ba.adjust(&feats, &table, &perturbed(&truth));
        for c in &refined {
            assert!((c.focal - 500.0).abs() < 2.0, "focal {}", c.focal);
        }
        let rel = refined[0].r64().transpose() * refined[1].r64();
        let expected = truth[1].r64();
        assert!((rel - expected).norm() < 1e-2);
        // Center camera carries the identity rotation
        assert!((refined[0].r64() - Matrix3::identity()).norm() < 1e-5);
    }

    #[test]
    fn test_reproj_respects_mask() {
        let (feats, table, truth) = synthetic_pair(0.2);
        let mask = RefinementMask::parse("x____").unwrap();
        let ba = BundleAdjuster::new(BaCostFunction::Reproj, 1.0, mask);
        let refined = ba.adjust(&feats, &table, &perturbed(&truth));
        for c in &refined {
            assert_eq!(c.ppx, 200.0);
            assert_eq!(c.ppy, 150.0);
            assert_eq!(c.aspect, 1.0);
            assert!((c.focal - 500.0).abs() < 2.0, "focal {}", c.focal);
        }
    }

    #[test]
    fn test_low_confidence_pairs_are_ignored() {
        let (feats, table, truth) = synthetic_pair(0.2);
        let start = perturbed(&truth);
        let ba = BundleAdjuster::new(BaCostFunction::Ray, 5.0, RefinementMask::default());
        let refined = ba.adjust(&feats, &table, &start);
        assert_eq!(refined[0].focal, start[0].focal);
        assert_eq!(refined[1].focal, start[1].focal);
    }
}
