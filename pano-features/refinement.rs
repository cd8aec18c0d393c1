use pano_core::{Image, Keypoint};
use std::collections::HashMap;

/// Subpixel refinement, suppression and orientation of detected keypoints
pub struct KeypointRefinement;

impl KeypointRefinement {
    /// Greedy non-maximum suppression: strongest keypoints first, anything
    /// closer than `min_distance` to an accepted keypoint is dropped.
    /// Ties keep detection order, so the result is deterministic.
    pub fn non_maximum_suppression(keypoints: &[Keypoint], min_distance: f32) -> Vec<Keypoint> {
        if keypoints.is_empty() {
            return Vec::new();
        }
        if min_distance <= 0.0 {
            return keypoints.to_vec();
        }

        let mut sorted = keypoints.to_vec();
        sorted.sort_by(|a, b| b.response.total_cmp(&a.response));

        // Bucket accepted keypoints in cells of `min_distance` so each
        // candidate only checks its 3x3 cell neighbourhood
        let cell = min_distance;
        let mut grid: HashMap<(i32, i32), Vec<usize>> = HashMap::new();
        let mut accepted: Vec<Keypoint> = Vec::new();
        let min_distance_sq = min_distance * min_distance;

        for candidate in sorted {
            let cx = (candidate.x / cell).floor() as i32;
            let cy = (candidate.y / cell).floor() as i32;

            let mut is_local_max = true;
            'search: for gy in cy - 1..=cy + 1 {
                for gx in cx - 1..=cx + 1 {
                    if let Some(bucket) = grid.get(&(gx, gy)) {
                        for &idx in bucket {
                            let dx = candidate.x - accepted[idx].x;
                            let dy = candidate.y - accepted[idx].y;
                            if dx * dx + dy * dy < min_distance_sq {
                                is_local_max = false;
                                break 'search;
                            }
                        }
                    }
                }
            }

            if is_local_max {
                grid.entry((cx, cy)).or_default().push(accepted.len());
                accepted.push(candidate);
            }
        }

        accepted
    }

    /// Refine keypoint position from a 3x3 neighbourhood of scores
    /// (`samples[row][col]`, centred on the keypoint) by fitting
    /// f(x,y) = Ax² + By² + Cxy + Dx + Ey + F and solving for its extremum
    pub fn refine_quadratic(samples: &[[f32; 3]; 3], kp: Keypoint) -> Keypoint {
        let dx = (samples[1][2] - samples[1][0]) / 2.0;
        let dy = (samples[2][1] - samples[0][1]) / 2.0;
        let dxx = samples[1][2] - 2.0 * samples[1][1] + samples[1][0];
        let dyy = samples[2][1] - 2.0 * samples[1][1] + samples[0][1];
        let dxy = (samples[2][2] - samples[2][0] - samples[0][2] + samples[0][0]) / 4.0;

        let det = dxx * dyy - dxy * dxy;
        if det.abs() < 1e-6 {
            return kp;
        }

        let offset_x = (-(dyy * dx - dxy * dy) / det).clamp(-0.5, 0.5);
        let offset_y = (-(dxx * dy - dxy * dx) / det).clamp(-0.5, 0.5);

        Keypoint {
            x: kp.x + offset_x,
            y: kp.y + offset_y,
            ..kp
        }
    }

    /// Orientation by intensity centroid over a circular patch of radius `half`
    pub fn compute_orientation(img: &Image, width: usize, height: usize, x: f32, y: f32, half: i32) -> f32 {
        let cx = x.round() as i32;
        let cy = y.round() as i32;
        let r2 = half * half;
        let mut m10 = 0i64;
        let mut m01 = 0i64;

        for dy in -half..=half {
            let yy = (cy + dy).clamp(0, height as i32 - 1) as usize;
            for dx in -half..=half {
                if dx * dx + dy * dy > r2 {
                    continue;
                }
                let xx = (cx + dx).clamp(0, width as i32 - 1) as usize;
                let val = img[yy * width + xx] as i64;
                m10 += dx as i64 * val;
                m01 += dy as i64 * val;
            }
        }

        if m10 == 0 && m01 == 0 {
            0.0
        } else {
            (m01 as f32).atan2(m10 as f32)
        }
    }

    /// Bilinear interpolation with clamping at the image border
    pub fn bilinear_sample(img: &[u8], width: usize, height: usize, x: f32, y: f32) -> f32 {
        let x = x.clamp(0.0, (width - 1) as f32);
        let y = y.clamp(0.0, (height - 1) as f32);
        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = (x0 + 1).min(width - 1);
        let y1 = (y0 + 1).min(height - 1);
        let fx = x - x0 as f32;
        let fy = y - y0 as f32;

        let p00 = img[y0 * width + x0] as f32;
        let p10 = img[y0 * width + x1] as f32;
        let p01 = img[y1 * width + x0] as f32;
        let p11 = img[y1 * width + x1] as f32;

        let top = p00 * (1.0 - fx) + p10 * fx;
        let bottom = p01 * (1.0 - fx) + p11 * fx;
        top * (1.0 - fy) + bottom * fy
    }
}
