//! Camera intrinsics and rotation, and the shared focal length.

use nalgebra::Matrix3;

/// Intrinsics and orientation of one camera; rotation maps camera rays to
/// the panorama frame
#[derive(Debug, Clone, PartialEq)]
pub struct CameraParams {
    pub focal: f64,
    pub aspect: f64,
    pub ppx: f64,
    pub ppy: f64,
    pub r: Matrix3<f32>,
}

impl Default for CameraParams {
    fn default() -> Self {
        Self {
            focal: 1.0,
            aspect: 1.0,
            ppx: 0.0,
            ppy: 0.0,
            r: Matrix3::identity(),
        }
    }
}

impl CameraParams {
    /// Intrinsic matrix
    pub fn k(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.focal,
            0.0,
            self.ppx,
            0.0,
            self.focal * self.aspect,
            self.ppy,
            0.0,
            0.0,
            1.0,
        )
    }

    /// Intrinsics with focal length and principal point multiplied by `s`
    pub fn scaled_k(&self, s: f64) -> Matrix3<f64> {
        let mut k = self.k();
        k[(0, 0)] *= s;
        k[(0, 2)] *= s;
        k[(1, 1)] *= s;
        k[(1, 2)] *= s;
        k
    }

    pub fn r64(&self) -> Matrix3<f64> {
        self.r.cast::<f64>()
    }

    pub fn set_r64(&mut self, r: &Matrix3<f64>) {
        self.r = r.cast::<f32>();
    }
}

/// Median of the camera focal lengths; the mean of the two middle values
/// for an even count
pub fn median_focal(cameras: &[CameraParams]) -> f64 {
    let mut focals: Vec<f64> = cameras.iter().map(|c| c.focal).collect();
    if focals.is_empty() {
        return 1.0;
    }
    focals.sort_by(|a, b| a.total_cmp(b));
    let mid = focals.len() / 2;
    if focals.len() % 2 == 1 {
        focals[mid]
    } else {
        (focals[mid - 1] + focals[mid]) * 0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_focal(focal: f64) -> CameraParams {
        CameraParams { focal, ..CameraParams::default() }
    }

    #[test]
    fn test_k() {
        let cam = CameraParams { focal: 500.0, aspect: 1.5, ppx: 320.0, ppy: 240.0, ..Default::default() };
        let k = cam.k();
        assert_eq!(k[(0, 0)], 500.0);
        assert_eq!(k[(1, 1)], 750.0);
        assert_eq!(k[(0, 2)], 320.0);
        assert_eq!(k[(2, 2)], 1.0);
        let half = cam.scaled_k(0.5);
        assert_eq!(half[(0, 0)], 250.0);
        assert_eq!(half[(1, 2)], 120.0);
        assert_eq!(half[(2, 2)], 1.0);
    }

    #[test]
    fn test_median_focal() {
        let odd: Vec<_> = [30.0, 10.0, 20.0].into_iter().map(with_focal).collect();
        assert_eq!(median_focal(&odd), 20.0);
        let even: Vec<_> = [40.0, 10.0, 30.0, 20.0].into_iter().map(with_focal).collect();
        assert_eq!(median_focal(&even), 25.0);
    }
}
