//! Wave correction: straightens the panorama horizon by rotating every
//! camera so the common up vector is aligned with the canvas.

use log::debug;
use nalgebra::{Matrix3, SymmetricEigen, Vector3};

use crate::camera::CameraParams;
use crate::error::{StitchError, StitchResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveCorrectKind {
    Horiz,
    Vert,
}

impl WaveCorrectKind {
    pub fn from_name(name: &str) -> StitchResult<Self> {
        match name {
            "horiz" => Ok(Self::Horiz),
            "vert" => Ok(Self::Vert),
            other => Err(StitchError::UnknownWaveCorrect(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Horiz => "horiz",
            Self::Vert => "vert",
        }
    }
}

/// Straighten a panorama by finding the common "up" axis of all cameras
/// and rotating every camera so it becomes the panorama's y axis.
/// Returns corrected copies; fewer than two cameras are returned as is.
pub fn wave_correct(cameras: &[CameraParams], kind: WaveCorrectKind) -> Vec<CameraParams> {
    let mut out = cameras.to_vec();
    if cameras.len() <= 1 {
        return out;
    }
    let rmats: Vec<Matrix3<f64>> = cameras.iter().map(|c| c.r64()).collect();

    let moment = rmats
        .iter()
        .map(|r| {
            let col = r.column(0);
            col * col.transpose()
        })
        .fold(Matrix3::zeros(), |acc, m| acc + m);

    let eig = SymmetricEigen::new(moment);
    let mut order: Vec<usize> = (0..3).collect();
    order.sort_by(|&a, &b| eig.eigenvalues[a].total_cmp(&eig.eigenvalues[b]));
    let pick = match kind {
        WaveCorrectKind::Horiz => order[0],
        WaveCorrectKind::Vert => order[2],
    };
    let mut rg1: Vector3<f64> = eig.eigenvectors.column(pick).into_owned();

    let img_k: Vector3<f64> = rmats.iter().map(|r| r.column(2).into_owned()).sum();
    let mut rg0 = rg1.cross(&img_k);
    let rg0_norm = rg0.norm();
    if rg0_norm <= f64::MIN_POSITIVE {
        return out;
    }
    rg0 /= rg0_norm;
    let rg2 = rg0.cross(&rg1);

    let conf: f64 = match kind {
        WaveCorrectKind::Horiz => rmats.iter().map(|r| rg0.dot(&r.column(0))).sum(),
        WaveCorrectKind::Vert => -rmats.iter().map(|r| rg1.dot(&r.column(0))).sum::<f64>(),
    };
    if conf < 0.0 {
        rg0 = -rg0;
        rg1 = -rg1;
    }

    let correction = Matrix3::from_rows(&[rg0.transpose(), rg1.transpose(), rg2.transpose()]);
    debug!("Wave correction ({}): {:?}", kind.name(), correction);
    for (cam, r) in out.iter_mut().zip(&rmats) {
        cam.set_r64(&(correction * r));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Rotation3;

    fn cam(r: Matrix3<f64>) -> CameraParams {
        let mut c = CameraParams::default();
        c.set_r64(&r);
        c
    }

    #[test]
    fn test_names() {
        assert_eq!(WaveCorrectKind::from_name("vert").unwrap(), WaveCorrectKind::Vert);
        assert!(matches!(WaveCorrectKind::from_name("diag"), Err(StitchError::UnknownWaveCorrect(_))));
    }

    #[test]
    fn test_removes_common_tilt() {
        // A horizontal sweep of cameras viewed through a tilted tripod
        let tilt = Rotation3::from_euler_angles(0.15, 0.0, 0.05).into_inner();
        let cams: Vec<CameraParams> = [-0.4, -0.1, 0.2, 0.5]
            .iter()
            .map(|&yaw| cam(tilt * Rotation3::from_euler_angles(0.0, yaw, 0.0).into_inner()))
            .collect();
        let corrected = wave_correct(&cams, WaveCorrectKind::Horiz);
        for c in &corrected {
            let r = c.r64();
            // Camera x axes now lie in the horizontal plane
            assert!(r.column(0).y.abs() < 1e-4, "{:?}", r);
            assert!((r * r.transpose() - Matrix3::identity()).norm() < 1e-4);
        }
    }

    #[test]
    fn test_single_camera_untouched() {
        let cams = vec![cam(Rotation3::from_euler_angles(0.3, 0.2, 0.1).into_inner())];
        assert_eq!(wave_correct(&cams, WaveCorrectKind::Horiz), cams);
    }
}
