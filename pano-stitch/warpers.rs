//! Rotation warpers: project camera images onto a common surface.
//!
//! Every surface is described by a forward map (source pixel to surface
//! coordinates, multiplied by `scale`) and a backward map used to resample.
//! Backward maps of the curved surfaces reject rays pointing away from the
//! camera.

use std::f64::consts::{FRAC_PI_4, PI};

use image::{GrayImage, Luma, RgbImage};
use log::debug;
use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;

use crate::error::{StitchError, StitchResult};
use crate::imgops::{reflect, Point, Rect};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WarperKind {
    Plane,
    Cylindrical,
    Spherical,
    Fisheye,
    Stereographic,
    CompressedPlane { a: f64, b: f64 },
    CompressedPlanePortrait { a: f64, b: f64 },
    Panini { a: f64, b: f64 },
    PaniniPortrait { a: f64, b: f64 },
    Mercator,
    TransverseMercator,
}

impl WarperKind {
    pub const NAMES: [&'static str; 15] = [
        "plane",
        "cylindrical",
        "spherical",
        "fisheye",
        "stereographic",
        "compressedPlaneA2B1",
        "compressedPlaneA1.5B1",
        "compressedPlanePortraitA2B1",
        "compressedPlanePortraitA1.5B1",
        "paniniA2B1",
        "paniniA1.5B1",
        "paniniPortraitA2B1",
        "paniniPortraitA1.5B1",
        "mercator",
        "transverseMercator",
    ];

    pub fn from_name(name: &str) -> StitchResult<Self> {
        let kind = match name {
            "plane" => Self::Plane,
            "cylindrical" => Self::Cylindrical,
            "spherical" => Self::Spherical,
            "fisheye" => Self::Fisheye,
            "stereographic" => Self::Stereographic,
            "compressedPlaneA2B1" => Self::CompressedPlane { a: 2.0, b: 1.0 },
            "compressedPlaneA1.5B1" => Self::CompressedPlane { a: 1.5, b: 1.0 },
            "compressedPlanePortraitA2B1" => Self::CompressedPlanePortrait { a: 2.0, b: 1.0 },
            "compressedPlanePortraitA1.5B1" => Self::CompressedPlanePortrait { a: 1.5, b: 1.0 },
            "paniniA2B1" => Self::Panini { a: 2.0, b: 1.0 },
            "paniniA1.5B1" => Self::Panini { a: 1.5, b: 1.0 },
            "paniniPortraitA2B1" => Self::PaniniPortrait { a: 2.0, b: 1.0 },
            "paniniPortraitA1.5B1" => Self::PaniniPortrait { a: 1.5, b: 1.0 },
            "mercator" => Self::Mercator,
            "transverseMercator" => Self::TransverseMercator,
            other => return Err(StitchError::UnknownWarperType(other.to_string())),
        };
        Ok(kind)
    }

    pub fn create(&self, scale: f64) -> Warper {
        Warper { kind: *self, scale }
    }
}

/// Warper of a given kind at a fixed surface scale
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Warper {
    kind: WarperKind,
    scale: f64,
}

struct Projector {
    kind: WarperKind,
    scale: f64,
    r_kinv: Matrix3<f64>,
    k_rinv: Matrix3<f64>,
}

impl Projector {
    fn new(kind: WarperKind, scale: f64, k: &Matrix3<f64>, r: &Matrix3<f64>) -> Self {
        let k_inv = k.try_inverse().unwrap_or_else(Matrix3::identity);
        Self {
            kind,
            scale,
            r_kinv: r * k_inv,
            k_rinv: k * r.transpose(),
        }
    }

    fn map_forward(&self, x: f64, y: f64) -> (f64, f64) {
        let p = self.r_kinv * Vector3::new(x, y, 1.0);
        let (x_, y_, z_) = (p.x, p.y, p.z);
        let s = self.scale;
        let norm = p.norm();
        match self.kind {
            WarperKind::Plane => (s * x_ / z_, s * y_ / z_),
            WarperKind::Cylindrical => (s * x_.atan2(z_), s * y_ / (x_ * x_ + z_ * z_).sqrt()),
            WarperKind::Spherical => {
                let w = y_ / norm;
                let w = if w.is_nan() { 0.0 } else { w };
                (s * x_.atan2(z_), s * (PI - w.acos()))
            }
            WarperKind::Fisheye => {
                let u_ = x_.atan2(z_);
                let v_ = PI - (y_ / norm).acos();
                (s * v_ * u_.cos(), s * v_ * u_.sin())
            }
            WarperKind::Stereographic => {
                let u_ = x_.atan2(z_);
                let v_ = PI - (y_ / norm).acos();
                let r = v_.sin() / (1.0 - v_.cos());
                (s * r * u_.cos(), s * r * u_.sin())
            }
            WarperKind::CompressedPlane { a, b } => {
                let u_ = x_.atan2(z_);
                let v_ = (y_ / norm).asin();
                (s * a * (u_ / a).tan(), s * b * v_.tan() / u_.cos())
            }
            WarperKind::CompressedPlanePortrait { a, b } => {
                // Axes swapped: the first row of R K^-1 drives the vertical
                let (y_, x_) = (x_, y_);
                let u_ = x_.atan2(z_);
                let v_ = (y_ / norm).asin();
                (-s * a * (u_ / a).tan(), s * b * v_.tan() / u_.cos())
            }
            WarperKind::Panini { a, b } => {
                let u_ = x_.atan2(z_);
                let v_ = (y_ / norm).asin();
                panini_forward(s, a, b, u_, v_)
            }
            WarperKind::PaniniPortrait { a, b } => {
                let (y_, x_) = (x_, y_);
                let u_ = x_.atan2(z_);
                let v_ = (y_ / norm).asin();
                let (u, v) = panini_forward(s, a, b, u_, v_);
                (-u, v)
            }
            WarperKind::Mercator => {
                let u_ = x_.atan2(z_);
                let v_ = (y_ / norm).asin();
                (s * u_, s * (FRAC_PI_4 + v_ / 2.0).tan().ln())
            }
            WarperKind::TransverseMercator => {
                let u_ = x_.atan2(z_);
                let v_ = (y_ / norm).asin();
                let b = v_.cos() * u_.sin();
                (s / 2.0 * ((1.0 + b) / (1.0 - b)).ln(), s * v_.tan().atan2(u_.cos()))
            }
        }
    }

    /// Source pixel seen at surface point (u, v)
    fn map_backward(&self, u: f64, v: f64) -> Option<(f64, f64)> {
        let (u, v) = (u / self.scale, v / self.scale);
        let ray = match self.kind {
            WarperKind::Plane => {
                let p = self.k_rinv * Vector3::new(u, v, 1.0);
                if p.z.abs() < 1e-12 {
                    return None;
                }
                return Some((p.x / p.z, p.y / p.z));
            }
            WarperKind::Cylindrical => Vector3::new(u.sin(), v, u.cos()),
            WarperKind::Spherical => sphere_ray(u, v),
            WarperKind::Fisheye => {
                let u_ = v.atan2(u);
                let v_ = (u * u + v * v).sqrt();
                sphere_ray(u_, v_)
            }
            WarperKind::Stereographic => {
                let u_ = v.atan2(u);
                let r = (u * u + v * v).sqrt();
                let v_ = 2.0 * (1.0 / r).atan();
                sphere_ray(u_, v_)
            }
            WarperKind::CompressedPlane { a, b } => {
                let u_ = a * (u / a).atan();
                let v_ = (v * u_.cos() / b).atan();
                lat_long_ray(u_, v_)
            }
            WarperKind::CompressedPlanePortrait { a, b } => {
                let u = -u;
                let u_ = a * (u / a).atan();
                let v_ = (v * u_.cos() / b).atan();
                let r = lat_long_ray(u_, v_);
                Vector3::new(r.y, r.x, r.z)
            }
            WarperKind::Panini { a, b } => {
                let (u_, v_) = panini_backward(a, b, u, v);
                lat_long_ray(u_, v_)
            }
            WarperKind::PaniniPortrait { a, b } => {
                let (u_, v_) = panini_backward(a, b, -u, v);
                let r = lat_long_ray(u_, v_);
                Vector3::new(r.y, r.x, r.z)
            }
            WarperKind::Mercator => lat_long_ray(u, v.sinh().atan()),
            WarperKind::TransverseMercator => {
                let v_ = (v.sin() / u.cosh()).asin();
                let u_ = u.sinh().atan2(v.cos());
                lat_long_ray(u_, v_)
            }
        };

        let p = self.k_rinv * ray;
        if p.z > 0.0 && p.x.is_finite() && p.y.is_finite() {
            Some((p.x / p.z, p.y / p.z))
        } else {
            None
        }
    }
}

/// Ray at azimuth `u` and polar distance `v` from the -y pole
fn sphere_ray(u: f64, v: f64) -> Vector3<f64> {
    let sinv = (PI - v).sin();
    Vector3::new(sinv * u.sin(), (PI - v).cos(), sinv * u.cos())
}

/// Ray at longitude `u` and latitude `v`
fn lat_long_ray(u: f64, v: f64) -> Vector3<f64> {
    let cosv = v.cos();
    Vector3::new(cosv * u.sin(), v.sin(), cosv * u.cos())
}

fn panini_forward(s: f64, a: f64, b: f64, u_: f64, v_: f64) -> (f64, f64) {
    let tg = a * (u_ / a).tan();
    let sinu = u_.sin();
    let v = if sinu.abs() < 1e-7 {
        s * b * v_.tan()
    } else {
        s * b * tg / sinu * v_.tan()
    };
    (s * tg, v)
}

fn panini_backward(a: f64, b: f64, u: f64, v: f64) -> (f64, f64) {
    let lambda = a * (u / a).atan();
    let v_ = if lambda.abs() > 1e-7 {
        (v * lambda.sin() / (b * a * (lambda / a).tan())).atan()
    } else {
        (v / b).atan()
    };
    (lambda, v_)
}

impl Warper {
    fn projector(&self, k: &Matrix3<f64>, r: &Matrix3<f64>) -> Projector {
        Projector::new(self.kind, self.scale, k, r)
    }

    /// Canvas rectangle covered by a warped image of `src_size`
    pub fn warp_roi(&self, src_size: (u32, u32), k: &Matrix3<f64>, r: &Matrix3<f64>) -> Rect {
        let proj = self.projector(k, r);
        let (w, h) = src_size;
        let (tl, br) = match self.kind {
            WarperKind::Plane => {
                let corners = [(0.0, 0.0), (w as f64 - 1.0, 0.0), (0.0, h as f64 - 1.0), (w as f64 - 1.0, h as f64 - 1.0)];
                bounds(corners.iter().map(|&(x, y)| proj.map_forward(x, y)))
            }
            _ => {
                let rows: Vec<((f64, f64), (f64, f64))> = (0..h)
                    .into_par_iter()
                    .map(|y| bounds((0..w).map(|x| proj.map_forward(x as f64, y as f64))))
                    .collect();
                rows.into_iter().fold(
                    ((f64::MAX, f64::MAX), (f64::MIN, f64::MIN)),
                    |(tl, br), (rtl, rbr)| ((tl.0.min(rtl.0), tl.1.min(rtl.1)), (br.0.max(rbr.0), br.1.max(rbr.1))),
                )
            }
        };
        if tl.0 > br.0 || tl.1 > br.1 {
            return Rect::default();
        }
        let tl = Point::new(tl.0.floor() as i32, tl.1.floor() as i32);
        let br = Point::new(br.0.floor() as i32 + 1, br.1.floor() as i32 + 1);
        Rect::from_tl_br(tl, br)
    }

    /// Warp an image with bilinear sampling and reflected borders
    pub fn warp(&self, img: &RgbImage, k: &Matrix3<f64>, r: &Matrix3<f64>) -> (Point, RgbImage) {
        let roi = self.warp_roi(img.dimensions(), k, r);
        let proj = self.projector(k, r);
        let (sw, sh) = (img.width() as i64, img.height() as i64);
        let mut out = RgbImage::new(roi.width, roi.height);
        let row_len = roi.width as usize * 3;
        if row_len == 0 {
            return (roi.tl(), out);
        }

        out.par_chunks_mut(row_len).enumerate().for_each(|(dy, row)| {
            let v = (roi.y + dy as i32) as f64;
            for dx in 0..roi.width as usize {
                let u = (roi.x + dx as i32) as f64;
                let Some((x, y)) = proj.map_backward(u, v) else {
                    continue;
                };
                let (x0, y0) = (x.floor(), y.floor());
                let (fx, fy) = (x - x0, y - y0);
                let (x0, y0) = (x0 as i64, y0 as i64);
                let (xa, xb) = (reflect(x0, sw) as u32, reflect(x0 + 1, sw) as u32);
                let (ya, yb) = (reflect(y0, sh) as u32, reflect(y0 + 1, sh) as u32);
                let (p00, p10) = (img.get_pixel(xa, ya).0, img.get_pixel(xb, ya).0);
                let (p01, p11) = (img.get_pixel(xa, yb).0, img.get_pixel(xb, yb).0);
                for c in 0..3 {
                    let top = p00[c] as f64 * (1.0 - fx) + p10[c] as f64 * fx;
                    let bottom = p01[c] as f64 * (1.0 - fx) + p11[c] as f64 * fx;
                    row[dx * 3 + c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
                }
            }
        });
        debug!("Warped {:?} to {:?}", img.dimensions(), roi);
        (roi.tl(), out)
    }

    /// Warp a mask with nearest-neighbour sampling; outside the source is 0
    pub fn warp_mask(&self, mask: &GrayImage, k: &Matrix3<f64>, r: &Matrix3<f64>) -> (Point, GrayImage) {
        let roi = self.warp_roi(mask.dimensions(), k, r);
        let proj = self.projector(k, r);
        let (sw, sh) = (mask.width() as i64, mask.height() as i64);
        let mut out = GrayImage::new(roi.width, roi.height);
        let row_len = roi.width as usize;
        if row_len == 0 {
            return (roi.tl(), out);
        }

        out.par_chunks_mut(row_len).enumerate().for_each(|(dy, row)| {
            let v = (roi.y + dy as i32) as f64;
            for (dx, px) in row.iter_mut().enumerate() {
                let u = (roi.x + dx as i32) as f64;
                if let Some((x, y)) = proj.map_backward(u, v) {
                    let (xi, yi) = (x.round() as i64, y.round() as i64);
                    if xi >= 0 && yi >= 0 && xi < sw && yi < sh {
                        *px = mask.get_pixel(xi as u32, yi as u32).0[0];
                    }
                }
            }
        });
        (roi.tl(), out)
    }
}

fn bounds(points: impl Iterator<Item = (f64, f64)>) -> ((f64, f64), (f64, f64)) {
    points
        .filter(|(u, v)| u.is_finite() && v.is_finite())
        .fold(((f64::MAX, f64::MAX), (f64::MIN, f64::MIN)), |(tl, br), (u, v)| {
            ((tl.0.min(u), tl.1.min(v)), (br.0.max(u), br.1.max(v)))
        })
}

/// White mask warped the way the image would be
pub fn warp_full_mask(warper: &Warper, size: (u32, u32), k: &Matrix3<f64>, r: &Matrix3<f64>) -> (Point, GrayImage) {
    warper.warp_mask(&GrayImage::from_pixel(size.0, size.1, Luma([255])), k, r)
}


#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use nalgebra::Rotation3;

    fn k(f: f64, w: f64, h: f64) -> Matrix3<f64> {
        Matrix3::new(f, 0.0, w / 2.0, 0.0, f, h / 2.0, 0.0, 0.0, 1.0)
    }

    fn test_image(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| Rgb([(x * 5 % 256) as u8, (y * 7 % 256) as u8, ((x + y) % 256) as u8]))
    }

    #[test]
    fn test_all_names_parse() {
        for name in WarperKind::NAMES {
            assert!(WarperKind::from_name(name).is_ok(), "{}", name);
        }
        assert!(matches!(WarperKind::from_name("affine"), Err(StitchError::UnknownWarperType(_))));
    }

    #[test]
    fn test_forward_backward_round_trip() {
        let kk = k(300.0, 200.0, 150.0);
        let r = Rotation3::from_euler_angles(0.05, 0.2, 0.0).into_inner();
        for name in WarperKind::NAMES {
            let kind = WarperKind::from_name(name).unwrap();
            let proj = Projector::new(kind, 300.0, &kk, &r);
            for &(x, y) in &[(10.0, 20.0), (100.0, 75.0), (180.0, 140.0)] {
                let (u, v) = proj.map_forward(x, y);
                let (bx, by) = proj.map_backward(u, v).unwrap_or((f64::NAN, f64::NAN));
                assert!((bx - x).abs() < 1e-6 && (by - y).abs() < 1e-6, "{}: ({}, {}) -> ({}, {})", name, x, y, bx, by);
            }
        }
    }

    #[test]
    fn test_plane_identity_warp_reproduces_image() {
        let img = test_image(40, 30);
        // Scale equal to focal and identity rotation: pure translation by -pp
        let kk = k(50.0, 40.0, 30.0);
        let warper = WarperKind::Plane.create(50.0);
        let (corner, warped) = warper.warp(&img, &kk, &Matrix3::identity());
        assert_eq!(corner, Point::new(-20, -15));
        assert_eq!(warped.dimensions(), (40, 30));
        assert_eq!(warped, img);
        let (_, mask) = warp_full_mask(&warper, (40, 30), &kk, &Matrix3::identity());
        assert!(mask.pixels().all(|p| p.0[0] == 255));
    }

    #[test]
    fn test_roi_matches_warp_size() {
        let img = test_image(60, 40);
        let kk = k(80.0, 60.0, 40.0);
        let r = Rotation3::from_euler_angles(0.0, 0.3, 0.0).into_inner();
        let warper = WarperKind::Spherical.create(80.0);
        let roi = warper.warp_roi((60, 40), &kk, &r);
        let (corner, warped) = warper.warp(&img, &kk, &r);
        let (mcorner, mask) = warper.warp_mask(&GrayImage::from_pixel(60, 40, Luma([255])), &kk, &r);
        assert_eq!(corner, roi.tl());
        assert_eq!(mcorner, roi.tl());
        assert_eq!(warped.dimensions(), roi.size());
        assert_eq!(mask.dimensions(), roi.size());
        let covered = mask.pixels().filter(|p| p.0[0] == 255).count();
        assert!(covered as f64 > 0.8 * 60.0 * 40.0);
    }
}
