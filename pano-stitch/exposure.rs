//! Exposure compensation: per-image (or per-block) gains chosen so that
//! overlapping regions have matching mean intensity.

use image::{GrayImage, RgbImage};
use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

use crate::error::{StitchError, StitchResult};
use crate::imgops::{reflect101, Point, Rect};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureKind {
    No,
    Gain,
    GainBlocks,
}

impl ExposureKind {
    pub fn from_name(name: &str) -> StitchResult<Self> {
        match name {
            "no" => Ok(Self::No),
            "gain" => Ok(Self::Gain),
            "gain_blocks" => Ok(Self::GainBlocks),
            other => Err(StitchError::UnknownExposureCompensator(other.to_string())),
        }
    }

    pub fn create(&self) -> Box<dyn ExposureCompensator> {
        match self {
            Self::No => Box::new(NoExposureCompensator),
            Self::Gain => Box::<GainCompensator>::default(),
            Self::GainBlocks => Box::new(BlocksGainCompensator::new(32, 32)),
        }
    }
}

pub trait ExposureCompensator: Send {
    /// Estimate the compensation from warped images placed at `corners`
    fn feed(&mut self, corners: &[Point], images: &[RgbImage], masks: &[GrayImage]);

    /// Compensate image `index`; geometry is unchanged
    fn apply(&self, index: usize, corner: Point, image: &mut RgbImage, mask: &GrayImage);
}

#[derive(Debug, Clone, Default)]
pub struct NoExposureCompensator;

impl ExposureCompensator for NoExposureCompensator {
    fn feed(&mut self, _: &[Point], _: &[RgbImage], _: &[GrayImage]) {}

    fn apply(&self, _: usize, _: Point, _: &mut RgbImage, _: &GrayImage) {}
}

/// A view of an image region placed on the canvas
struct Patch<'a> {
    corner: Point,
    image: &'a RgbImage,
    mask: &'a GrayImage,
    /// Region of `image` covered by this patch
    rect: Rect,
}

#[derive(Debug, Clone, Default)]
pub struct GainCompensator {
    gains: Vec<f64>,
}

impl GainCompensator {
    pub fn gains(&self) -> &[f64] {
        &self.gains
    }

    const ALPHA: f64 = 0.01;
    const BETA: f64 = 100.0;

    /// Minimize sum over overlaps of
    /// `alpha * (g_i I_ij - g_j I_ji)^2 + beta * (1 - g_i)^2`, weighted by
    /// overlap size
    fn solve(patches: &[Patch]) -> Vec<f64> {
        let n = patches.len();
        let mut counts = DMatrix::<f64>::zeros(n, n);
        let mut means = DMatrix::<f64>::zeros(n, n);

        for i in 0..n {
            for j in i..n {
                let (pi, pj) = (&patches[i], &patches[j]);
                let ri = Rect::new(pi.corner.x, pi.corner.y, pi.rect.width, pi.rect.height);
                let rj = Rect::new(pj.corner.x, pj.corner.y, pj.rect.width, pj.rect.height);
                let Some(roi) = ri.intersect(&rj) else {
                    continue;
                };

                let mut count = 0usize;
                let (mut sum_i, mut sum_j) = (0.0, 0.0);
                for y in roi.y..roi.br().y {
                    for x in roi.x..roi.br().x {
                        let (xi, yi) = ((x - pi.corner.x) as u32 + pi.rect.x as u32, (y - pi.corner.y) as u32 + pi.rect.y as u32);
                        let (xj, yj) = ((x - pj.corner.x) as u32 + pj.rect.x as u32, (y - pj.corner.y) as u32 + pj.rect.y as u32);
                        if pi.mask.get_pixel(xi, yi).0[0] == 0 || pj.mask.get_pixel(xj, yj).0[0] == 0 {
                            continue;
                        }
                        count += 1;
                        sum_i += intensity(pi.image, xi, yi);
                        sum_j += intensity(pj.image, xj, yj);
                    }
                }
                let nij = count.max(1) as f64;
                counts[(i, j)] = nij;
                counts[(j, i)] = nij;
                means[(i, j)] = sum_i / nij;
                means[(j, i)] = sum_j / nij;
            }
        }

        let mut a = DMatrix::<f64>::zeros(n, n);
        let mut b = DVector::<f64>::zeros(n);
        for i in 0..n {
            for j in 0..n {
                b[i] += Self::BETA * counts[(i, j)];
                a[(i, i)] += Self::BETA * counts[(i, j)];
                if j == i {
                    continue;
                }
                a[(i, i)] += 2.0 * Self::ALPHA * means[(i, j)] * means[(i, j)] * counts[(i, j)];
                a[(i, j)] -= 2.0 * Self::ALPHA * means[(i, j)] * means[(j, i)] * counts[(i, j)];
            }
        }

        match a.lu().solve(&b) {
            Some(g) if g.iter().all(|v| v.is_finite()) => g.iter().copied().collect(),
            _ => {
                warn!("Gain system is singular, keeping unit gains");
                vec![1.0; n]
            }
        }
    }
}

fn intensity(img: &RgbImage, x: u32, y: u32) -> f64 {
    let p = img.get_pixel(x, y).0;
    let (r, g, b) = (p[0] as f64, p[1] as f64, p[2] as f64);
    (r * r + g * g + b * b).sqrt()
}

impl ExposureCompensator for GainCompensator {
    fn feed(&mut self, corners: &[Point], images: &[RgbImage], masks: &[GrayImage]) {
        let patches: Vec<Patch> = corners
            .iter()
            .zip(images)
            .zip(masks)
            .map(|((&corner, image), mask)| Patch {
                corner,
                image,
                mask,
                rect: Rect::new(0, 0, image.width(), image.height()),
            })
            .collect();
        self.gains = Self::solve(&patches);
        debug!("Exposure gains: {:?}", self.gains);
    }

    fn apply(&self, index: usize, _: Point, image: &mut RgbImage, _: &GrayImage) {
        let gain = self.gains.get(index).copied().unwrap_or(1.0);
        for v in image.iter_mut() {
            *v = (*v as f64 * gain).round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Gains on a coarse grid of blocks, smoothed and interpolated per pixel
#[derive(Debug, Clone)]
pub struct BlocksGainCompensator {
    bl_width: u32,
    bl_height: u32,
    gain_maps: Vec<GainMap>,
}

#[derive(Debug, Clone, PartialEq)]
struct GainMap {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl GainMap {
    /// Two passes of the separable [1/4, 1/2, 1/4] kernel
    fn smooth(&mut self) {
        for _ in 0..2 {
            self.data = self.filter(true);
            self.data = self.filter(false);
        }
    }

    fn filter(&self, horizontal: bool) -> Vec<f32> {
        let (w, h) = (self.width as i64, self.height as i64);
        let at = |x: i64, y: i64| self.data[reflect101(y, h) * self.width + reflect101(x, w)];
        let mut out = vec![0.0; self.data.len()];
        for y in 0..h {
            for x in 0..w {
                let v = if horizontal {
                    0.25 * at(x - 1, y) + 0.5 * at(x, y) + 0.25 * at(x + 1, y)
                } else {
                    0.25 * at(x, y - 1) + 0.5 * at(x, y) + 0.25 * at(x, y + 1)
                };
                out[(y * w + x) as usize] = v;
            }
        }
        out
    }

    /// Bilinear lookup at output pixel (x, y) of an image of `size`
    fn sample(&self, x: u32, y: u32, size: (u32, u32)) -> f32 {
        let sx = ((x as f32 + 0.5) * self.width as f32 / size.0 as f32 - 0.5).clamp(0.0, (self.width - 1) as f32);
        let sy = ((y as f32 + 0.5) * self.height as f32 / size.1 as f32 - 0.5).clamp(0.0, (self.height - 1) as f32);
        let (x0, y0) = (sx.floor() as usize, sy.floor() as usize);
        let (x1, y1) = ((x0 + 1).min(self.width - 1), (y0 + 1).min(self.height - 1));
        let (fx, fy) = (sx - x0 as f32, sy - y0 as f32);
        let g = |x: usize, y: usize| self.data[y * self.width + x];
        let top = g(x0, y0) * (1.0 - fx) + g(x1, y0) * fx;
        let bottom = g(x0, y1) * (1.0 - fx) + g(x1, y1) * fx;
        top * (1.0 - fy) + bottom * fy
    }
}

impl BlocksGainCompensator {
    pub fn new(bl_width: u32, bl_height: u32) -> Self {
        Self {
            bl_width: bl_width.max(1),
            bl_height: bl_height.max(1),
            gain_maps: Vec::new(),
        }
    }
}

impl ExposureCompensator for BlocksGainCompensator {
    fn feed(&mut self, corners: &[Point], images: &[RgbImage], masks: &[GrayImage]) {
        let mut patches = Vec::new();
        let mut grids = Vec::with_capacity(images.len());

        for ((&corner, image), mask) in corners.iter().zip(images).zip(masks) {
            let (w, h) = image.dimensions();
            let per_x = w.div_ceil(self.bl_width).max(1);
            let per_y = h.div_ceil(self.bl_height).max(1);
            let bw = w.div_ceil(per_x).max(1);
            let bh = h.div_ceil(per_y).max(1);
            for by in 0..per_y {
                for bx in 0..per_x {
                    let (x0, y0) = (bx * bw, by * bh);
                    let (x1, y1) = ((x0 + bw).min(w), (y0 + bh).min(h));
                    patches.push(Patch {
                        corner: Point::new(corner.x + x0 as i32, corner.y + y0 as i32),
                        image,
                        mask,
                        rect: Rect::new(x0 as i32, y0 as i32, x1.saturating_sub(x0), y1.saturating_sub(y0)),
                    });
                }
            }
            grids.push((per_x as usize, per_y as usize));
        }

        let gains = GainCompensator::solve(&patches);
        let mut offset = 0;
        self.gain_maps = grids
            .into_iter()
            .map(|(gw, gh)| {
                let data = gains[offset..offset + gw * gh].iter().map(|&g| g as f32).collect();
                offset += gw * gh;
                let mut map = GainMap { width: gw, height: gh, data };
                map.smooth();
                map
            })
            .collect();
        debug!("Block gains over {} blocks", patches.len());
    }

    fn apply(&self, index: usize, _: Point, image: &mut RgbImage, _: &GrayImage) {
        let Some(map) = self.gain_maps.get(index) else {
            return;
        };
        let size = image.dimensions();
        for (x, y, px) in image.enumerate_pixels_mut() {
            let gain = map.sample(x, y, size);
            for c in px.0.iter_mut() {
                *c = (*c as f32 * gain).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imgops::full_mask;
    use image::Rgb;

    fn flat(w: u32, h: u32, v: u8) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb([v, v, v]))
    }

    #[test]
    fn test_names() {
        assert_eq!(ExposureKind::from_name("gain_blocks").unwrap(), ExposureKind::GainBlocks);
        assert!(matches!(
            ExposureKind::from_name("channels"),
            Err(StitchError::UnknownExposureCompensator(_))
        ));
    }

    #[test]
    fn test_gain_equalizes_overlap() {
        let images = vec![flat(40, 20, 100), flat(40, 20, 140)];
        let masks = vec![full_mask(40, 20), full_mask(40, 20)];
        let corners = vec![Point::new(0, 0), Point::new(20, 0)];
        let mut comp = GainCompensator::default();
        comp.feed(&corners, &images, &masks);
        let g = comp.gains();
        assert!(g[0] > 1.0 && g[1] < 1.0, "{:?}", g);
        let before = (140.0 - 100.0f64).abs();
        let after = (140.0 * g[1] - 100.0 * g[0]).abs();
        assert!(after < 0.5 * before);

        let mut img = images[0].clone();
        comp.apply(0, corners[0], &mut img, &masks[0]);
        assert!(img.get_pixel(0, 0).0[0] > 100);
    }

    #[test]
    fn test_disjoint_images_keep_unit_gain() {
        let images = vec![flat(10, 10, 50), flat(10, 10, 200)];
        let masks = vec![full_mask(10, 10), full_mask(10, 10)];
        let corners = vec![Point::new(0, 0), Point::new(100, 0)];
        let mut comp = GainCompensator::default();
        comp.feed(&corners, &images, &masks);
        for g in comp.gains() {
            assert!((g - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_block_gains_shape_and_no_op() {
        let images = vec![flat(70, 40, 120), flat(70, 40, 120)];
        let masks = vec![full_mask(70, 40), full_mask(70, 40)];
        let corners = vec![Point::new(0, 0), Point::new(35, 0)];
        let mut comp = BlocksGainCompensator::new(32, 32);
        comp.feed(&corners, &images, &masks);
        assert_eq!(comp.gain_maps.len(), 2);
        assert_eq!((comp.gain_maps[0].width, comp.gain_maps[0].height), (3, 2));

        // Equal exposure everywhere: compensation leaves pixels alone
        let mut img = images[1].clone();
        comp.apply(1, corners[1], &mut img, &masks[1]);
        assert_eq!(img, images[1]);
    }

    #[test]
    fn test_no_compensator() {
        let mut comp = ExposureKind::No.create();
        let img = flat(4, 4, 77);
        comp.feed(&[Point::new(0, 0)], std::slice::from_ref(&img), &[full_mask(4, 4)]);
        let mut out = img.clone();
        comp.apply(0, Point::new(0, 0), &mut out, &full_mask(4, 4));
        assert_eq!(out, img);
    }

    #[test]
    fn test_smoothing_preserves_constant() {
        let mut map = GainMap { width: 3, height: 2, data: vec![1.5; 6] };
        map.smooth();
        assert!(map.data.iter().all(|&v| (v - 1.5).abs() < 1e-6));
    }
}
