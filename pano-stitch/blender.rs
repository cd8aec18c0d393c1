//! Compositing of warped images onto the panorama canvas.

use image::{GrayImage, Luma, Rgb, RgbImage};
use log::debug;

use crate::error::{StitchError, StitchResult};
use crate::imgops::{distance_transform_l1, reflect, reflect101, result_roi, Point, Rect};

/// Accumulated weight below which a canvas pixel counts as empty
const WEIGHT_EPS: f32 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlenderKind {
    No,
    Feather,
    MultiBand,
}

impl BlenderKind {
    /// `none` disables blending; `no` is accepted as an alias
    pub fn from_name(name: &str) -> StitchResult<Self> {
        match name {
            "none" | "no" => Ok(Self::No),
            "feather" => Ok(Self::Feather),
            "multiband" => Ok(Self::MultiBand),
            other => Err(StitchError::UnknownBlender(other.to_string())),
        }
    }

    /// Blender sized for a canvas of `canvas_area` pixels. `strength` is the
    /// transition width in percent of the canvas diagonal scale; a width
    /// under one pixel disables blending.
    pub fn create(&self, strength: f32, canvas_area: f64) -> Box<dyn Blender> {
        let blend_width = canvas_area.sqrt() * strength as f64 / 100.0;
        if blend_width < 1.0 {
            debug!("Blend width {:.2} < 1, compositing without blending", blend_width);
            return Box::new(NoBlender::default());
        }
        match self {
            Self::No => Box::new(NoBlender::default()),
            Self::Feather => Box::new(FeatherBlender::new((1.0 / blend_width) as f32)),
            Self::MultiBand => {
                let bands = (blend_width.log2().ceil() - 1.0).max(0.0) as u32;
                debug!("Multi-band blender: {} bands", bands);
                Box::new(MultiBandBlender::new(bands))
            }
        }
    }
}

pub trait Blender: Send {
    /// Allocate the canvas covering `dst_roi`
    fn prepare(&mut self, dst_roi: Rect);

    /// Add one warped image whose top-left pixel lands at `tl`
    fn feed(&mut self, img: &RgbImage, mask: &GrayImage, tl: Point);

    /// Finished panorama and its coverage mask
    fn blend(&mut self) -> (RgbImage, GrayImage);

    fn prepare_for(&mut self, corners: &[Point], sizes: &[(u32, u32)]) {
        self.prepare(result_roi(corners, sizes));
    }
}

/// Copies each image onto the canvas under its mask; later images win
#[derive(Debug, Clone, Default)]
pub struct NoBlender {
    roi: Rect,
    dst: RgbImage,
    dst_mask: GrayImage,
}

impl Blender for NoBlender {
    fn prepare(&mut self, dst_roi: Rect) {
        self.roi = dst_roi;
        self.dst = RgbImage::new(dst_roi.width, dst_roi.height);
        self.dst_mask = GrayImage::new(dst_roi.width, dst_roi.height);
    }

    fn feed(&mut self, img: &RgbImage, mask: &GrayImage, tl: Point) {
        for_each_canvas_pixel(self.roi, img.dimensions(), tl, |x, y, cx, cy| {
            let m = mask.get_pixel(x, y).0[0];
            if m != 0 {
                self.dst.put_pixel(cx, cy, *img.get_pixel(x, y));
            }
            self.dst_mask.get_pixel_mut(cx, cy).0[0] |= m;
        });
    }

    fn blend(&mut self) -> (RgbImage, GrayImage) {
        let mut dst = std::mem::take(&mut self.dst);
        let mask = std::mem::take(&mut self.dst_mask);
        for (p, m) in dst.pixels_mut().zip(mask.pixels()) {
            if m.0[0] == 0 {
                *p = Rgb([0, 0, 0]);
            }
        }
        (dst, mask)
    }
}

/// Visit pixels of an image placed at `tl` that fall on the canvas `roi`,
/// passing image and canvas-local coordinates
fn for_each_canvas_pixel(roi: Rect, size: (u32, u32), tl: Point, mut visit: impl FnMut(u32, u32, u32, u32)) {
    let (dx, dy) = (tl.x - roi.x, tl.y - roi.y);
    for y in 0..size.1 {
        let cy = dy + y as i32;
        if cy < 0 || cy >= roi.height as i32 {
            continue;
        }
        for x in 0..size.0 {
            let cx = dx + x as i32;
            if cx < 0 || cx >= roi.width as i32 {
                continue;
            }
            visit(x, y, cx as u32, cy as u32);
        }
    }
}

/// Weighted average with weights ramping up from the mask border:
/// `min(distance * sharpness, 1)`
#[derive(Debug, Clone)]
pub struct FeatherBlender {
    sharpness: f32,
    roi: Rect,
    acc: Vec<[f32; 3]>,
    weights: Vec<f32>,
}

impl FeatherBlender {
    pub fn new(sharpness: f32) -> Self {
        Self {
            sharpness,
            roi: Rect::default(),
            acc: Vec::new(),
            weights: Vec::new(),
        }
    }
}

/// Per-pixel feather weight of a mask
pub fn feather_weight_map(mask: &GrayImage, sharpness: f32) -> Vec<f32> {
    let (w, h) = (mask.width() as usize, mask.height() as usize);
    distance_transform_l1(w, h, |x, y| mask.get_pixel(x as u32, y as u32).0[0] == 0)
        .into_iter()
        .map(|d| (d * sharpness).min(1.0))
        .collect()
}

impl Blender for FeatherBlender {
    fn prepare(&mut self, dst_roi: Rect) {
        let n = dst_roi.area() as usize;
        self.roi = dst_roi;
        self.acc = vec![[0.0; 3]; n];
        self.weights = vec![0.0; n];
    }

    fn feed(&mut self, img: &RgbImage, mask: &GrayImage, tl: Point) {
        let weight_map = feather_weight_map(mask, self.sharpness);
        let (w, cw) = (img.width() as usize, self.roi.width as usize);
        for_each_canvas_pixel(self.roi, img.dimensions(), tl, |x, y, cx, cy| {
            let wt = weight_map[y as usize * w + x as usize];
            let k = cy as usize * cw + cx as usize;
            let p = img.get_pixel(x, y).0;
            for c in 0..3 {
                self.acc[k][c] += p[c] as f32 * wt;
            }
            self.weights[k] += wt;
        });
    }

    fn blend(&mut self) -> (RgbImage, GrayImage) {
        let (w, h) = self.roi.size();
        let mut dst = RgbImage::new(w, h);
        let mut mask = GrayImage::new(w, h);
        for (k, (acc, &wt)) in self.acc.iter().zip(&self.weights).enumerate() {
            if wt <= WEIGHT_EPS {
                continue;
            }
            let (x, y) = ((k % w as usize) as u32, (k / w as usize) as u32);
            let norm = wt + WEIGHT_EPS;
            dst.put_pixel(x, y, Rgb(acc.map(|v| (v / norm).round().clamp(0.0, 255.0) as u8)));
            mask.put_pixel(x, y, Luma([255]));
        }
        self.acc.clear();
        self.weights.clear();
        (dst, mask)
    }
}

/// Single- or three-channel float raster
#[derive(Debug, Clone, PartialEq)]
struct Plane {
    width: usize,
    height: usize,
    channels: usize,
    data: Vec<f32>,
}

const PYR_KERNEL: [f32; 5] = [1.0, 4.0, 6.0, 4.0, 1.0];

impl Plane {
    fn zeros(width: usize, height: usize, channels: usize) -> Self {
        Self {
            width,
            height,
            channels,
            data: vec![0.0; width * height * channels],
        }
    }

    #[inline]
    fn at(&self, x: usize, y: usize, c: usize) -> f32 {
        self.data[(y * self.width + x) * self.channels + c]
    }

    /// Gaussian blur with the 5-tap binomial kernel, then drop every other
    /// row and column. Output is `ceil(size / 2)`.
    fn pyr_down(&self) -> Plane {
        let (ow, oh) = (self.width.div_ceil(2), self.height.div_ceil(2));
        let (w, h, ch) = (self.width as i64, self.height as i64, self.channels);

        // Horizontal pass at the kept columns only
        let mut tmp = Plane::zeros(ow, self.height, ch);
        for y in 0..self.height {
            for ox in 0..ow {
                for c in 0..ch {
                    let mut s = 0.0;
                    for (t, k) in PYR_KERNEL.iter().enumerate() {
                        let sx = reflect101(2 * ox as i64 + t as i64 - 2, w);
                        s += k * self.at(sx, y, c);
                    }
                    tmp.data[(y * ow + ox) * ch + c] = s / 16.0;
                }
            }
        }

        let mut out = Plane::zeros(ow, oh, ch);
        for oy in 0..oh {
            for x in 0..ow {
                for c in 0..ch {
                    let mut s = 0.0;
                    for (t, k) in PYR_KERNEL.iter().enumerate() {
                        let sy = reflect101(2 * oy as i64 + t as i64 - 2, h);
                        s += k * tmp.at(x, sy, c);
                    }
                    out.data[(oy * ow + x) * ch + c] = s / 16.0;
                }
            }
        }
        out
    }

    /// Upsample to `width` x `height`: zero insertion followed by the
    /// binomial kernel scaled to preserve brightness
    fn pyr_up(&self, width: usize, height: usize) -> Plane {
        let ch = self.channels;
        let (sw, sh) = (self.width as i64, self.height as i64);
        // Source taps of output index i: i = 2u + t - 2 for even t - i
        let taps = |i: usize, n: i64| -> Vec<(usize, f32)> {
            PYR_KERNEL
                .iter()
                .enumerate()
                .filter(|&(t, _)| (i as i64 + 2 - t as i64) % 2 == 0)
                .map(|(t, &k)| (reflect101((i as i64 + 2 - t as i64) / 2, n), k / 8.0))
                .collect()
        };

        let mut tmp = Plane::zeros(width, self.height, ch);
        for x in 0..width {
            let tx = taps(x, sw);
            for y in 0..self.height {
                for c in 0..ch {
                    tmp.data[(y * width + x) * ch + c] = tx.iter().map(|&(u, k)| k * self.at(u, y, c)).sum();
                }
            }
        }

        let mut out = Plane::zeros(width, height, ch);
        for y in 0..height {
            let ty = taps(y, sh);
            for x in 0..width {
                for c in 0..ch {
                    out.data[(y * width + x) * ch + c] = ty.iter().map(|&(v, k)| k * tmp.at(x, v, c)).sum();
                }
            }
        }
        out
    }
}

/// Laplacian pyramid of `num_bands + 1` levels; the last level holds the
/// residual low-pass image
fn laplace_pyramid(img: Plane, num_bands: usize) -> Vec<Plane> {
    let mut pyr = Vec::with_capacity(num_bands + 1);
    pyr.push(img);
    for i in 0..num_bands {
        let down = pyr[i].pyr_down();
        pyr.push(down);
    }
    for i in 0..num_bands {
        let up = pyr[i + 1].pyr_up(pyr[i].width, pyr[i].height);
        for (v, u) in pyr[i].data.iter_mut().zip(&up.data) {
            *v -= u;
        }
    }
    pyr
}

/// Collapse a Laplacian pyramid back into its base level
fn restore_from_laplace(pyr: &mut [Plane]) {
    for i in (0..pyr.len().saturating_sub(1)).rev() {
        let up = pyr[i + 1].pyr_up(pyr[i].width, pyr[i].height);
        for (v, u) in pyr[i].data.iter_mut().zip(&up.data) {
            *v += u;
        }
    }
}

/// Burt-Adelson multi-band blending: every frequency band is blended with
/// a correspondingly smoothed weight, so low frequencies mix over wide
/// transitions and fine detail over narrow ones
#[derive(Debug, Clone)]
pub struct MultiBandBlender {
    requested_bands: u32,
    num_bands: u32,
    /// Canvas before padding to a multiple of `2^num_bands`
    final_roi: Rect,
    roi: Rect,
    dst_pyr: Vec<Plane>,
    dst_weights: Vec<Plane>,
}

impl MultiBandBlender {
    pub fn new(num_bands: u32) -> Self {
        Self {
            requested_bands: num_bands,
            num_bands,
            final_roi: Rect::default(),
            roi: Rect::default(),
            dst_pyr: Vec::new(),
            dst_weights: Vec::new(),
        }
    }

    pub fn num_bands(&self) -> u32 {
        self.num_bands
    }
}

fn pad_to_multiple(v: i32, step: i32) -> i32 {
    v + (step - v % step) % step
}

impl Blender for MultiBandBlender {
    fn prepare(&mut self, dst_roi: Rect) {
        self.final_roi = dst_roi;
        let max_len = dst_roi.width.max(dst_roi.height).max(1) as f64;
        self.num_bands = self.requested_bands.min(max_len.log2().ceil() as u32);

        let step = 1i32 << self.num_bands;
        let mut roi = dst_roi;
        roi.width = pad_to_multiple(roi.width as i32, step) as u32;
        roi.height = pad_to_multiple(roi.height as i32, step) as u32;
        self.roi = roi;

        let (mut w, mut h) = (roi.width as usize, roi.height as usize);
        self.dst_pyr = Vec::with_capacity(self.num_bands as usize + 1);
        self.dst_weights = Vec::with_capacity(self.num_bands as usize + 1);
        for _ in 0..=self.num_bands {
            self.dst_pyr.push(Plane::zeros(w, h, 3));
            self.dst_weights.push(Plane::zeros(w, h, 1));
            w = w.div_ceil(2);
            h = h.div_ceil(2);
        }
        debug!(
            "Multi-band canvas {}x{} with {} bands",
            roi.width, roi.height, self.num_bands
        );
    }

    fn feed(&mut self, img: &RgbImage, mask: &GrayImage, tl: Point) {
        if img.width() == 0 || img.height() == 0 {
            return;
        }
        let step = 1i32 << self.num_bands;
        let gap = 3 * step;
        let roi = self.roi;
        let (iw, ih) = (img.width() as i32, img.height() as i32);

        let mut tl_new = Point::new((tl.x - gap).max(roi.x), (tl.y - gap).max(roi.y));
        let mut br_new = Point::new((tl.x + iw + gap).min(roi.br().x), (tl.y + ih + gap).min(roi.br().y));

        // Align the sub-canvas with the pyramid grid
        tl_new.x = roi.x + (((tl_new.x - roi.x) >> self.num_bands) << self.num_bands);
        tl_new.y = roi.y + (((tl_new.y - roi.y) >> self.num_bands) << self.num_bands);
        br_new.x = tl_new.x + pad_to_multiple(br_new.x - tl_new.x, step);
        br_new.y = tl_new.y + pad_to_multiple(br_new.y - tl_new.y, step);
        let dx = (br_new.x - roi.br().x).max(0);
        let dy = (br_new.y - roi.br().y).max(0);
        tl_new = Point::new(tl_new.x - dx, tl_new.y - dy);
        br_new = Point::new(br_new.x - dx, br_new.y - dy);

        let (sw, sh) = ((br_new.x - tl_new.x) as usize, (br_new.y - tl_new.y) as usize);
        let (left, top) = (tl.x - tl_new.x, tl.y - tl_new.y);

        // Image with mirrored border, weight with zero border
        let mut src = Plane::zeros(sw, sh, 3);
        let mut weight = Plane::zeros(sw, sh, 1);
        for y in 0..sh {
            let iy = y as i64 - top as i64;
            let ry = reflect(iy, ih as i64) as u32;
            for x in 0..sw {
                let ix = x as i64 - left as i64;
                let p = img.get_pixel(reflect(ix, iw as i64) as u32, ry).0;
                for c in 0..3 {
                    src.data[(y * sw + x) * 3 + c] = p[c] as f32;
                }
                if (0..iw as i64).contains(&ix) && (0..ih as i64).contains(&iy) {
                    weight.data[y * sw + x] = mask.get_pixel(ix as u32, iy as u32).0[0] as f32 / 255.0;
                }
            }
        }

        let src_pyr = laplace_pyramid(src, self.num_bands as usize);
        let mut weight_pyr = Vec::with_capacity(src_pyr.len());
        weight_pyr.push(weight);
        for i in 0..self.num_bands as usize {
            let down = weight_pyr[i].pyr_down();
            weight_pyr.push(down);
        }

        let (mut x_tl, mut y_tl) = ((tl_new.x - roi.x) as usize, (tl_new.y - roi.y) as usize);
        for (level, (lap, wts)) in src_pyr.iter().zip(&weight_pyr).enumerate() {
            let dst = &mut self.dst_pyr[level];
            let dst_w = &mut self.dst_weights[level];
            for y in 0..lap.height {
                let gy = y_tl + y;
                if gy >= dst.height {
                    break;
                }
                for x in 0..lap.width {
                    let gx = x_tl + x;
                    if gx >= dst.width {
                        break;
                    }
                    let wt = wts.at(x, y, 0);
                    let k = gy * dst.width + gx;
                    for c in 0..3 {
                        dst.data[k * 3 + c] += lap.at(x, y, c) * wt;
                    }
                    dst_w.data[k] += wt;
                }
            }
            x_tl /= 2;
            y_tl /= 2;
        }
    }

    fn blend(&mut self) -> (RgbImage, GrayImage) {
        for (lap, wts) in self.dst_pyr.iter_mut().zip(&self.dst_weights) {
            for (k, &wt) in wts.data.iter().enumerate() {
                let norm = wt + WEIGHT_EPS;
                for c in 0..3 {
                    lap.data[k * 3 + c] /= norm;
                }
            }
        }
        restore_from_laplace(&mut self.dst_pyr);

        let (w, h) = self.final_roi.size();
        let mut dst = RgbImage::new(w, h);
        let mut mask = GrayImage::new(w, h);
        if let (Some(base), Some(base_w)) = (self.dst_pyr.first(), self.dst_weights.first()) {
            for y in 0..h as usize {
                for x in 0..w as usize {
                    if base_w.at(x, y, 0) <= WEIGHT_EPS {
                        continue;
                    }
                    let px = [0, 1, 2].map(|c| base.at(x, y, c).round().clamp(0.0, 255.0) as u8);
                    dst.put_pixel(x as u32, y as u32, Rgb(px));
                    mask.put_pixel(x as u32, y as u32, Luma([255]));
                }
            }
        }
        self.dst_pyr.clear();
        self.dst_weights.clear();
        (dst, mask)
    }
}
