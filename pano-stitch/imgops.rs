//! Canvas geometry and small raster helpers shared by the stages.

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgb32FImage, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::morphology::dilate;

/// Integer position on the panorama canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned rectangle; `br()` is exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn from_corner(tl: Point, size: (u32, u32)) -> Self {
        Self::new(tl.x, tl.y, size.0, size.1)
    }

    /// Rectangle spanning `tl` up to the exclusive `br`; empty if inverted
    pub fn from_tl_br(tl: Point, br: Point) -> Self {
        Self::new(
            tl.x,
            tl.y,
            (br.x - tl.x).max(0) as u32,
            (br.y - tl.y).max(0) as u32,
        )
    }

    pub fn tl(&self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn br(&self) -> Point {
        Point::new(self.x + self.width as i32, self.y + self.height as i32)
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let tl = Point::new(self.x.max(other.x), self.y.max(other.y));
        let br = Point::new(self.br().x.min(other.br().x), self.br().y.min(other.br().y));
        let r = Rect::from_tl_br(tl, br);
        (!r.is_empty()).then_some(r)
    }

    pub fn union(&self, other: &Rect) -> Rect {
        let tl = Point::new(self.x.min(other.x), self.y.min(other.y));
        let br = Point::new(self.br().x.max(other.br().x), self.br().y.max(other.br().y));
        Rect::from_tl_br(tl, br)
    }
}

/// Bounding rectangle of all images placed at `corners` with `sizes`
pub fn result_roi(corners: &[Point], sizes: &[(u32, u32)]) -> Rect {
    corners
        .iter()
        .zip(sizes)
        .map(|(&c, &s)| Rect::from_corner(c, s))
        .reduce(|a, b| a.union(&b))
        .unwrap_or_default()
}

/// Scale bringing an image of `area` pixels down to `megapix` megapixels,
/// never enlarging
pub fn scale_for_megapix(megapix: f64, area: f64) -> f64 {
    if area <= 0.0 {
        return 1.0;
    }
    (megapix * 1e6 / area).sqrt().min(1.0)
}

fn scaled_dim(dim: u32, scale: f64) -> u32 {
    ((dim as f64 * scale).round() as u32).max(1)
}

/// Resize by a uniform factor with a linear filter
pub fn resize_rgb(img: &RgbImage, scale: f64) -> RgbImage {
    let (w, h) = img.dimensions();
    let (nw, nh) = (scaled_dim(w, scale), scaled_dim(h, scale));
    if (nw, nh) == (w, h) {
        return img.clone();
    }
    imageops::resize(img, nw, nh, FilterType::Triangle)
}

/// Resize a mask to an exact size and snap it back to {0, 255}
pub fn resize_mask(mask: &GrayImage, width: u32, height: u32) -> GrayImage {
    let mut out = if mask.dimensions() == (width, height) {
        mask.clone()
    } else {
        imageops::resize(mask, width, height, FilterType::Triangle)
    };
    for p in out.pixels_mut() {
        p.0[0] = if p.0[0] >= 128 { 255 } else { 0 };
    }
    out
}

pub fn full_mask(width: u32, height: u32) -> GrayImage {
    GrayImage::from_pixel(width, height, Luma([255]))
}

/// 3x3 dilation
pub fn dilate_mask(mask: &GrayImage) -> GrayImage {
    dilate(mask, Norm::LInf, 1)
}

/// Pixelwise AND of two equally sized masks
pub fn mask_and(a: &GrayImage, b: &GrayImage) -> GrayImage {
    let mut out = a.clone();
    for (p, q) in out.pixels_mut().zip(b.pixels()) {
        p.0[0] &= q.0[0];
    }
    out
}

/// Distance of a pixel to the border of the region it lies in
pub const FAR: f32 = 1e9;

/// City-block distance from every pixel to the nearest pixel for which
/// `is_source` holds, by a two-pass chamfer sweep. Sources get 0; with no
/// source at all every pixel gets [`FAR`].
pub fn distance_transform_l1(width: usize, height: usize, is_source: impl Fn(usize, usize) -> bool) -> Vec<f32> {
    let mut d = vec![FAR; width * height];
    for y in 0..height {
        for x in 0..width {
            if is_source(x, y) {
                d[y * width + x] = 0.0;
            }
        }
    }
    for y in 0..height {
        for x in 0..width {
            let i = y * width + x;
            if x > 0 {
                d[i] = d[i].min(d[i - 1] + 1.0);
            }
            if y > 0 {
                d[i] = d[i].min(d[i - width] + 1.0);
            }
        }
    }
    for y in (0..height).rev() {
        for x in (0..width).rev() {
            let i = y * width + x;
            if x + 1 < width {
                d[i] = d[i].min(d[i + 1] + 1.0);
            }
            if y + 1 < height {
                d[i] = d[i].min(d[i + width] + 1.0);
            }
        }
    }
    for v in d.iter_mut() {
        if *v >= FAR {
            *v = FAR;
        }
    }
    d
}

/// Index into [0, n) mirroring at the borders with the edge pixel
/// repeated: `cba|abc|cba`
pub fn reflect(i: i64, n: i64) -> usize {
    if n <= 1 {
        return 0;
    }
    let period = 2 * n;
    let m = i.rem_euclid(period);
    (if m < n { m } else { period - 1 - m }) as usize
}

/// Index into [0, n) mirroring at the borders around the edge pixel:
/// `dcb|abcd|cba`
pub fn reflect101(i: i64, n: i64) -> usize {
    if n <= 1 {
        return 0;
    }
    let period = 2 * (n - 1);
    let m = i.rem_euclid(period);
    (if m < n { m } else { period - m }) as usize
}

pub fn to_float(img: &RgbImage) -> Rgb32FImage {
    Rgb32FImage::from_fn(img.width(), img.height(), |x, y| {
        let p = img.get_pixel(x, y).0;
        image::Rgb([p[0] as f32, p[1] as f32, p[2] as f32])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_ops() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(5, -5, 10, 10);
        assert_eq!(a.intersect(&b), Some(Rect::new(5, 0, 5, 5)));
        assert_eq!(a.union(&b), Rect::new(0, -5, 15, 15));
        assert_eq!(a.intersect(&Rect::new(10, 0, 3, 3)), None);
        assert_eq!(b.br(), Point::new(15, 5));
    }

    #[test]
    fn test_result_roi() {
        let corners = [Point::new(-3, 2), Point::new(10, -1)];
        let sizes = [(5, 5), (4, 2)];
        assert_eq!(result_roi(&corners, &sizes), Rect::new(-3, -1, 17, 8));
        assert!(result_roi(&[], &[]).is_empty());
    }

    #[test]
    fn test_scale_for_megapix() {
        assert_eq!(scale_for_megapix(0.6, 100.0 * 100.0), 1.0);
        let s = scale_for_megapix(0.25, 1000.0 * 1000.0);
        assert!((s - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_distance_transform() {
        let d = distance_transform_l1(5, 1, |x, _| x == 0);
        assert_eq!(d, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        let d = distance_transform_l1(3, 3, |x, y| x == 1 && y == 1);
        assert_eq!(d[0], 2.0);
        assert_eq!(d[1], 1.0);
        assert!(distance_transform_l1(2, 2, |_, _| false).iter().all(|&v| v == FAR));
    }

    #[test]
    fn test_reflect() {
        assert_eq!(reflect(-1, 5), 0);
        assert_eq!(reflect(-2, 5), 1);
        assert_eq!(reflect(5, 5), 4);
        assert_eq!(reflect(6, 5), 3);
        assert_eq!(reflect(3, 5), 3);
        assert_eq!(reflect(-7, 1), 0);
        assert_eq!(reflect101(-1, 5), 1);
        assert_eq!(reflect101(5, 5), 3);
        assert_eq!(reflect101(-9, 5), 1);
        assert_eq!(reflect101(4, 1), 0);
    }

    #[test]
    fn test_mask_helpers() {
        let mut m = GrayImage::new(5, 5);
        m.put_pixel(2, 2, Luma([255]));
        let d = dilate_mask(&m);
        assert_eq!(d.pixels().filter(|p| p.0[0] == 255).count(), 9);
        let r = resize_mask(&full_mask(4, 4), 8, 6);
        assert_eq!(r.dimensions(), (8, 6));
        assert!(r.pixels().all(|p| p.0[0] == 255));
        let and = mask_and(&d, &m);
        assert_eq!(and.pixels().filter(|p| p.0[0] == 255).count(), 1);
    }
}
