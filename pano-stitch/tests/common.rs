//! Synthetic scenes shared by the integration tests.

#![allow(dead_code)]

use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Wide scene of randomly colored 8x8 blocks over a smooth gradient
pub fn scene(width: u32, height: u32, seed: u64) -> RgbImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let (cols, rows) = (width.div_ceil(8), height.div_ceil(8));
    let cells: Vec<[u8; 3]> = (0..cols * rows)
        .map(|_| [rng.random_range(20..236), rng.random_range(20..236), rng.random_range(20..236)])
        .collect();
    RgbImage::from_fn(width, height, |x, y| {
        let c = cells[((y / 8) * cols + x / 8) as usize];
        let shade = (x * 20 / width) as u8;
        Rgb([c[0].saturating_add(shade), c[1], c[2].saturating_sub(shade)])
    })
}

pub fn crop(img: &RgbImage, x: u32, y: u32, w: u32, h: u32) -> RgbImage {
    image::imageops::crop_imm(img, x, y, w, h).to_image()
}
