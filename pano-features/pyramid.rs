use pano_core::Image;
use crate::refinement::KeypointRefinement;

/// Scale information for pyramid levels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleLevel {
    pub level: usize,
    /// Base-image pixels per level pixel
    pub scale: f32,
    pub width: usize,
    pub height: usize,
}

impl ScaleLevel {
    /// Map a level coordinate back to the base image (pixel-centre aligned)
    pub fn to_base(&self, x: f32, y: f32) -> (f32, f32) {
        ((x + 0.5) * self.scale - 0.5, (y + 0.5) * self.scale - 0.5)
    }
}

/// Image pyramid operations for multi-scale feature detection
pub struct ImagePyramid;

impl ImagePyramid {
    /// Generate up to `n_levels` levels, each `scale_factor` smaller than the
    /// previous, stopping before a level drops below `min_size` pixels
    pub fn generate_scale_levels(
        width: usize,
        height: usize,
        n_levels: usize,
        scale_factor: f32,
        min_size: usize,
    ) -> Vec<ScaleLevel> {
        let mut levels = Vec::with_capacity(n_levels);
        let mut current_scale = 1.0f32;

        for level in 0..n_levels {
            let scaled_width = ((width as f32) / current_scale).round() as usize;
            let scaled_height = ((height as f32) / current_scale).round() as usize;

            if scaled_width < min_size || scaled_height < min_size {
                break;
            }

            levels.push(ScaleLevel {
                level,
                scale: current_scale,
                width: scaled_width,
                height: scaled_height,
            });

            current_scale *= scale_factor;
        }

        levels
    }

    /// Build the pyramid; every level is resampled from the previous one so
    /// each step only shrinks by `scale_factor`
    pub fn build_image_pyramid(img: &Image, scale_levels: &[ScaleLevel]) -> Vec<Image> {
        let mut pyramid: Vec<Image> = Vec::with_capacity(scale_levels.len());

        for (i, scale_level) in scale_levels.iter().enumerate() {
            if i == 0 {
                pyramid.push(img.clone());
            } else {
                let prev = &scale_levels[i - 1];
                let downsampled = Self::downsample_image(
                    &pyramid[i - 1],
                    prev.width,
                    prev.height,
                    scale_level.width,
                    scale_level.height,
                );
                pyramid.push(downsampled);
            }
        }

        pyramid
    }

    /// Downsample image using bilinear interpolation at pixel centres
    fn downsample_image(
        img: &Image,
        src_width: usize,
        src_height: usize,
        target_width: usize,
        target_height: usize,
    ) -> Image {
        let mut downsampled = vec![0u8; target_width * target_height];

        let x_ratio = src_width as f32 / target_width as f32;
        let y_ratio = src_height as f32 / target_height as f32;

        for y in 0..target_height {
            let src_y = (y as f32 + 0.5) * y_ratio - 0.5;
            for x in 0..target_width {
                let src_x = (x as f32 + 0.5) * x_ratio - 0.5;
                let value = KeypointRefinement::bilinear_sample(img, src_width, src_height, src_x, src_y);
                downsampled[y * target_width + x] = value.round().clamp(0.0, 255.0) as u8;
            }
        }

        downsampled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_levels() {
        let levels = ImagePyramid::generate_scale_levels(640, 480, 8, 1.2, 32);
        assert_eq!(levels.len(), 8);
        assert_eq!(levels[0].width, 640);
        assert!(levels.windows(2).all(|w| w[1].width < w[0].width));

        let small = ImagePyramid::generate_scale_levels(40, 40, 8, 1.2, 32);
        assert_eq!(small.len(), 2);
    }

    #[test]
    fn test_pyramid_sizes_and_values() {
        let levels = ImagePyramid::generate_scale_levels(64, 48, 3, 2.0, 8);
        let img = vec![77u8; 64 * 48];
        let pyramid = ImagePyramid::build_image_pyramid(&img, &levels);
        assert_eq!(pyramid.len(), 3);
        for (lvl, data) in levels.iter().zip(&pyramid) {
            assert_eq!(data.len(), lvl.width * lvl.height);
            assert!(data.iter().all(|&v| v == 77));
        }
    }

    #[test]
    fn test_to_base() {
        let lvl = ScaleLevel { level: 1, scale: 2.0, width: 10, height: 10 };
        assert_eq!(lvl.to_base(0.0, 0.0), (0.5, 0.5));
        assert_eq!(lvl.to_base(4.5, 1.5), (9.5, 3.5));
    }
}
