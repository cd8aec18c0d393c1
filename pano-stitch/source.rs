//! Where the pipeline gets its full-resolution images from.
//!
//! Images are loaded on demand and dropped by the caller as soon as the
//! scaled copies exist, so a source is asked for the same image more than
//! once (feature pass and compose pass).

use std::path::{Path, PathBuf};

use image::RgbImage;

use crate::error::{StitchError, StitchResult};

pub trait ImageSource: Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Display name of image `i`, used in logs and the match graph
    fn name(&self, i: usize) -> String;

    fn load(&self, i: usize) -> StitchResult<RgbImage>;
}

/// Images read from disk with the `image` crate
#[derive(Debug, Clone)]
pub struct FileImageSource {
    paths: Vec<PathBuf>,
}

impl FileImageSource {
    pub fn new<P: AsRef<Path>>(paths: &[P]) -> Self {
        Self {
            paths: paths.iter().map(|p| p.as_ref().to_path_buf()).collect(),
        }
    }
}

impl ImageSource for FileImageSource {
    fn len(&self) -> usize {
        self.paths.len()
    }

    fn name(&self, i: usize) -> String {
        self.paths.get(i).map(|p| p.display().to_string()).unwrap_or_default()
    }

    fn load(&self, i: usize) -> StitchResult<RgbImage> {
        let path = self.paths.get(i).ok_or_else(|| StitchError::ImageLoad {
            path: format!("#{}", i),
            reason: "no such image".to_string(),
        })?;
        let img = image::open(path).map_err(|e| StitchError::ImageLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(img.to_rgb8())
    }
}

/// Images already in memory, named `image_<i>`
#[derive(Debug, Clone, Default)]
pub struct MemoryImageSource {
    images: Vec<(String, RgbImage)>,
}

impl MemoryImageSource {
    pub fn new(images: Vec<RgbImage>) -> Self {
        Self {
            images: images
                .into_iter()
                .enumerate()
                .map(|(i, img)| (format!("image_{}", i), img))
                .collect(),
        }
    }

    pub fn with_names(images: Vec<(String, RgbImage)>) -> Self {
        Self { images }
    }
}

impl ImageSource for MemoryImageSource {
    fn len(&self) -> usize {
        self.images.len()
    }

    fn name(&self, i: usize) -> String {
        self.images.get(i).map(|(n, _)| n.clone()).unwrap_or_default()
    }

    fn load(&self, i: usize) -> StitchResult<RgbImage> {
        self.images
            .get(i)
            .map(|(_, img)| img.clone())
            .ok_or_else(|| StitchError::ImageLoad {
                path: self.name(i),
                reason: "no such image".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_source() {
        let src = MemoryImageSource::new(vec![RgbImage::new(4, 3), RgbImage::new(2, 2)]);
        assert_eq!(src.len(), 2);
        assert_eq!(src.name(1), "image_1");
        assert_eq!(src.load(0).unwrap().dimensions(), (4, 3));
        assert!(matches!(src.load(5), Err(StitchError::ImageLoad { .. })));
    }

    #[test]
    fn test_missing_file_fails_with_load_error() {
        let src = FileImageSource::new(&["/nonexistent/pano/a.jpg"]);
        let err = src.load(0).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("a.jpg"));
    }
}
