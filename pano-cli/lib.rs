use std::path::Path;

use log::{debug, info};
use pano_core::init_thread_pool;
use pano_stitch::{FileImageSource, ImageSource, Pipeline, StitchConfig, StitchOutput, StitchResult};

pub use pano_stitch;
pub use pano_stitch::StitchError;

/// High-level stitcher: a validated pipeline plus file input and output
pub struct Stitcher {
    config: StitchConfig,
    pipeline: Pipeline,
}

impl Stitcher {
    /// Validate `config` and size the worker pool from its ORB thread count
    pub fn new(config: StitchConfig) -> StitchResult<Self> {
        let pipeline = Pipeline::new(&config)?;
        if let Err(e) = init_thread_pool(config.orb.n_threads) {
            // Only the first pool in a process can be configured
            debug!("Keeping existing thread pool: {}", e);
        }
        Ok(Self { config, pipeline })
    }

    /// Load options from a `.toml` or `.json` file
    pub fn from_config_file<P: AsRef<Path>>(path: P) -> StitchResult<Self> {
        Self::new(StitchConfig::load(path)?)
    }

    pub fn config(&self) -> &StitchConfig {
        &self.config
    }

    pub fn stitch(&self, source: &dyn ImageSource) -> StitchResult<StitchOutput> {
        self.pipeline.run(source)
    }

    pub fn stitch_files<P: AsRef<Path>>(&self, paths: &[P]) -> StitchResult<StitchOutput> {
        self.stitch(&FileImageSource::new(paths))
    }

    /// Stitch `paths` and write the panorama to `output`; the format
    /// follows the file extension
    pub fn stitch_to_file<P: AsRef<Path>, Q: AsRef<Path>>(&self, paths: &[P], output: Q) -> StitchResult<StitchOutput> {
        let result = self.stitch_files(paths)?;
        result.pano.save(output.as_ref())?;
        info!(
            "Saved {}x{} panorama to {}",
            result.pano.width(),
            result.pano.height(),
            output.as_ref().display()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = StitchConfig {
            warp: "sphere".to_string(),
            ..StitchConfig::default()
        };
        assert!(matches!(Stitcher::new(config), Err(StitchError::UnknownWarperType(_))));
    }

    #[test]
    fn test_missing_input_fails_fast() {
        let stitcher = Stitcher::new(StitchConfig::default()).unwrap();
        let err = stitcher
            .stitch_files(&["/nonexistent/pano/a.jpg", "/nonexistent/pano/b.jpg"])
            .unwrap_err();
        assert!(matches!(err, StitchError::ImageLoad { .. }));
        assert_eq!(err.exit_code(), 2);
    }
}
