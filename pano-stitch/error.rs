use pano_features::FeatureError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StitchError {
    #[error("Can't open image {path}: {reason}")]
    ImageLoad { path: String, reason: String },
    #[error("Need more images: {0} usable, at least 2 required")]
    InsufficientImages(usize),
    #[error("Unknown bundle adjustment cost function: '{0}'")]
    UnknownCostFunction(String),
    #[error("Unknown warper type: '{0}'")]
    UnknownWarperType(String),
    #[error("Unknown seam finder: '{0}'")]
    UnknownSeamFinderKind(String),
    #[error("Unknown features type: '{0}'")]
    UnknownFeaturesKind(String),
    #[error("Unknown exposure compensator: '{0}'")]
    UnknownExposureCompensator(String),
    #[error("Unknown blender: '{0}'")]
    UnknownBlender(String),
    #[error("Unknown wave correction: '{0}'")]
    UnknownWaveCorrect(String),
    #[error("Invalid refinement mask '{0}': expected 5 characters of 'x' or '_'")]
    InvalidRefinementMask(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Feature extraction failed: {0}")]
    Features(#[from] FeatureError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

impl StitchError {
    /// Process exit status for this error: -1 when too few images survive,
    /// 2 for I/O and decode failures, 1 for everything else
    pub fn exit_code(&self) -> i32 {
        match self {
            StitchError::InsufficientImages(_) => -1,
            StitchError::ImageLoad { .. } | StitchError::Io(_) | StitchError::Image(_) => 2,
            _ => 1,
        }
    }
}

pub type StitchResult<T> = Result<T, StitchError>;
