//! ORB features (oriented FAST corners + steered BRIEF descriptors) on an
//! image pyramid.
//!
//! ```no_run
//! use pano_features::OrbBuilder;
//!
//! let orb = OrbBuilder::new().features(1000).build()?;
//! let img = vec![0u8; 640 * 480];
//! let (keypoints, descriptors) = orb.detect_and_compute(&img, 640, 480)?;
//! # Ok::<(), pano_features::FeatureError>(())
//! ```

pub mod brief;
pub mod builder;
pub mod detector;
pub mod error;
pub mod orb;
pub mod pyramid;
pub mod refinement;

pub use brief::BriefGenerator;
pub use builder::OrbBuilder;
pub use detector::FastDetector;
pub use error::{FeatureError, FeatureResult};
pub use orb::OrbExtractor;
pub use pano_core::{Descriptor, FeatureConfig, Image, ImageFeatures, Keypoint};
pub use pyramid::{ImagePyramid, ScaleLevel};
pub use refinement::KeypointRefinement;
