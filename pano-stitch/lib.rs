//! Automatic panorama stitching.
//!
//! Images are matched pairwise with ORB features, the largest group of
//! overlapping images is kept, camera rotations and focal lengths are
//! estimated and refined by bundle adjustment, and the images are warped
//! onto a common surface, exposure-compensated, cut along seams and
//! blended.
//!
//! ```no_run
//! use pano_stitch::{FileImageSource, Pipeline, StitchConfig};
//!
//! let pipeline = Pipeline::new(&StitchConfig::default())?;
//! let output = pipeline.run(&FileImageSource::new(&["a.jpg", "b.jpg", "c.jpg"]))?;
//! output.pano.save("result.jpg")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod blender;
pub mod bundle;
pub mod camera;
pub mod config;
pub mod error;
pub mod estimator;
pub mod exposure;
pub mod features;
pub mod graph;
pub mod homography;
pub mod imgops;
pub mod matcher;
pub mod pipeline;
pub mod seam;
pub mod source;
pub mod warpers;
pub mod wave;

pub use blender::{Blender, BlenderKind, FeatherBlender, MultiBandBlender, NoBlender};
pub use bundle::{BaCostFunction, BundleAdjuster, RefinementMask};
pub use camera::{median_focal, CameraParams};
pub use config::{ResolvedConfig, StitchConfig};
pub use error::{StitchError, StitchResult};
pub use estimator::HomographyBasedEstimator;
pub use exposure::{BlocksGainCompensator, ExposureCompensator, ExposureKind, GainCompensator, NoExposureCompensator};
pub use features::{FeaturesFinder, FeaturesKind, OrbFeaturesFinder};
pub use graph::{leave_biggest_component, matches_graph_as_string, Component};
pub use imgops::{Point, Rect};
pub use matcher::{BestOf2NearestMatcher, DMatch, MatchesInfo, PairwiseMatches};
pub use pano_core::{FeatureConfig, ImageFeatures, Keypoint};
pub use pipeline::{Pipeline, PipelineContext, StitchOutput};
pub use seam::{SeamFinder, SeamKind};
pub use source::{FileImageSource, ImageSource, MemoryImageSource};
pub use warpers::{Warper, WarperKind};
pub use wave::{wave_correct, WaveCorrectKind};
