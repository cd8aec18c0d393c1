//! Stitching options.
//!
//! [`StitchConfig`] carries the options as names, the way they appear on
//! the command line or in a config file. [`StitchConfig::resolve`] checks
//! every name up front and turns the options into closed enums, so a typo
//! fails before any image is read.

use pano_core::FeatureConfig;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::blender::BlenderKind;
use crate::bundle::{BaCostFunction, RefinementMask};
use crate::error::{StitchError, StitchResult};
use crate::exposure::ExposureKind;
use crate::features::FeaturesKind;
use crate::seam::SeamKind;
use crate::warpers::WarperKind;
use crate::wave::WaveCorrectKind;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StitchConfig {
    /// Resolution for feature detection and camera estimation, in
    /// megapixels; negative keeps the source resolution
    pub work_megapix: f64,
    /// Resolution for seam estimation, in megapixels
    pub seam_megapix: f64,
    /// Resolution of the output; negative keeps the source resolution
    pub compose_megapix: f64,
    pub features: String,
    /// Ratio-test margin: a match needs `d1 < (1 - match_conf) * d2`
    pub match_conf: f32,
    /// Minimum pair confidence for two images to count as connected
    pub conf_thresh: f64,
    pub ba_cost: String,
    /// Five characters for fx, skew, ppx, aspect, ppy: `x` refines, `_`
    /// keeps the parameter fixed
    pub ba_refine_mask: String,
    pub do_wave_correct: bool,
    pub wave_correct: String,
    pub warp: String,
    pub expos_comp: String,
    pub seam: String,
    pub blend: String,
    /// Blend transition width in percent, 0..=100
    pub blend_strength: f32,
    pub try_gpu: bool,
    /// Write the match graph in DOT format to this file
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub save_graph: Option<String>,
    /// Detector settings for the `orb` features kind
    pub orb: FeatureConfig,
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            work_megapix: 0.6,
            seam_megapix: 0.1,
            compose_megapix: -1.0,
            features: "orb".to_string(),
            match_conf: 0.3,
            conf_thresh: 1.0,
            ba_cost: "ray".to_string(),
            ba_refine_mask: "xxxxx".to_string(),
            do_wave_correct: true,
            wave_correct: "horiz".to_string(),
            warp: "spherical".to_string(),
            expos_comp: "gain_blocks".to_string(),
            seam: "gc_color".to_string(),
            blend: "multiband".to_string(),
            blend_strength: 5.0,
            try_gpu: false,
            save_graph: None,
            orb: FeatureConfig::default(),
        }
    }
}

/// Validated options with every kind resolved
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub work_megapix: f64,
    pub seam_megapix: f64,
    pub compose_megapix: f64,
    pub features: FeaturesKind,
    pub orb: FeatureConfig,
    pub match_conf: f32,
    pub conf_thresh: f64,
    pub ba_cost: BaCostFunction,
    pub refine_mask: RefinementMask,
    pub wave_correct: Option<WaveCorrectKind>,
    pub warp: WarperKind,
    pub exposure: ExposureKind,
    pub seam: SeamKind,
    pub blend: BlenderKind,
    pub blend_strength: f32,
    pub try_gpu: bool,
    pub save_graph: Option<String>,
}

impl StitchConfig {
    pub fn resolve(&self) -> StitchResult<ResolvedConfig> {
        if !(self.match_conf > 0.0 && self.match_conf < 1.0) {
            return Err(StitchError::InvalidConfig(format!(
                "match_conf must be in (0, 1), got {}",
                self.match_conf
            )));
        }
        if !(0.0..=100.0).contains(&self.blend_strength) {
            return Err(StitchError::InvalidConfig(format!(
                "blend_strength must be in [0, 100], got {}",
                self.blend_strength
            )));
        }
        if self.seam_megapix <= 0.0 {
            return Err(StitchError::InvalidConfig(format!(
                "seam_megapix must be positive, got {}",
                self.seam_megapix
            )));
        }
        if !self.conf_thresh.is_finite() || self.conf_thresh < 0.0 {
            return Err(StitchError::InvalidConfig(format!(
                "conf_thresh must be non-negative, got {}",
                self.conf_thresh
            )));
        }

        let wave_correct = WaveCorrectKind::from_name(&self.wave_correct)?;
        Ok(ResolvedConfig {
            work_megapix: self.work_megapix,
            seam_megapix: self.seam_megapix,
            compose_megapix: self.compose_megapix,
            features: FeaturesKind::from_name(&self.features)?,
            orb: self.orb.clone(),
            match_conf: self.match_conf,
            conf_thresh: self.conf_thresh,
            ba_cost: BaCostFunction::from_name(&self.ba_cost)?,
            refine_mask: RefinementMask::parse(&self.ba_refine_mask)?,
            wave_correct: self.do_wave_correct.then_some(wave_correct),
            warp: WarperKind::from_name(&self.warp)?,
            exposure: ExposureKind::from_name(&self.expos_comp)?,
            seam: SeamKind::from_name(&self.seam)?,
            blend: BlenderKind::from_name(&self.blend)?,
            blend_strength: self.blend_strength,
            try_gpu: self.try_gpu,
            save_graph: self.save_graph.clone(),
        })
    }

    pub fn summary(&self) -> String {
        format!(
            "StitchConfig: work={}MP seam={}MP compose={}MP, features={}, match_conf={}, conf_thresh={}, ba={} ({}), wave={}, warp={}, expos={}, seam={}, blend={} ({})",
            self.work_megapix,
            self.seam_megapix,
            self.compose_megapix,
            self.features,
            self.match_conf,
            self.conf_thresh,
            self.ba_cost,
            self.ba_refine_mask,
            if self.do_wave_correct { self.wave_correct.as_str() } else { "off" },
            self.warp,
            self.expos_comp,
            self.seam,
            self.blend,
            self.blend_strength
        )
    }

    #[cfg(feature = "serde")]
    pub fn save_json<P: AsRef<std::path::Path>>(&self, path: P) -> StitchResult<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    #[cfg(feature = "serde")]
    pub fn load_json<P: AsRef<std::path::Path>>(path: P) -> StitchResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    #[cfg(feature = "serde")]
    pub fn save_toml<P: AsRef<std::path::Path>>(&self, path: P) -> StitchResult<()> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    #[cfg(feature = "serde")]
    pub fn load_toml<P: AsRef<std::path::Path>>(path: P) -> StitchResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load from a `.json` or `.toml` file, picked by extension
    #[cfg(feature = "serde")]
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> StitchResult<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::load_json(path),
            Some("toml") => Self::load_toml(path),
            _ => Err(StitchError::InvalidConfig(format!(
                "unsupported config file '{}': expected .json or .toml",
                path.display()
            ))),
        }
    }

    #[cfg(feature = "serde")]
    pub fn to_json(&self) -> StitchResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| StitchError::InvalidConfig(e.to_string()))
    }

    #[cfg(feature = "serde")]
    pub fn from_json(json: &str) -> StitchResult<Self> {
        serde_json::from_str(json).map_err(|e| StitchError::InvalidConfig(e.to_string()))
    }

    #[cfg(feature = "serde")]
    pub fn to_toml(&self) -> StitchResult<String> {
        toml::to_string_pretty(self).map_err(|e| StitchError::InvalidConfig(e.to_string()))
    }

    #[cfg(feature = "serde")]
    pub fn from_toml(toml_str: &str) -> StitchResult<Self> {
        toml::from_str(toml_str).map_err(|e| StitchError::InvalidConfig(e.to_string()))
    }
}
