use std::path::PathBuf;

use clap::Parser;
use log::error;
use pano_cli::{StitchError, Stitcher};
use pano_stitch::StitchConfig;

/// Rotation-model panorama stitching
#[derive(Debug, Parser)]
#[command(name = "pano", version, about = "Stitch overlapping photos into a panorama")]
struct Args {
    /// Input images
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Options file (.toml or .json); flags given on the command line win
    #[arg(long)]
    config: Option<PathBuf>,

    /// Resulting panorama
    #[arg(long, default_value = "result.jpg")]
    output: PathBuf,

    /// Resolution for image registration step, in megapixels
    #[arg(long, allow_negative_numbers = true)]
    work_megapix: Option<f64>,

    /// Resolution for seam estimation step, in megapixels
    #[arg(long)]
    seam_megapix: Option<f64>,

    /// Resolution for compositing step, negative for the original resolution
    #[arg(long, allow_negative_numbers = true)]
    compose_megapix: Option<f64>,

    /// Type of features used for images matching: orb
    #[arg(long)]
    features: Option<String>,

    /// Confidence for feature matching step
    #[arg(long)]
    match_conf: Option<f32>,

    /// Threshold for two images are from the same panorama confidence
    #[arg(long)]
    conf_thresh: Option<f64>,

    /// Bundle adjustment cost function: reproj or ray
    #[arg(long)]
    ba: Option<String>,

    /// Refinement mask for bundle adjustment, 'x' refines: <fx><skew><ppx><aspect><ppy>
    #[arg(long)]
    ba_refine_mask: Option<String>,

    /// Wave effect correction: no, horiz or vert
    #[arg(long)]
    wave_correct: Option<String>,

    /// Save matches graph in DOT format to this file
    #[arg(long)]
    save_graph: Option<String>,

    /// Warp surface type, e.g. plane, cylindrical, spherical, mercator
    #[arg(long)]
    warp: Option<String>,

    /// Exposure compensation method: no, gain or gain_blocks
    #[arg(long)]
    expos_comp: Option<String>,

    /// Seam estimation method: no, voronoi, gc_color, gc_colorgrad, dp_color or dp_colorgrad
    #[arg(long)]
    seam: Option<String>,

    /// Blending method: none, feather or multiband
    #[arg(long)]
    blend: Option<String>,

    /// Blending strength from [0,100] range
    #[arg(long)]
    blend_strength: Option<f32>,

    /// Try to use GPU
    #[arg(long)]
    try_gpu: bool,
}

impl Args {
    fn apply(self, mut cfg: StitchConfig) -> StitchConfig {
        if let Some(v) = self.work_megapix {
            cfg.work_megapix = v;
        }
        if let Some(v) = self.seam_megapix {
            cfg.seam_megapix = v;
        }
        if let Some(v) = self.compose_megapix {
            cfg.compose_megapix = v;
        }
        if let Some(v) = self.features {
            cfg.features = v;
        }
        if let Some(v) = self.match_conf {
            cfg.match_conf = v;
        }
        if let Some(v) = self.conf_thresh {
            cfg.conf_thresh = v;
        }
        if let Some(v) = self.ba {
            cfg.ba_cost = v;
        }
        if let Some(v) = self.ba_refine_mask {
            cfg.ba_refine_mask = v;
        }
        match self.wave_correct.as_deref() {
            Some("no") => cfg.do_wave_correct = false,
            Some(kind) => {
                cfg.do_wave_correct = true;
                cfg.wave_correct = kind.to_string();
            }
            None => {}
        }
        if self.save_graph.is_some() {
            cfg.save_graph = self.save_graph;
        }
        if let Some(v) = self.warp {
            cfg.warp = v;
        }
        if let Some(v) = self.expos_comp {
            cfg.expos_comp = v;
        }
        if let Some(v) = self.seam {
            cfg.seam = v;
        }
        if let Some(v) = self.blend {
            cfg.blend = v;
        }
        if let Some(v) = self.blend_strength {
            cfg.blend_strength = v;
        }
        cfg.try_gpu |= self.try_gpu;
        cfg
    }
}

fn run(args: Args) -> Result<(), StitchError> {
    let base = match &args.config {
        Some(path) => StitchConfig::load(path)?,
        None => StitchConfig::default(),
    };
    let images = args.images.clone();
    let output = args.output.clone();
    let config = args.apply(base);
    log::debug!("{}", config.summary());

    let stitcher = Stitcher::new(config)?;
    stitcher.stitch_to_file(&images, &output)?;
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run(Args::parse()) {
        error!("{}", err);
        std::process::exit(err.exit_code());
    }
}
