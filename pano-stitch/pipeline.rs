//! The stitching pipeline: feature finding, matching, component selection,
//! camera estimation, seam-scale warping, exposure and seam estimation,
//! then compositing at output resolution.

use std::time::Instant;

use image::{GrayImage, RgbImage};
use log::{debug, info, warn};
use pano_core::ImageFeatures;

use crate::blender::Blender;
use crate::bundle::BundleAdjuster;
use crate::camera::{median_focal, CameraParams};
use crate::config::{ResolvedConfig, StitchConfig};
use crate::error::{StitchError, StitchResult};
use crate::estimator::HomographyBasedEstimator;
use crate::graph::{leave_biggest_component, matches_graph_as_string};
use crate::imgops::{dilate_mask, mask_and, resize_mask, resize_rgb, result_roi, scale_for_megapix, to_float, Point};
use crate::matcher::{BestOf2NearestMatcher, PairwiseMatches};
use crate::source::ImageSource;
use crate::warpers::warp_full_mask;
use crate::wave::wave_correct;

/// Result of a successful run
#[derive(Debug, Clone)]
pub struct StitchOutput {
    pub pano: RgbImage,
    /// Canvas pixels covered by at least one image
    pub mask: GrayImage,
    /// Source indices of the images that made it into the panorama
    pub indices: Vec<usize>,
    /// Canvas placement of each kept image at compose resolution
    pub corners: Vec<Point>,
    pub sizes: Vec<(u32, u32)>,
    /// Cameras at compose resolution
    pub cameras: Vec<CameraParams>,
    /// Match graph in DOT format
    pub match_graph: String,
}

/// Resolution bookkeeping shared by the stages. Every scale is fixed from
/// the first image that needs it and never changes afterwards.
#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    pub work_scale: Option<f64>,
    pub seam_scale: Option<f64>,
    pub compose_scale: Option<f64>,
    /// `seam_scale / work_scale`
    pub seam_work_aspect: f64,
    /// Full-resolution sizes, in source order
    pub full_sizes: Vec<(u32, u32)>,
    pub names: Vec<String>,
}

impl PipelineContext {
    /// Fix work and seam scales from an image of `full_area` pixels
    pub fn set_work_and_seam_scales(&mut self, work_megapix: f64, seam_megapix: f64, full_area: f64) {
        let work = *self.work_scale.get_or_insert_with(|| {
            if work_megapix < 0.0 {
                1.0
            } else {
                scale_for_megapix(work_megapix, full_area)
            }
        });
        if self.seam_scale.is_none() {
            let seam = scale_for_megapix(seam_megapix, full_area);
            self.seam_scale = Some(seam);
            self.seam_work_aspect = seam / work;
        }
    }

    /// On the first call fix the compose scale and move the cameras and the
    /// warper scale from work to compose resolution. Returns false, changing
    /// nothing, once the compose scale is already set.
    pub fn rescale_for_compose(
        &mut self,
        compose_megapix: f64,
        full_area: f64,
        cameras: &mut [CameraParams],
        warped_image_scale: &mut f64,
    ) -> bool {
        if self.compose_scale.is_some() {
            return false;
        }
        let compose = if compose_megapix > 0.0 {
            scale_for_megapix(compose_megapix, full_area)
        } else {
            1.0
        };
        self.compose_scale = Some(compose);
        let compose_work_aspect = compose / self.work_scale.unwrap_or(1.0);
        *warped_image_scale *= compose_work_aspect;
        for cam in cameras.iter_mut() {
            cam.focal *= compose_work_aspect;
            cam.ppx *= compose_work_aspect;
            cam.ppy *= compose_work_aspect;
        }
        debug!("Compose scale {:.3}, compose/work {:.3}", compose, compose_work_aspect);
        true
    }

    /// Size an image of `full_size` has at compose resolution
    pub fn compose_size(&self, full_size: (u32, u32)) -> (u32, u32) {
        match self.compose_scale {
            Some(s) if needs_resize(s) => (
                ((full_size.0 as f64 * s).round() as u32).max(1),
                ((full_size.1 as f64 * s).round() as u32).max(1),
            ),
            _ => full_size,
        }
    }
}

/// Compose-pass resizing is skipped for scales within 10% of 1
fn needs_resize(scale: f64) -> bool {
    (scale - 1.0).abs() > 0.1
}

/// No GPU backend is built in; a request only produces a warning
fn gpu_available() -> bool {
    false
}

pub struct Pipeline {
    cfg: ResolvedConfig,
}

impl Pipeline {
    /// Validate the configuration; fails on the first unknown kind name
    pub fn new(cfg: &StitchConfig) -> StitchResult<Self> {
        Ok(Self::from_resolved(cfg.resolve()?))
    }

    pub fn from_resolved(cfg: ResolvedConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.cfg
    }

    pub fn run(&self, source: &dyn ImageSource) -> StitchResult<StitchOutput> {
        let num_images = source.len();
        if num_images < 2 {
            return Err(StitchError::InsufficientImages(num_images));
        }
        if self.cfg.try_gpu && !gpu_available() {
            warn!("GPU requested but not available, running on CPU");
        }
        let app_start = Instant::now();
        let mut ctx = PipelineContext::default();

        let (features, seam_images) = self.find_features(source, &mut ctx)?;

        let t = Instant::now();
        info!("Pairwise matching");
        let matcher = BestOf2NearestMatcher::new(self.cfg.match_conf);
        let matches = matcher.match_all(&features);
        info!("Pairwise matching, time: {:.3} sec", t.elapsed().as_secs_f64());

        let match_graph = matches_graph_as_string(&ctx.names, &matches, self.cfg.conf_thresh);
        if let Some(path) = &self.cfg.save_graph {
            info!("Saving matches graph to {}", path);
            std::fs::write(path, &match_graph)?;
        }

        let component = leave_biggest_component(&features, &matches, self.cfg.conf_thresh);
        let indices = component.indices;
        if indices.len() < 2 {
            return Err(StitchError::InsufficientImages(indices.len()));
        }
        let seam_images: Vec<RgbImage> = {
            let mut slots: Vec<Option<RgbImage>> = seam_images.into_iter().map(Some).collect();
            indices.iter().filter_map(|&i| slots[i].take()).collect()
        };
        let full_sizes: Vec<(u32, u32)> = indices.iter().map(|&i| ctx.full_sizes[i]).collect();

        let (mut cameras, mut warped_image_scale) = self.estimate_cameras(&component.features, &component.matches);

        // Seam pass
        let t = Instant::now();
        info!("Warping images (auxiliary)...");
        let seam_work_aspect = ctx.seam_work_aspect;
        let warper = self.cfg.warp.create(warped_image_scale * seam_work_aspect);
        let mut corners = Vec::with_capacity(indices.len());
        let mut images_warped = Vec::with_capacity(indices.len());
        let mut masks_warped = Vec::with_capacity(indices.len());
        for (img, cam) in seam_images.iter().zip(&cameras) {
            let k = cam.scaled_k(seam_work_aspect);
            let r = cam.r64();
            let (corner, warped) = warper.warp(img, &k, &r);
            let (_, mask) = warp_full_mask(&warper, img.dimensions(), &k, &r);
            corners.push(corner);
            images_warped.push(warped);
            masks_warped.push(mask);
        }
        drop(seam_images);
        info!("Warping images, time: {:.3} sec", t.elapsed().as_secs_f64());

        let t = Instant::now();
        let mut compensator = self.cfg.exposure.create();
        compensator.feed(&corners, &images_warped, &masks_warped);
        debug!("Exposure compensation, time: {:.3} sec", t.elapsed().as_secs_f64());

        let t = Instant::now();
        let images_warped_f: Vec<_> = images_warped.iter().map(to_float).collect();
        drop(images_warped);
        let seam_masks = self.cfg.seam.create().find(&images_warped_f, &corners, &masks_warped);
        drop(images_warped_f);
        drop(masks_warped);
        debug!("Finding seams, time: {:.3} sec", t.elapsed().as_secs_f64());

        // Compose pass
        let t = Instant::now();
        info!("Compositing...");
        let mut compose_warper = None;
        let mut compose_corners = Vec::new();
        let mut compose_sizes = Vec::new();
        let mut blender: Option<Box<dyn Blender>> = None;

        for (img_idx, &src_idx) in indices.iter().enumerate() {
            info!("Compositing image #{}", src_idx + 1);
            let full_img = source.load(src_idx)?;

            let full_area = full_img.width() as f64 * full_img.height() as f64;
            if ctx.rescale_for_compose(self.cfg.compose_megapix, full_area, &mut cameras, &mut warped_image_scale) {
                let w = self.cfg.warp.create(warped_image_scale);
                for (cam, &full_size) in cameras.iter().zip(&full_sizes) {
                    let roi = w.warp_roi(ctx.compose_size(full_size), &cam.k(), &cam.r64());
                    compose_corners.push(roi.tl());
                    compose_sizes.push(roi.size());
                }
                compose_warper = Some(w);
            }
            let Some(warper) = compose_warper.as_ref() else {
                continue;
            };

            let compose_scale = ctx.compose_scale.unwrap_or(1.0);
            let img = if needs_resize(compose_scale) {
                resize_rgb(&full_img, compose_scale)
            } else {
                full_img
            };

            let cam = &cameras[img_idx];
            let (k, r) = (cam.k(), cam.r64());
            let (_, mut img_warped) = warper.warp(&img, &k, &r);
            let (_, mask_warped) = warp_full_mask(warper, img.dimensions(), &k, &r);
            drop(img);

            compensator.apply(img_idx, compose_corners[img_idx], &mut img_warped, &mask_warped);

            let dilated = dilate_mask(&seam_masks[img_idx]);
            let seam_mask = resize_mask(&dilated, mask_warped.width(), mask_warped.height());
            let mask = mask_and(&seam_mask, &mask_warped);

            let blender = blender.get_or_insert_with(|| {
                let canvas = result_roi(&compose_corners, &compose_sizes);
                let mut b = self.cfg.blend.create(self.cfg.blend_strength, canvas.area() as f64);
                b.prepare(canvas);
                b
            });
            blender.feed(&img_warped, &mask, compose_corners[img_idx]);
        }

        let (pano, mask) = match blender.as_mut() {
            Some(b) => b.blend(),
            None => return Err(StitchError::InsufficientImages(0)),
        };
        info!("Compositing, time: {:.3} sec", t.elapsed().as_secs_f64());
        info!("Finished, total time: {:.3} sec", app_start.elapsed().as_secs_f64());

        Ok(StitchOutput {
            pano,
            mask,
            indices,
            corners: compose_corners,
            sizes: compose_sizes,
            cameras,
            match_graph,
        })
    }

    /// Load every image once: features at work scale, a copy at seam scale
    fn find_features(
        &self,
        source: &dyn ImageSource,
        ctx: &mut PipelineContext,
    ) -> StitchResult<(Vec<ImageFeatures>, Vec<RgbImage>)> {
        let t = Instant::now();
        info!("Finding features...");
        let finder = self.cfg.features.create(&self.cfg.orb)?;
        let mut features = Vec::with_capacity(source.len());
        let mut seam_images = Vec::with_capacity(source.len());

        for i in 0..source.len() {
            let full_img = source.load(i)?;
            let (w, h) = full_img.dimensions();
            ctx.full_sizes.push((w, h));
            ctx.names.push(source.name(i));
            ctx.set_work_and_seam_scales(self.cfg.work_megapix, self.cfg.seam_megapix, w as f64 * h as f64);

            let work_scale = ctx.work_scale.unwrap_or(1.0);
            let work_img = if self.cfg.work_megapix < 0.0 {
                full_img.clone()
            } else {
                resize_rgb(&full_img, work_scale)
            };
            let f = finder.find(&work_img, i)?;
            info!("Features in image #{}: {}", i + 1, f.len());
            features.push(f);

            seam_images.push(resize_rgb(&full_img, ctx.seam_scale.unwrap_or(1.0)));
        }
        info!("Finding features, time: {:.3} sec", t.elapsed().as_secs_f64());
        Ok((features, seam_images))
    }

    /// Initial cameras, bundle adjustment, wave correction. Also returns the
    /// warper scale at work resolution (median focal).
    fn estimate_cameras(&self, features: &[ImageFeatures], matches: &PairwiseMatches) -> (Vec<CameraParams>, f64) {
        let t = Instant::now();
        let mut cameras = HomographyBasedEstimator.estimate(features, matches);
        for (i, cam) in cameras.iter().enumerate() {
            debug!("Initial camera intrinsics #{}: f={:.2} pp=({:.1}, {:.1})", i + 1, cam.focal, cam.ppx, cam.ppy);
        }

        let adjuster = BundleAdjuster::new(self.cfg.ba_cost, self.cfg.conf_thresh, self.cfg.refine_mask);
        cameras = adjuster.adjust(features, matches, &cameras);
        for (i, cam) in cameras.iter().enumerate() {
            debug!("Camera #{}: f={:.2} pp=({:.1}, {:.1})", i + 1, cam.focal, cam.ppx, cam.ppy);
        }

        let warped_image_scale = median_focal(&cameras);
        if let Some(kind) = self.cfg.wave_correct {
            cameras = wave_correct(&cameras, kind);
        }
        info!("Camera estimation, time: {:.3} sec", t.elapsed().as_secs_f64());
        (cameras, warped_image_scale)
    }
}
