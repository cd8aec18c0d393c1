mod common;

use common::{crop, init_logging, scene};
use pano_stitch::imgops::result_roi;
use pano_stitch::{MemoryImageSource, Pipeline, StitchConfig, StitchError};

fn fast_config() -> StitchConfig {
    StitchConfig {
        seam: "voronoi".to_string(),
        expos_comp: "gain".to_string(),
        ..StitchConfig::default()
    }
}

#[test]
fn test_unrelated_image_is_dropped() {
    init_logging();
    let world = scene(360, 180, 7);
    let a = crop(&world, 0, 0, 220, 180);
    let b = crop(&world, 120, 0, 220, 180);
    let c = scene(220, 180, 99);
    let source = MemoryImageSource::new(vec![a, b, c]);

    let output = Pipeline::new(&fast_config()).unwrap().run(&source).unwrap();
    assert_eq!(output.indices, vec![0, 1]);
    assert_eq!(output.cameras.len(), 2);
    assert!(output.match_graph.starts_with("graph matches_graph{"));
    assert!(output.match_graph.contains("\"image_0\" -- \"image_1\""));
}

#[test]
fn test_weak_overlap_below_threshold_is_dropped() {
    init_logging();
    // C shares only a 10 px strip with A's left edge
    let world = scene(520, 180, 17);
    let a = crop(&world, 160, 0, 220, 180);
    let b = crop(&world, 280, 0, 220, 180);
    let c = crop(&world, 0, 0, 170, 180);
    let source = MemoryImageSource::with_names(vec![
        ("a.jpg".to_string(), a),
        ("b.jpg".to_string(), b),
        ("c.jpg".to_string(), c),
    ]);

    let output = Pipeline::new(&fast_config()).unwrap().run(&source).unwrap();
    assert_eq!(output.indices, vec![0, 1]);
    assert_eq!(output.sizes.len(), 2);
    assert!(output.match_graph.contains("\"a.jpg\" -- \"b.jpg\""));
    assert!(output.match_graph.contains("\"c.jpg\";"));
    // A and B span 340 px of the scene; C would add another 160
    assert!(output.pano.width() < 420, "canvas is {} px wide", output.pano.width());
}

#[test]
fn test_narrow_blend_width_composites_without_blending() {
    init_logging();
    let world = scene(340, 180, 5);
    let source = MemoryImageSource::new(vec![crop(&world, 0, 0, 220, 180), crop(&world, 120, 0, 220, 180)]);
    // sqrt(canvas area) is a few hundred px, so 0.2% stays under one pixel
    let run = |blend: &str| {
        let cfg = StitchConfig {
            blend: blend.to_string(),
            blend_strength: 0.2,
            ..fast_config()
        };
        Pipeline::new(&cfg).unwrap().run(&source).unwrap()
    };

    let copied = run("none");
    for blend in ["multiband", "feather"] {
        let output = run(blend);
        assert_eq!(output.indices, vec![0, 1]);
        assert_eq!(output.pano, copied.pano, "{}", blend);
        assert_eq!(output.mask, copied.mask, "{}", blend);
    }
}

#[test]
fn test_canvas_is_union_of_warped_rects() {
    init_logging();
    let world = scene(360, 180, 11);
    let source = MemoryImageSource::new(vec![crop(&world, 0, 0, 220, 180), crop(&world, 130, 0, 230, 180)]);

    let output = Pipeline::new(&fast_config()).unwrap().run(&source).unwrap();
    let canvas = result_roi(&output.corners, &output.sizes);
    assert_eq!(output.pano.dimensions(), canvas.size());
    assert_eq!(output.mask.dimensions(), canvas.size());
    let covered = output.mask.pixels().filter(|p| p.0[0] != 0).count();
    assert!(covered > 220 * 180, "panorama covers only {} pixels", covered);
}

#[test]
fn test_default_config_stitches() {
    init_logging();
    let world = scene(300, 160, 3);
    let source = MemoryImageSource::new(vec![crop(&world, 0, 0, 180, 160), crop(&world, 120, 0, 180, 160)]);

    let output = Pipeline::new(&StitchConfig::default()).unwrap().run(&source).unwrap();
    assert_eq!(output.indices, vec![0, 1]);
    assert!(output.pano.width() >= 180);
}

#[test]
fn test_disjoint_images_are_insufficient() {
    init_logging();
    let source = MemoryImageSource::new(vec![scene(160, 120, 1), scene(160, 120, 2)]);
    let err = Pipeline::new(&fast_config()).unwrap().run(&source).unwrap_err();
    assert!(matches!(err, StitchError::InsufficientImages(1)));
    assert_eq!(err.exit_code(), -1);
}

#[test]
fn test_configuration_errors_come_first() {
    let cfg = StitchConfig {
        blend: "pyramid".to_string(),
        ..StitchConfig::default()
    };
    let err = Pipeline::new(&cfg).err().unwrap();
    assert!(matches!(err, StitchError::UnknownBlender(_)));
    assert_eq!(err.exit_code(), 1);
}
