use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pano_features::{
    BriefGenerator, FastDetector, FeatureConfig, Image, ImagePyramid, KeypointRefinement, OrbBuilder,
};

/// Noisy gradient with scattered checker blobs, close enough to a photo for
/// the detector to find a few hundred corners
fn create_benchmark_image(width: usize, height: usize) -> Image {
    let mut img = vec![0u8; width * height];
    for y in 0..height {
        for x in 0..width {
            let gradient = ((x as f32 / width as f32) * 50.0) as u8;
            let noise = ((x * 13 + y * 7) % 11) as u8;
            img[y * width + x] = 100 + gradient + noise;
        }
    }
    for i in 0..64 {
        let cx = (i * 37 * width / 64) % width;
        let cy = (i * 53 * height / 64) % height;
        for dy in -3i32..=3 {
            for dx in -3i32..=3 {
                let x = cx as i32 + dx;
                let y = cy as i32 + dy;
                if x >= 0 && y >= 0 && (x as usize) < width && (y as usize) < height {
                    img[y as usize * width + x as usize] = if (dx + dy) % 2 == 0 { 30 } else { 230 };
                }
            }
        }
    }
    img
}

fn create_test_config() -> FeatureConfig {
    FeatureConfig {
        n_threads: 1, // Single-threaded for consistent benchmarks
        ..FeatureConfig::default()
    }
}

fn bench_detect_and_compute(c: &mut Criterion) {
    let mut group = c.benchmark_group("detect_and_compute");
    for &(width, height) in &[(160, 120), (320, 240), (640, 480)] {
        let orb = OrbBuilder::from_config(create_test_config()).build().unwrap();
        let img = create_benchmark_image(width, height);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}x{}", width, height)),
            &img,
            |b, img| b.iter(|| black_box(orb.detect_and_compute(black_box(img), width, height).unwrap())),
        );
    }
    group.finish();
}

fn bench_pipeline_stages(c: &mut Criterion) {
    let (width, height) = (256, 256);
    let detector = FastDetector::new(create_test_config(), width, height).unwrap();
    let img = create_benchmark_image(width, height);
    let mut group = c.benchmark_group("pipeline_stages");

    group.bench_function("detect_keypoints_with_response", |b| {
        b.iter(|| black_box(detector.detect_keypoints_with_response(black_box(&img)).unwrap()))
    });

    let scored = detector.detect_keypoints_with_response(&img).unwrap();
    group.bench_function("non_maximum_suppression", |b| {
        b.iter(|| black_box(KeypointRefinement::non_maximum_suppression(black_box(&scored), 3.0)))
    });

    let kept = KeypointRefinement::non_maximum_suppression(&scored, 3.0);
    group.bench_function("orientation", |b| {
        b.iter(|| {
            for kp in black_box(&kept) {
                black_box(KeypointRefinement::compute_orientation(&img, width, height, kp.x, kp.y, 15));
            }
        })
    });

    let brief = BriefGenerator::new(31);
    group.bench_function("brief", |b| {
        b.iter(|| black_box(brief.generate_descriptors(black_box(&img), width, height, &kept)))
    });

    let levels = ImagePyramid::generate_scale_levels(width, height, 8, 1.2, 40);
    group.bench_function("build_pyramid", |b| {
        b.iter(|| black_box(ImagePyramid::build_image_pyramid(black_box(&img), &levels)))
    });

    group.finish();
}

criterion_group!(benches, bench_detect_and_compute, bench_pipeline_stages);
criterion_main!(benches);
