use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use image::{Rgb, RgbImage};
use nalgebra::{Matrix3, Rotation3, Vector3};
use pano_stitch::imgops::{full_mask, to_float};
use pano_stitch::{BlenderKind, Point, Rect, SeamKind, WarperKind};

fn create_benchmark_image(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let cell = ((x / 8) * 31 + (y / 8) * 17) as usize;
        let v = ((cell * 2654435761usize >> 7) % 200 + 30) as u8;
        Rgb([v, (x * 255 / width) as u8, 255 - v])
    })
}

fn intrinsics(f: f64, w: u32, h: u32) -> Matrix3<f64> {
    Matrix3::new(f, 0.0, w as f64 / 2.0, 0.0, f, h as f64 / 2.0, 0.0, 0.0, 1.0)
}

fn bench_warpers(c: &mut Criterion) {
    let (w, h) = (320, 240);
    let img = create_benchmark_image(w, h);
    let k = intrinsics(400.0, w, h);
    let r = Rotation3::from_axis_angle(&Vector3::y_axis(), 0.2).into_inner();
    let mut group = c.benchmark_group("warp");
    for name in ["plane", "cylindrical", "spherical", "mercator"] {
        let warper = WarperKind::from_name(name).unwrap().create(400.0);
        group.bench_with_input(BenchmarkId::from_parameter(name), &img, |b, img| {
            b.iter(|| black_box(warper.warp(black_box(img), &k, &r)))
        });
    }
    group.finish();
}

fn bench_seams(c: &mut Criterion) {
    let (w, h) = (160, 120);
    let a = create_benchmark_image(w, h);
    let b = create_benchmark_image(w, h);
    let images = vec![to_float(&a), to_float(&b)];
    let corners = [Point::new(0, 0), Point::new(w as i32 / 2, 0)];
    let masks = vec![full_mask(w, h), full_mask(w, h)];
    let mut group = c.benchmark_group("seam");
    for name in ["voronoi", "gc_color", "dp_color"] {
        let finder = SeamKind::from_name(name).unwrap().create();
        group.bench_function(name, |bench| bench.iter(|| black_box(finder.find(&images, &corners, &masks))));
    }
    group.finish();
}

fn bench_blenders(c: &mut Criterion) {
    let (w, h) = (320, 240);
    let img = create_benchmark_image(w, h);
    let mask = full_mask(w, h);
    let roi = Rect::new(0, 0, w + w / 2, h);
    let mut group = c.benchmark_group("blend");
    for kind in [BlenderKind::Feather, BlenderKind::MultiBand] {
        group.bench_function(format!("{:?}", kind), |b| {
            b.iter(|| {
                let mut blender = kind.create(5.0, roi.area() as f64);
                blender.prepare(roi);
                blender.feed(&img, &mask, Point::new(0, 0));
                blender.feed(&img, &mask, Point::new(w as i32 / 2, 0));
                black_box(blender.blend())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_warpers, bench_seams, bench_blenders);
criterion_main!(benches);
