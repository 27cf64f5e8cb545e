use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::Array4;
use std::time::{Duration, Instant};
use style_transfer as st;

fn tensor(dim: usize) -> Array4<f32> {
    let mut img = Array4::zeros((1, 3, dim, dim));
    for (i, v) in img.iter_mut().enumerate() {
        *v = (((i * 7) % 19) as f32 - 9.0) / 9.0;
    }
    img
}

fn small_backbone() -> st::ConvNet {
    st::ConvNet::from_layers(vec![
        ("conv1".to_string(), st::LayerOp::Conv(st::Conv2d::seeded(16, 3, 1))),
        ("relu1".to_string(), st::LayerOp::Relu),
        ("pool1".to_string(), st::LayerOp::MaxPool),
        ("conv2".to_string(), st::LayerOp::Conv(st::Conv2d::seeded(32, 16, 2))),
        ("relu2".to_string(), st::LayerOp::Relu),
    ])
}

fn extract(c: &mut Criterion) {
    static DIM: usize = 16;

    let net = small_backbone();
    let ids: std::collections::BTreeSet<String> =
        ["relu1", "relu2"].iter().map(|s| s.to_string()).collect();

    let mut group = c.benchmark_group("extract");
    group.sample_size(10);

    for dim in [DIM, 2 * DIM, 4 * DIM, 8 * DIM].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(dim), dim, |b, &dim| {
            let input = tensor(dim);
            b.iter(|| black_box(net.extract(&input, &ids).unwrap()));
        });
    }
    group.finish();
}

fn gram(c: &mut Criterion) {
    static DIM: usize = 16;

    let mut group = c.benchmark_group("gram_matrix");
    group.sample_size(10);

    for dim in [DIM, 2 * DIM, 4 * DIM, 8 * DIM, 16 * DIM].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(dim), dim, |b, &dim| {
            let mut feature = Array4::zeros((1, 32, dim, dim));
            for (i, v) in feature.iter_mut().enumerate() {
                *v = ((i % 23) as f32 - 11.0) / 11.0;
            }
            b.iter(|| black_box(st::gram_matrix(&feature).unwrap()));
        });
    }
    group.finish();
}

fn full_run(c: &mut Criterion) {
    static DIM: usize = 16;

    let mut group = c.benchmark_group("transfer");
    group.sample_size(10);

    for dim in [DIM, 2 * DIM, 4 * DIM].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(dim), dim, |b, &dim| {
            b.iter_custom(|iters| {
                let mut total_elapsed = Duration::new(0, 0);
                for _i in 0..iters {
                    let sess = st::Session::builder()
                        .backbone(Box::new(small_backbone()))
                        .content_tensor(tensor(dim))
                        .style_tensor(tensor(dim).mapv(|v| -v))
                        .content_layer("relu2", 1.0)
                        .style_layer("relu1", 1.0)
                        .max_iterations(10)
                        .build()
                        .unwrap();

                    let start = Instant::now();
                    black_box(sess.run(None).unwrap());
                    total_elapsed += start.elapsed();
                }

                total_elapsed
            });
        });
    }
    group.finish();
}

criterion_group!(benches, extract, gram, full_run);
criterion_main!(benches);
