use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use layers::gradcheck::random_tensor;
use layers::norm::{BatchNorm, LayerNorm, RmsNorm};
use layers::{Bindings, Layer, Tensor, TensorShape};

fn run_forward(c: &mut Criterion, group_name: &str, make: impl Fn() -> Box<dyn Layer>) {
    let batch = 8usize;
    let channels = 32usize;
    let sides = &[8usize, 16, 32];

    let mut group = c.benchmark_group(group_name);
    for &side in sides {
        let bindings = Bindings::new(random_tensor(TensorShape::new(batch, channels, side, side), 5));
        let mut layer = make();
        layer.setup(&bindings).expect("setup");
        let mut output = Tensor::new();
        layer.forward_train(&bindings, &mut output).expect("forward");

        group.throughput(Throughput::Elements((batch * channels * side * side) as u64));
        group.bench_with_input(BenchmarkId::new("forward_train", side), &side, |b, _| {
            b.iter(|| {
                layer
                    .forward_train(black_box(&bindings), &mut output)
                    .expect("forward");
                black_box(&output);
            });
        });

        let upstream = random_tensor(output.shape(), 13);
        let mut grads = bindings.clone();
        let mut params_grad = Tensor::zeros(layer.params().shape());
        group.bench_with_input(BenchmarkId::new("backward", side), &side, |b, _| {
            b.iter(|| {
                grads.reset_gradients();
                layer
                    .backward(&output, black_box(&upstream), &mut grads, &mut params_grad)
                    .expect("backward");
                black_box(&params_grad);
            });
        });
    }
    group.finish();
}

fn bench_norms(c: &mut Criterion) {
    run_forward(c, "norm/batch_conv", || Box::new(BatchNorm::conv().expect("bn")));
    run_forward(c, "norm/layer", || Box::new(LayerNorm::new()));
    run_forward(c, "norm/rms", || Box::new(RmsNorm::new()));
}

criterion_group!(benches, bench_norms);
criterion_main!(benches);
