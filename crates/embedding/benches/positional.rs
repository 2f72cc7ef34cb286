use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use embedding::{Embeddings, PositionalEncodings};
use layers::gradcheck::random_tensor;
use layers::{Bindings, Layer, Tensor, TensorShape};

fn bench_sequence_inputs(c: &mut Criterion) {
    let batch = 4usize;
    let dim = 256usize;
    let seq_lens = &[64usize, 256, 1024];

    let mut group = c.benchmark_group("positional_encodings");
    for &seq in seq_lens {
        let bindings = Bindings::new(random_tensor(TensorShape::new(batch, 1, seq, dim), 1));
        let mut layer = PositionalEncodings::new();
        layer.setup(&bindings).expect("setup");
        let mut output = Tensor::new();
        group.throughput(Throughput::Elements((batch * seq * dim) as u64));
        group.bench_with_input(BenchmarkId::new("forward", seq), &seq, |b, _| {
            b.iter(|| {
                layer.forward(black_box(&bindings), &mut output).expect("forward");
                black_box(&output);
            });
        });
    }
    group.finish();

    let mut group = c.benchmark_group("embeddings");
    for &seq in seq_lens {
        let ids: Vec<f32> = (0..batch * seq).map(|i| (i * 7 % 1000) as f32).collect();
        let input = Tensor::from_vec(TensorShape::new(batch, 1, seq, 1), ids).expect("ids");
        let bindings = Bindings::new(input);
        let mut layer = Embeddings::new(1000, dim).expect("embeddings");
        layer.setup(&bindings).expect("setup");
        let mut output = Tensor::new();
        group.throughput(Throughput::Elements((batch * seq) as u64));
        group.bench_with_input(BenchmarkId::new("lookup", seq), &seq, |b, _| {
            b.iter(|| {
                layer.forward(black_box(&bindings), &mut output).expect("forward");
                black_box(&output);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_sequence_inputs);
criterion_main!(benches);
