use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use pwsearch::config::CodecKind;
use pwsearch::ivf::{IvfIndex, IvfQuantizer, build_shard};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const D: usize = 64;
const N: usize = 20000;
const NLIST: usize = 64;

fn random_vectors(n: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n * D).map(|_| rng.random_range(-1.0..1.0)).collect()
}

fn bench_search(c: &mut Criterion) {
    let data = random_vectors(N, 42);
    let ids = (0..N as u64).collect::<Vec<_>>();
    let queries = random_vectors(100, 7);

    let mut group = c.benchmark_group("ivf_search");
    for (name, codec) in [("flat", CodecKind::Flat), ("pq8", CodecKind::Pq { m: 8, nbits: 8 })] {
        let mut quantizer = IvfQuantizer::new(D, NLIST, codec);
        quantizer.train(&data[..5000 * D], 10, 42).unwrap();
        let invlists = build_shard(&quantizer, &ids, &data).unwrap();
        let index = IvfIndex::new(quantizer, invlists).unwrap();

        for nprobe in [1, 8, 32] {
            group.bench_with_input(BenchmarkId::new(name, nprobe), &nprobe, |b, &nprobe| {
                b.iter(|| {
                    for q in queries.chunks_exact(D) {
                        black_box(index.search(q, 15, nprobe).unwrap());
                    }
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_search);
criterion_main!(benches);
