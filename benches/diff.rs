use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{Rng, SeedableRng};
use std::io::Cursor;

use dltp::diff::{patch, MatchState};

fn generate_reference(length: usize) -> Vec<u8> {
    // generate inputs from fixed seeds
    let mut rng = rand_xoshiro::Xoshiro256PlusPlus::seed_from_u64(length as u64); /* define specific algorithm to ensure reproducibility */
    const WORDS: &[&str] = &[
        "the ", "wiki ", "article ", "content ", "section ", "edit ", "paragraph ", "reference ",
        "history ", "template ", "category ", "link ", "\n",
    ];
    let mut out = Vec::with_capacity(length);
    while out.len() < length {
        out.extend_from_slice(WORDS[rng.gen_range(0..WORDS.len())].as_bytes());
    }
    out.truncate(length);
    out
}

fn perturb(reference: &[u8], edits: usize) -> Vec<u8> {
    let mut rng = rand_xoshiro::Xoshiro256PlusPlus::seed_from_u64(edits as u64);
    let mut out = reference.to_vec();
    for _ in 0..edits {
        let at = rng.gen_range(0..out.len());
        out[at] = rng.gen_range(b'a'..=b'z');
    }
    out
}

fn bench_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff");
    for length in [10_000usize, 100_000, 1_000_000] {
        let a = generate_reference(length);
        let b = perturb(&a, length / 1000);
        group.throughput(Throughput::Bytes(length as u64));
        group.bench_with_input(BenchmarkId::new("encode", length), &length, |bench, _| {
            let mut state = MatchState::new();
            let mut out = Vec::new();
            bench.iter(|| {
                out.clear();
                state.diff(&a, &b, &mut out);
            });
        });

        let mut state = MatchState::new();
        let mut encoded = Vec::new();
        state.diff(&a, &b, &mut encoded);
        group.bench_with_input(BenchmarkId::new("patch", length), &length, |bench, _| {
            bench.iter(|| patch(&a, &mut Cursor::new(&encoded[..])).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_diff);
criterion_main!(benches);
