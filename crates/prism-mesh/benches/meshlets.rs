//! Meshlet generation benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use prism_mesh::cache::optimize_vertex_cache;
use prism_mesh::{build_meshlets, MeshletOptions, Vertex};

/// Height-field grid of `size` x `size` quads with shared vertices.
fn height_field(size: u32) -> (Vec<Vertex>, Vec<u32>) {
    let stride = size + 1;
    let vertices = (0..stride * stride)
        .map(|i| {
            let (x, z) = ((i % stride) as f32, (i / stride) as f32);
            let y = (x * 0.3).sin() * (z * 0.2).cos();
            Vertex::new([x, y, z], [0.0, 1.0, 0.0], [x / size as f32, z / size as f32])
        })
        .collect();

    let mut indices = Vec::with_capacity((size * size * 6) as usize);
    for z in 0..size {
        for x in 0..size {
            let i = z * stride + x;
            indices.extend_from_slice(&[i, i + stride, i + 1, i + 1, i + stride, i + stride + 1]);
        }
    }
    (vertices, indices)
}

fn bench_build_meshlets(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_meshlets");
    let options = MeshletOptions::default();

    for size in [32u32, 128, 256] {
        let (vertices, indices) = height_field(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| build_meshlets(black_box(&vertices), black_box(&indices), &options));
        });
    }

    group.finish();
}

fn bench_vertex_cache(c: &mut Criterion) {
    let (vertices, indices) = height_field(128);
    c.bench_function("optimize_vertex_cache/128", |b| {
        b.iter(|| optimize_vertex_cache(black_box(&indices), vertices.len()));
    });
}

criterion_group!(benches, bench_build_meshlets, bench_vertex_cache);
criterion_main!(benches);
