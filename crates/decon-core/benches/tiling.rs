//! Benchmarks for tile planning and staging
//!
//! Planning cost grows with the tile count; staging cost with the staged
//! extent, which includes the halo.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use decon_core::{tiling, validate, LicenseCache, RunParameters, Shape3, Volume};

fn benchmark_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("tiling_plan");
    let licenses = LicenseCache::unrestricted();

    for tiles in [1, 2, 4, 8, 16].iter() {
        let params = validate(
            &RunParameters {
                x_tiles: *tiles,
                y_tiles: *tiles,
                z_tiles: (*tiles).min(8),
                x_padding: 16,
                y_padding: 16,
                z_padding: 4,
                ..RunParameters::with_dims(1024, 1024, 64)
            },
            &licenses,
            1,
        )
        .unwrap();
        group.throughput(Throughput::Elements(params.tile_count() as u64));

        group.bench_with_input(BenchmarkId::from_parameter(tiles), &params, |b, params| {
            b.iter(|| tiling::plan(black_box(params), usize::MAX).unwrap());
        });
    }

    group.finish();
}

fn benchmark_stage_tile(c: &mut Criterion) {
    let mut group = c.benchmark_group("stage_tile");
    let shape = Shape3::new(256, 256, 32);
    let volume = Volume::zeros(shape).unwrap();
    volume.fill(1.0);

    for padding in [0, 8, 32].iter() {
        let params = validate(
            &RunParameters {
                x_tiles: 2,
                y_tiles: 2,
                x_padding: *padding,
                y_padding: *padding,
                z_padding: *padding / 4,
                ..RunParameters::with_dims(256, 256, 32)
            },
            &LicenseCache::unrestricted(),
            1,
        )
        .unwrap();
        let plan = tiling::plan(&params, usize::MAX).unwrap();
        let tile = plan.tiles[0].clone();
        group.throughput(Throughput::Elements(tile.staged_voxels() as u64));

        group.bench_with_input(BenchmarkId::new("padding", padding), &tile, |b, tile| {
            b.iter(|| volume.stage_tile(black_box(tile)));
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_plan, benchmark_stage_tile);
criterion_main!(benches);
