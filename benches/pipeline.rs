//! Benchmarks for the per-scan hot path: grid reduction and projective
//! matching.

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

use chakra_odom::{
    DepthPano, GridConfig, LidarScan, LidarSweep, MatcherConfig, PanoConfig, PointXyzr,
    ProjMatcher, SweepGrid,
};
use nalgebra::Vector3;

const ROWS: usize = 64;
const COLS: usize = 1024;

fn wall_scan() -> LidarScan {
    let hfov = std::f32::consts::TAU;
    let vfov = hfov * ROWS as f32 / COLS as f32;
    let mut xyzr = Vec::with_capacity(ROWS * COLS);
    for r in 0..ROWS {
        for c in 0..COLS {
            let az = ((c as f32 + 0.5) / COLS as f32 - 0.5) * hfov;
            let el = (0.5 - (r as f32 + 0.5) / ROWS as f32) * vfov;
            let p = Vector3::new(el.cos() * az.sin(), el.sin(), el.cos() * az.cos()) * 8.0;
            xyzr.push(PointXyzr::new(p.x, p.y, p.z, p.norm()));
        }
    }
    LidarScan::new(0.0, 1e-4, xyzr, ROWS, 0..COLS).unwrap()
}

fn bench_grid_add(c: &mut Criterion) {
    let scan = wall_scan();
    let mut grid = SweepGrid::new(ROWS, COLS, &GridConfig::default());

    c.bench_function("grid_add_full_sweep", |b| {
        b.iter(|| {
            // A full-sweep scan wraps back to column zero every time.
            black_box(grid.add(black_box(&scan)));
        })
    });
}

fn bench_match(c: &mut Criterion) {
    let scan = wall_scan();

    let mut pano = DepthPano::new(&PanoConfig {
        rows: ROWS,
        cols: COLS,
        ..Default::default()
    });
    let mut sweep = LidarSweep::new(ROWS, COLS);
    sweep.add_scan(&scan);
    pano.add_sweep(&sweep);

    let mut grid = SweepGrid::new(ROWS, COLS, &GridConfig::default());
    grid.add(&scan);
    let matcher = ProjMatcher::new(&MatcherConfig::default());

    c.bench_function("match_full_grid", |b| {
        b.iter(|| {
            black_box(matcher.match_grid(black_box(&mut grid), &pano));
        })
    });
}

criterion_group!(benches, bench_grid_add, bench_match);
criterion_main!(benches);
