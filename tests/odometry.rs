//! End-to-end registration scenarios on synthetic geometry.

use chakra_odom::{
    solve, DepthPano, GicpCost, GicpMode, ImuData, LidarOdom, LidarScan, LidarSweep, OdomConfig,
    PointXyzr, ProjMatcher, SweepGrid,
};
use nalgebra::{Isometry3, Vector3};

const ROWS: usize = 16;
const COLS: usize = 128;
const RADIUS: f32 = 5.0;

fn test_config() -> OdomConfig {
    let mut config = OdomConfig::default();
    config.sweep.rows = ROWS;
    config.sweep.cols = COLS;
    config.grid.cell_rows = 2;
    config.grid.cell_cols = 8;
    config.grid.grainsize = 1;
    config.pano.rows = ROWS;
    config.pano.cols = COLS;
    config
}

/// Direction of sweep pixel `(r, c)` on the cylindrical panorama.
fn pixel_dir(r: usize, c: usize) -> Vector3<f32> {
    let hfov = std::f32::consts::TAU;
    let vfov = hfov * ROWS as f32 / COLS as f32;
    let az = ((c as f32 + 0.5) / COLS as f32 - 0.5) * hfov;
    let el = (0.5 - (r as f32 + 0.5) / ROWS as f32) * vfov;
    Vector3::new(el.cos() * az.sin(), el.sin(), el.cos() * az.cos())
}

/// A scan of a cylindrical wall of `RADIUS`, observed by a sensor sitting
/// at `offset` in the world frame.
fn wall_scan(
    time: f64,
    dt: f64,
    col_rg: std::ops::Range<usize>,
    offset: Vector3<f32>,
) -> LidarScan {
    let cols = col_rg.len();
    let mut xyzr = Vec::with_capacity(ROWS * cols);
    for r in 0..ROWS {
        for c in col_rg.clone() {
            let p_world = pixel_dir(r, c) * RADIUS;
            let p = p_world - offset;
            xyzr.push(PointXyzr::new(p.x, p.y, p.z, p.norm()));
        }
    }
    LidarScan::new(time, dt, xyzr, ROWS, col_rg).unwrap()
}

/// Registration of a translated sweep against a static wall must recover
/// the translation within a centimeter inside the iteration budget.
#[test]
fn test_pure_translation_registration() {
    let config = test_config();

    // Map the wall from the origin.
    let mut pano = DepthPano::new(&config.pano);
    let mut sweep = LidarSweep::new(ROWS, COLS);
    sweep.add_scan(&wall_scan(0.0, 1e-4, 0..COLS, Vector3::zeros()));
    pano.add_sweep(&sweep);

    // Observe it again from 10 cm to the side, with an identity guess.
    let truth = Vector3::new(0.1, 0.0, 0.0);
    let mut grid = SweepGrid::new(ROWS, COLS, &config.grid);
    grid.add(&wall_scan(0.1, 1e-4, 0..COLS, truth));

    let matcher = ProjMatcher::new(&config.matcher);
    let n_matches = matcher.match_grid(&mut grid, &pano);
    assert!(n_matches >= 100, "only {n_matches} matches");

    let mut cost = GicpCost::new(GicpMode::Rigid, grid.cols, 1);
    cost.update_matches(&grid);

    let mut x = [0.0; 6];
    let summary = solve(&cost, &mut x, &config.solver);
    assert!(summary.usable);
    assert!(summary.final_cost < summary.initial_cost);

    let translation = Vector3::new(x[3], x[4], x[5]);
    let rotation = Vector3::new(x[0], x[1], x[2]);
    assert!(
        (translation - truth.cast::<f64>()).norm() < 0.01,
        "translation error {} m",
        (translation - truth.cast::<f64>()).norm()
    );
    assert!(rotation.norm() < 0.01, "spurious rotation {rotation:?}");
}

/// Full pipeline: the first sweep can only seed the map, the second is
/// registered against it, ingested as two half sweeps to exercise the
/// wrap-around.
#[test]
fn test_full_pipeline_tracks_translation() {
    let config = test_config();
    let mut odom = LidarOdom::new(config, Isometry3::identity()).unwrap();
    let dt_col = 0.1 / COLS as f64;
    let truth = Vector3::new(0.1, 0.0, 0.0);

    // Sweep one: empty panorama, registration skipped.
    let r1 = odom.add_scan(&wall_scan(0.0, dt_col, 0..COLS, Vector3::zeros()));
    assert_eq!(r1.n_matches, 0);
    assert!(r1.solver.is_none());
    assert!(r1.sweep_complete);

    // Sweep two, first half.
    let r2 = odom.add_scan(&wall_scan(0.1, dt_col, 0..COLS / 2, truth));
    assert!(!r2.sweep_complete);
    assert!(r2.n_matches > 50);
    assert!(r2.solver.expect("registration ran").usable);

    // Sweep two, second half closes the revolution.
    let r3 = odom.add_scan(&wall_scan(0.15, dt_col, COLS / 2..COLS, truth));
    assert!(r3.sweep_complete);
    assert!(odom.grid().score.iter().all(|s| s.is_finite()));

    let t = r3.pose.translation.vector;
    assert!(
        (t - truth.cast::<f64>()).norm() < 0.01,
        "pose error {} m",
        (t - truth.cast::<f64>()).norm()
    );
}

/// A stationary platform with a live IMU must not drift: the IMU factor
/// and the matches agree on zero motion.
#[test]
fn test_stationary_with_imu_stays_put() {
    let config = test_config();
    let mut odom = LidarOdom::new(config, Isometry3::identity()).unwrap();
    let dt_col = 0.1 / COLS as f64;

    for i in 0..=35 {
        odom.add_imu(ImuData {
            time: i as f64 * 0.01,
            gyr: Vector3::zeros(),
            acc: Vector3::new(0.0, 0.0, 9.80665),
        });
    }

    let r1 = odom.add_scan(&wall_scan(0.0, dt_col, 0..COLS, Vector3::zeros()));
    assert!(r1.sweep_complete);

    let r2 = odom.add_scan(&wall_scan(0.1, dt_col, 0..COLS, Vector3::zeros()));
    let summary = r2.solver.expect("registration ran");
    assert!(summary.usable);

    assert!(
        r2.pose.translation.vector.norm() < 0.01,
        "drift {} m",
        r2.pose.translation.vector.norm()
    );
    assert!(r2.pose.rotation.angle() < 0.01);
}

/// Registering against an empty panorama is skipped, never an error.
#[test]
fn test_empty_pano_skips_registration() {
    let config = test_config();
    let mut odom = LidarOdom::new(config, Isometry3::identity()).unwrap();
    let dt_col = 0.1 / COLS as f64;

    let r = odom.add_scan(&wall_scan(0.0, dt_col, 0..COLS / 2, Vector3::zeros()));
    assert_eq!(r.n_matches, 0);
    assert!(r.solver.is_none());
    assert!(!r.sweep_complete);
}
