//! Per-scan odometry pipeline.
//!
//! Owns the sweep buffer, feature grid, panorama, matcher, trajectory and
//! IMU queue, and runs the dataflow for every arriving scan:
//!
//! 1. ingest the scan into the sweep and score/filter the grid;
//! 2. once the panorama holds data, predict the trajectory, match grid
//!    cells against the panorama and refine the pose with the solver;
//! 3. when the scan closes a sweep, interpolate per-column poses and merge
//!    the sweep into the panorama.
//!
//! The pipeline itself is single-threaded; the components fan out over a
//! worker pool internally.

use nalgebra::Isometry3;
use std::sync::Arc;

use crate::config::OdomConfig;
use crate::core::imu::{ImuData, ImuNoise, ImuQueue};
use crate::core::scan::{LidarScan, LidarSweep};
use crate::core::trajectory::Trajectory;
use crate::cost::{GicpCost, GicpMode};
use crate::error::OdomError;
use crate::grid::SweepGrid;
use crate::matching::ProjMatcher;
use crate::pano::DepthPano;
use crate::solver::{solve, SolverSummary};

/// Statistics and pose estimate for one processed scan.
#[derive(Clone, Debug)]
pub struct OdomResult {
    /// Valid points ingested into the sweep.
    pub n_points: usize,
    /// Cells with a finite score.
    pub n_scored: usize,
    /// Cells that passed filtering.
    pub n_filtered: usize,
    /// Valid matches against the panorama.
    pub n_matches: usize,
    /// Solver outcome, absent when registration was skipped.
    pub solver: Option<SolverSummary>,
    /// Whether this scan completed a sweep.
    pub sweep_complete: bool,
    /// Estimated sensor pose in the panorama frame at the sweep end.
    pub pose: Isometry3<f64>,
}

/// The LiDAR-inertial odometry estimator.
pub struct LidarOdom {
    config: OdomConfig,
    sweep: LidarSweep,
    grid: SweepGrid,
    pano: DepthPano,
    matcher: ProjMatcher,
    traj: Trajectory,
    imuq: ImuQueue,
    pool: Option<Arc<rayon::ThreadPool>>,
    sweep_t0: f64,
    gravity_initialized: bool,
}

impl LidarOdom {
    /// Build the estimator. `t_imu_lidar` is the LiDAR-to-IMU extrinsic,
    /// provided once.
    pub fn new(config: OdomConfig, t_imu_lidar: Isometry3<f64>) -> Result<Self, OdomError> {
        config.validate()?;

        let sweep = LidarSweep::new(config.sweep.rows, config.sweep.cols);
        let grid = SweepGrid::new(config.sweep.rows, config.sweep.cols, &config.grid);
        let pano = DepthPano::new(&config.pano);
        let matcher = ProjMatcher::new(&config.matcher);

        let mut traj = Trajectory::new(grid.cols + 1);
        traj.predict_translation = config.imu.predict_translation;
        traj.init_extrinsic(t_imu_lidar);

        let noise = ImuNoise::new(
            config.imu.rate_dt,
            config.imu.acc_noise,
            config.imu.gyr_noise,
            config.imu.acc_bias_noise,
            config.imu.gyr_bias_noise,
        );
        let imuq = ImuQueue::new(config.imu.capacity, noise);

        let pool = if config.solver.num_threads > 0 {
            Some(Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(config.solver.num_threads)
                    .build()?,
            ))
        } else {
            None
        };

        log::info!(
            "odometry up: sweep {}x{}, grid {}x{}, pano {}x{}",
            config.sweep.rows,
            config.sweep.cols,
            grid.rows,
            grid.cols,
            config.pano.rows,
            config.pano.cols
        );

        Ok(Self {
            config,
            sweep,
            grid,
            pano,
            matcher,
            traj,
            imuq,
            pool,
            sweep_t0: 0.0,
            gravity_initialized: false,
        })
    }

    /// Feed one IMU sample. The first sample also aligns gravity.
    pub fn add_imu(&mut self, imu: ImuData) {
        if !self.gravity_initialized {
            self.traj
                .init_gravity(&imu.acc, self.config.imu.gravity_norm);
            self.gravity_initialized = true;
            log::info!("gravity initialized to {:?}", self.traj.g_pano);
        }
        self.imuq.push(imu);
    }

    /// Process one scan through the full pipeline.
    ///
    /// # Panics
    ///
    /// Panics when the scan violates the sweep contract (wrong row count,
    /// non-contiguous column range).
    pub fn add_scan(&mut self, scan: &LidarScan) -> OdomResult {
        match self.pool.clone() {
            Some(pool) => pool.install(|| self.process(scan)),
            None => self.process(scan),
        }
    }

    fn process(&mut self, scan: &LidarScan) -> OdomResult {
        if scan.col_rg.start == 0 {
            self.sweep_t0 = scan.time;
        }

        let n_points = self.sweep.add_scan(scan);
        let (n_scored, n_filtered) = self.grid.add(scan);
        log::debug!(
            "scan cols {}..{}: {} points, {} scored, {} filtered",
            scan.col_rg.start,
            scan.col_rg.end,
            n_points,
            n_scored,
            n_filtered
        );

        let cell_dt = scan.dt * self.grid.cell_cols as f64;
        self.traj.predict(&self.imuq, self.sweep_t0, cell_dt);

        let (n_matches, solver) = if self.pano.num_sweeps > 0 {
            self.register()
        } else {
            (0, None)
        };

        let sweep_complete = self.sweep.is_complete();
        if sweep_complete {
            self.postprocess();
        }

        OdomResult {
            n_points,
            n_scored,
            n_filtered,
            n_matches,
            solver,
            sweep_complete,
            pose: self.pose(),
        }
    }

    /// Match against the panorama and refine the trajectory.
    fn register(&mut self) -> (usize, Option<SolverSummary>) {
        // Hypothesized cell poses come from the current trajectory.
        for i in 0..self.grid.tfs.len() {
            self.grid.tfs[i] = self.traj.tf_pano_lidar(i).cast::<f32>();
        }

        let n_matches = self.matcher.match_grid(&mut self.grid, &self.pano);
        if n_matches == 0 {
            log::warn!("no matches against the panorama, skipping registration");
            return (0, None);
        }

        let mode = if self.config.linear_cost {
            GicpMode::Linear
        } else {
            GicpMode::Rigid
        };
        let mut cost = GicpCost::new(mode, self.grid.cols, self.config.grid.grainsize);
        cost.imu_weight = self.config.imu.imu_weight;
        cost.update_matches(&self.grid);
        if !self.imuq.is_empty() {
            cost.update_preint(&self.traj, &self.imuq);
        }

        let mut x = [0.0; 6];
        let summary = solve(&cost, &mut x, &self.config.solver);
        if summary.usable {
            cost.update_traj(&x, &mut self.traj);
            // Re-predict downstream states from the corrected start.
            let cell_dt = self.sweep.dt * self.grid.cell_cols as f64;
            let consumed = if cell_dt > 0.0 {
                self.traj.predict(&self.imuq, self.sweep_t0, cell_dt)
            } else {
                0
            };
            if consumed == 0 && mode == GicpMode::Rigid {
                // No IMU to re-predict with: carry the rigid correction to
                // the rest of the trajectory.
                let er = nalgebra::UnitQuaternion::from_scaled_axis(nalgebra::Vector3::new(
                    x[0], x[1], x[2],
                ));
                let ep = nalgebra::Vector3::new(x[3], x[4], x[5]);
                for st in self.traj.states.iter_mut().skip(1) {
                    st.rot = er * st.rot;
                    st.pos = er * st.pos + ep;
                }
            }
        } else {
            // Keep the prior pose; the panorama stays untouched either way.
            log::warn!(
                "registration failed ({} matches, cost {} -> {}), keeping prior pose",
                n_matches,
                summary.initial_cost,
                summary.final_cost
            );
        }

        (n_matches, Some(summary))
    }

    /// Fold the finished sweep into the panorama and reset per-sweep state.
    fn postprocess(&mut self) {
        self.grid.interp_sweep(&mut self.sweep);
        let n_added = self.pano.add_sweep(&self.sweep);
        log::debug!(
            "sweep complete: {} pixels updated, {} sweeps in pano",
            n_added,
            self.pano.num_sweeps
        );
        self.grid.reset_matches();
    }

    /// Current sensor pose in the panorama frame at the sweep end.
    pub fn pose(&self) -> Isometry3<f64> {
        self.traj.tf_pano_lidar(self.traj.len() - 1)
    }

    /// The panorama, e.g. for publishing as a depth grid.
    pub fn pano(&self) -> &DepthPano {
        &self.pano
    }

    /// The grid with its current matches, e.g. for visualization.
    pub fn grid(&self) -> &SweepGrid {
        &self.grid
    }

    /// The per-sweep trajectory.
    pub fn trajectory(&self) -> &Trajectory {
        &self.traj
    }
}
