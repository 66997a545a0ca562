//! Residuals and Jacobians for the pose refinement.
//!
//! The cost couples the Gaussian matches from the grid with an optional
//! preintegrated IMU factor and exposes both to the solver through the
//! [`CostFunction`] trait. Two residual models share the infrastructure:
//! a rigid one that applies a single SE(3) correction to the whole sweep,
//! and a linear one that scales the translation across the sweep columns.

use nalgebra::{DMatrix, Isometry3, Matrix3, UnitQuaternion, Vector3};
use rayon::prelude::*;

use crate::core::math::hat;
use crate::core::trajectory::Trajectory;
use crate::grid::SweepGrid;
use crate::preint::ImuPreintegration;

/// Parameter dimension: a rotation vector and a translation.
pub const NUM_PARAMS: usize = 6;

/// Offset of the rotation block in the error vector.
const R0: usize = 0;
/// Offset of the translation block in the error vector.
const P0: usize = 3;

/// Residuals per match.
const RESIDUAL_DIM: usize = 3;

/// The solver-facing interface: evaluate residuals and optionally the
/// Jacobian at an error vector. Returning false aborts the solve.
pub trait CostFunction {
    /// Total number of residual rows.
    fn num_residuals(&self) -> usize;

    /// Parameter dimension.
    fn num_params(&self) -> usize {
        NUM_PARAMS
    }

    /// Fill `residuals` (and `jacobian` when present) at `x`.
    fn evaluate(&self, x: &[f64], residuals: &mut [f64], jacobian: Option<&mut DMatrix<f64>>)
        -> bool;
}

/// Which residual model to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GicpMode {
    /// One SE(3) error applied uniformly to every match.
    Rigid,
    /// Translation error interpolated linearly across the sweep columns.
    Linear,
}

/// Snapshot of one valid match in solver precision.
#[derive(Clone, Debug)]
pub struct MatchView {
    /// Grid column, used for the per-column interpolation scale.
    pub col: usize,
    /// Whitening factor.
    pub u: Matrix3<f64>,
    /// Panorama-frame mean.
    pub mu_p: Vector3<f64>,
    /// Grid-frame mean.
    pub mu_g: Vector3<f64>,
    /// Hypothesized cell pose at match time.
    pub tf_p_g: Isometry3<f64>,
}

/// GICP cost over the current matches plus an optional IMU factor.
pub struct GicpCost {
    /// Residual model.
    pub mode: GicpMode,
    /// Valid matches in a contiguous vector for predictable traversal.
    pub matches: Vec<MatchView>,
    /// Grid width, for the linear interpolation scale.
    pub grid_cols: usize,
    /// Trajectory snapshot backing the IMU factor.
    pub traj: Option<Trajectory>,
    /// Preintegration over the trajectory window.
    pub preint: ImuPreintegration,
    /// Scale of the whitened IMU residuals.
    pub imu_weight: f64,
    gsize: usize,
}

impl GicpCost {
    /// Create an empty cost.
    ///
    /// Each residual is 3 doubles (24 bytes), so the parallel grainsize is
    /// padded to keep at least one 64-byte cache line (3 residuals) per
    /// work item.
    pub fn new(mode: GicpMode, grid_cols: usize, grainsize: usize) -> Self {
        Self {
            mode,
            matches: Vec::new(),
            grid_cols,
            traj: None,
            preint: ImuPreintegration::new(),
            imu_weight: 1.0,
            gsize: grainsize.max(1) + 2,
        }
    }

    /// Copy all valid matches out of the grid.
    pub fn update_matches(&mut self, grid: &SweepGrid) {
        self.matches.clear();
        for m in grid.matches.iter().filter(|m| m.ok()) {
            let c = m.px.1;
            self.matches.push(MatchView {
                col: c,
                u: m.u.cast::<f64>(),
                mu_p: m.mc_p.mean().cast::<f64>(),
                mu_g: m.mc_g.mean().cast::<f64>(),
                tf_p_g: grid.cell_tf(c).cast::<f64>(),
            });
        }
    }

    /// Recompute the preintegration over the trajectory window. Returns the
    /// number of samples consumed; 0 disables the IMU factor.
    pub fn update_preint(&mut self, traj: &Trajectory, queue: &crate::core::imu::ImuQueue) -> usize {
        self.preint.reset();
        self.traj = None;
        if traj.duration() <= 0.0 {
            return 0;
        }
        let n = self
            .preint
            .compute(queue, traj.front().time, traj.back().time);
        if n > 0 {
            self.traj = Some(traj.clone());
        }
        n
    }

    fn has_imu(&self) -> bool {
        self.traj.is_some() && self.preint.n > 0
    }

    /// Apply the solved error vector to the trajectory.
    ///
    /// Rigid: only the first state moves; downstream states are re-predicted
    /// by the caller. Linear: every state rotates, translations get their
    /// column share, velocities are re-estimated from successive positions
    /// with the last one set to their average.
    pub fn update_traj(&self, x: &[f64], traj: &mut Trajectory) {
        let er = UnitQuaternion::from_scaled_axis(Vector3::new(x[R0], x[R0 + 1], x[R0 + 2]));
        let ep = Vector3::new(x[P0], x[P0 + 1], x[P0 + 2]);

        match self.mode {
            GicpMode::Rigid => {
                let dt = traj.duration();
                let st = &mut traj.states[0];
                st.rot = er * st.rot;
                st.pos = er * st.pos + ep;
                if dt > 0.0 {
                    st.vel += ep / dt;
                }
            }
            GicpMode::Linear => {
                let n = traj.len();
                for (i, st) in traj.states.iter_mut().enumerate() {
                    let s = i as f64 / (n - 1) as f64;
                    st.rot = er * st.rot;
                    st.pos = er * st.pos + ep * s;
                }
                let mut vel_sum = Vector3::zeros();
                for i in 1..n {
                    let dp = traj.states[i].pos - traj.states[i - 1].pos;
                    let dt = traj.states[i].time - traj.states[i - 1].time;
                    if dt > 0.0 {
                        let vel = dp / dt;
                        traj.states[i - 1].vel = vel;
                        vel_sum += vel;
                    }
                }
                traj.states[n - 1].vel = vel_sum / (n - 1) as f64;
            }
        }
    }

    /// IMU tail: whitened attitude and position residuals between the
    /// trajectory endpoints under the current error.
    fn eval_imu(
        &self,
        er: &UnitQuaternion<f64>,
        ep: &Vector3<f64>,
        residuals: &mut [f64],
        jacobian: Option<&mut DMatrix<f64>>,
    ) {
        let traj = self.traj.as_ref().expect("imu factor without trajectory");
        let pre = &self.preint;

        let dt = pre.duration;
        let dt2 = dt * dt;
        let g = traj.g_pano;
        let st0 = traj.front();
        let st1 = traj.back();

        // The linear model rotates the whole trajectory, the rigid one only
        // moves the endpoint relative to the fixed start.
        let (rot0, pos0, rot1, pos1) = match self.mode {
            GicpMode::Rigid => (st0.rot, st0.pos, er * st1.rot, er * st1.pos + ep),
            GicpMode::Linear => (er * st0.rot, er * st0.pos, er * st1.rot, er * st1.pos + ep),
        };

        let rot0_inv = rot0.inverse();
        let dp = st0.vel * dt - 0.5 * g * dt2;
        let alpha = rot0_inv * (pos1 - pos0 - dp);

        let mut r_gamma = (rot0_inv * rot1 * pre.gamma.inverse()).scaled_axis();
        let mut r_alpha = alpha - pre.alpha;

        // Joint whitening with the (alpha, theta) blocks of the weighted
        // square-root information factor.
        let uw = pre.u * self.imu_weight;
        let ua = uw
            .fixed_view::<3, 3>(ImuPreintegration::ALPHA, ImuPreintegration::ALPHA)
            .into_owned();
        let uag = uw
            .fixed_view::<3, 3>(ImuPreintegration::ALPHA, ImuPreintegration::THETA)
            .into_owned();
        let ug = uw
            .fixed_view::<3, 3>(ImuPreintegration::THETA, ImuPreintegration::THETA)
            .into_owned();

        r_alpha = ua * r_alpha + uag * r_gamma;
        r_gamma = ug * r_gamma;

        let offset = self.matches.len() * RESIDUAL_DIM;
        residuals[offset..offset + 3].copy_from_slice(r_gamma.as_slice());
        residuals[offset + 3..offset + 6].copy_from_slice(r_alpha.as_slice());

        if let Some(jac) = jacobian {
            let rot0_inv_mat = rot0_inv.to_rotation_matrix().into_inner();
            match self.mode {
                GicpMode::Rigid => {
                    // Attitude rows
                    jac.fixed_view_mut::<3, 3>(offset, R0)
                        .copy_from(&(ug * rot0_inv_mat));
                    // Position rows
                    jac.fixed_view_mut::<3, 3>(offset + 3, R0)
                        .copy_from(&(-(ua * rot0_inv_mat) * hat(&st1.pos)));
                    jac.fixed_view_mut::<3, 3>(offset + 3, P0)
                        .copy_from(&(ua * rot0_inv_mat));
                }
                GicpMode::Linear => {
                    // rot0' * rot1 is invariant to the shared rotation, so
                    // the attitude rows stay zero.
                    jac.fixed_view_mut::<3, 3>(offset + 3, R0)
                        .copy_from(&(ua * rot0_inv_mat * hat(&(ep - dp))));
                    jac.fixed_view_mut::<3, 3>(offset + 3, P0)
                        .copy_from(&(ua * rot0_inv_mat));
                }
            }
        }
    }
}

impl CostFunction for GicpCost {
    fn num_residuals(&self) -> usize {
        self.matches.len() * RESIDUAL_DIM + if self.has_imu() { 6 } else { 0 }
    }

    fn evaluate(
        &self,
        x: &[f64],
        residuals: &mut [f64],
        mut jacobian: Option<&mut DMatrix<f64>>,
    ) -> bool {
        debug_assert_eq!(residuals.len(), self.num_residuals());

        let er = UnitQuaternion::from_scaled_axis(Vector3::new(x[R0], x[R0 + 1], x[R0 + 2]));
        let ep = Vector3::new(x[P0], x[P0 + 1], x[P0 + 2]);

        let want_jac = jacobian.is_some();
        let mode = self.mode;
        let grid_cols = self.grid_cols as f64;

        // Each item writes only its own rows; compute the blocks in
        // parallel, then scatter.
        let blocks: Vec<(Vector3<f64>, Option<(Matrix3<f64>, Matrix3<f64>)>)> = self
            .matches
            .par_iter()
            .with_min_len(self.gsize)
            .map(|m| {
                let pt_p_hat = m.tf_p_g.rotation * m.mu_g + m.tf_p_g.translation.vector;
                let (r, jacs) = match mode {
                    GicpMode::Rigid => {
                        let r = m.u * (m.mu_p - (er * pt_p_hat + ep));
                        let jacs =
                            want_jac.then(|| (m.u * hat(&pt_p_hat), -m.u));
                        (r, jacs)
                    }
                    GicpMode::Linear => {
                        // +0.5 because the cell mean sits at the cell center
                        let s = (m.col as f64 + 0.5) / grid_cols;
                        let r = m.u * (m.mu_p - (er * pt_p_hat + ep * s));
                        let jacs =
                            want_jac.then(|| (m.u * hat(&pt_p_hat), -s * m.u));
                        (r, jacs)
                    }
                };
                (r, jacs)
            })
            .collect();

        if let Some(jac) = jacobian.as_deref_mut() {
            jac.fill(0.0);
        }
        for (i, (r, jacs)) in blocks.iter().enumerate() {
            let ri = i * RESIDUAL_DIM;
            residuals[ri..ri + 3].copy_from_slice(r.as_slice());
            if let (Some(jac), Some((jr, jp))) = (jacobian.as_deref_mut(), jacs) {
                jac.fixed_view_mut::<3, 3>(ri, R0).copy_from(jr);
                jac.fixed_view_mut::<3, 3>(ri, P0).copy_from(jp);
            }
        }

        if self.has_imu() {
            self.eval_imu(&er, &ep, residuals, jacobian);
        }

        true
    }
}
