//! Bias-corrected IMU preintegration between two sweep boundary times.
//!
//! Accumulates position, velocity and rotation deltas `(alpha, beta,
//! gamma)` with a 15-state error covariance, following the first-order
//! formulation popularized by VINS-Mono (eq. 7-10). The result constrains
//! the relative motion of the trajectory endpoints independently of the
//! boundary states themselves.

use nalgebra::{Matrix3, SMatrix, UnitQuaternion, Vector3};

use crate::core::imu::{ImuData, ImuNoise, ImuQueue};
use crate::core::math::{hat, sqrt_info_upper};

/// 15x15 matrix over `[alpha, beta, theta, b_a, b_w]`.
pub type Matrix15 = SMatrix<f64, 15, 15>;

/// Regularization added to `P` before inversion when building the
/// square-root information factor; keeps a barely-excited window (few
/// samples, tiny dt) from producing a singular system.
const P_EPS: f64 = 1e-12;

/// Preintegrated IMU measurement over one sweep.
#[derive(Clone, Debug)]
pub struct ImuPreintegration {
    /// Position delta in the starting body frame.
    pub alpha: Vector3<f64>,
    /// Velocity delta in the starting body frame.
    pub beta: Vector3<f64>,
    /// Rotation delta.
    pub gamma: UnitQuaternion<f64>,
    /// Error-state covariance.
    pub p: Matrix15,
    /// Upper-triangular square-root information factor of `P^-1`.
    pub u: Matrix15,
    /// Integrated time in seconds.
    pub duration: f64,
    /// Number of integration steps taken.
    pub n: usize,
}

impl ImuPreintegration {
    /// Offset of the position-delta block.
    pub const ALPHA: usize = 0;
    /// Offset of the velocity-delta block.
    pub const BETA: usize = 3;
    /// Offset of the rotation-delta block.
    pub const THETA: usize = 6;
    /// Offset of the accelerometer-bias block.
    pub const BA: usize = 9;
    /// Offset of the gyroscope-bias block.
    pub const BW: usize = 12;

    /// A reset preintegration.
    pub fn new() -> Self {
        Self {
            alpha: Vector3::zeros(),
            beta: Vector3::zeros(),
            gamma: UnitQuaternion::identity(),
            p: Matrix15::zeros(),
            u: Matrix15::identity(),
            duration: 0.0,
            n: 0,
        }
    }

    /// Return to the just-constructed state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// One integration step with an already debiased sample.
    ///
    /// # Panics
    ///
    /// Panics when `dt` is not positive.
    pub fn integrate(&mut self, dt: f64, imu: &ImuData, noise: &ImuNoise) {
        assert!(dt > 0.0, "integration step must be positive");
        let dt2 = dt * dt;

        let a = imu.acc;
        let w = imu.gyr;
        let ga = self.gamma * a;

        let dgamma = UnitQuaternion::from_scaled_axis(w * dt);
        let dbeta = ga * dt;
        let dalpha = self.beta * dt + ga * dt2 * 0.5;

        // Error-state transition:
        // [0  I        0    0   0]
        // [0  0  -R*[a]x   -R   0]
        // [0  0    -[w]x    0  -I]
        // with identity on the bias diagonal.
        let rmat = self.gamma.to_rotation_matrix().into_inner();
        let mut f = Matrix15::identity();
        f.fixed_view_mut::<3, 3>(Self::ALPHA, Self::BETA)
            .copy_from(&Matrix3::identity());
        f.fixed_view_mut::<3, 3>(Self::BETA, Self::THETA)
            .copy_from(&(-rmat * hat(&a)));
        f.fixed_view_mut::<3, 3>(Self::BETA, Self::BA)
            .copy_from(&(-rmat));
        f.fixed_view_mut::<3, 3>(Self::THETA, Self::THETA)
            .copy_from(&(-hat(&w)));
        f.fixed_view_mut::<3, 3>(Self::THETA, Self::BW)
            .copy_from(&(-Matrix3::identity()));

        self.p = f * self.p * f.transpose() * dt2;
        for k in 0..ImuNoise::DIM {
            self.p[(Self::BETA + k, Self::BETA + k)] += noise.sigma2[k];
        }

        self.alpha += dalpha;
        self.beta += dbeta;
        self.gamma = self.gamma * dgamma;
        self.duration += dt;
        self.n += 1;
    }

    /// Integrate every sample strictly inside `(t0, t1)`, bracketing with
    /// partial steps from `t0` to the first sample and from the last sample
    /// to `t1`, then refresh the square-root information factor.
    ///
    /// Returns the total number of integration steps. When the queue holds
    /// no usable sample for the window, nothing is integrated and 0 is
    /// returned; the caller treats that as "no IMU yet".
    pub fn compute(&mut self, queue: &ImuQueue, t0: f64, t1: f64) -> usize {
        assert!(t0 < t1, "preintegration window must be forward in time");

        let Some(first) = queue.find_next(t0) else {
            return 0;
        };
        if queue.at(first).time >= t1 {
            return 0;
        }

        let mut t = t0;
        let mut i = first;
        loop {
            let imu = queue.debiased_at(i);
            self.integrate(imu.time - t, &imu, &queue.noise);
            t = imu.time;

            if i + 1 == queue.len() || queue.at(i + 1).time >= t1 {
                break;
            }
            i += 1;
        }

        // Finish the window with the last sample's rates.
        let imu = queue.debiased_at(i);
        self.integrate(t1 - t, &imu, &queue.noise);

        let p_reg = self.p + Matrix15::identity() * P_EPS;
        if let Some(pinv) = p_reg.try_inverse() {
            if let Some(u) = sqrt_info_upper(pinv) {
                self.u = u;
            }
        }

        self.n
    }
}

impl Default for ImuPreintegration {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn gravity_queue(n: usize, dt: f64) -> ImuQueue {
        let mut queue = ImuQueue::new(512, ImuNoise::new(dt, 1e-2, 1e-3, 1e-3, 1e-4));
        for i in 0..=n {
            queue.push(ImuData {
                time: i as f64 * dt,
                gyr: Vector3::zeros(),
                acc: Vector3::new(0.0, 0.0, 9.80665),
            });
        }
        queue
    }

    #[test]
    fn test_constant_gravity_window() {
        let g = Vector3::new(0.0, 0.0, 9.80665);
        let mut preint = ImuPreintegration::new();
        let n = preint.compute(&gravity_queue(110, 0.01), 0.0, 1.0);

        assert!(n >= 100);
        assert_relative_eq!(preint.duration, 1.0, epsilon = 1e-9);
        // No rotation
        assert_relative_eq!(preint.gamma.angle(), 0.0, epsilon = 1e-9);
        // Unit quaternion invariant
        assert_relative_eq!(preint.gamma.as_ref().norm(), 1.0, epsilon = 1e-9);
        // Deltas match pure gravity integration
        assert_relative_eq!(preint.beta, g * preint.duration, epsilon = 1e-6);
        assert_relative_eq!(
            preint.alpha,
            g * 0.5 * preint.duration * preint.duration,
            epsilon = 1e-3
        );
    }

    #[test]
    fn test_sqrt_info_upper_triangular() {
        let mut preint = ImuPreintegration::new();
        preint.compute(&gravity_queue(110, 0.01), 0.0, 1.0);

        for r in 0..15 {
            assert!(preint.u[(r, r)] > 0.0, "diagonal must stay positive");
            for c in 0..r {
                assert_relative_eq!(preint.u[(r, c)], 0.0);
            }
        }
    }

    #[test]
    fn test_compute_is_deterministic_after_reset() {
        let queue = gravity_queue(110, 0.01);
        let mut preint = ImuPreintegration::new();
        preint.compute(&queue, 0.0, 1.0);
        let (a1, b1, d1, n1) = (preint.alpha, preint.beta, preint.duration, preint.n);
        let u1 = preint.u;

        preint.reset();
        preint.compute(&queue, 0.0, 1.0);
        assert_eq!(preint.n, n1);
        assert_relative_eq!(preint.alpha, a1);
        assert_relative_eq!(preint.beta, b1);
        assert_relative_eq!(preint.duration, d1);
        assert_relative_eq!(preint.u, u1);
    }

    #[test]
    fn test_empty_window_reports_no_imu() {
        let queue = ImuQueue::new(8, ImuNoise::new(0.01, 1e-2, 1e-3, 1e-3, 1e-4));
        let mut preint = ImuPreintegration::new();
        assert_eq!(preint.compute(&queue, 0.0, 0.1), 0);
        assert_eq!(preint.n, 0);

        // All samples after the window end
        let queue = gravity_queue(10, 0.01);
        let mut preint = ImuPreintegration::new();
        assert_eq!(preint.compute(&queue, -1.0, -0.9), 0);
    }

    #[test]
    fn test_rotation_accumulates() {
        let mut queue = ImuQueue::new(512, ImuNoise::new(0.01, 1e-2, 1e-3, 1e-3, 1e-4));
        for i in 0..=110 {
            queue.push(ImuData {
                time: i as f64 * 0.01,
                gyr: Vector3::new(0.0, 0.0, 0.5),
                acc: Vector3::zeros(),
            });
        }
        let mut preint = ImuPreintegration::new();
        preint.compute(&queue, 0.0, 1.0);
        assert_relative_eq!(preint.gamma.angle(), 0.5, epsilon = 1e-6);
    }
}
