//! IMU sample types, the bounded sample queue, and single-step state
//! integrators.

use nalgebra::{SVector, UnitQuaternion, Vector3};
use std::collections::VecDeque;

use super::trajectory::NavState;

/// One inertial sample.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImuData {
    /// Sample time in seconds.
    pub time: f64,
    /// Angular velocity in rad/s, body frame.
    pub gyr: Vector3<f64>,
    /// Specific force in m/s^2, body frame.
    pub acc: Vector3<f64>,
}

impl ImuData {
    /// The sample with the window bias subtracted.
    pub fn debiased(&self, bias: &ImuBias) -> Self {
        Self {
            time: self.time,
            gyr: self.gyr - bias.gyr,
            acc: self.acc - bias.acc,
        }
    }
}

/// Constant-over-window IMU bias.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImuBias {
    /// Accelerometer bias.
    pub acc: Vector3<f64>,
    /// Gyroscope bias.
    pub gyr: Vector3<f64>,
}

/// Discrete-time measurement and bias random-walk variances.
///
/// Built from continuous densities following the kalibr convention:
/// measurement white-noise densities are squared and divided by the sample
/// interval, bias random-walk densities squared and multiplied by it.
#[derive(Clone, Debug)]
pub struct ImuNoise {
    /// Stacked variances `[acc, gyr, acc_bias, gyr_bias]`, three each.
    pub sigma2: SVector<f64, 12>,
}

impl ImuNoise {
    /// Offset of the accelerometer noise block.
    pub const NA: usize = 0;
    /// Offset of the gyroscope noise block.
    pub const NW: usize = 3;
    /// Offset of the accelerometer bias block.
    pub const BA: usize = 6;
    /// Offset of the gyroscope bias block.
    pub const BW: usize = 9;
    /// Total dimension.
    pub const DIM: usize = 12;

    /// Discretize continuous noise densities with sample interval `dt`.
    pub fn new(
        dt: f64,
        acc_noise: f64,
        gyr_noise: f64,
        acc_bias_noise: f64,
        gyr_bias_noise: f64,
    ) -> Self {
        assert!(dt > 0.0, "noise discretization needs a positive dt");
        let mut sigma2 = SVector::<f64, 12>::zeros();
        sigma2
            .fixed_rows_mut::<3>(Self::NA)
            .fill(acc_noise * acc_noise / dt);
        sigma2
            .fixed_rows_mut::<3>(Self::NW)
            .fill(gyr_noise * gyr_noise / dt);
        sigma2
            .fixed_rows_mut::<3>(Self::BA)
            .fill(acc_bias_noise * acc_bias_noise * dt);
        sigma2
            .fixed_rows_mut::<3>(Self::BW)
            .fill(gyr_bias_noise * gyr_bias_noise * dt);
        Self { sigma2 }
    }
}

/// Bounded ring of IMU samples with strictly increasing timestamps.
///
/// Also carries the discrete noise model and the current bias estimate so
/// consumers can debias samples without extra plumbing.
#[derive(Clone, Debug)]
pub struct ImuQueue {
    buf: VecDeque<ImuData>,
    capacity: usize,
    /// Discrete noise model used by preintegration.
    pub noise: ImuNoise,
    /// Bias subtracted from samples handed to integrators.
    pub bias: ImuBias,
}

impl ImuQueue {
    /// Create an empty queue holding at most `capacity` samples.
    pub fn new(capacity: usize, noise: ImuNoise) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            noise,
            bias: ImuBias::default(),
        }
    }

    /// Append a sample, evicting the oldest when full. Samples that do not
    /// advance time are dropped.
    pub fn push(&mut self, imu: ImuData) {
        if let Some(last) = self.buf.back() {
            if imu.time <= last.time {
                log::warn!(
                    "dropping non-monotonic imu sample at t={:.6} (last t={:.6})",
                    imu.time,
                    last.time
                );
                return;
            }
        }
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(imu);
    }

    /// Index of the first sample with `time > t`, or `None` when no sample
    /// is that recent yet.
    pub fn find_next(&self, t: f64) -> Option<usize> {
        self.buf.iter().position(|imu| imu.time > t)
    }

    /// Sample at `i`.
    #[inline]
    pub fn at(&self, i: usize) -> &ImuData {
        &self.buf[i]
    }

    /// Sample at `i` with the current bias subtracted.
    #[inline]
    pub fn debiased_at(&self, i: usize) -> ImuData {
        self.buf[i].debiased(&self.bias)
    }

    /// Number of buffered samples.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the queue holds no samples.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Advance a rotation by a body-frame rate over `dt`.
#[inline]
pub fn integrate_rot(
    rot: &UnitQuaternion<f64>,
    omg: &Vector3<f64>,
    dt: f64,
) -> UnitQuaternion<f64> {
    rot * UnitQuaternion::from_scaled_axis(omg * dt)
}

/// One forward-Euler step of a nav state in the world frame.
///
/// `g_w` is the gravity term added to the rotated specific force.
pub fn integrate_euler(s0: &NavState, imu: &ImuData, g_w: &Vector3<f64>, dt: f64) -> NavState {
    assert!(dt > 0.0, "integration step must be positive");
    let mut s1 = *s0;
    s1.time = s0.time + dt;
    s1.rot = integrate_rot(&s0.rot, &imu.gyr, dt);

    let a = s0.rot * imu.acc + g_w;
    s1.vel = s0.vel + a * dt;
    s1.pos = s0.pos + s0.vel * dt + 0.5 * a * dt * dt;
    s1
}

/// One midpoint step between two samples: rotation advanced with the mean
/// rate, acceleration averaged across both endpoints after rotation.
pub fn integrate_midpoint(
    s0: &NavState,
    imu0: &ImuData,
    imu1: &ImuData,
    g_w: &Vector3<f64>,
) -> NavState {
    let dt = imu1.time - imu0.time;
    assert!(dt > 0.0, "integration step must be positive");
    let mut s1 = *s0;
    s1.time = s0.time + dt;

    let omg = (imu0.gyr + imu1.gyr) * 0.5;
    s1.rot = integrate_rot(&s0.rot, &omg, dt);

    let a0 = s0.rot * imu0.acc;
    let a1 = s1.rot * imu1.acc;
    let a = (a0 + a1) * 0.5 + g_w;
    s1.vel = s0.vel + a * dt;
    s1.pos = s0.pos + s0.vel * dt + 0.5 * a * dt * dt;
    s1
}
