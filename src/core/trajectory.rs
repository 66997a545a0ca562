//! Short pose trajectory spanning one sweep.

use nalgebra::{Isometry3, UnitQuaternion, Vector3};

use super::imu::{integrate_euler, ImuQueue};

/// Navigation state of the IMU in the panorama frame.
#[derive(Clone, Copy, Debug)]
pub struct NavState {
    /// State time in seconds.
    pub time: f64,
    /// Orientation of the IMU in the panorama frame.
    pub rot: UnitQuaternion<f64>,
    /// Position of the IMU in the panorama frame.
    pub pos: Vector3<f64>,
    /// Velocity in the panorama frame.
    pub vel: Vector3<f64>,
}

impl Default for NavState {
    fn default() -> Self {
        Self {
            time: 0.0,
            rot: UnitQuaternion::identity(),
            pos: Vector3::zeros(),
            vel: Vector3::zeros(),
        }
    }
}

impl NavState {
    /// Pose of this state as a rigid transform.
    pub fn tf(&self) -> Isometry3<f64> {
        Isometry3::from_parts(self.pos.into(), self.rot)
    }
}

/// An ordered sequence of [`NavState`] covering exactly one sweep plus one
/// endpoint, at uniform cell spacing.
#[derive(Clone, Debug)]
pub struct Trajectory {
    /// States at the cell column boundaries, strictly increasing in time.
    pub states: Vec<NavState>,
    /// Gravity in the panorama frame, oriented along the accelerometer
    /// reading at rest (it is the measured reaction, opposite true gravity).
    pub g_pano: Vector3<f64>,
    /// Extrinsic transform from the LiDAR frame to the IMU frame.
    pub t_imu_lidar: Isometry3<f64>,
    /// Predict translation kinematically instead of holding it constant.
    pub predict_translation: bool,
}

impl Trajectory {
    /// Create a trajectory with `size` states (grid columns + 1).
    pub fn new(size: usize) -> Self {
        assert!(size >= 2, "trajectory needs at least two states");
        Self {
            states: vec![NavState::default(); size],
            g_pano: Vector3::zeros(),
            t_imu_lidar: Isometry3::identity(),
            predict_translation: false,
        }
    }

    /// Number of states.
    #[inline]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether the trajectory holds no states. Always false after
    /// construction.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// State at the sweep start.
    #[inline]
    pub fn front(&self) -> &NavState {
        self.states.first().expect("trajectory is never empty")
    }

    /// State at the sweep end.
    #[inline]
    pub fn back(&self) -> &NavState {
        self.states.last().expect("trajectory is never empty")
    }

    /// Time spanned by the trajectory.
    #[inline]
    pub fn duration(&self) -> f64 {
        self.back().time - self.front().time
    }

    /// Align gravity with the first accelerometer reading, scaled to the
    /// configured norm.
    pub fn init_gravity(&mut self, acc: &Vector3<f64>, gravity_norm: f64) {
        self.g_pano = acc.normalize() * gravity_norm;
    }

    /// Record the LiDAR-to-IMU extrinsic and seed all states with its
    /// inverse so the first sweep frame coincides with the panorama frame.
    pub fn init_extrinsic(&mut self, t_imu_lidar: Isometry3<f64>) {
        self.t_imu_lidar = t_imu_lidar;
        let t_lidar_imu = t_imu_lidar.inverse();
        for st in &mut self.states {
            st.rot = t_lidar_imu.rotation;
            st.pos = t_lidar_imu.translation.vector;
        }
    }

    /// Sensor-to-panorama pose at cell boundary `i`.
    pub fn tf_pano_lidar(&self, i: usize) -> Isometry3<f64> {
        self.states[i].tf() * self.t_imu_lidar
    }

    /// Propagate all states forward from the first one using debiased gyro
    /// samples, one cell period `dt` at a time starting at `t0`.
    ///
    /// By default only the rotation advances while the translation is held
    /// at the first state; registration absorbs the missing translation.
    /// With `predict_translation` the full kinematic step runs instead.
    ///
    /// Returns the number of IMU samples consumed, 0 when no sample newer
    /// than `t0` is buffered yet.
    pub fn predict(&mut self, queue: &ImuQueue, t0: f64, dt: f64) -> usize {
        let Some(mut ibuf) = queue.find_next(t0) else {
            return 0;
        };
        let ibuf0 = ibuf;
        self.states[0].time = t0;

        for i in 1..self.states.len() {
            let ti = t0 + dt * i as f64;
            if queue.at(ibuf).time < ti {
                ibuf += 1;
            }
            if ibuf >= queue.len() {
                ibuf = queue.len() - 1;
            }
            let imu = queue.debiased_at(ibuf);

            let prev = self.states[i - 1];
            if self.predict_translation {
                // Subtract the gravity reaction so a resting IMU stays put.
                let g_w = -self.g_pano;
                self.states[i] = integrate_euler(&prev, &imu, &g_w, dt);
            } else {
                let pos0 = self.states[0].pos;
                let st = &mut self.states[i];
                st.time = prev.time + dt;
                st.pos = pos0;
                st.vel = prev.vel;
                st.rot = prev.rot * UnitQuaternion::from_scaled_axis(imu.gyr * dt);
            }
        }

        ibuf - ibuf0 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::imu::{ImuData, ImuNoise};
    use approx::assert_relative_eq;
    use nalgebra::Translation3;

    fn queue_with_rate(gyr: Vector3<f64>, n: usize) -> ImuQueue {
        let mut queue = ImuQueue::new(512, ImuNoise::new(0.01, 1e-2, 1e-3, 1e-3, 1e-4));
        for i in 0..n {
            queue.push(ImuData {
                time: i as f64 * 0.01,
                gyr,
                acc: Vector3::new(0.0, 0.0, 9.81),
            });
        }
        queue
    }

    #[test]
    fn test_init_extrinsic_identity_start() {
        let mut traj = Trajectory::new(5);
        let t_imu_lidar = Isometry3::from_parts(
            Translation3::new(0.1, 0.0, -0.05),
            UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 0.3, 0.0)),
        );
        traj.init_extrinsic(t_imu_lidar);
        // Sensor frame coincides with the panorama at startup.
        let tf = traj.tf_pano_lidar(0);
        assert_relative_eq!(tf.translation.vector.norm(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(tf.rotation.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_predict_without_imu() {
        let queue = ImuQueue::new(8, ImuNoise::new(0.01, 1e-2, 1e-3, 1e-3, 1e-4));
        let mut traj = Trajectory::new(5);
        assert_eq!(traj.predict(&queue, 0.0, 0.1), 0);
    }

    #[test]
    fn test_predict_rotation_only() {
        let queue = queue_with_rate(Vector3::new(0.0, 0.0, 1.0), 200);
        let mut traj = Trajectory::new(11);
        let consumed = traj.predict(&queue, 0.0, 0.1);
        assert!(consumed > 0);

        // Uniform timestamps
        for i in 1..traj.len() {
            assert_relative_eq!(
                traj.states[i].time - traj.states[i - 1].time,
                0.1,
                epsilon = 1e-12
            );
        }
        // One rad/s over one second of sweep
        assert_relative_eq!(traj.back().rot.angle(), 1.0, epsilon = 1e-6);
        // Translation held at the sweep start
        assert_relative_eq!(traj.back().pos, traj.front().pos, epsilon = 1e-12);
        assert_relative_eq!(traj.duration(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_predict_full_kinematic_gated() {
        let queue = queue_with_rate(Vector3::zeros(), 200);
        let mut traj = Trajectory::new(11);
        traj.predict_translation = true;
        traj.init_gravity(&Vector3::new(0.0, 0.0, 9.81), 9.81);
        traj.predict(&queue, 0.0, 0.1);
        // Resting IMU: measured reaction cancels gravity, nothing moves.
        assert_relative_eq!(traj.back().pos.norm(), 0.0, epsilon = 1e-9);
        assert_relative_eq!(traj.back().vel.norm(), 0.0, epsilon = 1e-9);
    }
}
