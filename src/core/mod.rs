//! Core types shared across the pipeline: geometry helpers, scan and sweep
//! containers, IMU plumbing and the per-sweep trajectory.

pub mod imu;
pub mod math;
pub mod scan;
pub mod trajectory;

pub use imu::{integrate_euler, integrate_midpoint, ImuBias, ImuData, ImuNoise, ImuQueue};
pub use math::{hat, interp_se3, sqrt_info_upper};
pub use scan::{LidarScan, LidarSweep, MeanCovar, PointXyzr};
pub use trajectory::{NavState, Trajectory};
