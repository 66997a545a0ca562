//! # chakra-odom
//!
//! Low-latency LiDAR-inertial odometry against a rolling panoramic depth
//! map.
//!
//! ## Overview
//!
//! A rotating LiDAR delivers partial column-range *scans* that accumulate
//! into a full-azimuth *sweep*. Each scan flows through a fixed pipeline:
//!
//! - **SweepGrid** reduces the scan columns to coarse cells, scores their
//!   planarity, suppresses non-minima and fits a Gaussian per kept cell;
//! - **ProjMatcher** projects each cell into the **DepthPano** (a
//!   cylindrical depth image serving as the local map) and fits the
//!   matching panorama-side Gaussian;
//! - **GicpCost** turns the Gaussian pairs, plus an optional preintegrated
//!   IMU factor, into whitened residuals that a small Gauss-Newton solver
//!   minimizes over an SE(3) correction of the sweep trajectory;
//! - on sweep completion the deskewed sweep is merged back into the
//!   panorama by running average.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use chakra_odom::{LidarOdom, OdomConfig};
//! use nalgebra::Isometry3;
//!
//! let mut odom = LidarOdom::new(OdomConfig::default(), Isometry3::identity())?;
//!
//! // Feed IMU samples at their native rate and scans as they arrive.
//! odom.add_imu(imu_sample);
//! let result = odom.add_scan(&scan);
//!
//! println!("pose: {}", result.pose);
//! ```
//!
//! ## Coordinate Frames
//!
//! - *Sensor frame*: scan points as delivered, X right, Z forward.
//! - *Panorama frame*: the local map frame; the first sweep defines it.
//! - The panorama projection takes longitude from `atan2(x, z)` and
//!   latitude from `atan2(y, sqrt(x^2 + z^2))`.

// Core types
pub mod core;

// Unified configuration
pub mod config;

// Error types
pub mod error;

// Feature grid over the sweep
pub mod grid;

// Cylindrical depth panorama (the local map)
pub mod pano;

// Projective association
pub mod matching;

// IMU preintegration
pub mod preint;

// Residuals and Jacobians for the solver
pub mod cost;

// Gauss-Newton solver
pub mod solver;

// Per-scan pipeline
pub mod odom;

// Re-export commonly used types
pub use config::{
    ConfigError, GridConfig, ImuConfig, MatcherConfig, OdomConfig, PanoConfig, SolverConfig,
    SweepConfig,
};

pub use self::core::{
    ImuBias, ImuData, ImuNoise, ImuQueue, LidarScan, LidarSweep, MeanCovar, NavState, PointXyzr,
    Trajectory,
};

pub use cost::{CostFunction, GicpCost, GicpMode, MatchView};

pub use error::OdomError;

pub use grid::SweepGrid;

pub use matching::{match_points, GicpMatch, ProjMatcher};

pub use odom::{LidarOdom, OdomResult};

pub use pano::{DepthPano, DepthPixel};

pub use preint::ImuPreintegration;

pub use solver::{solve, SolverSummary};
