//! Odometry configuration types.
//!
//! All tunables live here as plain values; loading them from a file or a
//! parameter server is the job of the embedding application. Every struct
//! derives `serde` so the whole tree round-trips through any format the
//! application picks.

use serde::{Deserialize, Serialize};

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Sweep dimensions must be an integer multiple of the cell size.
    #[error("sweep size {rows}x{cols} is not divisible by cell size {cell_rows}x{cell_cols}")]
    CellMismatch {
        /// Sweep rows.
        rows: usize,
        /// Sweep columns.
        cols: usize,
        /// Cell rows.
        cell_rows: usize,
        /// Cell columns.
        cell_cols: usize,
    },

    /// A scalar parameter is out of its valid range.
    #[error("invalid value for {name}: {value}")]
    InvalidValue {
        /// Parameter name.
        name: &'static str,
        /// Offending value.
        value: f64,
    },
}

/// Dimensions of the full-azimuth sweep image.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Number of beam rows delivered by the sensor.
    #[serde(default = "default_sweep_rows")]
    pub rows: usize,

    /// Number of columns in one full azimuth revolution.
    #[serde(default = "default_sweep_cols")]
    pub cols: usize,
}

fn default_sweep_rows() -> usize {
    64
}

fn default_sweep_cols() -> usize {
    1024
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            rows: default_sweep_rows(),
            cols: default_sweep_cols(),
        }
    }
}

/// Configuration for the feature grid built on top of the sweep.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GridConfig {
    /// Cell height in sweep rows.
    #[serde(default = "default_cell_rows")]
    pub cell_rows: usize,

    /// Cell width in sweep columns.
    #[serde(default = "default_cell_cols")]
    pub cell_cols: usize,

    /// Whether to apply non-maximum suppression across neighboring cells.
    #[serde(default)]
    pub nms: bool,

    /// Cells with a curvature score at or above this value are rejected.
    /// Low scores indicate planar regions.
    #[serde(default = "default_max_score")]
    pub max_score: f32,

    /// Minimum number of grid rows per parallel work item.
    #[serde(default = "default_grainsize")]
    pub grainsize: usize,
}

fn default_cell_rows() -> usize {
    2
}

fn default_cell_cols() -> usize {
    16
}

fn default_max_score() -> f32 {
    0.05
}

fn default_grainsize() -> usize {
    8
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            cell_rows: default_cell_rows(),
            cell_cols: default_cell_cols(),
            nms: false,
            max_score: default_max_score(),
            grainsize: default_grainsize(),
        }
    }
}

/// Configuration for the projective matcher.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Half height (and half width) of the panorama search window in pixels.
    /// The full window is `(2 * half_rows + 1)^2`.
    #[serde(default = "default_half_rows")]
    pub half_rows: usize,

    /// Panorama points closer than this to the sensor are ignored (meters).
    #[serde(default = "default_min_dist")]
    pub min_dist: f32,

    /// Maximum relative depth gap between a window pixel and the projected
    /// cell for the pixel to support the match.
    #[serde(default = "default_range_ratio")]
    pub range_ratio: f32,

    /// Minimum number of grid rows per parallel work item.
    #[serde(default = "default_grainsize")]
    pub grainsize: usize,
}

fn default_half_rows() -> usize {
    2
}

fn default_min_dist() -> f32 {
    2.0
}

fn default_range_ratio() -> f32 {
    0.1
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            half_rows: default_half_rows(),
            min_dist: default_min_dist(),
            range_ratio: default_range_ratio(),
            grainsize: default_grainsize(),
        }
    }
}

/// Configuration for the cylindrical depth panorama.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PanoConfig {
    /// Panorama height in pixels.
    #[serde(default = "default_pano_rows")]
    pub rows: usize,

    /// Panorama width in pixels.
    #[serde(default = "default_pano_cols")]
    pub cols: usize,

    /// Horizontal field of view in radians. 0 means full azimuth (2 pi).
    #[serde(default)]
    pub hfov: f32,

    /// Vertical field of view in radians. 0 derives it from the aspect
    /// ratio: `vfov = hfov * rows / cols`.
    #[serde(default)]
    pub vfov: f32,

    /// Maximum relative depth gap for fusing a new observation into an
    /// occupied pixel by running average.
    #[serde(default = "default_fuse_ratio")]
    pub fuse_ratio: f32,
}

fn default_pano_rows() -> usize {
    256
}

fn default_pano_cols() -> usize {
    1024
}

fn default_fuse_ratio() -> f32 {
    0.1
}

impl Default for PanoConfig {
    fn default() -> Self {
        Self {
            rows: default_pano_rows(),
            cols: default_pano_cols(),
            hfov: 0.0,
            vfov: 0.0,
            fuse_ratio: default_fuse_ratio(),
        }
    }
}

/// IMU noise densities and related parameters.
///
/// Densities follow the kalibr convention: continuous white-noise densities
/// for the measurements, random-walk densities for the biases. They are
/// discretized with `rate_dt` when building [`crate::core::ImuNoise`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImuConfig {
    /// Accelerometer white-noise density (m/s^2/sqrt(Hz)).
    #[serde(default = "default_acc_noise")]
    pub acc_noise: f64,

    /// Gyroscope white-noise density (rad/s/sqrt(Hz)).
    #[serde(default = "default_gyr_noise")]
    pub gyr_noise: f64,

    /// Accelerometer bias random-walk density.
    #[serde(default = "default_acc_bias_noise")]
    pub acc_bias_noise: f64,

    /// Gyroscope bias random-walk density.
    #[serde(default = "default_gyr_bias_noise")]
    pub gyr_bias_noise: f64,

    /// Nominal sample interval of the IMU in seconds.
    #[serde(default = "default_rate_dt")]
    pub rate_dt: f64,

    /// Magnitude of local gravity (m/s^2).
    #[serde(default = "default_gravity_norm")]
    pub gravity_norm: f64,

    /// Scale applied to the whitened IMU factor inside the cost.
    #[serde(default = "default_imu_weight")]
    pub imu_weight: f64,

    /// Capacity of the IMU sample ring buffer.
    #[serde(default = "default_imu_capacity")]
    pub capacity: usize,

    /// Predict translation with full kinematic integration instead of
    /// holding it constant across the sweep. Off by default; the
    /// rotation-only predictor matches the registration model.
    #[serde(default)]
    pub predict_translation: bool,
}

fn default_acc_noise() -> f64 {
    1e-2
}

fn default_gyr_noise() -> f64 {
    1e-3
}

fn default_acc_bias_noise() -> f64 {
    1e-3
}

fn default_gyr_bias_noise() -> f64 {
    1e-4
}

fn default_rate_dt() -> f64 {
    0.01
}

fn default_gravity_norm() -> f64 {
    9.80665
}

fn default_imu_weight() -> f64 {
    1.0
}

fn default_imu_capacity() -> usize {
    256
}

impl Default for ImuConfig {
    fn default() -> Self {
        Self {
            acc_noise: default_acc_noise(),
            gyr_noise: default_gyr_noise(),
            acc_bias_noise: default_acc_bias_noise(),
            gyr_bias_noise: default_gyr_bias_noise(),
            rate_dt: default_rate_dt(),
            gravity_norm: default_gravity_norm(),
            imu_weight: default_imu_weight(),
            capacity: default_imu_capacity(),
            predict_translation: false,
        }
    }
}

/// Configuration for the Gauss-Newton solver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Iteration budget per registration.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Worker threads for the data-parallel sections. 0 uses the global
    /// rayon pool.
    #[serde(default)]
    pub num_threads: usize,

    /// Constant damping added to the normal-equation diagonal.
    #[serde(default = "default_damping")]
    pub damping: f64,

    /// Stop once the parameter update norm falls below this.
    #[serde(default = "default_param_tol")]
    pub param_tol: f64,
}

fn default_max_iterations() -> usize {
    5
}

fn default_damping() -> f64 {
    1e-6
}

fn default_param_tol() -> f64 {
    1e-8
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            num_threads: 0,
            damping: default_damping(),
            param_tol: default_param_tol(),
        }
    }
}

/// Top-level odometry configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OdomConfig {
    /// Sweep image dimensions.
    #[serde(default)]
    pub sweep: SweepConfig,

    /// Feature grid parameters.
    #[serde(default)]
    pub grid: GridConfig,

    /// Projective matcher parameters.
    #[serde(default)]
    pub matcher: MatcherConfig,

    /// Depth panorama parameters.
    #[serde(default)]
    pub pano: PanoConfig,

    /// IMU noise model and gravity.
    #[serde(default)]
    pub imu: ImuConfig,

    /// Solver parameters.
    #[serde(default)]
    pub solver: SolverConfig,

    /// Use the linear (per-column interpolated) cost instead of the rigid
    /// one during registration.
    #[serde(default)]
    pub linear_cost: bool,
}

impl OdomConfig {
    /// Check cross-field invariants before building the pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grid.cell_rows == 0
            || self.grid.cell_cols == 0
            || self.sweep.rows % self.grid.cell_rows != 0
            || self.sweep.cols % self.grid.cell_cols != 0
        {
            return Err(ConfigError::CellMismatch {
                rows: self.sweep.rows,
                cols: self.sweep.cols,
                cell_rows: self.grid.cell_rows,
                cell_cols: self.grid.cell_cols,
            });
        }
        if self.pano.rows == 0 || self.pano.cols == 0 {
            return Err(ConfigError::InvalidValue {
                name: "pano.rows/cols",
                value: 0.0,
            });
        }
        if !(self.grid.max_score > 0.0) {
            return Err(ConfigError::InvalidValue {
                name: "grid.max_score",
                value: self.grid.max_score as f64,
            });
        }
        if !(self.matcher.range_ratio > 0.0 && self.matcher.range_ratio < 1.0) {
            return Err(ConfigError::InvalidValue {
                name: "matcher.range_ratio",
                value: self.matcher.range_ratio as f64,
            });
        }
        if !(self.imu.rate_dt > 0.0) {
            return Err(ConfigError::InvalidValue {
                name: "imu.rate_dt",
                value: self.imu.rate_dt,
            });
        }
        if self.solver.max_iterations == 0 {
            return Err(ConfigError::InvalidValue {
                name: "solver.max_iterations",
                value: 0.0,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = OdomConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.grid.cell_cols, 16);
        assert_eq!(config.solver.max_iterations, 5);
        assert!(!config.linear_cost);
    }

    #[test]
    fn test_cell_mismatch_rejected() {
        let mut config = OdomConfig::default();
        config.grid.cell_cols = 15; // 1024 % 15 != 0
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CellMismatch { .. })
        ));
    }

    #[test]
    fn test_bad_scalar_rejected() {
        let mut config = OdomConfig::default();
        config.matcher.range_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = OdomConfig::default();
        config.imu.rate_dt = 0.0;
        assert!(config.validate().is_err());
    }
}
