//! Scan and sweep containers for a rotating LiDAR.
//!
//! A *scan* is a partial column range of the sensor image delivered by the
//! driver; a *sweep* is the rolling full-azimuth buffer those scans fill.
//! Both store one [`PointXyzr`] per (row, column).

use nalgebra::{Isometry3, Matrix3, Vector3};
use rayon::prelude::*;
use std::ops::Range;

use crate::error::OdomError;

/// A single LiDAR return: cartesian point plus range, all in the sensor
/// frame. `range == 0` or any non-finite component marks an invalid return.
#[derive(Clone, Copy, Debug)]
pub struct PointXyzr {
    /// X coordinate in meters.
    pub x: f32,
    /// Y coordinate in meters.
    pub y: f32,
    /// Z coordinate in meters.
    pub z: f32,
    /// Euclidean range in meters; 0 or NaN marks an invalid return.
    pub range: f32,
}

impl PointXyzr {
    /// A valid return.
    pub fn new(x: f32, y: f32, z: f32, range: f32) -> Self {
        Self { x, y, z, range }
    }

    /// The invalid-return sentinel.
    pub fn invalid() -> Self {
        Self {
            x: f32::NAN,
            y: f32::NAN,
            z: f32::NAN,
            range: 0.0,
        }
    }

    /// Whether this return carries usable data.
    #[inline]
    pub fn ok(&self) -> bool {
        self.range > 0.0 && self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Cartesian coordinates.
    #[inline]
    pub fn xyz(&self) -> Vector3<f32> {
        Vector3::new(self.x, self.y, self.z)
    }
}

impl Default for PointXyzr {
    fn default() -> Self {
        Self::invalid()
    }
}

/// Running first and second moments of a 3D point set.
///
/// Accumulates count, sum and scatter; mean and the unbiased sample
/// covariance are derived on demand.
#[derive(Clone, Copy, Debug, Default)]
pub struct MeanCovar {
    /// Number of accumulated points.
    pub n: usize,
    sum: Vector3<f32>,
    sq: Matrix3<f32>,
}

impl MeanCovar {
    /// Accumulate one point.
    #[inline]
    pub fn add(&mut self, p: Vector3<f32>) {
        self.n += 1;
        self.sum += p;
        self.sq += p * p.transpose();
    }

    /// Sample mean. Zero when empty.
    pub fn mean(&self) -> Vector3<f32> {
        if self.n == 0 {
            return Vector3::zeros();
        }
        self.sum / self.n as f32
    }

    /// Unbiased sample covariance. Zero when fewer than two points.
    pub fn covar(&self) -> Matrix3<f32> {
        if self.n < 2 {
            return Matrix3::zeros();
        }
        let n = self.n as f32;
        (self.sq - self.sum * self.sum.transpose() / n) / (n - 1.0)
    }

    /// Discard all accumulated points.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A partial scan: a column range of the sweep image.
#[derive(Clone, Debug)]
pub struct LidarScan {
    /// Acquisition time of the first column (seconds).
    pub time: f64,
    /// Time between consecutive columns (seconds).
    pub dt: f64,
    /// Point image, row-major, `rows x cols`.
    pub xyzr: Vec<PointXyzr>,
    /// Number of beam rows.
    pub rows: usize,
    /// Number of columns in this scan.
    pub cols: usize,
    /// Half-open destination column range in sweep coordinates.
    pub col_rg: Range<usize>,
}

impl LidarScan {
    /// Build a scan, validating the buffer against the declared shape.
    pub fn new(
        time: f64,
        dt: f64,
        xyzr: Vec<PointXyzr>,
        rows: usize,
        col_rg: Range<usize>,
    ) -> Result<Self, OdomError> {
        let cols = col_rg.len();
        if cols == 0 || col_rg.end < col_rg.start {
            return Err(OdomError::BadColumnRange {
                start: col_rg.start,
                end: col_rg.end,
                cols,
            });
        }
        if xyzr.len() != rows * cols {
            return Err(OdomError::BadScanSize {
                rows,
                cols,
                expected: rows * cols,
                got: xyzr.len(),
            });
        }
        Ok(Self {
            time,
            dt,
            xyzr,
            rows,
            cols,
            col_rg,
        })
    }

    /// Point at `(row, col)` in scan-local coordinates.
    #[inline]
    pub fn at(&self, r: usize, c: usize) -> PointXyzr {
        self.xyzr[r * self.cols + c]
    }

    /// Curvature score of the `width` points starting at `px`, first row
    /// only. Staggered-row sensors interleave azimuths between rows, so
    /// mixing rows would corrupt the planarity estimate.
    ///
    /// The score is the norm of the summed deviations from the middle
    /// column, normalized by the cell width and the middle range. Any
    /// invalid point yields NaN.
    pub fn curve_at(&self, px: (usize, usize), width: usize) -> f32 {
        let (r, c0) = px;
        let mid = self.at(r, c0 + width / 2);
        if !mid.ok() {
            return f32::NAN;
        }
        let pm = mid.xyz();
        let mut sum = Vector3::zeros();
        for j in 0..width {
            let p = self.at(r, c0 + j);
            if !p.ok() {
                return f32::NAN;
            }
            sum += p.xyz() - pm;
        }
        sum.norm() / (width as f32 * pm.norm())
    }

    /// Mean and covariance of the valid points in the `size.0 x size.1`
    /// patch starting at `px`, written into `mc`.
    pub fn mean_covar_at(&self, px: (usize, usize), size: (usize, usize), mc: &mut MeanCovar) {
        mc.reset();
        for r in px.0..px.0 + size.0 {
            for c in px.1..px.1 + size.1 {
                let p = self.at(r, c);
                if p.ok() {
                    mc.add(p.xyz());
                }
            }
        }
    }
}

/// The rolling full-azimuth sweep buffer.
///
/// Carries a per-column sensor-to-panorama pose used to deskew points when
/// the sweep is merged into the map. Columns outside the most recently
/// ingested scan hold either earlier columns of the same sweep or the
/// invalid sentinel.
#[derive(Clone, Debug)]
pub struct LidarSweep {
    /// Acquisition time of the most recent scan.
    pub time: f64,
    /// Column period of the most recent scan.
    pub dt: f64,
    /// Point image, row-major, `rows x cols`.
    pub xyzr: Vec<PointXyzr>,
    /// Number of beam rows.
    pub rows: usize,
    /// Number of columns in a full revolution.
    pub cols: usize,
    /// Per-column sensor-to-panorama pose.
    pub tfs: Vec<Isometry3<f32>>,
    /// Column range covered by the most recent scan.
    pub col_rg: Range<usize>,
}

impl LidarSweep {
    /// Create an empty sweep of the given size.
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            time: 0.0,
            dt: 0.0,
            xyzr: vec![PointXyzr::invalid(); rows * cols],
            rows,
            cols,
            tfs: vec![Isometry3::identity(); cols],
            col_rg: 0..0,
        }
    }

    /// Point at `(row, col)` in sweep coordinates.
    #[inline]
    pub fn at(&self, r: usize, c: usize) -> PointXyzr {
        self.xyzr[r * self.cols + c]
    }

    /// Copy a scan into its column range. Returns the number of valid
    /// points ingested.
    ///
    /// # Panics
    ///
    /// Panics when the scan shape does not match the sweep or when the scan
    /// does not continue the previously ingested column range.
    pub fn add_scan(&mut self, scan: &LidarScan) -> usize {
        assert_eq!(scan.rows, self.rows, "scan rows must match sweep rows");
        assert!(
            scan.col_rg.end <= self.cols,
            "scan columns exceed sweep width"
        );
        assert_eq!(
            scan.col_rg.start,
            self.col_rg.end % self.cols,
            "scan must continue the previous column range"
        );

        self.time = scan.time;
        self.dt = scan.dt;
        self.col_rg = scan.col_rg.clone();

        let start = scan.col_rg.start;
        self.xyzr
            .par_chunks_mut(self.cols)
            .enumerate()
            .map(|(r, row)| {
                let mut n = 0;
                for c in 0..scan.cols {
                    let p = scan.at(r, c);
                    row[start + c] = p;
                    n += usize::from(p.ok());
                }
                n
            })
            .sum()
    }

    /// Whether the most recent scan reached the end of the revolution.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.col_rg.end == self.cols
    }
}
