//! Sweep grid: cell scoring, feature filtering and per-cell statistics.
//!
//! The grid reduces a column range of the sweep into coarser cells, scores
//! each cell's planarity, keeps the good ones and fits a Gaussian to their
//! points. It also owns the cell-boundary pose array used to interpolate a
//! pose for every sweep column.

use nalgebra::Isometry3;
use rayon::prelude::*;
use std::ops::Range;

use crate::config::GridConfig;
use crate::core::math::interp_se3;
use crate::core::scan::{LidarScan, LidarSweep};
use crate::matching::GicpMatch;

/// Grid of scored cells over the sweep, plus the matches fitted to them.
#[derive(Clone, Debug)]
pub struct SweepGrid {
    /// Cell height in sweep rows.
    pub cell_rows: usize,
    /// Cell width in sweep columns.
    pub cell_cols: usize,
    /// Score threshold; cells at or above it are rejected.
    pub max_score: f32,
    /// Whether non-maximum suppression runs during filtering.
    pub nms: bool,
    /// Grid rows.
    pub rows: usize,
    /// Grid columns.
    pub cols: usize,
    /// Curvature score per cell, row-major, NaN when invalid.
    pub score: Vec<f32>,
    /// Match slot per cell, row-major.
    pub matches: Vec<GicpMatch>,
    /// Sensor-to-panorama pose at each cell column boundary (`cols + 1`).
    pub tfs: Vec<Isometry3<f32>>,
    /// Most recently scored column range, in grid coordinates.
    pub col_rg: Range<usize>,
    grainsize: usize,
}

impl SweepGrid {
    /// Build a grid covering a `sweep_rows x sweep_cols` sweep.
    ///
    /// # Panics
    ///
    /// Panics when the sweep size is not a multiple of the cell size.
    pub fn new(sweep_rows: usize, sweep_cols: usize, config: &GridConfig) -> Self {
        assert!(config.cell_rows > 0 && config.cell_cols > 0);
        assert_eq!(
            sweep_rows % config.cell_rows,
            0,
            "sweep rows must be a multiple of cell rows"
        );
        assert_eq!(
            sweep_cols % config.cell_cols,
            0,
            "sweep cols must be a multiple of cell cols"
        );

        let rows = sweep_rows / config.cell_rows;
        let cols = sweep_cols / config.cell_cols;
        Self {
            cell_rows: config.cell_rows,
            cell_cols: config.cell_cols,
            max_score: config.max_score,
            nms: config.nms,
            rows,
            cols,
            score: vec![f32::NAN; rows * cols],
            matches: vec![GicpMatch::default(); rows * cols],
            // one more to cover both ends
            tfs: vec![Isometry3::identity(); cols + 1],
            col_rg: 0..0,
            grainsize: config.grainsize.max(1),
        }
    }

    /// Total number of cells.
    #[inline]
    pub fn total(&self) -> usize {
        self.rows * self.cols
    }

    /// Score at a grid cell.
    #[inline]
    pub fn score_at(&self, r: usize, c: usize) -> f32 {
        self.score[r * self.cols + c]
    }

    /// Match slot at a grid cell.
    #[inline]
    pub fn match_at(&self, r: usize, c: usize) -> &GicpMatch {
        &self.matches[r * self.cols + c]
    }

    /// Score and filter a scan. Returns `(n_scored, n_filtered)`.
    ///
    /// # Panics
    ///
    /// Panics when the scan shape does not match the grid or the scan does
    /// not continue the previously scored column range.
    pub fn add(&mut self, scan: &LidarScan) -> (usize, usize) {
        self.check(scan);
        let n1 = self.score(scan);
        let n2 = self.filter(scan);
        (n1, n2)
    }

    fn check(&self, scan: &LidarScan) {
        assert_eq!(
            scan.rows,
            self.rows * self.cell_rows,
            "scan rows must match grid rows"
        );
        assert_eq!(
            scan.col_rg.start,
            (self.col_rg.end * self.cell_cols) % (self.cols * self.cell_cols),
            "scan must continue the previous column range"
        );
        assert!(
            scan.col_rg.end <= self.cols * self.cell_cols,
            "scan columns exceed sweep width"
        );
        assert_eq!(
            scan.col_rg.start % self.cell_cols,
            0,
            "scan columns must align with cell boundaries"
        );
        assert_eq!(
            scan.col_rg.end % self.cell_cols,
            0,
            "scan columns must align with cell boundaries"
        );
    }

    /// Score every covered cell from the first row of its points. Returns
    /// the number of finite scores.
    fn score(&mut self, scan: &LidarScan) -> usize {
        self.col_rg = scan.col_rg.start / self.cell_cols..scan.col_rg.end / self.cell_cols;

        let cols = self.cols;
        let (cell_rows, cell_cols) = (self.cell_rows, self.cell_cols);
        let col_rg = self.col_rg.clone();
        let grainsize = self.grainsize;

        self.score
            .par_chunks_mut(cols)
            .with_min_len(grainsize)
            .enumerate()
            .map(|(r, row)| {
                let mut n = 0;
                for c in 0..col_rg.len() {
                    // scan columns start at zero, grid columns at col_rg.start
                    let curve = scan.curve_at((r * cell_rows, c * cell_cols), cell_cols);
                    row[col_rg.start + c] = curve;
                    n += usize::from(curve.is_finite());
                }
                n
            })
            .sum()
    }

    /// Threshold + NMS pass over the scored range; good cells get their
    /// mean and covariance fitted. Returns the number of kept cells.
    fn filter(&mut self, scan: &LidarScan) -> usize {
        // Equality with the stored range guarantees score() ran first.
        let new_rg = scan.col_rg.start / self.cell_cols..scan.col_rg.end / self.cell_cols;
        assert_eq!(
            new_rg, self.col_rg,
            "filter must follow score for the same column range"
        );

        let cols = self.cols;
        let (cell_rows, cell_cols) = (self.cell_rows, self.cell_cols);
        let col_rg = self.col_rg.clone();
        let (max_score, nms, grainsize) = (self.max_score, self.nms, self.grainsize);
        // nms reads both horizontal neighbors, so skip the range edges
        let pad = usize::from(nms);

        let Self { score, matches, .. } = &mut *self;
        let score = &*score;

        matches
            .par_chunks_mut(cols)
            .with_min_len(grainsize)
            .enumerate()
            .map(|(r, row)| {
                let mut n = 0;
                for c in 0..col_rg.len() {
                    let cg = col_rg.start + c;
                    let good = c >= pad
                        && c + pad < col_rg.len()
                        && Self::is_cell_good(score, cols, max_score, nms, r, cg);
                    let m = &mut row[cg];
                    if good {
                        scan.mean_covar_at(
                            (r * cell_rows, c * cell_cols),
                            (cell_rows, cell_cols),
                            &mut m.mc_g,
                        );
                        m.px = (r, cg);
                        n += 1;
                    } else {
                        m.reset();
                    }
                }
                n
            })
            .sum()
    }

    fn is_cell_good(score: &[f32], cols: usize, max_score: f32, nms: bool, r: usize, c: usize) -> bool {
        let m = score[r * cols + c];
        // NaN fails the threshold
        if !(m < max_score) {
            return false;
        }
        if nms {
            // NaN neighbors compare as +inf here
            let left = score[r * cols + c - 1];
            let right = score[r * cols + c + 1];
            if m > left || m > right {
                return false;
            }
        }
        true
    }

    /// Pose at the center of cell column `c`: rotation at the geodesic
    /// midpoint, translation averaged.
    pub fn cell_tf(&self, c: usize) -> Isometry3<f32> {
        let t0 = &self.tfs[c];
        let t1 = &self.tfs[c + 1];
        let rot = t0.rotation.slerp(&t1.rotation, 0.5);
        let pos = (t0.translation.vector + t1.translation.vector) * 0.5;
        Isometry3::from_parts(pos.into(), rot)
    }

    /// Expand the cell-boundary poses into one pose per sweep column.
    ///
    /// # Panics
    ///
    /// Panics when the sweep width does not match the grid.
    pub fn interp_sweep(&self, sweep: &mut LidarSweep) {
        assert_eq!(
            (self.tfs.len() - 1) * self.cell_cols,
            sweep.tfs.len(),
            "sweep width must match grid"
        );
        let cell_cols = self.cell_cols;
        let tfs = &self.tfs;

        sweep
            .tfs
            .par_chunks_mut(cell_cols)
            .with_min_len(self.grainsize)
            .enumerate()
            .for_each(|(i, out)| {
                let t0 = &tfs[i];
                let t1 = &tfs[i + 1];
                for (j, tf) in out.iter_mut().enumerate() {
                    let s = j as f32 / cell_cols as f32;
                    *tf = interp_se3(t0, t1, s);
                }
            });
    }

    /// Clear every match slot. Called when a sweep has been absorbed into
    /// the panorama.
    pub fn reset_matches(&mut self) {
        for m in &mut self.matches {
            m.reset();
        }
    }
}
