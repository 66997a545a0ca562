//! Projective association between grid cells and the depth panorama.

use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;

use crate::config::MatcherConfig;
use crate::core::math::sqrt_info_upper;
use crate::core::scan::MeanCovar;
use crate::grid::SweepGrid;
use crate::pano::DepthPano;

/// Regularization added to the combined covariance before inversion, so a
/// perfectly planar patch still yields a finite whitening factor.
const COVAR_EPS: f32 = 1e-6;

/// Association between a grid cell and a panorama patch.
///
/// Both sides carry a Gaussian fitted to their points; `u` whitens the
/// pair's combined covariance. The slot is owned by the grid and filled in
/// two stages: the filter populates the grid side, the matcher the
/// panorama side.
#[derive(Clone, Copy, Debug, Default)]
pub struct GicpMatch {
    /// Grid cell `(row, col)` this match belongs to.
    pub px: (usize, usize),
    /// Gaussian of the cell points in the sweep (grid) frame.
    pub mc_g: MeanCovar,
    /// Gaussian of the supporting panorama points in the panorama frame.
    pub mc_p: MeanCovar,
    /// Upper-triangular whitening factor of the combined covariance.
    pub u: Matrix3<f32>,
}

impl GicpMatch {
    /// Whether the grid side has been populated.
    #[inline]
    pub fn grid_ok(&self) -> bool {
        self.mc_g.n > 0
    }

    /// Whether both sides are populated with a finite whitening factor.
    #[inline]
    pub fn ok(&self) -> bool {
        self.grid_ok() && self.mc_p.n > 0
    }

    /// Clear both sides.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Clear the panorama side only.
    pub fn reset_pano(&mut self) {
        self.mc_p.reset();
        self.u = Matrix3::zeros();
    }
}

/// Projects grid cells into the panorama and fits the matching Gaussians.
#[derive(Clone, Debug)]
pub struct ProjMatcher {
    /// Half extent of the square search window in pixels.
    pub half_rows: usize,
    /// Panorama points closer than this are ignored (meters).
    pub min_dist: f32,
    /// Maximum relative depth gap for a supporting pixel.
    pub range_ratio: f32,
    grainsize: usize,
}

impl ProjMatcher {
    /// Build a matcher from its configuration.
    pub fn new(config: &MatcherConfig) -> Self {
        Self {
            half_rows: config.half_rows,
            min_dist: config.min_dist,
            range_ratio: config.range_ratio,
            grainsize: config.grainsize.max(1),
        }
    }

    /// Full window size in pixels.
    #[inline]
    pub fn win_size(&self) -> usize {
        2 * self.half_rows + 1
    }

    /// Minimum number of supporting pixels: half the window area.
    #[inline]
    pub fn min_pts(&self) -> usize {
        self.win_size() * self.win_size() / 2
    }

    /// Associate every populated grid cell with a panorama patch. Returns
    /// the number of valid matches.
    pub fn match_grid(&self, grid: &mut SweepGrid, pano: &DepthPano) -> usize {
        // Cell poses are fixed for the duration of the pass; snapshot them
        // so the row loop only touches its own match slots.
        let cell_tfs: Vec<_> = (0..grid.cols).map(|c| grid.cell_tf(c)).collect();
        let cols = grid.cols;

        grid.matches
            .par_chunks_mut(cols)
            .with_min_len(self.grainsize)
            .map(|row| {
                let mut n = 0;
                for (c, m) in row.iter_mut().enumerate() {
                    if !m.grid_ok() {
                        m.reset_pano();
                        continue;
                    }
                    n += usize::from(self.match_cell(m, &cell_tfs[c], pano));
                }
                n
            })
            .sum()
    }

    /// Try to complete one match. Any failure leaves the panorama side
    /// empty and reports false.
    fn match_cell(
        &self,
        m: &mut GicpMatch,
        tf_p_g: &nalgebra::Isometry3<f32>,
        pano: &DepthPano,
    ) -> bool {
        m.reset_pano();

        let mu_g = m.mc_g.mean();
        let mu_p_hat = tf_p_g.rotation * mu_g + tf_p_g.translation.vector;
        let Some((px, depth)) = pano.project(mu_p_hat) else {
            return false;
        };
        if pano.at(px).is_empty() {
            return false;
        }

        let mut mc = MeanCovar::default();
        for win_px in pano.win_at(px, (self.half_rows, self.half_rows)) {
            let pixel = pano.at(win_px);
            if pixel.is_empty() {
                continue;
            }
            let d = pixel.metric();
            if d < self.min_dist || (d - depth).abs() / depth > self.range_ratio {
                continue;
            }
            mc.add(pano.unproject(win_px, d));
        }
        if mc.n < self.min_pts() {
            return false;
        }

        // Whitening: U^T U = (cov_p + R cov_g R^T + eps I)^-1
        let rot = tf_p_g.rotation.to_rotation_matrix().into_inner();
        let covar = mc.covar()
            + rot * m.mc_g.covar() * rot.transpose()
            + Matrix3::identity() * COVAR_EPS;
        let Some(u) = covar.try_inverse().and_then(|info| sqrt_info_upper(info)) else {
            return false;
        };
        if u.iter().any(|v| !v.is_finite()) {
            return false;
        }

        m.mc_p = mc;
        m.u = u;
        true
    }
}

/// Collect the panorama-frame means of all valid matches, e.g. for
/// visualization.
pub fn match_points(grid: &SweepGrid) -> Vec<Vector3<f32>> {
    grid.matches
        .iter()
        .filter(|m| m.ok())
        .map(|m| m.mc_p.mean())
        .collect()
}
