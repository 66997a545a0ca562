//! Cylindrical depth panorama serving as the local map.
//!
//! Each pixel stores a scaled-integer depth plus an observation count;
//! sweeps are merged in by a running average per pixel.

use nalgebra::Vector3;
use rayon::prelude::*;

use crate::config::PanoConfig;
use crate::core::scan::LidarSweep;

/// One panorama pixel: compressed depth and observation count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DepthPixel {
    /// Depth scaled by [`DepthPixel::SCALE`]; 0 marks an empty pixel.
    pub raw: u16,
    /// Number of fused observations, saturating at [`DepthPixel::MAX_CNT`].
    pub cnt: u16,
}

impl DepthPixel {
    /// Fixed depth quantization: raw = meters * SCALE.
    pub const SCALE: f32 = 512.0;
    /// Count saturation limit.
    pub const MAX_CNT: u16 = 10;
    /// Largest representable depth in meters.
    pub const MAX_RANGE: f32 = u16::MAX as f32 / Self::SCALE;

    /// Whether the pixel has never been observed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.raw == 0
    }

    /// Depth in meters.
    #[inline]
    pub fn metric(&self) -> f32 {
        self.raw as f32 / Self::SCALE
    }

    /// Overwrite with a fresh observation.
    #[inline]
    pub fn set(&mut self, depth: f32) {
        self.raw = (depth * Self::SCALE) as u16;
        self.cnt = 1;
    }

    /// Merge a new depth observation.
    ///
    /// Empty pixels are initialized. Occupied pixels update by incremental
    /// running mean when the relative gap is below `fuse_ratio`, otherwise
    /// the observation is rejected as an outlier and the pixel is left
    /// unchanged. Returns whether the pixel changed.
    pub fn fuse(&mut self, depth: f32, fuse_ratio: f32) -> bool {
        if !(depth > 0.0) || depth >= Self::MAX_RANGE {
            return false;
        }
        if self.is_empty() {
            self.set(depth);
            return true;
        }
        let d0 = self.metric();
        if (depth - d0).abs() / d0 >= fuse_ratio {
            return false;
        }
        let d1 = d0 + (depth - d0) / (self.cnt + 1) as f32;
        self.raw = (d1 * Self::SCALE) as u16;
        self.cnt = (self.cnt + 1).min(Self::MAX_CNT);
        true
    }
}

/// Cylindrical depth image.
#[derive(Clone, Debug)]
pub struct DepthPano {
    /// Panorama height in pixels.
    pub rows: usize,
    /// Panorama width in pixels.
    pub cols: usize,
    /// Horizontal field of view in radians.
    pub hfov: f32,
    /// Vertical field of view in radians.
    pub vfov: f32,
    /// Pixel buffer, row-major.
    pub pixels: Vec<DepthPixel>,
    /// Number of sweeps absorbed so far.
    pub num_sweeps: usize,
    fuse_ratio: f32,
}

/// Points closer than this never enter the panorama (meters).
const MIN_RANGE: f32 = 0.2;

impl DepthPano {
    /// Build an empty panorama.
    pub fn new(config: &PanoConfig) -> Self {
        let hfov = if config.hfov > 0.0 {
            config.hfov
        } else {
            std::f32::consts::TAU
        };
        let vfov = if config.vfov > 0.0 {
            config.vfov
        } else {
            hfov * config.rows as f32 / config.cols as f32
        };
        Self {
            rows: config.rows,
            cols: config.cols,
            hfov,
            vfov,
            pixels: vec![DepthPixel::default(); config.rows * config.cols],
            num_sweeps: 0,
            fuse_ratio: config.fuse_ratio,
        }
    }

    /// Pixel at `(row, col)`.
    #[inline]
    pub fn at(&self, px: (usize, usize)) -> DepthPixel {
        self.pixels[px.0 * self.cols + px.1]
    }

    /// Flat index of `(row, col)`.
    #[inline]
    pub fn index(&self, px: (usize, usize)) -> usize {
        px.0 * self.cols + px.1
    }

    /// Project a point in the panorama frame to `(pixel, depth)`.
    ///
    /// Longitude comes from `atan2(x, z)`, latitude from
    /// `atan2(y, sqrt(x^2 + z^2))`. Returns `None` outside the field of
    /// view, below the minimum range, or beyond the representable depth.
    pub fn project(&self, p: Vector3<f32>) -> Option<((usize, usize), f32)> {
        let depth = p.norm();
        if !(depth >= MIN_RANGE) || depth >= DepthPixel::MAX_RANGE {
            return None;
        }
        let azim = p.x.atan2(p.z);
        if azim.abs() > self.hfov * 0.5 {
            return None;
        }
        let elev = p.y.atan2((p.x * p.x + p.z * p.z).sqrt());

        let col = ((azim / self.hfov + 0.5) * self.cols as f32).floor() as isize;
        let row = ((0.5 - elev / self.vfov) * self.rows as f32).floor() as isize;
        if row < 0 || row >= self.rows as isize {
            return None;
        }
        let col = col.rem_euclid(self.cols as isize) as usize;
        Some(((row as usize, col), depth))
    }

    /// Back-project a pixel center at the given depth.
    pub fn unproject(&self, px: (usize, usize), depth: f32) -> Vector3<f32> {
        let azim = ((px.1 as f32 + 0.5) / self.cols as f32 - 0.5) * self.hfov;
        let elev = (0.5 - (px.0 as f32 + 0.5) / self.rows as f32) * self.vfov;
        let xz = depth * elev.cos();
        Vector3::new(xz * azim.sin(), depth * elev.sin(), xz * azim.cos())
    }

    /// Rectangular window centered on `px`: rows clipped to the panorama,
    /// columns wrapping around the seam.
    pub fn win_at(
        &self,
        px: (usize, usize),
        half: (usize, usize),
    ) -> impl Iterator<Item = (usize, usize)> + '_ {
        let r0 = px.0.saturating_sub(half.0);
        let r1 = (px.0 + half.0 + 1).min(self.rows);
        let cols = self.cols as isize;
        let c0 = px.1 as isize - half.1 as isize;
        let width = 2 * half.1 + 1;
        (r0..r1).flat_map(move |r| {
            (0..width).map(move |k| (r, (c0 + k as isize).rem_euclid(cols) as usize))
        })
    }

    /// Merge a finished sweep into the panorama. Returns the number of
    /// pixels updated.
    ///
    /// Points are deskewed with the per-column sweep poses. Projection runs
    /// in parallel keyed by sweep column; the pixel updates are applied in
    /// one serial pass since distinct sweep points may land on one pixel.
    pub fn add_sweep(&mut self, sweep: &LidarSweep) -> usize {
        let hits: Vec<Vec<(usize, f32)>> = (0..sweep.cols)
            .into_par_iter()
            .with_min_len(8)
            .map(|c| {
                let tf = sweep.tfs[c];
                let mut out = Vec::new();
                for r in 0..sweep.rows {
                    let pt = sweep.at(r, c);
                    if !pt.ok() {
                        continue;
                    }
                    let p = tf.rotation * pt.xyz() + tf.translation.vector;
                    if let Some((px, depth)) = self.project(p) {
                        out.push((self.index(px), depth));
                    }
                }
                out
            })
            .collect();

        let fuse_ratio = self.fuse_ratio;
        let mut n = 0;
        for col_hits in &hits {
            for &(idx, depth) in col_hits {
                n += usize::from(self.pixels[idx].fuse(depth, fuse_ratio));
            }
        }
        self.num_sweeps += 1;
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scan::PointXyzr;
    use approx::assert_relative_eq;

    fn pano(rows: usize, cols: usize) -> DepthPano {
        DepthPano::new(&PanoConfig {
            rows,
            cols,
            hfov: 0.0,
            vfov: 0.0,
            fuse_ratio: 0.1,
        })
    }

    #[test]
    fn test_pixel_fuse_running_mean() {
        let mut px = DepthPixel::default();
        assert!(px.is_empty());
        assert!(px.fuse(4.0, 0.1));
        assert_eq!(px.cnt, 1);
        assert!(px.fuse(4.2, 0.1));
        assert_eq!(px.cnt, 2);
        assert_relative_eq!(px.metric(), 4.1, epsilon = 2.0 / DepthPixel::SCALE);
        // Outlier rejected, pixel unchanged
        let before = px;
        assert!(!px.fuse(8.0, 0.1));
        assert_eq!(px, before);
    }

    #[test]
    fn test_pixel_count_saturates() {
        let mut px = DepthPixel::default();
        for _ in 0..50 {
            px.fuse(5.0, 0.1);
        }
        assert_eq!(px.cnt, DepthPixel::MAX_CNT);
    }

    #[test]
    fn test_project_unproject_roundtrip() {
        let pano = pano(64, 256);
        for &p in &[
            Vector3::new(0.0, 0.0, 5.0),
            Vector3::new(3.0, 0.5, 4.0),
            Vector3::new(-2.0, -1.0, 6.0),
            Vector3::new(4.0, 0.2, -4.0),
        ] {
            let ((r, c), depth) = pano.project(p).expect("in view");
            assert_relative_eq!(depth, p.norm(), epsilon = 1e-5);
            let q = pano.unproject((r, c), depth);
            // Within one pixel of angular quantization
            let cell = depth * (pano.hfov / pano.cols as f32 + pano.vfov / pano.rows as f32);
            assert!((q - p).norm() <= cell, "p={p:?} q={q:?}");

            // And the pixel center re-projects onto itself.
            let ((r2, c2), _) = pano.project(q).expect("in view");
            assert_eq!((r, c), (r2, c2));
        }
    }

    #[test]
    fn test_project_rejects_out_of_view() {
        let pano = pano(64, 256);
        // Too close
        assert!(pano.project(Vector3::new(0.0, 0.0, 0.05)).is_none());
        // Above the vertical field of view
        assert!(pano.project(Vector3::new(0.0, 50.0, 1.0)).is_none());
        // Beyond representable depth
        assert!(pano.project(Vector3::new(0.0, 0.0, 200.0)).is_none());
    }

    #[test]
    fn test_win_at_clips_rows_and_wraps_cols() {
        let pano = pano(8, 16);
        let win: Vec<_> = pano.win_at((0, 0), (2, 2)).collect();
        // Rows clipped at the top: 3 rows x 5 cols
        assert_eq!(win.len(), 15);
        assert!(win.contains(&(0, 15)));
        assert!(win.contains(&(0, 14)));
        assert!(win.contains(&(2, 2)));
        assert!(!win.iter().any(|&(r, _)| r > 2));

        // Wrap at the right seam is continuous
        let win: Vec<_> = pano.win_at((4, 15), (0, 1)).collect();
        assert_eq!(win, vec![(4, 14), (4, 15), (4, 0)]);
    }

    #[test]
    fn test_add_sweep_fills_pixels() {
        let mut pano = pano(8, 32);
        let mut sweep = LidarSweep::new(8, 32);
        for r in 0..8 {
            for c in 0..32 {
                let az = ((c as f32 + 0.5) / 32.0 - 0.5) * pano.hfov;
                let el = (0.5 - (r as f32 + 0.5) / 8.0) * pano.vfov;
                let p = Vector3::new(el.cos() * az.sin(), el.sin(), el.cos() * az.cos()) * 5.0;
                sweep.xyzr[r * 32 + c] = PointXyzr::new(p.x, p.y, p.z, 5.0);
            }
        }
        let n = pano.add_sweep(&sweep);
        assert_eq!(n, 8 * 32);
        assert_eq!(pano.num_sweeps, 1);
        // Every generated point lands on its own pixel
        assert_relative_eq!(pano.at((3, 7)).metric(), 5.0, epsilon = 0.01);
    }
}
