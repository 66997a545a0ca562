//! Error types for the odometry pipeline.

use crate::config::ConfigError;

/// Recoverable errors surfaced by the public API.
///
/// Shape violations detected deep inside the pipeline (mismatched sweep
/// dimensions, non-contiguous column ranges) are treated as broken caller
/// contracts and panic instead; see the `Panics` sections on the individual
/// methods.
#[derive(Debug, thiserror::Error)]
pub enum OdomError {
    /// Invalid configuration values.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Scan image size does not match the declared dimensions.
    #[error("scan has {got} points, expected {rows}x{cols}={expected}")]
    BadScanSize {
        /// Declared row count.
        rows: usize,
        /// Declared column count.
        cols: usize,
        /// rows * cols
        expected: usize,
        /// Actual buffer length.
        got: usize,
    },

    /// Scan column range is empty or does not match the image width.
    #[error("scan column range {start}..{end} does not span {cols} columns")]
    BadColumnRange {
        /// Range start (inclusive).
        start: usize,
        /// Range end (exclusive).
        end: usize,
        /// Scan image width.
        cols: usize,
    },

    /// Worker pool construction failed.
    #[error("thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
