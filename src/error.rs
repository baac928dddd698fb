//! # Error Types
//!
//! Every fallible operation in the library returns [`ClimatologyError`].
//! The taxonomy follows the failure modes of the pipeline: missing inputs,
//! mismatched grids and degenerate area boxes are fatal and surfaced
//! immediately; nothing in the library retries.

use crate::storage::StorageError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while building, combining, aggregating or persisting
/// gridded exceedance data.
#[derive(Error, Debug)]
pub enum ClimatologyError {
    /// No exceedance file matches the expected naming pattern.
    #[error("missing input for variable '{variable}' {year}-{month:02}: no file matching {pattern} in {}", dir.display())]
    MissingInput {
        variable: String,
        year: i32,
        month: u32,
        pattern: String,
        dir: PathBuf,
    },

    /// A year directory holds no raw file for a preprocessed variable.
    #[error("missing raw input for variable '{variable}' {year}: no file ending with {suffix} in {}", dir.display())]
    MissingRawInput {
        variable: String,
        year: i32,
        suffix: String,
        dir: PathBuf,
    },

    /// Two series that must share a grid do not.
    #[error("grid mismatch between '{left}' and '{right}': {detail}")]
    GridMismatch {
        left: String,
        right: String,
        detail: String,
    },

    /// An area bounding box selects no grid point.
    #[error("area '{area}' selects no grid points (lon {lon_min}..{lon_max}, lat {lat_min}..{lat_max})")]
    DegenerateArea {
        area: String,
        lon_min: f64,
        lon_max: f64,
        lat_min: f64,
        lat_max: f64,
    },

    /// The configuration document is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A time axis violates the daily, strictly increasing invariant or
    /// cannot be decoded.
    #[error("time axis error: {0}")]
    TimeAxis(String),

    /// Array dimensions or shapes are not what the pipeline expects.
    #[error("layout error: {0}")]
    Layout(String),

    #[error("NetCDF error: {0}")]
    Netcdf(#[from] netcdf::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("report error: {0}")]
    Report(#[from] polars::prelude::PolarsError),

    #[error("array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("worker pool error: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

/// Result type used across the library.
pub type Result<T> = std::result::Result<T, ClimatologyError>;

impl ClimatologyError {
    pub(crate) fn layout(msg: impl Into<String>) -> Self {
        ClimatologyError::Layout(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        ClimatologyError::Config(msg.into())
    }
}
