//! # Gridded Data Model
//!
//! Daily gridded series and the climatology products derived from them.
//!
//! All arrays keep the spatial axes last (`lat`, `lon`) so a spatial tile is
//! a contiguous trailing-axis slice of every product. Inputs are exposed
//! through the [`TileSource`] trait, which hands out one `(time, lat, lon)`
//! block per spatial [`Tile`] on demand; this is what keeps the pipeline
//! lazy and memory bounded.

use crate::error::{ClimatologyError, Result};
use chrono::NaiveDate;
use ndarray::{Array3, Array4, ArrayView2, s};
use std::ops::Range;

const COORD_TOLERANCE: f64 = 1e-9;

/// Latitude and longitude coordinate axes of a regular grid.
#[derive(Debug, Clone, PartialEq)]
pub struct GridAxes {
    pub lat: Vec<f64>,
    pub lon: Vec<f64>,
}

impl GridAxes {
    /// Builds grid axes, rejecting empty or non strictly monotonic axes.
    pub fn new(lat: Vec<f64>, lon: Vec<f64>) -> Result<Self> {
        for (name, axis) in [("lat", &lat), ("lon", &lon)] {
            if axis.is_empty() {
                return Err(ClimatologyError::layout(format!("{} axis is empty", name)));
            }
            if !strictly_monotonic(axis) {
                return Err(ClimatologyError::layout(format!(
                    "{} axis is not strictly monotonic",
                    name
                )));
            }
        }
        Ok(GridAxes { lat, lon })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.lat.len(), self.lon.len())
    }

    /// Fails with a grid-mismatch error unless both grids carry the same
    /// coordinates. No regridding is ever attempted.
    pub fn ensure_matches(&self, other: &GridAxes, left: &str, right: &str) -> Result<()> {
        let mismatch = |detail: String| ClimatologyError::GridMismatch {
            left: left.to_string(),
            right: right.to_string(),
            detail,
        };
        if self.shape() != other.shape() {
            return Err(mismatch(format!(
                "shape {:?} vs {:?}",
                self.shape(),
                other.shape()
            )));
        }
        if let Some(i) = first_difference(&self.lat, &other.lat) {
            return Err(mismatch(format!(
                "lat[{}] = {} vs {}",
                i, self.lat[i], other.lat[i]
            )));
        }
        if let Some(j) = first_difference(&self.lon, &other.lon) {
            return Err(mismatch(format!(
                "lon[{}] = {} vs {}",
                j, self.lon[j], other.lon[j]
            )));
        }
        Ok(())
    }
}

fn strictly_monotonic(axis: &[f64]) -> bool {
    axis.windows(2).all(|w| w[1] > w[0]) || axis.windows(2).all(|w| w[1] < w[0])
}

fn first_difference(a: &[f64], b: &[f64]) -> Option<usize> {
    a.iter()
        .zip(b)
        .position(|(x, y)| (x - y).abs() > COORD_TOLERANCE)
}

/// Checks that dates are strictly increasing (one sample per day, no
/// duplicates).
pub fn validate_dates(dates: &[NaiveDate]) -> Result<()> {
    if let Some(w) = dates.windows(2).find(|w| w[1] <= w[0]) {
        return Err(ClimatologyError::TimeAxis(format!(
            "dates must be strictly increasing, found {} followed by {}",
            w[0], w[1]
        )));
    }
    Ok(())
}

/// Checks that dates form a daily axis: consecutive calendar days with no
/// gap and no duplicate.
pub fn validate_daily_axis(dates: &[NaiveDate]) -> Result<()> {
    if let Some(w) = dates.windows(2).find(|w| w[0].succ_opt() != Some(w[1])) {
        return Err(ClimatologyError::TimeAxis(format!(
            "dates must be consecutive days, found {} followed by {}",
            w[0], w[1]
        )));
    }
    Ok(())
}

/// A rectangular block of grid cells, as index ranges into the lat/lon axes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub lat: Range<usize>,
    pub lon: Range<usize>,
}

impl Tile {
    pub fn shape(&self) -> (usize, usize) {
        (self.lat.len(), self.lon.len())
    }
}

/// Splits a grid into tiles of at most `chunk_lat` × `chunk_lon` cells.
pub fn tiles(axes: &GridAxes, chunk_lat: usize, chunk_lon: usize) -> Vec<Tile> {
    let (n_lat, n_lon) = axes.shape();
    let chunk_lat = chunk_lat.max(1);
    let chunk_lon = chunk_lon.max(1);
    let mut out = Vec::new();
    for lat0 in (0..n_lat).step_by(chunk_lat) {
        for lon0 in (0..n_lon).step_by(chunk_lon) {
            out.push(Tile {
                lat: lat0..(lat0 + chunk_lat).min(n_lat),
                lon: lon0..(lon0 + chunk_lon).min(n_lon),
            });
        }
    }
    out
}

/// A lazily readable daily `(time, lat, lon)` series.
///
/// Implementations must be pure: reading the same tile twice yields the same
/// block, and reads of different tiles are independent.
pub trait TileSource: Send + Sync {
    /// Name used in logs and error messages.
    fn name(&self) -> &str;

    fn dates(&self) -> &[NaiveDate];

    fn axes(&self) -> &GridAxes;

    /// Materializes the `(time, lat, lon)` block of one tile.
    fn read_tile(&self, tile: &Tile) -> Result<Array3<f32>>;
}

/// A daily series held in memory, on a gap-free daily axis.
#[derive(Debug, Clone)]
pub struct DailyGrid {
    pub name: String,
    pub dates: Vec<NaiveDate>,
    pub axes: GridAxes,
    /// Values indexed by (time, lat, lon).
    pub values: Array3<f32>,
}

impl DailyGrid {
    pub fn new(
        name: &str,
        dates: Vec<NaiveDate>,
        axes: GridAxes,
        values: Array3<f32>,
    ) -> Result<Self> {
        validate_daily_axis(&dates)?;
        let (n_lat, n_lon) = axes.shape();
        if values.dim() != (dates.len(), n_lat, n_lon) {
            return Err(ClimatologyError::layout(format!(
                "'{}' has shape {:?}, expected {:?}",
                name,
                values.dim(),
                (dates.len(), n_lat, n_lon)
            )));
        }
        Ok(DailyGrid {
            name: name.to_string(),
            dates,
            axes,
            values,
        })
    }
}

impl TileSource for DailyGrid {
    fn name(&self) -> &str {
        &self.name
    }

    fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    fn axes(&self) -> &GridAxes {
        &self.axes
    }

    fn read_tile(&self, tile: &Tile) -> Result<Array3<f32>> {
        Ok(self
            .values
            .slice(s![.., tile.lat.clone(), tile.lon.clone()])
            .to_owned())
    }
}

/// Fraction of suitable days per calendar month, pooled over all years.
#[derive(Debug, Clone)]
pub struct MonthlyClimatology {
    pub months: Vec<u32>,
    pub axes: GridAxes,
    /// Values indexed by (month, lat, lon).
    pub values: Array3<f32>,
}

impl MonthlyClimatology {
    pub fn field(&self, month: u32) -> Option<ArrayView2<'_, f32>> {
        let m = self.months.iter().position(|&x| x == month)?;
        Some(self.values.slice(s![m, .., ..]))
    }
}

/// Interannual quantiles of the per-year monthly suitable fraction.
#[derive(Debug, Clone)]
pub struct ExtremeClimatology {
    pub months: Vec<u32>,
    pub quantiles: Vec<f64>,
    pub axes: GridAxes,
    /// Values indexed by (month, quantile, lat, lon).
    pub values: Array4<f32>,
}

impl ExtremeClimatology {
    pub fn field(&self, month: u32, quantile: f64) -> Option<ArrayView2<'_, f32>> {
        let m = self.months.iter().position(|&x| x == month)?;
        let q = self
            .quantiles
            .iter()
            .position(|&x| (x - quantile).abs() < COORD_TOLERANCE)?;
        Some(self.values.slice(s![m, q, .., ..]))
    }
}

/// Monthly frequency of days lying inside a fully suitable window, one slice
/// per window length.
#[derive(Debug, Clone)]
pub struct WeatherWindows {
    pub windows: Vec<usize>,
    pub months: Vec<u32>,
    pub axes: GridAxes,
    /// Values indexed by (window, month, lat, lon).
    pub values: Array4<f32>,
}

impl WeatherWindows {
    pub fn field(&self, window: usize, month: u32) -> Option<ArrayView2<'_, f32>> {
        let w = self.windows.iter().position(|&x| x == window)?;
        let m = self.months.iter().position(|&x| x == month)?;
        Some(self.values.slice(s![w, m, .., ..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axes() -> GridAxes {
        GridAxes::new(vec![60.0, 59.5, 59.0], vec![10.0, 10.5]).unwrap()
    }

    #[test]
    fn test_axes_reject_non_monotonic() {
        assert!(GridAxes::new(vec![1.0, 2.0, 1.5], vec![0.0]).is_err());
        assert!(GridAxes::new(vec![1.0, 1.0], vec![0.0]).is_err());
        assert!(GridAxes::new(vec![], vec![0.0]).is_err());
        assert!(GridAxes::new(vec![3.0, 2.0, 1.0], vec![0.0]).is_ok());
    }

    #[test]
    fn test_axes_mismatch_detected() {
        let a = axes();
        let b = GridAxes::new(vec![60.0, 59.5, 59.0], vec![10.0, 10.25]).unwrap();
        let err = a.ensure_matches(&b, "10ws", "sithick").unwrap_err();
        assert!(matches!(err, ClimatologyError::GridMismatch { .. }));
        assert!(a.ensure_matches(&axes(), "a", "b").is_ok());
    }

    #[test]
    fn test_tiles_cover_grid_once() {
        let axes = GridAxes::new(
            (0..7).map(|i| i as f64).collect(),
            (0..5).map(|i| i as f64).collect(),
        )
        .unwrap();
        let tiles = tiles(&axes, 3, 2);
        assert_eq!(tiles.len(), 3 * 3);
        let cells: usize = tiles.iter().map(|t| t.lat.len() * t.lon.len()).sum();
        assert_eq!(cells, 35);
        assert_eq!(tiles.last().unwrap().lat, 6..7);
        assert_eq!(tiles.last().unwrap().lon, 4..5);
    }

    #[test]
    fn test_daily_grid_rejects_duplicate_dates() {
        let d = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let values = Array3::<f32>::zeros((2, 3, 2));
        assert!(DailyGrid::new("x", vec![d, d], axes(), values).is_err());
    }

    #[test]
    fn test_daily_grid_rejects_gaps() {
        let d0 = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2020, 1, 3).unwrap();
        let values = Array3::<f32>::zeros((2, 3, 2));
        let err = DailyGrid::new("x", vec![d0, d2], axes(), values).unwrap_err();
        assert!(matches!(err, ClimatologyError::TimeAxis(_)));
        assert!(validate_dates(&[d0, d2]).is_ok());
    }

    #[test]
    fn test_daily_grid_read_tile() {
        let d0 = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let d1 = NaiveDate::from_ymd_opt(2020, 1, 2).unwrap();
        let values = Array3::from_shape_fn((2, 3, 2), |(t, i, j)| (t * 100 + i * 10 + j) as f32);
        let grid = DailyGrid::new("x", vec![d0, d1], axes(), values).unwrap();
        let block = grid.read_tile(&Tile { lat: 1..3, lon: 1..2 }).unwrap();
        assert_eq!(block.dim(), (2, 2, 1));
        assert_eq!(block[[1, 1, 0]], 121.0);
    }
}
