//! # Area Reduction
//!
//! Reduces a gridded field to one number over a lon/lat box: mean over
//! longitude, then a cos(latitude) weighted mean over latitude, so each row
//! counts in proportion to the area it represents.

use crate::error::{ClimatologyError, Result};
use crate::grid::GridAxes;
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

/// A lon/lat box. Bounds are inclusive and may be given in either order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaBox {
    /// Long display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lon_slice: [f64; 2],
    pub lat_slice: [f64; 2],
}

impl AreaBox {
    pub fn new(lon_slice: [f64; 2], lat_slice: [f64; 2]) -> Self {
        AreaBox {
            name: None,
            lon_slice,
            lat_slice,
        }
    }

    fn lon_bounds(&self) -> (f64, f64) {
        ordered(self.lon_slice)
    }

    fn lat_bounds(&self) -> (f64, f64) {
        ordered(self.lat_slice)
    }

    pub fn validate(&self, area: &str) -> Result<()> {
        if self
            .lon_slice
            .iter()
            .chain(self.lat_slice.iter())
            .any(|v| !v.is_finite())
        {
            return Err(ClimatologyError::config(format!(
                "area '{}' has a non-finite bound",
                area
            )));
        }
        let (lat_min, lat_max) = self.lat_bounds();
        if lat_min < -90.0 || lat_max > 90.0 {
            return Err(ClimatologyError::config(format!(
                "area '{}' has latitudes outside [-90, 90]",
                area
            )));
        }
        Ok(())
    }
}

fn ordered([a, b]: [f64; 2]) -> (f64, f64) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Grid indices inside a box and their latitude weights.
#[derive(Debug, Clone, PartialEq)]
pub struct AreaSelection {
    pub lat: Vec<usize>,
    pub lon: Vec<usize>,
    /// cos(latitude) of each selected row.
    pub weights: Vec<f64>,
}

/// Selects the grid points whose coordinates lie inside the box.
pub fn select(axes: &GridAxes, area: &str, bbox: &AreaBox) -> Result<AreaSelection> {
    let (lon_min, lon_max) = bbox.lon_bounds();
    let (lat_min, lat_max) = bbox.lat_bounds();
    let inside = |axis: &[f64], lo: f64, hi: f64| -> Vec<usize> {
        axis.iter()
            .enumerate()
            .filter(|(_, v)| **v >= lo && **v <= hi)
            .map(|(i, _)| i)
            .collect()
    };

    let lat = inside(&axes.lat, lat_min, lat_max);
    let lon = inside(&axes.lon, lon_min, lon_max);
    if lat.is_empty() || lon.is_empty() {
        return Err(ClimatologyError::DegenerateArea {
            area: area.to_string(),
            lon_min,
            lon_max,
            lat_min,
            lat_max,
        });
    }
    let weights = lat.iter().map(|&i| axes.lat[i].to_radians().cos()).collect();
    Ok(AreaSelection { lat, lon, weights })
}

/// cos(latitude) weighted mean of one `(lat, lon)` field over a selection.
///
/// Missing values are skipped: a row's longitude mean ignores NaN cells and
/// a row with no valid cell drops out of the latitude average together with
/// its weight. The result is NaN only when every selected cell is missing.
///
/// Dividing by the weight of every selected row instead would count an
/// all-land row as zero and pull coastal boxes towards zero; rows are
/// weighted over valid rows only.
pub fn reduce(field: ArrayView2<'_, f32>, selection: &AreaSelection) -> f64 {
    let mut weighted = 0.0;
    let mut total = 0.0;
    for (&i, &w) in selection.lat.iter().zip(&selection.weights) {
        let (sum, count) = selection
            .lon
            .iter()
            .map(|&j| f64::from(field[[i, j]]))
            .filter(|v| !v.is_nan())
            .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
        if count > 0 {
            weighted += w * sum / count as f64;
            total += w;
        }
    }
    if total > 0.0 { weighted / total } else { f64::NAN }
}

/// Convenience wrapper: select then reduce.
pub fn area_mean(
    field: ArrayView2<'_, f32>,
    axes: &GridAxes,
    area: &str,
    bbox: &AreaBox,
) -> Result<f64> {
    let selection = select(axes, area, bbox)?;
    Ok(reduce(field, &selection))
}
