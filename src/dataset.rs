//! # NetCDF Datasets
//!
//! Reading and writing of the NetCDF files the pipeline exchanges:
//!
//! - raw `(time, lat, lon)` fields consumed by the exceedance builder
//! - monthly exceedance files, exposed lazily as [`ExceedanceSeries`]
//! - the persisted climatology artifacts
//!
//! Missing values (`_FillValue`, `missing_value`) become NaN on read and
//! packed variables (`scale_factor`, `add_offset`) are unpacked. Time
//! coordinates are decoded from CF `"<unit> since <reference>"` units.

use crate::combine::SeriesId;
use crate::error::{ClimatologyError, Result};
use crate::grid::{
    DailyGrid, ExtremeClimatology, GridAxes, MonthlyClimatology, Tile, TileSource, WeatherWindows,
    validate_dates,
};
use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use log::debug;
use ndarray::{Array3, Array4, ArrayView4, s};
use netcdf::AttributeValue;
use std::path::{Path, PathBuf};

/// Units written on every time coordinate this crate produces.
pub const TIME_UNITS: &str = "days since 1970-01-01 00:00:00";

const THRESHOLD_TOLERANCE: f64 = 1e-6;

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

/// Parses CF time units into (seconds per unit, reference instant).
pub fn parse_time_units(units: &str) -> Result<(f64, NaiveDateTime)> {
    let bad = || ClimatologyError::TimeAxis(format!("unsupported time units '{}'", units));
    let (unit, reference) = units.split_once(" since ").ok_or_else(bad)?;
    let seconds = match unit.trim().to_ascii_lowercase().as_str() {
        "days" | "day" | "d" => 86_400.0,
        "hours" | "hour" | "hrs" | "hr" | "h" => 3_600.0,
        "minutes" | "minute" | "mins" | "min" => 60.0,
        "seconds" | "second" | "secs" | "sec" | "s" => 1.0,
        _ => return Err(bad()),
    };
    let reference = parse_reference(reference).ok_or_else(bad)?;
    Ok((seconds, reference))
}

fn parse_reference(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim().trim_end_matches("UTC").trim_end_matches('Z').trim();
    for format in [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Decodes numeric time values given their CF units.
pub fn decode_times(values: &[f64], units: &str) -> Result<Vec<NaiveDateTime>> {
    let (seconds, reference) = parse_time_units(units)?;
    values
        .iter()
        .map(|&v| {
            let millis = (v * seconds * 1000.0).round();
            TimeDelta::try_milliseconds(millis as i64)
                .and_then(|delta| reference.checked_add_signed(delta))
                .ok_or_else(|| {
                    ClimatologyError::TimeAxis(format!("time value {} {} is out of range", v, units))
                })
        })
        .collect()
}

fn encode_dates(dates: &[NaiveDate]) -> Vec<f64> {
    let epoch = epoch();
    dates.iter().map(|d| (*d - epoch).num_days() as f64).collect()
}

fn attribute_number(var: &netcdf::Variable, name: &str) -> Option<f64> {
    let value = var.attribute(name)?.value().ok()?;
    match value {
        AttributeValue::Double(v) => Some(v),
        AttributeValue::Float(v) => Some(f64::from(v)),
        AttributeValue::Int(v) => Some(f64::from(v)),
        AttributeValue::Short(v) => Some(f64::from(v)),
        AttributeValue::Schar(v) => Some(f64::from(v)),
        AttributeValue::Uchar(v) => Some(f64::from(v)),
        AttributeValue::Doubles(v) => v.first().copied(),
        AttributeValue::Floats(v) => v.first().map(|&x| f64::from(x)),
        AttributeValue::Ints(v) => v.first().map(|&x| f64::from(x)),
        AttributeValue::Shorts(v) => v.first().map(|&x| f64::from(x)),
        _ => None,
    }
}

fn attribute_text(var: &netcdf::Variable, name: &str) -> Option<String> {
    match var.attribute(name)?.value().ok()? {
        AttributeValue::Str(s) => Some(s),
        _ => None,
    }
}

/// Missing-value markers and packing of one variable.
#[derive(Debug, Clone, PartialEq)]
struct Packing {
    missing: Vec<f32>,
    scale: f32,
    offset: f32,
}

impl Packing {
    fn of(var: &netcdf::Variable) -> Self {
        let missing = ["_FillValue", "missing_value"]
            .iter()
            .filter_map(|name| attribute_number(var, name))
            .map(|v| v as f32)
            .filter(|v| !v.is_nan())
            .collect();
        Packing {
            missing,
            scale: attribute_number(var, "scale_factor").unwrap_or(1.0) as f32,
            offset: attribute_number(var, "add_offset").unwrap_or(0.0) as f32,
        }
    }

    fn apply(&self, values: &mut [f32]) {
        let packed = self.scale != 1.0 || self.offset != 0.0;
        for v in values.iter_mut() {
            if self.missing.contains(v) {
                *v = f32::NAN;
            } else if packed {
                *v = *v * self.scale + self.offset;
            }
        }
    }
}

/// Reads a whole variable as `f32`, missing values as NaN, unpacked.
pub fn read_unpacked(var: &netcdf::Variable) -> Result<Vec<f32>> {
    let mut values = var.get_values::<f32, _>(..)?;
    Packing::of(var).apply(&mut values);
    Ok(values)
}

/// Text `units` attribute of a variable.
pub fn units_of(var: &netcdf::Variable) -> Option<String> {
    attribute_text(var, "units")
}

fn variable<'f>(file: &'f netcdf::File, name: &str, path: &Path) -> Result<netcdf::Variable<'f>> {
    file.variable(name).ok_or_else(|| {
        ClimatologyError::layout(format!("variable '{}' not found in {}", name, path.display()))
    })
}

fn dimension_names(var: &netcdf::Variable) -> Vec<String> {
    var.dimensions().iter().map(|d| d.name()).collect()
}

fn read_coordinate(file: &netcdf::File, name: &str, path: &Path) -> Result<Vec<f64>> {
    Ok(variable(file, name, path)?.get_values::<f64, _>(..)?)
}

fn read_axes(file: &netcdf::File, lat: &str, lon: &str, path: &Path) -> Result<GridAxes> {
    GridAxes::new(
        read_coordinate(file, lat, path)?,
        read_coordinate(file, lon, path)?,
    )
}

fn read_times(file: &netcdf::File, name: &str, path: &Path) -> Result<Vec<NaiveDateTime>> {
    let var = variable(file, name, path)?;
    let units = attribute_text(&var, "units").ok_or_else(|| {
        ClimatologyError::TimeAxis(format!(
            "time coordinate '{}' of {} has no units",
            name,
            path.display()
        ))
    })?;
    decode_times(&var.get_values::<f64, _>(..)?, &units)
}

/// One raw file of sub-daily samples.
#[derive(Debug, Clone)]
pub struct RawSamples {
    pub times: Vec<NaiveDateTime>,
    pub axes: GridAxes,
    /// Values indexed by (time, lat, lon).
    pub values: Array3<f32>,
}

/// Reads a raw `(time, lat, lon)` field. Coordinates are looked up by the
/// names of the variable's dimensions.
pub fn read_raw_samples(path: &Path, variable_name: &str) -> Result<RawSamples> {
    debug!("reading raw samples of '{}' from {}", variable_name, path.display());
    let file = netcdf::open(path)?;
    let var = variable(&file, variable_name, path)?;
    let dims = dimension_names(&var);
    let [time, lat, lon] = dims.as_slice() else {
        return Err(ClimatologyError::layout(format!(
            "'{}' in {} has dimensions {:?}, expected (time, lat, lon)",
            variable_name,
            path.display(),
            dims
        )));
    };

    let times = read_times(&file, time, path)?;
    let axes = read_axes(&file, lat, lon, path)?;
    let mut values = var.get_values::<f32, _>(..)?;
    Packing::of(&var).apply(&mut values);
    let (n_lat, n_lon) = axes.shape();
    let values = Array3::from_shape_vec((times.len(), n_lat, n_lon), values)?;
    Ok(RawSamples {
        times,
        axes,
        values,
    })
}

/// Where one exceedance file's slab sits in the concatenated series.
#[derive(Debug, Clone)]
struct FileSlab {
    path: PathBuf,
    time_offset: usize,
    n_time: usize,
    /// Index along `thresholds`, or `None` for a squeezed file.
    threshold: Option<usize>,
    packing: Packing,
}

/// One `<variable>_exceed<limit>` series spread over monthly files, read
/// lazily tile by tile.
#[derive(Debug, Clone)]
pub struct ExceedanceSeries {
    name: String,
    variable: String,
    dates: Vec<NaiveDate>,
    axes: GridAxes,
    files: Vec<FileSlab>,
}

impl ExceedanceSeries {
    /// Indexes the files of one series. Only coordinates are read here.
    ///
    /// Files hold `{variable}(thresholds, time, lat, lon)` or the squeezed
    /// `{variable}(time, lat, lon)`; every file must share one grid and the
    /// concatenated dates must be strictly increasing.
    pub fn open(id: &SeriesId, paths: &[PathBuf]) -> Result<Self> {
        let name = id.to_string();
        let threshold = id.threshold()?;
        let mut dates = Vec::new();
        let mut axes: Option<GridAxes> = None;
        let mut files = Vec::with_capacity(paths.len());

        for path in paths {
            let file = netcdf::open(path)?;
            let var = variable(&file, &id.variable, path)?;
            let dims = dimension_names(&var);
            let (index, time, lat, lon) = match dims.as_slice() {
                [thresholds, time, lat, lon] => {
                    let values = read_coordinate(&file, thresholds, path)?;
                    let index = values
                        .iter()
                        .position(|v| (v - threshold).abs() <= THRESHOLD_TOLERANCE * threshold.abs().max(1.0))
                        .ok_or_else(|| {
                            ClimatologyError::layout(format!(
                                "threshold {} of '{}' not found in {} (has {:?})",
                                threshold,
                                name,
                                path.display(),
                                values
                            ))
                        })?;
                    (Some(index), time, lat, lon)
                }
                [time, lat, lon] => {
                    if let Some(scalar) = file.variable("thresholds") {
                        let values = scalar.get_values::<f64, _>(..)?;
                        if let Some(v) = values.first() {
                            if (v - threshold).abs() > THRESHOLD_TOLERANCE * threshold.abs().max(1.0) {
                                return Err(ClimatologyError::layout(format!(
                                    "{} holds threshold {}, not {}",
                                    path.display(),
                                    v,
                                    threshold
                                )));
                            }
                        }
                    }
                    (None, time, lat, lon)
                }
                _ => {
                    return Err(ClimatologyError::layout(format!(
                        "'{}' in {} has dimensions {:?}",
                        id.variable,
                        path.display(),
                        dims
                    )));
                }
            };

            let file_axes = read_axes(&file, lat, lon, path)?;
            match &axes {
                Some(first) => first.ensure_matches(
                    &file_axes,
                    &paths[0].display().to_string(),
                    &path.display().to_string(),
                )?,
                None => axes = Some(file_axes),
            }

            let file_dates: Vec<NaiveDate> = read_times(&file, time, path)?
                .iter()
                .map(NaiveDateTime::date)
                .collect();
            debug!(
                "{}: {} days of '{}' from {}",
                name,
                file_dates.len(),
                id.variable,
                path.display()
            );
            files.push(FileSlab {
                path: path.clone(),
                time_offset: dates.len(),
                n_time: file_dates.len(),
                threshold: index,
                packing: Packing::of(&var),
            });
            dates.extend(file_dates);
        }

        let axes = axes.ok_or_else(|| {
            ClimatologyError::config(format!("no files given for series '{}'", name))
        })?;
        validate_dates(&dates)?;
        Ok(ExceedanceSeries {
            name,
            variable: id.variable.clone(),
            dates,
            axes,
            files,
        })
    }
}

impl TileSource for ExceedanceSeries {
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
        let (n_lat, n_lon) = tile.shape();
        let mut block = Array3::<f32>::from_elem((self.dates.len(), n_lat, n_lon), f32::NAN);
        for slab in &self.files {
            let file = netcdf::open(&slab.path)?;
            let var = variable(&file, &self.variable, &slab.path)?;
            let mut values = match slab.threshold {
                Some(k) => var.get_values::<f32, _>((
                    k,
                    0..slab.n_time,
                    tile.lat.clone(),
                    tile.lon.clone(),
                ))?,
                None => {
                    var.get_values::<f32, _>((0..slab.n_time, tile.lat.clone(), tile.lon.clone()))?
                }
            };
            slab.packing.apply(&mut values);
            let values = Array3::from_shape_vec((slab.n_time, n_lat, n_lon), values)?;
            block
                .slice_mut(s![slab.time_offset..slab.time_offset + slab.n_time, .., ..])
                .assign(&values);
        }
        Ok(block)
    }
}

fn create_with_grid(path: &Path, axes: &GridAxes) -> Result<netcdf::FileMut> {
    let mut file = netcdf::create(path)?;
    file.add_dimension("lat", axes.lat.len())?;
    file.add_dimension("lon", axes.lon.len())?;
    {
        let mut lat = file.add_variable::<f64>("lat", &["lat"])?;
        lat.put_attribute("units", "degrees_north")?;
        lat.put_attribute("standard_name", "latitude")?;
        lat.put_values(axes.lat.as_slice(), ..)?;
    }
    {
        let mut lon = file.add_variable::<f64>("lon", &["lon"])?;
        lon.put_attribute("units", "degrees_east")?;
        lon.put_attribute("standard_name", "longitude")?;
        lon.put_values(axes.lon.as_slice(), ..)?;
    }
    file.add_attribute("source", "offshore-climatology")?;
    Ok(file)
}

fn put_months(file: &mut netcdf::FileMut, months: &[u32]) -> Result<()> {
    file.add_dimension("month", months.len())?;
    let mut var = file.add_variable::<i32>("month", &["month"])?;
    let values: Vec<i32> = months.iter().map(|&m| m as i32).collect();
    var.put_values(values.as_slice(), ..)?;
    Ok(())
}

fn put_data<D: ndarray::Dimension>(
    file: &mut netcdf::FileMut,
    name: &str,
    dims: &[&str],
    values: &ndarray::Array<f32, D>,
) -> Result<()> {
    let mut var = file.add_variable::<f32>(name, dims)?;
    var.set_fill_value(f32::NAN)?;
    let data: Vec<f32> = values.iter().copied().collect();
    var.put_values(data.as_slice(), ..)?;
    Ok(())
}

/// Writes one month of exceedance as `{variable}(thresholds, time, lat, lon)`.
pub fn write_exceedance(
    path: &Path,
    variable_name: &str,
    thresholds: &[f64],
    dates: &[NaiveDate],
    axes: &GridAxes,
    values: ArrayView4<'_, f32>,
) -> Result<()> {
    let mut file = create_with_grid(path, axes)?;
    file.add_dimension("thresholds", thresholds.len())?;
    file.add_dimension("time", dates.len())?;
    {
        let mut var = file.add_variable::<f64>("thresholds", &["thresholds"])?;
        var.put_values(thresholds, ..)?;
    }
    {
        let mut var = file.add_variable::<f64>("time", &["time"])?;
        var.put_attribute("units", TIME_UNITS)?;
        var.put_attribute("calendar", "proleptic_gregorian")?;
        var.put_values(encode_dates(dates).as_slice(), ..)?;
    }
    put_data(
        &mut file,
        variable_name,
        &["thresholds", "time", "lat", "lon"],
        &values.to_owned(),
    )
}

/// Writes a daily grid as `{name}(time, lat, lon)`.
pub fn write_daily(path: &Path, grid: &DailyGrid) -> Result<()> {
    let mut file = create_with_grid(path, &grid.axes)?;
    file.add_dimension("time", grid.dates.len())?;
    {
        let mut var = file.add_variable::<f64>("time", &["time"])?;
        var.put_attribute("units", TIME_UNITS)?;
        var.put_values(encode_dates(&grid.dates).as_slice(), ..)?;
    }
    put_data(&mut file, &grid.name, &["time", "lat", "lon"], &grid.values)
}

/// Writes `{name}(month, lat, lon)`.
pub fn write_monthly(path: &Path, name: &str, clim: &MonthlyClimatology) -> Result<()> {
    let mut file = create_with_grid(path, &clim.axes)?;
    put_months(&mut file, &clim.months)?;
    put_data(&mut file, name, &["month", "lat", "lon"], &clim.values)
}

/// Writes `{name}(month, quantile, lat, lon)`.
pub fn write_extreme(path: &Path, name: &str, clim: &ExtremeClimatology) -> Result<()> {
    let mut file = create_with_grid(path, &clim.axes)?;
    put_months(&mut file, &clim.months)?;
    file.add_dimension("quantile", clim.quantiles.len())?;
    {
        let mut var = file.add_variable::<f64>("quantile", &["quantile"])?;
        var.put_values(clim.quantiles.as_slice(), ..)?;
    }
    put_data(
        &mut file,
        name,
        &["month", "quantile", "lat", "lon"],
        &clim.values,
    )
}

/// Writes `{name}(windows, month, lat, lon)`.
pub fn write_windows(path: &Path, name: &str, clim: &WeatherWindows) -> Result<()> {
    let mut file = create_with_grid(path, &clim.axes)?;
    file.add_dimension("windows", clim.windows.len())?;
    {
        let mut var = file.add_variable::<i32>("windows", &["windows"])?;
        let windows: Vec<i32> = clim.windows.iter().map(|&w| w as i32).collect();
        var.put_values(windows.as_slice(), ..)?;
    }
    put_months(&mut file, &clim.months)?;
    put_data(
        &mut file,
        name,
        &["windows", "month", "lat", "lon"],
        &clim.values,
    )
}

/// Opens `name` and checks its dimensions, returning the data and axes.
fn read_product(
    path: &Path,
    name: &str,
    expected: &[&str],
) -> Result<(netcdf::File, Vec<f32>, GridAxes)> {
    let file = netcdf::open(path)?;
    let (values, axes) = {
        let var = variable(&file, name, path)?;
        let dims = dimension_names(&var);
        if dims != expected {
            return Err(ClimatologyError::layout(format!(
                "'{}' in {} has dimensions {:?}, expected {:?}",
                name,
                path.display(),
                dims,
                expected
            )));
        }
        let mut values = var.get_values::<f32, _>(..)?;
        Packing::of(&var).apply(&mut values);
        (values, read_axes(&file, "lat", "lon", path)?)
    };
    Ok((file, values, axes))
}

fn read_months(file: &netcdf::File, path: &Path) -> Result<Vec<u32>> {
    Ok(read_coordinate(file, "month", path)?
        .into_iter()
        .map(|m| m.round() as u32)
        .collect())
}

/// Reads `{name}(month, lat, lon)`.
pub fn read_monthly(path: &Path, name: &str) -> Result<MonthlyClimatology> {
    let (file, values, axes) = read_product(path, name, &["month", "lat", "lon"])?;
    let months = read_months(&file, path)?;
    let (n_lat, n_lon) = axes.shape();
    let values = Array3::from_shape_vec((months.len(), n_lat, n_lon), values)?;
    Ok(MonthlyClimatology {
        months,
        axes,
        values,
    })
}

/// Reads `{name}(month, quantile, lat, lon)`.
pub fn read_extreme(path: &Path, name: &str) -> Result<ExtremeClimatology> {
    let (file, values, axes) = read_product(path, name, &["month", "quantile", "lat", "lon"])?;
    let months = read_months(&file, path)?;
    let quantiles = read_coordinate(&file, "quantile", path)?;
    let (n_lat, n_lon) = axes.shape();
    let values = Array4::from_shape_vec((months.len(), quantiles.len(), n_lat, n_lon), values)?;
    Ok(ExtremeClimatology {
        months,
        quantiles,
        axes,
        values,
    })
}

/// Reads `{name}(windows, month, lat, lon)`.
pub fn read_windows(path: &Path, name: &str) -> Result<WeatherWindows> {
    let (file, values, axes) = read_product(path, name, &["windows", "month", "lat", "lon"])?;
    let months = read_months(&file, path)?;
    let windows: Vec<usize> = read_coordinate(&file, "windows", path)?
        .into_iter()
        .map(|w| w.round() as usize)
        .collect();
    let (n_lat, n_lon) = axes.shape();
    let values = Array4::from_shape_vec((windows.len(), months.len(), n_lat, n_lon), values)?;
    Ok(WeatherWindows {
        windows,
        months,
        axes,
        values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_parse_time_units() {
        let (s, r) = parse_time_units("hours since 1900-01-01 00:00:0.0").unwrap();
        assert_eq!(s, 3600.0);
        assert_eq!(r.date(), NaiveDate::from_ymd_opt(1900, 1, 1).unwrap());

        let (s, r) = parse_time_units("days since 1970-01-01").unwrap();
        assert_eq!(s, 86_400.0);
        assert_eq!(r.hour(), 0);

        assert!(parse_time_units("days after 1970-01-01").is_err());
        assert!(parse_time_units("fortnights since 1970-01-01").is_err());
    }

    #[test]
    fn test_decode_times() {
        let times = decode_times(&[0.0, 36.0], "hours since 2021-01-01T00:00:00Z").unwrap();
        assert_eq!(times[1].date(), NaiveDate::from_ymd_opt(2021, 1, 2).unwrap());
        assert_eq!(times[1].hour(), 12);
    }

    #[test]
    fn test_encode_dates_round_trip_through_units() {
        let dates = vec![
            NaiveDate::from_ymd_opt(1969, 12, 31).unwrap(),
            NaiveDate::from_ymd_opt(2021, 3, 1).unwrap(),
        ];
        let decoded = decode_times(&encode_dates(&dates), TIME_UNITS).unwrap();
        let decoded: Vec<NaiveDate> = decoded.iter().map(NaiveDateTime::date).collect();
        assert_eq!(decoded, dates);
    }

    #[test]
    fn test_packing_masks_and_unpacks() {
        let packing = Packing {
            missing: vec![-32767.0],
            scale: 0.5,
            offset: 1.0,
        };
        let mut values = vec![2.0, -32767.0, 0.0];
        packing.apply(&mut values);
        assert_eq!(values[0], 2.0);
        assert!(values[1].is_nan());
        assert_eq!(values[2], 1.0);
    }
}
