//! # NetCDF Inspection
//!
//! Summarizes an exceedance file or a climatology artifact: dimensions,
//! coordinate ranges (time, month, quantile, windows, thresholds, lat, lon)
//! and the finite value range of each data variable.

use crate::artifact::LocalCopy;
use crate::dataset;
use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionSummary {
    pub name: String,
    pub length: usize,
}

/// A one-dimensional variable named after its dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinateSummary {
    pub name: String,
    pub length: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// First and last instants, for coordinates with CF time units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSummary {
    pub name: String,
    pub dimensions: Vec<String>,
    pub shape: Vec<usize>,
    /// Product the dimension layout corresponds to, when recognised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<String>,
    pub finite_min: Option<f64>,
    pub finite_max: Option<f64>,
    pub finite_count: usize,
    pub missing_count: usize,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub path: String,
    pub file_size: Option<u64>,
    pub dimensions: Vec<DimensionSummary>,
    pub coordinates: Vec<CoordinateSummary>,
    pub variables: Vec<VariableSummary>,
}

/// Names the product a dimension layout belongs to.
pub fn layout_of(dimensions: &[String]) -> Option<&'static str> {
    let dims: Vec<&str> = dimensions.iter().map(String::as_str).collect();
    match dims.as_slice() {
        ["month", "lat", "lon"] => Some("climatology"),
        ["month", "quantile", "lat", "lon"] => Some("extreme_climatology"),
        ["windows", "month", "lat", "lon"] => Some("weather_windows"),
        ["thresholds", "time", "lat", "lon"] => Some("exceedance"),
        ["time", "lat", "lon"] => Some("daily"),
        _ => None,
    }
}

fn finite_range(values: &[f32]) -> (Option<f64>, Option<f64>, usize) {
    let mut min: Option<f64> = None;
    let mut max: Option<f64> = None;
    let mut count = 0;
    for v in values.iter().filter(|v| v.is_finite()).map(|&v| f64::from(v)) {
        min = Some(min.map_or(v, |m| m.min(v)));
        max = Some(max.map_or(v, |m| m.max(v)));
        count += 1;
    }
    (min, max, count)
}

/// Summarizes a local NetCDF file. `display` is the path reported back.
pub fn summarize(path: &Path, display: &str, variable: Option<&str>) -> Result<DatasetSummary> {
    debug!("opening {}", path.display());
    let file = netcdf::open(path).with_context(|| format!("failed to open NetCDF file {}", display))?;

    let dimensions: Vec<DimensionSummary> = file
        .dimensions()
        .map(|d| DimensionSummary {
            name: d.name(),
            length: d.len(),
        })
        .collect();
    let dimension_names: Vec<String> = dimensions.iter().map(|d| d.name.clone()).collect();

    let mut coordinates = Vec::new();
    let mut variables = Vec::new();
    for var in file.variables() {
        let name = var.name();
        let dims: Vec<String> = var.dimensions().iter().map(|d| d.name()).collect();
        let shape: Vec<usize> = var.dimensions().iter().map(|d| d.len()).collect();

        if dims.len() == 1 && dims[0] == name && dimension_names.contains(&name) {
            let values = var.get_values::<f64, _>(..).unwrap_or_default();
            let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
            let time_range = dataset::units_of(&var)
                .filter(|u| u.contains(" since "))
                .and_then(|units| dataset::decode_times(&values, &units).ok())
                .and_then(|times| Some((times.first()?.to_string(), times.last()?.to_string())));
            coordinates.push(CoordinateSummary {
                length: values.len(),
                min: finite.iter().copied().reduce(f64::min),
                max: finite.iter().copied().reduce(f64::max),
                time_range,
                name,
            });
            continue;
        }

        if variable.is_some_and(|wanted| wanted != name) {
            continue;
        }
        let values = dataset::read_unpacked(&var).unwrap_or_default();
        let (finite_min, finite_max, finite_count) = finite_range(&values);
        let mut attributes = BTreeMap::new();
        for attr in var.attributes() {
            if let Ok(value) = attr.value() {
                attributes.insert(attr.name().to_string(), format!("{:?}", value));
            }
        }
        variables.push(VariableSummary {
            layout: layout_of(&dims).map(str::to_string),
            missing_count: values.len() - finite_count,
            name,
            dimensions: dims,
            shape,
            finite_min,
            finite_max,
            finite_count,
            attributes,
        });
    }

    if let Some(wanted) = variable
        && variables.is_empty()
    {
        anyhow::bail!("variable '{}' not found in {}", wanted, display);
    }

    Ok(DatasetSummary {
        path: display.to_string(),
        file_size: std::fs::metadata(path).ok().map(|m| m.len()),
        dimensions,
        coordinates,
        variables,
    })
}

/// Summarizes a local or S3 NetCDF file.
pub async fn inspect(location: &str, variable: Option<&str>) -> Result<DatasetSummary> {
    let copy = LocalCopy::fetch(location)
        .await
        .with_context(|| format!("failed to fetch {}", location))?;
    summarize(copy.path(), location, variable)
}

fn range_text(min: Option<f64>, max: Option<f64>) -> String {
    match (min, max) {
        (Some(min), Some(max)) => format!("{} .. {}", min, max),
        _ => "no finite values".to_string(),
    }
}

pub fn print_summary_human(summary: &DatasetSummary) {
    println!("NetCDF File Information:");
    println!("  Path: {}", summary.path);
    if let Some(size) = summary.file_size {
        println!("  File Size: {:.2} MB", size as f64 / 1_048_576.0);
    }
    println!("  Dimensions:");
    for dim in &summary.dimensions {
        println!("    {} ({})", dim.name, dim.length);
    }
    println!("  Coordinates:");
    for coord in &summary.coordinates {
        match &coord.time_range {
            Some((first, last)) => println!("    {} [{}]: {} .. {}", coord.name, coord.length, first, last),
            None => println!(
                "    {} [{}]: {}",
                coord.name,
                coord.length,
                range_text(coord.min, coord.max)
            ),
        }
    }
    println!("  Variables:");
    for var in &summary.variables {
        println!(
            "    {}({}){}",
            var.name,
            var.dimensions.join(", "),
            var.layout
                .as_deref()
                .map(|l| format!(" - {}", l))
                .unwrap_or_default()
        );
        println!(
            "      values: {} ({} finite, {} missing)",
            range_text(var.finite_min, var.finite_max),
            var.finite_count,
            var.missing_count
        );
        for (name, value) in &var.attributes {
            println!("      @{}: {}", name, value);
        }
    }
}

pub fn print_summary_json(summary: &DatasetSummary) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}

pub fn print_summary_yaml(summary: &DatasetSummary) -> Result<()> {
    let yaml = serde_yaml::to_string(summary).context("failed to serialize summary to YAML")?;
    println!("{}", yaml);
    Ok(())
}
