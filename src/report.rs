//! # Report Tables
//!
//! Area-reduced monthly statistics, the numbers behind location time-series
//! plots, written as Parquet tables:
//!
//! - `{plot_path}{combination}_area_climatology.parquet`: one row per
//!   (area, month) with the mean, every interannual quantile and every
//!   weather-window length
//! - `{plot_path}verification_area_climatology.parquet`: model and reference
//!   mean, median and interannual quantile band per (verification entry,
//!   area, month)

use crate::area::{self, AreaBox};
use crate::artifact::{ClimatologySet, LocalCopy, publish_with};
use crate::dataset;
use crate::error::{ClimatologyError, Result};
use crate::grid::{ExtremeClimatology, GridAxes, MonthlyClimatology};
use crate::input::VerificationEntry;
use log::{debug, info};
use polars::prelude::*;
use std::collections::BTreeMap;
use std::fs::File;

/// Variable names expected in a reference climatology file.
pub const REFERENCE_MONTHLY: &str = "climatology";
pub const REFERENCE_EXTREME: &str = "extreme_climatology";

const MEDIAN: f64 = 0.5;

pub fn area_report_path(plot_path: &str, combination: &str) -> String {
    format!("{}{}_area_climatology.parquet", plot_path, combination)
}

pub fn verification_report_path(plot_path: &str) -> String {
    format!("{}verification_area_climatology.parquet", plot_path)
}

/// Column holding one interannual quantile, e.g. `q0.05`.
pub fn quantile_column(q: f64) -> String {
    format!("q{}", q)
}

/// Column holding one weather-window length, e.g. `window_3d`.
pub fn window_column(w: usize) -> String {
    format!("window_{}d", w)
}

fn monthly_of<'a>(set: &'a ClimatologySet, what: &str) -> Result<&'a MonthlyClimatology> {
    set.monthly.as_ref().ok_or_else(|| {
        ClimatologyError::layout(format!("monthly climatology of '{}' is not available", what))
    })
}

fn reduce_or_nan(
    field: Option<ndarray::ArrayView2<'_, f32>>,
    selection: &area::AreaSelection,
) -> f64 {
    field.map_or(f64::NAN, |f| area::reduce(f, selection))
}

/// Area time series of one combination.
pub fn area_climatology_table(
    combination: &str,
    set: &ClimatologySet,
    areas: &BTreeMap<String, AreaBox>,
) -> Result<DataFrame> {
    let monthly = monthly_of(set, combination)?;

    let mut area_col = Vec::new();
    let mut label_col = Vec::new();
    let mut month_col = Vec::new();
    let mut mean_col = Vec::new();
    let quantiles = set
        .extreme
        .as_ref()
        .map(|e| e.quantiles.clone())
        .unwrap_or_default();
    let windows = set
        .windows
        .as_ref()
        .map(|w| w.windows.clone())
        .unwrap_or_default();
    let mut quantile_cols = vec![Vec::new(); quantiles.len()];
    let mut window_cols = vec![Vec::new(); windows.len()];

    for (key, bbox) in areas {
        let selection = area::select(&monthly.axes, key, bbox)?;
        let extreme_sel = match &set.extreme {
            Some(e) => Some(select_on(&e.axes, &monthly.axes, key, bbox, &selection)?),
            None => None,
        };
        let window_sel = match &set.windows {
            Some(w) => Some(select_on(&w.axes, &monthly.axes, key, bbox, &selection)?),
            None => None,
        };

        for &month in &monthly.months {
            area_col.push(key.clone());
            label_col.push(bbox.name.clone().unwrap_or_else(|| key.clone()));
            month_col.push(month);
            mean_col.push(reduce_or_nan(monthly.field(month), &selection));

            if let (Some(extreme), Some(sel)) = (&set.extreme, &extreme_sel) {
                for (k, &q) in quantiles.iter().enumerate() {
                    quantile_cols[k].push(reduce_or_nan(extreme.field(month, q), sel));
                }
            }
            if let (Some(ww), Some(sel)) = (&set.windows, &window_sel) {
                for (k, &w) in windows.iter().enumerate() {
                    window_cols[k].push(reduce_or_nan(ww.field(w, month), sel));
                }
            }
        }
    }

    let mut columns: Vec<Column> = vec![
        Series::new("combination".into(), vec![combination; area_col.len()]).into(),
        Series::new("area".into(), area_col).into(),
        Series::new("area_name".into(), label_col).into(),
        Series::new("month".into(), month_col).into(),
        Series::new("mean".into(), mean_col).into(),
    ];
    for (q, values) in quantiles.iter().zip(quantile_cols) {
        columns.push(Series::new(quantile_column(*q).as_str().into(), values).into());
    }
    for (w, values) in windows.iter().zip(window_cols) {
        columns.push(Series::new(window_column(*w).as_str().into(), values).into());
    }
    Ok(DataFrame::new(columns)?)
}

/// Reuses `selection` when `axes` is the grid it was made on.
fn select_on(
    axes: &GridAxes,
    reference: &GridAxes,
    key: &str,
    bbox: &AreaBox,
    selection: &area::AreaSelection,
) -> Result<area::AreaSelection> {
    if axes == reference {
        Ok(selection.clone())
    } else {
        area::select(axes, key, bbox)
    }
}

/// One verification entry with its model and reference statistics.
pub struct VerificationInput<'a> {
    pub entry: &'a VerificationEntry,
    pub model: &'a ClimatologySet,
    pub reference: &'a ClimatologySet,
}

/// Loads a reference climatology (`climatology` and `extreme_climatology`
/// variables) from a local or S3 file.
pub async fn load_reference(location: &str) -> Result<ClimatologySet> {
    let copy = LocalCopy::fetch(location).await?;
    debug!("loading reference climatology {}", location);
    Ok(ClimatologySet {
        monthly: Some(dataset::read_monthly(copy.path(), REFERENCE_MONTHLY)?),
        extreme: Some(dataset::read_extreme(copy.path(), REFERENCE_EXTREME)?),
        windows: None,
    })
}

fn median_field(
    extreme: Option<&ExtremeClimatology>,
    month: u32,
) -> Option<ndarray::ArrayView2<'_, f32>> {
    extreme.and_then(|e| e.field(month, MEDIAN))
}

/// Every quantile held by either side of any entry, ascending.
fn verification_quantiles(inputs: &[VerificationInput<'_>]) -> Vec<f64> {
    let mut quantiles: Vec<f64> = inputs
        .iter()
        .flat_map(|input| [input.model, input.reference])
        .filter_map(|set| set.extreme.as_ref())
        .flat_map(|e| e.quantiles.iter().copied())
        .collect();
    quantiles.sort_by(f64::total_cmp);
    quantiles.dedup();
    quantiles
}

/// Model against reference per month and area: mean, median and one `q{q}`
/// column per interannual quantile. A quantile one side lacks is NaN there.
pub fn verification_table(
    inputs: &[VerificationInput<'_>],
    areas: &BTreeMap<String, AreaBox>,
) -> Result<DataFrame> {
    let mut source_col = Vec::new();
    let mut dataset_col = Vec::new();
    let mut combination_col = Vec::new();
    let mut area_col = Vec::new();
    let mut month_col = Vec::new();
    let mut mean_col = Vec::new();
    let mut median_col = Vec::new();
    let quantiles = verification_quantiles(inputs);
    let mut quantile_cols = vec![Vec::new(); quantiles.len()];

    for input in inputs {
        let sides = [
            ("model", input.model, &input.entry.combination),
            ("reference", input.reference, &input.entry.name),
        ];
        for (source, set, label) in sides {
            let monthly = monthly_of(set, label)?;
            for (key, bbox) in areas {
                let selection = area::select(&monthly.axes, key, bbox)?;
                let median_sel = match &set.extreme {
                    Some(e) => Some(select_on(&e.axes, &monthly.axes, key, bbox, &selection)?),
                    None => None,
                };
                for &month in &monthly.months {
                    source_col.push(source);
                    dataset_col.push(label.clone());
                    combination_col.push(input.entry.combination.clone());
                    area_col.push(key.clone());
                    month_col.push(month);
                    mean_col.push(reduce_or_nan(monthly.field(month), &selection));
                    median_col.push(match &median_sel {
                        Some(sel) => reduce_or_nan(median_field(set.extreme.as_ref(), month), sel),
                        None => f64::NAN,
                    });
                    for (k, &q) in quantiles.iter().enumerate() {
                        quantile_cols[k].push(match (&set.extreme, &median_sel) {
                            (Some(e), Some(sel)) => reduce_or_nan(e.field(month, q), sel),
                            _ => f64::NAN,
                        });
                    }
                }
            }
        }
    }

    let mut columns: Vec<Column> = vec![
        Series::new("source".into(), source_col).into(),
        Series::new("dataset".into(), dataset_col).into(),
        Series::new("combination".into(), combination_col).into(),
        Series::new("area".into(), area_col).into(),
        Series::new("month".into(), month_col).into(),
        Series::new("mean".into(), mean_col).into(),
        Series::new("median".into(), median_col).into(),
    ];
    for (q, values) in quantiles.iter().zip(quantile_cols) {
        columns.push(Series::new(quantile_column(*q).as_str().into(), values).into());
    }
    Ok(DataFrame::new(columns)?)
}

/// Writes a table as Parquet to a local or S3 destination.
pub async fn write_report(mut df: DataFrame, destination: &str) -> Result<()> {
    debug!("report shape: {:?}", df.shape());
    debug!("report schema:\n{:?}", df.schema());
    publish_with(destination, |path| {
        let file = File::create(path)?;
        ParquetWriter::new(file).finish(&mut df)?;
        Ok(())
    })
    .await?;
    info!("wrote {}", destination);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::WeatherWindows;
    use ndarray::{Array3, Array4};

    fn axes() -> GridAxes {
        GridAxes::new(vec![0.0, 60.0], vec![10.0, 11.0]).unwrap()
    }

    fn set(mean: f32) -> ClimatologySet {
        ClimatologySet {
            monthly: Some(MonthlyClimatology {
                months: vec![1, 2],
                axes: axes(),
                values: Array3::from_elem((2, 2, 2), mean),
            }),
            extreme: Some(ExtremeClimatology {
                months: vec![1, 2],
                quantiles: vec![0.05, 0.5, 0.95],
                axes: axes(),
                values: Array4::from_shape_fn((2, 3, 2, 2), |(_, q, _, _)| q as f32 / 4.0),
            }),
            windows: Some(WeatherWindows {
                windows: vec![3, 5],
                months: vec![1, 2],
                axes: axes(),
                values: Array4::from_elem((2, 2, 2, 2), 0.25),
            }),
        }
    }

    fn areas() -> BTreeMap<String, AreaBox> {
        let mut areas = BTreeMap::new();
        areas.insert("box".to_string(), AreaBox::new([10.0, 11.0], [0.0, 60.0]));
        let mut point = AreaBox::new([10.0, 10.0], [60.0, 60.0]);
        point.name = Some("Point A".to_string());
        areas.insert("point".to_string(), point);
        areas
    }

    #[test]
    fn test_area_table_columns_and_rows() {
        let df = area_climatology_table("storm", &set(0.5), &areas()).unwrap();
        assert_eq!(df.height(), 4);
        let names: Vec<String> = df
            .get_column_names()
            .iter()
            .map(|n| n.to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "combination", "area", "area_name", "month", "mean", "q0.05", "q0.5", "q0.95",
                "window_3d", "window_5d"
            ]
        );
        let mean = df.column("mean").unwrap().as_materialized_series().f64().unwrap();
        assert!(mean.into_no_null_iter().all(|v| (v - 0.5).abs() < 1e-6));
        let median = df.column("q0.5").unwrap().as_materialized_series().f64().unwrap();
        assert!(median.into_no_null_iter().all(|v| (v - 0.25).abs() < 1e-6));
        let label = df.column("area_name").unwrap().as_materialized_series().str().unwrap();
        assert_eq!(label.get(2), Some("Point A"));
    }

    #[test]
    fn test_area_table_degenerate_area_fails() {
        let mut areas = areas();
        areas.insert("void".to_string(), AreaBox::new([50.0, 51.0], [0.0, 1.0]));
        let err = area_climatology_table("storm", &set(0.5), &areas).unwrap_err();
        assert!(matches!(err, ClimatologyError::DegenerateArea { .. }));
    }

    #[test]
    fn test_verification_table() {
        let entry = VerificationEntry {
            name: "CERRA".to_string(),
            combination: "storm".to_string(),
            reference: "unused.nc".to_string(),
        };
        let model = set(0.5);
        let mut reference = set(0.75);
        reference.windows = None;
        if let Some(extreme) = reference.extreme.as_mut() {
            extreme.values.mapv_inplace(|v| v + 0.1);
        }
        let inputs = [VerificationInput {
            entry: &entry,
            model: &model,
            reference: &reference,
        }];
        let df = verification_table(&inputs, &areas()).unwrap();
        // 2 sides x 2 areas x 2 months
        assert_eq!(df.height(), 8);
        let mean = df.column("mean").unwrap().as_materialized_series().f64().unwrap();
        assert!((mean.get(0).unwrap() - 0.5).abs() < 1e-6);
        assert!((mean.get(7).unwrap() - 0.75).abs() < 1e-6);
        let dataset = df.column("dataset").unwrap().as_materialized_series().str().unwrap();
        assert_eq!(dataset.get(0), Some("storm"));
        assert_eq!(dataset.get(7), Some("CERRA"));

        let lower = df.column("q0.05").unwrap().as_materialized_series().f64().unwrap();
        let median = df.column("median").unwrap().as_materialized_series().f64().unwrap();
        let upper = df.column("q0.95").unwrap().as_materialized_series().f64().unwrap();
        assert!((lower.get(0).unwrap() - 0.0).abs() < 1e-6);
        assert!((upper.get(0).unwrap() - 0.5).abs() < 1e-6);
        assert!((lower.get(7).unwrap() - 0.1).abs() < 1e-6);
        assert!((upper.get(7).unwrap() - 0.6).abs() < 1e-6);
        for row in 0..df.height() {
            let (lo, mid, hi) = (
                lower.get(row).unwrap(),
                median.get(row).unwrap(),
                upper.get(row).unwrap(),
            );
            assert!(lo <= mid && mid <= hi, "row {}: {} {} {}", row, lo, mid, hi);
        }
    }

    #[tokio::test]
    async fn test_write_report_creates_parquet() {
        let dir = tempfile::TempDir::new().unwrap();
        let plot_path = format!("{}/", dir.path().display());
        let df = area_climatology_table("storm", &set(0.5), &areas()).unwrap();
        let destination = area_report_path(&plot_path, "storm");
        write_report(df, &destination).await.unwrap();

        let file = File::open(&destination).unwrap();
        let back = ParquetReader::new(file).finish().unwrap();
        assert_eq!(back.height(), 4);
    }
}
