//! # Pipeline
//!
//! The two batch entry points:
//!
//! - [`run_preprocess`]: raw sub-daily fields to monthly exceedance files
//! - [`run_analysis`]: exceedance files to suitable-conditions masks, their
//!   monthly, extreme and weather-window climatologies, and the report tables
//!
//! Statistics are computed tile by tile on a rayon pool. Each tile is read
//! once from the lazily combined mask and every requested kernel runs on
//! that block; results land in disjoint regions of the output arrays, so the
//! outcome does not depend on the order tiles finish in. Artifacts are
//! persisted only after a combination is complete.

use crate::artifact::{ClimatologySet, artifact_path, load_all, publish_with, save_all};
use crate::climatology::{CalendarIndex, StatisticKind, StatisticsRequest, compute_tile};
use crate::combine::{Member, Normalization, SeriesId, SuitableConditions};
use crate::dataset::{self, ExceedanceSeries};
use crate::error::{ClimatologyError, Result};
use crate::exceedance::{ExceedanceBuilder, discover_files, exceedance_file_name};
use crate::grid::{
    ExtremeClimatology, MonthlyClimatology, TileSource, WeatherWindows, tiles, validate_daily_axis,
};
use crate::input::{AnalysisConfig, ParallelConfig, PreprocEntry};
use crate::report::{self, VerificationInput};
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use ndarray::{Array3, Array4, s};
use rayon::ThreadPool;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Run options that do not belong in the configuration file.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Draw a progress bar over the tiles of each combination.
    pub show_progress: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PreprocessSummary {
    pub variables: Vec<String>,
    pub raw_files_read: usize,
    pub files_written: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisSummary {
    pub combinations: Vec<String>,
    pub tiles: usize,
    pub artifacts: Vec<String>,
    pub reports: Vec<String>,
}

/// Raw files of one year: entries of `dir` whose name ends with `suffix`,
/// sorted by name.
pub fn raw_files(dir: &Path, suffix: &str) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let matches = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.ends_with(suffix));
        if matches && entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Builds and publishes one year of exceedance files for one variable.
/// Returns the number of raw files read and the files written.
async fn preprocess_year(
    config: &AnalysisConfig,
    variable: &str,
    entry: &PreprocEntry,
    year: i32,
) -> Result<(usize, Vec<String>)> {
    let dir = Path::new(&config.raw_path).join(year.to_string());
    let files = raw_files(&dir, &entry.file_suffix)?;
    if files.is_empty() {
        return Err(ClimatologyError::MissingRawInput {
            variable: variable.to_string(),
            year,
            suffix: entry.file_suffix.clone(),
            dir,
        });
    }

    let source = entry.source_variable(variable);
    let mut builder = ExceedanceBuilder::new(variable, year, &entry.thresholds, entry.aggregate)?;
    for file in &files {
        let raw = dataset::read_raw_samples(file, source)?;
        builder.add_samples(&raw.times, &raw.axes, raw.values.view())?;
    }
    let exceedance = builder.finish()?;

    let mut written = Vec::with_capacity(12);
    for month in 1..=12 {
        let Some((dates, values)) = exceedance.month(month) else {
            continue;
        };
        let (Some(&first), Some(&last)) = (dates.first(), dates.last()) else {
            continue;
        };
        let name = exceedance_file_name(first, last, variable, entry.timestep_minutes);
        let destination = Path::new(&config.opa_path).join(name);
        let destination = destination.to_string_lossy().into_owned();
        publish_with(&destination, |path| {
            dataset::write_exceedance(
                path,
                variable,
                &exceedance.thresholds,
                dates,
                &exceedance.axes,
                values,
            )
        })
        .await?;
        debug!("wrote {}", destination);
        written.push(destination);
    }
    Ok((files.len(), written))
}

/// Converts raw fields into monthly exceedance files for every enabled
/// `preproc` variable and every configured year.
pub async fn run_preprocess(config: &AnalysisConfig) -> Result<PreprocessSummary> {
    config.validate()?;
    let years = config.years()?;
    let mut summary = PreprocessSummary::default();

    for (variable, entry) in &config.preproc {
        if !entry.enabled {
            debug!("preprocessing of '{}' is disabled", variable);
            continue;
        }
        info!(
            "preprocessing '{}' for {}-{} (thresholds {:?})",
            variable, years.first, years.last, entry.thresholds
        );
        for year in years.years() {
            let (read, written) = preprocess_year(config, variable, entry, year).await?;
            info!("'{}' {}: {} raw files, {} monthly files", variable, year, read, written.len());
            summary.raw_files_read += read;
            summary.files_written.extend(written);
        }
        summary.variables.push(variable.clone());
    }

    if summary.variables.is_empty() {
        warn!("no preproc variable is enabled, nothing to do");
    }
    Ok(summary)
}

/// Opens the exceedance series of every combination member.
fn open_series(config: &AnalysisConfig) -> Result<BTreeMap<SeriesId, Arc<dyn TileSource>>> {
    let years = config.years()?;
    let dir = Path::new(&config.opa_path);
    let mut sources: BTreeMap<SeriesId, Arc<dyn TileSource>> = BTreeMap::new();
    for id in config.series()? {
        let files = discover_files(dir, &id.variable, years.first, years.last)?;
        debug!("'{}': {} monthly files", id, files.len());
        let series = ExceedanceSeries::open(&id, &files)?;
        sources.insert(id, Arc::new(series));
    }
    Ok(sources)
}

/// The lazily evaluated mask of one combination.
pub fn build_combination(
    config: &AnalysisConfig,
    name: &str,
    sources: &BTreeMap<SeriesId, Arc<dyn TileSource>>,
) -> Result<SuitableConditions> {
    let mut members = Vec::new();
    for id in config.members(name)? {
        let source = sources.get(&id).ok_or_else(|| {
            ClimatologyError::config(format!("series '{}' of '{}' was not opened", id, name))
        })?;
        members.push(Member::new(
            Arc::clone(source),
            Normalization::for_variable(&id.variable),
        ));
    }
    SuitableConditions::new(name, members, config.missing_fill)
}

fn progress_bar(len: usize, label: &str, options: RunOptions) -> ProgressBar {
    if !options.show_progress {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {msg} [{elapsed_precise}] [{bar:40.cyan/blue}] tile {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    bar.set_message(label.to_string());
    bar
}

/// Computes every requested statistic of one daily mask, tile by tile.
pub fn compute_statistics(
    source: &dyn TileSource,
    request: &StatisticsRequest,
    parallel: &ParallelConfig,
    pool: &ThreadPool,
    options: RunOptions,
) -> Result<ClimatologySet> {
    validate_daily_axis(source.dates())?;
    let axes = source.axes().clone();
    let index = CalendarIndex::new(source.dates());
    if request.wants(StatisticKind::ExtremeClimatology) && index.min_years() < 2 {
        warn!(
            "'{}': some months cover fewer than 2 years, interannual quantiles collapse to a single value",
            source.name()
        );
    }

    let tiles = tiles(&axes, parallel.chunk_lat, parallel.chunk_lon);
    let bar = progress_bar(tiles.len(), source.name(), options);
    debug!(
        "'{}': {} tiles of up to {}x{} cells on {} threads",
        source.name(),
        tiles.len(),
        parallel.chunk_lat,
        parallel.chunk_lon,
        pool.current_num_threads()
    );

    let results = pool.install(|| {
        tiles
            .into_par_iter()
            .progress_with(bar.clone())
            .map(|tile| {
                let block = source.read_tile(&tile)?;
                Ok(compute_tile(tile, block.view(), &index, request))
            })
            .collect::<Result<Vec<_>>>()
    })?;
    bar.finish_and_clear();

    let (n_lat, n_lon) = axes.shape();
    let n_months = index.months().len();
    let mut monthly = request
        .wants(StatisticKind::Climatology)
        .then(|| Array3::from_elem((n_months, n_lat, n_lon), f32::NAN));
    let mut extreme = request.wants(StatisticKind::ExtremeClimatology).then(|| {
        Array4::from_elem((n_months, request.quantiles.len(), n_lat, n_lon), f32::NAN)
    });
    let mut windows = request.wants(StatisticKind::WeatherWindows).then(|| {
        Array4::from_elem((request.windows.len(), n_months, n_lat, n_lon), f32::NAN)
    });

    for part in results {
        let (lat, lon) = (part.tile.lat.clone(), part.tile.lon.clone());
        if let (Some(out), Some(block)) = (monthly.as_mut(), part.monthly) {
            out.slice_mut(s![.., lat.clone(), lon.clone()]).assign(&block);
        }
        if let (Some(out), Some(block)) = (extreme.as_mut(), part.extreme) {
            out.slice_mut(s![.., .., lat.clone(), lon.clone()])
                .assign(&block);
        }
        if let (Some(out), Some(block)) = (windows.as_mut(), part.windows) {
            out.slice_mut(s![.., .., lat, lon]).assign(&block);
        }
    }

    let months = index.months().to_vec();
    Ok(ClimatologySet {
        monthly: monthly.map(|values| MonthlyClimatology {
            months: months.clone(),
            axes: axes.clone(),
            values,
        }),
        extreme: extreme.map(|values| ExtremeClimatology {
            months: months.clone(),
            quantiles: request.quantiles.clone(),
            axes: axes.clone(),
            values,
        }),
        windows: windows.map(|values| WeatherWindows {
            windows: request.windows.clone(),
            months,
            axes,
            values,
        }),
    })
}

/// Computes (or loads) the statistics of every combination, persists them
/// and writes the enabled reports.
pub async fn run_analysis(config: &AnalysisConfig, options: RunOptions) -> Result<AnalysisSummary> {
    config.validate()?;
    let years = config.years()?;
    let mut summary = AnalysisSummary {
        combinations: config.threshold_combination.keys().cloned().collect(),
        ..AnalysisSummary::default()
    };
    let mut sets: BTreeMap<String, ClimatologySet> = BTreeMap::new();

    if config.compute_climatologies {
        let threads = config.worker_threads();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()?;
        info!("computing climatologies for {}-{} on {} threads", years.first, years.last, threads);

        let sources = open_series(config)?;
        let request = config.statistics_request();
        for name in config.threshold_combination.keys() {
            let combination = build_combination(config, name, &sources)?;
            info!(
                "'{}': {} days on a {}x{} grid",
                name,
                combination.dates().len(),
                combination.axes().lat.len(),
                combination.axes().lon.len()
            );
            let set = compute_statistics(&combination, &request, &config.dask, &pool, options)?;
            summary.tiles += tiles(combination.axes(), config.dask.chunk_lat, config.dask.chunk_lon).len();
            save_all(&config.data_path, name, years, &set).await?;
            summary.artifacts.extend(
                request
                    .kinds
                    .iter()
                    .map(|kind| artifact_path(&config.data_path, name, *kind, years)),
            );
            sets.insert(name.clone(), set);
        }
    } else if config.visualize || config.verify {
        for name in config.threshold_combination.keys() {
            info!("loading climatologies of '{}'", name);
            sets.insert(name.clone(), load_all(&config.data_path, name, years).await?);
        }
    }

    if config.visualize {
        if config.timeseries_areas.is_empty() {
            warn!("visualize is set but no timeseries_areas are configured");
        } else {
            for (name, set) in &sets {
                let df = report::area_climatology_table(name, set, &config.timeseries_areas)?;
                let destination = report::area_report_path(&config.plot_path, name);
                report::write_report(df, &destination).await?;
                summary.reports.push(destination);
            }
        }
    }

    if config.verify {
        let mut references = Vec::with_capacity(config.verification.len());
        for entry in &config.verification {
            info!("verifying '{}' against {}", entry.combination, entry.reference);
            references.push(report::load_reference(&entry.reference).await?);
        }
        let mut inputs = Vec::with_capacity(references.len());
        for (entry, reference) in config.verification.iter().zip(&references) {
            let model = sets.get(&entry.combination).ok_or_else(|| {
                ClimatologyError::config(format!(
                    "verification '{}' refers to unknown combination '{}'",
                    entry.name, entry.combination
                ))
            })?;
            inputs.push(VerificationInput {
                entry,
                model,
                reference,
            });
        }
        let df = report::verification_table(&inputs, &config.verification_areas)?;
        let destination = report::verification_report_path(&config.plot_path);
        report::write_report(df, &destination).await?;
        summary.reports.push(destination);
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::climatology::{extreme_climatology, monthly_climatology, weather_windows};
    use crate::grid::{DailyGrid, GridAxes};
    use chrono::NaiveDate;

    fn mask() -> DailyGrid {
        let dates: Vec<NaiveDate> = NaiveDate::from_ymd_opt(2019, 12, 1)
            .unwrap()
            .iter_days()
            .take(100)
            .collect();
        let axes = GridAxes::new(
            (0..5).map(|i| 60.0 - i as f64).collect(),
            (0..7).map(|j| 10.0 + j as f64).collect(),
        )
        .unwrap();
        let values = Array3::from_shape_fn((100, 5, 7), |(t, i, j)| {
            if (t * 7 + i * 3 + j) % 5 == 0 { 0.0 } else { 1.0 }
        });
        DailyGrid::new("mask", dates, axes, values).unwrap()
    }

    #[test]
    fn test_tiled_statistics_equal_whole_grid() {
        let grid = mask();
        let request = StatisticsRequest::default();
        let parallel = ParallelConfig {
            n_workers: 1,
            n_threads: 3,
            chunk_lat: 2,
            chunk_lon: 3,
        };
        let pool = rayon::ThreadPoolBuilder::new().num_threads(3).build().unwrap();
        let set = compute_statistics(&grid, &request, &parallel, &pool, RunOptions::default())
            .unwrap();

        let whole_monthly = monthly_climatology(&grid);
        let whole_extreme = extreme_climatology(&grid, &request.quantiles);
        let whole_windows = weather_windows(&grid, &request.windows);

        let monthly = set.monthly.unwrap();
        assert_eq!(monthly.months, whole_monthly.months);
        assert_eq!(monthly.values, whole_monthly.values);
        let extreme = set.extreme.unwrap();
        assert_eq!(extreme.values.dim(), whole_extreme.values.dim());
        assert!(
            extreme
                .values
                .iter()
                .zip(whole_extreme.values.iter())
                .all(|(a, b)| a == b || (a.is_nan() && b.is_nan()))
        );
        let windows = set.windows.unwrap();
        assert!(
            windows
                .values
                .iter()
                .zip(whole_windows.values.iter())
                .all(|(a, b)| a == b || (a.is_nan() && b.is_nan()))
        );
    }

    #[test]
    fn test_raw_files_filters_and_sorts() {
        let dir = tempfile::TempDir::new().unwrap();
        for name in ["2020_02_10ws_raw_data.nc", "2020_01_10ws_raw_data.nc", "2020_01_oce.nc"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let files = raw_files(dir.path(), "_10ws_raw_data.nc").unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["2020_01_10ws_raw_data.nc", "2020_02_10ws_raw_data.nc"]);
        assert!(raw_files(&dir.path().join("1999"), "_oce.nc").unwrap().is_empty());
    }
}
