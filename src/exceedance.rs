//! # Exceedance Mask Builder
//!
//! Converts a raw scalar field, sampled sub-daily or daily, into a daily
//! exceedance series for one calendar year, stacked along a `thresholds`
//! dimension, and names the monthly files it is persisted in.
//!
//! The builder is fed one raw file at a time, so memory is bounded by one
//! year of daily output plus the file being read.

use crate::error::{ClimatologyError, Result};
use crate::grid::GridAxes;
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use log::debug;
use ndarray::{Array4, ArrayView3, ArrayView4, Axis, Zip, s};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name suffix shared by every exceedance file.
pub const EXCEEDANCE_SUFFIX: &str = "_daily_thresh_exceed.nc";

/// How the sub-daily samples of one day are reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DailyAggregate {
    /// 1 when at least one sample exceeded, else 0.
    #[default]
    Any,
    /// Number of exceeding samples.
    Count,
}

/// Every calendar day of a year.
pub fn calendar_days(year: i32) -> Result<Vec<NaiveDate>> {
    let first = NaiveDate::from_ymd_opt(year, 1, 1)
        .ok_or_else(|| ClimatologyError::TimeAxis(format!("year {} is out of range", year)))?;
    Ok(first.iter_days().take_while(|d| d.year() == year).collect())
}

/// Daily exceedance of one variable over one year, built incrementally.
#[derive(Debug)]
pub struct ExceedanceBuilder {
    variable: String,
    year: i32,
    thresholds: Vec<f64>,
    aggregate: DailyAggregate,
    dates: Vec<NaiveDate>,
    axes: Option<GridAxes>,
    /// Indexed by (threshold, day, lat, lon); NaN until a day has a sample.
    values: Option<Array4<f32>>,
    /// Days that received at least one sample.
    seen: Vec<bool>,
    samples: usize,
}

impl ExceedanceBuilder {
    pub fn new(
        variable: &str,
        year: i32,
        thresholds: &[f64],
        aggregate: DailyAggregate,
    ) -> Result<Self> {
        if thresholds.is_empty() {
            return Err(ClimatologyError::config(format!(
                "no thresholds given for '{}'",
                variable
            )));
        }
        let dates = calendar_days(year)?;
        let seen = vec![false; dates.len()];
        Ok(ExceedanceBuilder {
            variable: variable.to_string(),
            year,
            thresholds: thresholds.to_vec(),
            aggregate,
            dates,
            axes: None,
            values: None,
            seen,
            samples: 0,
        })
    }

    /// Folds a block of `(time, lat, lon)` samples into the daily counts.
    ///
    /// Samples outside the target year are ignored. NaN samples never
    /// exceed. Every block must share the grid of the first one.
    pub fn add_samples(
        &mut self,
        times: &[NaiveDateTime],
        axes: &GridAxes,
        block: ArrayView3<'_, f32>,
    ) -> Result<()> {
        if block.len_of(Axis(0)) != times.len() {
            return Err(ClimatologyError::layout(format!(
                "'{}': {} time stamps for {} samples",
                self.variable,
                times.len(),
                block.len_of(Axis(0))
            )));
        }
        match &self.axes {
            Some(known) => known.ensure_matches(axes, &self.variable, "next raw file")?,
            None => self.axes = Some(axes.clone()),
        }
        let (n_lat, n_lon) = axes.shape();
        if block.dim() != (times.len(), n_lat, n_lon) {
            return Err(ClimatologyError::layout(format!(
                "'{}': samples have shape {:?}, grid is {:?}",
                self.variable,
                block.dim(),
                (n_lat, n_lon)
            )));
        }

        let n_days = self.dates.len();
        let n_thresholds = self.thresholds.len();
        let values = self.values.get_or_insert_with(|| {
            Array4::from_elem((n_thresholds, n_days, n_lat, n_lon), f32::NAN)
        });

        let first = self.dates[0];
        for (sample, time) in block.outer_iter().zip(times) {
            let date = time.date();
            if date.year() != self.year {
                continue;
            }
            let day = (date - first).num_days() as usize;
            if !self.seen[day] {
                values.slice_mut(s![.., day, .., ..]).fill(0.0);
                self.seen[day] = true;
            }
            for (k, &threshold) in self.thresholds.iter().enumerate() {
                let mut counts = values.slice_mut(s![k, day, .., ..]);
                let aggregate = self.aggregate;
                Zip::from(&mut counts).and(&sample).for_each(|c, &v| {
                    if f64::from(v) > threshold {
                        match aggregate {
                            DailyAggregate::Any => *c = 1.0,
                            DailyAggregate::Count => *c += 1.0,
                        }
                    }
                });
            }
            self.samples += 1;
        }
        Ok(())
    }

    /// Finishes the year. Days that never received a sample stay NaN.
    pub fn finish(self) -> Result<ExceedanceYear> {
        let axes = self.axes.ok_or_else(|| {
            ClimatologyError::TimeAxis(format!(
                "no samples were given for '{}' {}",
                self.variable, self.year
            ))
        })?;
        let values = self.values.ok_or_else(|| {
            ClimatologyError::TimeAxis(format!(
                "no samples were given for '{}' {}",
                self.variable, self.year
            ))
        })?;
        debug!(
            "'{}' {}: {} samples folded into {} days",
            self.variable,
            self.year,
            self.samples,
            self.dates.len()
        );
        Ok(ExceedanceYear {
            variable: self.variable,
            year: self.year,
            thresholds: self.thresholds,
            dates: self.dates,
            axes,
            values,
        })
    }
}

/// One finished year of daily exceedance.
#[derive(Debug, Clone)]
pub struct ExceedanceYear {
    pub variable: String,
    pub year: i32,
    pub thresholds: Vec<f64>,
    pub dates: Vec<NaiveDate>,
    pub axes: GridAxes,
    /// Values indexed by (threshold, day, lat, lon).
    pub values: Array4<f32>,
}

impl ExceedanceYear {
    /// Dates and values of one calendar month.
    pub fn month(&self, month: u32) -> Option<(&[NaiveDate], ArrayView4<'_, f32>)> {
        let start = self.dates.iter().position(|d| d.month() == month)?;
        let len = self.dates[start..]
            .iter()
            .take_while(|d| d.month() == month)
            .count();
        Some((
            &self.dates[start..start + len],
            self.values.slice(s![.., start..start + len, .., ..]),
        ))
    }
}

/// Name of the monthly exceedance file covering `first..=last`.
pub fn exceedance_file_name(
    first: NaiveDate,
    last: NaiveDate,
    variable: &str,
    timestep_minutes: u32,
) -> String {
    format!(
        "{}_{:02}_{:02}_to_{}_{:02}_{:02}_{}_timestep_{}{}",
        first.year(),
        first.month(),
        first.day(),
        last.year(),
        last.month(),
        last.day(),
        variable,
        timestep_minutes,
        EXCEEDANCE_SUFFIX
    )
}

/// Wildcard pattern an exceedance file of `(year, month, variable)` matches.
pub fn discovery_pattern(year: i32, month: u32, variable: &str) -> String {
    format!(
        "{y}_{m:02}_??_to_{y}_{m:02}_??_{v}*{s}",
        y = year,
        m = month,
        v = variable,
        s = EXCEEDANCE_SUFFIX
    )
}

/// Shell-style matching with `?` (one character) and `*` (any run).
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut i, mut j) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while j < n.len() {
        if i < p.len() && (p[i] == '?' || p[i] == n[j]) {
            i += 1;
            j += 1;
        } else if i < p.len() && p[i] == '*' {
            backtrack = Some((i, j));
            i += 1;
        } else if let Some((star, matched)) = backtrack {
            i = star + 1;
            j = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    p[i..].iter().all(|&c| c == '*')
}

/// First (in sorted order) exceedance file of `(year, month, variable)`.
pub fn find_exceedance_file(
    dir: &Path,
    year: i32,
    month: u32,
    variable: &str,
) -> Result<PathBuf> {
    let pattern = discovery_pattern(year, month, variable);
    let missing = || ClimatologyError::MissingInput {
        variable: variable.to_string(),
        year,
        month,
        pattern: pattern.clone(),
        dir: dir.to_path_buf(),
    };

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(missing()),
        Err(e) => return Err(e.into()),
    };
    let mut matches = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(name) = name.to_str() {
            if wildcard_match(&pattern, name) {
                matches.push(entry.path());
            }
        }
    }
    matches.sort();
    matches.into_iter().next().ok_or_else(missing)
}

/// Exceedance files of `variable` for every month of `first_year..=last_year`.
pub fn discover_files(
    dir: &Path,
    variable: &str,
    first_year: i32,
    last_year: i32,
) -> Result<Vec<PathBuf>> {
    let mut files = Vec::with_capacity(12 * (last_year - first_year + 1).max(0) as usize);
    for year in first_year..=last_year {
        for month in 1..=12 {
            files.push(find_exceedance_file(dir, year, month, variable)?);
        }
    }
    Ok(files)
}
