//! # Input Configuration Module
//!
//! Configuration of a climatology run, loaded from YAML or JSON (chosen by
//! file extension) and validated before any data is touched.
//!
//! ## Configuration Structure
//!
//! - **var_exceed**: exceedance variables and the limits available for each
//! - **threshold_combination**: named combinations of `<variable>_exceed<limit>`
//!   series whose joint satisfaction defines suitable conditions
//! - **years**: inclusive `[first, last]` year range
//! - **data_path / opa_path / raw_path / plot_path**: artifact, exceedance,
//!   raw input and report locations
//! - **quantiles / windows**: parameters of the extreme and window statistics
//! - **timeseries_areas / verification_areas / verification**: report inputs
//! - **dask** (alias **parallel**): worker pool and tile size
//! - **preproc**: raw-to-exceedance preprocessing, per output variable
//!
//! ## Example Usage
//!
//! ```rust
//! use offshore_climatology::input::AnalysisConfig;
//!
//! let yaml = r#"
//! var_exceed:
//!   10ws:
//!     limits: ["21"]
//! threshold_combination:
//!   storm: ["10ws_exceed21"]
//! years: [1991, 2020]
//! data_path: /data/climatologies/
//! opa_path: /data/exceedance/
//! "#;
//! let config = AnalysisConfig::from_yaml(yaml)?;
//! config.validate()?;
//! assert_eq!(config.years()?.count(), 30);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::area::AreaBox;
use crate::artifact::YearRange;
use crate::climatology::{DEFAULT_QUANTILES, DEFAULT_WINDOWS, StatisticsRequest};
use crate::combine::{DEFAULT_MISSING_FILL, SeriesId};
use crate::error::{ClimatologyError, Result};
use crate::exceedance::DailyAggregate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Complete configuration of a preprocessing or analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Exceedance variables keyed by variable name.
    pub var_exceed: BTreeMap<String, VarExceed>,
    /// Combination name to member series ids.
    pub threshold_combination: BTreeMap<String, Vec<String>>,
    /// Inclusive `[first, last]`.
    pub years: [i32; 2],
    /// Prefix of the persisted climatology artifacts (local or `s3://`).
    pub data_path: String,
    /// Directory of the monthly exceedance files.
    pub opa_path: String,
    /// Directory holding one `{year}/` folder of raw files per year.
    #[serde(default)]
    pub raw_path: String,
    /// Prefix of the report tables (local or `s3://`).
    #[serde(default)]
    pub plot_path: String,
    #[serde(default = "default_quantiles")]
    pub quantiles: Vec<f64>,
    #[serde(default = "default_windows")]
    pub windows: Vec<usize>,
    #[serde(default)]
    pub timeseries_areas: BTreeMap<String, AreaBox>,
    #[serde(default)]
    pub verification_areas: BTreeMap<String, AreaBox>,
    #[serde(default)]
    pub verification: Vec<VerificationEntry>,
    #[serde(default, alias = "parallel")]
    pub dask: ParallelConfig,
    #[serde(default)]
    pub preproc: BTreeMap<String, PreprocEntry>,
    /// Compute and persist the statistics; when false they are loaded.
    #[serde(default = "default_true")]
    pub compute_climatologies: bool,
    /// Write the area time-series report.
    #[serde(default)]
    pub visualize: bool,
    /// Write the verification report.
    #[serde(default)]
    pub verify: bool,
    /// Run on `n_workers * n_threads` threads instead of one.
    #[serde(default)]
    pub use_dask: bool,
    /// Value substituted for missing exceedance before inversion.
    #[serde(default = "default_missing_fill")]
    pub missing_fill: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarExceed {
    pub limits: Vec<String>,
}

/// A reference climatology to compare one combination against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationEntry {
    /// Label of the reference dataset, e.g. `CERRA`.
    pub name: String,
    pub combination: String,
    /// NetCDF file with `climatology(month, lat, lon)` and
    /// `extreme_climatology(month, quantile, lat, lon)`.
    pub reference: String,
}

/// Worker pool and tiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelConfig {
    #[serde(default = "default_workers")]
    pub n_workers: usize,
    #[serde(default = "default_workers")]
    pub n_threads: usize,
    #[serde(default = "default_chunk")]
    pub chunk_lat: usize,
    #[serde(default = "default_chunk")]
    pub chunk_lon: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        ParallelConfig {
            n_workers: default_workers(),
            n_threads: default_workers(),
            chunk_lat: default_chunk(),
            chunk_lon: default_chunk(),
        }
    }
}

/// Preprocessing of one exceedance variable from raw files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocEntry {
    /// Variable name inside the raw files; defaults to the entry key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_variable: Option<String>,
    /// Raw files of a year are the ones in `{raw_path}/{year}/` whose name
    /// ends with this suffix.
    pub file_suffix: String,
    pub thresholds: Vec<f64>,
    #[serde(default)]
    pub aggregate: DailyAggregate,
    #[serde(default = "default_timestep")]
    pub timestep_minutes: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_quantiles() -> Vec<f64> {
    DEFAULT_QUANTILES.to_vec()
}

fn default_windows() -> Vec<usize> {
    DEFAULT_WINDOWS.to_vec()
}

fn default_true() -> bool {
    true
}

fn default_missing_fill() -> f32 {
    DEFAULT_MISSING_FILL
}

fn default_workers() -> usize {
    2
}

fn default_chunk() -> usize {
    60
}

fn default_timestep() -> u32 {
    60
}

impl AnalysisConfig {
    /// Loads a configuration file. `.json` files are parsed as JSON,
    /// everything else as YAML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ClimatologyError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json(&content)
        } else {
            Self::from_yaml(&content)
        }
    }

    pub fn from_yaml(yaml_str: &str) -> Result<Self> {
        serde_yaml::from_str(yaml_str).map_err(|e| ClimatologyError::config(e.to_string()))
    }

    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str).map_err(|e| ClimatologyError::config(e.to_string()))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| ClimatologyError::config(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ClimatologyError::config(e.to_string()))
    }

    pub fn years(&self) -> Result<YearRange> {
        YearRange::new(self.years[0], self.years[1])
    }

    /// Member series of one combination, in configured order.
    pub fn members(&self, combination: &str) -> Result<Vec<SeriesId>> {
        let ids = self.threshold_combination.get(combination).ok_or_else(|| {
            ClimatologyError::config(format!("unknown combination '{}'", combination))
        })?;
        ids.iter().map(|id| SeriesId::parse(id)).collect()
    }

    /// Every series referenced by any combination, each once.
    pub fn series(&self) -> Result<Vec<SeriesId>> {
        let mut all = Vec::new();
        for name in self.threshold_combination.keys() {
            for id in self.members(name)? {
                if !all.contains(&id) {
                    all.push(id);
                }
            }
        }
        Ok(all)
    }

    pub fn statistics_request(&self) -> StatisticsRequest {
        StatisticsRequest {
            quantiles: self.quantiles.clone(),
            windows: self.windows.clone(),
            ..StatisticsRequest::default()
        }
    }

    /// Size of the worker pool.
    pub fn worker_threads(&self) -> usize {
        if self.use_dask {
            (self.dask.n_workers * self.dask.n_threads).max(1)
        } else {
            1
        }
    }

    /// Checks every cross-reference and numeric bound.
    pub fn validate(&self) -> Result<()> {
        let years = self.years()?;
        if years.first < 1 {
            return Err(ClimatologyError::config("years must be positive"));
        }
        if self.data_path.trim().is_empty() {
            return Err(ClimatologyError::config("data_path is empty"));
        }
        if self.opa_path.trim().is_empty() {
            return Err(ClimatologyError::config("opa_path is empty"));
        }

        if self.quantiles.is_empty() {
            return Err(ClimatologyError::config("quantiles is empty"));
        }
        if let Some(q) = self
            .quantiles
            .iter()
            .find(|q| !(0.0..=1.0).contains(*q))
        {
            return Err(ClimatologyError::config(format!(
                "quantile {} is outside [0, 1]",
                q
            )));
        }
        if self.windows.is_empty() {
            return Err(ClimatologyError::config("windows is empty"));
        }
        if self.windows.contains(&0) {
            return Err(ClimatologyError::config("window lengths must be at least 1 day"));
        }
        if !self.missing_fill.is_finite() {
            return Err(ClimatologyError::config("missing_fill must be finite"));
        }

        let p = &self.dask;
        if p.n_workers == 0 || p.n_threads == 0 {
            return Err(ClimatologyError::config(
                "n_workers and n_threads must be at least 1",
            ));
        }
        if p.chunk_lat == 0 || p.chunk_lon == 0 {
            return Err(ClimatologyError::config(
                "chunk_lat and chunk_lon must be at least 1",
            ));
        }

        if self.threshold_combination.is_empty() {
            return Err(ClimatologyError::config("no threshold_combination configured"));
        }
        for (name, ids) in &self.threshold_combination {
            if ids.is_empty() {
                return Err(ClimatologyError::config(format!(
                    "combination '{}' has no members",
                    name
                )));
            }
            for id in self.members(name)? {
                let limits = self.var_exceed.get(&id.variable).ok_or_else(|| {
                    ClimatologyError::config(format!(
                        "combination '{}' uses '{}', which is not in var_exceed",
                        name, id.variable
                    ))
                })?;
                if !limits.limits.contains(&id.limit) {
                    return Err(ClimatologyError::config(format!(
                        "combination '{}' uses limit {} of '{}', configured limits are {:?}",
                        name, id.limit, id.variable, limits.limits
                    )));
                }
                id.threshold()?;
            }
        }

        for (name, area) in self.timeseries_areas.iter().chain(&self.verification_areas) {
            area.validate(name)?;
        }
        for entry in &self.verification {
            if !self.threshold_combination.contains_key(&entry.combination) {
                return Err(ClimatologyError::config(format!(
                    "verification '{}' refers to unknown combination '{}'",
                    entry.name, entry.combination
                )));
            }
        }
        if self.verify && self.verification.is_empty() {
            return Err(ClimatologyError::config(
                "verify is set but no verification entries are configured",
            ));
        }

        for (variable, entry) in &self.preproc {
            if entry.thresholds.is_empty() {
                return Err(ClimatologyError::config(format!(
                    "preproc '{}' has no thresholds",
                    variable
                )));
            }
            if entry.thresholds.iter().any(|t| !t.is_finite()) {
                return Err(ClimatologyError::config(format!(
                    "preproc '{}' has a non-finite threshold",
                    variable
                )));
            }
            if entry.file_suffix.is_empty() {
                return Err(ClimatologyError::config(format!(
                    "preproc '{}' has an empty file_suffix",
                    variable
                )));
            }
        }
        Ok(())
    }
}

impl PreprocEntry {
    pub fn source_variable<'a>(&'a self, variable: &'a str) -> &'a str {
        self.source_variable.as_deref().unwrap_or(variable)
    }
}
