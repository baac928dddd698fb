//! # CLI Module
//!
//! Command-line interface of offshore-climatology:
//! - Argument parsing with clap
//! - Configuration file loading (YAML/JSON)
//! - `OFFSHORE_` environment variable overrides
//! - Override merging with priority CLI > environment > configuration file
//! - Starter configuration templates

use crate::area::AreaBox;
use crate::combine::DEFAULT_MISSING_FILL;
use crate::exceedance::DailyAggregate;
use crate::input::{AnalysisConfig, ParallelConfig, PreprocEntry, VarExceed, VerificationEntry};
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

/// Configuration file read when neither `--config` nor `OFFSHORE_CONFIG` is set.
pub const DEFAULT_CONFIG: &str = "config_visuals.yml";

/// Suitable-conditions and weather-window climatologies for offshore operations
#[derive(Parser, Debug)]
#[command(name = "offshore-climatology")]
#[command(about = "Weather-window and suitable-conditions climatologies from gridded exceedance data")]
#[command(version)]
#[command(long_about = "
offshore-climatology turns gridded wind and sea-ice fields into monthly
climatologies of suitable operating conditions for offshore energy siting.

PIPELINE:
  preprocess  raw sub-daily fields -> monthly daily-exceedance files
  analyze     exceedance files -> suitable-conditions masks -> monthly,
              interannual-quantile and weather-window climatologies,
              plus area time-series and verification tables

EXAMPLES:
  # Build exceedance files, then the climatologies
  offshore-climatology preprocess
  offshore-climatology analyze --config config_visuals.yml

  # Override the year range and window lengths
  offshore-climatology analyze --years 1991:2020 --windows 3,5,7,14

  # Inspect a produced artifact
  offshore-climatology inspect Service_limit_storm_wind_weather_windows_years_1991_2020.nc

  # Start from a template
  offshore-climatology template combined --format yaml -o config_visuals.yml
")]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet mode - suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Output format for structured data
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Human)]
    pub output_format: OutputFormat,

    /// Configuration file path (YAML or JSON)
    #[arg(short, long, global = true, env = "OFFSHORE_CONFIG", default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build monthly exceedance files from raw fields
    #[command(long_about = "
Build monthly daily-exceedance files from raw sub-daily fields.

For every enabled `preproc` variable and every configured year, the raw
files in {raw_path}/{year}/ ending with the variable's file_suffix are
reduced to daily exceedance of each threshold and written to opa_path as
{Y}_{MM}_{DD}_to_{Y}_{MM}_{DD}_{variable}_timestep_{minutes}_daily_thresh_exceed.nc

EXAMPLES:
  offshore-climatology preprocess
  offshore-climatology preprocess --years 2020:2020 --opa-path /scratch/opa/
")]
    Preprocess {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Compute climatologies and reports
    #[command(long_about = "
Compute the climatologies of every threshold combination and write the
enabled reports.

For each combination the member exceedance series are inverted and AND-ed
into a daily suitable-conditions mask, from which three artifacts are
derived and written to data_path:
  {combination}_climatology_years_{y0}_{y1}.nc
  {combination}_extreme_climatology_years_{y0}_{y1}.nc
  {combination}_weather_windows_years_{y0}_{y1}.nc

With compute_climatologies: false the artifacts are loaded instead.
visualize writes area time series, verify compares against reference
climatologies; both as Parquet tables under plot_path.

EXAMPLES:
  offshore-climatology analyze
  offshore-climatology analyze --quantiles 0.1,0.5,0.9 --data-path s3://bucket/clim/
  offshore-climatology analyze --dry-run
")]
    Analyze {
        #[command(flatten)]
        overrides: Overrides,

        /// Validate the configuration and exit without processing
        #[arg(long, env = "OFFSHORE_DRY_RUN")]
        dry_run: bool,
    },

    /// Validate a configuration file
    #[command(long_about = "
Validate a configuration file without processing.

Checks syntax, year range, quantiles, window lengths, combination members
against var_exceed, areas and verification entries. With --detailed, also
checks that every exceedance file the analysis needs can be found.

EXAMPLES:
  offshore-climatology validate config_visuals.yml
  offshore-climatology validate --detailed
")]
    Validate {
        /// Configuration file to validate (default: the global --config)
        config_file: Option<PathBuf>,

        /// Also look up every exceedance file
        #[arg(long)]
        detailed: bool,
    },

    /// Summarize a NetCDF exceedance file or climatology artifact
    #[command(long_about = "
Summarize a NetCDF file (local or S3): dimensions, coordinate ranges
(time, month, quantile, windows, thresholds, lat, lon) and the finite value
range of each data variable.

EXAMPLES:
  offshore-climatology inspect 2020_01_01_to_2020_01_31_10ws_timestep_60_daily_thresh_exceed.nc
  offshore-climatology inspect s3://bucket/clim/storm_climatology_years_1991_2020.nc --format json
")]
    Inspect {
        /// NetCDF file path (local or S3)
        file: String,

        /// Show only this variable
        #[arg(short = 'n', long)]
        variable: Option<String>,

        /// Output format for the summary
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },

    /// Generate configuration templates
    #[command(long_about = "
Generate starter configurations.

Available templates:
  basic-wind: 10 m wind speed limits only
  sea-ice:    sea-ice thickness and concentration limits
  combined:   wind and sea-ice limits, areas and verification

EXAMPLES:
  offshore-climatology template basic-wind
  offshore-climatology template combined --format yaml -o config_visuals.yml
")]
    Template {
        /// Template type to generate
        #[arg(value_enum)]
        template_type: TemplateType,

        /// Output file path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Configuration format
        #[arg(long, value_enum, default_value_t = ConfigFormat::Yaml)]
        format: ConfigFormat,
    },

    /// Generate shell completions
    #[command(long_about = "
Generate shell completion scripts.

EXAMPLES:
  offshore-climatology completions bash > ~/.bash_completion.d/offshore-climatology
  offshore-climatology completions zsh -o _offshore-climatology
")]
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,

        /// Output file path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON structured output
    Json,
    /// YAML structured output
    Yaml,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TemplateType {
    /// 10 m wind speed limits
    BasicWind,
    /// Sea-ice thickness and concentration limits
    SeaIce,
    /// Wind and sea-ice limits with areas and verification
    Combined,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigFormat {
    /// JSON configuration format
    Json,
    /// YAML configuration format
    Yaml,
}

/// Inclusive year range from the command line, `FIRST:LAST`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct YearSpan {
    pub first: i32,
    pub last: i32,
}

/// Window lengths in days, `3,5,7`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowList(pub Vec<usize>);

/// Quantiles in [0, 1], `0.05,0.5,0.95`.
#[derive(Clone, Debug, PartialEq)]
pub struct QuantileList(pub Vec<f64>);

/// Values that replace configuration file entries.
#[derive(Args, Clone, Debug, Default, PartialEq)]
pub struct Overrides {
    /// Year range FIRST:LAST (inclusive)
    #[arg(long, value_parser = parse_year_span)]
    pub years: Option<YearSpan>,

    /// Override data_path (artifact prefix, local or s3://)
    #[arg(long)]
    pub data_path: Option<String>,

    /// Override opa_path (exceedance file directory)
    #[arg(long)]
    pub opa_path: Option<String>,

    /// Window lengths in days: 3,5,7
    #[arg(long, value_parser = parse_window_list)]
    pub windows: Option<WindowList>,

    /// Quantiles: 0.05,0.5,0.95
    #[arg(long, value_parser = parse_quantile_list)]
    pub quantiles: Option<QuantileList>,
}

impl Overrides {
    pub fn is_empty(&self) -> bool {
        *self == Overrides::default()
    }

    /// Fields set here take priority over `lower`.
    pub fn or(self, lower: Overrides) -> Overrides {
        Overrides {
            years: self.years.or(lower.years),
            data_path: self.data_path.or(lower.data_path),
            opa_path: self.opa_path.or(lower.opa_path),
            windows: self.windows.or(lower.windows),
            quantiles: self.quantiles.or(lower.quantiles),
        }
    }

    pub fn apply(&self, config: &mut AnalysisConfig) {
        if let Some(span) = self.years {
            config.years = [span.first, span.last];
        }
        if let Some(path) = &self.data_path {
            config.data_path = path.clone();
        }
        if let Some(path) = &self.opa_path {
            config.opa_path = path.clone();
        }
        if let Some(windows) = &self.windows {
            config.windows = windows.0.clone();
        }
        if let Some(quantiles) = &self.quantiles {
            config.quantiles = quantiles.0.clone();
        }
    }
}

/// Parse year range from command line argument
/// Format: first:last
pub fn parse_year_span(s: &str) -> Result<YearSpan, String> {
    let (first, last) = s
        .split_once(':')
        .ok_or_else(|| "Year range must be in format 'first:last'".to_string())?;
    let first = first
        .trim()
        .parse::<i32>()
        .map_err(|_| format!("Invalid first year '{}'", first))?;
    let last = last
        .trim()
        .parse::<i32>()
        .map_err(|_| format!("Invalid last year '{}'", last))?;
    if first > last {
        return Err("First year must not be after last year".to_string());
    }
    Ok(YearSpan { first, last })
}

/// Parse window lengths
/// Format: w1,w2,w3
pub fn parse_window_list(s: &str) -> Result<WindowList, String> {
    let windows: Vec<usize> = s
        .split(',')
        .map(|w| w.trim().parse::<usize>())
        .collect::<Result<_, _>>()
        .map_err(|_| format!("Invalid window lengths '{}'", s))?;
    if windows.contains(&0) {
        return Err("Window lengths must be at least 1 day".to_string());
    }
    Ok(WindowList(windows))
}

/// Parse quantiles
/// Format: q1,q2,q3
pub fn parse_quantile_list(s: &str) -> Result<QuantileList, String> {
    let quantiles: Vec<f64> = s
        .split(',')
        .map(|q| q.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| format!("Invalid quantiles '{}'", s))?;
    if quantiles.iter().any(|q| !(0.0..=1.0).contains(q)) {
        return Err("Quantiles must lie in [0, 1]".to_string());
    }
    Ok(QuantileList(quantiles))
}

/// Environment variable format:
/// - OFFSHORE_YEARS: "1991:2020"
/// - OFFSHORE_DATA_PATH: "/data/climatologies/"
/// - OFFSHORE_OPA_PATH: "/data/exceedance/"
/// - OFFSHORE_WINDOWS: "3,5,7"
/// - OFFSHORE_QUANTILES: "0.05,0.5,0.95"
pub fn parse_overrides_from_env() -> Result<Overrides, String> {
    let read = |name: &str| -> Option<String> {
        env::var(name)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let mut overrides = Overrides::default();
    if let Some(value) = read("OFFSHORE_YEARS") {
        overrides.years = Some(
            parse_year_span(&value).map_err(|e| format!("Invalid OFFSHORE_YEARS: {}", e))?,
        );
    }
    overrides.data_path = read("OFFSHORE_DATA_PATH");
    overrides.opa_path = read("OFFSHORE_OPA_PATH");
    if let Some(value) = read("OFFSHORE_WINDOWS") {
        overrides.windows = Some(
            parse_window_list(&value).map_err(|e| format!("Invalid OFFSHORE_WINDOWS: {}", e))?,
        );
    }
    if let Some(value) = read("OFFSHORE_QUANTILES") {
        overrides.quantiles = Some(
            parse_quantile_list(&value)
                .map_err(|e| format!("Invalid OFFSHORE_QUANTILES: {}", e))?,
        );
    }
    Ok(overrides)
}

/// Merge CLI overrides with environment variable overrides
/// Priority: CLI arguments > Environment variables
pub fn merge_overrides(cli: Overrides) -> Result<Overrides, String> {
    Ok(cli.or(parse_overrides_from_env()?))
}

fn area(name: &str, lon: [f64; 2], lat: [f64; 2]) -> AreaBox {
    AreaBox {
        name: Some(name.to_string()),
        lon_slice: lon,
        lat_slice: lat,
    }
}

fn preproc(
    source: &str,
    suffix: &str,
    thresholds: &[f64],
    aggregate: DailyAggregate,
    timestep_minutes: u32,
) -> PreprocEntry {
    PreprocEntry {
        source_variable: Some(source.to_string()),
        file_suffix: suffix.to_string(),
        thresholds: thresholds.to_vec(),
        aggregate,
        timestep_minutes,
        enabled: true,
    }
}

fn limits(values: &[&str]) -> VarExceed {
    VarExceed {
        limits: values.iter().map(|v| v.to_string()).collect(),
    }
}

fn members(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

/// Builds a starter configuration.
pub fn generate_template(template_type: TemplateType) -> AnalysisConfig {
    let mut var_exceed = BTreeMap::new();
    let mut combinations = BTreeMap::new();
    let mut preprocs = BTreeMap::new();
    let mut timeseries_areas = BTreeMap::new();
    let mut verification_areas = BTreeMap::new();
    let mut verification = Vec::new();

    let wind = matches!(template_type, TemplateType::BasicWind | TemplateType::Combined);
    let ice = matches!(template_type, TemplateType::SeaIce | TemplateType::Combined);

    if wind {
        var_exceed.insert("10ws".to_string(), limits(&["21", "18", "10"]));
        combinations.insert(
            "Service_limit_storm_wind".to_string(),
            members(&["10ws_exceed21"]),
        );
        combinations.insert(
            "Installation_limit_wind".to_string(),
            members(&["10ws_exceed10"]),
        );
        preprocs.insert(
            "10ws".to_string(),
            preproc(
                "10ws",
                "_10ws_raw_data.nc",
                &[10.0, 18.0, 21.0],
                DailyAggregate::Count,
                60,
            ),
        );
        timeseries_areas.insert(
            "north_sea".to_string(),
            area("North Sea, Dogger Bank", [1.0, 3.0], [54.0, 55.5]),
        );
    }
    if ice {
        var_exceed.insert("sithick".to_string(), limits(&["0.05", "0.4", "0.6"]));
        var_exceed.insert("siconc".to_string(), limits(&["0.15"]));
        combinations.insert(
            "Ice_free".to_string(),
            members(&["sithick_exceed0.05", "siconc_exceed0.15"]),
        );
        combinations.insert(
            "Ice_class_IC".to_string(),
            members(&["sithick_exceed0.4"]),
        );
        preprocs.insert(
            "sithick".to_string(),
            preproc("avg_sithick", "_oce.nc", &[0.05, 0.4, 0.6], DailyAggregate::Any, 1440),
        );
        preprocs.insert(
            "siconc".to_string(),
            preproc("avg_siconc", "_oce.nc", &[0.15], DailyAggregate::Any, 1440),
        );
        timeseries_areas.insert(
            "bothnian_bay".to_string(),
            area("Bothnian Bay", [22.0, 24.0], [64.5, 65.5]),
        );
    }
    if wind && ice {
        combinations.insert(
            "Service_limit_wind_no_ice".to_string(),
            members(&["10ws_exceed18", "sithick_exceed0.05"]),
        );
        verification_areas.insert(
            "gulf_of_finland".to_string(),
            area("Gulf of Finland", [24.0, 27.0], [59.5, 60.3]),
        );
        verification.push(VerificationEntry {
            name: "CERRA".to_string(),
            combination: "Service_limit_storm_wind".to_string(),
            reference: "/data/reference/CERRA_Service_limit_storm_wind_climatologies.nc"
                .to_string(),
        });
    }

    AnalysisConfig {
        var_exceed,
        threshold_combination: combinations,
        years: [1991, 2020],
        data_path: "/data/climatologies/".to_string(),
        opa_path: "/data/exceedance/".to_string(),
        raw_path: "/data/raw/".to_string(),
        plot_path: "/data/plots/".to_string(),
        quantiles: vec![0.05, 0.5, 0.95],
        windows: vec![3, 5, 7],
        timeseries_areas,
        verification_areas,
        verification,
        dask: ParallelConfig::default(),
        preproc: preprocs,
        compute_climatologies: true,
        visualize: true,
        verify: wind && ice,
        use_dask: true,
        missing_fill: DEFAULT_MISSING_FILL,
    }
}

/// Serializes a configuration in the requested format.
pub fn render_config(config: &AnalysisConfig, format: ConfigFormat) -> crate::error::Result<String> {
    match format {
        ConfigFormat::Json => config.to_json(),
        ConfigFormat::Yaml => config.to_yaml(),
    }
}
