//! # offshore-climatology
//!
//! Climatologies of suitable operating conditions for offshore energy
//! siting, computed from gridded daily exceedance data.
//!
//! ## Features
//!
//! - **Exceedance building**: raw sub-daily fields to daily exceedance of
//!   each configured threshold, one file per month
//! - **Suitable conditions**: named combinations of exceedance series,
//!   inverted and AND-ed into a daily mask, evaluated lazily per tile
//! - **Statistics**: monthly frequency, interannual quantiles of monthly
//!   means and weather-window frequency for several window lengths
//! - **Tiled execution**: statistics run tile by tile on a rayon pool and
//!   are persisted only once complete
//! - **Reports**: cos(latitude) weighted area means and verification
//!   tables as Parquet
//! - **Storage**: local paths and `s3://` URLs for artifacts and reports
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use offshore_climatology::input::AnalysisConfig;
//! use offshore_climatology::pipeline::{RunOptions, run_analysis};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AnalysisConfig::from_file("config_visuals.yml")?;
//! let summary = run_analysis(&config, RunOptions::default()).await?;
//! println!("wrote {} artifacts", summary.artifacts.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## In-memory statistics
//!
//! ```rust
//! use chrono::NaiveDate;
//! use ndarray::Array3;
//! use offshore_climatology::climatology::{monthly_climatology, weather_windows};
//! use offshore_climatology::grid::{DailyGrid, GridAxes};
//!
//! let dates: Vec<NaiveDate> = NaiveDate::from_ymd_opt(2020, 1, 1)
//!     .unwrap()
//!     .iter_days()
//!     .take(366)
//!     .collect();
//! let axes = GridAxes::new(vec![60.0], vec![20.0])?;
//! let mask = DailyGrid::new("calm", dates, axes, Array3::ones((366, 1, 1)))?;
//!
//! let monthly = monthly_climatology(&mask);
//! assert!(monthly.values.iter().all(|&v| v == 1.0));
//! let windows = weather_windows(&mask, &[3, 7]);
//! assert_eq!(windows.values.dim(), (2, 12, 1, 1));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod area;
pub mod artifact;
pub mod cli;
pub mod climatology;
pub mod combine;
pub mod dataset;
pub mod error;
pub mod exceedance;
pub mod grid;
pub mod input;
pub mod inspect;
pub mod log;
pub mod pipeline;
pub mod report;
pub mod storage;

#[cfg(test)]
mod tests;


pub use error::{ClimatologyError, Result};
