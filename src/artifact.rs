//! # Climatology Artifacts
//!
//! Naming, publishing and loading of the persisted statistics. An artifact
//! is keyed by (combination, statistic kind, year range) and lives at
//! `{data_path}{combination}_{kind}_years_{first}_{last}.nc`, holding one
//! variable named after the combination. Recomputing replaces it wholesale.

use crate::climatology::StatisticKind;
use crate::dataset;
use crate::error::{ClimatologyError, Result};
use crate::grid::{ExtremeClimatology, MonthlyClimatology, WeatherWindows};
use crate::storage::{StorageBackend, StorageFactory};
use log::{debug, info};
use std::path::{Path, PathBuf};

/// Inclusive range of analysed years.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YearRange {
    pub first: i32,
    pub last: i32,
}

impl YearRange {
    pub fn new(first: i32, last: i32) -> Result<Self> {
        if first > last {
            return Err(ClimatologyError::config(format!(
                "year range {}..{} is reversed",
                first, last
            )));
        }
        Ok(YearRange { first, last })
    }

    pub fn years(&self) -> impl Iterator<Item = i32> {
        self.first..=self.last
    }

    pub fn count(&self) -> usize {
        (self.last - self.first + 1) as usize
    }
}

/// Location of one artifact. `data_path` is used as a prefix, exactly as
/// configured (a trailing separator is expected).
pub fn artifact_path(
    data_path: &str,
    combination: &str,
    kind: StatisticKind,
    years: YearRange,
) -> String {
    format!(
        "{}{}_{}_years_{}_{}.nc",
        data_path,
        combination,
        kind.as_str(),
        years.first,
        years.last
    )
}

/// Produces a file through `write` and publishes it at `destination`.
///
/// For a local destination the file is written next to it under a
/// temporary name and renamed into place. For S3 it is written to a
/// temporary file and uploaded once complete.
pub async fn publish_with<F>(destination: &str, write: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let suffix = Path::new(destination)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    if StorageFactory::is_s3_path(destination) {
        let staged = tempfile::Builder::new().suffix(&suffix).tempfile()?;
        write(staged.path())?;
        let data = tokio::fs::read(staged.path()).await?;
        let storage = StorageFactory::from_path(destination).await?;
        storage.write(destination, &data).await?;
    } else {
        let target = Path::new(destination);
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        tokio::fs::create_dir_all(dir).await?;
        let staged = tempfile::Builder::new()
            .prefix(".")
            .suffix(&suffix)
            .tempfile_in(dir)?;
        write(staged.path())?;
        staged
            .persist(target)
            .map_err(|e| ClimatologyError::Io(e.error))?;
    }
    debug!("published {}", destination);
    Ok(())
}

/// A readable local copy of a possibly remote file. The temporary copy of
/// a remote file is removed when this is dropped.
#[derive(Debug)]
pub struct LocalCopy {
    path: PathBuf,
    _staged: Option<tempfile::NamedTempFile>,
}

impl LocalCopy {
    pub async fn fetch(location: &str) -> Result<Self> {
        if StorageFactory::is_local_path(location) {
            return Ok(LocalCopy {
                path: PathBuf::from(location),
                _staged: None,
            });
        }
        let storage = StorageFactory::from_path(location).await?;
        let data = storage.read(location).await?;
        let staged = tempfile::Builder::new().suffix(".nc").tempfile()?;
        tokio::fs::write(staged.path(), data).await?;
        debug!("fetched {} to {}", location, staged.path().display());
        Ok(LocalCopy {
            path: staged.path().to_path_buf(),
            _staged: Some(staged),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// The three statistics of one combination.
#[derive(Debug, Clone, Default)]
pub struct ClimatologySet {
    pub monthly: Option<MonthlyClimatology>,
    pub extreme: Option<ExtremeClimatology>,
    pub windows: Option<WeatherWindows>,
}

/// Persists every statistic present in `set`.
pub async fn save_all(
    data_path: &str,
    combination: &str,
    years: YearRange,
    set: &ClimatologySet,
) -> Result<()> {
    if let Some(monthly) = &set.monthly {
        let path = artifact_path(data_path, combination, StatisticKind::Climatology, years);
        publish_with(&path, |p| dataset::write_monthly(p, combination, monthly)).await?;
        info!("wrote {}", path);
    }
    if let Some(extreme) = &set.extreme {
        let path = artifact_path(
            data_path,
            combination,
            StatisticKind::ExtremeClimatology,
            years,
        );
        publish_with(&path, |p| dataset::write_extreme(p, combination, extreme)).await?;
        info!("wrote {}", path);
    }
    if let Some(windows) = &set.windows {
        let path = artifact_path(data_path, combination, StatisticKind::WeatherWindows, years);
        publish_with(&path, |p| dataset::write_windows(p, combination, windows)).await?;
        info!("wrote {}", path);
    }
    Ok(())
}

/// Loads previously persisted statistics of one combination.
pub async fn load_all(
    data_path: &str,
    combination: &str,
    years: YearRange,
) -> Result<ClimatologySet> {
    let monthly = LocalCopy::fetch(&artifact_path(
        data_path,
        combination,
        StatisticKind::Climatology,
        years,
    ))
    .await?;
    let extreme = LocalCopy::fetch(&artifact_path(
        data_path,
        combination,
        StatisticKind::ExtremeClimatology,
        years,
    ))
    .await?;
    let windows = LocalCopy::fetch(&artifact_path(
        data_path,
        combination,
        StatisticKind::WeatherWindows,
        years,
    ))
    .await?;
    Ok(ClimatologySet {
        monthly: Some(dataset::read_monthly(monthly.path(), combination)?),
        extreme: Some(dataset::read_extreme(extreme.path(), combination)?),
        windows: Some(dataset::read_windows(windows.path(), combination)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_path() {
        let years = YearRange::new(1991, 2020).unwrap();
        assert_eq!(
            artifact_path(
                "/data/",
                "Service_limit_storm_wind",
                StatisticKind::WeatherWindows,
                years
            ),
            "/data/Service_limit_storm_wind_weather_windows_years_1991_2020.nc"
        );
        assert_eq!(
            artifact_path("s3://b/c/", "ice", StatisticKind::ExtremeClimatology, years),
            "s3://b/c/ice_extreme_climatology_years_1991_2020.nc"
        );
    }

    #[test]
    fn test_year_range() {
        assert!(YearRange::new(2021, 2020).is_err());
        let years = YearRange::new(2019, 2021).unwrap();
        assert_eq!(years.count(), 3);
        assert_eq!(years.years().collect::<Vec<_>>(), vec![2019, 2020, 2021]);
    }

    #[tokio::test]
    async fn test_publish_failure_leaves_no_artifact() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("combo_climatology_years_2020_2020.nc");
        let result = publish_with(target.to_str().unwrap(), |_| {
            Err(ClimatologyError::layout("interrupted"))
        })
        .await;
        assert!(result.is_err());
        assert!(!target.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_publish_local_writes_in_place() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("out/report.txt");
        publish_with(target.to_str().unwrap(), |p| {
            std::fs::write(p, b"done")?;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"done");
    }
}
