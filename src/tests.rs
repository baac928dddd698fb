use crate::area::{self, AreaBox};
use crate::artifact::{ClimatologySet, YearRange, load_all, save_all};
use crate::climatology::{
    StatisticsRequest, extreme_climatology, monthly_climatology, weather_windows,
};
use crate::combine::{DEFAULT_MISSING_FILL, Member, Normalization, SeriesId, SuitableConditions};
use crate::dataset::{self, ExceedanceSeries};
use crate::grid::{DailyGrid, GridAxes};
use crate::input::*;
use chrono::{Datelike, NaiveDate};
use ndarray::{Array3, Array4};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::tempdir;

/// Consecutive days starting at `first`.
fn days(first: (i32, u32, u32), n: usize) -> Vec<NaiveDate> {
    NaiveDate::from_ymd_opt(first.0, first.1, first.2)
        .unwrap()
        .iter_days()
        .take(n)
        .collect()
}

fn single_cell() -> GridAxes {
    GridAxes::new(vec![60.0], vec![20.0]).unwrap()
}

/// A one-cell mask whose value on each date is `value(date)`.
fn cell_mask(dates: Vec<NaiveDate>, value: impl Fn(usize, NaiveDate) -> f32) -> DailyGrid {
    let values = Array3::from_shape_fn((dates.len(), 1, 1), |(t, _, _)| value(t, dates[t]));
    DailyGrid::new("mask", dates, single_cell(), values).unwrap()
}

fn close(a: f32, b: f64, tolerance: f64) -> bool {
    (f64::from(a) - b).abs() <= tolerance
}

fn same_or_both_nan(a: &[f32], b: &[f32]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|(x, y)| x == y || (x.is_nan() && y.is_nan()))
}

#[cfg(test)]
mod statistics_tests {
    use super::*;

    #[test]
    fn test_all_suitable_mask_gives_full_windows() {
        let mask = cell_mask(days((2018, 1, 1), 730), |_, _| 1.0);
        let windows = weather_windows(&mask, &[3, 5, 7]);
        assert_eq!(windows.months, (1..=12).collect::<Vec<u32>>());
        assert!(windows.values.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_alternating_mask_never_holds_a_window() {
        let mask = cell_mask(days((2018, 1, 1), 730), |t, _| {
            if t % 2 == 0 { 1.0 } else { 0.0 }
        });
        let windows = weather_windows(&mask, &[2, 3, 5, 7]);
        assert!(windows.values.iter().all(|&v| v == 0.0));

        let monthly = monthly_climatology(&mask);
        assert!(monthly.values.iter().all(|&v| close(v, 0.5, 0.03)));
    }

    #[test]
    fn test_interannual_quantiles_interpolate_year_means() {
        // June means of 0.2, 0.5 and 0.8 in three successive years
        let mut dates = Vec::new();
        for year in 2001..=2003 {
            dates.extend(days((year, 6, 1), 30));
        }
        let suitable_days = |year: i32| match year {
            2001 => 6,
            2002 => 15,
            _ => 24,
        };
        let mask = cell_mask(dates, |_, d| {
            if d.day() as usize <= suitable_days(d.year()) { 1.0 } else { 0.0 }
        });

        let extreme = extreme_climatology(&mask, &[0.05, 0.5, 0.95]);
        assert_eq!(extreme.months, vec![6]);
        let june = |q: f64| extreme.field(6, q).unwrap()[[0, 0]];
        assert!(close(june(0.5), 0.5, 1e-6));
        assert!(close(june(0.05), 0.2 + 0.1 * 0.3, 1e-6));
        assert!(close(june(0.95), 0.5 + 0.9 * 0.3, 1e-6));
    }

    #[test]
    fn test_monthly_frequency_bounds_and_constants() {
        let dates = days((2019, 1, 1), 365);
        let mixed = cell_mask(dates.clone(), |t, _| ((t * 7 + 3) % 4 == 0) as u8 as f32);
        let clim = monthly_climatology(&mixed);
        assert!(clim.values.iter().all(|&v| (0.0..=1.0).contains(&v)));

        let ones = monthly_climatology(&cell_mask(dates.clone(), |_, _| 1.0));
        assert!(ones.values.iter().all(|&v| v == 1.0));
        let zeros = monthly_climatology(&cell_mask(dates, |_, _| 0.0));
        assert!(zeros.values.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_median_of_repeating_years_equals_pooled_mean() {
        // identical pattern every year: no interannual variability
        let mask = cell_mask(days((2017, 1, 1), 3 * 365), |_, d| {
            (d.ordinal() % 3 == 0) as u8 as f32
        });
        let monthly = monthly_climatology(&mask);
        let extreme = extreme_climatology(&mask, &[0.5]);
        for &month in &monthly.months {
            let pooled = monthly.field(month).unwrap()[[0, 0]];
            let median = extreme.field(month, 0.5).unwrap()[[0, 0]];
            assert!(
                close(median, f64::from(pooled), 1e-6),
                "month {}: median {} pooled {}",
                month,
                median,
                pooled
            );
        }
    }

    #[test]
    fn test_single_year_quantiles_collapse_to_that_year() {
        let mask = cell_mask(days((2020, 1, 1), 366), |t, _| (t % 5 != 0) as u8 as f32);
        let monthly = monthly_climatology(&mask);
        let extreme = extreme_climatology(&mask, &[0.05, 0.5, 0.95]);
        for &month in &monthly.months {
            let mean = monthly.field(month).unwrap()[[0, 0]];
            for q in [0.05, 0.5, 0.95] {
                assert_eq!(extreme.field(month, q).unwrap()[[0, 0]], mean);
            }
        }
    }

    #[test]
    fn test_one_day_window_equals_monthly_frequency() {
        let mask = cell_mask(days((2018, 1, 1), 730), |t, _| ((t / 3) % 2) as f32);
        let monthly = monthly_climatology(&mask);
        let windows = weather_windows(&mask, &[1]);
        assert_eq!(
            windows.values.index_axis(ndarray::Axis(0), 0),
            monthly.values.view()
        );
    }

    #[test]
    fn test_longer_windows_are_never_more_frequent() {
        let mask = cell_mask(days((2018, 1, 1), 730), |t, _| {
            // runs of uneven length
            ((t * t + 3 * t) % 11 < 8) as u8 as f32
        });
        let lengths = [1, 2, 3, 5, 7, 10];
        let windows = weather_windows(&mask, &lengths);
        // months touching the ends of the series lose days to undefined windows
        for month in 2..=11 {
            let values: Vec<f32> = lengths
                .iter()
                .map(|&w| windows.field(w, month).unwrap()[[0, 0]])
                .collect();
            assert!(
                values.windows(2).all(|pair| pair[1] <= pair[0]),
                "month {}: {:?}",
                month,
                values
            );
        }
    }

    #[test]
    fn test_window_edges_are_excluded_not_penalized() {
        // January 1-3 fall outside every 7-day centered window of the series
        let mask = cell_mask(days((2019, 1, 1), 365), |_, _| 1.0);
        let windows = weather_windows(&mask, &[7]);
        assert_eq!(windows.field(7, 1).unwrap()[[0, 0]], 1.0);
        assert_eq!(windows.field(7, 12).unwrap()[[0, 0]], 1.0);
    }

    #[test]
    fn test_area_reduction_single_point_and_bound_order() {
        let axes = GridAxes::new(vec![0.0, 45.0, 80.0], vec![0.0, 1.0]).unwrap();
        let field = ndarray::array![[0.1f32, 0.3], [0.5, 0.7], [0.9, 0.2]];

        let point = AreaBox::new([1.0, 1.0], [80.0, 80.0]);
        let value = area::area_mean(field.view(), &axes, "point", &point).unwrap();
        assert!((value - 0.2).abs() < 1e-6);

        let forward = AreaBox::new([0.0, 1.0], [0.0, 80.0]);
        let reversed = AreaBox::new([1.0, 0.0], [80.0, 0.0]);
        let a = area::area_mean(field.view(), &axes, "box", &forward).unwrap();
        let b = area::area_mean(field.view(), &axes, "box", &reversed).unwrap();
        assert_eq!(a, b);
    }
}

#[cfg(test)]
mod combination_tests {
    use super::*;

    /// Member exceedance flags are the complement of the wanted suitability.
    fn member(name: &str, suitable: &[f32]) -> Member {
        let dates = days((2020, 1, 1), suitable.len());
        let values = Array3::from_shape_fn((suitable.len(), 1, 1), |(t, _, _)| 1.0 - suitable[t]);
        let grid = DailyGrid::new(name, dates, single_cell(), values).unwrap();
        Member::new(Arc::new(grid), Normalization::Indicator)
    }

    #[test]
    fn test_combination_is_elementwise_and() {
        let combined = SuitableConditions::new(
            "both",
            vec![member("a", &[1.0, 1.0, 0.0, 1.0]), member("b", &[1.0, 0.0, 1.0, 1.0])],
            DEFAULT_MISSING_FILL,
        )
        .unwrap()
        .materialize()
        .unwrap();
        let values: Vec<f32> = combined.values.iter().copied().collect();
        assert_eq!(values, vec![1.0, 0.0, 0.0, 1.0]);
    }

    fn write_month(dir: &Path, variable: &str, threshold: f64, flags: &[f32]) -> PathBuf {
        let dates = days((2020, 1, 1), flags.len());
        let axes = single_cell();
        let values = Array4::from_shape_fn((1, flags.len(), 1, 1), |(_, t, _, _)| flags[t]);
        let name = crate::exceedance::exceedance_file_name(
            dates[0],
            *dates.last().unwrap(),
            variable,
            1440,
        );
        let path = dir.join(name);
        dataset::write_exceedance(&path, variable, &[threshold], &dates, &axes, values.view())
            .unwrap();
        path
    }

    #[test]
    fn test_combination_of_exceedance_files() {
        let dir = tempdir().unwrap();
        let ice = write_month(dir.path(), "sithick", 0.05, &[0.0, 0.0, 1.0, f32::NAN]);
        let conc = write_month(dir.path(), "siconc", 0.15, &[0.0, 1.0, 0.0, 0.0]);

        let ice_id = SeriesId::parse("sithick_exceed0.05").unwrap();
        let conc_id = SeriesId::parse("siconc_exceed0.15").unwrap();
        let members = vec![
            Member::new(
                Arc::new(ExceedanceSeries::open(&ice_id, &[ice]).unwrap()),
                Normalization::for_variable(&ice_id.variable),
            ),
            Member::new(
                Arc::new(ExceedanceSeries::open(&conc_id, &[conc]).unwrap()),
                Normalization::for_variable(&conc_id.variable),
            ),
        ];

        let combined = SuitableConditions::new("Ice_free", members, DEFAULT_MISSING_FILL)
            .unwrap()
            .materialize()
            .unwrap();
        assert_eq!(combined.dates, days((2020, 1, 1), 4));
        let values: Vec<f32> = combined.values.iter().copied().collect();
        // the missing day takes the fill value before inversion
        assert_eq!(values, vec![1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_series_from_squeezed_daily_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("2020_01_01_to_2020_01_05_siconc_daily_thresh_exceed.nc");
        let values = Array3::from_shape_vec((5, 1, 1), vec![0.0, 1.0, 0.0, f32::NAN, 1.0]).unwrap();
        let grid = DailyGrid::new("siconc", days((2020, 1, 1), 5), single_cell(), values).unwrap();
        dataset::write_daily(&path, &grid).unwrap();

        let id = SeriesId::parse("siconc_exceed0.15").unwrap();
        let series = ExceedanceSeries::open(&id, &[path]).unwrap();
        let member = Member::new(Arc::new(series), Normalization::for_variable("siconc"));
        let combined = SuitableConditions::new("open_water", vec![member], DEFAULT_MISSING_FILL)
            .unwrap()
            .materialize()
            .unwrap();
        let values: Vec<f32> = combined.values.iter().copied().collect();
        assert_eq!(values, vec![1.0, 0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_missing_fill_zero_treats_gaps_as_suitable() {
        let dates = days((2020, 1, 1), 3);
        let values = Array3::from_shape_vec((3, 1, 1), vec![0.0, f32::NAN, 2.0]).unwrap();
        let grid = DailyGrid::new("10ws", dates, single_cell(), values).unwrap();
        let member = Member::new(Arc::new(grid), Normalization::ClampedFraction);
        let combined = SuitableConditions::new("wind", vec![member], 0.0)
            .unwrap()
            .materialize()
            .unwrap();
        let values: Vec<f32> = combined.values.iter().copied().collect();
        assert_eq!(values, vec![1.0, 1.0, 0.0]);
    }
}

#[cfg(test)]
mod artifact_tests {
    use super::*;

    #[tokio::test]
    async fn test_save_then_load_climatologies() {
        let dir = tempdir().unwrap();
        let data_path = format!("{}/", dir.path().display());
        let years = YearRange::new(2018, 2019).unwrap();

        let mask = cell_mask(days((2018, 1, 1), 730), |t, _| ((t / 4) % 3 != 0) as u8 as f32);
        let request = StatisticsRequest::default();
        let set = ClimatologySet {
            monthly: Some(monthly_climatology(&mask)),
            extreme: Some(extreme_climatology(&mask, &request.quantiles)),
            windows: Some(weather_windows(&mask, &request.windows)),
        };
        save_all(&data_path, "storm", years, &set).await.unwrap();

        assert!(
            dir.path()
                .join("storm_weather_windows_years_2018_2019.nc")
                .exists()
        );
        let loaded = load_all(&data_path, "storm", years).await.unwrap();

        let (saved, back) = (set.monthly.unwrap(), loaded.monthly.unwrap());
        assert_eq!(back.months, saved.months);
        assert_eq!(back.axes, saved.axes);
        assert_eq!(back.values, saved.values);

        let (saved, back) = (set.extreme.unwrap(), loaded.extreme.unwrap());
        assert_eq!(back.quantiles, saved.quantiles);
        assert!(same_or_both_nan(
            back.values.as_slice().unwrap(),
            saved.values.as_slice().unwrap()
        ));

        let (saved, back) = (set.windows.unwrap(), loaded.windows.unwrap());
        assert_eq!(back.windows, saved.windows);
        assert!(same_or_both_nan(
            back.values.as_slice().unwrap(),
            saved.values.as_slice().unwrap()
        ));
    }

    #[tokio::test]
    async fn test_load_missing_artifact_fails() {
        let dir = tempdir().unwrap();
        let data_path = format!("{}/", dir.path().display());
        let years = YearRange::new(2018, 2019).unwrap();
        assert!(load_all(&data_path, "absent", years).await.is_err());
    }
}

#[cfg(test)]
mod workflow_tests {
    use super::*;
    use crate::error::ClimatologyError;
    use crate::pipeline::{RunOptions, run_analysis, run_preprocess};
    use crate::report;
    use polars::prelude::*;

    const LAT: [f64; 2] = [60.0, 61.0];
    const LON: [f64; 2] = [10.0, 11.0];

    /// One year of 6-hourly wind speed; each cell holds a constant value.
    fn write_raw_wind(path: &Path) {
        let n_time = 366 * 4;
        let hours: Vec<f64> = (0..n_time).map(|t| (t * 6) as f64).collect();
        let cell = [[5.0f32, 25.0], [15.0, 15.0]];
        let mut values = Vec::with_capacity(n_time * 4);
        for _ in 0..n_time {
            for row in cell {
                values.extend(row);
            }
        }

        let mut file = netcdf::create(path).unwrap();
        file.add_dimension("time", n_time).unwrap();
        file.add_dimension("lat", LAT.len()).unwrap();
        file.add_dimension("lon", LON.len()).unwrap();
        {
            let mut time = file.add_variable::<f64>("time", &["time"]).unwrap();
            time.put_attribute("units", "hours since 2020-01-01 00:00:00")
                .unwrap();
            time.put_values(hours.as_slice(), ..).unwrap();
        }
        {
            let mut lat = file.add_variable::<f64>("lat", &["lat"]).unwrap();
            lat.put_values(LAT.as_slice(), ..).unwrap();
        }
        {
            let mut lon = file.add_variable::<f64>("lon", &["lon"]).unwrap();
            lon.put_values(LON.as_slice(), ..).unwrap();
        }
        {
            let mut ws = file
                .add_variable::<f32>("10ws", &["time", "lat", "lon"])
                .unwrap();
            ws.put_values(values.as_slice(), ..).unwrap();
        }
    }

    fn config_for(root: &Path) -> AnalysisConfig {
        let yaml = format!(
            r#"
var_exceed:
  10ws:
    limits: ["21", "10"]
threshold_combination:
  storm: ["10ws_exceed21"]
  calm: ["10ws_exceed10"]
years: [2020, 2020]
raw_path: {root}/raw
opa_path: {root}/opa
data_path: {root}/clim/
plot_path: {root}/plots/
windows: [3, 7]
timeseries_areas:
  box:
    name: Test box
    lon_slice: [10.0, 11.0]
    lat_slice: [61.0, 60.0]
dask:
  n_workers: 1
  n_threads: 2
  chunk_lat: 1
  chunk_lon: 1
use_dask: true
visualize: true
preproc:
  10ws:
    file_suffix: _10ws_raw.nc
    thresholds: [10.0, 21.0]
    aggregate: count
    timestep_minutes: 360
"#,
            root = root.display()
        );
        AnalysisConfig::from_yaml(&yaml).unwrap()
    }

    #[tokio::test]
    async fn test_preprocess_then_analyze() {
        let dir = tempdir().unwrap();
        let year_dir = dir.path().join("raw").join("2020");
        std::fs::create_dir_all(&year_dir).unwrap();
        write_raw_wind(&year_dir.join("2020_10ws_raw.nc"));
        let config = config_for(dir.path());
        config.validate().unwrap();

        let pre = run_preprocess(&config).await.unwrap();
        assert_eq!(pre.variables, vec!["10ws".to_string()]);
        assert_eq!(pre.raw_files_read, 1);
        assert_eq!(pre.files_written.len(), 12);
        assert!(
            dir.path()
                .join("opa")
                .join("2020_02_01_to_2020_02_29_10ws_timestep_360_daily_thresh_exceed.nc")
                .exists()
        );

        let summary = run_analysis(&config, RunOptions::default()).await.unwrap();
        assert_eq!(summary.combinations, vec!["calm".to_string(), "storm".to_string()]);
        assert_eq!(summary.artifacts.len(), 6);
        assert_eq!(summary.tiles, 8);
        assert_eq!(summary.reports.len(), 2);

        let years = config.years().unwrap();
        let storm = load_all(&config.data_path, "storm", years).await.unwrap();
        let monthly = storm.monthly.as_ref().unwrap();
        assert_eq!(monthly.months, (1..=12).collect::<Vec<u32>>());
        let expected = [[1.0f32, 0.0], [1.0, 1.0]];
        for &month in &monthly.months {
            let field = monthly.field(month).unwrap();
            for i in 0..2 {
                for j in 0..2 {
                    assert_eq!(field[[i, j]], expected[i][j]);
                }
            }
            let window = storm.windows.as_ref().unwrap().field(7, month).unwrap();
            assert_eq!(window[[0, 0]], 1.0);
            assert_eq!(window[[0, 1]], 0.0);
            // one year only: every quantile is that year's mean
            let low = storm.extreme.as_ref().unwrap().field(month, 0.05).unwrap();
            assert_eq!(low[[1, 0]], 1.0);
        }

        let calm = load_all(&config.data_path, "calm", years).await.unwrap();
        let field = calm.monthly.as_ref().unwrap().field(7).unwrap();
        assert_eq!(field[[0, 0]], 1.0);
        assert_eq!(field[[1, 1]], 0.0);

        let table_path = report::area_report_path(&config.plot_path, "storm");
        let file = std::fs::File::open(&table_path).unwrap();
        let df = ParquetReader::new(file).finish().unwrap();
        assert_eq!(df.height(), 12);
        let w60 = 60f64.to_radians().cos();
        let w61 = 61f64.to_radians().cos();
        let expected_mean = (w60 * 0.5 + w61 * 1.0) / (w60 + w61);
        let means = df.column("mean").unwrap().as_materialized_series().f64().unwrap();
        assert!(means.into_iter().all(|m| (m.unwrap() - expected_mean).abs() < 1e-9));
        assert!(df.column("window_7d").is_ok());
        assert!(df.column("q0.95").is_ok());
    }

    #[tokio::test]
    async fn test_analyze_loads_persisted_climatologies() {
        let dir = tempdir().unwrap();
        let year_dir = dir.path().join("raw").join("2020");
        std::fs::create_dir_all(&year_dir).unwrap();
        write_raw_wind(&year_dir.join("2020_10ws_raw.nc"));
        let mut config = config_for(dir.path());
        run_preprocess(&config).await.unwrap();
        run_analysis(&config, RunOptions::default()).await.unwrap();

        let table_path = report::area_report_path(&config.plot_path, "calm");
        std::fs::remove_file(&table_path).unwrap();

        config.compute_climatologies = false;
        let summary = run_analysis(&config, RunOptions::default()).await.unwrap();
        assert!(summary.artifacts.is_empty());
        assert_eq!(summary.tiles, 0);
        assert!(Path::new(&table_path).exists());
    }

    #[tokio::test]
    async fn test_preprocess_without_raw_files_fails() {
        let dir = tempdir().unwrap();
        let config = config_for(dir.path());
        let err = run_preprocess(&config).await.unwrap_err();
        assert!(matches!(err, ClimatologyError::MissingRawInput { year: 2020, .. }));
    }

    #[tokio::test]
    async fn test_analyze_without_exceedance_files_fails() {
        let dir = tempdir().unwrap();
        let config = config_for(dir.path());
        let err = run_analysis(&config, RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, ClimatologyError::MissingInput { month: 1, .. }));
        assert!(!dir.path().join("clim").exists());
    }
}
