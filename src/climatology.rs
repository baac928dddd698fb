//! # Climatology Kernels
//!
//! Pure block-wise reductions from a daily suitable-conditions mask to
//! monthly statistics:
//!
//! - [`monthly_mean`]: fraction of days per calendar month, pooled over years
//! - [`extreme_quantiles`]: per-year monthly means, then interannual quantiles
//! - [`window_frequency`]: fraction of days lying in a fully suitable
//!   centered window of each requested length
//!
//! Every kernel takes one `(time, lat, lon)` block and a [`CalendarIndex`]
//! built once from the time axis, and returns arrays with the spatial axes
//! last. Cells never interact, so the same kernels run on a whole grid or on
//! any spatial tile and give identical values.

use crate::grid::{DailyGrid, ExtremeClimatology, MonthlyClimatology, Tile, WeatherWindows};
use chrono::{Datelike, NaiveDate};
use ndarray::{Array2, Array3, Array4, ArrayView1, ArrayView3, ArrayViewMut1, Axis, Zip, s};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Default interannual quantiles: bad, median and good year.
pub const DEFAULT_QUANTILES: [f64; 3] = [0.05, 0.5, 0.95];

/// Default weather-window lengths in days.
pub const DEFAULT_WINDOWS: [usize; 3] = [3, 5, 7];

/// The statistics persisted for each combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatisticKind {
    Climatology,
    ExtremeClimatology,
    WeatherWindows,
}

impl StatisticKind {
    pub const ALL: [StatisticKind; 3] = [
        StatisticKind::Climatology,
        StatisticKind::ExtremeClimatology,
        StatisticKind::WeatherWindows,
    ];

    /// Tag used in artifact file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatisticKind::Climatology => "climatology",
            StatisticKind::ExtremeClimatology => "extreme_climatology",
            StatisticKind::WeatherWindows => "weather_windows",
        }
    }
}

impl fmt::Display for StatisticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time indices grouped by calendar month, and by year within each month.
#[derive(Debug, Clone)]
pub struct CalendarIndex {
    months: Vec<u32>,
    by_month: Vec<Vec<usize>>,
    by_month_year: Vec<Vec<(i32, Vec<usize>)>>,
}

impl CalendarIndex {
    pub fn new(dates: &[NaiveDate]) -> Self {
        let mut grouped: BTreeMap<u32, BTreeMap<i32, Vec<usize>>> = BTreeMap::new();
        for (t, date) in dates.iter().enumerate() {
            grouped
                .entry(date.month())
                .or_default()
                .entry(date.year())
                .or_default()
                .push(t);
        }

        let mut months = Vec::with_capacity(grouped.len());
        let mut by_month = Vec::with_capacity(grouped.len());
        let mut by_month_year = Vec::with_capacity(grouped.len());
        for (month, years) in grouped {
            months.push(month);
            by_month.push(years.values().flatten().copied().collect());
            by_month_year.push(years.into_iter().collect());
        }

        CalendarIndex {
            months,
            by_month,
            by_month_year,
        }
    }

    /// Calendar months present in the data, ascending.
    pub fn months(&self) -> &[u32] {
        &self.months
    }

    /// Smallest number of distinct years contributing to any month.
    pub fn min_years(&self) -> usize {
        self.by_month_year.iter().map(Vec::len).min().unwrap_or(0)
    }
}

/// Quantile with linear interpolation between order statistics (type 7).
///
/// Expects sorted, non-empty input.
pub fn quantile_type7(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    let h = (n - 1) as f64 * q;
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    sorted[lo] + (h - h.floor()) * (sorted[hi] - sorted[lo])
}

/// NaN-skipping mean over the selected time indices of a block.
fn nanmean_over(block: ArrayView3<'_, f32>, indices: &[usize]) -> Array2<f32> {
    let (_, n_lat, n_lon) = block.dim();
    let mut sum = Array2::<f64>::zeros((n_lat, n_lon));
    let mut count = Array2::<u32>::zeros((n_lat, n_lon));
    for &t in indices {
        Zip::from(&mut sum)
            .and(&mut count)
            .and(block.index_axis(Axis(0), t))
            .for_each(|s, c, &v| {
                if !v.is_nan() {
                    *s += f64::from(v);
                    *c += 1;
                }
            });
    }
    Zip::from(&sum).and(&count).map_collect(|&s, &c| {
        if c == 0 {
            f32::NAN
        } else {
            (s / f64::from(c)) as f32
        }
    })
}

/// Mean per calendar month over all years. Output (month, lat, lon).
pub fn monthly_mean(block: ArrayView3<'_, f32>, index: &CalendarIndex) -> Array3<f32> {
    let (_, n_lat, n_lon) = block.dim();
    let mut out = Array3::<f32>::from_elem((index.months.len(), n_lat, n_lon), f32::NAN);
    for (m, indices) in index.by_month.iter().enumerate() {
        out.slice_mut(s![m, .., ..])
            .assign(&nanmean_over(block, indices));
    }
    out
}

/// Interannual quantiles of the per-year monthly mean.
/// Output (month, quantile, lat, lon).
///
/// Years whose month has no valid sample are left out of the quantile
/// sample; a cell with no valid year is NaN. With a single year every
/// quantile equals that year's mean.
pub fn extreme_quantiles(
    block: ArrayView3<'_, f32>,
    index: &CalendarIndex,
    quantiles: &[f64],
) -> Array4<f32> {
    let (_, n_lat, n_lon) = block.dim();
    let mut out =
        Array4::<f32>::from_elem((index.months.len(), quantiles.len(), n_lat, n_lon), f32::NAN);

    for (m, years) in index.by_month_year.iter().enumerate() {
        let year_means: Vec<Array2<f32>> = years
            .iter()
            .map(|(_, indices)| nanmean_over(block, indices))
            .collect();

        let mut sample = Vec::with_capacity(year_means.len());
        for i in 0..n_lat {
            for j in 0..n_lon {
                sample.clear();
                sample.extend(
                    year_means
                        .iter()
                        .map(|ym| f64::from(ym[[i, j]]))
                        .filter(|v| !v.is_nan()),
                );
                if sample.is_empty() {
                    continue;
                }
                sample.sort_by(f64::total_cmp);
                for (k, &q) in quantiles.iter().enumerate() {
                    out[[m, k, i, j]] = quantile_type7(&sample, q) as f32;
                }
            }
        }
    }
    out
}

/// Marks each day 1 when the centered window of length `window` around it
/// is entirely suitable, 0 when it is not, and NaN when the window is not
/// fully available or holds a missing value.
///
/// The window of day `i` spans `[i - window/2, i - window/2 + window - 1]`.
fn mark_full_windows(series: ArrayView1<'_, f32>, window: usize, mut out: ArrayViewMut1<'_, f32>) {
    out.fill(f32::NAN);
    let n = series.len();
    if window == 0 || window > n {
        return;
    }
    let half = window / 2;

    // (suitable, missing) contribution of one day
    let classify = |v: f32| -> (usize, usize) {
        if v.is_nan() {
            (0, 1)
        } else if v == 1.0 {
            (1, 0)
        } else {
            (0, 0)
        }
    };

    let (mut ones, mut missing) = (0usize, 0usize);
    for &v in series.slice(s![..window]) {
        let (o, m) = classify(v);
        ones += o;
        missing += m;
    }
    for start in 0..=(n - window) {
        if start > 0 {
            let (o, m) = classify(series[start - 1]);
            ones -= o;
            missing -= m;
            let (o, m) = classify(series[start + window - 1]);
            ones += o;
            missing += m;
        }
        out[start + half] = if missing > 0 {
            f32::NAN
        } else if ones == window {
            1.0
        } else {
            0.0
        };
    }
}

/// Monthly frequency of days inside a fully suitable window, per window
/// length. Output (window, month, lat, lon).
pub fn window_frequency(
    block: ArrayView3<'_, f32>,
    index: &CalendarIndex,
    windows: &[usize],
) -> Array4<f32> {
    let (_, n_lat, n_lon) = block.dim();
    let mut out =
        Array4::<f32>::from_elem((windows.len(), index.months.len(), n_lat, n_lon), f32::NAN);
    let mut indicator = Array3::<f32>::zeros(block.raw_dim());

    for (w, &window) in windows.iter().enumerate() {
        Zip::from(indicator.lanes_mut(Axis(0)))
            .and(block.lanes(Axis(0)))
            .for_each(|marks, series| mark_full_windows(series, window, marks));
        out.slice_mut(s![w, .., .., ..])
            .assign(&monthly_mean(indicator.view(), index));
    }
    out
}

/// Monthly climatology of an in-memory grid.
pub fn monthly_climatology(grid: &DailyGrid) -> MonthlyClimatology {
    let index = CalendarIndex::new(&grid.dates);
    MonthlyClimatology {
        months: index.months().to_vec(),
        axes: grid.axes.clone(),
        values: monthly_mean(grid.values.view(), &index),
    }
}

/// Interannual extreme climatology of an in-memory grid.
pub fn extreme_climatology(grid: &DailyGrid, quantiles: &[f64]) -> ExtremeClimatology {
    let index = CalendarIndex::new(&grid.dates);
    ExtremeClimatology {
        months: index.months().to_vec(),
        quantiles: quantiles.to_vec(),
        axes: grid.axes.clone(),
        values: extreme_quantiles(grid.values.view(), &index, quantiles),
    }
}

/// Weather-window climatology of an in-memory grid.
pub fn weather_windows(grid: &DailyGrid, windows: &[usize]) -> WeatherWindows {
    let index = CalendarIndex::new(&grid.dates);
    WeatherWindows {
        windows: windows.to_vec(),
        months: index.months().to_vec(),
        axes: grid.axes.clone(),
        values: window_frequency(grid.values.view(), &index, windows),
    }
}

/// Statistics of one spatial tile.
#[derive(Debug, Clone)]
pub struct TileStatistics {
    pub tile: Tile,
    pub monthly: Option<Array3<f32>>,
    pub extreme: Option<Array4<f32>>,
    pub windows: Option<Array4<f32>>,
}

/// Which statistics to compute, and with which parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticsRequest {
    pub kinds: Vec<StatisticKind>,
    pub quantiles: Vec<f64>,
    pub windows: Vec<usize>,
}

impl Default for StatisticsRequest {
    fn default() -> Self {
        StatisticsRequest {
            kinds: StatisticKind::ALL.to_vec(),
            quantiles: DEFAULT_QUANTILES.to_vec(),
            windows: DEFAULT_WINDOWS.to_vec(),
        }
    }
}

impl StatisticsRequest {
    pub fn wants(&self, kind: StatisticKind) -> bool {
        self.kinds.contains(&kind)
    }
}

/// Runs every requested kernel on one tile's mask block.
pub fn compute_tile(
    tile: Tile,
    block: ArrayView3<'_, f32>,
    index: &CalendarIndex,
    request: &StatisticsRequest,
) -> TileStatistics {
    TileStatistics {
        monthly: request
            .wants(StatisticKind::Climatology)
            .then(|| monthly_mean(block, index)),
        extreme: request
            .wants(StatisticKind::ExtremeClimatology)
            .then(|| extreme_quantiles(block, index, &request.quantiles)),
        windows: request
            .wants(StatisticKind::WeatherWindows)
            .then(|| window_frequency(block, index, &request.windows)),
        tile,
    }
}
