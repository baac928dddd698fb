//! # Suitable-Conditions Combiner
//!
//! Turns the exceedance series named by a combination into one binary
//! "suitable conditions" mask.
//!
//! Each member series is normalized to a boolean "within limits" mask and
//! the masks are AND-ed. Missing values are filled *before* the inversion:
//! with the default fill of `1.0` a missing day reads as "limit exceeded"
//! and therefore unsuitable, which is the behavior of the historical
//! processing chain. The fill is configurable (`missing_fill`).

use crate::error::{ClimatologyError, Result};
use crate::grid::{DailyGrid, GridAxes, Tile, TileSource};
use chrono::NaiveDate;
use log::{debug, warn};
use ndarray::{Array3, Axis, Zip};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Fill applied to missing values before inversion.
pub const DEFAULT_MISSING_FILL: f32 = 1.0;

/// How a member series is turned into a "within limits" boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// Values are fractions or counts of exceeding sub-daily samples; values
    /// at or above 1 are clamped to 1 and the day is suitable when `1 - v`
    /// is nonzero.
    ClampedFraction,
    /// Values are exceedance flags; the day is suitable when the flag is 0.
    Indicator,
}

impl Normalization {
    /// Wind-speed variables (names containing `ws`) carry sub-daily counts.
    pub fn for_variable(variable: &str) -> Self {
        if variable.contains("ws") {
            Normalization::ClampedFraction
        } else {
            Normalization::Indicator
        }
    }

    pub fn is_suitable(&self, value: f32, fill: f32) -> bool {
        match self {
            Normalization::ClampedFraction => {
                let v = if value.is_nan() { fill } else { value.min(1.0) };
                1.0 - v != 0.0
            }
            Normalization::Indicator => {
                let v = if value.is_nan() { fill } else { value };
                v == 0.0
            }
        }
    }
}

/// Identifier of one (variable, threshold) series, written
/// `<variable>_exceed<limit>` (e.g. `10ws_exceed21`, `sithick_exceed0.05`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesId {
    pub variable: String,
    pub limit: String,
}

impl SeriesId {
    pub fn new(variable: &str, limit: &str) -> Self {
        SeriesId {
            variable: variable.to_string(),
            limit: limit.to_string(),
        }
    }

    pub fn parse(id: &str) -> Result<Self> {
        match id.rsplit_once("_exceed") {
            Some((variable, limit)) if !variable.is_empty() && !limit.is_empty() => {
                Ok(SeriesId::new(variable, limit))
            }
            _ => Err(ClimatologyError::config(format!(
                "series '{}' is not of the form <variable>_exceed<limit>",
                id
            ))),
        }
    }

    /// Numeric threshold value of the limit label.
    pub fn threshold(&self) -> Result<f64> {
        self.limit.trim().parse::<f64>().map_err(|_| {
            ClimatologyError::config(format!("limit '{}' of '{}' is not numeric", self.limit, self))
        })
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_exceed{}", self.variable, self.limit)
    }
}

/// One input of a combination.
#[derive(Clone)]
pub struct Member {
    pub source: Arc<dyn TileSource>,
    pub normalization: Normalization,
}

impl Member {
    pub fn new(source: Arc<dyn TileSource>, normalization: Normalization) -> Self {
        Member {
            source,
            normalization,
        }
    }
}

/// Lazily evaluated AND of the normalized member masks.
///
/// The time axis runs day by day over the span every member covers. A day
/// inside that span that a member has no record of reads as missing for
/// that member and takes the fill value. The spatial grid must be identical
/// across members.
pub struct SuitableConditions {
    name: String,
    members: Vec<Member>,
    dates: Vec<NaiveDate>,
    axes: GridAxes,
    /// Per member, the member's time index of every combined date.
    positions: Vec<Vec<Option<usize>>>,
    fill: f32,
}

impl SuitableConditions {
    pub fn new(name: &str, members: Vec<Member>, fill: f32) -> Result<Self> {
        let first = members.first().ok_or_else(|| {
            ClimatologyError::config(format!("combination '{}' has no members", name))
        })?;
        let axes = first.source.axes().clone();
        for member in &members[1..] {
            axes.ensure_matches(member.source.axes(), first.source.name(), member.source.name())?;
        }

        let no_shared_dates = || {
            ClimatologyError::TimeAxis(format!("members of combination '{}' share no dates", name))
        };
        let mut span: Option<(NaiveDate, NaiveDate)> = None;
        for member in &members {
            let own = member.source.dates();
            let (Some(&lo), Some(&hi)) = (own.first(), own.last()) else {
                return Err(no_shared_dates());
            };
            span = Some(match span {
                Some((start, end)) => (start.max(lo), end.min(hi)),
                None => (lo, hi),
            });
        }
        let (start, end) = span.ok_or_else(no_shared_dates)?;
        if start > end {
            return Err(no_shared_dates());
        }
        let dates: Vec<NaiveDate> = start.iter_days().take_while(|d| *d <= end).collect();

        let mut positions = Vec::with_capacity(members.len());
        for member in &members {
            let own = member.source.dates();
            let index: Vec<Option<usize>> =
                dates.iter().map(|d| own.binary_search(d).ok()).collect();
            let present = index.iter().flatten().count();
            if present < own.len() {
                warn!(
                    "'{}': {} of {} dates of '{}' fall outside the span shared by every member and are dropped",
                    name,
                    own.len() - present,
                    own.len(),
                    member.source.name()
                );
            }
            if present < dates.len() {
                warn!(
                    "'{}': '{}' has no record of {} days between {} and {}, they take the fill value {}",
                    name,
                    member.source.name(),
                    dates.len() - present,
                    start,
                    end,
                    fill
                );
            }
            positions.push(index);
        }

        debug!(
            "combination '{}': {} members, {} days",
            name,
            members.len(),
            dates.len()
        );

        Ok(SuitableConditions {
            name: name.to_string(),
            members,
            dates,
            axes,
            positions,
            fill,
        })
    }

    /// Evaluates the whole mask in memory.
    pub fn materialize(&self) -> Result<DailyGrid> {
        let (n_lat, n_lon) = self.axes.shape();
        let whole = Tile {
            lat: 0..n_lat,
            lon: 0..n_lon,
        };
        let values = self.read_tile(&whole)?;
        DailyGrid::new(&self.name, self.dates.clone(), self.axes.clone(), values)
    }
}

impl TileSource for SuitableConditions {
    fn name(&self) -> &str {
        &self.name
    }

    fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    fn axes(&self) -> &GridAxes {
        &self.axes
    }

    fn read_tile(&self, tile: &Tile) -> Result<Array3<f32>> {
        let (n_lat, n_lon) = tile.shape();
        let mut mask = Array3::<f32>::ones((self.dates.len(), n_lat, n_lon));
        for (member, positions) in self.members.iter().zip(&self.positions) {
            let block = member.source.read_tile(tile)?;
            let absent_is_suitable = member.normalization.is_suitable(f32::NAN, self.fill);
            for (t, own_t) in positions.iter().enumerate() {
                let mut plane = mask.index_axis_mut(Axis(0), t);
                match own_t {
                    Some(own_t) => Zip::from(&mut plane)
                        .and(block.index_axis(Axis(0), *own_t))
                        .for_each(|m, &v| {
                            if *m == 1.0 && !member.normalization.is_suitable(v, self.fill) {
                                *m = 0.0;
                            }
                        }),
                    None if !absent_is_suitable => plane.fill(0.0),
                    None => {}
                }
            }
        }
        Ok(mask)
    }
}
