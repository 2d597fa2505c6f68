//! Per-file time ranges and their common overlap.

use crate::axes::{self, AxisRole};
use crate::calendar::{CalendarFamily, CivilDate, TimeAxisValues, TimeUnits};
use crate::dataset::{self, Dataset};
use crate::error::{ExtractError, Result};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OverlapStatus {
    /// All files with a time axis share at least one day.
    Common,
    /// No file had a usable time axis.
    NoValidFiles,
    /// The latest start falls after the earliest end.
    Disjoint,
}

/// Intersection of several per-file time ranges. `start` and `end` are set
/// only when the status is [`OverlapStatus::Common`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Overlap {
    pub start: Option<CivilDate>,
    pub end: Option<CivilDate>,
    pub status: OverlapStatus,
}

impl Overlap {
    pub fn window(&self) -> Option<(CivilDate, CivilDate)> {
        self.start.zip(self.end)
    }
}

/// Calendar family declared by a time variable's `calendar` attribute.
pub fn calendar_of(ds: &Dataset, name: &str) -> CalendarFamily {
    CalendarFamily::from_calendar_name(ds.attr_string(name, "calendar").as_deref().unwrap_or(""))
}

/// Decode a whole time variable.
pub fn read_time_axis(ds: &Dataset, name: &str) -> Result<TimeAxisValues> {
    let units = ds
        .attr_string(name, "units")
        .ok_or_else(|| ExtractError::InvalidTimeUnits(String::new()))?;
    let units = TimeUnits::parse(&units)?;
    let raw = ds.read_all(name)?;
    Ok(TimeAxisValues::decode(&raw, &units, calendar_of(ds, name)))
}

/// Earliest and latest date on the dataset's time axis, or `None` when there
/// is no time axis or it holds no decodable values.
pub fn time_range(ds: &Dataset) -> Option<(CivilDate, CivilDate)> {
    let name = axes::resolve_axis(ds, AxisRole::Time)?;

    let units = match ds.attr_string(&name, "units").map(|u| TimeUnits::parse(&u)) {
        Some(Ok(units)) => units,
        Some(Err(e)) => {
            warn!(dataset = ds.name(), axis = %name, "{e}");
            return None;
        }
        None => {
            warn!(dataset = ds.name(), axis = %name, "time axis has no units");
            return None;
        }
    };
    let raw = match ds.read_all(&name) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(dataset = ds.name(), axis = %name, "{e}");
            return None;
        }
    };
    let family = calendar_of(ds, &name);

    // Decoding is monotonic, so the raw extremes decode to the date extremes.
    let finite = raw.iter().copied().filter(|v| v.is_finite());
    let (lo, hi) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if lo <= hi {
        if let (Some(first), Some(last)) = (units.decode(family, lo), units.decode(family, hi)) {
            return Some((first.date(), last.date()));
        }
    }

    debug!(dataset = ds.name(), "scanning every time value");
    let values = TimeAxisValues::decode(&raw, &units, family);
    let dates: Vec<CivilDate> = (0..values.len()).filter_map(|i| values.date_at(i)).collect();
    Some((*dates.iter().min()?, *dates.iter().max()?))
}

/// Time range of the dataset at `path`. Files that fail to open count as
/// having no time axis.
pub fn per_file_range(path: &Path) -> Option<(CivilDate, CivilDate)> {
    match dataset::open_dataset(path) {
        Ok(ds) => {
            let range = time_range(&ds);
            debug!(path = %path.display(), ?range, "time range");
            range
        }
        Err(e) => {
            warn!("{e}");
            None
        }
    }
}

/// Intersect per-file ranges, ignoring files without one. The result does
/// not depend on the order of the input.
pub fn fold_overlap<I>(ranges: I) -> Overlap
where
    I: IntoIterator<Item = Option<(CivilDate, CivilDate)>>,
{
    let mut latest_start: Option<CivilDate> = None;
    let mut earliest_end: Option<CivilDate> = None;

    for (start, end) in ranges.into_iter().flatten() {
        latest_start = Some(latest_start.map_or(start, |s| s.max(start)));
        earliest_end = Some(earliest_end.map_or(end, |e| e.min(end)));
    }

    match (latest_start, earliest_end) {
        (Some(start), Some(end)) if start <= end => Overlap {
            start: Some(start),
            end: Some(end),
            status: OverlapStatus::Common,
        },
        (Some(_), Some(_)) => Overlap {
            start: None,
            end: None,
            status: OverlapStatus::Disjoint,
        },
        _ => Overlap {
            start: None,
            end: None,
            status: OverlapStatus::NoValidFiles,
        },
    }
}

/// Common time window of every file in `paths`.
pub fn overlap<P: AsRef<Path>>(paths: &[P]) -> Overlap {
    fold_overlap(paths.iter().map(|p| per_file_range(p.as_ref())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::MemorySource;
    use crate::metadata::AttributeValue;

    fn d(s: &str) -> CivilDate {
        s.parse().unwrap()
    }

    fn time_dataset(values: Vec<f64>, units: &str, calendar: &str) -> Dataset {
        Dataset::new(
            "mem",
            MemorySource::new()
                .with_coord("time", values)
                .with_attr("time", "units", AttributeValue::String(units.to_string()))
                .with_attr("time", "calendar", AttributeValue::String(calendar.to_string())),
        )
    }

    #[test]
    fn test_overlap_of_two_ranges() {
        let a = Some((d("2000-01-01"), d("2010-12-31")));
        let b = Some((d("2005-06-01"), d("2020-01-01")));

        let overlap = fold_overlap([a, b]);
        assert_eq!(overlap.status, OverlapStatus::Common);
        assert_eq!(overlap.window(), Some((d("2005-06-01"), d("2010-12-31"))));
        assert_eq!(fold_overlap([b, None, a]), overlap);
    }

    #[test]
    fn test_disjoint_ranges() {
        let a = Some((d("2000-01-01"), d("2001-01-01")));
        let b = Some((d("2005-01-01"), d("2006-01-01")));
        let overlap = fold_overlap([a, b]);
        assert_eq!(overlap.status, OverlapStatus::Disjoint);
        assert_eq!(overlap.window(), None);
    }

    #[test]
    fn test_no_valid_files() {
        assert_eq!(fold_overlap(Vec::new()).status, OverlapStatus::NoValidFiles);
        assert_eq!(fold_overlap([None, None]).status, OverlapStatus::NoValidFiles);
    }

    #[test]
    fn test_time_range_standard_calendar() {
        let ds = time_dataset(vec![31.0, 0.0, 365.0], "days since 2000-01-01", "standard");
        assert_eq!(time_range(&ds), Some((d("2000-01-01"), d("2000-12-31"))));
    }

    #[test]
    fn test_time_range_360_day_calendar() {
        let ds = time_dataset(vec![0.0, 59.0], "days since 2000-01-01", "360_day");
        assert_eq!(time_range(&ds), Some((d("2000-01-01"), d("2000-02-30"))));
    }

    #[test]
    fn test_time_range_ignores_missing_values() {
        let ds = time_dataset(vec![f64::NAN, 10.0, 20.0], "days since 2000-01-01", "noleap");
        assert_eq!(time_range(&ds), Some((d("2000-01-11"), d("2000-01-21"))));
    }

    #[test]
    fn test_no_time_axis() {
        let ds = Dataset::new("mem", MemorySource::new().with_coord("lat", vec![1.0, 2.0]));
        assert_eq!(time_range(&ds), None);

        let ds = time_dataset(vec![0.0], "not a unit", "standard");
        assert_eq!(time_range(&ds), None);
    }

    #[test]
    fn test_read_time_axis_requires_units() {
        let ds = Dataset::new("mem", MemorySource::new().with_coord("time", vec![0.0]));
        assert!(matches!(
            read_time_axis(&ds, "time"),
            Err(ExtractError::InvalidTimeUnits(_))
        ));
    }
}
