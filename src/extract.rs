//! Extraction of one dataset into a table file.

use crate::axes::{self, AxisRole};
use crate::calendar::{CalendarTarget, CivilDate, TimeAxisValues, to_axis_time};
use crate::dataset::{self, Dataset};
use crate::error::{ExtractError, Result};
use crate::events::{EventSink, ExtractEvent};
use crate::sink::{self, SinkFormat};
use crate::spatial::{self, BoundingBox, SpatialAxes};
use crate::table::{self, ChunkSizes, MaterializePlan, Selection};
use crate::time_range;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// Inclusive date window applied to the time axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: CivilDate,
    pub end: CivilDate,
}

impl TimeWindow {
    pub fn new(start: CivilDate, end: CivilDate) -> Result<Self> {
        let window = Self { start, end };
        window.validate()?;
        Ok(window)
    }

    pub fn validate(&self) -> Result<()> {
        if self.start > self.end {
            return Err(ExtractError::InvalidParameter(format!(
                "time window starts after it ends ({} > {})",
                self.start, self.end
            )));
        }
        Ok(())
    }
}

/// Result of an optional pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome<T> {
    Applied(T),
    /// The dataset lacks what the stage needs; nothing was changed.
    Unavailable(String),
    /// The stage was possible but could not be applied; nothing was changed.
    Degraded(String),
}

impl<T> StageOutcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, StageOutcome::Applied(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// An output for this source already exists.
    Existing(PathBuf),
    NoCoordinates,
    /// Fewer than two latitude or longitude values fall inside the box.
    InsufficientNodes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    Written {
        path: PathBuf,
        format: SinkFormat,
        rows: usize,
        elapsed: Duration,
    },
    Skipped(SkipReason),
    Failed(String),
}

/// What happened to one source. Stage fields are `None` when the stage was
/// not requested or not reached.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeRecord {
    pub source: PathBuf,
    pub outcome: FileOutcome,
    pub time_slice: Option<StageOutcome<TimeWindow>>,
    pub band: Option<StageOutcome<String>>,
}

impl OutcomeRecord {
    fn new(source: &Path, outcome: FileOutcome) -> Self {
        Self {
            source: source.to_path_buf(),
            outcome,
            time_slice: None,
            band: None,
        }
    }
}

/// Everything needed to extract one source.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionJob {
    pub source: PathBuf,
    pub save_root: PathBuf,
    pub bbox: BoundingBox,
    pub time_window: Option<TimeWindow>,
    pub band_filter: Option<String>,
    /// Columns to keep, in order. Empty keeps everything.
    pub columns: Vec<String>,
    pub chunks: ChunkSizes,
    pub skip_existing: bool,
}

impl ExtractionJob {
    /// Where the table for this job goes in `format`.
    pub fn output_path(&self, format: SinkFormat) -> PathBuf {
        sink::output_path(&self.save_root, &self.source, format)
    }

    pub fn file_name(&self) -> String {
        self.source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.source.display().to_string())
    }
}

/// Render an error with its `source()` chain.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(&format!("\n  Caused by: {cause}"));
        source = cause.source();
    }
    out
}

/// Extract one Zarr store.
pub fn extract(job: &ExtractionJob, events: &mut dyn EventSink) -> OutcomeRecord {
    extract_with(job, &|path: &Path| dataset::open_dataset(path), events)
}

/// Extract one source, opening it with `opener`.
pub fn extract_with(
    job: &ExtractionJob,
    opener: &dyn Fn(&Path) -> Result<Dataset>,
    events: &mut dyn EventSink,
) -> OutcomeRecord {
    let name = job.file_name();

    let out_dir = sink::output_dir(&job.save_root, &job.source);
    if let Err(e) = std::fs::create_dir_all(&out_dir) {
        let message = format!("Error processing {name}:\n{}", error_chain(&ExtractError::from(e)));
        events.error(message.clone());
        return OutcomeRecord::new(&job.source, FileOutcome::Failed(message));
    }

    if job.skip_existing {
        if let Some(existing) = sink::existing_output(&job.save_root, &job.source) {
            events.info(format!("Skipping existing: {}", sink::source_stem(&job.source)));
            return OutcomeRecord::new(&job.source, FileOutcome::Skipped(SkipReason::Existing(existing)));
        }
    }

    events.info(format!("Opening: {name}"));
    events.emit(ExtractEvent::Busy(true));
    let started = Instant::now();

    let mut record = OutcomeRecord::new(&job.source, FileOutcome::Failed(String::new()));
    match run_pipeline(job, opener, events, started, &mut record) {
        Ok(outcome) => record.outcome = outcome,
        Err(e) => {
            events.emit(ExtractEvent::Busy(false));
            let message = format!("Error processing {name}:\n{}", error_chain(&e));
            events.error(message.clone());
            record.outcome = FileOutcome::Failed(message);
        }
    }
    record
}

fn run_pipeline(
    job: &ExtractionJob,
    opener: &dyn Fn(&Path) -> Result<Dataset>,
    events: &mut dyn EventSink,
    started: Instant,
    record: &mut OutcomeRecord,
) -> Result<FileOutcome> {
    job.bbox.validate()?;
    let ds = opener(&job.source)?;
    let name = job.file_name();
    let mut selection_dims = std::collections::BTreeMap::new();

    if let Some(window) = &job.time_window {
        let outcome = slice_time(&ds, window);
        match &outcome {
            StageOutcome::Applied(slice) => {
                events.info(format!("Sliced time: {} to {}", slice.start_label, slice.end_label));
                selection_dims.insert(slice.dim.clone(), slice.positions.clone());
            }
            StageOutcome::Unavailable(reason) => {
                debug!(dataset = %name, "time slice unavailable: {reason}");
            }
            StageOutcome::Degraded(reason) => events.warn(reason.clone()),
        }
        record.time_slice = Some(match outcome {
            StageOutcome::Applied(_) => StageOutcome::Applied(*window),
            StageOutcome::Unavailable(r) => StageOutcome::Unavailable(r),
            StageOutcome::Degraded(r) => StageOutcome::Degraded(r),
        });
    }

    events.emit(ExtractEvent::Busy(false));

    let Some(axes) = SpatialAxes::resolve(&ds) else {
        events.info(format!("Skipping {name}: Could not find lat/lon coordinates."));
        return Ok(FileOutcome::Skipped(SkipReason::NoCoordinates));
    };

    let band = axes::discover_band(&ds);
    if let Some(wanted) = &job.band_filter {
        let outcome = filter_band(&ds, band.as_ref(), wanted);
        match &outcome {
            StageOutcome::Applied((dim, positions)) => {
                events.info(format!("Filtered band: {} = {wanted}", band.as_ref().map_or("", |b| b.name.as_str())));
                selection_dims.insert(dim.clone(), positions.clone());
            }
            StageOutcome::Unavailable(reason) | StageOutcome::Degraded(reason) => {
                events.warn(format!("{reason} in {name}; keeping all bands."));
            }
        }
        record.band = Some(match outcome {
            StageOutcome::Applied(_) => StageOutcome::Applied(wanted.clone()),
            StageOutcome::Unavailable(r) => StageOutcome::Unavailable(r),
            StageOutcome::Degraded(r) => StageOutcome::Degraded(r),
        });
    }

    let spatial = spatial::select_spatial(&ds, &axes, &job.bbox)?;
    if !spatial.is_sufficient() {
        events.info(format!("Insufficient nodes in {name}; skipping."));
        return Ok(FileOutcome::Skipped(SkipReason::InsufficientNodes));
    }

    let mut selection = Selection::new(spatial);
    selection.dim_index = selection_dims;
    let plan = MaterializePlan {
        time_name: axes::resolve_axis(&ds, AxisRole::Time),
        band_name: band.map(|b| b.name),
        chunks: job.chunks,
    };

    debug!(dataset = %name, "building table");
    let mut table = table::materialize(&ds, &selection, &plan)?;
    drop(ds);

    table.rename_spatial(&axes.lat, &axes.lon);
    if !job.columns.is_empty() && table.project(&job.columns) == 0 {
        events.warn(format!("None of the selected columns exist in {name}; keeping all columns."));
    }
    table.stringify_calendar_columns();

    let rows = table.row_count();
    let format = SinkFormat::for_rows(rows);
    if format == SinkFormat::DelimitedText {
        events.info("Data exceeds Excel limit. Switching to CSV.".to_string());
    }
    let path = job.output_path(format);
    sink::write_table(&table, &path, format)?;

    let elapsed = started.elapsed();
    events.info(format!(
        "Saved {} in {:.1}s",
        path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default(),
        elapsed.as_secs_f64()
    ));

    Ok(FileOutcome::Written {
        path,
        format,
        rows,
        elapsed,
    })
}

/// Positions on the time axis inside a window.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSlice {
    pub dim: String,
    pub positions: Vec<usize>,
    pub start_label: String,
    pub end_label: String,
}

/// Select the time positions inside `window`. Window endpoints become
/// midnight values in the axis's own calendar, so both ends are inclusive.
pub fn slice_time(ds: &Dataset, window: &TimeWindow) -> StageOutcome<TimeSlice> {
    let Some(time_name) = axes::resolve_axis(ds, AxisRole::Time) else {
        return StageOutcome::Unavailable("no time coordinate".to_string());
    };
    let dim = match ds.variable(&time_name).map(|v| v.dimension_names()) {
        Ok(dims) if dims.len() == 1 => dims[0].to_string(),
        _ => {
            return StageOutcome::Degraded(format!(
                "Failed to slice time for {}: '{time_name}' is not one-dimensional",
                ds.name()
            ));
        }
    };

    let axis = match time_range::read_time_axis(ds, &time_name) {
        Ok(axis) => axis,
        Err(e) => return StageOutcome::Degraded(format!("Failed to slice time for {}: {e}", ds.name())),
    };

    let cannot_convert = || {
        StageOutcome::Degraded(format!(
            "Warning: Could not convert dates for {}. Skipping time slice.",
            ds.name()
        ))
    };

    match &axis {
        TimeAxisValues::Timestamps(values) => {
            let midnight = |d: CivilDate| {
                NaiveDate::from_ymd_opt(d.year, d.month, d.day).and_then(|d| d.and_hms_opt(0, 0, 0))
            };
            let (Some(start), Some(end)) = (midnight(window.start), midnight(window.end)) else {
                return cannot_convert();
            };
            let positions = values
                .iter()
                .enumerate()
                .filter(|(_, t)| t.is_some_and(|t| t >= start && t <= end))
                .map(|(i, _)| i)
                .collect();
            StageOutcome::Applied(TimeSlice {
                dim,
                positions,
                start_label: start.to_string(),
                end_label: end.to_string(),
            })
        }
        TimeAxisValues::Calendar(values) => {
            let Some(sample) = axis.sample() else {
                return cannot_convert();
            };
            let convert = |d| to_axis_time(d, CalendarTarget::Sample(sample));
            let (Some(start), Some(end)) = (convert(window.start), convert(window.end)) else {
                return cannot_convert();
            };
            let positions = values
                .iter()
                .enumerate()
                .filter(|(_, t)| t.is_some_and(|t| t >= start && t <= end))
                .map(|(i, _)| i)
                .collect();
            StageOutcome::Applied(TimeSlice {
                dim,
                positions,
                start_label: start.to_string(),
                end_label: end.to_string(),
            })
        }
    }
}

/// Positions along the band dimension whose label equals `wanted`.
pub fn filter_band(ds: &Dataset, band: Option<&axes::BandAxis>, wanted: &str) -> StageOutcome<(String, Vec<usize>)> {
    let Some(band) = band else {
        return StageOutcome::Unavailable("No band axis".to_string());
    };
    let dim = match ds.variable(&band.name) {
        Ok(var) if var.dimensions.len() == 1 => var.dimensions[0].name.clone(),
        Ok(_) => return StageOutcome::Degraded(format!("Band axis '{}' is not one-dimensional", band.name)),
        Err(_) => band.name.clone(),
    };

    let positions: Vec<usize> = band
        .values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.as_str() == wanted.trim())
        .map(|(i, _)| i)
        .collect();
    if positions.is_empty() {
        return StageOutcome::Degraded(format!("Band value '{wanted}' not found on '{}'", band.name));
    }
    StageOutcome::Applied((dim, positions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::MemorySource;
    use crate::events::log_messages;
    use crate::metadata::AttributeValue;
    use std::cell::Cell;
    use tempfile::TempDir;

    fn d(s: &str) -> CivilDate {
        s.parse().unwrap()
    }

    fn grid(calendar: &str) -> Dataset {
        let mut tas = Vec::new();
        for t in 0..4 {
            for i in 0..3 {
                for j in 0..3 {
                    tas.push((100 * t + 10 * i + j) as f64);
                }
            }
        }
        Dataset::new(
            "tas.zarr",
            MemorySource::new()
                .with_coord("time", vec![0.0, 31.0, 59.0, 90.0])
                .with_attr("time", "units", AttributeValue::String("days since 2001-01-01".to_string()))
                .with_attr("time", "calendar", AttributeValue::String(calendar.to_string()))
                .with_coord("lat", vec![10.0, 20.0, 30.0])
                .with_coord("lon", vec![100.0, 110.0, 120.0])
                .with_array("tas", &[("time", 4), ("lat", 3), ("lon", 3)], tas),
        )
    }

    fn job(dir: &Path) -> ExtractionJob {
        ExtractionJob {
            source: PathBuf::from("/data/Root/ModelA/tas.zarr"),
            save_root: dir.to_path_buf(),
            bbox: BoundingBox::new(5.0, 25.0, 95.0, 115.0).unwrap(),
            time_window: None,
            band_filter: None,
            columns: vec![],
            chunks: ChunkSizes::default(),
            skip_existing: true,
        }
    }

    #[test]
    fn test_extract_writes_spreadsheet() {
        let dir = TempDir::new().unwrap();
        let mut events = Vec::new();
        let record = extract_with(&job(dir.path()), &|_: &Path| Ok(grid("standard")), &mut events);

        let FileOutcome::Written { path, format, rows, .. } = &record.outcome else {
            panic!("unexpected outcome {:?}", record.outcome);
        };
        assert_eq!(*format, SinkFormat::Spreadsheet);
        assert_eq!(*rows, 2 * 2 * 4);
        assert_eq!(path, &dir.path().join("ModelA/tas.xlsx"));
        assert!(path.exists());

        let logs = log_messages(&events);
        assert_eq!(logs[0], "Opening: tas.zarr");
        assert!(logs.last().unwrap().starts_with("Saved tas.xlsx"));
        assert_eq!(events[1], ExtractEvent::Busy(true));
        assert!(events.contains(&ExtractEvent::Busy(false)));
    }

    #[test]
    fn test_skip_existing_does_not_open() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("ModelA")).unwrap();
        std::fs::write(dir.path().join("ModelA/tas.csv"), "lat,lon\n").unwrap();

        let opened = Cell::new(false);
        let opener = |_: &Path| {
            opened.set(true);
            Ok::<_, ExtractError>(grid("standard"))
        };
        let mut events = Vec::new();
        let record = extract_with(&job(dir.path()), &opener, &mut events);

        assert!(!opened.get());
        assert!(matches!(record.outcome, FileOutcome::Skipped(SkipReason::Existing(_))));
        assert_eq!(log_messages(&events), vec!["Skipping existing: tas"]);
    }

    #[test]
    fn test_time_slice_is_inclusive() {
        let ds = grid("standard");
        let window = TimeWindow::new(d("2001-02-01"), d("2001-03-01")).unwrap();
        let StageOutcome::Applied(slice) = slice_time(&ds, &window) else {
            panic!("slice not applied");
        };
        assert_eq!(slice.dim, "time");
        assert_eq!(slice.positions, vec![1, 2]);
    }

    #[test]
    fn test_time_slice_in_360_day_calendar() {
        // offsets 0, 31, 59, 90 land on 01-01, 02-02, 02-30, 04-01
        let ds = grid("360_day");
        let window = TimeWindow::new(d("2001-02-30"), d("2001-03-30")).unwrap();
        let StageOutcome::Applied(slice) = slice_time(&ds, &window) else {
            panic!("slice not applied");
        };
        assert_eq!(slice.positions, vec![2]);
        assert_eq!(slice.start_label, "2001-02-30 00:00:00");
    }

    #[test]
    fn test_unconvertible_window_degrades() {
        let ds = grid("noleap");
        let window = TimeWindow::new(d("2000-02-29"), d("2001-03-01")).unwrap();
        assert!(matches!(slice_time(&ds, &window), StageOutcome::Degraded(_)));

        let dir = TempDir::new().unwrap();
        let mut job = job(dir.path());
        job.time_window = Some(window);
        let mut events = Vec::new();
        let record = extract_with(&job, &|_: &Path| Ok(grid("noleap")), &mut events);

        assert!(matches!(record.outcome, FileOutcome::Written { rows: 16, .. }));
        assert!(matches!(record.time_slice, Some(StageOutcome::Degraded(_))));
        assert!(log_messages(&events).contains(&"Warning: Could not convert dates for tas.zarr. Skipping time slice."));
    }

    #[test]
    fn test_missing_time_axis_is_unavailable() {
        let ds = Dataset::new("mem", MemorySource::new().with_coord("lat", vec![0.0]));
        let window = TimeWindow::new(d("2000-01-01"), d("2000-12-31")).unwrap();
        assert!(matches!(slice_time(&ds, &window), StageOutcome::Unavailable(_)));
    }

    #[test]
    fn test_band_filter() {
        let ds = Dataset::new(
            "mem",
            MemorySource::new()
                .with_coord("band", vec![1.0, 2.0, 3.0])
                .with_array("v", &[("band", 3)], vec![0.0; 3]),
        );
        let band = axes::discover_band(&ds);
        assert_eq!(
            filter_band(&ds, band.as_ref(), "2"),
            StageOutcome::Applied(("band".to_string(), vec![1]))
        );
        assert!(matches!(filter_band(&ds, band.as_ref(), "9"), StageOutcome::Degraded(_)));
        assert!(matches!(filter_band(&ds, None, "1"), StageOutcome::Unavailable(_)));
    }

    #[test]
    fn test_missing_coordinates_skip() {
        let dir = TempDir::new().unwrap();
        let ds = || Ok::<_, ExtractError>(Dataset::new("mem", MemorySource::new().with_coord("time", vec![0.0])));
        let mut events = Vec::new();
        let record = extract_with(&job(dir.path()), &|_: &Path| ds(), &mut events);
        assert_eq!(record.outcome, FileOutcome::Skipped(SkipReason::NoCoordinates));
        assert!(log_messages(&events).contains(&"Skipping tas.zarr: Could not find lat/lon coordinates."));
    }

    #[test]
    fn test_insufficient_nodes_skip() {
        let dir = TempDir::new().unwrap();
        let mut job = job(dir.path());
        job.bbox = BoundingBox::new(15.0, 25.0, 105.0, 115.0).unwrap();
        let mut events = Vec::new();
        let record = extract_with(&job, &|_: &Path| Ok(grid("standard")), &mut events);
        assert_eq!(record.outcome, FileOutcome::Skipped(SkipReason::InsufficientNodes));
    }

    #[test]
    fn test_open_failure_is_recorded() {
        let dir = TempDir::new().unwrap();
        let mut events = Vec::new();
        let record = extract_with(
            &job(dir.path()),
            &|p: &Path| Err(ExtractError::open(p, "corrupt header")),
            &mut events,
        );
        let FileOutcome::Failed(message) = &record.outcome else {
            panic!("expected failure");
        };
        assert!(message.starts_with("Error processing tas.zarr:"));
        assert!(message.contains("corrupt header"));
        assert_eq!(events.last(), Some(&ExtractEvent::Log(message.clone())));
        assert!(events.contains(&ExtractEvent::Busy(false)));
    }

    #[test]
    fn test_column_projection() {
        let dir = TempDir::new().unwrap();
        let mut job = job(dir.path());
        job.columns = vec!["tas".to_string(), "lat".to_string()];
        job.skip_existing = false;
        let mut events = Vec::new();
        let record = extract_with(&job, &|_: &Path| Ok(grid("standard")), &mut events);
        assert!(matches!(record.outcome, FileOutcome::Written { .. }));

        job.columns = vec!["nothing".to_string()];
        let mut events = Vec::new();
        extract_with(&job, &|_: &Path| Ok(grid("standard")), &mut events);
        assert!(log_messages(&events).contains(&"None of the selected columns exist in tas.zarr; keeping all columns."));
    }
}
