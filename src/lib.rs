//! Bounding-box and time-window extraction of gridded Zarr datasets into
//! spreadsheet or CSV tables.

pub mod axes;
pub mod batch;
pub mod calendar;
pub mod dataset;
pub mod discover;
pub mod error;
pub mod events;
pub mod extract;
pub mod metadata;
pub mod sink;
pub mod spatial;
pub mod store;
pub mod table;
pub mod time_range;

// Re-export commonly used types
pub use batch::{BatchHandle, BatchRunner, BatchSummary, CancelFlag, ExtractParams, run_batch};
pub use calendar::{AxisTime, CalendarFamily, CivilDate};
pub use dataset::{Dataset, GridSource, MemorySource, open_dataset};
pub use error::{ExtractError, Result};
pub use events::{EventSink, ExtractEvent};
pub use extract::{ExtractionJob, FileOutcome, OutcomeRecord, SkipReason, StageOutcome, TimeWindow, extract};
pub use metadata::{AttributeValue, Dimension, StoreMetadata, Variable};
pub use sink::SinkFormat;
pub use spatial::{BoundingBox, GridPoint, GridPointSet};
pub use store::ZarrStore;
pub use table::{ChunkSizes, Column, Table};
