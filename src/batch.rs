//! Sequential batch extraction and a single-slot background runner.

use crate::dataset::{self, Dataset};
use crate::error::{ExtractError, Result};
use crate::events::{EventSink, ExtractEvent};
use crate::extract::{self, ExtractionJob, FileOutcome, OutcomeRecord, TimeWindow};
use crate::spatial::BoundingBox;
use crate::table::ChunkSizes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tracing::debug;

/// Parameters of one batch, as a UI or a `--params` file supplies them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractParams {
    pub inputs: Vec<PathBuf>,
    /// Defaults to `<data root>/Extracted`, the data root being the
    /// grandparent of the first input.
    #[serde(default)]
    pub save_root: Option<PathBuf>,
    pub bbox: BoundingBox,
    #[serde(default)]
    pub time_window: Option<TimeWindow>,
    #[serde(default)]
    pub band_filter: Option<String>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub chunks: ChunkSizes,
    #[serde(default = "default_skip_existing")]
    pub skip_existing: bool,
}

fn default_skip_existing() -> bool {
    true
}

impl ExtractParams {
    pub fn new(inputs: Vec<PathBuf>, bbox: BoundingBox) -> Self {
        Self {
            inputs,
            save_root: None,
            bbox,
            time_window: None,
            band_filter: None,
            columns: Vec::new(),
            chunks: ChunkSizes::default(),
            skip_existing: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.bbox.validate()?;
        self.chunks.validate()?;
        if let Some(window) = &self.time_window {
            window.validate()?;
        }
        Ok(())
    }

    pub fn resolved_save_root(&self) -> PathBuf {
        match (&self.save_root, self.inputs.first()) {
            (Some(root), _) => root.clone(),
            (None, Some(first)) => default_save_root(first),
            (None, None) => PathBuf::from("Extracted"),
        }
    }

    /// One job per input, in input order.
    pub fn jobs(&self) -> Vec<ExtractionJob> {
        let save_root = self.resolved_save_root();
        self.inputs
            .iter()
            .map(|source| ExtractionJob {
                source: source.clone(),
                save_root: save_root.clone(),
                bbox: self.bbox,
                time_window: self.time_window,
                band_filter: self.band_filter.clone(),
                columns: self.columns.clone(),
                chunks: self.chunks,
                skip_existing: self.skip_existing,
            })
            .collect()
    }
}

/// `<data root>/Extracted` for inputs laid out as `<data root>/<folder>/<dataset>`.
pub fn default_save_root(first_input: &Path) -> PathBuf {
    first_input
        .parent()
        .and_then(Path::parent)
        .unwrap_or(Path::new(""))
        .join("Extracted")
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Set when the batch stopped before every input was processed.
    pub cancelled: bool,
    pub records: Vec<OutcomeRecord>,
}

impl BatchSummary {
    fn push(&mut self, record: OutcomeRecord) {
        match record.outcome {
            FileOutcome::Written { .. } => self.written += 1,
            FileOutcome::Skipped(_) => self.skipped += 1,
            FileOutcome::Failed(_) => self.failed += 1,
        }
        self.records.push(record);
    }

    pub fn processed(&self) -> usize {
        self.records.len()
    }
}

/// Shared flag checked between files.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Extract every input of `params` in order, reporting through `events`.
pub fn run_batch(params: &ExtractParams, events: &mut dyn EventSink, cancel: &CancelFlag) -> BatchSummary {
    run_batch_with(params, &|path: &Path| dataset::open_dataset(path), events, cancel)
}

pub fn run_batch_with(
    params: &ExtractParams,
    opener: &dyn Fn(&Path) -> Result<Dataset>,
    events: &mut dyn EventSink,
    cancel: &CancelFlag,
) -> BatchSummary {
    let mut summary = BatchSummary::default();

    if let Err(e) = params.validate() {
        events.error(format!("Invalid extraction parameters: {e}"));
        events.emit(ExtractEvent::Finished(summary.clone()));
        return summary;
    }

    let jobs = params.jobs();
    let total = jobs.len();
    if total == 0 {
        events.info("No files selected to process.".to_string());
        events.emit(ExtractEvent::Finished(summary.clone()));
        return summary;
    }

    events.info(format!("Starting extraction for {total} files..."));
    debug!(save_root = %params.resolved_save_root().display(), "batch started");

    for (i, job) in jobs.iter().enumerate() {
        if cancel.is_cancelled() {
            events.info(format!("Cancelled; {} of {total} files not processed.", total - i));
            summary.cancelled = true;
            break;
        }
        let record = extract::extract_with(job, opener, events);
        summary.push(record);
        events.emit(ExtractEvent::Progress(((i + 1) * 100 / total) as u8));
    }

    events.info("All done.".to_string());
    events.emit(ExtractEvent::Finished(summary.clone()));
    summary
}

/// Runs at most one batch at a time on Tokio's blocking pool.
#[derive(Debug, Clone, Default)]
pub struct BatchRunner {
    active: Arc<AtomicBool>,
}

/// Clears the runner's slot when the batch ends, including by panic.
struct ActiveSlot(Arc<AtomicBool>);

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl BatchRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Start a batch in the background. Must be called from within a Tokio
    /// runtime.
    pub fn submit(&self, params: ExtractParams) -> Result<BatchHandle> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ExtractError::BatchActive);
        }
        let slot = ActiveSlot(Arc::clone(&self.active));

        let (mut tx, rx) = mpsc::unbounded_channel();
        let cancel = CancelFlag::new();
        let task_cancel = cancel.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _slot = slot;
            run_batch(&params, &mut tx, &task_cancel)
        });

        Ok(BatchHandle {
            events: rx,
            cancel,
            task,
        })
    }
}

/// A running batch.
#[derive(Debug)]
pub struct BatchHandle {
    pub events: UnboundedReceiver<ExtractEvent>,
    cancel: CancelFlag,
    task: JoinHandle<BatchSummary>,
}

impl BatchHandle {
    /// Stop after the file currently being processed.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn next_event(&mut self) -> Option<ExtractEvent> {
        self.events.recv().await
    }

    pub async fn join(self) -> Result<BatchSummary> {
        Ok(self.task.await?)
    }
}
