//! Events reported to whoever drives an extraction.

use crate::batch::BatchSummary;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractEvent {
    /// Whole-batch progress, 0 to 100.
    Progress(u8),
    Log(String),
    /// Set while a dataset is being opened and time-sliced.
    Busy(bool),
    Finished(BatchSummary),
}

/// `tracing` target for mirrored event log lines. Front ends that already
/// display [`ExtractEvent::Log`] turn this target off.
pub const EVENT_TARGET: &str = "grid_extract::events";

/// Receiver of [`ExtractEvent`]s. Log helpers mirror each message to
/// `tracing` under [`EVENT_TARGET`].
pub trait EventSink {
    fn emit(&mut self, event: ExtractEvent);

    fn info(&mut self, message: String) {
        info!(target: EVENT_TARGET, "{message}");
        self.emit(ExtractEvent::Log(message));
    }

    fn warn(&mut self, message: String) {
        warn!(target: EVENT_TARGET, "{message}");
        self.emit(ExtractEvent::Log(message));
    }

    fn error(&mut self, message: String) {
        error!(target: EVENT_TARGET, "{message}");
        self.emit(ExtractEvent::Log(message));
    }
}

impl EventSink for Vec<ExtractEvent> {
    fn emit(&mut self, event: ExtractEvent) {
        self.push(event);
    }
}

impl EventSink for UnboundedSender<ExtractEvent> {
    fn emit(&mut self, event: ExtractEvent) {
        // A dropped receiver means nobody is listening any more.
        let _ = self.send(event);
    }
}

/// Log messages among `events`, in order.
pub fn log_messages(events: &[ExtractEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            ExtractEvent::Log(message) => Some(message.as_str()),
            _ => None,
        })
        .collect()
}
