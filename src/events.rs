//! JSON-lines events for hosts driving the server out of process
//!
//! Every event is one JSON object per line with a `type` field:
//! ```json
//! {"type":"diagnostics","path":"/p/main.c","version":"3","diagnostics":[...],"timestamp":"..."}
//! ```
//!
//! # Event Types
//!
//! - `diagnostics` - diagnostics published for a file version
//! - `file_status` - a file's build stage changed
//! - `semantics_changed` - cached results for a file may be stale
//! - `indexing_progress` - background indexer counters

use std::io::{self, Write};
use std::path::Path;

use parking_lot::Mutex;
use serde::Serialize;

use crate::index::BackgroundStats;
use crate::scheduler::TuStatus;
use crate::schema::Diagnostic;
use crate::server::ServerCallbacks;

/// Writes events to a sink, one JSON object per line
pub struct EventEmitter {
    sink: Mutex<Box<dyn Write + Send>>,
    /// Emit `file_status` events too; they are frequent
    include_status: bool,
}

impl EventEmitter {
    pub fn stdout() -> Self {
        Self::to_writer(Box::new(io::stdout()))
    }

    pub fn to_writer(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Mutex::new(sink),
            include_status: false,
        }
    }

    pub fn with_status(mut self, include_status: bool) -> Self {
        self.include_status = include_status;
        self
    }

    pub fn emit<E: ServerEvent>(&self, event: &E) {
        let wrapper = EventWrapper {
            event_type: E::event_type(),
            payload: event,
        };
        match serde_json::to_string(&wrapper) {
            Ok(json) => {
                let mut sink = self.sink.lock();
                // The reader may have gone away
                let _ = writeln!(sink, "{}", json);
                let _ = sink.flush();
            }
            Err(e) => tracing::warn!("Failed to serialize {} event: {}", E::event_type(), e),
        }
    }
}

#[derive(Serialize)]
struct EventWrapper<'a, P: Serialize> {
    #[serde(rename = "type")]
    event_type: &'static str,
    #[serde(flatten)]
    payload: &'a P,
}

pub trait ServerEvent: Serialize {
    fn event_type() -> &'static str;
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ============================================================================
// Event Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsEvent {
    pub path: String,
    pub version: String,
    pub diagnostics: Vec<Diagnostic>,
    /// Timestamp (RFC 3339)
    pub timestamp: String,
}

impl ServerEvent for DiagnosticsEvent {
    fn event_type() -> &'static str {
        "diagnostics"
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileStatusEvent {
    #[serde(flatten)]
    pub status: TuStatus,
    pub timestamp: String,
}

impl ServerEvent for FileStatusEvent {
    fn event_type() -> &'static str {
        "file_status"
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SemanticsChangedEvent {
    pub path: String,
    pub timestamp: String,
}

impl ServerEvent for SemanticsChangedEvent {
    fn event_type() -> &'static str {
        "semantics_changed"
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexingProgressEvent {
    #[serde(flatten)]
    pub stats: BackgroundStats,
    /// Percentage of enqueued units finished (0-100)
    pub percent: u8,
    pub timestamp: String,
}

impl ServerEvent for IndexingProgressEvent {
    fn event_type() -> &'static str {
        "indexing_progress"
    }
}

impl IndexingProgressEvent {
    pub fn from_stats(stats: &BackgroundStats) -> Self {
        let done = stats.completed + stats.failed;
        let percent = if stats.enqueued == 0 {
            100
        } else {
            (done * 100 / stats.enqueued).min(100) as u8
        };
        Self {
            stats: *stats,
            percent,
            timestamp: timestamp(),
        }
    }
}

impl ServerCallbacks for EventEmitter {
    fn on_diagnostics_ready(&self, path: &Path, version: &str, diagnostics: &[Diagnostic]) {
        self.emit(&DiagnosticsEvent {
            path: path.display().to_string(),
            version: version.to_string(),
            diagnostics: diagnostics.to_vec(),
            timestamp: timestamp(),
        });
    }

    fn on_file_updated(&self, _path: &Path, status: &TuStatus) {
        if self.include_status {
            self.emit(&FileStatusEvent {
                status: status.clone(),
                timestamp: timestamp(),
            });
        }
    }

    fn on_semantics_maybe_changed(&self, path: &Path) {
        self.emit(&SemanticsChangedEvent {
            path: path.display().to_string(),
            timestamp: timestamp(),
        });
    }

    fn on_background_index_progress(&self, stats: &BackgroundStats) {
        self.emit(&IndexingProgressEvent::from_stats(stats));
    }
}

// ============================================================================
// Tests
// ============================================================================
