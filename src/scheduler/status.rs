//! Observable per-file build status

use std::path::PathBuf;

use serde::Serialize;

/// What the file's worker is doing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", content = "action", rename_all = "snake_case")]
pub enum BuildStage {
    #[default]
    Idle,
    /// Requests waiting, possibly debounced
    Queued,
    /// Building the AST that produces diagnostics
    BuildingFile,
    RunningAction(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreambleActivity {
    #[default]
    Idle,
    Building,
}

/// Snapshot of a file's scheduling state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TuStatus {
    pub path: PathBuf,
    pub stage: BuildStage,
    pub preamble: PreambleActivity,
    pub queue_depth: usize,
    /// Unix millis of the last diagnostics publication
    pub last_publish: Option<u64>,
}

impl TuStatus {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            stage: BuildStage::Idle,
            preamble: PreambleActivity::Idle,
            queue_depth: 0,
            last_publish: None,
        }
    }
}
