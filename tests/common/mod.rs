//! Common test utilities and fixtures for semfora-scheduler integration tests
//!
//! This module provides:
//! - `SlowFrontend`, a `TextFrontend` wrapper with build delays and counters
//! - `RecordingCallbacks`, which keeps every published diagnostics set
//! - `TestProject` for on-disk projects with a compile_commands.json

#![allow(unused_imports)]
#![allow(dead_code)]

pub mod callbacks;
pub mod slow_frontend;
pub mod test_project;

pub use callbacks::{Published, RecordingCallbacks};
pub use slow_frontend::SlowFrontend;
pub use test_project::TestProject;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use semfora_scheduler::config::{DebounceOptions, SchedulerOptions};
use semfora_scheduler::{
    CompileCommand, ConfigProvider, Filesystem, Frontend, InMemoryCompilationDatabase,
    MemoryFilesystem, ParseInputs, TaskScheduler,
};

/// Generous bound for waits that should finish quickly
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(20);

/// Scheduler options with a fixed debounce
pub fn scheduler_options(threads: usize, debounce_ms: u64) -> SchedulerOptions {
    SchedulerOptions {
        async_threads_count: threads,
        debounce: DebounceOptions {
            fixed_ms: Some(debounce_ms),
            ..DebounceOptions::default()
        },
        ast_cache_size: 3,
    }
}

/// Scheduler over an in-memory filesystem and database
pub struct SchedulerFixture {
    pub fs: Arc<MemoryFilesystem>,
    pub cdb: Arc<InMemoryCompilationDatabase>,
    pub frontend: Arc<SlowFrontend>,
    pub callbacks: Arc<RecordingCallbacks>,
    pub scheduler: TaskScheduler,
}

impl SchedulerFixture {
    pub fn new(options: SchedulerOptions, frontend: SlowFrontend) -> Self {
        let fs = Arc::new(MemoryFilesystem::new());
        let cdb = Arc::new(InMemoryCompilationDatabase::new());
        let frontend = Arc::new(frontend);
        let callbacks = Arc::new(RecordingCallbacks::default());
        let scheduler = TaskScheduler::new(
            &options,
            Arc::clone(&frontend) as Arc<dyn Frontend>,
            Arc::clone(&cdb) as _,
            Arc::new(ConfigProvider::default()),
            Arc::clone(&callbacks) as _,
        );
        Self {
            fs,
            cdb,
            frontend,
            callbacks,
            scheduler,
        }
    }

    pub fn inputs(&self, contents: &str, version: &str) -> ParseInputs {
        ParseInputs::new(contents, version, Arc::clone(&self.fs) as Arc<dyn Filesystem>)
    }

    /// Register a plain command for `path`
    pub fn set_command(&self, path: &Path) {
        let file = path.to_string_lossy().into_owned();
        let dir = path.parent().unwrap_or(Path::new("/"));
        self.cdb
            .set_command(path, CompileCommand::new(dir, path, vec!["cc".into(), file]));
    }

    pub fn wait_idle(&self) {
        assert!(
            self.scheduler
                .block_until_idle(semfora_scheduler::Deadline::after(IDLE_TIMEOUT)),
            "scheduler did not go idle"
        );
    }
}
