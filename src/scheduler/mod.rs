//! Interactive task scheduler
//!
//! Owns one worker per tracked file and the shared pools every build and
//! action runs on.
//!
//! # Request classes
//!
//! | Entry point               | Waits for              | Runs on           |
//! |---------------------------|------------------------|-------------------|
//! | `update`                  | debounce               | file worker       |
//! | `run_with_ast`            | preamble + AST build   | action pool       |
//! | `run_with_ast_exclusive`  | preamble + AST build   | file worker       |
//! | `run_with_preamble`       | first preamble (Stale) | action pool       |
//! | `run_quick` / `run`       | a free permit          | action pool       |
//!
//! Every build and action holds one permit of a semaphore sized by
//! `async_threads_count`. Permits are only requested after any wait for a
//! preamble, so a full pool can never stall the build it waits on.

mod debounce;
mod preamble_thread;
mod status;
mod worker;

pub use debounce::{DebouncePolicy, REBUILD_HISTORY};
pub use status::{BuildStage, PreambleActivity, TuStatus};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::ast::{AstCache, ParsedAst};
use crate::compile_db::{CompilationDatabase, CompileCommand};
use crate::config::{ConfigProvider, SchedulerOptions};
use crate::error::TaskError;
use crate::frontend::{Frontend, ParseInputs};
use crate::memory::MemoryTree;
use crate::preamble::{Preamble, PreambleBuilder};
use crate::schema::Diagnostic;
use crate::task::{
    Callback, Invalidation, PreambleFreshness, TaskHandle, TaskResult, WantDiagnostics,
};
use crate::threading::{AsyncTaskRunner, CancelToken, Deadline, Semaphore, CANCEL_POLL};
use worker::FileWorker;

// ============================================================================
// Callbacks
// ============================================================================

/// Hooks into the build pipeline. All methods default to no-ops.
///
/// Called on scheduler threads; implementations must not block on scheduler
/// requests for the same file.
pub trait ParsingCallbacks: Send + Sync {
    /// A new preamble was built. Runs on the preamble thread before any AST
    /// can be built on it.
    fn on_preamble_ast(&self, _path: &Path, _version: &str, _preamble: &Arc<Preamble>) {}

    /// A newly built preamble became visible to the file worker
    fn on_preamble_published(&self, _path: &Path) {}

    /// The AST for diagnostics was built. Publish through `publisher` so
    /// stale results are dropped.
    fn on_main_ast(&self, _path: &Path, _ast: &ParsedAst, _publisher: Publisher<'_>) {}

    /// The build for diagnostics failed
    fn on_failed_ast(
        &self,
        _path: &Path,
        _version: &str,
        _diagnostics: Vec<Diagnostic>,
        _publisher: Publisher<'_>,
    ) {
    }

    fn on_file_updated(&self, _path: &Path, _status: &TuStatus) {}
}

/// Callbacks that ignore everything
#[derive(Debug, Default)]
pub struct NoopCallbacks;

impl ParsingCallbacks for NoopCallbacks {}

/// Publication gate for one build's results
pub struct Publisher<'a> {
    worker: &'a FileWorker,
    seq: u64,
}

impl Publisher<'_> {
    /// Run `publish` unless the file was removed or newer results were
    /// already published. Returns whether it ran.
    pub fn publish(self, publish: impl FnOnce()) -> bool {
        self.worker.publish_if_current(self.seq, publish)
    }
}

// ============================================================================
// Snapshots handed to actions
// ============================================================================

/// What an AST action sees
#[derive(Debug, Clone)]
pub struct InputsAndAst {
    pub inputs: Arc<ParseInputs>,
    pub ast: Arc<ParsedAst>,
}

/// What a preamble action sees
#[derive(Debug, Clone)]
pub struct InputsAndPreamble {
    /// Latest submitted contents, possibly newer than the preamble
    pub contents: Arc<str>,
    pub version: String,
    pub command: CompileCommand,
    /// `None` in fallback mode
    pub preamble: Option<Arc<Preamble>>,
}

/// Per-file counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FileStats {
    pub used_memory: usize,
    pub preamble_builds: usize,
    pub ast_builds: usize,
}

// ============================================================================
// TaskScheduler
// ============================================================================

/// State shared by the scheduler and its file workers
pub(crate) struct SchedulerContext {
    pub frontend: Arc<dyn Frontend>,
    pub preambles: PreambleBuilder,
    pub cdb: Arc<dyn CompilationDatabase>,
    pub config: Arc<ConfigProvider>,
    pub callbacks: Arc<dyn ParsingCallbacks>,
    pub barrier: Arc<Semaphore>,
    pub debounce: DebouncePolicy,
    pub ast_cache: AstCache,
    /// Short-lived actions
    pub actions: Arc<AsyncTaskRunner>,
    /// Long-lived per-file threads
    pub threads: Arc<AsyncTaskRunner>,
}

pub struct TaskScheduler {
    ctx: Arc<SchedulerContext>,
    files: RwLock<HashMap<PathBuf, Arc<FileWorker>>>,
}

impl TaskScheduler {
    pub fn new(
        options: &SchedulerOptions,
        frontend: Arc<dyn Frontend>,
        cdb: Arc<dyn CompilationDatabase>,
        config: Arc<ConfigProvider>,
        callbacks: Arc<dyn ParsingCallbacks>,
    ) -> Self {
        let threads = options.async_threads_count.max(1);
        tracing::info!(
            "Scheduler started: {} interactive threads, AST cache of {}",
            threads,
            options.ast_cache_size
        );
        Self {
            ctx: Arc::new(SchedulerContext {
                preambles: PreambleBuilder::new(Arc::clone(&frontend)),
                frontend,
                cdb,
                config,
                callbacks,
                barrier: Semaphore::new(threads),
                debounce: DebouncePolicy::from_options(&options.debounce),
                ast_cache: AstCache::new(options.ast_cache_size),
                actions: AsyncTaskRunner::new(),
                threads: AsyncTaskRunner::new(),
            }),
            files: RwLock::new(HashMap::new()),
        }
    }

    /// Number of builds and actions that may run at once
    pub fn async_threads(&self) -> usize {
        self.ctx.barrier.capacity()
    }

    /// Schedule a rebuild of `path` with new inputs.
    ///
    /// Returns true if the file was not tracked before.
    pub fn update(&self, path: &Path, inputs: ParseInputs, want: WantDiagnostics) -> bool {
        let (worker, added) = {
            let mut files = self.files.write();
            match files.get(path) {
                Some(worker) => (Arc::clone(worker), false),
                None => {
                    let worker = FileWorker::new(path.to_path_buf(), Arc::clone(&self.ctx));
                    worker.start();
                    files.insert(path.to_path_buf(), Arc::clone(&worker));
                    (worker, true)
                }
            }
        };
        if added {
            tracing::debug!("Tracking {}", path.display());
        }
        worker.update(inputs, want);
        added
    }

    /// Stop tracking `path`. Pending and running requests complete as
    /// cancelled.
    pub fn remove(&self, path: &Path) -> bool {
        let removed = self.files.write().remove(path);
        match removed {
            Some(worker) => {
                worker.stop("file removed");
                tracing::debug!("Stopped tracking {}", path.display());
                true
            }
            None => {
                tracing::warn!("Trying to remove untracked file {}", path.display());
                false
            }
        }
    }

    /// Latest submitted contents of a tracked file
    pub fn contents(&self, path: &Path) -> Option<Arc<str>> {
        self.worker(path)?.submitted().map(|(_, contents)| contents)
    }

    pub fn tracked_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = self.files.read().keys().cloned().collect();
        files.sort();
        files
    }

    fn worker(&self, path: &Path) -> Option<Arc<FileWorker>> {
        self.files.read().get(path).cloned()
    }

    fn untracked(path: &Path) -> TaskError {
        TaskError::invalid(format!("{} is not tracked", path.display()))
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Run a read-only action on an AST of the latest submitted version.
    ///
    /// Actions on the same AST may run concurrently.
    pub fn run_with_ast<R: Send + 'static>(
        &self,
        name: &str,
        path: &Path,
        invalidation: Invalidation,
        action: impl FnOnce(TaskResult<InputsAndAst>) -> R + Send + 'static,
    ) -> TaskHandle<R> {
        self.enqueue_ast(name, path, false, invalidation, action)
    }

    /// Run a side-effecting action on the file worker; nothing else runs on
    /// the file meanwhile.
    pub fn run_with_ast_exclusive<R: Send + 'static>(
        &self,
        name: &str,
        path: &Path,
        invalidation: Invalidation,
        action: impl FnOnce(TaskResult<InputsAndAst>) -> R + Send + 'static,
    ) -> TaskHandle<R> {
        self.enqueue_ast(name, path, true, invalidation, action)
    }

    fn enqueue_ast<R: Send + 'static>(
        &self,
        name: &str,
        path: &Path,
        exclusive: bool,
        invalidation: Invalidation,
        action: impl FnOnce(TaskResult<InputsAndAst>) -> R + Send + 'static,
    ) -> TaskHandle<R> {
        let Some(worker) = self.worker(path) else {
            let (callback, handle) = TaskHandle::for_action(CancelToken::new(), action);
            callback.call(Err(Self::untracked(path)));
            return handle;
        };
        let cancel = worker.root.child();
        let (callback, handle) = TaskHandle::for_action(cancel.clone(), action);
        worker.enqueue_read(name, exclusive, invalidation, cancel, callback);
        handle
    }

    /// Run an action on the latest preamble, without waiting for pending
    /// edits to be built
    pub fn run_with_preamble<R: Send + 'static>(
        &self,
        name: &str,
        path: &Path,
        freshness: PreambleFreshness,
        action: impl FnOnce(TaskResult<InputsAndPreamble>) -> R + Send + 'static,
    ) -> TaskHandle<R> {
        let Some(worker) = self.worker(path) else {
            let (callback, handle) = TaskHandle::for_action(CancelToken::new(), action);
            callback.call(Err(Self::untracked(path)));
            return handle;
        };
        let cancel = worker.root.child();
        let (callback, handle) = TaskHandle::for_action(cancel.clone(), action);
        self.ctx.actions.run_async(format!("{}:{}", name, file_name(path)), move || {
            match preamble_snapshot(&worker, freshness, &cancel) {
                Ok(snapshot) => match worker.ctx.barrier.acquire(&cancel, Deadline::infinity()) {
                    Ok(_permit) => callback.call(Ok(snapshot)),
                    Err(e) => callback.call(Err(e)),
                },
                Err(e) => callback.call(Err(e)),
            }
        });
        handle
    }

    /// Run an action tied to a tracked file that needs no snapshot. It is
    /// never queued behind the file's builds.
    pub fn run_quick<R: Send + 'static>(
        &self,
        name: &str,
        path: &Path,
        action: impl FnOnce() -> R + Send + 'static,
    ) -> TaskHandle<R> {
        match self.worker(path) {
            Some(worker) => self.spawn_action(name, Some(path), worker.root.child(), action),
            None => TaskHandle::failed(Self::untracked(path)),
        }
    }

    /// Run an action on the interactive pool. `path` only labels the task.
    pub fn run<R: Send + 'static>(
        &self,
        name: &str,
        path: Option<&Path>,
        action: impl FnOnce() -> R + Send + 'static,
    ) -> TaskHandle<R> {
        self.spawn_action(name, path, CancelToken::new(), action)
    }

    fn spawn_action<R: Send + 'static>(
        &self,
        name: &str,
        path: Option<&Path>,
        cancel: CancelToken,
        action: impl FnOnce() -> R + Send + 'static,
    ) -> TaskHandle<R> {
        let (callback, handle) = TaskHandle::for_unit_action(cancel.clone(), action);
        let barrier = Arc::clone(&self.ctx.barrier);
        let label = match path {
            Some(path) => format!("{}:{}", name, file_name(path)),
            None => name.to_string(),
        };
        self.ctx.actions.run_async(label, move || {
            run_with_permit(&barrier, &cancel, callback);
        });
        handle
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn file_stats(&self) -> HashMap<PathBuf, FileStats> {
        self.files
            .read()
            .iter()
            .map(|(path, worker)| {
                let (ast, preamble) = worker.used_memory();
                let stats = FileStats {
                    used_memory: ast + preamble,
                    preamble_builds: worker.preamble_builds.load(Ordering::SeqCst),
                    ast_builds: worker.ast_builds.load(Ordering::SeqCst),
                };
                (path.clone(), stats)
            })
            .collect()
    }

    /// Memory per file, split into `ast` and `preamble`
    pub fn profile(&self, tree: &mut MemoryTree) {
        for (path, worker) in self.files.read().iter() {
            let (ast, preamble) = worker.used_memory();
            let file = tree.child(&path.display().to_string());
            file.child("ast").add_usage(ast);
            file.child("preamble").add_usage(preamble);
        }
    }

    /// Wait until every file worker is idle and no action is running
    pub fn block_until_idle(&self, deadline: Deadline) -> bool {
        let workers: Vec<Arc<FileWorker>> = self.files.read().values().cloned().collect();
        workers.iter().all(|w| w.block_until_idle(deadline)) && self.ctx.actions.wait(deadline)
    }

    /// Stop all workers and wait for their threads and running actions
    pub fn shutdown(&self) {
        let workers: Vec<Arc<FileWorker>> = self.files.write().drain().map(|(_, w)| w).collect();
        for worker in &workers {
            worker.stop("scheduler shutting down");
        }
        self.ctx.threads.wait(Deadline::infinity());
        self.ctx.actions.wait(Deadline::infinity());
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn run_with_permit(barrier: &Arc<Semaphore>, cancel: &CancelToken, callback: Callback<()>) {
    match barrier.acquire(cancel, Deadline::infinity()) {
        Ok(_permit) => callback.call(Ok(())),
        Err(e) => callback.call(Err(e)),
    }
}

/// Latest preamble and submitted contents, waiting for the first preamble
/// attempt if `freshness` is `Stale`
fn preamble_snapshot(
    worker: &FileWorker,
    freshness: PreambleFreshness,
    cancel: &CancelToken,
) -> TaskResult<InputsAndPreamble> {
    let mut state = worker.state.lock();
    if freshness == PreambleFreshness::Stale {
        loop {
            if state.done {
                return Err(TaskError::cancelled("file removed"));
            }
            cancel.check()?;
            if state.preamble_seq_done.is_some() {
                break;
            }
            worker.preamble_cv.wait_for(&mut state, CANCEL_POLL);
        }
        // A failed first attempt leaves nothing stale to serve
        if state.latest_preamble.is_none() {
            if let Some(diagnostics) = &state.preamble_failure {
                return Err(TaskError::BuildFailure {
                    path: worker.path.clone(),
                    diagnostics: diagnostics.clone(),
                });
            }
        }
    }
    cancel.check()?;
    let preamble = state.latest_preamble.clone();
    let command = state.current.as_ref().map(|c| c.inputs.command.clone());
    let (version, contents) = state
        .submitted
        .clone()
        .ok_or_else(|| TaskError::invalid(format!("no contents for {}", worker.path.display())))?;
    drop(state);

    let command = command.unwrap_or_else(|| {
        let cdb = &worker.ctx.cdb;
        let mut command = cdb
            .get_command(&worker.path)
            .unwrap_or_else(|| cdb.fallback_command(&worker.path));
        worker.ctx.config.get(&worker.path).apply_to_command(&mut command);
        command
    });
    Ok(InputsAndPreamble {
        contents,
        version,
        command,
        preamble,
    })
}
