//! Per-file AST worker
//!
//! Each tracked file owns two threads sharing one `FileWorker`:
//!
//! ```text
//!   update() ──┐                 ┌──────────────── preamble thread ───────────┐
//!   reads ─────┤                 │ slot (latest wins) → build → publish        │
//!              ▼                 └───────────▲──────────────────┬─────────────┘
//!   ┌─────── requests (FIFO) ───────┐        │ inputs            │ PreambleRequest
//!   │ U1 U2 R1 U3 ...               │ ──► AST worker ◄───────────┘ (runs first)
//!   └───────────────────────────────┘        │
//!                                            └─► diagnostics / AST reads
//! ```
//!
//! The AST worker pops requests in order, skipping updates made dead by a
//! later update and delaying a lone update by the debounce interval. It never
//! builds an AST before the preamble for the same inputs has been attempted.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::debounce::REBUILD_HISTORY;
use super::status::{BuildStage, TuStatus};
use super::{InputsAndAst, Publisher, SchedulerContext};
use crate::ast::ParsedAst;
use crate::error::TaskError;
use crate::frontend::{BuildError, ParseInputs};
use crate::preamble::Preamble;
use crate::schema::{now_millis, Diagnostic};
use crate::task::{Callback, Invalidation, TaskResult, WantDiagnostics};
use crate::threading::{wait_until, CancelToken, Deadline, SemaphorePermit, CANCEL_POLL};

pub(crate) const INVALIDATED: &str = "invalidated by a newer edit";
pub(crate) const SUPERSEDED: &str = "superseded by a newer preamble";

/// Inputs of one update after the command was resolved
#[derive(Debug)]
pub(crate) struct FileInputs {
    pub seq: u64,
    pub inputs: Arc<ParseInputs>,
}

pub(crate) enum RequestKind {
    Update {
        seq: u64,
        inputs: ParseInputs,
        want: WantDiagnostics,
    },
    Ast {
        exclusive: bool,
        callback: Callback<InputsAndAst>,
    },
}

pub(crate) struct Request {
    pub name: String,
    pub add_time: Instant,
    pub kind: RequestKind,
    pub invalidation: Invalidation,
    pub cancel: CancelToken,
}

impl Request {
    fn want(&self) -> Option<WantDiagnostics> {
        match &self.kind {
            RequestKind::Update { want, .. } => Some(*want),
            RequestKind::Ast { .. } => None,
        }
    }

    fn is_update(&self) -> bool {
        self.want().is_some()
    }
}

/// Result of a preamble attempt, handed from the preamble thread to the AST
/// worker
pub(crate) struct PreambleRequest {
    pub inputs: Arc<FileInputs>,
    pub want: WantDiagnostics,
    pub result: std::result::Result<(Arc<Preamble>, bool), Vec<Diagnostic>>,
}

/// Pending input for the preamble thread
pub(crate) struct PreambleTask {
    pub inputs: Arc<FileInputs>,
    pub want: WantDiagnostics,
}

pub(crate) struct BuildingPreamble {
    pub want: WantDiagnostics,
    pub region_hash: u64,
    pub command_hash: u64,
    pub cancel: CancelToken,
}

struct RunningRequest {
    invalidation: Invalidation,
    cancel: CancelToken,
}

pub(crate) struct WorkerState {
    next_seq: u64,
    /// Version and contents of the latest `update()` call
    pub submitted: Option<(String, Arc<str>)>,
    /// Latest inputs handed to the preamble thread
    pub current: Option<Arc<FileInputs>>,
    requests: VecDeque<Request>,
    pub preamble_requests: VecDeque<PreambleRequest>,
    running: Option<RunningRequest>,
    /// Read actions dispatched to the action pool that may be invalidated
    dispatched: Vec<(u64, CancelToken)>,
    next_dispatch: u64,

    pub preamble_slot: Option<PreambleTask>,
    pub preamble_building: Option<BuildingPreamble>,
    /// Sequence number of the latest inputs whose preamble was attempted
    pub preamble_seq_done: Option<u64>,
    /// Last successfully built preamble
    pub latest_preamble: Option<Arc<Preamble>>,
    /// Diagnostics of the latest attempt if it failed
    pub preamble_failure: Option<Vec<Diagnostic>>,

    rebuild_times: Vec<Duration>,
    pub status: TuStatus,
    pub done: bool,
}

pub(crate) struct FileWorker {
    pub path: PathBuf,
    pub ctx: Arc<SchedulerContext>,
    pub state: Mutex<WorkerState>,
    /// Signals the AST worker thread
    pub requests_cv: Condvar,
    /// Signals preamble progress: slot filled, attempt finished
    pub preamble_cv: Condvar,
    /// Signals waiters of `block_until_idle`
    pub idle_cv: Condvar,
    /// Sequence number of the last published diagnostics
    publish: Mutex<Option<u64>>,
    pub root: CancelToken,
    pub preamble_builds: AtomicUsize,
    pub ast_builds: AtomicUsize,
}

enum Job {
    Preamble(PreambleRequest),
    Request(Request),
}

impl FileWorker {
    pub fn new(path: PathBuf, ctx: Arc<SchedulerContext>) -> Arc<Self> {
        let status = TuStatus::new(path.clone());
        Arc::new(Self {
            path,
            ctx,
            state: Mutex::new(WorkerState {
                next_seq: 0,
                submitted: None,
                current: None,
                requests: VecDeque::new(),
                preamble_requests: VecDeque::new(),
                running: None,
                dispatched: Vec::new(),
                next_dispatch: 0,
                preamble_slot: None,
                preamble_building: None,
                preamble_seq_done: None,
                latest_preamble: None,
                preamble_failure: None,
                rebuild_times: Vec::new(),
                status,
                done: false,
            }),
            requests_cv: Condvar::new(),
            preamble_cv: Condvar::new(),
            idle_cv: Condvar::new(),
            publish: Mutex::new(None),
            root: CancelToken::new(),
            preamble_builds: AtomicUsize::new(0),
            ast_builds: AtomicUsize::new(0),
        })
    }

    /// Start the AST worker and preamble threads
    pub fn start(self: &Arc<Self>) {
        let name = self.path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let worker = Arc::clone(self);
        self.ctx.threads.run_async(format!("ast-worker:{}", name), move || worker.run());
        let worker = Arc::clone(self);
        self.ctx.threads.run_async(format!("preamble:{}", name), move || worker.run_preamble_thread());
    }

    // ========================================================================
    // Admission
    // ========================================================================

    pub fn update(&self, inputs: ParseInputs, want: WantDiagnostics) {
        let status = {
            let mut state = self.state.lock();
            if state.done {
                return;
            }
            let changed = match &state.submitted {
                Some((version, contents)) => *version != inputs.version || **contents != *inputs.contents,
                None => true,
            };
            if changed {
                invalidate_reads(&state);
            }
            state.submitted = Some((inputs.version.clone(), Arc::clone(&inputs.contents)));
            let seq = state.next_seq;
            state.next_seq += 1;
            state.requests.push_back(Request {
                name: format!("Update ({})", inputs.version),
                add_time: Instant::now(),
                kind: RequestKind::Update { seq, inputs, want },
                invalidation: Invalidation::NoInvalidation,
                cancel: self.root.child(),
            });
            self.queued_status(&mut state)
        };
        self.requests_cv.notify_all();
        self.emit(status);
    }

    pub fn enqueue_read(
        &self,
        name: &str,
        exclusive: bool,
        invalidation: Invalidation,
        cancel: CancelToken,
        callback: Callback<InputsAndAst>,
    ) {
        let status = {
            let mut state = self.state.lock();
            if state.done {
                drop(state);
                callback.call(Err(TaskError::cancelled("file removed")));
                return;
            }
            state.requests.push_back(Request {
                name: name.to_string(),
                add_time: Instant::now(),
                kind: RequestKind::Ast { exclusive, callback },
                invalidation,
                cancel,
            });
            self.queued_status(&mut state)
        };
        self.requests_cv.notify_all();
        self.emit(status);
    }

    /// Latest submitted version and contents
    pub fn submitted(&self) -> Option<(String, Arc<str>)> {
        self.state.lock().submitted.clone()
    }

    /// Stop both threads; queued requests fail with `Cancelled`
    pub fn stop(&self, reason: &str) {
        let drained: Vec<Request> = {
            let mut state = self.state.lock();
            if state.done {
                return;
            }
            state.done = true;
            self.root.cancel(reason);
            state.preamble_slot = None;
            state.preamble_requests.clear();
            state.requests.drain(..).collect()
        };
        for request in drained {
            if let RequestKind::Ast { callback, .. } = request.kind {
                callback.call(Err(TaskError::cancelled(reason)));
            }
        }
        self.ctx.ast_cache.remove(&self.path);
        self.requests_cv.notify_all();
        self.preamble_cv.notify_all();
        self.idle_cv.notify_all();
    }

    /// Wait for this file's queue and preamble builds to drain
    pub fn block_until_idle(&self, deadline: Deadline) -> bool {
        fn worker_idle(s: &mut WorkerState) -> bool {
            s.done || (s.requests.is_empty() && s.preamble_requests.is_empty() && s.running.is_none())
        }
        fn preamble_idle(s: &mut WorkerState) -> bool {
            s.done || (s.preamble_slot.is_none() && s.preamble_building.is_none())
        }
        let mut state = self.state.lock();
        // An idle worker may still be waiting on a preamble whose result
        // queues more work for it.
        wait_until(&mut state, &self.idle_cv, deadline, worker_idle)
            && wait_until(&mut state, &self.idle_cv, deadline, preamble_idle)
            && wait_until(&mut state, &self.idle_cv, deadline, worker_idle)
    }

    pub fn used_memory(&self) -> (usize, usize) {
        let preamble = self
            .state
            .lock()
            .latest_preamble
            .as_ref()
            .map_or(0, |p| p.estimated_bytes());
        (self.ctx.ast_cache.used_bytes(&self.path), preamble)
    }

    // ========================================================================
    // Worker loop
    // ========================================================================

    fn run(self: Arc<Self>) {
        loop {
            let job = {
                let mut state = self.state.lock();
                loop {
                    if state.done {
                        break None;
                    }
                    if let Some(preamble) = state.preamble_requests.pop_front() {
                        state.running = Some(RunningRequest {
                            invalidation: Invalidation::NoInvalidation,
                            cancel: self.root.clone(),
                        });
                        break Some(Job::Preamble(preamble));
                    }
                    if state.requests.is_empty() {
                        self.requests_cv.wait(&mut state);
                        continue;
                    }
                    match self.schedule_locked(&mut state) {
                        Some(deadline) => {
                            self.requests_cv.wait_until(&mut state, deadline);
                        }
                        None => match state.requests.pop_front() {
                            Some(request) => {
                                state.running = Some(RunningRequest {
                                    invalidation: request.invalidation,
                                    cancel: request.cancel.clone(),
                                });
                                break Some(Job::Request(request));
                            }
                            None => continue,
                        },
                    }
                }
            };
            let Some(job) = job else {
                break;
            };

            match job {
                Job::Preamble(request) => self.handle_preamble_request(request),
                Job::Request(request) => self.handle_request(request),
            }

            let status = {
                let mut state = self.state.lock();
                state.running = None;
                self.queued_status(&mut state)
            };
            self.emit(status);
            self.idle_cv.notify_all();
        }
        tracing::debug!("AST worker for {} stopped", self.path.display());
    }

    /// Pick the next request to run. Returns the instant to wait for when
    /// the head is a debounced update.
    fn schedule_locked(&self, state: &mut WorkerState) -> Option<Instant> {
        // Cancelled reads go first so their callers hear about it promptly
        let cancelled = state
            .requests
            .iter()
            .position(|r| !r.is_update() && r.cancel.is_cancelled());
        if let Some(pos) = cancelled {
            if let Some(request) = state.requests.remove(pos) {
                state.requests.push_front(request);
            }
            return None;
        }

        while should_skip_head(&state.requests) {
            if let Some(skipped) = state.requests.pop_front() {
                tracing::debug!("Skipping {} for {}", skipped.name, self.path.display());
            }
        }

        let front = state.requests.front()?;
        if state
            .requests
            .iter()
            .any(|r| r.want().map_or(true, |w| w == WantDiagnostics::Yes))
        {
            return None;
        }
        let deadline = front.add_time + self.ctx.debounce.compute(&state.rebuild_times);
        if Instant::now() >= deadline {
            None
        } else {
            Some(deadline)
        }
    }

    fn handle_request(self: &Arc<Self>, request: Request) {
        let stage = match &request.kind {
            RequestKind::Update { .. } => BuildStage::RunningAction("Update".to_string()),
            RequestKind::Ast { .. } => BuildStage::RunningAction(request.name.clone()),
        };
        self.set_stage(stage);

        let Request {
            name,
            kind,
            invalidation,
            cancel,
            ..
        } = request;
        match kind {
            RequestKind::Update { seq, inputs, want } => self.process_update(seq, inputs, want),
            RequestKind::Ast { exclusive, callback } => {
                self.process_read(&name, exclusive, invalidation, cancel, callback)
            }
        }
    }

    /// Resolve the command for the new inputs and hand them to the preamble
    /// thread
    fn process_update(&self, seq: u64, mut inputs: ParseInputs, want: WantDiagnostics) {
        let ctx = &self.ctx;
        let config = ctx.config.get(&self.path);
        let mut command = ctx
            .cdb
            .get_command(&self.path)
            .unwrap_or_else(|| ctx.cdb.fallback_command(&self.path));
        config.apply_to_command(&mut command);
        inputs.command = command;
        for code in &config.diagnostics.suppress {
            if !inputs.options.suppressed_codes.contains(code) {
                inputs.options.suppressed_codes.push(code.clone());
            }
        }

        let region_hash = ctx.preambles.region_hash(&inputs.contents);
        let command_hash = inputs.command.hash();
        let force = inputs.force_rebuild;
        tracing::debug!(
            "Update {} of {} (seq {}, {:?})",
            inputs.version,
            self.path.display(),
            seq,
            inputs.command.arguments
        );
        let file_inputs = Arc::new(FileInputs {
            seq,
            inputs: Arc::new(inputs),
        });

        let mut state = self.state.lock();
        // Diagnostics promised for a version are never dropped: wait for a
        // pending must-publish input to be picked up before replacing it.
        while !state.done
            && state
                .preamble_slot
                .as_ref()
                .is_some_and(|task| task.want == WantDiagnostics::Yes)
        {
            self.preamble_cv.wait(&mut state);
        }
        if state.done {
            return;
        }
        if let Some(building) = &state.preamble_building {
            let stale = force || building.region_hash != region_hash || building.command_hash != command_hash;
            if stale && building.want != WantDiagnostics::Yes {
                building.cancel.cancel(SUPERSEDED);
            }
        }
        state.current = Some(Arc::clone(&file_inputs));
        state.preamble_slot = Some(PreambleTask {
            inputs: file_inputs,
            want,
        });
        drop(state);
        self.preamble_cv.notify_all();
    }

    fn process_read(
        self: &Arc<Self>,
        name: &str,
        exclusive: bool,
        invalidation: Invalidation,
        cancel: CancelToken,
        callback: Callback<InputsAndAst>,
    ) {
        let prepared = self.prepare_ast(&cancel);
        let (inputs, ast, permit) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::debug!("{} on {} failed: {}", name, self.path.display(), e);
                callback.call(Err(e));
                return;
            }
        };
        let snapshot = InputsAndAst { inputs, ast };

        if exclusive {
            callback.call(Ok(snapshot));
            drop(permit);
            return;
        }
        drop(permit);

        // Read-only actions on the same snapshot run concurrently
        let dispatch_id = (invalidation == Invalidation::InvalidateOnUpdate).then(|| {
            let mut state = self.state.lock();
            let id = state.next_dispatch;
            state.next_dispatch += 1;
            state.dispatched.push((id, cancel.clone()));
            id
        });
        let worker = Arc::clone(self);
        self.ctx.actions.run_async(name.to_string(), move || {
            let result = worker
                .ctx
                .barrier
                .acquire(&cancel, Deadline::infinity())
                .and_then(|permit| cancel.check().map(|()| permit));
            match result {
                Ok(_permit) => callback.call(Ok(snapshot)),
                Err(e) => callback.call(Err(e)),
            }
            if let Some(id) = dispatch_id {
                worker.state.lock().dispatched.retain(|(i, _)| *i != id);
            }
        });
    }

    /// Wait for the preamble of the current inputs, then get or build the
    /// AST while holding a build permit
    fn prepare_ast(
        &self,
        cancel: &CancelToken,
    ) -> TaskResult<(Arc<ParseInputs>, Arc<ParsedAst>, SemaphorePermit)> {
        cancel.check()?;
        let (current, preamble, failure) = {
            let mut state = self.state.lock();
            let Some(current) = state.current.clone() else {
                return Err(TaskError::invalid(format!(
                    "no contents for {}",
                    self.path.display()
                )));
            };
            loop {
                if state.done {
                    return Err(TaskError::cancelled("file removed"));
                }
                cancel.check()?;
                if state.preamble_seq_done.is_some_and(|done| done >= current.seq) {
                    break;
                }
                self.preamble_cv.wait_for(&mut state, CANCEL_POLL);
            }
            (current, state.latest_preamble.clone(), state.preamble_failure.clone())
        };
        let Some(preamble) = preamble else {
            return Err(TaskError::BuildFailure {
                path: self.path.clone(),
                diagnostics: failure.unwrap_or_default(),
            });
        };

        let permit = self.ctx.barrier.acquire(cancel, Deadline::infinity())?;
        let ast = self
            .build_ast(&current, preamble, cancel)
            .map_err(|e| self.build_error(e))?;
        Ok((Arc::clone(&current.inputs), ast, permit))
    }

    fn build_ast(
        &self,
        inputs: &FileInputs,
        preamble: Arc<Preamble>,
        cancel: &CancelToken,
    ) -> std::result::Result<Arc<ParsedAst>, BuildError> {
        if let Some(ast) = self.ctx.ast_cache.get(&self.path, inputs.seq) {
            return Ok(ast);
        }
        let ast = Arc::new(ParsedAst::build(
            &*self.ctx.frontend,
            &self.path,
            &inputs.inputs,
            preamble,
            cancel,
        )?);
        self.ast_builds.fetch_add(1, Ordering::SeqCst);
        self.ctx.ast_cache.put(&self.path, inputs.seq, Arc::clone(&ast));
        Ok(ast)
    }

    fn build_error(&self, error: BuildError) -> TaskError {
        match error {
            BuildError::Cancelled(reason) => TaskError::Cancelled { reason },
            BuildError::Failed(diagnostics) => TaskError::BuildFailure {
                path: self.path.clone(),
                diagnostics,
            },
        }
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    fn handle_preamble_request(&self, request: PreambleRequest) {
        let PreambleRequest { inputs, want, result } = request;
        if let Ok((_, true)) = &result {
            self.ctx.callbacks.on_preamble_published(&self.path);
        }
        if want == WantDiagnostics::No {
            return;
        }
        if want == WantDiagnostics::Auto && self.diagnostics_superseded(inputs.seq) {
            tracing::debug!(
                "Skipping diagnostics of {} version {}: superseded",
                self.path.display(),
                inputs.inputs.version
            );
            return;
        }

        let publisher = Publisher {
            worker: self,
            seq: inputs.seq,
        };
        let (preamble, preamble_time) = match result {
            Ok((preamble, built)) => {
                let time = if built { preamble.build_time } else { Duration::ZERO };
                (preamble, time)
            }
            Err(diagnostics) => {
                self.ctx
                    .callbacks
                    .on_failed_ast(&self.path, &inputs.inputs.version, diagnostics, publisher);
                return;
            }
        };

        self.set_stage(BuildStage::BuildingFile);
        let cancel = self.root.child();
        let built = match self.ctx.barrier.acquire(&cancel, Deadline::infinity()) {
            Ok(_permit) => self.build_ast(&inputs, preamble, &cancel),
            Err(e) => Err(BuildError::from(e)),
        };
        match built {
            Ok(ast) => {
                self.record_rebuild(preamble_time + ast.build_time);
                self.ctx.callbacks.on_main_ast(&self.path, &ast, publisher);
            }
            Err(BuildError::Failed(diagnostics)) => {
                self.ctx
                    .callbacks
                    .on_failed_ast(&self.path, &inputs.inputs.version, diagnostics, publisher);
            }
            Err(BuildError::Cancelled(reason)) => {
                tracing::debug!("Diagnostics build of {} cancelled: {}", self.path.display(), reason);
            }
        }
    }

    /// A newer update exists whose diagnostics would replace these
    fn diagnostics_superseded(&self, seq: u64) -> bool {
        let state = self.state.lock();
        state.current.as_ref().is_some_and(|c| c.seq > seq)
            || state
                .requests
                .iter()
                .any(|r| r.want().is_some_and(|w| w != WantDiagnostics::No))
    }

    fn record_rebuild(&self, duration: Duration) {
        let mut state = self.state.lock();
        if state.rebuild_times.len() >= REBUILD_HISTORY {
            state.rebuild_times.remove(0);
        }
        state.rebuild_times.push(duration);
    }

    /// Run `publish` if the file is still tracked and nothing newer was
    /// published. Serialized per file.
    pub(crate) fn publish_if_current(&self, seq: u64, publish: impl FnOnce()) -> bool {
        let mut last = self.publish.lock();
        if self.root.is_cancelled() || last.is_some_and(|l| l > seq) {
            return false;
        }
        *last = Some(seq);
        publish();
        drop(last);
        let status = {
            let mut state = self.state.lock();
            state.status.last_publish = Some(now_millis());
            Some(state.status.clone())
        };
        self.emit(status);
        true
    }

    // ========================================================================
    // Status
    // ========================================================================

    fn queued_status(&self, state: &mut MutexGuard<'_, WorkerState>) -> Option<TuStatus> {
        let depth = state.requests.len();
        let stage = if state.running.is_some() {
            state.status.stage.clone()
        } else if depth > 0 {
            BuildStage::Queued
        } else {
            BuildStage::Idle
        };
        update_status(state, |s| {
            s.queue_depth = depth;
            s.stage = stage;
        })
    }

    fn set_stage(&self, stage: BuildStage) {
        let status = {
            let mut state = self.state.lock();
            let depth = state.requests.len();
            update_status(&mut state, |s| {
                s.stage = stage;
                s.queue_depth = depth;
            })
        };
        self.emit(status);
    }

    pub(crate) fn emit(&self, status: Option<TuStatus>) {
        if let Some(status) = status {
            self.ctx.callbacks.on_file_updated(&self.path, &status);
        }
    }
}

/// Apply `f` and return the new status if it changed
pub(crate) fn update_status(state: &mut WorkerState, f: impl FnOnce(&mut TuStatus)) -> Option<TuStatus> {
    let before = state.status.clone();
    f(&mut state.status);
    (state.status != before).then(|| state.status.clone())
}

/// Cancel reads that asked to be invalidated by edits
fn invalidate_reads(state: &WorkerState) {
    let queued = state
        .requests
        .iter()
        .filter(|r| r.invalidation == Invalidation::InvalidateOnUpdate)
        .map(|r| &r.cancel);
    let running = state
        .running
        .iter()
        .filter(|r| r.invalidation == Invalidation::InvalidateOnUpdate)
        .map(|r| &r.cancel);
    let dispatched = state.dispatched.iter().map(|(_, c)| c);
    for token in queued.chain(running).chain(dispatched) {
        token.cancel(INVALIDATED);
    }
}

/// An update at the head is dead if the next request is another update and
/// its diagnostics are not needed.
fn should_skip_head(requests: &VecDeque<Request>) -> bool {
    let mut iter = requests.iter();
    let Some(want) = iter.next().and_then(Request::want) else {
        return false;
    };
    let mut rest = iter.peekable();
    if !rest.peek().is_some_and(|next| next.is_update()) {
        return false;
    }
    match want {
        WantDiagnostics::Yes => false,
        WantDiagnostics::No => true,
        WantDiagnostics::Auto => rest.any(|r| r.want().is_some_and(|w| w != WantDiagnostics::No)),
    }
}

impl std::fmt::Debug for FileWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWorker").field("path", &self.path).finish()
    }
}
