//! Preamble thread of a file worker
//!
//! Holds at most one pending input: a newer update replaces the pending one,
//! and cancels the build in flight when the preamble region or command
//! changed. At most one build runs per file. A failed build keeps the last
//! good preamble in place and reports its diagnostics.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::status::PreambleActivity;
use super::worker::{update_status, BuildingPreamble, FileWorker, PreambleRequest};
use crate::frontend::BuildError;
use crate::threading::Deadline;

impl FileWorker {
    pub(crate) fn run_preamble_thread(self: Arc<Self>) {
        loop {
            let (task, previous, cancel, status) = {
                let mut state = self.state.lock();
                let task = loop {
                    if state.done {
                        tracing::debug!("Preamble thread for {} stopped", self.path.display());
                        return;
                    }
                    if let Some(task) = state.preamble_slot.take() {
                        break task;
                    }
                    self.preamble_cv.wait(&mut state);
                };
                let cancel = self.root.child();
                state.preamble_building = Some(BuildingPreamble {
                    want: task.want,
                    region_hash: self.ctx.preambles.region_hash(&task.inputs.inputs.contents),
                    command_hash: task.inputs.inputs.command.hash(),
                    cancel: cancel.clone(),
                });
                let status = update_status(&mut state, |s| s.preamble = PreambleActivity::Building);
                (task, state.latest_preamble.clone(), cancel, status)
            };
            // The slot is free again
            self.preamble_cv.notify_all();
            self.emit(status);

            let outcome = self
                .ctx
                .barrier
                .acquire(&cancel, Deadline::infinity())
                .map_err(BuildError::from)
                .and_then(|_permit| {
                    self.ctx
                        .preambles
                        .build(&self.path, &task.inputs.inputs, previous.as_ref(), &cancel)
                });

            let result = match outcome {
                Ok(outcome) => {
                    let built = outcome.is_new();
                    let preamble = Arc::clone(outcome.preamble());
                    if built {
                        self.preamble_builds.fetch_add(1, Ordering::SeqCst);
                        // Runs before any AST can observe the new preamble
                        self.ctx
                            .callbacks
                            .on_preamble_ast(&self.path, &task.inputs.inputs.version, &preamble);
                    }
                    Some(Ok((preamble, built)))
                }
                Err(BuildError::Failed(diagnostics)) => {
                    tracing::warn!(
                        "Preamble build failed for {} version {}: {} diagnostics",
                        self.path.display(),
                        task.inputs.inputs.version,
                        diagnostics.len()
                    );
                    Some(Err(diagnostics))
                }
                Err(BuildError::Cancelled(reason)) => {
                    tracing::debug!(
                        "Preamble build for {} version {} cancelled: {}",
                        self.path.display(),
                        task.inputs.inputs.version,
                        reason
                    );
                    None
                }
            };

            let status = {
                let mut state = self.state.lock();
                state.preamble_building = None;
                if let Some(result) = result {
                    match &result {
                        Ok((preamble, _)) => {
                            state.latest_preamble = Some(Arc::clone(preamble));
                            state.preamble_failure = None;
                        }
                        Err(diagnostics) => state.preamble_failure = Some(diagnostics.clone()),
                    }
                    let seq = task.inputs.seq;
                    state.preamble_seq_done = Some(state.preamble_seq_done.map_or(seq, |s| s.max(seq)));
                    if !state.done {
                        state.preamble_requests.push_back(PreambleRequest {
                            inputs: Arc::clone(&task.inputs),
                            want: task.want,
                            result,
                        });
                    }
                }
                update_status(&mut state, |s| s.preamble = PreambleActivity::Idle)
            };
            self.emit(status);
            self.requests_cv.notify_all();
            self.preamble_cv.notify_all();
            self.idle_cv.notify_all();
        }
    }
}
