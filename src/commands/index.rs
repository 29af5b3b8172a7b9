//! Index command handler - build the background index of a project

use std::path::Path;
use std::sync::Arc;

use crate::cli::IndexArgs;
use crate::commands::{load_project, wait_idle, CommandContext};
use crate::error::Result;
use crate::events::EventEmitter;
use crate::server::{Server, ServerCallbacks};

/// Run the index command.
///
/// Progress is streamed to stdout as `indexing_progress` events; the
/// returned text is a one-line summary.
pub fn run_index(args: &IndexArgs, ctx: &CommandContext) -> Result<String> {
    let emitter = Arc::new(EventEmitter::stdout());
    let server = index_project(ctx, &args.compile_commands, args.timeout, emitter)?;

    let stats = server.background().map(|b| b.stats()).unwrap_or_default();
    Ok(format!(
        "indexed {} of {} units ({} failed), {} symbols\n",
        stats.completed,
        stats.enqueued,
        stats.failed,
        server.workspace_symbols("", None).len()
    ))
}

/// Start a server for the project of `compile_commands` with background
/// indexing on, and wait for the first pass to finish
pub(crate) fn index_project(
    ctx: &CommandContext,
    compile_commands: &Path,
    timeout_secs: u64,
    callbacks: Arc<dyn ServerCallbacks>,
) -> Result<Server> {
    let (cdb, root) = load_project(compile_commands)?;
    let mut options = ctx.options.clone();
    options.background.enabled = true;

    let server = ctx.start_server(options, cdb, Some(&root), callbacks)?;
    wait_idle(&server, timeout_secs)?;
    if ctx.verbose {
        if let Some(background) = server.background() {
            tracing::info!("Background index holds {} units", background.index().units().len());
        }
    }
    Ok(server)
}
