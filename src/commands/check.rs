//! Check command handler - open files and report their diagnostics

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cli::CheckArgs;
use crate::commands::{load_project, wait_idle, CommandContext};
use crate::compile_db::{CompilationDatabase, InMemoryCompilationDatabase};
use crate::error::{Error, Result};
use crate::events::EventEmitter;
use crate::task::WantDiagnostics;

/// Run the check command.
///
/// Diagnostics are streamed to stdout as `diagnostics` events while the
/// builds run; the returned text is empty.
pub fn run_check(args: &CheckArgs, ctx: &CommandContext) -> Result<String> {
    let mut files = Vec::with_capacity(args.files.len());
    for file in &args.files {
        if !file.exists() {
            return Err(Error::FileNotFound {
                path: file.display().to_string(),
            });
        }
        let path = file.canonicalize()?;
        let contents = fs::read_to_string(&path)?;
        files.push((path, contents));
    }

    let (cdb, root): (Arc<dyn CompilationDatabase>, Option<PathBuf>) =
        match &args.compile_commands {
            Some(path) => {
                let (cdb, root) = load_project(path)?;
                (cdb, Some(root))
            }
            None => (Arc::new(InMemoryCompilationDatabase::new()), None),
        };

    // Only the opened files matter here
    let mut options = ctx.options.clone();
    options.background.enabled = false;

    let emitter = Arc::new(EventEmitter::stdout().with_status(args.status));
    let server = ctx.start_server(options, cdb, root.as_deref(), emitter)?;

    for (path, contents) in &files {
        let version = server.add_document(path, "", contents, WantDiagnostics::Yes);
        if ctx.verbose {
            tracing::info!("Opened {} at version {}", path.display(), version);
        }
    }
    wait_idle(&server, args.timeout)?;

    let errors: usize = files
        .iter()
        .filter_map(|(path, _)| server.diagnostics(path))
        .map(|published| published.diagnostics.iter().filter(|d| d.is_error()).count())
        .sum();
    tracing::info!("Checked {} files: {} errors", files.len(), errors);
    Ok(String::new())
}
