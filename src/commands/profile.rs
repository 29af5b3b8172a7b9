//! Profile command handler - memory usage after indexing

use std::sync::Arc;

use crate::cli::ProfileArgs;
use crate::commands::index::index_project;
use crate::commands::CommandContext;
use crate::error::Result;
use crate::memory::MemoryTree;
use crate::server::NoopServerCallbacks;

/// Run the profile command
pub fn run_profile(args: &ProfileArgs, ctx: &CommandContext) -> Result<String> {
    let server = index_project(
        ctx,
        &args.compile_commands,
        args.timeout,
        Arc::new(NoopServerCallbacks),
    )?;
    let mut tree = MemoryTree::new();
    server.profile(&mut tree);

    if args.json {
        Ok(format!("{}\n", serde_json::to_string_pretty(&tree)?))
    } else {
        Ok(tree.render("server"))
    }
}
