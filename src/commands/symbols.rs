//! Symbols command handler - workspace symbol query

use std::fmt::Write as _;
use std::sync::Arc;

use crate::cli::SymbolsArgs;
use crate::commands::index::index_project;
use crate::commands::CommandContext;
use crate::error::Result;
use crate::index::IndexEntry;
use crate::server::NoopServerCallbacks;

/// Run the symbols command
pub fn run_symbols(args: &SymbolsArgs, ctx: &CommandContext) -> Result<String> {
    let server = index_project(
        ctx,
        &args.compile_commands,
        args.timeout,
        Arc::new(NoopServerCallbacks),
    )?;
    let entries = server.workspace_symbols(&args.query, Some(args.limit));

    if args.json {
        return Ok(format!("{}\n", serde_json::to_string_pretty(&entries)?));
    }
    Ok(format_entries(&entries))
}

/// One `kind scope::name path:line:column [tier]` line per entry
fn format_entries(entries: &[IndexEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        let symbol = &entry.symbol;
        let name = if symbol.scope.is_empty() {
            symbol.name.clone()
        } else {
            format!("{}::{}", symbol.scope, symbol.name)
        };
        let _ = writeln!(
            out,
            "{:<10} {} {}:{}:{} [{}]",
            symbol.kind.as_str(),
            name,
            symbol.location.path.display(),
            symbol.location.line,
            symbol.location.column,
            entry.tier
        );
    }
    if entries.is_empty() {
        out.push_str("no symbols found\n");
    }
    out
}
