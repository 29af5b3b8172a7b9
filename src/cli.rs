//! CLI argument definitions using clap with subcommand architecture
//!
//! The binary drives a `Server` in process: open files and wait for their
//! diagnostics, index a compile_commands.json project, or query the merged
//! symbol index.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Build scheduler and symbol index for C-family projects
#[derive(Parser, Debug)]
#[command(name = "semfora-sched")]
#[command(about = "Schedules preamble and AST builds for open files and maintains a tiered symbol index")]
#[command(version)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Server options file (TOML)
    #[arg(long, value_name = "FILE", global = true)]
    pub options: Option<PathBuf>,

    /// Show verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

// ============================================
// Main Commands Enum
// ============================================

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Open files, wait for their builds and print diagnostics as JSON lines
    #[command(visible_alias = "c")]
    Check(CheckArgs),

    /// Build the background index for a compile_commands.json project
    Index(IndexArgs),

    /// Index a project, then query workspace symbols
    #[command(visible_alias = "s")]
    Symbols(SymbolsArgs),

    /// Print the memory usage tree after indexing a project
    Profile(ProfileArgs),
}

// ============================================
// Check Subcommand
// ============================================

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Files to open
    #[arg(value_name = "FILE", required = true)]
    pub files: Vec<PathBuf>,

    /// compile_commands.json to take compile commands from
    #[arg(long, value_name = "FILE")]
    pub compile_commands: Option<PathBuf>,

    /// Also print file status events
    #[arg(long)]
    pub status: bool,

    /// Seconds to wait for all builds to finish
    #[arg(long, default_value = "60")]
    pub timeout: u64,
}

// ============================================
// Index Subcommand
// ============================================

#[derive(Args, Debug)]
pub struct IndexArgs {
    /// Path to compile_commands.json
    #[arg(value_name = "COMPILE_COMMANDS")]
    pub compile_commands: PathBuf,

    /// Seconds to wait for indexing to finish
    #[arg(long, default_value = "600")]
    pub timeout: u64,
}

// ============================================
// Symbols Subcommand
// ============================================

#[derive(Args, Debug)]
pub struct SymbolsArgs {
    /// Fuzzy query; characters must appear in order
    #[arg(value_name = "QUERY")]
    pub query: String,

    /// Path to compile_commands.json
    #[arg(long, value_name = "FILE")]
    pub compile_commands: PathBuf,

    /// Maximum number of results
    #[arg(short, long, default_value = "50")]
    pub limit: usize,

    /// Print results as JSON
    #[arg(long)]
    pub json: bool,

    /// Seconds to wait for indexing to finish
    #[arg(long, default_value = "600")]
    pub timeout: u64,
}

// ============================================
// Profile Subcommand
// ============================================

#[derive(Args, Debug)]
pub struct ProfileArgs {
    /// Path to compile_commands.json
    #[arg(value_name = "COMPILE_COMMANDS")]
    pub compile_commands: PathBuf,

    /// Print the tree as JSON
    #[arg(long)]
    pub json: bool,

    /// Seconds to wait for indexing to finish
    #[arg(long, default_value = "600")]
    pub timeout: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_check() {
        let cli = Cli::parse_from(["semfora-sched", "check", "a.c", "b.c", "--status", "-v"]);
        assert!(cli.verbose);
        match cli.command {
            Commands::Check(args) => {
                assert_eq!(args.files.len(), 2);
                assert!(args.status);
                assert_eq!(args.timeout, 60);
                assert!(args.compile_commands.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_symbols_with_global_options() {
        let cli = Cli::parse_from([
            "semfora-sched",
            "--options",
            "opts.toml",
            "symbols",
            "frob",
            "--compile-commands",
            "build/compile_commands.json",
            "--limit",
            "5",
        ]);
        assert_eq!(cli.options, Some(PathBuf::from("opts.toml")));
        match cli.command {
            Commands::Symbols(args) => {
                assert_eq!(args.query, "frob");
                assert_eq!(args.limit, 5);
                assert!(!args.json);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_check_requires_files() {
        assert!(Cli::try_parse_from(["semfora-sched", "check"]).is_err());
    }
}
