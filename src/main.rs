//! semfora-sched CLI entry point

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use semfora_scheduler::cli::{Cli, Commands};
use semfora_scheduler::commands::{run_check, run_index, run_profile, run_symbols, CommandContext};
use semfora_scheduler::Error;

fn main() -> ExitCode {
    match run() {
        Ok(output) => {
            print!("{}", output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            match e.downcast_ref::<Error>() {
                Some(err) => err.exit_code(),
                None => ExitCode::FAILURE,
            }
        }
    }
}

fn run() -> anyhow::Result<String> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output and events
    let directive = if cli.verbose {
        "semfora_scheduler=debug"
    } else {
        "semfora_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .with_writer(std::io::stderr)
        .init();

    let ctx = CommandContext::load(cli.options.as_deref(), cli.verbose)
        .context("failed to load server options")?;

    let output = match &cli.command {
        Commands::Check(args) => run_check(args, &ctx)?,
        Commands::Index(args) => run_index(args, &ctx)?,
        Commands::Symbols(args) => run_symbols(args, &ctx)?,
        Commands::Profile(args) => run_profile(args, &ctx)?,
    };
    Ok(output)
}
