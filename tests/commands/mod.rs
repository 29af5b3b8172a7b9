//! CLI command handlers over on-disk projects

use std::path::PathBuf;

use semfora_scheduler::cli::{CheckArgs, ProfileArgs, SymbolsArgs};
use semfora_scheduler::commands::{run_check, run_profile, run_symbols, CommandContext};
use semfora_scheduler::{Error, ServerOptions};
use tempfile::TempDir;

use crate::common::TestProject;

/// Context whose shards live in a temporary directory
fn context(shards: &TempDir) -> CommandContext {
    let mut options = ServerOptions::for_test();
    options.background.shard_dir = Some(shards.path().join("shards"));
    CommandContext {
        options,
        verbose: false,
    }
}

fn sample_project() -> (TestProject, PathBuf) {
    let project = TestProject::new();
    project.add_file("include/util.h", "fn declared_in_header() {}\n");
    let main = project.add_file("src/main.c", "#include <util.h>\nfn main_entry() {}\n");
    let util = project.add_file("src/util.c", "fn util_helper() {}\nconst UTIL_LIMIT = 4;\n");
    let cdb = project.write_compile_commands(&[main.as_path(), util.as_path()]);
    (project, cdb)
}

#[test]
fn test_symbols_command_text_output() {
    let shards = TempDir::new().unwrap();
    let (_project, cdb) = sample_project();
    let args = SymbolsArgs {
        query: "util".to_string(),
        compile_commands: cdb,
        limit: 10,
        json: false,
        timeout: 60,
    };
    let output = run_symbols(&args, &context(&shards)).unwrap();
    assert!(output.contains("util_helper"), "{}", output);
    assert!(output.contains("UTIL_LIMIT"), "{}", output);
    assert!(output.contains("[background]"), "{}", output);
}

#[test]
fn test_symbols_command_json_includes_header_symbols() {
    let shards = TempDir::new().unwrap();
    let (_project, cdb) = sample_project();
    let args = SymbolsArgs {
        query: "declared".to_string(),
        compile_commands: cdb,
        limit: 10,
        json: true,
        timeout: 60,
    };
    let output = run_symbols(&args, &context(&shards)).unwrap();
    let entries: serde_json::Value = serde_json::from_str(&output).unwrap();
    let entries = entries.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["symbol"]["name"], "declared_in_header");
    assert_eq!(entries[0]["tier"], "background");
}

#[test]
fn test_profile_command_json() {
    let shards = TempDir::new().unwrap();
    let (_project, cdb) = sample_project();
    let args = ProfileArgs {
        compile_commands: cdb,
        json: true,
        timeout: 60,
    };
    let output = run_profile(&args, &context(&shards)).unwrap();
    let tree: serde_json::Value = serde_json::from_str(&output).unwrap();
    assert!(tree["children"]["index"]["children"]["background"]["self"].as_u64().unwrap() > 0);
    assert!(tree["children"].get("background_indexer").is_some());
}

#[test]
fn test_check_command_missing_file() {
    let shards = TempDir::new().unwrap();
    let args = CheckArgs {
        files: vec![PathBuf::from("/definitely/not/here.c")],
        compile_commands: None,
        status: false,
        timeout: 5,
    };
    let err = run_check(&args, &context(&shards)).unwrap_err();
    assert!(matches!(err, Error::FileNotFound { .. }));
}

#[test]
fn test_symbols_command_missing_database() {
    let shards = TempDir::new().unwrap();
    let args = SymbolsArgs {
        query: "x".to_string(),
        compile_commands: shards.path().join("compile_commands.json"),
        limit: 10,
        json: false,
        timeout: 5,
    };
    let err = run_symbols(&args, &context(&shards)).unwrap_err();
    assert!(matches!(err, Error::FileNotFound { .. }));
}
