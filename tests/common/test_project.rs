//! On-disk test projects backed by a temporary directory

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// A project directory with sources and a compile_commands.json
pub struct TestProject {
    dir: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    /// Canonical root, so paths compare equal to the ones the CLI resolves
    pub fn root(&self) -> PathBuf {
        self.dir.path().canonicalize().unwrap()
    }

    /// Write `contents` to `relative` and return the absolute path
    pub fn add_file(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.root().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    /// Write a compile_commands.json listing `files` and return its path
    pub fn write_compile_commands(&self, files: &[&Path]) -> PathBuf {
        let root = self.root();
        let entries: Vec<serde_json::Value> = files
            .iter()
            .map(|file| {
                serde_json::json!({
                    "directory": root,
                    "file": file,
                    "arguments": ["cc", "-I", root.join("include"), file],
                })
            })
            .collect();
        let path = root.join("compile_commands.json");
        fs::write(&path, serde_json::to_string_pretty(&entries).unwrap()).unwrap();
        path
    }
}
