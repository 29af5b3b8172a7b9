//! Compilation databases: where per-file build commands come from
//!
//! The scheduler asks for a command every time it processes an update; the
//! background indexer asks for the full list of units. Databases broadcast
//! changed files to subscribers so indexes can be refreshed, and expose an
//! idle barrier for asynchronous reloads.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::schema::fnv1a_hash;
use crate::threading::{AsyncTaskRunner, Deadline};

/// Command used to build one file
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompileCommand {
    /// Working directory of the compiler invocation
    pub directory: PathBuf,
    pub file: PathBuf,
    /// argv, compiler first
    pub arguments: Vec<String>,
    /// Set when the command was guessed rather than read from a database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heuristic: Option<String>,
}

impl CompileCommand {
    pub fn new(directory: impl Into<PathBuf>, file: impl Into<PathBuf>, arguments: Vec<String>) -> Self {
        Self {
            directory: directory.into(),
            file: file.into(),
            arguments,
            heuristic: None,
        }
    }

    /// `-I` search directories, resolved against `directory`
    pub fn include_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        let mut args = self.arguments.iter();
        while let Some(arg) = args.next() {
            let dir = if arg == "-I" {
                args.next().map(String::as_str)
            } else {
                arg.strip_prefix("-I").filter(|d| !d.is_empty())
            };
            if let Some(dir) = dir {
                dirs.push(self.directory.join(dir));
            }
        }
        dirs
    }

    /// Stable hash of the invocation, used to invalidate preambles and shards
    pub fn hash(&self) -> u64 {
        let mut key = self.directory.to_string_lossy().into_owned();
        for arg in &self.arguments {
            key.push('\0');
            key.push_str(arg);
        }
        fnv1a_hash(&key)
    }
}

/// Receives the files whose commands changed
pub type CommandListener = Box<dyn Fn(&[PathBuf]) + Send + Sync>;

/// Supplies compile commands
pub trait CompilationDatabase: Send + Sync {
    fn get_command(&self, path: &Path) -> Option<CompileCommand>;

    /// Command used when the database knows nothing about `path`
    fn fallback_command(&self, path: &Path) -> CompileCommand {
        let directory = path.parent().map(Path::to_path_buf).unwrap_or_default();
        CompileCommand {
            directory,
            file: path.to_path_buf(),
            arguments: vec!["cc".to_string(), path.to_string_lossy().into_owned()],
            heuristic: Some("fallback".to_string()),
        }
    }

    /// Every file the database has a command for
    fn all_files(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    fn subscribe(&self, _listener: CommandListener) {}

    /// Wait for any in-progress reload
    fn block_until_idle(&self, _deadline: Deadline) -> bool {
        true
    }
}

#[derive(Default)]
struct Listeners(Mutex<Vec<CommandListener>>);

impl Listeners {
    fn add(&self, listener: CommandListener) {
        self.0.lock().push(listener);
    }

    fn broadcast(&self, changed: &[PathBuf]) {
        if changed.is_empty() {
            return;
        }
        tracing::debug!("Compile commands changed for {} files", changed.len());
        for listener in self.0.lock().iter() {
            listener(changed);
        }
    }
}

// ============================================================================
// In-memory database
// ============================================================================

/// Database populated programmatically
#[derive(Default)]
pub struct InMemoryCompilationDatabase {
    commands: RwLock<HashMap<PathBuf, CompileCommand>>,
    fallback_flags: Vec<String>,
    listeners: Listeners,
}

impl InMemoryCompilationDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra flags appended to fallback commands
    pub fn with_fallback_flags(flags: Vec<String>) -> Self {
        Self {
            fallback_flags: flags,
            ..Self::default()
        }
    }

    pub fn set_command(&self, path: impl Into<PathBuf>, command: CompileCommand) {
        let path = path.into();
        let changed = self.commands.write().insert(path.clone(), command.clone()) != Some(command);
        if changed {
            self.listeners.broadcast(&[path]);
        }
    }

    pub fn remove_command(&self, path: &Path) {
        if self.commands.write().remove(path).is_some() {
            self.listeners.broadcast(&[path.to_path_buf()]);
        }
    }
}

impl CompilationDatabase for InMemoryCompilationDatabase {
    fn get_command(&self, path: &Path) -> Option<CompileCommand> {
        self.commands.read().get(path).cloned()
    }

    fn fallback_command(&self, path: &Path) -> CompileCommand {
        let directory = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let mut arguments = vec!["cc".to_string()];
        arguments.extend(self.fallback_flags.iter().cloned());
        arguments.push(path.to_string_lossy().into_owned());
        CompileCommand {
            directory,
            file: path.to_path_buf(),
            arguments,
            heuristic: Some("fallback".to_string()),
        }
    }

    fn all_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = self.commands.read().keys().cloned().collect();
        files.sort();
        files
    }

    fn subscribe(&self, listener: CommandListener) {
        self.listeners.add(listener);
    }
}

// ============================================================================
// compile_commands.json
// ============================================================================

/// One entry of compile_commands.json
#[derive(Debug, Clone, Deserialize)]
struct JsonEntry {
    directory: PathBuf,
    file: PathBuf,
    #[serde(default)]
    arguments: Option<Vec<String>>,
    #[serde(default)]
    command: Option<String>,
}

impl JsonEntry {
    fn into_command(self) -> Option<CompileCommand> {
        let arguments = match (self.arguments, self.command) {
            (Some(args), _) => args,
            // Shell quoting is not interpreted; quoted paths with spaces break
            (None, Some(cmd)) => cmd.split_whitespace().map(str::to_string).collect(),
            (None, None) => return None,
        };
        let file = if self.file.is_absolute() {
            self.file
        } else {
            self.directory.join(&self.file)
        };
        Some(CompileCommand::new(self.directory, file, arguments))
    }
}

/// Parse the contents of a compile_commands.json file
pub fn parse_compile_commands(json: &str) -> Result<HashMap<PathBuf, CompileCommand>> {
    let entries: Vec<JsonEntry> = serde_json::from_str(json)?;
    Ok(entries
        .into_iter()
        .filter_map(JsonEntry::into_command)
        .map(|c| (c.file.clone(), c))
        .collect())
}

struct JsonDbInner {
    path: PathBuf,
    commands: RwLock<HashMap<PathBuf, CompileCommand>>,
    listeners: Listeners,
}

impl JsonDbInner {
    fn reload(&self) -> Result<Vec<PathBuf>> {
        let json = fs::read_to_string(&self.path).map_err(|e| Error::CompileDatabase {
            message: format!("{}: {}", self.path.display(), e),
        })?;
        let fresh = parse_compile_commands(&json)?;

        let mut commands = self.commands.write();
        let mut changed: Vec<PathBuf> = fresh
            .iter()
            .filter(|(path, cmd)| commands.get(*path) != Some(*cmd))
            .map(|(path, _)| path.clone())
            .collect();
        changed.extend(commands.keys().filter(|p| !fresh.contains_key(*p)).cloned());
        changed.sort();
        *commands = fresh;
        drop(commands);

        self.listeners.broadcast(&changed);
        Ok(changed)
    }
}

/// Database backed by a compile_commands.json file, reloadable in the
/// background
pub struct JsonCompilationDatabase {
    inner: Arc<JsonDbInner>,
    reloads: Arc<AsyncTaskRunner>,
}

impl JsonCompilationDatabase {
    /// Load `path` synchronously
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let db = Self {
            inner: Arc::new(JsonDbInner {
                path: path.into(),
                commands: RwLock::new(HashMap::new()),
                listeners: Listeners::default(),
            }),
            reloads: AsyncTaskRunner::new(),
        };
        db.inner.reload()?;
        tracing::info!(
            "Loaded {} compile commands from {}",
            db.inner.commands.read().len(),
            db.inner.path.display()
        );
        Ok(db)
    }

    /// Reload now; returns files whose commands changed
    pub fn reload(&self) -> Result<Vec<PathBuf>> {
        self.inner.reload()
    }

    /// Reload on a background thread; `block_until_idle` waits for it
    pub fn reload_async(&self) {
        let inner = Arc::clone(&self.inner);
        self.reloads.run_async("cdb-reload", move || {
            if let Err(e) = inner.reload() {
                tracing::warn!("Failed to reload {}: {}", inner.path.display(), e);
            }
        });
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl CompilationDatabase for JsonCompilationDatabase {
    fn get_command(&self, path: &Path) -> Option<CompileCommand> {
        self.inner.commands.read().get(path).cloned()
    }

    fn all_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = self.inner.commands.read().keys().cloned().collect();
        files.sort();
        files
    }

    fn subscribe(&self, listener: CommandListener) {
        self.inner.listeners.add(listener);
    }

    fn block_until_idle(&self, deadline: Deadline) -> bool {
        self.reloads.wait(deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cmd(args: &[&str]) -> CompileCommand {
        CompileCommand::new("/proj", "/proj/a.c", args.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_include_dirs() {
        let c = cmd(&["cc", "-Iinclude", "-I", "/abs", "-I", "-c", "a.c"]);
        assert_eq!(
            c.include_dirs(),
            vec![
                PathBuf::from("/proj/include"),
                PathBuf::from("/abs"),
                PathBuf::from("/proj/-c"),
            ]
        );
    }

    #[test]
    fn test_command_hash_changes_with_flags() {
        assert_eq!(cmd(&["cc", "a.c"]).hash(), cmd(&["cc", "a.c"]).hash());
        assert_ne!(cmd(&["cc", "a.c"]).hash(), cmd(&["cc", "-O2", "a.c"]).hash());
    }

    #[test]
    fn test_in_memory_broadcasts_changes_only() {
        let db = InMemoryCompilationDatabase::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        db.subscribe(Box::new(move |files| {
            s.fetch_add(files.len(), Ordering::SeqCst);
        }));
        db.set_command("/proj/a.c", cmd(&["cc", "a.c"]));
        db.set_command("/proj/a.c", cmd(&["cc", "a.c"]));
        db.set_command("/proj/a.c", cmd(&["cc", "-g", "a.c"]));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(db.all_files(), vec![PathBuf::from("/proj/a.c")]);
    }

    #[test]
    fn test_fallback_command() {
        let db = InMemoryCompilationDatabase::with_fallback_flags(vec!["-std=c11".to_string()]);
        let c = db.fallback_command(Path::new("/x/y.c"));
        assert_eq!(c.arguments, vec!["cc", "-std=c11", "/x/y.c"]);
        assert_eq!(c.heuristic.as_deref(), Some("fallback"));
        assert!(db.get_command(Path::new("/x/y.c")).is_none());
    }

    #[test]
    fn test_parse_compile_commands() {
        let json = r#"[
            {"directory": "/p", "file": "a.c", "arguments": ["cc", "-Iinc", "a.c"]},
            {"directory": "/p", "file": "/p/b.c", "command": "cc -DX b.c"},
            {"directory": "/p", "file": "c.c"}
        ]"#;
        let commands = parse_compile_commands(json).unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[Path::new("/p/a.c")].include_dirs(), vec![PathBuf::from("/p/inc")]);
        assert_eq!(commands[Path::new("/p/b.c")].arguments, vec!["cc", "-DX", "b.c"]);
    }

    #[test]
    fn test_json_database_reload_reports_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compile_commands.json");
        fs::write(&path, r#"[{"directory": "/p", "file": "a.c", "arguments": ["cc", "a.c"]}]"#).unwrap();

        let db = JsonCompilationDatabase::load(&path).unwrap();
        assert_eq!(db.all_files(), vec![PathBuf::from("/p/a.c")]);

        fs::write(
            &path,
            r#"[{"directory": "/p", "file": "a.c", "arguments": ["cc", "-g", "a.c"]},
                {"directory": "/p", "file": "b.c", "arguments": ["cc", "b.c"]}]"#,
        )
        .unwrap();
        let changed = db.reload().unwrap();
        assert_eq!(changed, vec![PathBuf::from("/p/a.c"), PathBuf::from("/p/b.c")]);

        db.reload_async();
        assert!(db.block_until_idle(Deadline::after(std::time::Duration::from_secs(10))));
    }

    #[test]
    fn test_json_database_missing_file() {
        let err = JsonCompilationDatabase::load("/definitely/not/here.json").err().unwrap();
        assert!(matches!(err, Error::CompileDatabase { .. }));
    }
}
