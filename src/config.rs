//! Server options and per-file configuration
//!
//! Two layers:
//! - `ServerOptions` - process-wide knobs (pool sizes, debounce, shard
//!   location), read once from TOML at startup
//! - `Config` - per-file policy (compile flag edits, background indexing,
//!   suppressed diagnostics), served by a `ConfigProvider` that re-reads its
//!   source at most once per freshness window
//!
//! A project config lives in the nearest `.semfora-sched.toml`:
//!
//! ```toml
//! [compile_flags]
//! add = ["-DDEBUG"]
//! remove = ["-Werror"]
//!
//! [index]
//! background = "skip"
//!
//! [diagnostics]
//! suppress = ["pp_file_not_found"]
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::compile_db::CompileCommand;
use crate::error::{Error, Result};
use crate::fs::Filesystem;
use crate::schema::Diagnostic;

/// File name looked up by `DirectoryConfigSource`
pub const CONFIG_FILE_NAME: &str = ".semfora-sched.toml";

// ============================================================================
// Server options
// ============================================================================

/// Process-wide options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerOptions {
    #[serde(default)]
    pub scheduler: SchedulerOptions,

    #[serde(default)]
    pub background: BackgroundOptions,

    /// Maintain the Dynamic tier for open files
    #[serde(default = "default_true")]
    pub build_dynamic_index: bool,

    /// JSON symbol file loaded as the Static tier
    #[serde(default)]
    pub static_index: Option<PathBuf>,

    /// How long a per-file `Config` is trusted before it is re-read
    #[serde(default = "default_config_freshness_ms")]
    pub config_freshness_ms: u64,
}

/// Interactive scheduler options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerOptions {
    /// Permits of the interactive barrier; every build and action holds one
    #[serde(default = "default_async_threads")]
    pub async_threads_count: usize,

    #[serde(default)]
    pub debounce: DebounceOptions,

    /// Number of parsed ASTs kept resident
    #[serde(default = "default_ast_cache_size")]
    pub ast_cache_size: usize,
}

/// Update debounce policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebounceOptions {
    #[serde(default = "default_debounce_min_ms")]
    pub min_ms: u64,

    #[serde(default = "default_debounce_max_ms")]
    pub max_ms: u64,

    /// Multiplier applied to the median of recent rebuild durations
    #[serde(default = "default_rebuild_ratio")]
    pub rebuild_ratio: f64,

    /// Overrides the adaptive policy when set
    #[serde(default)]
    pub fixed_ms: Option<u64>,
}

/// Background indexing options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundOptions {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Worker threads; `None` follows `async_threads_count`
    #[serde(default)]
    pub threads: Option<usize>,

    /// Shard directory; `None` uses the user cache directory
    #[serde(default)]
    pub shard_dir: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_config_freshness_ms() -> u64 {
    5000
}

fn default_async_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_ast_cache_size() -> usize {
    3
}

fn default_debounce_min_ms() -> u64 {
    50
}

fn default_debounce_max_ms() -> u64 {
    500
}

fn default_rebuild_ratio() -> f64 {
    1.0
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            scheduler: SchedulerOptions::default(),
            background: BackgroundOptions::default(),
            build_dynamic_index: true,
            static_index: None,
            config_freshness_ms: default_config_freshness_ms(),
        }
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            async_threads_count: default_async_threads(),
            debounce: DebounceOptions::default(),
            ast_cache_size: default_ast_cache_size(),
        }
    }
}

impl Default for DebounceOptions {
    fn default() -> Self {
        Self {
            min_ms: default_debounce_min_ms(),
            max_ms: default_debounce_max_ms(),
            rebuild_ratio: default_rebuild_ratio(),
            fixed_ms: None,
        }
    }
}

impl Default for BackgroundOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            threads: None,
            shard_dir: None,
        }
    }
}

impl ServerOptions {
    /// Options for tests: no debounce, four threads, no background pass
    pub fn for_test() -> Self {
        Self {
            scheduler: SchedulerOptions {
                async_threads_count: 4,
                debounce: DebounceOptions {
                    fixed_ms: Some(0),
                    ..DebounceOptions::default()
                },
                ast_cache_size: default_ast_cache_size(),
            },
            background: BackgroundOptions {
                enabled: false,
                ..BackgroundOptions::default()
            },
            ..Self::default()
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let options: Self = toml::from_str(content)?;
        options.validate()?;
        Ok(options)
    }

    /// Load from a TOML file; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content).map_err(|e| Error::ConfigError {
            message: format!("{}: {}", path.display(), e),
        })
    }

    pub fn validate(&self) -> Result<()> {
        let debounce = &self.scheduler.debounce;
        if self.scheduler.async_threads_count == 0 {
            return Err(Error::ConfigError {
                message: "scheduler.async_threads_count must be at least 1".to_string(),
            });
        }
        if debounce.min_ms > debounce.max_ms {
            return Err(Error::ConfigError {
                message: format!(
                    "scheduler.debounce.min_ms ({}) exceeds max_ms ({})",
                    debounce.min_ms, debounce.max_ms
                ),
            });
        }
        if !(debounce.rebuild_ratio.is_finite() && debounce.rebuild_ratio >= 0.0) {
            return Err(Error::ConfigError {
                message: "scheduler.debounce.rebuild_ratio must be a non-negative number"
                    .to_string(),
            });
        }
        if self.background.threads == Some(0) {
            return Err(Error::ConfigError {
                message: "background.threads must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn background_threads(&self) -> usize {
        self.background
            .threads
            .unwrap_or(self.scheduler.async_threads_count)
            .max(1)
    }

    pub fn config_freshness(&self) -> Duration {
        Duration::from_millis(self.config_freshness_ms)
    }
}

// ============================================================================
// Per-file config
// ============================================================================

/// Policy applied to one file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub compile_flags: CompileFlags,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

/// Edits applied to every compile command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompileFlags {
    /// Appended before the file argument
    #[serde(default)]
    pub add: Vec<String>,

    /// Removed; a trailing `*` matches any suffix
    #[serde(default)]
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundPolicy {
    #[default]
    Build,
    Skip,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default)]
    pub background: BackgroundPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// Diagnostic codes never published
    #[serde(default)]
    pub suppress: Vec<String>,
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply flag edits to `command` in place
    pub fn apply_to_command(&self, command: &mut CompileCommand) {
        let flags = &self.compile_flags;
        if flags.add.is_empty() && flags.remove.is_empty() {
            return;
        }
        let compiler = command.arguments.first().cloned();
        let mut rest: Vec<String> = command
            .arguments
            .iter()
            .skip(1)
            .filter(|arg| !flags.remove.iter().any(|pattern| flag_matches(pattern, arg)))
            .cloned()
            .collect();

        // Keep the file argument last
        let file = command.file.to_string_lossy();
        let insert_at = match rest.last() {
            Some(last) if *last == file || command.file.ends_with(last.as_str()) => rest.len() - 1,
            _ => rest.len(),
        };
        for (offset, flag) in flags.add.iter().enumerate() {
            rest.insert(insert_at + offset, flag.clone());
        }

        command.arguments = compiler.into_iter().chain(rest).collect();
    }

    pub fn suppresses(&self, diagnostic: &Diagnostic) -> bool {
        self.diagnostics.suppress.iter().any(|c| *c == diagnostic.code)
    }

    pub fn skip_background(&self) -> bool {
        self.index.background == BackgroundPolicy::Skip
    }
}

fn flag_matches(pattern: &str, arg: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => arg.starts_with(prefix),
        None => pattern == arg,
    }
}

// ============================================================================
// Providers
// ============================================================================

/// Where per-file config comes from
pub trait ConfigSource: Send + Sync {
    /// Config governing `path`
    fn load(&self, path: &Path) -> Config;
}

/// Same config for every file
#[derive(Debug, Clone, Default)]
pub struct FixedConfigSource(pub Config);

impl ConfigSource for FixedConfigSource {
    fn load(&self, _path: &Path) -> Config {
        self.0.clone()
    }
}

/// Finds the nearest `.semfora-sched.toml` walking up from a file
pub struct DirectoryConfigSource {
    fs: Arc<dyn Filesystem>,
}

impl DirectoryConfigSource {
    pub fn new(fs: Arc<dyn Filesystem>) -> Self {
        Self { fs }
    }
}

impl DirectoryConfigSource {
    /// Directory of the governing config file and its parsed contents
    pub fn locate(&self, path: &Path) -> Option<(PathBuf, Config)> {
        let view = self.fs.view(None);
        for dir in path.ancestors().skip(1) {
            let candidate = dir.join(CONFIG_FILE_NAME);
            let Ok(content) = view.read(&candidate) else {
                continue;
            };
            let config = Config::from_toml_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring invalid {}: {}", candidate.display(), e);
                Config::default()
            });
            return Some((dir.to_path_buf(), config));
        }
        None
    }
}

impl ConfigSource for DirectoryConfigSource {
    fn load(&self, path: &Path) -> Config {
        self.locate(path).map(|(_, c)| c).unwrap_or_default()
    }
}

struct CachedConfig {
    loaded: Instant,
    config: Arc<Config>,
}

/// Caches a `ConfigSource`, re-reading each entry at most once per
/// freshness window
pub struct ConfigProvider {
    source: Box<dyn ConfigSource>,
    freshness: Duration,
    cache: Mutex<HashMap<PathBuf, CachedConfig>>,
}

impl ConfigProvider {
    pub fn new(source: Box<dyn ConfigSource>, freshness: Duration) -> Self {
        Self {
            source,
            freshness,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn fixed(config: Config) -> Self {
        Self::new(Box::new(FixedConfigSource(config)), Duration::MAX)
    }

    pub fn get(&self, path: &Path) -> Arc<Config> {
        let key = path.parent().map(Path::to_path_buf).unwrap_or_default();
        {
            let cache = self.cache.lock();
            if let Some(cached) = cache.get(&key) {
                if cached.loaded.elapsed() < self.freshness {
                    return Arc::clone(&cached.config);
                }
            }
        }

        let config = Arc::new(self.source.load(path));
        self.cache.lock().insert(
            key,
            CachedConfig {
                loaded: Instant::now(),
                config: Arc::clone(&config),
            },
        );
        config
    }
}

impl Default for ConfigProvider {
    fn default() -> Self {
        Self::fixed(Config::default())
    }
}
