//! Command modules for the semfora-sched CLI
//!
//! Each command module implements a single top-level command:
//! - `check` - open files and print their diagnostics
//! - `index` - build the background index of a project
//! - `symbols` - workspace symbol query over the merged index
//! - `profile` - memory usage tree
//!
//! All command handlers take their `Args` struct from `cli.rs` and a shared
//! `CommandContext`, and return the text to print on stdout.

pub mod check;
pub mod index;
pub mod profile;
pub mod symbols;

pub use check::run_check;
pub use index::run_index;
pub use profile::run_profile;
pub use symbols::run_symbols;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::compile_db::{CompilationDatabase, JsonCompilationDatabase};
use crate::config::{ConfigProvider, DirectoryConfigSource, ServerOptions};
use crate::error::{Error, Result, TaskError};
use crate::frontend::TextFrontend;
use crate::fs::{Filesystem, RealFilesystem};
use crate::index::{DiskShardStore, ShardStore};
use crate::server::{Server, ServerCallbacks, ServerContext};

/// Shared context passed to all command handlers
#[derive(Debug, Clone, Default)]
pub struct CommandContext {
    pub options: ServerOptions,
    pub verbose: bool,
}

impl CommandContext {
    /// Options from `path` when given, defaults otherwise
    pub fn load(options: Option<&Path>, verbose: bool) -> Result<Self> {
        let options = match options {
            Some(path) => ServerOptions::load_from(path)?,
            None => ServerOptions::default(),
        };
        Ok(Self { options, verbose })
    }

    /// Start a server over the real filesystem.
    ///
    /// With `project_root`, shards are stored per project under the cache
    /// root unless the options name a shard directory.
    pub fn start_server(
        &self,
        options: ServerOptions,
        cdb: Arc<dyn CompilationDatabase>,
        project_root: Option<&Path>,
        callbacks: Arc<dyn ServerCallbacks>,
    ) -> Result<Server> {
        let fs: Arc<dyn Filesystem> = Arc::new(RealFilesystem);
        let mut ctx = ServerContext::new(cdb, Arc::clone(&fs), Arc::new(TextFrontend::new()?));
        ctx.config = Arc::new(ConfigProvider::new(
            Box::new(DirectoryConfigSource::new(fs)),
            options.config_freshness(),
        ));
        ctx.callbacks = callbacks;
        if let (Some(root), None) = (project_root, &options.background.shard_dir) {
            ctx.shard_store = Some(Arc::new(DiskShardStore::for_project(root)?) as Arc<dyn ShardStore>);
        }
        Server::new(options, ctx)
    }
}

/// Load a compile_commands.json and return it with its project root
pub(crate) fn load_project(path: &Path) -> Result<(Arc<JsonCompilationDatabase>, PathBuf)> {
    if !path.exists() {
        return Err(Error::FileNotFound {
            path: path.display().to_string(),
        });
    }
    let path = path.canonicalize()?;
    let root = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));
    let cdb = JsonCompilationDatabase::load(&path)?;
    Ok((Arc::new(cdb), root))
}

/// Wait for `server` to go idle, failing after `timeout_secs`
pub(crate) fn wait_idle(server: &Server, timeout_secs: u64) -> Result<()> {
    if server.block_until_idle(Some(Duration::from_secs(timeout_secs))) {
        Ok(())
    } else {
        Err(TaskError::ResourceExhausted {
            message: format!("server still busy after {}s", timeout_secs),
        }
        .into())
    }
}
