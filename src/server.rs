//! Composition root
//!
//! `Server` owns the drafts, the scheduler, the index tiers, the background
//! indexer and any feature modules, and forwards build results to the host
//! through `ServerCallbacks`.
//!
//! ```text
//!  add_document ─► DraftStore ─► TaskScheduler ──► UpdateIndexCallbacks
//!                                     │                 │  preamble ─► Dynamic tier
//!                                     │                 │            └► background re-index
//!                                     │                 └─ main AST ─► Dynamic tier
//!                                     ▼                               └► on_diagnostics_ready
//!  feature modules ◄── Facilities { scheduler, index, fs }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::ast::ParsedAst;
use crate::compile_db::CompilationDatabase;
use crate::config::{ConfigProvider, ServerOptions};
use crate::draft::{Draft, DraftOverlayFs, DraftStore};
use crate::error::Result;
use crate::frontend::{Frontend, ParseInputs};
use crate::fs::Filesystem;
use crate::index::background::BackgroundContext;
use crate::index::shard::default_shard_root;
use crate::index::{
    BackgroundIndex, BackgroundIndexer, BackgroundStats, DiskShardStore, FileIndex,
    FuzzyFindRequest, IndexEntry, MergedIndex, ShardStore, StaticIndex,
};
use crate::memory::MemoryTree;
use crate::preamble::Preamble;
use crate::scheduler::{FileStats, ParsingCallbacks, Publisher, TaskScheduler, TuStatus};
use crate::schema::Diagnostic;
use crate::task::WantDiagnostics;
use crate::threading::Deadline;

// ============================================================================
// Host-facing interfaces
// ============================================================================

/// Notifications for the host. All methods default to no-ops.
pub trait ServerCallbacks: Send + Sync {
    /// Diagnostics for `version` of `path`, in publication order
    fn on_diagnostics_ready(&self, _path: &Path, _version: &str, _diagnostics: &[Diagnostic]) {}

    fn on_file_updated(&self, _path: &Path, _status: &TuStatus) {}

    /// Results previously computed for `path` may be out of date
    fn on_semantics_maybe_changed(&self, _path: &Path) {}

    fn on_background_index_progress(&self, _stats: &BackgroundStats) {}
}

/// Callbacks that ignore everything
#[derive(Debug, Default)]
pub struct NoopServerCallbacks;

impl ServerCallbacks for NoopServerCallbacks {}

/// Handles a feature module gets when it is initialized
#[derive(Clone)]
pub struct Facilities {
    pub scheduler: Arc<TaskScheduler>,
    pub index: Arc<MergedIndex>,
    pub fs: Arc<dyn Filesystem>,
}

/// Pluggable consumer of snapshots and the index
pub trait FeatureModule: Send + Sync {
    fn name(&self) -> &str;

    fn initialize(&mut self, _facilities: Facilities) {}

    fn block_until_idle(&self, _deadline: Deadline) -> bool {
        true
    }

    fn stop(&self) {}
}

/// Last diagnostics published for a file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishedDiagnostics {
    pub version: String,
    pub diagnostics: Vec<Diagnostic>,
}

// ============================================================================
// Build result routing
// ============================================================================

struct UpdateIndexCallbacks {
    dynamic: Option<Arc<FileIndex>>,
    background: Option<Arc<BackgroundIndexer>>,
    published: Arc<Mutex<HashMap<PathBuf, PublishedDiagnostics>>>,
    callbacks: Arc<dyn ServerCallbacks>,
}

impl UpdateIndexCallbacks {
    fn publish(&self, path: &Path, version: &str, diagnostics: &[Diagnostic]) {
        self.published.lock().insert(
            path.to_path_buf(),
            PublishedDiagnostics {
                version: version.to_string(),
                diagnostics: diagnostics.to_vec(),
            },
        );
        self.callbacks.on_diagnostics_ready(path, version, diagnostics);
    }
}

impl ParsingCallbacks for UpdateIndexCallbacks {
    fn on_preamble_ast(&self, path: &Path, _version: &str, preamble: &Arc<Preamble>) {
        if let Some(dynamic) = &self.dynamic {
            dynamic.update_preamble(path, preamble);
        }
        // Units including this file see its new draft contents
        if let Some(background) = &self.background {
            background.reindex_dependents(path);
        }
    }

    fn on_preamble_published(&self, path: &Path) {
        self.callbacks.on_semantics_maybe_changed(path);
    }

    fn on_main_ast(&self, path: &Path, ast: &ParsedAst, publisher: Publisher<'_>) {
        publisher.publish(|| {
            if let Some(dynamic) = &self.dynamic {
                dynamic.update_main(path, ast);
            }
            self.publish(path, &ast.version, &ast.diagnostics);
        });
    }

    fn on_failed_ast(
        &self,
        path: &Path,
        version: &str,
        diagnostics: Vec<Diagnostic>,
        publisher: Publisher<'_>,
    ) {
        publisher.publish(|| self.publish(path, version, &diagnostics));
    }

    fn on_file_updated(&self, path: &Path, status: &TuStatus) {
        self.callbacks.on_file_updated(path, status);
    }
}

// ============================================================================
// Server
// ============================================================================

/// Collaborators supplied by the embedder
pub struct ServerContext {
    pub cdb: Arc<dyn CompilationDatabase>,
    /// Underlying filesystem; open drafts are overlaid on top of it
    pub fs: Arc<dyn Filesystem>,
    pub frontend: Arc<dyn Frontend>,
    pub config: Arc<ConfigProvider>,
    /// Shard storage for the background index. Defaults to a disk store
    /// under `background.shard_dir` or the user cache directory.
    pub shard_store: Option<Arc<dyn ShardStore>>,
    pub callbacks: Arc<dyn ServerCallbacks>,
    pub modules: Vec<Box<dyn FeatureModule>>,
}

impl ServerContext {
    pub fn new(
        cdb: Arc<dyn CompilationDatabase>,
        fs: Arc<dyn Filesystem>,
        frontend: Arc<dyn Frontend>,
    ) -> Self {
        Self {
            cdb,
            fs,
            frontend,
            config: Arc::new(ConfigProvider::default()),
            shard_store: None,
            callbacks: Arc::new(NoopServerCallbacks),
            modules: Vec::new(),
        }
    }
}

pub struct Server {
    drafts: Arc<DraftStore>,
    fs: Arc<dyn Filesystem>,
    cdb: Arc<dyn CompilationDatabase>,
    index: Arc<MergedIndex>,
    dynamic: Option<Arc<FileIndex>>,
    background: Option<Arc<BackgroundIndexer>>,
    scheduler: Arc<TaskScheduler>,
    modules: Vec<Box<dyn FeatureModule>>,
    published: Arc<Mutex<HashMap<PathBuf, PublishedDiagnostics>>>,
}

impl Server {
    pub fn new(options: ServerOptions, ctx: ServerContext) -> Result<Self> {
        options.validate()?;
        let ServerContext {
            cdb,
            fs,
            frontend,
            config,
            shard_store,
            callbacks,
            modules,
        } = ctx;

        let drafts = Arc::new(DraftStore::new());
        let fs: Arc<dyn Filesystem> = Arc::new(DraftOverlayFs::new(fs, Arc::clone(&drafts)));
        let index = Arc::new(MergedIndex::new());

        // Layers are pushed lowest precedence first
        if let Some(path) = &options.static_index {
            let static_index = StaticIndex::load(path)?;
            tracing::info!(
                "Loaded static index {} ({} symbols)",
                path.display(),
                static_index.len()
            );
            index.push_layer(Arc::new(static_index));
        }

        let background = if options.background.enabled {
            let store = match shard_store {
                Some(store) => store,
                None => {
                    let dir = options
                        .background
                        .shard_dir
                        .clone()
                        .unwrap_or_else(default_shard_root);
                    Arc::new(DiskShardStore::new(dir)?) as Arc<dyn ShardStore>
                }
            };
            let background_index = Arc::new(BackgroundIndex::new());
            index.push_layer(Arc::clone(&background_index) as _);
            let progress_callbacks = Arc::clone(&callbacks);
            let indexer = BackgroundIndexer::new(
                BackgroundContext {
                    cdb: Arc::clone(&cdb),
                    fs: Arc::clone(&fs),
                    frontend: Arc::clone(&frontend),
                    store,
                    config: Arc::clone(&config),
                },
                background_index,
                options.background_threads(),
                Some(Box::new(move |stats: &BackgroundStats| {
                    progress_callbacks.on_background_index_progress(stats)
                })),
            );
            indexer.enqueue_all();
            Some(indexer)
        } else {
            None
        };

        let dynamic = options.build_dynamic_index.then(|| {
            let dynamic = Arc::new(FileIndex::new());
            index.push_layer(Arc::clone(&dynamic) as _);
            dynamic
        });

        let published = Arc::new(Mutex::new(HashMap::new()));
        let scheduler = Arc::new(TaskScheduler::new(
            &options.scheduler,
            frontend,
            Arc::clone(&cdb),
            config,
            Arc::new(UpdateIndexCallbacks {
                dynamic: dynamic.clone(),
                background: background.clone(),
                published: Arc::clone(&published),
                callbacks,
            }),
        ));

        // Open files pick up changed compile commands
        let reparser = Reparser {
            drafts: Arc::clone(&drafts),
            fs: Arc::clone(&fs),
            index: Arc::clone(&index),
            scheduler: Arc::downgrade(&scheduler),
        };
        cdb.subscribe(Box::new(move |files| {
            reparser.reparse(|path| files.iter().any(|f| f == path));
        }));

        let mut modules = modules;
        for module in modules.iter_mut() {
            tracing::debug!("Initializing feature module {}", module.name());
            module.initialize(Facilities {
                scheduler: Arc::clone(&scheduler),
                index: Arc::clone(&index),
                fs: Arc::clone(&fs),
            });
        }

        tracing::info!(
            "Server ready: {} index layers, background indexing {}",
            index.layer_count(),
            if background.is_some() { "on" } else { "off" }
        );
        Ok(Self {
            drafts,
            fs,
            cdb,
            index,
            dynamic,
            background,
            scheduler,
            modules,
            published,
        })
    }

    // ========================================================================
    // Documents
    // ========================================================================

    /// Store a new draft and schedule its rebuild. Returns the stored
    /// version, which is auto-assigned when `version` is empty.
    pub fn add_document(
        &self,
        path: &Path,
        version: &str,
        contents: &str,
        want: WantDiagnostics,
    ) -> String {
        let version = self.drafts.add_draft(path, version, contents);
        let added = self.scheduler.update(path, self.inputs(contents, &version), want);
        if added {
            if let Some(background) = &self.background {
                background.boost_related(path);
            }
        }
        version
    }

    /// Forget a draft; in-flight requests for it complete as cancelled
    pub fn remove_document(&self, path: &Path) {
        self.drafts.remove_draft(path);
        self.scheduler.remove(path);
        if let Some(dynamic) = &self.dynamic {
            dynamic.remove_file(path);
        }
        self.published.lock().remove(path);
    }

    /// Re-submit open files accepted by `filter` with their current drafts
    pub fn reparse_open_files_if_needed(&self, filter: impl Fn(&Path) -> bool) {
        Reparser {
            drafts: Arc::clone(&self.drafts),
            fs: Arc::clone(&self.fs),
            index: Arc::clone(&self.index),
            scheduler: Arc::downgrade(&self.scheduler),
        }
        .reparse(filter);
    }

    /// Compile commands of `files` changed outside the database's own
    /// notifications
    pub fn on_compile_commands_changed(&self, files: &[PathBuf]) {
        self.reparse_open_files_if_needed(|path| files.iter().any(|f| f == path));
        if let Some(background) = &self.background {
            background.enqueue(files.to_vec(), false);
        }
    }

    pub fn get_draft(&self, path: &Path) -> Option<Draft> {
        self.drafts.get_draft(path)
    }

    /// Latest diagnostics published for an open file
    pub fn diagnostics(&self, path: &Path) -> Option<PublishedDiagnostics> {
        self.published.lock().get(path).cloned()
    }

    pub fn workspace_symbols(&self, query: &str, limit: Option<usize>) -> Vec<IndexEntry> {
        let mut request = FuzzyFindRequest::new(query);
        request.limit = limit;
        self.index.fuzzy_find(&request)
    }

    fn inputs(&self, contents: &str, version: &str) -> ParseInputs {
        let mut inputs = ParseInputs::new(contents, version, Arc::clone(&self.fs));
        inputs.index = Some(Arc::clone(&self.index));
        inputs
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn index(&self) -> &Arc<MergedIndex> {
        &self.index
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn background(&self) -> Option<&Arc<BackgroundIndexer>> {
        self.background.as_ref()
    }

    pub fn file_stats(&self) -> HashMap<PathBuf, FileStats> {
        self.scheduler.file_stats()
    }

    /// Wait for all pending work. `None` waits forever.
    ///
    /// Components hand work to each other (a compile command refresh
    /// reschedules open files, an index update re-queues units), so every
    /// component is waited on in each pass and the last pass uses a zero
    /// timeout.
    pub fn block_until_idle(&self, timeout: Option<Duration>) -> bool {
        for step in [timeout, timeout, Some(Duration::ZERO)] {
            if !self.idle_pass(step) {
                return false;
            }
        }
        self.scheduler.block_until_idle(Deadline::zero())
    }

    fn idle_pass(&self, timeout: Option<Duration>) -> bool {
        if !self.scheduler.block_until_idle(Deadline::from_timeout(timeout)) {
            return false;
        }
        if !self.cdb.block_until_idle(Deadline::from_timeout(timeout)) {
            return false;
        }
        if let Some(background) = &self.background {
            if !background.block_until_idle(Deadline::from_timeout(timeout)) {
                return false;
            }
        }
        self.modules
            .iter()
            .all(|module| module.block_until_idle(Deadline::from_timeout(timeout)))
    }

    pub fn profile(&self, tree: &mut MemoryTree) {
        let drafts: usize = self
            .drafts
            .active_files()
            .iter()
            .filter_map(|path| self.drafts.get_draft(path))
            .map(|draft| draft.contents.len())
            .sum();
        tree.child("drafts").add_usage(drafts);
        self.scheduler.profile(tree.child("scheduler"));
        self.index.profile(tree.child("index"));
        if let Some(background) = &self.background {
            background.profile(tree.child("background_indexer"));
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        for module in &self.modules {
            module.stop();
        }
        if let Some(background) = &self.background {
            background.stop();
        }
        self.scheduler.shutdown();
    }
}

/// Re-submits open drafts; shared by the server and the compile command
/// listener
struct Reparser {
    drafts: Arc<DraftStore>,
    fs: Arc<dyn Filesystem>,
    index: Arc<MergedIndex>,
    scheduler: Weak<TaskScheduler>,
}

impl Reparser {
    fn reparse(&self, filter: impl Fn(&Path) -> bool) {
        let Some(scheduler) = self.scheduler.upgrade() else {
            return;
        };
        for path in self.drafts.active_files() {
            if !filter(&path) {
                continue;
            }
            let Some(draft) = self.drafts.get_draft(&path) else {
                continue;
            };
            tracing::debug!("Reparsing {} version {}", path.display(), draft.version);
            let mut inputs = ParseInputs::new(&draft.contents, &draft.version, Arc::clone(&self.fs));
            inputs.index = Some(Arc::clone(&self.index));
            scheduler.update(&path, inputs, WantDiagnostics::Auto);
        }
    }
}
