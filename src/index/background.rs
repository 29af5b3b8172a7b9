//! Background tier and the whole-project indexer that feeds it
//!
//! The indexer runs on its own worker threads, never on the interactive
//! pool. Each compilation unit is indexed independently:
//!
//! 1. skip if the unit's config says `background = "skip"`
//! 2. read the unit through the filesystem view (drafts included)
//! 3. reuse the persisted shard if it was built from the same contents,
//!    command and header contents
//! 4. otherwise build preamble + AST, store a new shard
//! 5. publish the unit's symbols into the Background tier
//!
//! A unit that cannot be read or built is counted as failed and skipped; the
//! pass continues.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use super::shard::{IndexShard, ShardStore};
use super::snapshot::{FileSlab, SnapshotCell};
use super::{FuzzyFindRequest, IndexEntry, SymbolIndex, Tier, TierSnapshot};
use crate::ast::ParsedAst;
use crate::compile_db::CompilationDatabase;
use crate::config::ConfigProvider;
use crate::frontend::{BuildError, Frontend, ParseInputs};
use crate::fs::{Filesystem, FsView};
use crate::memory::MemoryTree;
use crate::preamble::PreambleBuilder;
use crate::schema::{fnv1a_hash, now_millis, Ref, SymbolId, SCHEMA_VERSION};
use crate::threading::{wait_until, CancelToken, Deadline};

/// Stems remembered for units enqueued after a boost
const MAX_BOOSTED_STEMS: usize = 64;

// ============================================================================
// Background tier
// ============================================================================

/// Symbols of every indexed compilation unit
#[derive(Debug, Default)]
pub struct BackgroundIndex {
    slabs: Mutex<HashMap<PathBuf, FileSlab>>,
    published: SnapshotCell,
}

impl BackgroundIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything `shard.path` contributed
    pub fn update_unit(&self, shard: &IndexShard) {
        let mut slabs = self.slabs.lock();
        slabs.insert(
            shard.path.clone(),
            FileSlab {
                symbols: shard.symbols.clone(),
                refs: shard.refs.clone(),
                timestamp: shard.indexed_at,
                owns_refs: true,
            },
        );
        self.publish(&slabs);
    }

    pub fn remove_unit(&self, path: &Path) {
        let mut slabs = self.slabs.lock();
        if slabs.remove(path).is_some() {
            self.publish(&slabs);
        }
    }

    pub fn units(&self) -> Vec<PathBuf> {
        let mut units: Vec<PathBuf> = self.slabs.lock().keys().cloned().collect();
        units.sort();
        units
    }

    pub fn snapshot(&self) -> Arc<TierSnapshot> {
        self.published.load()
    }

    fn publish(&self, slabs: &HashMap<PathBuf, FileSlab>) {
        self.published.publish(TierSnapshot::build(Tier::Background, slabs, |p: &PathBuf| {
            Some(p.as_path())
        }));
    }
}

impl SymbolIndex for BackgroundIndex {
    fn tier(&self) -> Tier {
        Tier::Background
    }

    fn lookup(&self, ids: &[SymbolId]) -> Vec<IndexEntry> {
        self.snapshot().lookup(ids)
    }

    fn fuzzy_find(&self, request: &FuzzyFindRequest) -> Vec<IndexEntry> {
        self.snapshot().fuzzy_find(request)
    }

    fn refs(&self, ids: &[SymbolId]) -> Vec<Ref> {
        self.snapshot().refs(ids)
    }

    fn indexes_file(&self, path: &Path) -> bool {
        self.snapshot().indexes_file(path)
    }

    fn profile(&self, tree: &mut MemoryTree) {
        tree.add_usage(self.snapshot().estimated_bytes());
    }
}

// ============================================================================
// Indexer
// ============================================================================

/// Progress counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundStats {
    /// Units ever enqueued
    pub enqueued: usize,
    /// Units being indexed right now
    pub active: usize,
    /// Units finished, successfully or skipped
    pub completed: usize,
    /// Units that could not be indexed
    pub failed: usize,
}

impl BackgroundStats {
    pub fn is_idle(&self) -> bool {
        self.active == 0 && self.completed + self.failed == self.enqueued
    }
}

pub type ProgressCallback = Box<dyn Fn(&BackgroundStats) + Send + Sync>;

/// Collaborators of the indexer
pub struct BackgroundContext {
    pub cdb: Arc<dyn CompilationDatabase>,
    pub fs: Arc<dyn Filesystem>,
    pub frontend: Arc<dyn Frontend>,
    pub store: Arc<dyn ShardStore>,
    pub config: Arc<ConfigProvider>,
}

#[derive(Debug)]
struct Task {
    path: PathBuf,
    boosted: bool,
    /// Rebuild even if a current shard exists
    force: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    tasks: VecDeque<Task>,
    /// Oldest first, at most `MAX_BOOSTED_STEMS`
    boosted_stems: VecDeque<String>,
    stats: BackgroundStats,
    stopping: bool,
}

impl QueueState {
    /// Queue `path` unless already queued
    fn push(&mut self, path: PathBuf, force: bool) {
        if let Some(task) = self.tasks.iter_mut().find(|t| t.path == path) {
            task.force |= force;
            return;
        }
        let boosted = stem_of(&path).is_some_and(|s| self.boosted_stems.contains(&s));
        self.tasks.push_back(Task {
            path,
            boosted,
            force,
        });
        self.stats.enqueued += 1;
    }

    /// Boosted tasks first, FIFO otherwise
    fn pop(&mut self) -> Option<Task> {
        let pos = self.tasks.iter().position(|t| t.boosted).unwrap_or(0);
        let task = self.tasks.remove(pos)?;
        if task.boosted {
            self.release_stem(&task.path);
        }
        self.stats.active += 1;
        Some(task)
    }

    fn boost(&mut self, stem: String) {
        for task in self.tasks.iter_mut() {
            if stem_of(&task.path).as_deref() == Some(stem.as_str()) {
                task.boosted = true;
            }
        }
        if self.boosted_stems.contains(&stem) {
            return;
        }
        if self.boosted_stems.len() == MAX_BOOSTED_STEMS {
            self.boosted_stems.pop_front();
        }
        self.boosted_stems.push_back(stem);
    }

    /// Forget `stem` once nothing queued shares it
    fn release_stem(&mut self, path: &Path) {
        let Some(stem) = stem_of(path) else {
            return;
        };
        if !self.tasks.iter().any(|t| stem_of(&t.path).as_ref() == Some(&stem)) {
            self.boosted_stems.retain(|s| *s != stem);
        }
    }
}

struct Shared {
    ctx: BackgroundContext,
    preambles: PreambleBuilder,
    index: Arc<BackgroundIndex>,
    queue: Mutex<QueueState>,
    /// Signalled on new work, completion and shutdown
    cv: Condvar,
    /// header → units that include it
    dependents: Mutex<HashMap<PathBuf, BTreeSet<PathBuf>>>,
    on_progress: Option<ProgressCallback>,
    cancel: CancelToken,
}

enum UnitOutcome {
    Indexed,
    Reused,
    Skipped,
    Failed(String),
    Cancelled,
}

/// Whole-project indexer with its own bounded worker pool
pub struct BackgroundIndexer {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

fn stem_of(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

impl BackgroundIndexer {
    /// Start `threads` workers (at least one)
    pub fn new(
        ctx: BackgroundContext,
        index: Arc<BackgroundIndex>,
        threads: usize,
        on_progress: Option<ProgressCallback>,
    ) -> Arc<Self> {
        let shared = Arc::new(Shared {
            preambles: PreambleBuilder::new(Arc::clone(&ctx.frontend)),
            ctx,
            index,
            queue: Mutex::new(QueueState::default()),
            cv: Condvar::new(),
            dependents: Mutex::new(HashMap::new()),
            on_progress,
            cancel: CancelToken::new(),
        });

        let mut workers = Vec::new();
        for i in 0..threads.max(1) {
            let shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("bg-index-{}", i))
                .spawn(move || shared.worker_loop());
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => tracing::error!("Failed to spawn background indexer thread: {}", e),
            }
        }
        tracing::info!("Background indexer started with {} threads", workers.len());

        let indexer = Arc::new(Self {
            shared,
            workers: Mutex::new(workers),
        });

        // Changed compile commands re-index the affected units
        let weak = Arc::downgrade(&indexer);
        indexer.shared.ctx.cdb.subscribe(Box::new(move |files| {
            if let Some(indexer) = weak.upgrade() {
                indexer.enqueue(files.to_vec(), false);
            }
        }));
        indexer
    }

    pub fn index(&self) -> &Arc<BackgroundIndex> {
        &self.shared.index
    }

    /// Queue every unit the compilation database knows about
    pub fn enqueue_all(&self) {
        let files = self.shared.ctx.cdb.all_files();
        tracing::info!("Enqueueing {} units for background indexing", files.len());
        self.enqueue(files, false);
    }

    /// Queue units; already-queued units are not duplicated
    pub fn enqueue(&self, files: Vec<PathBuf>, force: bool) {
        if files.is_empty() {
            return;
        }
        let stats = {
            let mut queue = self.shared.queue.lock();
            if queue.stopping {
                return;
            }
            for path in files {
                queue.push(path, force);
            }
            queue.stats
        };
        self.shared.cv.notify_all();
        self.shared.report(&stats);
    }

    /// Prioritise units sharing `path`'s file stem (header ↔ source)
    pub fn boost_related(&self, path: &Path) {
        let Some(stem) = stem_of(path) else {
            return;
        };
        tracing::debug!("Boosting background units related to {}", stem);
        self.shared.queue.lock().boost(stem);
    }

    /// Re-index units that include `header`
    pub fn reindex_dependents(&self, header: &Path) {
        let units: Vec<PathBuf> = self
            .shared
            .dependents
            .lock()
            .get(header)
            .map(|units| units.iter().cloned().collect())
            .unwrap_or_default();
        if !units.is_empty() {
            tracing::debug!(
                "Re-indexing {} units that include {}",
                units.len(),
                header.display()
            );
            self.enqueue(units, true);
        }
    }

    pub fn stats(&self) -> BackgroundStats {
        self.shared.queue.lock().stats
    }

    /// Wait until the queue is empty and no unit is in progress
    pub fn block_until_idle(&self, deadline: Deadline) -> bool {
        let mut queue = self.shared.queue.lock();
        wait_until(&mut queue, &self.shared.cv, deadline, |q| {
            q.stopping || (q.tasks.is_empty() && q.stats.active == 0)
        })
    }

    /// Stop the workers; queued units are abandoned
    pub fn stop(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.stopping = true;
            queue.tasks.clear();
        }
        self.shared.cancel.cancel("background indexer stopped");
        self.shared.cv.notify_all();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!("Background indexer thread panicked");
            }
        }
    }

    pub fn profile(&self, tree: &mut MemoryTree) {
        let queued = self.shared.queue.lock().tasks.len();
        tree.child("queue").add_usage(queued * std::mem::size_of::<Task>());
        self.shared.index.profile(tree.child("slabs"));
    }
}

impl Drop for BackgroundIndexer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn report(&self, stats: &BackgroundStats) {
        if let Some(callback) = &self.on_progress {
            callback(stats);
        }
    }

    fn next_task(&self) -> Option<Task> {
        let mut queue = self.queue.lock();
        loop {
            if queue.stopping {
                return None;
            }
            if let Some(task) = queue.pop() {
                return Some(task);
            }
            self.cv.wait(&mut queue);
        }
    }

    fn worker_loop(&self) {
        while let Some(task) = self.next_task() {
            let outcome = self.index_unit(&task);
            let stats = {
                let mut queue = self.queue.lock();
                queue.stats.active -= 1;
                match &outcome {
                    UnitOutcome::Failed(reason) => {
                        tracing::warn!("Background indexing failed for {}: {}", task.path.display(), reason);
                        queue.stats.failed += 1;
                    }
                    _ => queue.stats.completed += 1,
                }
                queue.stats
            };
            self.cv.notify_all();
            if !matches!(outcome, UnitOutcome::Cancelled) {
                self.report(&stats);
            }
        }
    }

    fn index_unit(&self, task: &Task) -> UnitOutcome {
        let path = task.path.as_path();
        let config = self.ctx.config.get(path);
        if config.skip_background() {
            tracing::debug!("Background indexing disabled for {}", path.display());
            return UnitOutcome::Skipped;
        }

        let mut command = self
            .ctx
            .cdb
            .get_command(path)
            .unwrap_or_else(|| self.ctx.cdb.fallback_command(path));
        config.apply_to_command(&mut command);

        let view = self.ctx.fs.view(None);
        let contents = match view.read(path) {
            Ok(contents) => contents,
            Err(e) => return UnitOutcome::Failed(e.to_string()),
        };
        let content_hash = fnv1a_hash(&contents);
        let command_hash = command.hash();

        if !task.force {
            if let Some(shard) = self.ctx.store.load(path, command_hash) {
                if shard.is_current(content_hash, command_hash) && includes_unchanged(&shard, &*view) {
                    self.publish(&shard);
                    return UnitOutcome::Reused;
                }
            }
        }

        let mut inputs = ParseInputs::new(&contents, "background", Arc::clone(&self.ctx.fs));
        inputs.command = command;
        let cancel = self.cancel.child();
        let built = self
            .preambles
            .build(path, &inputs, None, &cancel)
            .and_then(|outcome| {
                let preamble = Arc::clone(outcome.preamble());
                ParsedAst::build(&*self.ctx.frontend, path, &inputs, preamble, &cancel)
            });
        let ast = match built {
            Ok(ast) => ast,
            Err(BuildError::Cancelled(_)) => return UnitOutcome::Cancelled,
            Err(BuildError::Failed(diags)) => {
                let first = diags
                    .first()
                    .map(|d| d.message.clone())
                    .unwrap_or_else(|| "build failed".to_string());
                return UnitOutcome::Failed(first);
            }
        };

        let mut symbols = ast.preamble.symbols.clone();
        symbols.extend(ast.symbols.iter().cloned());
        let shard = IndexShard {
            schema_version: SCHEMA_VERSION.to_string(),
            path: path.to_path_buf(),
            content_hash,
            command_hash,
            includes: ast.preamble.includes.clone(),
            symbols,
            refs: ast.refs.clone(),
            indexed_at: now_millis(),
        };
        if let Err(e) = self.ctx.store.store(&shard) {
            tracing::warn!("Failed to persist shard for {}: {}", path.display(), e);
        }
        self.publish(&shard);
        UnitOutcome::Indexed
    }

    fn publish(&self, shard: &IndexShard) {
        {
            let mut dependents = self.dependents.lock();
            for units in dependents.values_mut() {
                units.remove(&shard.path);
            }
            for (header, _) in &shard.includes {
                dependents
                    .entry(header.clone())
                    .or_default()
                    .insert(shard.path.clone());
            }
            dependents.retain(|_, units| !units.is_empty());
        }
        self.index.update_unit(shard);
    }
}

fn includes_unchanged(shard: &IndexShard, view: &dyn FsView) -> bool {
    shard.includes.iter().all(|(header, hash)| {
        view.read(header).map(|c| fnv1a_hash(&c)).unwrap_or(0) == *hash
    })
}
