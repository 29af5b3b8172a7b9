//! Server composition: index tiers, compile command changes and events

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use semfora_scheduler::compile_db::CommandListener;
use semfora_scheduler::index::static_index::StaticIndexFile;
use semfora_scheduler::index::{BackgroundStats, MemoryShardStore, ShardStore};
use semfora_scheduler::server::NoopServerCallbacks;
use semfora_scheduler::{
    CompilationDatabase, CompileCommand, Deadline, EventEmitter, Frontend,
    InMemoryCompilationDatabase, Location, MemoryFilesystem, Server, ServerCallbacks,
    ServerContext, ServerOptions, Symbol, SymbolKind, Tier, WantDiagnostics,
};
use tempfile::TempDir;

use crate::common::{SlowFrontend, IDLE_TIMEOUT};

struct Project {
    fs: Arc<MemoryFilesystem>,
    cdb: Arc<InMemoryCompilationDatabase>,
    frontend: Arc<SlowFrontend>,
    store: Arc<MemoryShardStore>,
}

impl Project {
    fn new() -> Self {
        Self {
            fs: Arc::new(MemoryFilesystem::new()),
            cdb: Arc::new(InMemoryCompilationDatabase::new()),
            frontend: Arc::new(SlowFrontend::fast()),
            store: Arc::new(MemoryShardStore::new()),
        }
    }

    /// Add a file on "disk" with a compile command
    fn add_unit(&self, path: &str, contents: &str) {
        self.fs.set(path, contents);
        self.cdb.set_command(
            path,
            CompileCommand::new("/p", path, vec!["cc".into(), "-I/p/include".into(), path.into()]),
        );
    }

    fn start(&self, options: ServerOptions, callbacks: Arc<dyn ServerCallbacks>) -> Server {
        let mut ctx = ServerContext::new(
            Arc::clone(&self.cdb) as _,
            Arc::clone(&self.fs) as _,
            Arc::clone(&self.frontend) as Arc<dyn Frontend>,
        );
        ctx.shard_store = Some(Arc::clone(&self.store) as Arc<dyn ShardStore>);
        ctx.callbacks = callbacks;
        Server::new(options, ctx).unwrap()
    }
}

fn options(background: bool) -> ServerOptions {
    let mut options = ServerOptions::for_test();
    options.background.enabled = background;
    options.background.threads = Some(2);
    options
}

fn wait_idle(server: &Server) {
    assert!(server.block_until_idle(Some(IDLE_TIMEOUT)), "server did not go idle");
}

fn tier_of(server: &Server, name: &str) -> Option<Tier> {
    let found: Vec<_> = server
        .workspace_symbols(name, None)
        .into_iter()
        .filter(|e| e.symbol.name == name)
        .collect();
    assert!(found.len() <= 1, "duplicate entries for {}: {:?}", name, found);
    found.first().map(|e| e.tier)
}

// ============================================================================
// Tiers
// ============================================================================

#[test]
fn test_open_file_shadows_background_tier() {
    let project = Project::new();
    project.add_unit("/p/util.c", "fn shared_helper() {}\n");
    let server = project.start(options(true), Arc::new(NoopServerCallbacks));
    wait_idle(&server);
    assert_eq!(tier_of(&server, "shared_helper"), Some(Tier::Background));

    server.add_document(
        Path::new("/p/util.c"),
        "1",
        "fn shared_helper() {}\nfn draft_only() {}\n",
        WantDiagnostics::Yes,
    );
    wait_idle(&server);
    assert_eq!(tier_of(&server, "shared_helper"), Some(Tier::Dynamic));
    assert_eq!(tier_of(&server, "draft_only"), Some(Tier::Dynamic));

    server.remove_document(Path::new("/p/util.c"));
    wait_idle(&server);
    assert_eq!(tier_of(&server, "shared_helper"), Some(Tier::Background));
}

#[test]
fn test_background_outranks_newer_static_entry() {
    let dir = TempDir::new().unwrap();
    let static_path = dir.path().join("static.json");
    let file = StaticIndexFile {
        timestamp: u64::MAX / 2,
        symbols: vec![
            Symbol::new("shared_helper", SymbolKind::Function, Location::new("/p/util.c", 9, 4)),
            Symbol::new("vendored", SymbolKind::Function, Location::new("/vendor/v.c", 1, 4)),
        ],
        refs: Vec::new(),
    };
    std::fs::write(&static_path, serde_json::to_string(&file).unwrap()).unwrap();

    let project = Project::new();
    project.add_unit("/p/util.c", "fn shared_helper() {}\n");
    let mut options = options(true);
    options.static_index = Some(static_path);
    let server = project.start(options, Arc::new(NoopServerCallbacks));
    wait_idle(&server);

    assert_eq!(server.index().layer_count(), 3);
    assert_eq!(tier_of(&server, "shared_helper"), Some(Tier::Background));
    assert_eq!(tier_of(&server, "vendored"), Some(Tier::Static));
    let entry = &server.workspace_symbols("shared_helper", None)[0];
    assert_eq!(entry.symbol.location.line, 1);
}

#[test]
fn test_background_failure_is_isolated() {
    let project = Project::new();
    project.add_unit("/p/present.c", "fn present() {}\n");
    // Listed in the database, missing on disk
    project.cdb.set_command(
        "/p/missing.c",
        CompileCommand::new("/p", "/p/missing.c", vec!["cc".into(), "/p/missing.c".into()]),
    );
    let progress = Arc::new(ProgressLog::default());
    let server = project.start(options(true), Arc::clone(&progress) as _);
    wait_idle(&server);

    let stats = server.background().unwrap().stats();
    assert_eq!(stats.enqueued, 2);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
    assert!(!progress.0.lock().is_empty());
    assert_eq!(tier_of(&server, "present"), Some(Tier::Background));
}

#[test]
fn test_shards_reused_across_restarts() {
    let project = Project::new();
    project.add_unit("/p/a.c", "fn alpha() {}\n");
    project.add_unit("/p/b.c", "fn beta() {}\n");
    {
        let server = project.start(options(true), Arc::new(NoopServerCallbacks));
        wait_idle(&server);
    }
    let builds = project.frontend.preamble_builds();
    assert_eq!(builds, 2);
    assert_eq!(project.store.len(), 2);

    let server = project.start(options(true), Arc::new(NoopServerCallbacks));
    wait_idle(&server);
    assert_eq!(project.frontend.preamble_builds(), builds);
    assert_eq!(tier_of(&server, "beta"), Some(Tier::Background));
}

// ============================================================================
// Compile commands
// ============================================================================

#[test]
fn test_compile_command_change_rebuilds_open_file() {
    let project = Project::new();
    project.fs.set("/p/inc/config.h", "struct Settings {}\n");
    let server = project.start(options(false), Arc::new(NoopServerCallbacks));
    let main = Path::new("/p/main.c");
    server.add_document(main, "1", "#include \"config.h\"\nfn main() {}\n", WantDiagnostics::Yes);
    wait_idle(&server);
    let before = server.diagnostics(main).unwrap();
    assert!(before.diagnostics.iter().any(|d| d.code == "pp_file_not_found"));

    project.cdb.set_command(
        main,
        CompileCommand::new("/p", main, vec!["cc".into(), "-I/p/inc".into(), "/p/main.c".into()]),
    );
    wait_idle(&server);
    let after = server.diagnostics(main).unwrap();
    assert_eq!(after.version, "1");
    assert!(after.diagnostics.is_empty(), "{:?}", after.diagnostics);
    assert_eq!(tier_of(&server, "Settings"), Some(Tier::Dynamic));
}

/// Database that applies a queued command change while the server waits on it
struct RefreshingCdb {
    inner: InMemoryCompilationDatabase,
    pending: Mutex<Option<(PathBuf, CompileCommand)>>,
}

impl CompilationDatabase for RefreshingCdb {
    fn get_command(&self, path: &Path) -> Option<CompileCommand> {
        self.inner.get_command(path)
    }

    fn fallback_command(&self, path: &Path) -> CompileCommand {
        self.inner.fallback_command(path)
    }

    fn all_files(&self) -> Vec<PathBuf> {
        self.inner.all_files()
    }

    fn subscribe(&self, listener: CommandListener) {
        self.inner.subscribe(listener);
    }

    fn block_until_idle(&self, _deadline: Deadline) -> bool {
        if let Some((path, command)) = self.pending.lock().take() {
            self.inner.set_command(path, command);
        }
        true
    }
}

#[test]
fn test_block_until_idle_waits_for_rebuild_after_refresh() {
    let fs = Arc::new(MemoryFilesystem::new());
    let frontend = Arc::new(SlowFrontend::new(Duration::from_millis(200), Duration::ZERO));
    let cdb = Arc::new(RefreshingCdb {
        inner: InMemoryCompilationDatabase::new(),
        pending: Mutex::new(None),
    });
    let ctx = ServerContext::new(
        Arc::clone(&cdb) as Arc<dyn CompilationDatabase>,
        Arc::clone(&fs) as _,
        Arc::clone(&frontend) as Arc<dyn Frontend>,
    );
    let server = Server::new(options(false), ctx).unwrap();
    let main = Path::new("/p/main.c");
    server.add_document(main, "1", "fn main() {}\n", WantDiagnostics::Yes);
    wait_idle(&server);
    let builds = frontend.preamble_builds();

    *cdb.pending.lock() = Some((
        main.to_path_buf(),
        CompileCommand::new("/p", main, vec!["cc".into(), "-g".into(), "/p/main.c".into()]),
    ));
    assert!(server.block_until_idle(Some(Duration::from_secs(10))));
    assert!(cdb.pending.lock().is_none());
    assert_eq!(frontend.preamble_builds(), builds + 1);
    assert_eq!(server.diagnostics(main).unwrap().version, "1");
}

// ============================================================================
// Events
// ============================================================================

#[derive(Default)]
struct ProgressLog(Mutex<Vec<BackgroundStats>>);

impl ServerCallbacks for ProgressLog {
    fn on_background_index_progress(&self, stats: &BackgroundStats) {
        self.0.lock().push(*stats);
    }
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_events_stream_as_json_lines() {
    let project = Project::new();
    let buffer = SharedBuffer::default();
    let emitter = EventEmitter::to_writer(Box::new(buffer.clone()));
    let server = project.start(options(false), Arc::new(emitter));

    server.add_document(
        Path::new("/p/main.c"),
        "3",
        "#include \"absent.h\"\nfn main() {}\n",
        WantDiagnostics::Yes,
    );
    wait_idle(&server);

    let text = String::from_utf8(buffer.0.lock().clone()).unwrap();
    let events: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let diagnostics = events
        .iter()
        .find(|e| e["type"] == "diagnostics")
        .expect("no diagnostics event");
    assert_eq!(diagnostics["version"], "3");
    assert_eq!(diagnostics["path"], "/p/main.c");
    assert_eq!(diagnostics["diagnostics"][0]["code"], "pp_file_not_found");
    assert!(events.iter().any(|e| e["type"] == "semantics_changed"));
    assert!(events.iter().all(|e| e["type"] != "file_status"));
}

#[test]
fn test_block_until_idle_times_out_on_slow_build() {
    let project = Project::new();
    project.frontend.set_preamble_delay(Duration::from_millis(2000));
    let server = project.start(options(false), Arc::new(NoopServerCallbacks));
    server.add_document(Path::new("/p/slow.c"), "1", "fn slow() {}\n", WantDiagnostics::Yes);
    assert!(!server.block_until_idle(Some(Duration::from_millis(20))));
    wait_idle(&server);
    assert_eq!(server.diagnostics(Path::new("/p/slow.c")).unwrap().version, "1");
}
