//! semfora-scheduler: per-file build scheduling and a tiered symbol index
//!
//! The crate keeps interactive requests on open files responsive while their
//! builds are expensive:
//!
//! - Every open file gets a worker that runs rebuilds and AST reads in order,
//!   and a preamble thread that builds the shared header state, one build at
//!   a time, dropping superseded inputs.
//! - Reads that tolerate a stale preamble bypass the worker queue.
//! - Symbols come from three index tiers (Static, Background, Dynamic),
//!   merged so that the fresher tier wins for a file it covers.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use semfora_scheduler::{
//!     InMemoryCompilationDatabase, RealFilesystem, Server, ServerContext, ServerOptions,
//!     TextFrontend, WantDiagnostics,
//! };
//!
//! let ctx = ServerContext::new(
//!     Arc::new(InMemoryCompilationDatabase::new()),
//!     Arc::new(RealFilesystem),
//!     Arc::new(TextFrontend::new()?),
//! );
//! let server = Server::new(ServerOptions::default(), ctx)?;
//! server.add_document(path, "1", "#include \"a.h\"\nint main();\n", WantDiagnostics::Yes);
//! server.block_until_idle(None);
//! println!("{:?}", server.diagnostics(path));
//! ```

pub mod ast;
pub mod cli;
pub mod commands;
pub mod compile_db;
pub mod config;
pub mod draft;
pub mod error;
pub mod events;
pub mod frontend;
pub mod fs;
pub mod index;
pub mod memory;
pub mod preamble;
pub mod scheduler;
pub mod schema;
pub mod server;
pub mod task;
pub mod threading;

// Re-export commonly used types
pub use ast::ParsedAst;
pub use compile_db::{
    CompilationDatabase, CompileCommand, InMemoryCompilationDatabase, JsonCompilationDatabase,
};
pub use config::{Config, ConfigProvider, ServerOptions};
pub use draft::{Draft, DraftStore};
pub use error::{Error, Result, TaskError};
pub use events::EventEmitter;
pub use frontend::{Frontend, ParseInputs, TextFrontend};
pub use fs::{Filesystem, MemoryFilesystem, RealFilesystem};
pub use index::{FuzzyFindRequest, IndexEntry, MergedIndex, Tier};
pub use memory::MemoryTree;
pub use preamble::Preamble;
pub use scheduler::{InputsAndAst, InputsAndPreamble, ParsingCallbacks, TaskScheduler, TuStatus};
pub use schema::{Diagnostic, Location, Severity, Symbol, SymbolId, SymbolKind};
pub use server::{FeatureModule, Facilities, Server, ServerCallbacks, ServerContext};
pub use task::{Invalidation, PreambleFreshness, TaskHandle, WantDiagnostics};
pub use threading::{CancelToken, Deadline};
