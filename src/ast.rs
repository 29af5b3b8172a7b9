//! Parsed ASTs and the bounded cache that keeps the most recent ones resident
//!
//! An AST mirrors one exact version of a file and is never patched across
//! versions. Evicting one only costs a rebuild on next access.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::compile_db::CompileCommand;
use crate::frontend::{BuildError, Frontend, ParseInputs};
use crate::preamble::Preamble;
use crate::schema::{Diagnostic, Ref, Symbol};
use crate::threading::CancelToken;

/// Full analysis of one file version
#[derive(Debug)]
pub struct ParsedAst {
    pub path: PathBuf,
    pub version: String,
    pub command: CompileCommand,
    /// Preamble this AST was built on
    pub preamble: Arc<Preamble>,
    /// Preamble-scope diagnostics followed by main-file diagnostics
    pub diagnostics: Vec<Diagnostic>,
    pub symbols: Vec<Symbol>,
    pub refs: Vec<Ref>,
    pub build_time: Duration,
}

impl ParsedAst {
    pub fn build(
        frontend: &dyn Frontend,
        path: &Path,
        inputs: &ParseInputs,
        preamble: Arc<Preamble>,
        cancel: &CancelToken,
    ) -> std::result::Result<Self, BuildError> {
        let start = Instant::now();
        let data = frontend.build_ast(path, inputs, &preamble, cancel)?;
        let build_time = start.elapsed();
        tracing::debug!(
            "Built AST for {} version {} in {:?}",
            path.display(),
            inputs.version,
            build_time
        );
        Ok(Self {
            path: path.to_path_buf(),
            version: inputs.version.clone(),
            command: inputs.command.clone(),
            preamble,
            diagnostics: data.diagnostics,
            symbols: data.symbols,
            refs: data.refs,
            build_time,
        })
    }

    /// Bytes owned by this AST, excluding the shared preamble
    pub fn estimated_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.symbols.iter().map(Symbol::estimated_bytes).sum::<usize>()
            + self.refs.len() * std::mem::size_of::<Ref>()
            + self.diagnostics.iter().map(|d| d.message.len() + 64).sum::<usize>()
    }
}

struct CachedAst {
    path: PathBuf,
    /// Sequence number of the inputs the AST was built from
    seq: u64,
    ast: Arc<ParsedAst>,
}

/// LRU cache of parsed ASTs, at most one per file
pub struct AstCache {
    capacity: usize,
    /// Most recently used at the back
    entries: Mutex<VecDeque<CachedAst>>,
}

impl AstCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// The AST for `path` if it was built from inputs `seq`
    pub fn get(&self, path: &Path, seq: u64) -> Option<Arc<ParsedAst>> {
        let mut entries = self.entries.lock();
        let pos = entries.iter().position(|e| e.path == path)?;
        if entries[pos].seq != seq {
            return None;
        }
        let entry = entries.remove(pos)?;
        let ast = Arc::clone(&entry.ast);
        entries.push_back(entry);
        Some(ast)
    }

    /// Store an AST, replacing any older one for the same file and evicting
    /// the least recently used beyond capacity
    pub fn put(&self, path: &Path, seq: u64, ast: Arc<ParsedAst>) {
        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().position(|e| e.path == path) {
            if entries[pos].seq > seq {
                return;
            }
            entries.remove(pos);
        }
        entries.push_back(CachedAst {
            path: path.to_path_buf(),
            seq,
            ast,
        });
        while entries.len() > self.capacity {
            if let Some(evicted) = entries.pop_front() {
                tracing::debug!("Evicted AST for {}", evicted.path.display());
            }
        }
    }

    pub fn remove(&self, path: &Path) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter().position(|e| e.path == path) {
            Some(pos) => entries.remove(pos).is_some(),
            None => false,
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.lock().iter().any(|e| e.path == path)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Bytes held for `path`, zero if not resident
    pub fn used_bytes(&self, path: &Path) -> usize {
        self.entries
            .lock()
            .iter()
            .find(|e| e.path == path)
            .map(|e| e.ast.estimated_bytes())
            .unwrap_or(0)
    }
}
