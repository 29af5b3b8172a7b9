//! Build inputs and the compiler seam
//!
//! The scheduler never parses anything itself. It hands immutable
//! `ParseInputs` to a `Frontend`, which splits the file into a preamble region
//! (the leading directive block) and a body, and builds each part.
//!
//! `TextFrontend` is a small directive-level frontend:
//!
//! ```text
//! // comment            ┐
//! #include "a.h"        │ preamble region: leading blank, comment and
//! #define LIMIT 4       ┘ directive lines
//! struct Point { ... }  ┐
//! fn area(p) { ... }    │ body: declarations and references
//! #warning "slow"       ┘
//! ```
//!
//! Includes resolve against the including file's directory, then the `-I`
//! directories of the compile command, through the inputs' filesystem view.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;

use crate::compile_db::CompileCommand;
use crate::error::{Result, TaskError};
use crate::fs::{Filesystem, FsView};
use crate::index::MergedIndex;
use crate::preamble::Preamble;
use crate::schema::{Diagnostic, Location, Ref, RefKind, Severity, Symbol, SymbolKind};
use crate::threading::CancelToken;

/// Options affecting how a file is built
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseOptions {
    /// Diagnostic codes dropped from build output
    pub suppressed_codes: Vec<String>,
}

/// Everything needed to build one version of a file
#[derive(Clone)]
pub struct ParseInputs {
    /// Filled in by the scheduler from the compilation database
    pub command: CompileCommand,
    pub contents: Arc<str>,
    pub version: String,
    pub fs: Arc<dyn Filesystem>,
    /// Read-only index handle for consumers of the built snapshot
    pub index: Option<Arc<MergedIndex>>,
    pub options: ParseOptions,
    /// Rebuild the preamble even if its region is unchanged
    pub force_rebuild: bool,
}

impl ParseInputs {
    pub fn new(contents: &str, version: &str, fs: Arc<dyn Filesystem>) -> Self {
        Self {
            command: CompileCommand::new("", "", Vec::new()),
            contents: Arc::from(contents),
            version: version.to_string(),
            fs,
            index: None,
            options: ParseOptions::default(),
            force_rebuild: false,
        }
    }
}

impl std::fmt::Debug for ParseInputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParseInputs")
            .field("version", &self.version)
            .field("command", &self.command.arguments)
            .field("bytes", &self.contents.len())
            .field("force_rebuild", &self.force_rebuild)
            .finish()
    }
}

/// Why a build produced nothing
#[derive(Debug, Clone, PartialEq)]
pub enum BuildError {
    /// Stopped at a yield point
    Cancelled(String),
    /// Fatal problem; the diagnostics explain it
    Failed(Vec<Diagnostic>),
}

impl From<TaskError> for BuildError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Cancelled { reason } => Self::Cancelled(reason),
            TaskError::BuildFailure { diagnostics, .. } => Self::Failed(diagnostics),
            other => Self::Failed(vec![Diagnostic::new(
                "",
                0,
                Severity::Fatal,
                "build_aborted",
                other.to_string(),
            )]),
        }
    }
}

/// Output of a preamble build
#[derive(Debug, Clone, Default)]
pub struct PreambleData {
    /// Opaque frontend state reused by AST builds
    pub header_state: Vec<u8>,
    pub includes: Vec<PathBuf>,
    pub diagnostics: Vec<Diagnostic>,
    /// Symbols declared by the preamble and the headers it includes
    pub symbols: Vec<Symbol>,
}

/// Output of a main-file build
#[derive(Debug, Clone, Default)]
pub struct AstData {
    pub diagnostics: Vec<Diagnostic>,
    pub symbols: Vec<Symbol>,
    pub refs: Vec<Ref>,
}

/// The compiler seam
pub trait Frontend: Send + Sync {
    /// Byte length of the preamble region of `contents`
    fn preamble_bounds(&self, contents: &str) -> usize;

    fn build_preamble(
        &self,
        path: &Path,
        inputs: &ParseInputs,
        cancel: &CancelToken,
    ) -> std::result::Result<PreambleData, BuildError>;

    fn build_ast(
        &self,
        path: &Path,
        inputs: &ParseInputs,
        preamble: &Preamble,
        cancel: &CancelToken,
    ) -> std::result::Result<AstData, BuildError>;
}

// ============================================================================
// TextFrontend
// ============================================================================

/// Directive-level frontend for C-like and brace languages
pub struct TextFrontend {
    include: Regex,
    define: Regex,
    error: Regex,
    warning: Regex,
    declaration: Regex,
    identifier: Regex,
}

const MAX_INCLUDE_DEPTH: usize = 32;

impl TextFrontend {
    pub fn new() -> Result<Self> {
        Ok(Self {
            include: Regex::new(r#"^\s*#\s*include\s*(?:"([^"]+)"|<([^>]+)>)"#)?,
            define: Regex::new(r"^\s*#\s*define\s+([A-Za-z_]\w*)")?,
            error: Regex::new(r"^\s*#\s*error\b\s*(.*)$")?,
            warning: Regex::new(r"^\s*#\s*warning\b\s*(.*)$")?,
            declaration: Regex::new(
                r"^\s*(?:pub\s+)?(fn|def|func|struct|union|enum|class|trait|interface|type|typedef|const|static|let|var)\s+([A-Za-z_]\w*)",
            )?,
            identifier: Regex::new(r"[A-Za-z_]\w*")?,
        })
    }

    fn resolve_include(
        &self,
        view: &dyn FsView,
        spelled: &str,
        quoted: bool,
        including_dir: Option<&Path>,
        search_dirs: &[PathBuf],
    ) -> Option<PathBuf> {
        let local = including_dir.filter(|_| quoted).map(|d| d.join(spelled));
        local
            .into_iter()
            .chain(search_dirs.iter().map(|d| d.join(spelled)))
            .find(|candidate| view.exists(candidate))
    }

    /// Collect declarations, macros and nested includes of a header
    #[allow(clippy::too_many_arguments)]
    fn scan_header(
        &self,
        view: &dyn FsView,
        header: &Path,
        search_dirs: &[PathBuf],
        depth: usize,
        visited: &mut HashSet<PathBuf>,
        out: &mut PreambleData,
        cancel: &CancelToken,
    ) -> std::result::Result<(), BuildError> {
        if depth > MAX_INCLUDE_DEPTH || !visited.insert(header.to_path_buf()) {
            return Ok(());
        }
        out.includes.push(header.to_path_buf());
        let Ok(contents) = view.read(header) else {
            return Ok(());
        };

        for (idx, line) in contents.lines().enumerate() {
            cancel.check()?;
            let line_no = idx as u32 + 1;
            if let Some(caps) = self.include.captures(line) {
                let (spelled, quoted) = match (caps.get(1), caps.get(2)) {
                    (Some(q), _) => (q.as_str(), true),
                    (None, Some(a)) => (a.as_str(), false),
                    _ => continue,
                };
                match self.resolve_include(view, spelled, quoted, header.parent(), search_dirs) {
                    Some(nested) => {
                        self.scan_header(view, &nested, search_dirs, depth + 1, visited, out, cancel)?
                    }
                    None => out.diagnostics.push(not_found(header, line_no, spelled)),
                }
            } else if let Some(m) = self.define.captures(line).and_then(|c| c.get(1)) {
                out.symbols.push(Symbol::new(
                    m.as_str(),
                    SymbolKind::Macro,
                    Location::new(header, line_no, m.start() as u32 + 1),
                ));
            } else if let Some(symbol) = self.declaration(header, line_no, line) {
                out.symbols.push(symbol);
            }
        }
        Ok(())
    }

    fn declaration(&self, path: &Path, line_no: u32, line: &str) -> Option<Symbol> {
        let caps = self.declaration.captures(line)?;
        let kind = SymbolKind::from_keyword(caps.get(1)?.as_str())?;
        let name = caps.get(2)?;
        Some(Symbol::new(
            name.as_str(),
            kind,
            Location::new(path, line_no, name.start() as u32 + 1),
        ))
    }
}

fn not_found(path: &Path, line: u32, spelled: &str) -> Diagnostic {
    Diagnostic::new(
        path,
        line,
        Severity::Error,
        "pp_file_not_found",
        format!("'{}' file not found", spelled),
    )
}

fn missing_command(path: &Path) -> BuildError {
    BuildError::Failed(vec![Diagnostic::new(
        path,
        0,
        Severity::Fatal,
        "no_compile_command",
        "no compile command for file",
    )])
}

fn filter_suppressed(diagnostics: &mut Vec<Diagnostic>, options: &ParseOptions) {
    if !options.suppressed_codes.is_empty() {
        diagnostics.retain(|d| !options.suppressed_codes.contains(&d.code));
    }
}

impl Frontend for TextFrontend {
    fn preamble_bounds(&self, contents: &str) -> usize {
        let mut end = 0;
        for line in contents.split_inclusive('\n') {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with("//") || trimmed.starts_with('#') {
                end += line.len();
            } else {
                break;
            }
        }
        end
    }

    fn build_preamble(
        &self,
        path: &Path,
        inputs: &ParseInputs,
        cancel: &CancelToken,
    ) -> std::result::Result<PreambleData, BuildError> {
        if inputs.command.arguments.is_empty() {
            return Err(missing_command(path));
        }
        let region = &inputs.contents[..self.preamble_bounds(&inputs.contents)];
        let view = inputs.fs.view(None);
        let search_dirs = inputs.command.include_dirs();
        let mut out = PreambleData::default();
        let mut visited = HashSet::from([path.to_path_buf()]);
        let mut fatal = false;

        for (idx, line) in region.lines().enumerate() {
            cancel.check()?;
            let line_no = idx as u32 + 1;
            if let Some(caps) = self.include.captures(line) {
                let (spelled, quoted) = match (caps.get(1), caps.get(2)) {
                    (Some(q), _) => (q.as_str(), true),
                    (None, Some(a)) => (a.as_str(), false),
                    _ => continue,
                };
                match self.resolve_include(&*view, spelled, quoted, path.parent(), &search_dirs) {
                    Some(header) => {
                        self.scan_header(&*view, &header, &search_dirs, 1, &mut visited, &mut out, cancel)?
                    }
                    None => out.diagnostics.push(not_found(path, line_no, spelled)),
                }
            } else if let Some(m) = self.define.captures(line).and_then(|c| c.get(1)) {
                out.symbols.push(Symbol::new(
                    m.as_str(),
                    SymbolKind::Macro,
                    Location::new(path, line_no, m.start() as u32 + 1),
                ));
            } else if let Some(msg) = self.error.captures(line).and_then(|c| c.get(1)) {
                fatal = true;
                out.diagnostics.push(Diagnostic::new(
                    path,
                    line_no,
                    Severity::Fatal,
                    "pp_hash_error",
                    msg.as_str().trim().to_string(),
                ));
            } else if let Some(msg) = self.warning.captures(line).and_then(|c| c.get(1)) {
                out.diagnostics.push(Diagnostic::new(
                    path,
                    line_no,
                    Severity::Warning,
                    "pp_hash_warning",
                    msg.as_str().trim().to_string(),
                ));
            }
        }

        filter_suppressed(&mut out.diagnostics, &inputs.options);
        if fatal {
            return Err(BuildError::Failed(out.diagnostics));
        }

        let macro_names: Vec<&str> = out
            .symbols
            .iter()
            .filter(|s| s.kind == SymbolKind::Macro)
            .map(|s| s.name.as_str())
            .collect();
        out.header_state = bincode::serialize(&macro_names).unwrap_or_default();
        Ok(out)
    }

    fn build_ast(
        &self,
        path: &Path,
        inputs: &ParseInputs,
        preamble: &Preamble,
        cancel: &CancelToken,
    ) -> std::result::Result<AstData, BuildError> {
        if inputs.command.arguments.is_empty() {
            return Err(missing_command(path));
        }
        let bounds = self.preamble_bounds(&inputs.contents);
        let first_line = inputs.contents[..bounds].lines().count();
        let body = &inputs.contents[bounds..];

        let mut out = AstData {
            diagnostics: preamble.diagnostics.clone(),
            ..AstData::default()
        };

        // Declarations first so forward references resolve
        for (idx, line) in body.lines().enumerate() {
            cancel.check()?;
            let line_no = (first_line + idx) as u32 + 1;
            if let Some(symbol) = self.declaration(path, line_no, line) {
                out.refs.push(Ref {
                    symbol: symbol.id.clone(),
                    location: symbol.location.clone(),
                    kind: RefKind::Declaration,
                });
                out.symbols.push(symbol);
            } else if let Some(msg) = self.error.captures(line).and_then(|c| c.get(1)) {
                out.diagnostics.push(Diagnostic::new(
                    path,
                    line_no,
                    Severity::Error,
                    "pp_hash_error",
                    msg.as_str().trim().to_string(),
                ));
            } else if let Some(msg) = self.warning.captures(line).and_then(|c| c.get(1)) {
                out.diagnostics.push(Diagnostic::new(
                    path,
                    line_no,
                    Severity::Warning,
                    "pp_hash_warning",
                    msg.as_str().trim().to_string(),
                ));
            }
        }

        let known: HashMap<&str, &Symbol> = preamble
            .symbols
            .iter()
            .chain(out.symbols.iter())
            .map(|s| (s.name.as_str(), s))
            .collect();
        let mut refs = Vec::new();
        for (idx, line) in body.lines().enumerate() {
            cancel.check()?;
            let line_no = (first_line + idx) as u32 + 1;
            for m in self.identifier.find_iter(line) {
                let Some(symbol) = known.get(m.as_str()) else {
                    continue;
                };
                let column = m.start() as u32 + 1;
                if symbol.location.path == path
                    && symbol.location.line == line_no
                    && symbol.location.column == column
                {
                    continue;
                }
                refs.push(Ref {
                    symbol: symbol.id.clone(),
                    location: Location::new(path, line_no, column),
                    kind: RefKind::Reference,
                });
            }
        }
        out.refs.extend(refs);

        filter_suppressed(&mut out.diagnostics, &inputs.options);
        Ok(out)
    }
}
