//! Symbol, reference and diagnostic data structures shared by the builders,
//! the scheduler and the index tiers.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Shard and event schema version.
/// 1.0 - initial tiered index layout
/// 1.1 - references carry their kind
pub const SCHEMA_VERSION: &str = "1.1";

// FNV-1a constants for 64-bit hash
const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Compute a stable FNV-1a hash (deterministic across runs and platforms)
///
/// Used for symbol IDs, preamble region hashes and shard keys.
pub fn fnv1a_hash(data: &str) -> u64 {
    fnv1a_bytes(data.as_bytes())
}

/// FNV-1a over raw bytes
pub fn fnv1a_bytes(data: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Milliseconds since the unix epoch, used to stamp index entries.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Symbols
// ============================================================================

/// Kind of an indexed symbol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    #[default]
    Function,
    Struct,
    Enum,
    Class,
    Trait,
    Type,
    Constant,
    Variable,
    Macro,
}

impl SymbolKind {
    /// Map a declaration keyword to a kind
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "fn" | "def" | "func" => Some(Self::Function),
            "struct" | "union" => Some(Self::Struct),
            "enum" => Some(Self::Enum),
            "class" => Some(Self::Class),
            "trait" | "interface" => Some(Self::Trait),
            "type" | "typedef" => Some(Self::Type),
            "const" | "static" => Some(Self::Constant),
            "let" | "var" => Some(Self::Variable),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Struct => "struct",
            Self::Enum => "enum",
            Self::Class => "class",
            Self::Trait => "trait",
            Self::Type => "type",
            Self::Constant => "constant",
            Self::Variable => "variable",
            Self::Macro => "macro",
        }
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable symbol identifier
///
/// 16-char hex FNV-1a of `scope::name#kind`. A declaration in a header and
/// its definition in a source file share an ID, which is what lets the tiers
/// shadow each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SymbolId(pub String);

impl SymbolId {
    pub fn new(scope: &str, name: &str, kind: SymbolKind) -> Self {
        Self(format!(
            "{:016x}",
            fnv1a_hash(&format!("{}::{}#{}", scope, name, kind.as_str()))
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source position (1-indexed line and column)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    pub path: PathBuf,
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub fn new(path: impl Into<PathBuf>, line: u32, column: u32) -> Self {
        Self {
            path: path.into(),
            line,
            column,
        }
    }
}

/// A declared symbol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub id: SymbolId,
    pub name: String,
    /// Enclosing scope, empty for the global scope
    #[serde(default)]
    pub scope: String,
    pub kind: SymbolKind,
    pub location: Location,
}

impl Symbol {
    pub fn new(name: &str, kind: SymbolKind, location: Location) -> Self {
        Self {
            id: SymbolId::new("", name, kind),
            name: name.to_string(),
            scope: String::new(),
            kind,
            location,
        }
    }

    /// Rough resident size, used by memory profiling
    pub fn estimated_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.id.0.len()
            + self.name.len()
            + self.scope.len()
            + self.location.path.as_os_str().len()
    }
}

/// How a reference uses its symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    Declaration,
    Reference,
}

/// A symbol occurrence
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ref {
    pub symbol: SymbolId,
    pub location: Location,
    pub kind: RefKind,
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Diagnostic severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Note,
    Warning,
    Error,
    Fatal,
}

/// A file-scoped diagnostic produced by a build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub path: PathBuf,
    pub line: u32,
    pub severity: Severity,
    /// Stable code, e.g. `pp_file_not_found`; used for config suppression
    pub code: String,
    pub message: String,
}

impl Diagnostic {
    pub fn new(
        path: impl Into<PathBuf>,
        line: u32,
        severity: Severity,
        code: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            line,
            severity,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity >= Severity::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_is_stable() {
        assert_eq!(fnv1a_hash(""), FNV_OFFSET);
        assert_eq!(fnv1a_hash("abc"), fnv1a_hash("abc"));
        assert_ne!(fnv1a_hash("abc"), fnv1a_hash("abd"));
    }

    #[test]
    fn test_symbol_id_depends_on_kind_and_scope() {
        let a = SymbolId::new("", "foo", SymbolKind::Function);
        let b = SymbolId::new("", "foo", SymbolKind::Struct);
        let c = SymbolId::new("ns", "foo", SymbolKind::Function);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, SymbolId::new("", "foo", SymbolKind::Function));
        assert_eq!(a.as_str().len(), 16);
    }

    #[test]
    fn test_symbol_kind_keywords() {
        assert_eq!(SymbolKind::from_keyword("fn"), Some(SymbolKind::Function));
        assert_eq!(SymbolKind::from_keyword("struct"), Some(SymbolKind::Struct));
        assert_eq!(SymbolKind::from_keyword("return"), None);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Fatal > Severity::Error);
        let d = Diagnostic::new("a.c", 1, Severity::Warning, "w", "careful");
        assert!(!d.is_error());
    }
}
