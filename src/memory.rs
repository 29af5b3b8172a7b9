//! Hierarchical memory usage report

use std::collections::BTreeMap;

use serde::Serialize;

/// Tree of named memory consumers
///
/// Each node carries its own bytes; `total()` adds the subtree.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryTree {
    #[serde(rename = "self")]
    self_bytes: usize,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    children: BTreeMap<String, MemoryTree>,
}

impl MemoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Child node `name`, created on first use
    pub fn child(&mut self, name: &str) -> &mut MemoryTree {
        self.children.entry(name.to_string()).or_default()
    }

    pub fn add_usage(&mut self, bytes: usize) {
        self.self_bytes += bytes;
    }

    pub fn self_bytes(&self) -> usize {
        self.self_bytes
    }

    pub fn total(&self) -> usize {
        self.self_bytes + self.children.values().map(MemoryTree::total).sum::<usize>()
    }

    pub fn get(&self, name: &str) -> Option<&MemoryTree> {
        self.children.get(name)
    }

    /// Indented `name: bytes` lines, totals per subtree
    pub fn render(&self, name: &str) -> String {
        let mut out = String::new();
        self.render_into(name, 0, &mut out);
        out
    }

    fn render_into(&self, name: &str, depth: usize, out: &mut String) {
        out.push_str(&format!("{}{}: {} bytes\n", "  ".repeat(depth), name, self.total()));
        for (child_name, child) in &self.children {
            child.render_into(child_name, depth + 1, out);
        }
    }
}
