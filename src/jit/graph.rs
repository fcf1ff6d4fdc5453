//! Execution-graph capture for profiling overlays.
//!
//! Records observed control-flow edges between translated blocks and dumps
//! them as GraphViz DOT. Host-side debugging output only; nothing here
//! feeds back into execution.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Mutex;

use crate::jit::cache::Cache;

/// Collector of `(from, to)` block transitions.
#[derive(Debug, Default)]
pub struct ExecutionGraph {
    edges: Mutex<BTreeMap<(u32, u32), u64>>,
}

impl ExecutionGraph {
    /// New empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one transition from the block at `from` to the block at `to`.
    /// Drivers call this between block executions.
    pub fn record(&self, from: u32, to: u32) {
        let mut edges = self.edges.lock().unwrap();
        *edges.entry((from, to)).or_insert(0) += 1;
    }

    /// Drop all recorded edges.
    pub fn clear(&self) {
        self.edges.lock().unwrap().clear();
    }

    /// Render the recorded transitions as a DOT digraph. Nodes are labeled
    /// with block addresses and, when the block is still cached, execution
    /// counts.
    pub fn to_dot(&self, cache: &Cache) -> String {
        let edges = self.edges.lock().unwrap();
        let mut text = String::from("digraph execution {\n  node [shape=box];\n");

        for block in cache.blocks() {
            let executed = block
                .stats()
                .count_executed
                .load(std::sync::atomic::Ordering::Relaxed);
            let _ = writeln!(
                text,
                "  n{0:08x} [label=\"{0:#010x}\\n{1} runs\"];",
                block.start_address(),
                executed
            );
        }

        for ((from, to), count) in edges.iter() {
            let _ = writeln!(
                text,
                "  n{from:08x} -> n{to:08x} [label=\"{count}\"];"
            );
        }

        text.push_str("}\n");
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::block::{BlockCompiler, CompiledRoutines};
    use crate::jit::cache::CacheConfig;
    use std::sync::Arc;

    struct NullCompiler;

    impl BlockCompiler for NullCompiler {
        fn compile(
            &self,
            _unit: &crate::ir::ExecutionUnit,
            _disable_fastmem: bool,
        ) -> CompiledRoutines {
            CompiledRoutines::default()
        }
    }

    #[test]
    fn dot_output_lists_edges() {
        let graph = ExecutionGraph::new();
        graph.record(0x100, 0x200);
        graph.record(0x100, 0x200);

        let cache = Cache::new(CacheConfig::default(), Arc::new(NullCompiler));
        let dot = graph.to_dot(&cache);
        assert!(dot.contains("n00000100 -> n00000200 [label=\"2\"]"));
    }
}
