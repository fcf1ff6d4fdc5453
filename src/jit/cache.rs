//! The per-guest JIT cache of translated blocks.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::jit::block::{BasicBlock, BlockCompiler};

/// Tunable heuristics of the block runtime.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Interpreted executions before a block is queued for compilation.
    pub compile_threshold: u64,
    /// Stable-flag executions before a guard miss triggers a recompile for
    /// the new flag values.
    pub guard_durable_threshold: u64,
    /// Deferred `prepare(false)` probes before a forced `prepare(true)`.
    pub prepare_threshold: u32,
    /// Hard cap on guest instructions decoded into one unit.
    pub max_unit_instructions: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            compile_threshold: 10,
            guard_durable_threshold: 100,
            prepare_threshold: 20,
            max_unit_instructions: 2048,
        }
    }
}

/// Cache of [`BasicBlock`]s keyed by `(virtual_address, physical_address)`.
///
/// Entries are reference counted: execution takes a strong reference for
/// the duration of a call, so invalidation on another thread only defers
/// destruction.
pub struct Cache {
    config: CacheConfig,
    compiler: Arc<dyn BlockCompiler>,
    entries: Mutex<BTreeMap<u32, Arc<BasicBlock>>>,
    queue: Mutex<VecDeque<Arc<BasicBlock>>>,
}

impl Cache {
    /// New cache compiling blocks through `compiler`.
    pub fn new(config: CacheConfig, compiler: Arc<dyn BlockCompiler>) -> Self {
        Self {
            config,
            compiler,
            entries: Mutex::new(BTreeMap::new()),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// The cache's tuning knobs.
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up the block starting at the given addresses.
    pub fn lookup(&self, virtual_address: u32, physical_address: u32) -> Option<Arc<BasicBlock>> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(&virtual_address)
            .filter(|block| block.physical_address() == physical_address)
            .cloned()
    }

    /// Insert a freshly created block.
    pub fn insert(&self, block: Arc<BasicBlock>) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(block.start_address(), block);
    }

    /// Start address of the nearest cached unit at or above `address`, or
    /// `u32::MAX` when none exists. Front-ends cap decoded ranges with this
    /// so units do not overlap.
    pub fn trailing_unit(&self, address: u32) -> u32 {
        let entries = self.entries.lock().unwrap();
        entries
            .range(address..)
            .next()
            .map(|(start, _)| *start)
            .unwrap_or(u32::MAX)
    }

    /// Queue a block for (re)compilation.
    pub fn queue_compile_unit(&self, block: &Arc<BasicBlock>) {
        self.queue.lock().unwrap().push_back(Arc::clone(block));
    }

    /// Compile every queued block on the calling thread. Runs either on a
    /// dedicated compile worker or inline between executed blocks.
    pub fn drain_compile_queue(&self) {
        loop {
            let block = self.queue.lock().unwrap().pop_front();
            match block {
                Some(block) => block.compile(self.compiler.as_ref()),
                None => break,
            }
        }
    }

    /// Number of cached blocks.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Snapshot of all cached blocks, in address order.
    pub fn blocks(&self) -> Vec<Arc<BasicBlock>> {
        self.entries.lock().unwrap().values().cloned().collect()
    }

    /// Mark every block dirty and drop the cache's references. Blocks still
    /// referenced by an in-flight execution stay alive until it finishes.
    pub fn invalidate_all(&self) {
        let mut entries = self.entries.lock().unwrap();
        for block in entries.values() {
            block.mark_dirty();
        }
        let evicted = entries.len();
        entries.clear();
        drop(entries);

        self.queue.lock().unwrap().clear();
        tracing::debug!(evicted, "jit cache invalidated");
    }

    /// Evict dirty blocks that nothing else references.
    pub fn garbage_collect(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, block| {
            !(block.has_flag(BasicBlock::DIRTY) && Arc::strong_count(block) == 1)
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            tracing::trace!(evicted, remaining = entries.len(), "jit cache swept");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::Guest;
    use crate::ir::ExecutionUnit;
    use crate::jit::block::{BlockSource, CompiledRoutines, StopReason};

    struct NullSource;

    impl BlockSource for NullSource {
        fn assemble(&self, _compiled_flags: u32) -> ExecutionUnit {
            ExecutionUnit::new()
        }

        fn interpret(&self, _guest: &mut dyn Guest) -> u64 {
            0
        }

        fn cpu_flags(&self, _guest: &mut dyn Guest) -> u32 {
            0
        }
    }

    struct NullCompiler;

    impl BlockCompiler for NullCompiler {
        fn compile(&self, _unit: &ExecutionUnit, _disable_fastmem: bool) -> CompiledRoutines {
            CompiledRoutines::default()
        }
    }

    fn block(address: u32) -> Arc<BasicBlock> {
        Arc::new(BasicBlock::new(
            address,
            address & 0x1fff_ffff,
            16,
            8,
            0,
            0,
            StopReason::Branch,
            Box::new(NullSource),
        ))
    }

    fn cache() -> Cache {
        Cache::new(CacheConfig::default(), Arc::new(NullCompiler))
    }

    #[test]
    fn lookup_checks_both_addresses() {
        let cache = cache();
        cache.insert(block(0x8c001000));

        assert!(cache.lookup(0x8c001000, 0x8c001000 & 0x1fff_ffff).is_some());
        assert!(cache.lookup(0x8c001000, 0).is_none());
        assert!(cache.lookup(0x8c002000, 0).is_none());
    }

    #[test]
    fn trailing_unit_caps_decoding() {
        let cache = cache();
        cache.insert(block(0x100));
        cache.insert(block(0x200));

        assert_eq!(cache.trailing_unit(0x000), 0x100);
        assert_eq!(cache.trailing_unit(0x101), 0x200);
        assert_eq!(cache.trailing_unit(0x201), u32::MAX);
    }

    #[test]
    fn garbage_collect_spares_referenced_blocks() {
        let cache = cache();
        let held = block(0x100);
        cache.insert(Arc::clone(&held));
        cache.insert(block(0x200));

        for block in cache.blocks() {
            block.mark_dirty();
        }
        let evicted = cache.garbage_collect();
        assert_eq!(evicted, 1);
        assert!(cache.lookup(0x100, 0x100).is_some());
    }
}
