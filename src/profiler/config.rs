//! Profiler session configuration.

use std::time::Duration;

/// Default capacity for the call tree node pool.
pub const DEFAULT_NODE_POOL_CAPACITY: usize = 512;

/// Default capacity for the root pool.
pub const DEFAULT_ROOT_POOL_CAPACITY: usize = 16;

/// Tunables recognized by the aggregation engine.
///
/// `start_scheduled_profiling` is carried for the external scheduler and not
/// consumed by the core.
#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    /// Inferred spans shorter than this are dropped during tree maintenance
    /// and never emitted.
    pub inferred_spans_min_duration_nanos: u64,
    /// Whether the external profiling scheduler should run sessions.
    pub start_scheduled_profiling: bool,
    pub node_pool_capacity: usize,
    pub root_pool_capacity: usize,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            inferred_spans_min_duration_nanos: 0,
            start_scheduled_profiling: true,
            node_pool_capacity: DEFAULT_NODE_POOL_CAPACITY,
            root_pool_capacity: DEFAULT_ROOT_POOL_CAPACITY,
        }
    }
}

impl ProfilerConfig {
    pub fn with_inferred_spans_min_duration(mut self, min_duration: Duration) -> Self {
        self.inferred_spans_min_duration_nanos = min_duration.as_nanos() as u64;
        self
    }

    pub fn with_start_scheduled_profiling(mut self, enabled: bool) -> Self {
        self.start_scheduled_profiling = enabled;
        self
    }

    pub fn with_node_pool_capacity(mut self, capacity: usize) -> Self {
        self.node_pool_capacity = capacity;
        self
    }
}
