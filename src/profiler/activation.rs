//! Span activation events and the buffer that carries them from instrumented
//! threads to the profiler worker.

use crate::profiler::tracer::SpanContext;
use serde::Serialize;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActivationKind {
    Activate,
    Deactivate,
}

/// One activation-stack transition observed on an instrumented thread.
///
/// `parent` is the context that was current when the span activated; it is
/// carried for wire completeness, the engine itself tracks nesting through
/// its own activation stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActivationEvent {
    pub kind: ActivationKind,
    pub span: SpanContext,
    pub parent: SpanContext,
    pub timestamp_nanos: u64,
}

impl ActivationEvent {
    pub fn activate(span: SpanContext, parent: SpanContext, timestamp_nanos: u64) -> Self {
        Self {
            kind: ActivationKind::Activate,
            span,
            parent,
            timestamp_nanos,
        }
    }

    pub fn deactivate(span: SpanContext, parent: SpanContext, timestamp_nanos: u64) -> Self {
        Self {
            kind: ActivationKind::Deactivate,
            span,
            parent,
            timestamp_nanos,
        }
    }
}

/// Many-producer, single-consumer event buffer.
///
/// Instrumented threads push batches; the profiler worker drains everything
/// and sorts the drain window by timestamp. Per-thread event streams are
/// already monotonic, so the sort only repairs cross-thread interleaving.
#[derive(Debug, Default)]
pub struct ActivationBuffer {
    batches: Mutex<Vec<Vec<ActivationEvent>>>,
}

impl ActivationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a single event from an instrumented thread.
    pub fn push(&self, event: ActivationEvent) {
        self.batches.lock().unwrap().push(vec![event]);
    }

    /// Hand over a whole thread-local batch.
    pub fn accept_batch(&self, batch: Vec<ActivationEvent>) {
        if !batch.is_empty() {
            self.batches.lock().unwrap().push(batch);
        }
    }

    /// Drain all pending events, sorted by timestamp. Called only from the
    /// profiler worker.
    pub fn drain_sorted(&self) -> Vec<ActivationEvent> {
        let batches = std::mem::take(&mut *self.batches.lock().unwrap());
        let mut events: Vec<ActivationEvent> = batches.into_iter().flatten().collect();
        events.sort_by_key(|e| e.timestamp_nanos);
        events
    }
}
