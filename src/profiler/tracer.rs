//! Span emission port.
//!
//! The engine only needs three things from a tracing pipeline: start a span
//! under a given parent, attach a link, and end the span. Everything else
//! (sampling, batching, context propagation) stays downstream.

use crate::profiler::frame::StackFrame;
use serde::Serialize;

/// Attribute key for links that mark the link target as the logical child of
/// the linking span, used when the target's recorded parent pointer disagrees
/// with the reconstructed tree.
pub const LINK_IS_CHILD: &str = "is_child";

/// Identity of a span in a trace: `(trace_id, span_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct SpanContext {
    pub trace_id: u64,
    pub span_id: u64,
}

impl SpanContext {
    pub const fn new(trace_id: u64, span_id: u64) -> Self {
        Self { trace_id, span_id }
    }
}

/// Handle to a span started through a [`SpanTracer`]. Only meaningful to the
/// tracer that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanHandle(pub usize);

/// Downstream emitter for inferred spans.
pub trait SpanTracer {
    /// Start a span with an explicit parent and start timestamp, returning a
    /// handle for later calls.
    fn start_span(&mut self, name: &str, parent: SpanContext, start_nanos: u64) -> SpanHandle;

    /// The context assigned to a started span, so children can reference it.
    fn span_context(&self, span: SpanHandle) -> SpanContext;

    /// Attach a link to `target` on `span`. `is_child` maps to the
    /// [`LINK_IS_CHILD`] attribute.
    fn add_link(&mut self, span: SpanHandle, target: SpanContext, is_child: bool);

    /// Record the frames skipped between this span and its emitted ancestor.
    fn record_stack_trace(&mut self, span: SpanHandle, frames: &[StackFrame]);

    fn end_span(&mut self, span: SpanHandle, end_nanos: u64);
}

/// A link captured by [`CapturingTracer`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanLink {
    pub target: SpanContext,
    pub is_child: bool,
}

/// A finished span captured by [`CapturingTracer`].
#[derive(Debug, Clone, Serialize)]
pub struct SpanRecord {
    pub name: String,
    pub context: SpanContext,
    pub parent: SpanContext,
    pub start_nanos: u64,
    pub end_nanos: u64,
    pub links: Vec<SpanLink>,
    pub stack_trace: Vec<StackFrame>,
}

impl SpanRecord {
    pub fn duration_nanos(&self) -> u64 {
        self.end_nanos.saturating_sub(self.start_nanos)
    }
}

/// Tracer double that accumulates all spans in memory for inspection.
#[derive(Debug, Default)]
pub struct CapturingTracer {
    spans: Vec<SpanRecord>,
    next_span_id: u64,
}

impl CapturingTracer {
    pub fn new() -> Self {
        Self {
            spans: Vec::new(),
            // Leave room for ids handed out by the instrumentation under test.
            next_span_id: 0x1000,
        }
    }

    pub fn spans(&self) -> &[SpanRecord] {
        &self.spans
    }

    pub fn find(&self, name: &str) -> Option<&SpanRecord> {
        self.spans.iter().find(|s| s.name == name)
    }
}

impl SpanTracer for CapturingTracer {
    fn start_span(&mut self, name: &str, parent: SpanContext, start_nanos: u64) -> SpanHandle {
        self.next_span_id += 1;
        self.spans.push(SpanRecord {
            name: name.to_string(),
            context: SpanContext::new(parent.trace_id, self.next_span_id),
            parent,
            start_nanos,
            end_nanos: start_nanos,
            links: Vec::new(),
            stack_trace: Vec::new(),
        });
        SpanHandle(self.spans.len() - 1)
    }

    fn span_context(&self, span: SpanHandle) -> SpanContext {
        self.spans[span.0].context
    }

    fn add_link(&mut self, span: SpanHandle, target: SpanContext, is_child: bool) {
        self.spans[span.0].links.push(SpanLink { target, is_child });
    }

    fn record_stack_trace(&mut self, span: SpanHandle, frames: &[StackFrame]) {
        self.spans[span.0].stack_trace = frames.to_vec();
    }

    fn end_span(&mut self, span: SpanHandle, end_nanos: u64) {
        self.spans[span.0].end_nanos = end_nanos;
    }
}

/// Tracer that discards everything. Useful for benchmarking the traversal
/// without emission costs.
#[derive(Debug, Default)]
pub struct NullTracer {
    started: usize,
}

impl NullTracer {
    pub fn started(&self) -> usize {
        self.started
    }
}

impl SpanTracer for NullTracer {
    fn start_span(&mut self, _name: &str, parent: SpanContext, _start_nanos: u64) -> SpanHandle {
        self.started += 1;
        let _ = parent;
        SpanHandle(self.started)
    }

    fn span_context(&self, span: SpanHandle) -> SpanContext {
        SpanContext::new(0, span.0 as u64)
    }

    fn add_link(&mut self, _span: SpanHandle, _target: SpanContext, _is_child: bool) {}

    fn record_stack_trace(&mut self, _span: SpanHandle, _frames: &[StackFrame]) {}

    fn end_span(&mut self, _span: SpanHandle, _end_nanos: u64) {}
}
