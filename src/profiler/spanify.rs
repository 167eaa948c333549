//! Spanification: turning a sealed call tree into emitted spans.
//!
//! Pre-order traversal, parents before children. Pillar nodes (exactly one
//! child observed in every sample, no attached spans) are collapsed; the
//! surviving descendant carries the collapsed frames as a stack trace
//! attribute, deepest frame first. Explicit spans attributed to a node are
//! emitted as links with the `is_child` attribute, since their recorded
//! parent pointers were fixed long before the inferred tree existed.

use crate::profiler::call_tree::{NodeId, Root};
use crate::profiler::clock::NanoClock;
use crate::profiler::error::ProfilerError;
use crate::profiler::frame::StackFrame;
use crate::profiler::tracer::{SpanContext, SpanTracer};
use log::debug;

/// External policy hook for the emitted parent of an inferred span.
///
/// `candidate` is the explicit span the engine reconciled as the node's
/// parent, if any; `default_parent` is the nearest emitted ancestor (or the
/// root trace context). The returned context becomes the span's parent.
pub type ParentOverride = fn(candidate: Option<SpanContext>, default_parent: SpanContext) -> SpanContext;

/// Default policy: prefer the reconciled explicit parent, fall back to the
/// emitted ancestor chain.
pub fn default_parent_override(
    candidate: Option<SpanContext>,
    default_parent: SpanContext,
) -> SpanContext {
    candidate.unwrap_or(default_parent)
}

struct EmitState<'a> {
    root: &'a Root,
    clock: &'a dyn NanoClock,
    parent_override: ParentOverride,
    emitted: usize,
}

#[derive(Clone, Copy)]
struct PathContext {
    /// Parent context for the next emitted span on this path.
    parent: SpanContext,
    /// Nearest emitted ancestor node, bounding the collapsed-frame walk.
    parent_node: Option<NodeId>,
    /// Innermost explicit span already entered on this path; a node whose
    /// reconciled parent is the same span nests under the emitted ancestor
    /// instead of flattening the chain.
    explicit: Option<SpanContext>,
    /// Override carried down from a collapsed ancestor until an emitted
    /// descendant consumes it.
    inherited: Option<SpanContext>,
}

/// Emit one span per qualifying node of a sealed tree. Returns the number of
/// spans emitted.
pub fn spanify(
    root: &Root,
    clock: &dyn NanoClock,
    tracer: &mut dyn SpanTracer,
    parent_override: ParentOverride,
) -> Result<usize, ProfilerError> {
    if !root.is_ended() {
        return Err(ProfilerError::SpanifyOnUnendedTree);
    }
    let mut state = EmitState {
        root,
        clock,
        parent_override,
        emitted: 0,
    };
    let ctx = PathContext {
        parent: root.parent_context(),
        parent_node: None,
        explicit: None,
        inherited: None,
    };
    for &child in root.root_node().children() {
        emit_node(&mut state, tracer, child, ctx);
    }
    debug!(
        "spanified call tree: {} spans from {} samples",
        state.emitted,
        root.count()
    );
    Ok(state.emitted)
}

fn emit_node(
    state: &mut EmitState<'_>,
    tracer: &mut dyn SpanTracer,
    id: NodeId,
    ctx: PathContext,
) {
    let root = state.root;
    let node = root.node(id);

    // The reconciled explicit parent, unless the emission path already sits
    // inside that same span.
    let candidate = root
        .activation_parent(id)
        .filter(|c| ctx.explicit != Some(*c))
        .or(ctx.inherited);

    if root.is_pillar(id) {
        // Collapsed: no span, but the override (if any) survives for the
        // first emitted descendant, which also picks up this frame.
        let child_ctx = PathContext {
            explicit: candidate.or(ctx.explicit),
            inherited: candidate,
            ..ctx
        };
        for &child in node.children() {
            emit_node(state, tracer, child, child_ctx);
        }
        return;
    }

    let parent = (state.parent_override)(candidate, ctx.parent);
    let handle = tracer.start_span(
        &node.frame().expect("non-root node has a frame").span_name(),
        parent,
        state.clock.epoch_nanos(node.start_nanos()),
    );
    state.emitted += 1;

    // Frames of collapsed nodes between this span and its emitted ancestor,
    // deepest first. Spans parented directly on the root context carry none.
    if parent != root.parent_context() {
        let skipped = collapsed_frames(root, id, ctx.parent_node);
        if !skipped.is_empty() {
            tracer.record_stack_trace(handle, &skipped);
        }
    }

    for child_id in node.child_ids() {
        tracer.add_link(handle, child_id.span, true);
    }

    let child_ctx = PathContext {
        parent: tracer.span_context(handle),
        parent_node: Some(id),
        explicit: candidate.or(ctx.explicit),
        inherited: None,
    };
    for &child in node.children() {
        emit_node(state, tracer, child, child_ctx);
    }

    tracer.end_span(handle, state.clock.epoch_nanos(node.last_seen_nanos()));
}

fn collapsed_frames(root: &Root, id: NodeId, emitted_ancestor: Option<NodeId>) -> Vec<StackFrame> {
    let mut frames = Vec::new();
    let mut cursor = root.node(id).parent();
    while let Some(ancestor) = cursor {
        if Some(ancestor) == emitted_ancestor || ancestor == root.root_id() {
            break;
        }
        if let Some(frame) = root.node(ancestor).frame() {
            frames.push(frame.clone());
        }
        cursor = root.node(ancestor).parent();
    }
    frames
}
