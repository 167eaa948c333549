//! Call tree aggregation and activation reconciliation.
//!
//! Stack samples are merged into a prefix tree; activation events from
//! instrumented spans are interleaved on the same timeline. Because samples
//! and activations are produced on different paths, their relative order near
//! an activation boundary is noisy. Reconciliation resolves the common skew
//! cases after the fact:
//!
//! * a span deactivates before the sampled method that contains it ends: the
//!   method must have started before the activation, so the method steals the
//!   span from wherever it was attributed;
//! * a span deactivates after the owning method's last sample: the method
//!   must have run past the deactivation, so its observed end is extended;
//! * a span activates after a method's last sample: the span is not a child
//!   of the departed method and is re-homed on the surviving ancestor.
//!
//! Decisions that cannot be made at event time are parked on the affected
//! node and resolved at its next sample (the node outlived the span) or when
//! it ends (the span outlived the node).

use crate::profiler::activation::{ActivationEvent, ActivationKind};
use crate::profiler::activation_log::ActivationLogReader;
use crate::profiler::config::ProfilerConfig;
use crate::profiler::error::ProfilerError;
use crate::profiler::frame::StackFrame;
use crate::profiler::pool::{ObjectPool, Recyclable};
use crate::profiler::tracer::SpanContext;
use smallvec::SmallVec;
use std::fmt;

pub type CallTreePool = ObjectPool<CallTree>;
pub type RootPool = ObjectPool<Root>;

/// Build a session's root and node pools sized by the configuration.
pub fn session_pools(config: &ProfilerConfig) -> (RootPool, CallTreePool) {
    (
        ObjectPool::new(config.root_pool_capacity, Root::default),
        ObjectPool::new(config.node_pool_capacity, CallTree::default),
    )
}

/// Handle to a node in the root's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

const ROOT: NodeId = NodeId(0);

/// A pending reference to an explicit span whose parent in the emitted tree
/// is determined during spanification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildId {
    pub span: SpanContext,
    pub activation_nanos: u64,
    /// True when the span was attributed to its owner while that node was the
    /// top of the sampled stack. Ids inherited from ended or dropped nodes
    /// carry weaker evidence and never extend their owner's lifetime.
    direct: bool,
}

/// The innermost explicit span that was active when a node was first sampled.
/// Until contradicted, that span is the node's emitted parent; the activation
/// timestamp anchors backdating when the node turns out to contain the span.
#[derive(Debug, Clone, Copy)]
struct NodeActivation {
    span: SpanContext,
    activation_nanos: u64,
}

/// A deactivation whose relation to this node is not yet decidable. Resolved
/// at the node's next sample or at its end.
#[derive(Debug, Clone, Copy)]
struct PendingDeactivation {
    span: SpanContext,
    activation_nanos: u64,
    deactivation_nanos: u64,
}

/// One vertex of the sampled prefix tree.
#[derive(Debug, Default)]
pub struct CallTree {
    frame: Option<StackFrame>,
    parent: Option<NodeId>,
    children: SmallVec<[NodeId; 4]>,
    count: u64,
    start_nanos: u64,
    last_seen_nanos: u64,
    depth: u32,
    ended: bool,
    child_ids: SmallVec<[ChildId; 2]>,
    maybe_child_ids: SmallVec<[ChildId; 2]>,
    activation: Option<NodeActivation>,
    pending: SmallVec<[PendingDeactivation; 1]>,
}

impl Recyclable for CallTree {
    fn reset(&mut self) {
        self.frame = None;
        self.parent = None;
        self.children.clear();
        self.count = 0;
        self.start_nanos = 0;
        self.last_seen_nanos = 0;
        self.depth = 0;
        self.ended = false;
        self.child_ids.clear();
        self.maybe_child_ids.clear();
        self.activation = None;
        self.pending.clear();
    }
}

impl CallTree {
    fn init(&mut self, frame: Option<StackFrame>, parent: Option<NodeId>, depth: u32, t: u64) {
        self.frame = frame;
        self.parent = parent;
        self.depth = depth;
        self.count = 0;
        self.start_nanos = t;
        self.last_seen_nanos = t;
    }

    pub fn frame(&self) -> Option<&StackFrame> {
        self.frame.as_ref()
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn start_nanos(&self) -> u64 {
        self.start_nanos
    }

    pub fn last_seen_nanos(&self) -> u64 {
        self.last_seen_nanos
    }

    pub fn duration_nanos(&self) -> u64 {
        self.last_seen_nanos.saturating_sub(self.start_nanos)
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn child_ids(&self) -> &[ChildId] {
        &self.child_ids
    }

    pub fn has_child_ids(&self) -> bool {
        !self.child_ids.is_empty()
    }

    fn holds_any_ids(&self) -> bool {
        !self.child_ids.is_empty() || !self.maybe_child_ids.is_empty()
    }

    fn holds_span(&self, span_id: u64) -> bool {
        self.child_ids.iter().any(|c| c.span.span_id == span_id)
            || self.maybe_child_ids.iter().any(|c| c.span.span_id == span_id)
    }

    /// Attribute an explicit span as a confirmed child of this node.
    pub fn add_child_id(&mut self, span: SpanContext, activation_nanos: u64) {
        self.child_ids.push(ChildId {
            span,
            activation_nanos,
            direct: true,
        });
    }

    /// Move the newest pending child id to `other`, preserving its activation
    /// time. A donor with no ids succeeds as a no-op.
    pub fn give_last_child_id_to(&mut self, other: &mut CallTree) {
        if let Some(id) = self.child_ids.pop() {
            other.child_ids.push(id);
        }
    }

    /// Move all of `other`'s pending child ids whose activation time lies in
    /// `[since, until]` to this node, in their original order.
    pub fn steal_child_ids_from(&mut self, other: &mut CallTree, since: u64, until: u64) {
        let in_window = |c: &ChildId| c.activation_nanos >= since && c.activation_nanos <= until;
        for list in [&mut other.child_ids, &mut other.maybe_child_ids] {
            let mut kept = SmallVec::new();
            for id in list.drain(..) {
                if in_window(&id) {
                    self.child_ids.push(ChildId {
                        direct: false,
                        ..id
                    });
                } else {
                    kept.push(id);
                }
            }
            *list = kept;
        }
    }
}

/// Counters for recoverable anomalies; nothing in the engine turns these into
/// errors.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub samples_applied: u64,
    pub dropped_samples: u64,
    pub unmatched_deactivations: u64,
}

/// The distinguished root of a call tree, tied to a parent trace context.
///
/// Owns every node reachable from it (the arena) and coordinates sample
/// insertion with the activation timeline. Nodes are borrowed from a
/// [`CallTreePool`] and returned when subtrees are dropped or the root is
/// recycled.
#[derive(Debug, Default)]
pub struct Root {
    nodes: Vec<CallTree>,
    free_slots: Vec<NodeId>,
    parent_context: SpanContext,
    /// Currently active explicit spans, innermost last: `(context, activated_at)`.
    active: Vec<(SpanContext, u64)>,
    top_of_stack: Option<NodeId>,
    /// Timestamp of the latest consumed event; samples behind it are dropped.
    cursor_nanos: u64,
    ended: bool,
    stats: SessionStats,
}

impl Recyclable for Root {
    fn reset(&mut self) {
        // Arena slots are retained for reuse; their contents were already
        // returned to the node pool by `recycle`.
        self.nodes.clear();
        self.free_slots.clear();
        self.parent_context = SpanContext::default();
        self.active.clear();
        self.top_of_stack = None;
        self.cursor_nanos = 0;
        self.ended = false;
        self.stats = SessionStats::default();
    }
}

impl Root {
    /// Take a root from the pool and bind it to the parent trace context.
    pub fn acquire(pool: &mut RootPool, parent_context: SpanContext, timestamp_nanos: u64) -> Root {
        let mut root = pool.acquire();
        root.parent_context = parent_context;
        root.cursor_nanos = timestamp_nanos;
        let mut node = CallTree::default();
        node.init(None, None, 0, timestamp_nanos);
        root.nodes.push(node);
        root
    }

    /// Return every node to the node pool and the root itself to its pool.
    pub fn recycle(mut self, root_pool: &mut RootPool, node_pool: &mut CallTreePool) {
        for node in self.nodes.drain(..) {
            node_pool.release(node);
        }
        root_pool.release(self);
    }

    pub fn parent_context(&self) -> SpanContext {
        self.parent_context
    }

    pub fn node(&self, id: NodeId) -> &CallTree {
        &self.nodes[id.0 as usize]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut CallTree {
        &mut self.nodes[id.0 as usize]
    }

    pub fn root_id(&self) -> NodeId {
        ROOT
    }

    pub fn root_node(&self) -> &CallTree {
        self.node(ROOT)
    }

    /// Samples applied to this tree.
    pub fn count(&self) -> u64 {
        self.root_node().count
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn last_child(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).children.last().copied()
    }

    /// True iff walking parent links from `node` reaches `ancestor`.
    pub fn is_successor(&self, node: NodeId, ancestor: NodeId) -> bool {
        let mut cursor = self.node(node).parent;
        while let Some(id) = cursor {
            if id == ancestor {
                return true;
            }
            cursor = self.node(id).parent;
        }
        false
    }

    fn pair_mut(&mut self, a: NodeId, b: NodeId) -> (&mut CallTree, &mut CallTree) {
        let (a, b) = (a.0 as usize, b.0 as usize);
        debug_assert_ne!(a, b);
        if a < b {
            let (lo, hi) = self.nodes.split_at_mut(b);
            (&mut lo[a], &mut hi[0])
        } else {
            let (lo, hi) = self.nodes.split_at_mut(a);
            (&mut hi[0], &mut lo[b])
        }
    }

    fn new_node(
        &mut self,
        pool: &mut CallTreePool,
        frame: StackFrame,
        parent: NodeId,
        t: u64,
    ) -> NodeId {
        let mut node = pool.acquire();
        let depth = self.node(parent).depth + 1;
        node.init(Some(frame), Some(parent), depth, t);
        node.activation = self
            .active
            .last()
            .map(|&(span, activation_nanos)| NodeActivation {
                span,
                activation_nanos,
            });
        if let Some(slot) = self.free_slots.pop() {
            self.nodes[slot.0 as usize] = node;
            slot
        } else {
            self.nodes.push(node);
            NodeId((self.nodes.len() - 1) as u32)
        }
    }

    /// True when the top of the sampled stack already holds a still-active
    /// span: a new activation is then nested inside that explicit span, and
    /// its parentage is already recorded correctly by the instrumentation.
    fn is_nested_activation(&self, target: NodeId) -> bool {
        let node = self.node(target);
        self.active
            .iter()
            .any(|(active, _)| node.holds_span(active.span_id))
    }

    /// Consume an `Activate` event at time `t`.
    pub fn on_activation(&mut self, span: SpanContext, t: u64) {
        if self.ended {
            return;
        }
        self.cursor_nanos = self.cursor_nanos.max(t);
        let target = self.top_of_stack.unwrap_or(ROOT);
        if !self.is_nested_activation(target) {
            let id = ChildId {
                span,
                activation_nanos: t,
                direct: true,
            };
            if target == ROOT {
                // No sampled method to attribute to yet; the root holds the
                // span until the tree learns more.
                self.node_mut(ROOT).child_ids.push(id);
            } else {
                // The top of the stack has not been sampled at or after `t`,
                // so the attribution stays provisional until its next sample.
                self.node_mut(target).maybe_child_ids.push(id);
            }
        }
        self.active.push((span, t));
    }

    /// Consume a `Deactivate` event at time `t`.
    pub fn on_deactivation(&mut self, span: SpanContext, t: u64) {
        if self.ended {
            return;
        }
        self.cursor_nanos = self.cursor_nanos.max(t);
        let Some(pos) = self
            .active
            .iter()
            .rposition(|(active, _)| active.span_id == span.span_id)
        else {
            self.stats.unmatched_deactivations += 1;
            return;
        };
        let (ctx, activation_nanos) = self.active.remove(pos);

        // Park the decision on every live node of the current stack whose own
        // activation anchor falls inside this span's window: whether such a
        // node contains the span or is contained by it depends on whether the
        // node is sampled again after `t`.
        let mut parked = false;
        let mut cursor = self.top_of_stack;
        while let Some(id) = cursor {
            if id == ROOT {
                break;
            }
            let node = self.node_mut(id);
            if !node.ended {
                if let Some(activation) = node.activation {
                    if activation.activation_nanos >= activation_nanos {
                        node.pending.push(PendingDeactivation {
                            span: ctx,
                            activation_nanos,
                            deactivation_nanos: t,
                        });
                        parked = true;
                    }
                }
            }
            cursor = self.node(id).parent;
        }
        if parked {
            return;
        }

        // No candidate child method: if the span is firmly attributed to a
        // live node whose samples bracket the activation, that method must
        // have run past the deactivation as well.
        for node in &mut self.nodes {
            let owns = node
                .child_ids
                .iter()
                .any(|c| c.span.span_id == ctx.span_id && c.direct);
            if owns {
                if !node.ended && node.last_seen_nanos < t {
                    node.last_seen_nanos = t;
                }
                break;
            }
        }
    }

    /// Apply one activation event.
    pub fn apply_event(&mut self, event: &ActivationEvent) {
        match event.kind {
            ActivationKind::Activate => self.on_activation(event.span, event.timestamp_nanos),
            ActivationKind::Deactivate => self.on_deactivation(event.span, event.timestamp_nanos),
        }
    }

    /// Replay spooled activation events with timestamps `<= up_to`, returning
    /// how many were consumed. Called before inserting a sample taken at
    /// `up_to` so the timeline stays in lockstep.
    pub fn process_activation_events_up_to(
        &mut self,
        reader: &mut ActivationLogReader,
        up_to: u64,
    ) -> Result<usize, ProfilerError> {
        let mut consumed = 0;
        while let Some(event) = reader.next_event_up_to(up_to)? {
            self.apply_event(&event);
            consumed += 1;
        }
        Ok(consumed)
    }

    /// Merge one stack sample taken at `t` into the tree. Frames are ordered
    /// bottom of the stack first.
    pub fn add_stack_trace(
        &mut self,
        frames: &[StackFrame],
        t: u64,
        pool: &mut CallTreePool,
        min_duration_nanos: u64,
    ) {
        if self.ended || frames.is_empty() {
            return;
        }
        if t < self.cursor_nanos {
            self.stats.dropped_samples += 1;
            return;
        }
        self.cursor_nanos = t;
        self.stats.samples_applied += 1;

        {
            let root = self.node_mut(ROOT);
            root.count += 1;
            root.last_seen_nanos = t;
        }

        let mut cursor = ROOT;
        let mut path: SmallVec<[NodeId; 16]> = SmallVec::new();
        for frame in frames {
            let tail = self.last_child(cursor).filter(|&id| {
                let node = self.node(id);
                !node.ended && node.frame.as_ref() == Some(frame)
            });
            if let Some(tail_id) = tail {
                cursor = tail_id;
                let node = self.node_mut(cursor);
                node.count += 1;
                node.last_seen_nanos = t;
                // The node was sampled on both sides of any provisional
                // activation, which confirms the attribution.
                let confirmed: SmallVec<[ChildId; 2]> =
                    std::mem::take(&mut node.maybe_child_ids);
                node.child_ids.extend(confirmed);
            } else {
                // The sample diverges from the most recent path; whatever ran
                // there before is finished.
                self.end_children_of(cursor, pool, min_duration_nanos);
                let id = self.new_node(pool, frame.clone(), cursor, t);
                let node = self.node_mut(id);
                node.count = 1;
                self.node_mut(cursor).children.push(id);
                cursor = id;
            }
            path.push(cursor);
        }
        // The stack ends here, so any children of the deepest node returned.
        self.end_children_of(cursor, pool, min_duration_nanos);
        self.top_of_stack = Some(cursor);
        self.resolve_pending_on_path(&path, t);
    }

    /// Resolve parked deactivations for freshly sampled nodes, deepest first:
    /// being sampled after the deactivation proves the node outlived the span
    /// and therefore contains it.
    fn resolve_pending_on_path(&mut self, path: &[NodeId], t: u64) {
        for &id in path.iter().rev() {
            if self.node(id).pending.is_empty() {
                continue;
            }
            let pending: SmallVec<[PendingDeactivation; 1]> =
                std::mem::take(&mut self.node_mut(id).pending);
            for p in pending {
                debug_assert!(t >= p.deactivation_nanos);
                let node = self.node_mut(id);
                // The method started before the span was activated even
                // though its first sample arrived after.
                if let Some(activation) = node.activation {
                    node.start_nanos = node.start_nanos.min(activation.activation_nanos);
                }
                node.activation = None;
                self.steal_span(id, p.span.span_id, p.activation_nanos, p.deactivation_nanos);
            }
        }
    }

    /// Move `span_id` into `thief.child_ids` if its current owner is an
    /// ancestor of the thief. The window transfer keeps unrelated activations
    /// (those outside the span's lifetime) where they are.
    fn steal_span(&mut self, thief: NodeId, span_id: u64, since: u64, until: u64) {
        let owner = (0..self.nodes.len())
            .map(|i| NodeId(i as u32))
            .find(|&id| self.node(id).holds_span(span_id));
        let Some(owner) = owner else {
            return;
        };
        if owner == thief || !(owner == ROOT || self.is_successor(thief, owner)) {
            return;
        }
        let (thief, owner) = self.pair_mut(thief, owner);
        thief.steal_child_ids_from(owner, since, until);
    }

    fn end_children_of(&mut self, parent: NodeId, pool: &mut CallTreePool, min_duration_nanos: u64) {
        let children: SmallVec<[NodeId; 4]> = self
            .node(parent)
            .children
            .iter()
            .copied()
            .filter(|&c| !self.node(c).ended)
            .collect();
        for child in children {
            self.end_subtree(child, parent, pool, min_duration_nanos);
        }
    }

    /// Seal `id` and its live descendants. `survivor` is the deepest node
    /// still receiving samples; it inherits provisional child ids and the ids
    /// of nodes dropped for being too fast.
    fn end_subtree(
        &mut self,
        id: NodeId,
        survivor: NodeId,
        pool: &mut CallTreePool,
        min_duration_nanos: u64,
    ) {
        {
            let node = self.node_mut(id);
            node.ended = true;
            // Parked deactivations resolve as "the span outlived this node":
            // the node keeps its activation parent and becomes the span's
            // child in the emitted tree.
            node.pending.clear();
            // Provisional ids were activated after this node's last sample,
            // so they belong to the survivor, with weaker evidence.
            let provisional: SmallVec<[ChildId; 2]> = std::mem::take(&mut node.maybe_child_ids);
            let survivor_node = self.node_mut(survivor);
            for cid in provisional {
                survivor_node.child_ids.push(ChildId {
                    direct: false,
                    ..cid
                });
            }
        }

        let children: SmallVec<[NodeId; 4]> = self
            .node(id)
            .children
            .iter()
            .copied()
            .filter(|&c| !self.node(c).ended)
            .collect();
        for child in children {
            self.end_subtree(child, survivor, pool, min_duration_nanos);
        }

        // Single-sample nodes and nodes faster than the configured minimum
        // never become spans; drop them now and recycle their storage.
        let node = self.node(id);
        if node.count == 1 || node.duration_nanos() < min_duration_nanos {
            let parent = node.parent;
            let orphaned: SmallVec<[ChildId; 2]> = {
                let node = self.node_mut(id);
                let mut ids: SmallVec<[ChildId; 2]> = std::mem::take(&mut node.child_ids);
                ids.extend(std::mem::take(&mut node.maybe_child_ids));
                ids
            };
            let survivor_node = self.node_mut(survivor);
            for cid in orphaned {
                survivor_node.child_ids.push(ChildId {
                    direct: false,
                    ..cid
                });
            }
            if let Some(parent) = parent {
                self.node_mut(parent).children.retain(|c| *c != id);
            }
            let freed = std::mem::take(self.node_mut(id));
            pool.release(freed);
            self.free_slots.push(id);
        }
    }

    /// Seal the tree. Still-active spans are treated as deactivated at the
    /// final observed timestamp; afterwards no samples are accepted and the
    /// tree is ready for spanification.
    pub fn end(&mut self, pool: &mut CallTreePool, min_duration_nanos: u64) {
        if self.ended {
            return;
        }
        let final_nanos = self.cursor_nanos.max(self.root_node().last_seen_nanos);
        while let Some(&(span, _)) = self.active.last() {
            self.on_deactivation(span, final_nanos);
        }
        self.end_children_of(ROOT, pool, min_duration_nanos);
        self.node_mut(ROOT).ended = true;
        self.propagate_last_seen(ROOT);
        self.top_of_stack = None;
        self.ended = true;
    }

    /// After sealing, a parent's observed interval must contain each child's;
    /// deactivation-driven extensions are pushed up the ancestor chain.
    fn propagate_last_seen(&mut self, id: NodeId) -> u64 {
        let children: SmallVec<[NodeId; 4]> = self.node(id).children.iter().copied().collect();
        let mut last_seen = self.node(id).last_seen_nanos;
        for child in children {
            last_seen = last_seen.max(self.propagate_last_seen(child));
        }
        self.node_mut(id).last_seen_nanos = last_seen;
        last_seen
    }

    /// Whether an emitted span for `id` would add no information: exactly one
    /// child that was observed in every one of its samples, and no explicit
    /// spans attached.
    pub(crate) fn is_pillar(&self, id: NodeId) -> bool {
        let node = self.node(id);
        node.children.len() == 1
            && self.node(node.children[0]).count == node.count
            && !node.holds_any_ids()
    }

    /// The explicit span this node should be emitted under, when its
    /// activation parent was never contradicted.
    pub(crate) fn activation_parent(&self, id: NodeId) -> Option<SpanContext> {
        self.node(id).activation.map(|a| a.span)
    }

    fn fmt_node(&self, f: &mut fmt::Formatter<'_>, id: NodeId) -> fmt::Result {
        let node = self.node(id);
        if let Some(frame) = &node.frame {
            let indent = (node.depth.saturating_sub(1) * 2) as usize;
            writeln!(f, "{:indent$}{} {}", "", frame.method_name(), node.count)?;
        }
        for &child in node.children.iter() {
            self.fmt_node(f, child)?;
        }
        Ok(())
    }
}

/// Renders the tree as one `method count` line per node, indented two spaces
/// per level below the root.
impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_node(f, ROOT)
    }
}
