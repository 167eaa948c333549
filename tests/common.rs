//! Shared harness for call tree scenario tests.
//!
//! Scenarios are drawn as ASCII timelines: columns are sample ticks 10 ms
//! apart, letter rows are stack frames (top of stack first), and a digit row
//! toggles activation of the explicit span with that name. Example:
//!
//! ```text
//! " bb  "   <- top of stack
//! "aaaa "   <- bottom of stack
//! "1   1"   <- span 1 activates at tick 0, deactivates at tick 4
//! ```

use inferred_spans::profiler::{
    default_parent_override, session_pools, spanify, ActivationBuffer, ActivationEvent,
    ActivationLogReader, ActivationLogWriter, CallTreePool, CapturingTracer, FixedClock,
    ProfilerConfig, Root, RootPool, SpanContext, StackFrame,
};

pub const TICK_NANOS: u64 = 10_000_000;
pub const TRACE_ID: u64 = 7;
pub const TRANSACTION: SpanContext = SpanContext::new(TRACE_ID, 1);
pub const TRANSACTION_NAME: &str = "Call Tree Root";

const FRAME_CLASS: &str = "CallTreeTest";

/// A span as seen by the assertions: explicit spans recorded by the harness
/// and inferred spans captured from the tracer are folded into this shape.
#[derive(Debug, Clone)]
pub struct SpanInfo {
    pub name: String,
    pub context: SpanContext,
    pub parent: SpanContext,
    pub start_nanos: u64,
    pub end_nanos: u64,
    pub links: Vec<(SpanContext, bool)>,
    pub stack_trace: Vec<String>,
}

pub struct ScenarioResult {
    pub root: Root,
    pub node_pool: CallTreePool,
    pub root_pool: RootPool,
    /// Explicit spans created by the instrumented side of the scenario.
    pub explicit: Vec<SpanInfo>,
}

fn tick_time(column: usize) -> u64 {
    1 + column as u64 * TICK_NANOS
}

/// Drive the engine through a scenario. Activation events travel the real
/// path: buffer, timestamp-sorted drain, binary spool, replay in lockstep
/// with the samples.
pub fn run_scenario(rows: &[&str], config: &ProfilerConfig) -> ScenarioResult {
    let (mut root_pool, mut node_pool) = session_pools(config);
    let min_nanos = config.inferred_spans_min_duration_nanos;

    let buffer = ActivationBuffer::new();
    let mut explicit: Vec<SpanInfo> = Vec::new();
    let mut active: Vec<usize> = Vec::new(); // indexes into `explicit`
    let mut next_span_id = TRANSACTION.span_id + 1;
    let mut samples: Vec<(Vec<StackFrame>, u64)> = Vec::new();

    let columns = rows.iter().map(|r| r.len()).max().unwrap_or(0);
    for column in 0..columns {
        let t = tick_time(column);
        let mut frames: Vec<StackFrame> = Vec::new();
        for row in rows {
            let Some(&byte) = row.as_bytes().get(column) else {
                continue;
            };
            let ch = byte as char;
            if ch.is_ascii_digit() {
                let name = ch.to_string();
                if let Some(active_pos) = active.iter().position(|&i| explicit[i].name == name) {
                    // Deactivation: close the span.
                    let idx = active[active_pos];
                    let span = explicit[idx].context;
                    let parent = explicit[idx].parent;
                    explicit[idx].end_nanos = t;
                    active.remove(active_pos);
                    buffer.push(ActivationEvent::deactivate(span, parent, t));
                } else {
                    // Activation: the parent is whatever is current.
                    let parent = active
                        .last()
                        .map(|&i| explicit[i].context)
                        .unwrap_or(TRANSACTION);
                    let context = SpanContext::new(TRACE_ID, next_span_id);
                    next_span_id += 1;
                    explicit.push(SpanInfo {
                        name,
                        context,
                        parent,
                        start_nanos: t,
                        end_nanos: t,
                        links: Vec::new(),
                        stack_trace: Vec::new(),
                    });
                    active.push(explicit.len() - 1);
                    buffer.push(ActivationEvent::activate(context, parent, t));
                }
                break;
            } else if ch != ' ' {
                frames.push(StackFrame::new(FRAME_CLASS, name_of(ch)));
            }
        }
        if !frames.is_empty() {
            // Rows are drawn top of stack first; the engine takes bottom first.
            frames.reverse();
            samples.push((frames, t));
        }
    }

    // Spool the drain window to disk and replay it against the samples.
    let dir = tempfile::TempDir::new().unwrap();
    let spool = dir.path().join("activations.bin");
    let mut writer = ActivationLogWriter::create(&spool).unwrap();
    writer.append_all(&buffer.drain_sorted()).unwrap();
    writer.flush().unwrap();
    let mut reader = ActivationLogReader::open(&spool).unwrap();

    let mut root = Root::acquire(&mut root_pool, TRANSACTION, 1);
    for (frames, t) in &samples {
        root.process_activation_events_up_to(&mut reader, *t).unwrap();
        root.add_stack_trace(frames, *t, &mut node_pool, min_nanos);
    }
    root.end(&mut node_pool, 0);

    ScenarioResult {
        root,
        node_pool,
        root_pool,
        explicit,
    }
}

fn name_of(ch: char) -> String {
    ch.to_string()
}

/// Assert the sealed tree renders exactly as `expected`: one
/// `(indented name, count)` pair per node, two spaces per level.
pub fn assert_tree(result: &ScenarioResult, expected: &[(&str, u64)]) {
    let want: String = expected
        .iter()
        .map(|(name, count)| format!("{name} {count}"))
        .collect::<Vec<_>>()
        .join("\n");
    let got = result.root.to_string();
    assert_eq!(got.trim_end(), want, "call tree mismatch");
}

/// An expected emitted span: indented name, duration in ticks, and the stack
/// trace of collapsed frames it carries.
pub struct ExpectedSpan {
    pub name: &'static str,
    pub duration_ticks: u64,
    pub stack_trace: &'static [&'static str],
}

pub fn span(name: &'static str, duration_ticks: u64) -> ExpectedSpan {
    ExpectedSpan {
        name,
        duration_ticks,
        stack_trace: &[],
    }
}

pub fn span_with_stack(
    name: &'static str,
    duration_ticks: u64,
    stack_trace: &'static [&'static str],
) -> ExpectedSpan {
    ExpectedSpan {
        name,
        duration_ticks,
        stack_trace,
    }
}

/// Spanify the sealed tree and assert the full set of emitted and explicit
/// spans: names, durations, stack traces, and parent/child relationships
/// (native parent pointer or an `is_child` link).
///
/// Returns all spans keyed by name for extra per-test assertions.
pub fn assert_spans(
    result: &ScenarioResult,
    expected: &[ExpectedSpan],
) -> std::collections::HashMap<String, SpanInfo> {
    let clock = FixedClock::new(0);
    let mut tracer = CapturingTracer::new();
    spanify(&result.root, &clock, &mut tracer, default_parent_override).unwrap();

    let mut spans: Vec<SpanInfo> = Vec::new();
    spans.push(SpanInfo {
        name: TRANSACTION_NAME.to_string(),
        context: TRANSACTION,
        parent: SpanContext::default(),
        start_nanos: 1,
        end_nanos: 1,
        links: Vec::new(),
        stack_trace: Vec::new(),
    });
    spans.extend(result.explicit.iter().cloned());
    for record in tracer.spans() {
        spans.push(SpanInfo {
            // `CallTreeTest#a` -> `a`, mirroring how span names are asserted.
            name: record
                .name
                .rsplit('#')
                .next()
                .unwrap()
                .to_string(),
            context: record.context,
            parent: record.parent,
            start_nanos: record.start_nanos,
            end_nanos: record.end_nanos,
            links: record
                .links
                .iter()
                .map(|l| (l.target, l.is_child))
                .collect(),
            stack_trace: record
                .stack_trace
                .iter()
                .map(|f| f.method_name().to_string())
                .collect(),
        });
    }
    assert_eq!(
        spans.len(),
        expected.len() + 1,
        "unexpected span count; got {:?}",
        spans.iter().map(|s| s.name.clone()).collect::<Vec<_>>()
    );

    let by_name: std::collections::HashMap<String, SpanInfo> = spans
        .iter()
        .map(|s| (s.name.clone(), s.clone()))
        .collect();

    for (i, exp) in expected.iter().enumerate() {
        let name = exp.name.trim();
        let parent_name = parent_name(expected, i).unwrap_or(TRANSACTION_NAME);
        let span = by_name
            .get(name)
            .unwrap_or_else(|| panic!("no span named {name:?}"));
        let parent = by_name
            .get(parent_name)
            .unwrap_or_else(|| panic!("no span named {parent_name:?}"));

        assert!(
            is_child(parent, span),
            "expected {name} to be a child of {parent_name}, but its parent is {:?}",
            spans.iter().find(|s| s.context.span_id == span.parent.span_id).map(|s| &s.name)
        );
        assert!(
            !is_child(span, parent),
            "expected {parent_name} not to be a child of {name}"
        );
        assert_eq!(
            span.end_nanos - span.start_nanos,
            exp.duration_ticks * TICK_NANOS,
            "unexpected duration for span {name}"
        );
        let want_stack: Vec<String> = exp.stack_trace.iter().map(|s| s.to_string()).collect();
        assert_eq!(span.stack_trace, want_stack, "unexpected stack trace for span {name}");
    }

    by_name
}

/// A span is a child when its recorded parent points at `parent`, or when
/// `parent` carries an `is_child` link targeting it.
pub fn is_child(parent: &SpanInfo, child: &SpanInfo) -> bool {
    if parent.context.trace_id != child.context.trace_id {
        return false;
    }
    if child.parent.span_id == parent.context.span_id {
        return true;
    }
    parent
        .links
        .iter()
        .any(|&(target, is_child)| is_child && target.span_id == child.context.span_id)
}

fn parent_name(expected: &[ExpectedSpan], i: usize) -> Option<&'static str> {
    let level = nesting_level(expected[i].name);
    if level == 0 {
        return None;
    }
    (0..i)
        .rev()
        .find(|&j| nesting_level(expected[j].name) == level - 1)
        .map(|j| expected[j].name.trim())
}

fn nesting_level(name: &str) -> usize {
    (name.len() - name.trim_start().len()) / 2
}
