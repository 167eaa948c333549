pub mod activation;
pub mod activation_log;
pub mod call_tree;
pub mod clock;
pub mod config;
pub mod error;
pub mod frame;
pub mod pool;
pub mod spanify;
pub mod tracer;

pub use activation::{ActivationBuffer, ActivationEvent, ActivationKind};
pub use activation_log::{ActivationLogReader, ActivationLogWriter};
pub use call_tree::{session_pools, CallTree, CallTreePool, NodeId, Root, RootPool, SessionStats};
pub use clock::{FixedClock, NanoClock, SystemClock};
pub use config::ProfilerConfig;
pub use error::ProfilerError;
pub use frame::StackFrame;
pub use pool::{ObjectPool, Recyclable};
pub use spanify::{default_parent_override, spanify, ParentOverride};
pub use tracer::{
    CapturingTracer, NullTracer, SpanContext, SpanHandle, SpanRecord, SpanTracer, LINK_IS_CHILD,
};
