//! Stack frame identity.

use serde::Serialize;
use std::fmt;

/// Immutable identity of a sampled (class, method) pair.
///
/// Equality and hashing are content-based: two frames are the same when both
/// their class name and method name match. Frames discriminate children during
/// sample insertion, so cheap comparison matters more than cheap construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StackFrame {
    class_name: String,
    method_name: String,
}

impl StackFrame {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// Span name used when this frame is turned into an inferred span,
    /// e.g. `Servlet#doGet`.
    pub fn span_name(&self) -> String {
        format!("{}#{}", self.class_name, self.method_name)
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class_name, self.method_name)
    }
}
