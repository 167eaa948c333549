//! Error types for the inference engine.
//!
//! Recoverable anomalies (out-of-order samples, unmatched deactivations,
//! pool exhaustion) are counted, not raised; only programmer errors and IO
//! failures surface here.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProfilerError {
    /// `spanify` was called on a tree that has not been sealed with `end`.
    #[error("spanify called before the call tree was ended")]
    SpanifyOnUnendedTree,

    /// Reading or writing the activation event spool failed.
    #[error("activation log IO error: {0}")]
    ActivationLog(#[from] std::io::Error),
}
