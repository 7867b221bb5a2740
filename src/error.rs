//! Errors raised by the scoring core
//!
//! Agent-quality problems (bad snippets, failing tests, mis-coordination) are
//! never errors: they show up as low scores. Only a broken task definition is.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("skeleton source is empty")]
    EmptySkeleton,

    #[error("class `{0}` was not found in the skeleton")]
    ClassNotFound(String),

    #[error("target method `{method}` is not defined on class `{class_name}`")]
    UnknownTarget { method: String, class_name: String },

    #[error("class `{0}` has no target methods to implement")]
    NoTargets(String),

    #[error("partition assigns `{method}` to agent {agent}, but only {agents} agent completions were supplied")]
    PartitionOutOfRange {
        method: String,
        agent: usize,
        agents: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
