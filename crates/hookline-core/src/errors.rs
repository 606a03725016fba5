use std::time::Duration;

use crate::node::{InputShape, Shape};

/// Failure observed by a stream reader.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The reader was closed; no further frames will be returned.
    #[error("stream reader already closed")]
    Closed,
    /// The producer failed mid-stream. Delivered once to every live reader.
    #[error("stream producer failed: {0}")]
    Fault(String),
}

/// Failure returned to a stream producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Every reader has closed its handle.
    #[error("all stream readers are closed")]
    Closed,
    /// The stream's cancellation token fired.
    #[error("stream cancelled")]
    Cancelled,
}

/// Errors returned by node implementations (model calls, tools, lambdas).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    #[error("{0}")]
    Failed(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }
}

/// Error surfaced by `Pipeline::invoke`. Hooks receive it through `on_error` before it propagates.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("node `{node}` failed: {source}")]
    Node { node: String, source: NodeError },
    #[error("invocation cancelled")]
    Cancelled,
    #[error("invocation timed out after {0:?}")]
    TimedOut(Duration),
}

impl ExecutionError {
    pub(crate) fn node(node: impl Into<String>, source: NodeError) -> Self {
        Self::Node {
            node: node.into(),
            source,
        }
    }

    /// Name of the failing node, when the failure came from one.
    pub fn node_name(&self) -> Option<&str> {
        match self {
            Self::Node { node, .. } => Some(node),
            Self::Cancelled | Self::TimedOut(_) => None,
        }
    }
}

/// Raised while building nodes or compiling a pipeline; never at invocation time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConstructionError {
    #[error("name must not be empty")]
    EmptyName,
    #[error("pipeline `{pipeline}` has no nodes")]
    EmptyPipeline { pipeline: String },
    #[error("pipeline `{pipeline}` has more than one node named `{node}`")]
    DuplicateNode { pipeline: String, node: String },
    #[error("node `{node}` is declared {declared} but its callable produces {actual}")]
    ShapeMismatch {
        node: String,
        declared: Shape,
        actual: Shape,
    },
    #[error("node `{from}` produces {output} but `{to}` accepts {input}")]
    IncompatibleLink {
        from: String,
        to: String,
        output: Shape,
        input: InputShape,
    },
    #[error("invalid schema for tool `{tool}`: {message}")]
    InvalidSchema { tool: String, message: String },
    #[error("tool `{name}` registered more than once")]
    DuplicateTool { name: String },
    #[error("chat model behind `{node}` cannot call tools")]
    ToolsUnsupported { node: String },
}
