//! Error types shared by the core domain types.

use thiserror::Error;

use crate::pipeline::NodeId;

/// Errors returned by queue operations.
///
/// `Empty` is the normal "no data yet" signal and is expected on every
/// polling loop; callers retry on their own schedule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue is empty")]
    Empty,

    #[error("queue is full (capacity {capacity})")]
    Full { capacity: usize },

    #[error("queue reference '{0}' has not been resolved")]
    NotResolved(String),
}

impl QueueError {
    /// True for the recoverable "nothing available" case.
    pub fn is_empty(&self) -> bool {
        matches!(self, QueueError::Empty)
    }
}

/// Errors raised while building a pipeline graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("unknown pipeline node {0}")]
    UnknownNode(NodeId),

    #[error("linking {from} -> {to} would create a cycle")]
    Cycle { from: NodeId, to: NodeId },
}

/// Errors returned by the Central API dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no handler registered for {api_identifier}/{api_path}")]
    UnknownCommand {
        api_identifier: String,
        api_path: String,
    },

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("handler for {api_identifier}/{api_path} failed: {message}")]
    Handler {
        api_identifier: String,
        api_path: String,
        message: String,
    },
}
