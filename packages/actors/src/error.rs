//! Error types for the runtime layer.

use relay_core::{PipelineError, QueueError};

/// Errors returned by the event store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("event store is closed")]
    Closed,

    #[error("event store controller error: {0}")]
    Controller(String),
}

/// Errors raised while resolving or running a handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("handler '{handler}': {source}")]
    Queue {
        handler: String,
        #[source]
        source: QueueError,
    },

    #[error("handler '{handler}' continuation failed: {message}")]
    Continuation { handler: String, message: String },

    #[error("failed to spawn handler controller: {0}")]
    Spawn(String),

    #[error("handler controller error: {0}")]
    Actor(String),
}

/// Errors returned by the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("job '{0}' is already scheduled")]
    DuplicateJob(String),

    #[error("job '{0}' not found")]
    UnknownJob(String),

    #[error("no job template named '{0}'")]
    UnknownTemplate(String),

    #[error("job '{job}': {source}")]
    Queue {
        job: String,
        #[source]
        source: QueueError,
    },

    #[error("failed to spawn job actor: {0}")]
    Spawn(String),

    #[error("job actor error: {0}")]
    Actor(String),
}

/// Errors returned by [`SchedulerContext`](crate::SchedulerContext).
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("context already started")]
    AlreadyStarted,

    #[error("queue '{0}' already exists")]
    QueueExists(String),

    #[error("handler '{0}' not found")]
    UnknownHandler(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
