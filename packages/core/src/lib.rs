//! Core domain types for the relay orchestration runtime.
//!
//! This crate contains the runtime-independent pieces:
//! - Queues, queue references and consumers
//! - Job definitions, outputs and pipelines
//! - Events, event references and time-windowed expressions
//! - Commands and the Central API dispatcher

mod command;
mod consumer;
mod dispatch;
mod error;
mod events;
mod expression;
mod job;
mod pipeline;
mod queue;

pub use command::{Command, TypedCommand};
pub use consumer::{Consumer, Drain, QueueResolver};
pub use dispatch::{ApiFuture, ApiHandler, ApiResult, CentralApi, ExtraApi, FnApi};
pub use error::{DispatchError, PipelineError, QueueError};
pub use events::{
    CachedLookup, Event, EventCache, EventId, EventLog, EventLookup, EventReference, LogPrefix,
};
pub use expression::EventExpression;
pub use job::{JobCall, JobDefinition, JobOutput, JobStatus, RunFunction, RunFuture, distribute};
pub use pipeline::{NodeId, Pipeline, PipelineNode};
pub use queue::{InMemoryQueue, Queue, QueueBinding, QueueDefinition, QueueHandle, QueueReference};
