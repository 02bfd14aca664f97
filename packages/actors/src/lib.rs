//! Actor runtime for relay.
//!
//! This crate wires the core types into a running node using Ractor actors.
//!
//! # Architecture
//!
//! - `EventStoreController` - Fans stored events out to interested handlers
//! - `HandlerController` - One per handler; serializes its executions
//! - `JobActor` - One per job; ticks the job then sleeps `wait_time`
//! - `SchedulerContext` - Owns queues, store, API and actors of one node
//!
//! # Usage
//!
//! ```ignore
//! use actors::{RuntimeConfig, SchedulerContext};
//!
//! let mut ctx = SchedulerContext::init(RuntimeConfig::from_env()?, storage);
//! ctx.register(job).await?;
//! ctx.register(handler).await?;
//! ctx.start().await?;
//! ```

pub mod apis;
mod config;
mod context;
mod error;
mod event_store;
mod event_store_controller;
mod handler;
mod handler_controller;
mod job_actor;
mod messages;
pub mod registry;
mod scheduler;

pub use config::{ConfigError, RuntimeConfig};
pub use context::{Registration, SchedulerContext};
pub use error::{ContextError, HandlerError, SchedulerError, StoreError};
pub use event_store::{AsOf, EventStore, RequestId, Subscriber};
pub use event_store_controller::EventStoreController;
pub use handler::{
    Continuation, ContinuationFuture, Handler, HandlerContext, HandlerOutcome, HandlerSnapshot,
    HandlerState,
};
pub use handler_controller::{HandlerArgs, HandlerController, spawn_handler};
pub use job_actor::{JobActor, spawn_job};
pub use messages::{EventStoreMessage, HandlerMessage, JobMessage};
pub use registry::QueueRegistry;
pub use scheduler::{
    ERROR_ITEM_TYPE, NEW_JOB_ITEM_TYPE, ScheduledJob, Scheduler, SchedulerHandle, TickOutcome,
};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
