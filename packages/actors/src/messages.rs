//! Message types for actor communication.

use std::sync::Arc;

use ractor::RpcReplyPort;
use relay_core::{Event, EventCache, JobStatus};

use crate::event_store::{AsOf, Subscriber};
use crate::handler::HandlerSnapshot;

/// Messages for the event store controller.
#[derive(Debug)]
pub enum EventStoreMessage {
    /// A stored event and its log position, to fan out to interested
    /// handlers.
    Notify { event: Box<Event>, position: usize },

    /// Append buffered relaxed writes.
    Flush,

    /// Register a handler controller, replacing one with the same name.
    Subscribe { subscriber: Subscriber },

    /// Remove a handler controller.
    Unsubscribe { name: String },

    /// List subscribed handler names.
    ListSubscribers { reply: RpcReplyPort<Vec<String>> },

    /// Wait until every subscriber has processed all earlier notifications.
    /// Replies with the number of subscribers that confirmed.
    Drain { reply: RpcReplyPort<usize> },
}

/// Messages for a handler controller.
#[derive(Debug)]
pub enum HandlerMessage {
    /// Re-evaluate the expression as of right after `event` was stored.
    Execute {
        event: Box<Event>,
        cache: Arc<EventCache>,
        as_of: AsOf,
    },

    /// Reply once every earlier message has been processed.
    Sync { reply: RpcReplyPort<()> },

    /// Get the handler's current state.
    GetState { reply: RpcReplyPort<HandlerSnapshot> },

    /// Stop the controller.
    Shutdown,
}

/// Messages for a job actor.
#[derive(Debug)]
pub enum JobMessage {
    /// Run one scheduling step.
    Tick,

    /// Skip ticks until resumed. Replies false if the job already finished.
    Pause { reply: RpcReplyPort<bool> },

    /// Resume a paused job. Replies false if it was not paused.
    Resume { reply: RpcReplyPort<bool> },

    /// Get the job's status.
    GetStatus { reply: RpcReplyPort<JobStatus> },
}
