//! Handlers: event expressions bound to continuations.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use relay_core::{
    CentralApi, Command, DispatchError, Event, EventCache, EventExpression, QueueError,
    QueueHandle, QueueReference, QueueResolver,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HandlerError, StoreError};
use crate::event_store::{AsOf, EventStore, RequestId};

/// Future type for async continuations.
pub type ContinuationFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// Type-erased continuation.
pub type Continuation = Arc<dyn Fn(HandlerContext) -> ContinuationFuture + Send + Sync>;

/// Everything a continuation may act on.
#[derive(Clone)]
pub struct HandlerContext {
    pub handler: String,
    /// The event whose arrival triggered this evaluation.
    pub last_event: Option<Event>,
    /// Resolved queues by reference identifier.
    pub queues: HashMap<String, QueueHandle>,
    pub store: EventStore,
    pub api: Option<Arc<CentralApi>>,
}

impl HandlerContext {
    pub fn queue(&self, identifier: &str) -> Option<&QueueHandle> {
        self.queues.get(identifier)
    }

    /// Put `item` into the resolved queue `identifier`.
    pub fn put(&self, identifier: &str, item: Value) -> Result<(), String> {
        let queue = self
            .queue(identifier)
            .ok_or_else(|| format!("queue '{identifier}' is not a dependency of this handler"))?;
        queue.put(item).map_err(|e| e.to_string())
    }

    /// Store an event with a locked append.
    pub fn put_event(&self, event: Event) -> Result<RequestId, StoreError> {
        self.store.put_event(event, true)
    }

    /// Dispatch a command through the Central API.
    pub async fn dispatch(&self, command: Command) -> Result<Value, DispatchError> {
        match &self.api {
            Some(api) => api.dispatch(command).await,
            None => Err(DispatchError::UnknownCommand {
                api_identifier: command.api_identifier,
                api_path: command.api_path,
            }),
        }
    }
}

/// Where a handler is in its evaluation cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerState {
    #[default]
    Idle,
    Evaluating,
    TrueFired,
    FalseFired,
}

/// What one `execute` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    FiredTrue,
    FiredFalse,
    Unchanged,
}

/// Read-only view of a handler, for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerSnapshot {
    pub name: String,
    pub state: HandlerState,
    pub last_truth: Option<bool>,
    pub fired_true: u64,
    pub fired_false: u64,
}

/// Binds an expression to `when_true` / `when_false` continuations.
///
/// Continuations fire on transitions only: `when_true` when the expression
/// becomes true (including the first evaluation), `when_false` when it goes
/// from true back to false.
pub struct Handler {
    pub name: String,
    pub expression: EventExpression,
    when_true: Continuation,
    when_false: Option<Continuation>,
    queue_refs: Vec<QueueReference>,
    queues: HashMap<String, QueueHandle>,
    state: HandlerState,
    last_truth: Option<bool>,
    fired_true: u64,
    fired_false: u64,
}

fn boxed<F, Fut>(f: F) -> Continuation
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)) as ContinuationFuture)
}

impl Handler {
    pub fn new<F, Fut>(name: impl Into<String>, expression: EventExpression, when_true: F) -> Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            expression,
            when_true: boxed(when_true),
            when_false: None,
            queue_refs: Vec::new(),
            queues: HashMap::new(),
            state: HandlerState::Idle,
            last_truth: None,
            fired_true: 0,
            fired_false: 0,
        }
    }

    pub fn with_when_false<F, Fut>(mut self, when_false: F) -> Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.when_false = Some(boxed(when_false));
        self
    }

    /// Declare a queue the continuations will use.
    pub fn with_queue(mut self, reference: impl Into<QueueReference>) -> Self {
        self.queue_refs.push(reference.into());
        self
    }

    pub fn queue_refs(&self) -> &[QueueReference] {
        &self.queue_refs
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn last_truth(&self) -> Option<bool> {
        self.last_truth
    }

    pub fn is_resolved(&self) -> bool {
        self.queue_refs
            .iter()
            .all(|r| self.queues.contains_key(&r.identifier))
    }

    pub fn snapshot(&self) -> HandlerSnapshot {
        HandlerSnapshot {
            name: self.name.clone(),
            state: self.state,
            last_truth: self.last_truth,
            fired_true: self.fired_true,
            fired_false: self.fired_false,
        }
    }

    /// Resolve declared queue references. Already resolved ones are kept.
    pub fn evaluate_queues(&mut self, resolver: &dyn QueueResolver<Value>) -> Result<(), HandlerError> {
        for reference in &self.queue_refs {
            if self.queues.contains_key(&reference.identifier) {
                continue;
            }
            let queue = resolver.resolve(reference).ok_or_else(|| HandlerError::Queue {
                handler: self.name.clone(),
                source: QueueError::NotResolved(reference.identifier.clone()),
            })?;
            self.queues.insert(reference.identifier.clone(), queue);
        }
        Ok(())
    }

    /// Evaluate the expression as of `as_of` and run a continuation on a
    /// transition.
    pub async fn execute(
        &mut self,
        last_event: Option<Event>,
        store: &EventStore,
        cache: Option<&EventCache>,
        as_of: AsOf,
        api: Option<Arc<CentralApi>>,
    ) -> Result<HandlerOutcome, HandlerError> {
        if let Some(missing) = self
            .queue_refs
            .iter()
            .find(|r| !self.queues.contains_key(&r.identifier))
        {
            return Err(HandlerError::Queue {
                handler: self.name.clone(),
                source: QueueError::NotResolved(missing.identifier.clone()),
            });
        }

        self.state = HandlerState::Evaluating;
        let truth = store.evaluate_cached(&self.expression, cache, as_of);
        let previous = self.last_truth.replace(truth);

        let (continuation, outcome, state) = match (previous, truth) {
            (Some(true), true) => (None, HandlerOutcome::Unchanged, HandlerState::Idle),
            (_, true) => (
                Some(self.when_true.clone()),
                HandlerOutcome::FiredTrue,
                HandlerState::TrueFired,
            ),
            (Some(true), false) => match &self.when_false {
                Some(when_false) => (
                    Some(when_false.clone()),
                    HandlerOutcome::FiredFalse,
                    HandlerState::FalseFired,
                ),
                None => (None, HandlerOutcome::Unchanged, HandlerState::Idle),
            },
            (_, false) => (None, HandlerOutcome::Unchanged, HandlerState::Idle),
        };

        let Some(continuation) = continuation else {
            self.state = HandlerState::Idle;
            return Ok(outcome);
        };

        self.state = state;
        match outcome {
            HandlerOutcome::FiredTrue => self.fired_true += 1,
            HandlerOutcome::FiredFalse => self.fired_false += 1,
            HandlerOutcome::Unchanged => {}
        }
        tracing::debug!("Handler {} fired ({:?})", self.name, outcome);

        let ctx = HandlerContext {
            handler: self.name.clone(),
            last_event,
            queues: self.queues.clone(),
            store: store.clone(),
            api,
        };
        let result = continuation(ctx).await;
        self.state = HandlerState::Idle;

        result.map(|()| outcome).map_err(|message| {
            tracing::warn!("Handler {} continuation failed: {}", self.name, message);
            HandlerError::Continuation {
                handler: self.name.clone(),
                message,
            }
        })
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("expression", &self.expression)
            .field("queue_refs", &self.queue_refs)
            .field("state", &self.state)
            .field("last_truth", &self.last_truth)
            .finish()
    }
}
