//! Append-only event store shared by jobs, handlers and APIs.
//!
//! Writes come in two flavours:
//! - locked appends, stored and queued for notification under one mutex so
//!   they are totally ordered;
//! - relaxed appends, buffered and stored later by the controller (or by
//!   [`EventStore::flush`]), eventually visible.
//!
//! Reads never wait for the append mutex.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};

use chrono::{DateTime, Utc};
use ractor::{Actor, ActorRef};
use relay_core::{
    CachedLookup, Event, EventCache, EventExpression, EventLog, EventLookup, EventReference,
};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::config::RuntimeConfig;
use crate::error::StoreError;
use crate::event_store_controller::{ControllerArgs, EventStoreController};
use crate::messages::{EventStoreMessage, HandlerMessage};

/// Identifier returned for every accepted write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Ulid);

impl RequestId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a request ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The point in history an expression is evaluated against: time `at`,
/// and only the first `end` stored events when `end` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsOf {
    pub at: DateTime<Utc>,
    pub end: Option<usize>,
}

impl AsOf {
    /// Everything stored so far, as of `at`.
    pub fn time(at: DateTime<Utc>) -> Self {
        Self { at, end: None }
    }

    pub fn now() -> Self {
        Self::time(Utc::now())
    }

    /// History right after `event` was stored at log `position`.
    pub fn after(event: &Event, position: usize) -> Self {
        Self {
            at: event.timestamp,
            end: Some(position + 1),
        }
    }
}

/// A handler controller interested in some event references.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub name: String,
    pub handler: ActorRef<HandlerMessage>,
    pub references: Vec<EventReference>,
}

impl Subscriber {
    pub fn new(
        name: impl Into<String>,
        handler: ActorRef<HandlerMessage>,
        references: Vec<EventReference>,
    ) -> Self {
        Self {
            name: name.into(),
            handler,
            references,
        }
    }

    pub fn is_relevant(&self, event: &Event) -> bool {
        self.references.iter().any(|r| r.matches(event))
    }
}

#[derive(Default)]
struct StoreInner {
    log: RwLock<EventLog>,
    /// Serializes locked appends with their notification.
    append: Mutex<NotifyState>,
    relaxed: Mutex<VecDeque<(RequestId, Event)>>,
    pending: Mutex<HashSet<RequestId>>,
    closed: AtomicBool,
}

#[derive(Default)]
struct NotifyState {
    controller: Option<ActorRef<EventStoreMessage>>,
    /// Events stored before the controller started, with their positions.
    backlog: Vec<(Event, usize)>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable handle to one event store.
#[derive(Clone, Default)]
pub struct EventStore {
    inner: Arc<StoreInner>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self) -> RwLockReadGuard<'_, EventLog> {
        self.inner.log.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Store one event.
    ///
    /// With `acquire_lock` the event is visible to readers when this
    /// returns. Without it the event is buffered and the returned id stays
    /// unfinished until the buffer is flushed.
    pub fn put_event(&self, event: Event, acquire_lock: bool) -> Result<RequestId, StoreError> {
        let id = RequestId::new();
        if acquire_lock {
            let mut notify = lock(&self.inner.append);
            if self.is_closed() {
                return Err(StoreError::Closed);
            }
            self.append_locked(&mut notify, event);
        } else {
            {
                let mut relaxed = lock(&self.inner.relaxed);
                if self.is_closed() {
                    return Err(StoreError::Closed);
                }
                lock(&self.inner.pending).insert(id);
                relaxed.push_back((id, event));
            }
            if let Some(controller) = self.controller() {
                let _ = controller.send_message(EventStoreMessage::Flush);
            }
        }
        Ok(id)
    }

    /// Store several events, each independently.
    ///
    /// One result per event, in order. Events stored before a failure stay
    /// stored.
    pub fn put_events(
        &self,
        events: impl IntoIterator<Item = Event>,
        acquire_lock: bool,
    ) -> Vec<Result<RequestId, StoreError>> {
        events
            .into_iter()
            .map(|event| self.put_event(event, acquire_lock))
            .collect()
    }

    /// Append and notify. The caller holds the append mutex.
    fn append_locked(&self, notify: &mut NotifyState, event: Event) {
        let position = self
            .inner
            .log
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .append(event.clone());
        match &notify.controller {
            Some(controller) => {
                let name = event.name.clone();
                if let Err(e) = controller.send_message(EventStoreMessage::Notify {
                    event: Box::new(event),
                    position,
                }) {
                    // The event stays stored; only the notification is lost.
                    tracing::warn!("Failed to notify handlers of event {}: {}", name, e);
                }
            }
            None => notify.backlog.push((event, position)),
        }
    }

    /// Append every buffered relaxed write. Returns how many were stored.
    pub fn flush(&self) -> usize {
        let batch: Vec<(RequestId, Event)> = lock(&self.inner.relaxed).drain(..).collect();
        let count = batch.len();
        for (id, event) in batch {
            self.append_locked(&mut lock(&self.inner.append), event);
            lock(&self.inner.pending).remove(&id);
        }
        if count > 0 {
            tracing::debug!("Flushed {} relaxed event appends", count);
        }
        count
    }

    /// Reject every later put with [`StoreError::Closed`].
    ///
    /// Writes accepted before this call are kept; buffered ones are stored by
    /// the next [`EventStore::flush`].
    pub fn close(&self) {
        let _relaxed = lock(&self.inner.relaxed);
        let _notify = lock(&self.inner.append);
        self.inner.closed.store(true, Ordering::Release);
    }

    /// True once the write identified by `id` is visible to readers.
    pub fn is_request_finished(&self, id: RequestId) -> bool {
        !lock(&self.inner.pending).contains(&id)
    }

    /// True iff any stored event matches `reference`.
    pub fn event_happened(&self, reference: &EventReference) -> bool {
        self.log().happened(reference)
    }

    pub fn events_happened(&self, references: &[EventReference]) -> HashMap<EventReference, bool> {
        let log = self.log();
        references
            .iter()
            .map(|r| (r.clone(), log.happened(r)))
            .collect()
    }

    /// Most recent matching event with `timestamp <= at`.
    pub fn latest(&self, reference: &EventReference, at: DateTime<Utc>) -> Option<Event> {
        self.log().latest_matching(reference, at).cloned()
    }

    pub fn evaluate(&self, expression: &EventExpression, at: DateTime<Utc>) -> bool {
        self.evaluate_cached(expression, None, AsOf::time(at))
    }

    /// Evaluate as of `as_of`, consulting `cache` before the log.
    pub fn evaluate_cached(
        &self,
        expression: &EventExpression,
        cache: Option<&EventCache>,
        as_of: AsOf,
    ) -> bool {
        let log = self.log();
        let prefix = log.prefix(as_of.end.unwrap_or(usize::MAX));
        let lookup = CachedLookup::new(cache, &prefix);
        expression.evaluate(&lookup, as_of.at)
    }

    /// Resolve `references` into a cache for one dispatch round.
    pub fn build_cache<'a>(
        &self,
        references: impl IntoIterator<Item = &'a EventReference>,
        as_of: AsOf,
    ) -> EventCache {
        let log = self.log();
        let prefix = log.prefix(as_of.end.unwrap_or(usize::MAX));
        let mut cache = EventCache::new();
        for reference in references {
            if cache.get(reference).is_none()
                && let Some(event) = prefix.latest(reference, as_of.at)
            {
                cache.insert(reference.clone(), event);
            }
        }
        cache
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.log().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log().is_empty()
    }

    /// Snapshot of all stored events in append order.
    pub fn events(&self) -> Vec<Event> {
        self.log().iter().cloned().collect()
    }

    fn controller(&self) -> Option<ActorRef<EventStoreMessage>> {
        lock(&self.inner.append).controller.clone()
    }

    pub fn is_running(&self) -> bool {
        self.controller().is_some()
    }

    /// Start the controller actor and notifications.
    ///
    /// `subscribers` are registered before anything is fanned out, so they
    /// are notified of events stored before this call.
    pub async fn run(
        &self,
        config: &RuntimeConfig,
        subscribers: Vec<Subscriber>,
    ) -> Result<(), StoreError> {
        if self.is_running() {
            return Err(StoreError::Controller("already running".into()));
        }
        let args = ControllerArgs {
            store: self.clone(),
            flush_interval: config.idle_poll_interval,
            drain_timeout: config.drain_timeout,
        };
        let (actor, _handle) = Actor::spawn(None, EventStoreController, args)
            .await
            .map_err(|e| StoreError::Controller(format!("failed to spawn controller: {e}")))?;

        {
            let mut notify = lock(&self.inner.append);
            for subscriber in subscribers {
                actor
                    .send_message(EventStoreMessage::Subscribe { subscriber })
                    .map_err(|e| StoreError::Controller(e.to_string()))?;
            }
            for (event, position) in notify.backlog.drain(..) {
                let _ = actor.send_message(EventStoreMessage::Notify {
                    event: Box::new(event),
                    position,
                });
            }
            notify.controller = Some(actor.clone());
        }
        self.flush();
        tracing::info!("Event store controller started");
        Ok(())
    }

    /// Register a handler controller for notifications about its references.
    pub fn subscribe(&self, subscriber: Subscriber) -> Result<(), StoreError> {
        let controller = self
            .controller()
            .ok_or_else(|| StoreError::Controller("not running".into()))?;
        controller
            .send_message(EventStoreMessage::Subscribe { subscriber })
            .map_err(|e| StoreError::Controller(e.to_string()))
    }

    pub fn unsubscribe(&self, name: &str) -> Result<(), StoreError> {
        let controller = self
            .controller()
            .ok_or_else(|| StoreError::Controller("not running".into()))?;
        controller
            .send_message(EventStoreMessage::Unsubscribe { name: name.into() })
            .map_err(|e| StoreError::Controller(e.to_string()))
    }

    /// Names of the subscribed handlers. Empty when not running.
    pub async fn subscribers(&self) -> Result<Vec<String>, StoreError> {
        let Some(controller) = self.controller() else {
            return Ok(Vec::new());
        };
        match ractor::rpc::call(
            &controller,
            |reply| EventStoreMessage::ListSubscribers { reply },
            None,
        )
        .await
        {
            Ok(ractor::rpc::CallResult::Success(names)) => Ok(names),
            Ok(_) => Err(StoreError::Controller("no subscriber list".into())),
            Err(e) => Err(StoreError::Controller(e.to_string())),
        }
    }

    /// Drain handlers, then close the store.
    ///
    /// Every handler processes the notifications sent before this call;
    /// continuations running meanwhile may still store events. Then later
    /// puts fail with [`StoreError::Closed`], buffered relaxed writes are
    /// stored and the controller stops.
    pub async fn graceful_shutdown(&self) -> Result<(), StoreError> {
        self.flush();

        let drained = match self.controller() {
            Some(controller) => Some(
                ractor::rpc::call(&controller, |reply| EventStoreMessage::Drain { reply }, None)
                    .await,
            ),
            None => None,
        };

        self.close();
        self.flush();
        if let Some(controller) = lock(&self.inner.append).controller.take() {
            controller.stop(None);
        }

        match drained {
            None => Ok(()),
            Some(Ok(ractor::rpc::CallResult::Success(synced))) => {
                tracing::info!("Event store drained ({} handlers)", synced);
                Ok(())
            }
            Some(Ok(_)) => Err(StoreError::Controller("drain did not complete".into())),
            Some(Err(e)) => Err(StoreError::Controller(e.to_string())),
        }
    }
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("events", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use std::time::Duration;

    #[test]
    fn locked_put_is_visible_immediately() {
        let store = EventStore::new();
        let id = store.put_event(Event::new("a"), true).unwrap();
        assert!(store.is_request_finished(id));
        assert!(store.event_happened(&"a".into()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn relaxed_put_is_visible_after_flush() {
        let store = EventStore::new();
        let ids = store
            .put_events(vec![Event::new("a"), Event::new("b")], false)
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert!(ids.iter().all(|id| !store.is_request_finished(*id)));
        assert!(!store.event_happened(&"a".into()));

        assert_eq!(store.flush(), 2);
        assert!(ids.iter().all(|id| store.is_request_finished(*id)));

        let happened = store.events_happened(&["a".into(), "b".into(), "c".into()]);
        assert!(happened[&EventReference::from("a")]);
        assert!(happened[&EventReference::from("b")]);
        assert!(!happened[&EventReference::from("c")]);
    }

    #[test]
    fn evaluate_uses_windows() {
        let store = EventStore::new();
        let now = Utc::now();
        store.put_event(Event::at("ping", now), true).unwrap();

        let expr = EventExpression::within("ping", Duration::from_secs(2));
        assert!(store.evaluate(&expr, now + chrono::Duration::seconds(2)));
        assert!(!store.evaluate(&expr, now + chrono::Duration::seconds(3)));
    }

    #[tokio::test]
    async fn closed_store_rejects_puts() -> Result<(), StoreError> {
        let store = EventStore::new();
        store.put_event(Event::new("before"), false)?;
        store.graceful_shutdown().await?;

        // Relaxed writes accepted before closing are still stored.
        assert!(store.event_happened(&"before".into()));
        assert_eq!(store.put_event(Event::new("after"), true), Err(StoreError::Closed));
        assert_eq!(store.put_event(Event::new("after"), false), Err(StoreError::Closed));
        Ok(())
    }

    #[test]
    fn batch_keeps_events_stored_before_closing() {
        let store = EventStore::new();
        let events = (0..3).map(|i| {
            if i == 2 {
                store.close();
            }
            Event::new(format!("e{i}"))
        });

        let results = store.put_events(events, true);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert_eq!(results[2], Err(StoreError::Closed));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn closed_store_leaves_nothing_pending() {
        let store = EventStore::new();
        store.close();
        assert_eq!(store.put_event(Event::new("late"), false), Err(StoreError::Closed));
        assert_eq!(store.flush(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn evaluation_after_a_position_ignores_later_events() {
        let store = EventStore::new();
        let t0 = Utc::now();
        let on = Event::at("sensor.on", t0);
        store.put_event(on.clone(), true).unwrap();
        store.put_event(Event::at("sensor.off", t0), true).unwrap();

        let expr = EventExpression::happened("sensor.on") & !EventExpression::happened("sensor.off");
        let after_on = AsOf::after(&on, 0);
        assert!(store.evaluate_cached(&expr, None, after_on));
        assert!(!store.evaluate_cached(&expr, None, AsOf::time(t0)));

        let references = expr.references();
        let cache = store.build_cache(references.iter(), after_on);
        assert_eq!(cache.len(), 1);
        assert!(store.evaluate_cached(&expr, Some(&cache), after_on));
    }
}
