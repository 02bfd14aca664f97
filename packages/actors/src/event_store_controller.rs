//! Event store controller: fans stored events out to handler controllers.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use ractor::{Actor, ActorProcessingErr, ActorRef};

use crate::event_store::{AsOf, EventStore, Subscriber};
use crate::messages::{EventStoreMessage, HandlerMessage};

/// State for the controller actor.
pub struct ControllerState {
    store: EventStore,
    subscriptions: Vec<Subscriber>,
    drain_timeout: Duration,
    /// Notifications fanned out so far.
    rounds: u64,
}

/// Controller actor arguments.
pub struct ControllerArgs {
    pub store: EventStore,
    pub flush_interval: Duration,
    pub drain_timeout: Duration,
}

/// Controller actor owning the notification loop of one event store.
pub struct EventStoreController;

impl Actor for EventStoreController {
    type Msg = EventStoreMessage;
    type State = ControllerState;
    type Arguments = ControllerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting event store controller");

        // Periodically store relaxed appends
        let myself_clone = myself.clone();
        let interval = args.flush_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if myself_clone.send_message(EventStoreMessage::Flush).is_err() {
                    break;
                }
            }
        });

        Ok(ControllerState {
            store: args.store,
            subscriptions: Vec::new(),
            drain_timeout: args.drain_timeout,
            rounds: 0,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            EventStoreMessage::Notify { event, position } => {
                let relevant: Vec<&Subscriber> = state
                    .subscriptions
                    .iter()
                    .filter(|s| s.is_relevant(&event))
                    .collect();
                if relevant.is_empty() {
                    return Ok(());
                }

                // Later appends are already in the log; evaluate as of this one.
                let as_of = AsOf::after(&event, position);
                let cache = Arc::new(
                    state
                        .store
                        .build_cache(relevant.iter().flat_map(|s| s.references.iter()), as_of),
                );

                let mut dead = Vec::new();
                for subscription in relevant {
                    let sent = subscription.handler.send_message(HandlerMessage::Execute {
                        event: event.clone(),
                        cache: cache.clone(),
                        as_of,
                    });
                    if sent.is_err() {
                        tracing::warn!(
                            "Handler {} is gone; dropping its subscription",
                            subscription.name
                        );
                        dead.push(subscription.name.clone());
                    }
                }
                state.subscriptions.retain(|s| !dead.contains(&s.name));
                state.rounds += 1;
                tracing::debug!("Dispatched event {} (round {})", event.name, state.rounds);
            }

            EventStoreMessage::Flush => {
                state.store.flush();
            }

            EventStoreMessage::Subscribe { subscriber } => {
                tracing::debug!(
                    "Handler {} subscribed to {} references",
                    subscriber.name,
                    subscriber.references.len()
                );
                state.subscriptions.retain(|s| s.name != subscriber.name);
                state.subscriptions.push(subscriber);
            }

            EventStoreMessage::Unsubscribe { name } => {
                state.subscriptions.retain(|s| s.name != name);
                tracing::debug!("Handler {} unsubscribed", name);
            }

            EventStoreMessage::ListSubscribers { reply } => {
                let _ = reply.send(state.subscriptions.iter().map(|s| s.name.clone()).collect());
            }

            EventStoreMessage::Drain { reply } => {
                let timeout = state.drain_timeout;
                let calls = state.subscriptions.iter().map(|s| async move {
                    let result = ractor::rpc::call(
                        &s.handler,
                        |reply| HandlerMessage::Sync { reply },
                        Some(timeout),
                    )
                    .await;
                    match result {
                        Ok(ractor::rpc::CallResult::Success(())) => true,
                        _ => {
                            tracing::warn!("Handler {} did not drain in time", s.name);
                            false
                        }
                    }
                });
                let synced = join_all(calls).await.into_iter().filter(|ok| *ok).count();
                let _ = reply.send(synced);
            }
        }

        Ok(())
    }
}
