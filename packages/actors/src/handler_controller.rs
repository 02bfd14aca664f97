//! Handler controller actor: serializes executions of one handler.

use std::sync::Arc;

use ractor::{Actor, ActorProcessingErr, ActorRef};
use relay_core::CentralApi;

use crate::error::HandlerError;
use crate::event_store::EventStore;
use crate::handler::{Handler, HandlerOutcome};
use crate::messages::HandlerMessage;
use crate::registry::QueueRegistry;

/// State for the handler controller.
pub struct HandlerControllerState {
    handler: Handler,
    store: EventStore,
    api: Option<Arc<CentralApi>>,
}

/// Handler controller arguments.
pub struct HandlerArgs {
    pub handler: Handler,
    pub store: EventStore,
    pub registry: Arc<QueueRegistry>,
    pub api: Option<Arc<CentralApi>>,
}

/// One actor per handler. The mailbox is the single-flight guard: a new
/// `Execute` is not looked at until the previous continuation finished.
pub struct HandlerController;

impl Actor for HandlerController {
    type Msg = HandlerMessage;
    type State = HandlerControllerState;
    type Arguments = HandlerArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let mut handler = args.handler;
        tracing::info!("Starting handler controller: {}", handler.name);
        handler.evaluate_queues(args.registry.as_ref())?;

        Ok(HandlerControllerState {
            handler,
            store: args.store,
            api: args.api,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            HandlerMessage::Execute {
                event,
                cache,
                as_of,
            } => {
                let result = state
                    .handler
                    .execute(
                        Some(*event),
                        &state.store,
                        Some(cache.as_ref()),
                        as_of,
                        state.api.clone(),
                    )
                    .await;
                match result {
                    Ok(HandlerOutcome::Unchanged) => {}
                    Ok(outcome) => {
                        tracing::debug!("Handler {} completed {:?}", state.handler.name, outcome);
                    }
                    // Already logged by the handler; keep serving events.
                    Err(HandlerError::Continuation { .. }) => {}
                    Err(e) => {
                        tracing::warn!("Handler {} failed: {}", state.handler.name, e);
                    }
                }
            }

            HandlerMessage::Sync { reply } => {
                let _ = reply.send(());
            }

            HandlerMessage::GetState { reply } => {
                let _ = reply.send(state.handler.snapshot());
            }

            HandlerMessage::Shutdown => {
                tracing::info!("Shutting down handler controller: {}", state.handler.name);
                myself.stop(None);
            }
        }

        Ok(())
    }
}

/// Spawn a controller for `args.handler`.
pub async fn spawn_handler(args: HandlerArgs) -> Result<ActorRef<HandlerMessage>, HandlerError> {
    let (actor, _handle) = Actor::spawn(None, HandlerController, args)
        .await
        .map_err(|e| HandlerError::Spawn(e.to_string()))?;
    Ok(actor)
}
