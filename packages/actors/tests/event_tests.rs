#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::time::Duration;

use actors::apis::PutEvent;
use actors::{
    ContextError, EventStore, Handler, HandlerContext, HandlerState, RuntimeConfig, StoreError,
};
use relay_core::{Command, Event, EventExpression, EventReference, Queue};
use serde_json::json;

fn recorder(name: &str, expression: EventExpression) -> Handler {
    Handler::new(name, expression, |ctx: HandlerContext| async move {
        ctx.put("fired", json!(true))
    })
    .with_when_false(|ctx: HandlerContext| async move { ctx.put("fired", json!(false)) })
    .with_queue("fired")
}

#[tokio::test]
async fn test_a_and_b_fires_once() -> Result<(), Box<dyn Error>> {
    let mut ctx = common::test_context();
    ctx.register(recorder(
        "both",
        EventExpression::happened("a") & EventExpression::happened("b"),
    ))
    .await?;
    ctx.start().await?;

    let store = ctx.store().clone();
    store.put_event(Event::new("a"), true)?;
    store.put_event(Event::new("b"), true)?;
    store.put_event(Event::new("a"), true)?;
    store.put_event(Event::new("b"), true)?;
    ctx.shutdown().await?;

    let fired = ctx.queue("fired").ok_or("fired queue")?;
    assert_eq!(fired.get_iter(10), vec![json!(true)]);
    Ok(())
}

#[tokio::test]
async fn test_when_false_fires_on_true_to_false() -> Result<(), Box<dyn Error>> {
    let mut ctx = common::test_context();
    ctx.register(recorder(
        "sensor",
        EventExpression::happened("sensor.on") & !EventExpression::happened("sensor.off"),
    ))
    .await?;
    ctx.start().await?;

    ctx.store().put_event(Event::new("sensor.on"), true)?;
    ctx.store().put_event(Event::new("sensor.off"), true)?;
    ctx.store().put_event(Event::new("sensor.on"), true)?;
    ctx.shutdown().await?;

    let fired = ctx.queue("fired").ok_or("fired queue")?;
    assert_eq!(fired.get_iter(10), vec![json!(true), json!(false)]);
    Ok(())
}

#[tokio::test]
async fn test_events_stored_before_start_reach_handlers() -> Result<(), Box<dyn Error>> {
    let mut ctx = common::test_context();
    ctx.register(recorder("early", EventExpression::happened("a")))
        .await?;
    ctx.store().put_event(Event::new("a"), true)?;
    ctx.start().await?;
    ctx.shutdown().await?;

    let fired = ctx.queue("fired").ok_or("fired queue")?;
    assert_eq!(fired.get_iter(10), vec![json!(true)]);
    Ok(())
}

#[tokio::test]
async fn test_handlers_can_be_inspected_and_removed() -> Result<(), Box<dyn Error>> {
    let mut ctx = common::test_context();
    ctx.register(recorder("door", EventExpression::happened("door.open")))
        .await?;
    ctx.start().await?;

    ctx.store().put_event(Event::new("door.open"), true)?;
    let fired = ctx.queue("fired").ok_or("fired queue")?;
    assert!(common::wait_until(Duration::from_secs(2), || fired.size() == 1).await);

    let snapshot = ctx.handler_snapshot("door").await?;
    assert_eq!(snapshot.state, HandlerState::TrueFired);
    assert_eq!(snapshot.last_truth, Some(true));
    assert_eq!(snapshot.fired_true, 1);
    assert_eq!(ctx.handler_names().await?, vec!["door".to_string()]);

    ctx.remove_handler("door")?;
    assert!(ctx.handler_names().await?.is_empty());
    assert!(matches!(
        ctx.remove_handler("door"),
        Err(ContextError::UnknownHandler(name)) if name == "door"
    ));
    assert!(matches!(
        ctx.handler_snapshot("door").await,
        Err(ContextError::UnknownHandler(_))
    ));
    ctx.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_continuations_can_store_events_during_shutdown() -> Result<(), Box<dyn Error>> {
    let mut ctx = common::test_context();
    let handler = Handler::new(
        "echo",
        EventExpression::happened("ping"),
        |ctx: HandlerContext| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ctx.put_event(Event::new("pong")).map_err(|e| e.to_string())?;
            Ok(())
        },
    );
    ctx.register(handler).await?;
    ctx.start().await?;

    ctx.store().put_event(Event::new("ping"), true)?;
    ctx.shutdown().await?;

    assert!(ctx.store().event_happened(&"pong".into()));
    assert_eq!(
        ctx.store().put_event(Event::new("late"), true),
        Err(StoreError::Closed)
    );
    Ok(())
}

#[tokio::test]
async fn test_attribute_filtered_handler() -> Result<(), Box<dyn Error>> {
    let mut ctx = common::test_context();
    ctx.register(recorder(
        "kitchen",
        EventExpression::happened(EventReference::new("door").with_attribute("room", "kitchen")),
    ))
    .await?;
    ctx.start().await?;

    ctx.store()
        .put_event(Event::new("door").with_attribute("room", "hall"), true)?;
    let fired = ctx.queue("fired").ok_or("fired queue")?;
    ctx.store()
        .put_event(Event::new("door").with_attribute("room", "kitchen"), true)?;
    ctx.shutdown().await?;

    assert_eq!(fired.size(), 1);
    Ok(())
}

#[tokio::test]
async fn test_put_after_shutdown_is_rejected() -> Result<(), Box<dyn Error>> {
    let mut ctx = common::test_context();
    ctx.start().await?;
    ctx.store().put_event(Event::new("early"), true)?;
    ctx.shutdown().await?;

    assert_eq!(
        ctx.store().put_event(Event::new("late"), true),
        Err(StoreError::Closed)
    );
    assert!(ctx.store().event_happened(&"early".into()));
    assert!(!ctx.store().event_happened(&"late".into()));
    Ok(())
}

#[tokio::test]
async fn test_relaxed_appends_become_visible() -> Result<(), Box<dyn Error>> {
    let store = EventStore::new();
    let config = RuntimeConfig::default().with_idle_poll_interval(Duration::from_millis(5));
    store.run(&config, Vec::new()).await?;

    let id = store.put_event(Event::new("relaxed"), false)?;
    let visible = common::wait_until(Duration::from_secs(2), || store.is_request_finished(id)).await;
    assert!(visible);
    assert!(store.event_happened(&"relaxed".into()));

    store.graceful_shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_continuation_dispatches_commands() -> Result<(), Box<dyn Error>> {
    let mut ctx = common::test_context();
    let handler = Handler::new(
        "forwarder",
        EventExpression::happened("order.placed"),
        |ctx: HandlerContext| async move {
            let order = ctx
                .last_event
                .as_ref()
                .map(|e| e.payload.clone())
                .unwrap_or_default();
            let command = Command::new(
                "event",
                "put",
                json!({ "name": "order.accepted", "payload": order }),
            );
            ctx.dispatch(command).await.map_err(|e| e.to_string())?;
            Ok(())
        },
    );
    ctx.register(handler).await?;
    ctx.start().await?;

    ctx.api()
        .execute(&PutEvent {
            name: "order.placed".into(),
            attributes: Default::default(),
            payload: json!({ "id": 7 }),
            acquire_lock: true,
        })
        .await?;

    let store = ctx.store().clone();
    let accepted = common::wait_until(Duration::from_secs(2), || {
        store.event_happened(&"order.accepted".into())
    })
    .await;
    assert!(accepted);

    let events = store.events();
    let accepted = events
        .iter()
        .find(|e| e.name == "order.accepted")
        .ok_or("accepted event")?;
    assert_eq!(accepted.payload, json!({ "id": 7 }));

    ctx.shutdown().await?;
    Ok(())
}
