//! Sample workload: numbers are squared, each square is recorded as an
//! event, and a handler reacts to the first large one.

use std::time::Duration;

use actors::{ContextError, Handler, HandlerContext, SchedulerContext};
use relay_core::{
    Command, EventExpression, EventReference, JobCall, JobDefinition, JobOutput, Pipeline, Queue,
    QueueDefinition, QueueError,
};
use serde_json::json;

const LARGE: i64 = 50;

fn square() -> JobDefinition {
    JobDefinition::new("square", |call: JobCall| async move {
        let n = call.input(0).as_i64().ok_or("expected an integer")?;
        let squared = n * n;

        if let Some(api) = &call.api {
            let size = if squared >= LARGE { "large" } else { "small" };
            let command = Command::new(
                "event",
                "put",
                json!({
                    "name": "square.computed",
                    "attributes": { "size": size },
                    "payload": { "input": n, "square": squared },
                }),
            );
            api.dispatch(command).await.map_err(|e| e.to_string())?;
        }
        Ok(JobOutput::Value(json!(squared)))
    })
    .with_description("Square each number and record it as an event")
    .with_input("numbers")
    .with_output("squares")
}

fn sink() -> JobDefinition {
    JobDefinition::new("sink", |call: JobCall| async move {
        tracing::info!("Square ready: {}", call.input(0));
        Ok(JobOutput::Nothing)
    })
    .with_input("squares")
    .with_wait_time(Duration::from_millis(100))
}

fn large_square_alert() -> Handler {
    let reference = EventReference::new("square.computed").with_attribute("size", "large");
    Handler::new(
        "large_square_alert",
        EventExpression::happened(reference),
        |ctx: HandlerContext| async move {
            let payload = ctx
                .last_event
                .as_ref()
                .map(|e| e.payload.clone())
                .unwrap_or_default();
            tracing::info!("First large square seen: {}", payload);
            ctx.put("alerts", payload)
        },
    )
    .with_queue("alerts")
}

/// Register the demo queues, pipeline and handler.
pub async fn register(ctx: &mut SchedulerContext) -> Result<(), ContextError> {
    ctx.register(QueueDefinition::new("numbers").with_description("Integers to square"))
        .await?;
    ctx.register(Pipeline::chain("squares", [square(), sink()]))
        .await?;
    ctx.register(large_square_alert()).await?;
    Ok(())
}

/// Feed the first numbers in once the context runs.
pub fn seed(ctx: &SchedulerContext) -> Result<(), QueueError> {
    let numbers = ctx
        .queue("numbers")
        .ok_or_else(|| QueueError::NotResolved("numbers".into()))?;
    let accepted = numbers.put_iter((1..=10).map(|n| json!(n)).collect());
    tracing::info!("Seeded {} numbers", accepted);
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use actors::RuntimeConfig;
    use storage::Storage;

    #[tokio::test]
    async fn demo_squares_and_alerts_once() -> Result<(), Box<dyn std::error::Error>> {
        let config = RuntimeConfig::default().with_idle_poll_interval(Duration::from_millis(5));
        let mut ctx = SchedulerContext::init(config, Storage::memory());
        register(&mut ctx).await?;
        ctx.start().await?;
        seed(&ctx)?;

        let store = ctx.store().clone();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.len() < 10 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        ctx.shutdown().await?;

        assert_eq!(store.len(), 10);
        let alerts = ctx.queue("alerts").ok_or("alerts queue")?;
        assert_eq!(alerts.get_iter(10), vec![json!({ "input": 8, "square": 64 })]);
        Ok(())
    }
}
