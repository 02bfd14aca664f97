use std::time::Duration;

use actors::{RuntimeConfig, SchedulerContext};
use storage::Storage;

/// Fast polling so tests don't wait on the defaults.
pub fn test_config() -> RuntimeConfig {
    RuntimeConfig::default()
        .with_idle_poll_interval(Duration::from_millis(5))
        .with_drain_timeout(Duration::from_secs(2))
}

pub fn test_context() -> SchedulerContext {
    SchedulerContext::init(test_config(), Storage::memory())
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
