//! The Central API: routes commands to registered handlers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use crate::command::{Command, TypedCommand};
use crate::error::DispatchError;

/// Result type for API handlers.
pub type ApiResult = Result<Value, String>;

/// Future type for async API handlers.
pub type ApiFuture = Pin<Box<dyn Future<Output = ApiResult> + Send>>;

/// Handles the payload of one `(api_identifier, api_path)` route.
pub trait ApiHandler: Send + Sync + 'static {
    fn handle(&self, payload: Value) -> ApiFuture;
}

/// A simple function-based API handler.
pub struct FnApi<F>
where
    F: Fn(Value) -> ApiFuture + Send + Sync + 'static,
{
    handler: F,
}

impl<F> FnApi<F>
where
    F: Fn(Value) -> ApiFuture + Send + Sync + 'static,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F> ApiHandler for FnApi<F>
where
    F: Fn(Value) -> ApiFuture + Send + Sync + 'static,
{
    fn handle(&self, payload: Value) -> ApiFuture {
        (self.handler)(payload)
    }
}

/// A bundle of routes sharing one `api_identifier`.
pub trait ExtraApi: Send + Sync {
    fn api_identifier(&self) -> &str;

    /// `(api_path, handler)` pairs to register.
    fn routes(&self) -> Vec<(String, Arc<dyn ApiHandler>)>;
}

type RouteKey = (String, String);

/// Command registry and dispatcher.
#[derive(Default)]
pub struct CentralApi {
    routes: RwLock<HashMap<RouteKey, Arc<dyn ApiHandler>>>,
}

impl CentralApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a route. Returns true if it replaced one.
    pub fn register<H: ApiHandler>(
        &self,
        api_identifier: impl Into<String>,
        api_path: impl Into<String>,
        handler: H,
    ) -> bool {
        self.insert((api_identifier.into(), api_path.into()), Arc::new(handler))
    }

    /// Register an async closure as a route handler.
    pub fn register_fn<F, Fut>(
        &self,
        api_identifier: impl Into<String>,
        api_path: impl Into<String>,
        handler: F,
    ) -> bool
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ApiResult> + Send + 'static,
    {
        self.register(
            api_identifier,
            api_path,
            FnApi::new(move |payload| Box::pin(handler(payload)) as ApiFuture),
        )
    }

    /// Register every route of an extra API under its identifier.
    pub fn register_extra_api(&self, api: &dyn ExtraApi) -> usize {
        let identifier = api.api_identifier().to_string();
        let routes = api.routes();
        let count = routes.len();
        for (path, handler) in routes {
            self.insert((identifier.clone(), path), handler);
        }
        count
    }

    fn insert(&self, key: RouteKey, handler: Arc<dyn ApiHandler>) -> bool {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, handler)
            .is_some()
    }

    fn route(&self, api_identifier: &str, api_path: &str) -> Option<Arc<dyn ApiHandler>> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(api_identifier.to_string(), api_path.to_string()))
            .cloned()
    }

    pub fn has_route(&self, api_identifier: &str, api_path: &str) -> bool {
        self.route(api_identifier, api_path).is_some()
    }

    /// All registered routes, sorted.
    pub fn routes(&self) -> Vec<RouteKey> {
        let mut keys: Vec<RouteKey> = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Route `command` to its handler and return the handler's result.
    pub async fn dispatch(&self, command: Command) -> Result<Value, DispatchError> {
        let Command {
            api_identifier,
            api_path,
            payload,
        } = command;
        let Some(handler) = self.route(&api_identifier, &api_path) else {
            return Err(DispatchError::UnknownCommand {
                api_identifier,
                api_path,
            });
        };
        handler
            .handle(payload)
            .await
            .map_err(|message| DispatchError::Handler {
                api_identifier,
                api_path,
                message,
            })
    }

    /// Dispatch a typed command and decode its result.
    pub async fn execute<C: TypedCommand>(&self, command: &C) -> Result<C::Output, DispatchError> {
        let value = self.dispatch(Command::from_typed(command)?).await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl std::fmt::Debug for CentralApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CentralApi")
            .field("routes", &self.routes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use serde::Serialize;
    use serde_json::json;

    struct Echo;

    impl ExtraApi for Echo {
        fn api_identifier(&self) -> &str {
            "echo"
        }

        fn routes(&self) -> Vec<(String, Arc<dyn ApiHandler>)> {
            let same: Arc<dyn ApiHandler> =
                Arc::new(FnApi::new(|payload| Box::pin(async move { Ok(payload) })));
            let fail: Arc<dyn ApiHandler> =
                Arc::new(FnApi::new(|_| Box::pin(async { Err("nope".to_string()) })));
            vec![("same".to_string(), same), ("fail".to_string(), fail)]
        }
    }

    #[derive(Serialize)]
    struct Double(i64);

    impl TypedCommand for Double {
        const API_IDENTIFIER: &'static str = "math";
        const API_PATH: &'static str = "double";
        type Output = i64;
    }

    #[tokio::test]
    async fn unknown_command_is_reported() {
        let api = CentralApi::new();
        let err = api.dispatch(Command::new("nope", "missing", Value::Null)).await;
        assert!(matches!(
            err,
            Err(DispatchError::UnknownCommand { api_identifier, api_path })
                if api_identifier == "nope" && api_path == "missing"
        ));
    }

    #[tokio::test]
    async fn payload_passes_through_unchanged() -> Result<(), DispatchError> {
        let api = CentralApi::new();
        assert_eq!(api.register_extra_api(&Echo), 2);

        let payload = json!({ "nested": [1, { "x": null }] });
        let result = api.dispatch(Command::new("echo", "same", payload.clone())).await?;
        assert_eq!(result, payload);

        let err = api.dispatch(Command::new("echo", "fail", Value::Null)).await;
        assert!(matches!(err, Err(DispatchError::Handler { message, .. }) if message == "nope"));
        Ok(())
    }

    #[tokio::test]
    async fn typed_execute_decodes_output() -> Result<(), DispatchError> {
        let api = CentralApi::new();
        api.register_fn("math", "double", |payload: Value| async move {
            let n = payload.as_i64().ok_or("expected integer")?;
            Ok(json!(n * 2))
        });
        assert_eq!(api.execute(&Double(21)).await?, 42);
        assert_eq!(api.routes(), vec![("math".to_string(), "double".to_string())]);
        Ok(())
    }
}
