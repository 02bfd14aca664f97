//! Built-in extra APIs: queues, events, jobs and object storage.
//!
//! Each payload type doubles as a [`TypedCommand`] so callers can use
//! [`CentralApi::execute`](relay_core::CentralApi::execute).

use std::collections::BTreeMap;
use std::future::{Future, ready};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use relay_core::{
    ApiFuture, ApiHandler, Event, EventReference, ExtraApi, FnApi, JobDefinition, JobStatus,
    Queue, QueueDefinition, QueueReference, TypedCommand,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use storage::Storage;

use crate::error::SchedulerError;
use crate::event_store::{EventStore, RequestId};
use crate::registry::QueueRegistry;
use crate::scheduler::SchedulerHandle;

/// Wrap a typed async function as a route handler.
fn route<P, F, Fut>(f: F) -> Arc<dyn ApiHandler>
where
    P: DeserializeOwned + 'static,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    Arc::new(FnApi::new(move |payload: Value| -> ApiFuture {
        match serde_json::from_value::<P>(payload) {
            Ok(input) => Box::pin(f(input)),
            Err(e) => Box::pin(ready(Err(format!("invalid payload: {e}")))),
        }
    }))
}

fn to_value<T: Serialize>(value: T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

// --- queue ---------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateQueue {
    pub name: String,
    #[serde(default)]
    pub item_types: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub capacity: Option<usize>,
    #[serde(default)]
    pub fail_if_exists: bool,
}

impl TypedCommand for CreateQueue {
    const API_IDENTIFIER: &'static str = "queue";
    const API_PATH: &'static str = "create";
    /// True if the queue was created, false if it already existed.
    type Output = bool;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutItems {
    pub name: String,
    pub items: Vec<Value>,
}

impl TypedCommand for PutItems {
    const API_IDENTIFIER: &'static str = "queue";
    const API_PATH: &'static str = "put";
    /// Number of items accepted.
    type Output = usize;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSize {
    pub name: String,
}

impl TypedCommand for QueueSize {
    const API_IDENTIFIER: &'static str = "queue";
    const API_PATH: &'static str = "size";
    type Output = usize;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuesByType {
    pub item_type: String,
}

impl TypedCommand for QueuesByType {
    const API_IDENTIFIER: &'static str = "queue";
    const API_PATH: &'static str = "get_by_type";
    /// Queue names, in creation order.
    type Output = Vec<String>;
}

/// Queue management routes under `queue`.
pub struct QueueApi {
    registry: Arc<QueueRegistry>,
}

impl QueueApi {
    pub fn new(registry: Arc<QueueRegistry>) -> Self {
        Self { registry }
    }
}

impl ExtraApi for QueueApi {
    fn api_identifier(&self) -> &str {
        "queue"
    }

    fn routes(&self) -> Vec<(String, Arc<dyn ApiHandler>)> {
        let registry = self.registry.clone();
        let create = route(move |cmd: CreateQueue| {
            let exists = registry.contains(&cmd.name);
            let result = if exists && cmd.fail_if_exists {
                Err(format!("queue '{}' already exists", cmd.name))
            } else {
                let mut definition = QueueDefinition::new(cmd.name);
                definition.item_types = cmd.item_types;
                definition.description = cmd.description;
                definition.capacity = cmd.capacity;
                let (_, created) = registry.create_queue(definition);
                Ok(json!(created))
            };
            ready(result)
        });

        let registry = self.registry.clone();
        let put = route(move |cmd: PutItems| {
            let result = match registry.get_queue(&cmd.name) {
                Some(queue) => Ok(json!(queue.put_iter(cmd.items))),
                None => Err(format!("queue '{}' not found", cmd.name)),
            };
            ready(result)
        });

        let registry = self.registry.clone();
        let size = route(move |cmd: QueueSize| {
            let result = match registry.get_queue(&cmd.name) {
                Some(queue) => Ok(json!(queue.size())),
                None => Err(format!("queue '{}' not found", cmd.name)),
            };
            ready(result)
        });

        let registry = self.registry.clone();
        let by_type = route(move |cmd: QueuesByType| {
            ready(Ok(json!(registry.names_by_type(&cmd.item_type))))
        });

        vec![
            ("create".to_string(), create),
            ("put".to_string(), put),
            ("size".to_string(), size),
            ("get_by_type".to_string(), by_type),
        ]
    }
}

// --- event ---------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutEvent {
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "default_true")]
    pub acquire_lock: bool,
}

fn default_true() -> bool {
    true
}

impl TypedCommand for PutEvent {
    const API_IDENTIFIER: &'static str = "event";
    const API_PATH: &'static str = "put";
    type Output = RequestId;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHappened {
    #[serde(flatten)]
    pub reference: EventReference,
}

impl TypedCommand for EventHappened {
    const API_IDENTIFIER: &'static str = "event";
    const API_PATH: &'static str = "happened";
    type Output = bool;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFinished {
    pub request_id: RequestId,
}

impl TypedCommand for RequestFinished {
    const API_IDENTIFIER: &'static str = "event";
    const API_PATH: &'static str = "request_finished";
    type Output = bool;
}

/// Event routes under `event`.
pub struct EventApi {
    store: EventStore,
}

impl EventApi {
    pub fn new(store: EventStore) -> Self {
        Self { store }
    }
}

impl ExtraApi for EventApi {
    fn api_identifier(&self) -> &str {
        "event"
    }

    fn routes(&self) -> Vec<(String, Arc<dyn ApiHandler>)> {
        let store = self.store.clone();
        let put = route(move |cmd: PutEvent| {
            let mut event = Event::new(cmd.name).with_payload(cmd.payload);
            event.attributes = cmd.attributes;
            let result = store
                .put_event(event, cmd.acquire_lock)
                .map_err(|e| e.to_string())
                .and_then(to_value);
            ready(result)
        });

        let store = self.store.clone();
        let happened = route(move |cmd: EventHappened| {
            ready(Ok(json!(store.event_happened(&cmd.reference))))
        });

        let store = self.store.clone();
        let finished = route(move |cmd: RequestFinished| {
            ready(Ok(json!(store.is_request_finished(cmd.request_id))))
        });

        vec![
            ("put".to_string(), put),
            ("happened".to_string(), happened),
            ("request_finished".to_string(), finished),
        ]
    }
}

// --- job -----------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusQuery {
    pub name: String,
}

impl TypedCommand for JobStatusQuery {
    const API_IDENTIFIER: &'static str = "job";
    const API_PATH: &'static str = "status";
    type Output = JobStatus;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseJob {
    pub name: String,
}

impl TypedCommand for PauseJob {
    const API_IDENTIFIER: &'static str = "job";
    const API_PATH: &'static str = "pause";
    type Output = bool;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeJob {
    pub name: String,
}

impl TypedCommand for ResumeJob {
    const API_IDENTIFIER: &'static str = "job";
    const API_PATH: &'static str = "resume";
    type Output = bool;
}

/// Start a copy of a registered job under a new name.
///
/// Args are appended to the template's, kwargs override them, and the
/// queue lists replace the template's when given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJob {
    pub template: String,
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub inputs: Option<Vec<String>>,
    #[serde(default)]
    pub outputs: Option<Vec<String>>,
}

impl CreateJob {
    /// Build the new job's definition from `template`.
    pub fn apply(self, template: JobDefinition) -> JobDefinition {
        let mut definition = template;
        definition.name = self.name;
        definition.args.extend(self.args);
        definition.kwargs.extend(self.kwargs);
        if let Some(inputs) = self.inputs {
            definition.input_queue_refs = inputs.into_iter().map(QueueReference::named).collect();
        }
        if let Some(outputs) = self.outputs {
            definition.output_queue_refs = outputs.into_iter().map(QueueReference::named).collect();
        }
        definition
    }
}

impl TypedCommand for CreateJob {
    const API_IDENTIFIER: &'static str = "job";
    const API_PATH: &'static str = "create";
    type Output = String;
}

/// Job control routes under `job`. Only spawned jobs are reachable.
pub struct JobApi {
    scheduler: SchedulerHandle,
    idle_poll_interval: Duration,
}

impl JobApi {
    pub fn new(scheduler: SchedulerHandle, idle_poll_interval: Duration) -> Self {
        Self {
            scheduler,
            idle_poll_interval,
        }
    }
}

impl ExtraApi for JobApi {
    fn api_identifier(&self) -> &str {
        "job"
    }

    fn routes(&self) -> Vec<(String, Arc<dyn ApiHandler>)> {
        let scheduler = self.scheduler.clone();
        let status = route(move |cmd: JobStatusQuery| {
            let scheduler = scheduler.clone();
            async move {
                let status = scheduler.status(&cmd.name).await.map_err(|e| e.to_string())?;
                to_value(status)
            }
        });

        let scheduler = self.scheduler.clone();
        let pause = route(move |cmd: PauseJob| {
            let scheduler = scheduler.clone();
            async move {
                let paused = scheduler.pause(&cmd.name).await.map_err(|e| e.to_string())?;
                Ok(json!(paused))
            }
        });

        let scheduler = self.scheduler.clone();
        let resume = route(move |cmd: ResumeJob| {
            let scheduler = scheduler.clone();
            async move {
                let resumed = scheduler.resume(&cmd.name).await.map_err(|e| e.to_string())?;
                Ok(json!(resumed))
            }
        });

        let scheduler = self.scheduler.clone();
        let idle_poll_interval = self.idle_poll_interval;
        let create = route(move |cmd: CreateJob| {
            let scheduler = scheduler.clone();
            async move {
                let template = scheduler
                    .template(&cmd.template)
                    .ok_or_else(|| SchedulerError::UnknownTemplate(cmd.template.clone()))
                    .map_err(|e| e.to_string())?;
                let definition = cmd.apply(template);
                let name = definition.name.clone();
                scheduler
                    .start_job(definition, idle_poll_interval)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!(name))
            }
        });

        vec![
            ("status".to_string(), status),
            ("pause".to_string(), pause),
            ("resume".to_string(), resume),
            ("create".to_string(), create),
        ]
    }
}

// --- object storage ------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetObject {
    pub ids: Vec<String>,
    /// Decode the object as JSON instead of returning it as a string.
    #[serde(default)]
    pub json: bool,
}

impl TypedCommand for GetObject {
    const API_IDENTIFIER: &'static str = "object_storage";
    const API_PATH: &'static str = "get";
    /// `null` when no object is stored under the identifiers.
    type Output = Value;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutObject {
    pub ids: Vec<String>,
    /// Strings are stored as raw UTF-8, anything else as JSON.
    pub value: Value,
}

impl TypedCommand for PutObject {
    const API_IDENTIFIER: &'static str = "object_storage";
    const API_PATH: &'static str = "put";
    type Output = ();
}

/// Object storage routes under `object_storage`.
pub struct ObjectStorageApi {
    storage: Storage,
}

impl ObjectStorageApi {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

impl ExtraApi for ObjectStorageApi {
    fn api_identifier(&self) -> &str {
        "object_storage"
    }

    fn routes(&self) -> Vec<(String, Arc<dyn ApiHandler>)> {
        let storage = self.storage.clone();
        let get = route(move |cmd: GetObject| {
            let storage = storage.clone();
            async move {
                let ids: Vec<&str> = cmd.ids.iter().map(String::as_str).collect();
                let bytes = storage
                    .get_object_reference(&ids)
                    .await
                    .map_err(|e| e.to_string())?;
                match bytes {
                    None => Ok(Value::Null),
                    Some(bytes) if cmd.json => {
                        serde_json::from_slice(&bytes).map_err(|e| e.to_string())
                    }
                    Some(bytes) => String::from_utf8(bytes.to_vec())
                        .map(Value::String)
                        .map_err(|e| e.to_string()),
                }
            }
        });

        let storage = self.storage.clone();
        let put = route(move |cmd: PutObject| {
            let storage = storage.clone();
            async move {
                let bytes = match cmd.value {
                    Value::String(s) => Bytes::from(s),
                    other => Bytes::from(serde_json::to_vec(&other).map_err(|e| e.to_string())?),
                };
                let ids: Vec<&str> = cmd.ids.iter().map(String::as_str).collect();
                storage
                    .put_remote_object_reference(&ids, bytes)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(Value::Null)
            }
        });

        vec![("get".to_string(), get), ("put".to_string(), put)]
    }
}
