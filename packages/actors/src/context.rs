//! Scheduler context: owns every runtime component of one node.

use std::sync::Arc;

use ractor::ActorRef;
use relay_core::{CentralApi, ExtraApi, JobDefinition, Pipeline, QueueDefinition, QueueHandle};
use storage::Storage;

use crate::apis::{EventApi, JobApi, ObjectStorageApi, QueueApi};
use crate::config::RuntimeConfig;
use crate::error::{ContextError, HandlerError};
use crate::event_store::{EventStore, Subscriber};
use crate::handler::{Handler, HandlerSnapshot};
use crate::handler_controller::{HandlerArgs, spawn_handler};
use crate::messages::HandlerMessage;
use crate::registry::QueueRegistry;
use crate::scheduler::{ERROR_ITEM_TYPE, NEW_JOB_ITEM_TYPE, Scheduler, SchedulerHandle};

/// Something to add to a context.
pub enum Registration {
    Queue(QueueDefinition),
    Job(JobDefinition),
    Pipeline(Pipeline),
    Handler(Handler),
    ExtraApi(Arc<dyn ExtraApi>),
}

impl From<QueueDefinition> for Registration {
    fn from(definition: QueueDefinition) -> Self {
        Registration::Queue(definition)
    }
}

impl From<JobDefinition> for Registration {
    fn from(definition: JobDefinition) -> Self {
        Registration::Job(definition)
    }
}

impl From<Pipeline> for Registration {
    fn from(pipeline: Pipeline) -> Self {
        Registration::Pipeline(pipeline)
    }
}

impl From<Handler> for Registration {
    fn from(handler: Handler) -> Self {
        Registration::Handler(handler)
    }
}

impl From<Arc<dyn ExtraApi>> for Registration {
    fn from(extra: Arc<dyn ExtraApi>) -> Self {
        Registration::ExtraApi(extra)
    }
}

/// Explicit lifecycle for queues, jobs, handlers and the Central API.
///
/// ```ignore
/// let mut ctx = SchedulerContext::init(RuntimeConfig::from_env()?, Storage::from_env()?);
/// ctx.register(QueueDefinition::new("numbers")).await?;
/// ctx.register(job).await?;
/// ctx.start().await?;
/// // ...
/// ctx.shutdown().await?;
/// ```
pub struct SchedulerContext {
    config: RuntimeConfig,
    registry: Arc<QueueRegistry>,
    store: EventStore,
    api: Arc<CentralApi>,
    storage: Storage,
    scheduler: Scheduler,
    queues: Vec<QueueDefinition>,
    jobs: Vec<JobDefinition>,
    handlers: Vec<Handler>,
    handler_actors: Vec<(String, ActorRef<HandlerMessage>)>,
    started: bool,
}

impl SchedulerContext {
    /// Create a context with the built-in extra APIs registered.
    pub fn init(config: RuntimeConfig, storage: Storage) -> Self {
        let registry = Arc::new(QueueRegistry::new());
        let store = EventStore::new();
        let api = Arc::new(CentralApi::new());
        let scheduler = Scheduler::new(registry.clone()).with_api(api.clone());

        api.register_extra_api(&QueueApi::new(registry.clone()));
        api.register_extra_api(&EventApi::new(store.clone()));
        api.register_extra_api(&JobApi::new(scheduler.handle(), config.idle_poll_interval));
        api.register_extra_api(&ObjectStorageApi::new(storage.clone()));

        Self {
            config,
            registry,
            store,
            api,
            storage,
            scheduler,
            queues: Vec::new(),
            jobs: Vec::new(),
            handlers: Vec::new(),
            handler_actors: Vec::new(),
            started: false,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn api(&self) -> &Arc<CentralApi> {
        &self.api
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn scheduler(&self) -> SchedulerHandle {
        self.scheduler.handle()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Get a live queue by name.
    pub fn queue(&self, name: &str) -> Option<QueueHandle> {
        self.registry.get_queue(name)
    }

    /// Add a component. Before `start` it is held until start; afterwards
    /// queues, jobs and handlers go live immediately.
    pub async fn register(&mut self, registration: impl Into<Registration>) -> Result<(), ContextError> {
        match registration.into() {
            Registration::Queue(definition) => {
                if self.started {
                    let name = definition.name.clone();
                    let (_, created) = self.registry.create_queue(definition);
                    if !created {
                        return Err(ContextError::QueueExists(name));
                    }
                } else if self.queues.iter().any(|q| q.name == definition.name) {
                    return Err(ContextError::QueueExists(definition.name));
                } else {
                    self.queues.push(definition);
                }
            }
            Registration::Job(definition) => {
                self.add_jobs(vec![definition]).await?;
            }
            Registration::Pipeline(pipeline) => {
                for (from, to) in pipeline.unwired_edges() {
                    tracing::warn!(
                        "Pipeline {}: no queue connects node {} to node {}",
                        pipeline.name,
                        from,
                        to
                    );
                }
                self.add_jobs(pipeline.into_jobs()).await?;
            }
            Registration::Handler(handler) => {
                if self.started {
                    self.registry.create_referenced(handler.queue_refs());
                    let subscriber = self.start_handler(handler).await?;
                    self.store.subscribe(subscriber)?;
                } else {
                    self.handlers.push(handler);
                }
            }
            Registration::ExtraApi(extra) => {
                let routes = self.api.register_extra_api(extra.as_ref());
                tracing::info!(
                    "Registered extra API {} ({} routes)",
                    extra.api_identifier(),
                    routes
                );
            }
        }
        Ok(())
    }

    async fn add_jobs(&mut self, jobs: Vec<JobDefinition>) -> Result<(), ContextError> {
        let handle = self.scheduler.handle();
        for job in &jobs {
            handle.add_template(job);
        }
        if !self.started {
            self.jobs.extend(jobs);
            return Ok(());
        }
        self.registry
            .create_referenced(jobs.iter().flat_map(|j| j.queue_refs()));
        for job in jobs {
            self.scheduler.add_job(job)?;
        }
        self.scheduler.spawn(&self.config).await?;
        Ok(())
    }

    /// Spawn the controller for `handler` and return its subscription.
    async fn start_handler(&mut self, handler: Handler) -> Result<Subscriber, ContextError> {
        let name = handler.name.clone();
        let references = handler.expression.references();
        let actor = spawn_handler(HandlerArgs {
            handler,
            store: self.store.clone(),
            registry: self.registry.clone(),
            api: Some(self.api.clone()),
        })
        .await?;
        self.handler_actors.push((name.clone(), actor.clone()));
        Ok(Subscriber::new(name, actor, references))
    }

    fn handler_actor(&self, name: &str) -> Result<&ActorRef<HandlerMessage>, ContextError> {
        self.handler_actors
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, actor)| actor)
            .ok_or_else(|| ContextError::UnknownHandler(name.to_string()))
    }

    /// Names of handlers the event store currently notifies.
    pub async fn handler_names(&self) -> Result<Vec<String>, ContextError> {
        Ok(self.store.subscribers().await?)
    }

    /// Current state of a running handler.
    pub async fn handler_snapshot(&self, name: &str) -> Result<HandlerSnapshot, ContextError> {
        let actor = self.handler_actor(name)?;
        match ractor::rpc::call(actor, |reply| HandlerMessage::GetState { reply }, None).await {
            Ok(ractor::rpc::CallResult::Success(snapshot)) => Ok(snapshot),
            Ok(_) => Err(HandlerError::Actor(format!("handler {name} did not reply")).into()),
            Err(e) => Err(HandlerError::Actor(e.to_string()).into()),
        }
    }

    /// Stop notifying a handler and stop its controller.
    pub fn remove_handler(&mut self, name: &str) -> Result<(), ContextError> {
        if !self.started {
            let before = self.handlers.len();
            self.handlers.retain(|h| h.name != name);
            if self.handlers.len() == before {
                return Err(ContextError::UnknownHandler(name.to_string()));
            }
            return Ok(());
        }
        self.handler_actor(name)?;
        self.store.unsubscribe(name)?;
        let mut removed = Vec::new();
        self.handler_actors.retain(|(n, actor)| {
            if n == name {
                removed.push(actor.clone());
                false
            } else {
                true
            }
        });
        for actor in removed {
            let _ = actor.send_message(HandlerMessage::Shutdown);
        }
        tracing::info!("Removed handler {}", name);
        Ok(())
    }

    /// Create queues, start the event store, handlers and jobs.
    pub async fn start(&mut self) -> Result<(), ContextError> {
        if self.started {
            return Err(ContextError::AlreadyStarted);
        }

        for definition in std::mem::take(&mut self.queues) {
            self.registry.create_queue(definition);
        }
        if self.config.error_queue {
            self.registry.create_queue(
                QueueDefinition::new(&self.config.error_queue_name)
                    .for_type(ERROR_ITEM_TYPE)
                    .with_description("Failures of every job"),
            );
        }
        if self.config.new_job_queue {
            self.registry.create_queue(
                QueueDefinition::new(&self.config.new_job_queue_name)
                    .for_type(NEW_JOB_ITEM_TYPE)
                    .with_description("Every job started by this node"),
            );
        }

        let jobs = std::mem::take(&mut self.jobs);
        let handlers = std::mem::take(&mut self.handlers);
        self.registry
            .create_referenced(jobs.iter().flat_map(|j| j.queue_refs()));
        self.registry
            .create_referenced(handlers.iter().flat_map(|h| h.queue_refs()));

        // Subscribe before replaying events stored ahead of start.
        let mut subscribers = Vec::with_capacity(handlers.len());
        for handler in handlers {
            subscribers.push(self.start_handler(handler).await?);
        }
        self.store.run(&self.config, subscribers).await?;

        for job in jobs {
            self.scheduler.add_job(job)?;
        }
        let spawned = self.scheduler.spawn(&self.config).await?;

        self.started = true;
        tracing::info!(
            "Scheduler context started: {} queues, {} jobs, {} handlers",
            self.registry.len(),
            spawned,
            self.handler_actors.len()
        );
        Ok(())
    }

    /// Stop jobs, drain the event store, then stop handlers.
    pub async fn shutdown(&mut self) -> Result<(), ContextError> {
        tracing::info!("Shutting down scheduler context");
        self.scheduler.shutdown();
        let drained = self.store.graceful_shutdown().await;
        for (name, actor) in self.handler_actors.drain(..) {
            if actor.send_message(HandlerMessage::Shutdown).is_err() {
                tracing::debug!("Handler controller {} already stopped", name);
            }
        }
        drained?;
        Ok(())
    }
}
