//! Scheduler: resolves job definitions and runs them tick by tick.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::Utc;
use ractor::{ActorRef, RpcReplyPort};
use relay_core::{
    CentralApi, JobCall, JobDefinition, JobStatus, Pipeline, QueueError, QueueHandle,
    QueueReference, QueueResolver, distribute,
};
use serde_json::{Value, json};

use crate::config::RuntimeConfig;
use crate::error::SchedulerError;
use crate::job_actor::spawn_job;
use crate::messages::JobMessage;
use crate::registry::QueueRegistry;

/// Item type of the queues that receive job failure records.
pub const ERROR_ITEM_TYPE: &str = "error";

/// Item type of the queues told about every job started at runtime.
pub const NEW_JOB_ITEM_TYPE: &str = "new_job";

/// What a single tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The job ran and its output was distributed.
    Ran { produced: usize },
    /// The job ran and failed.
    Failed { error: String },
    /// An input queue was empty; nothing ran.
    NoInput,
    /// Paused or finished.
    Skipped,
}

/// A job definition with its queues resolved.
pub struct ScheduledJob {
    definition: JobDefinition,
    inputs: Vec<QueueHandle>,
    extras: HashMap<String, QueueHandle>,
    outputs: Vec<QueueHandle>,
    error_queues: Vec<QueueHandle>,
    status: JobStatus,
    /// Status to restore on resume.
    paused_from: Option<JobStatus>,
    runs: u64,
    failures: u32,
}

impl ScheduledJob {
    /// Resolve every queue the definition references.
    pub fn resolve(definition: JobDefinition, registry: &QueueRegistry) -> Result<Self, SchedulerError> {
        let lookup = |reference: &QueueReference| {
            registry.resolve(reference).ok_or_else(|| SchedulerError::Queue {
                job: definition.name.clone(),
                source: QueueError::NotResolved(reference.identifier.clone()),
            })
        };

        let inputs = definition
            .input_queue_refs
            .iter()
            .map(lookup)
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = definition
            .output_queue_refs
            .iter()
            .map(lookup)
            .collect::<Result<Vec<_>, _>>()?;
        let extras = definition
            .extra_queue_refs
            .iter()
            .map(|r| Ok((r.identifier.clone(), lookup(r)?)))
            .collect::<Result<HashMap<_, _>, SchedulerError>>()?;
        let error_queues = registry.queues_by_type(ERROR_ITEM_TYPE);

        Ok(Self {
            definition,
            inputs,
            extras,
            outputs,
            error_queues,
            status: JobStatus::Pending,
            paused_from: None,
            runs: 0,
            failures: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    pub fn status(&self) -> &JobStatus {
        &self.status
    }

    pub fn is_finished(&self) -> bool {
        self.definition.single_run && self.status.is_terminal()
    }

    /// Pause the job. Returns false if it already finished.
    pub fn pause(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if self.paused_from.is_none() {
            self.paused_from = Some(std::mem::replace(&mut self.status, JobStatus::Paused));
        }
        true
    }

    /// Resume a paused job. Returns false if it was not paused.
    pub fn resume(&mut self) -> bool {
        match self.paused_from.take() {
            Some(previous) => {
                self.status = previous;
                true
            }
            None => false,
        }
    }

    /// Take one item from every input queue, or nothing at all.
    fn take_inputs(&self) -> Option<Vec<Value>> {
        if self.inputs.iter().any(|q| q.is_empty()) {
            return None;
        }
        let mut taken = Vec::with_capacity(self.inputs.len());
        for queue in &self.inputs {
            match queue.get() {
                Ok(item) => taken.push(item),
                Err(_) => {
                    // Another consumer emptied a queue after the size check.
                    self.put_back(taken);
                    return None;
                }
            }
        }
        Some(taken)
    }

    /// Return items taken by an aborted tick to their input queues.
    ///
    /// An item that cannot go back is reported to the error queues.
    fn put_back(&self, taken: Vec<Value>) {
        for (queue, item) in self.inputs.iter().zip(taken) {
            if let Err(e) = queue.put(item.clone()) {
                tracing::warn!(
                    "Job {} could not return an input item: {}",
                    self.definition.name,
                    e
                );
                self.report(json!({
                    "job": self.definition.name,
                    "error": format!("input item not returned: {e}"),
                    "item": item,
                    "failed_at": Utc::now(),
                }));
            }
        }
    }

    fn report(&self, record: Value) {
        for queue in &self.error_queues {
            if let Err(e) = queue.put(record.clone()) {
                tracing::warn!("Could not record failure of job {}: {}", self.definition.name, e);
            }
        }
    }

    /// Run one scheduling step.
    pub async fn tick(&mut self, api: Option<Arc<CentralApi>>) -> TickOutcome {
        if self.paused_from.is_some() || self.is_finished() {
            return TickOutcome::Skipped;
        }
        let Some(inputs) = self.take_inputs() else {
            return TickOutcome::NoInput;
        };

        let mut call = JobCall::new(inputs);
        call.queues = self.extras.clone();
        call.api = api;

        let result = match self.definition.run(call).await {
            Ok(output) => distribute(
                output,
                &self.outputs,
                self.definition.tuple_result_is_single_value,
            ),
            Err(e) => Err(e),
        };

        match result {
            Ok(produced) => {
                self.runs += 1;
                let now = Utc::now();
                self.status = if self.definition.single_run {
                    JobStatus::Completed { completed_at: now }
                } else {
                    JobStatus::Active {
                        runs: self.runs,
                        last_run_at: now,
                    }
                };
                tracing::debug!("Job {} produced {} items", self.definition.name, produced);
                TickOutcome::Ran { produced }
            }
            Err(error) => {
                self.record_failure(&error);
                TickOutcome::Failed { error }
            }
        }
    }

    fn record_failure(&mut self, error: &str) {
        let failed_at = Utc::now();
        self.failures += 1;
        tracing::warn!("Job {} failed: {}", self.definition.name, error);

        self.status = if self.definition.single_run {
            JobStatus::PermanentlyFailed {
                error: error.to_string(),
                failed_at,
            }
        } else {
            JobStatus::Failed {
                error: error.to_string(),
                failed_at,
                failures: self.failures,
            }
        };

        self.report(json!({
            "job": self.definition.name,
            "error": error,
            "failed_at": failed_at,
        }));
    }
}

type ActorMap = Arc<RwLock<HashMap<String, ActorRef<JobMessage>>>>;

/// Cloneable control surface for running job actors.
///
/// Also creates jobs at runtime from registered templates.
#[derive(Clone)]
pub struct SchedulerHandle {
    actors: ActorMap,
    registry: Arc<QueueRegistry>,
    templates: Arc<RwLock<HashMap<String, JobDefinition>>>,
    api: Option<Weak<CentralApi>>,
}

impl SchedulerHandle {
    pub fn new(registry: Arc<QueueRegistry>) -> Self {
        Self {
            actors: Arc::default(),
            registry,
            templates: Arc::default(),
            api: None,
        }
    }

    fn actor(&self, name: &str) -> Option<ActorRef<JobMessage>> {
        self.actors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn remove(&self, name: &str) -> Option<ActorRef<JobMessage>> {
        self.actors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    fn contains(&self, name: &str) -> bool {
        self.actor(name).is_some()
    }

    /// Names of running jobs, sorted.
    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .actors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Keep `definition` as a template for [`SchedulerHandle::create`].
    pub fn add_template(&self, definition: &JobDefinition) {
        self.templates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(definition.name.clone(), definition.clone());
    }

    pub fn template(&self, name: &str) -> Option<JobDefinition> {
        self.templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Template names, sorted.
    pub fn template_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Start an actor for `job` and announce it on the new-job queues.
    pub async fn launch(
        &self,
        job: ScheduledJob,
        idle_poll_interval: Duration,
    ) -> Result<(), SchedulerError> {
        let name = job.name().to_string();
        if self.contains(&name) {
            return Err(SchedulerError::DuplicateJob(name));
        }
        let api = self.api.as_ref().and_then(Weak::upgrade);
        let actor = spawn_job(job, api, idle_poll_interval).await?;
        {
            let mut actors = self.actors.write().unwrap_or_else(PoisonError::into_inner);
            if actors.contains_key(&name) {
                actor.stop(None);
                return Err(SchedulerError::DuplicateJob(name));
            }
            actors.insert(name.clone(), actor);
        }

        let announcement = json!({ "job": name, "created_at": Utc::now() });
        for queue in self.registry.queues_by_type(NEW_JOB_ITEM_TYPE) {
            if let Err(e) = queue.put(announcement.clone()) {
                tracing::warn!("Could not announce job {}: {}", name, e);
            }
        }
        tracing::info!("Started job {}", name);
        Ok(())
    }

    /// Create the queues `definition` references, resolve it and launch it.
    pub async fn start_job(
        &self,
        definition: JobDefinition,
        idle_poll_interval: Duration,
    ) -> Result<(), SchedulerError> {
        if self.contains(&definition.name) {
            return Err(SchedulerError::DuplicateJob(definition.name));
        }
        self.registry.create_referenced(definition.queue_refs());
        let job = ScheduledJob::resolve(definition, &self.registry)?;
        self.launch(job, idle_poll_interval).await
    }

    async fn call<T: Send + 'static>(
        &self,
        name: &str,
        build: impl FnOnce(RpcReplyPort<T>) -> JobMessage,
    ) -> Result<T, SchedulerError> {
        let actor = self
            .actor(name)
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
        match ractor::rpc::call(&actor, build, None).await {
            Ok(ractor::rpc::CallResult::Success(value)) => Ok(value),
            Ok(_) => Err(SchedulerError::Actor(format!("job {name} did not reply"))),
            Err(e) => Err(SchedulerError::Actor(e.to_string())),
        }
    }

    pub async fn status(&self, name: &str) -> Result<JobStatus, SchedulerError> {
        self.call(name, |reply| JobMessage::GetStatus { reply }).await
    }

    pub async fn pause(&self, name: &str) -> Result<bool, SchedulerError> {
        self.call(name, |reply| JobMessage::Pause { reply }).await
    }

    pub async fn resume(&self, name: &str) -> Result<bool, SchedulerError> {
        self.call(name, |reply| JobMessage::Resume { reply }).await
    }

    /// Stop a job's actor. Removal is the only way to cancel a job.
    pub fn stop(&self, name: &str) -> Result<(), SchedulerError> {
        let actor = self
            .remove(name)
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
        actor.stop(None);
        tracing::info!("Stopped job {}", name);
        Ok(())
    }

    pub fn stop_all(&self) {
        let actors: Vec<(String, ActorRef<JobMessage>)> = self
            .actors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (name, actor) in actors {
            actor.stop(None);
            tracing::debug!("Stopped job {}", name);
        }
    }
}

/// Owns the active set of jobs.
///
/// Jobs are ticked in place with [`Scheduler::tick`] until [`Scheduler::spawn`]
/// hands each one to its own actor.
pub struct Scheduler {
    registry: Arc<QueueRegistry>,
    api: Option<Arc<CentralApi>>,
    jobs: Vec<ScheduledJob>,
    handle: SchedulerHandle,
}

impl Scheduler {
    pub fn new(registry: Arc<QueueRegistry>) -> Self {
        Self {
            handle: SchedulerHandle::new(registry.clone()),
            registry,
            api: None,
            jobs: Vec::new(),
        }
    }

    /// Central API handle passed to every run function.
    pub fn with_api(mut self, api: Arc<CentralApi>) -> Self {
        self.handle.api = Some(Arc::downgrade(&api));
        self.api = Some(api);
        self
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    fn contains(&self, name: &str) -> bool {
        self.jobs.iter().any(|j| j.name() == name) || self.handle.contains(name)
    }

    /// Resolve and add a job to the active set.
    pub fn add_job(&mut self, definition: JobDefinition) -> Result<(), SchedulerError> {
        if self.contains(&definition.name) {
            return Err(SchedulerError::DuplicateJob(definition.name));
        }
        let job = ScheduledJob::resolve(definition, &self.registry)?;
        tracing::info!("Scheduled job {}", job.name());
        self.jobs.push(job);
        Ok(())
    }

    /// Add every job of a pipeline in traversal order.
    pub fn add_pipeline(&mut self, pipeline: Pipeline) -> Result<usize, SchedulerError> {
        for (from, to) in pipeline.unwired_edges() {
            tracing::warn!(
                "Pipeline {}: no queue connects node {} to node {}",
                pipeline.name,
                from,
                to
            );
        }
        let jobs = pipeline.into_jobs();
        let count = jobs.len();
        for job in jobs {
            self.add_job(job)?;
        }
        Ok(count)
    }

    /// Remove a job from the active set, stopping its actor if spawned.
    pub fn remove_job(&mut self, name: &str) -> Result<(), SchedulerError> {
        if let Some(index) = self.jobs.iter().position(|j| j.name() == name) {
            self.jobs.remove(index);
            return Ok(());
        }
        self.handle.stop(name)
    }

    /// Jobs that are ticked in place, in insertion order.
    pub fn job_names(&self) -> Vec<String> {
        self.jobs.iter().map(|j| j.name().to_string()).collect()
    }

    /// One deterministic pass over the jobs not yet spawned.
    pub async fn tick(&mut self) -> Vec<(String, TickOutcome)> {
        let mut outcomes = Vec::with_capacity(self.jobs.len());
        for job in &mut self.jobs {
            let outcome = job.tick(self.api.clone()).await;
            outcomes.push((job.name().to_string(), outcome));
        }
        outcomes
    }

    pub async fn status(&self, name: &str) -> Result<JobStatus, SchedulerError> {
        match self.jobs.iter().find(|j| j.name() == name) {
            Some(job) => Ok(job.status().clone()),
            None => self.handle.status(name).await,
        }
    }

    pub async fn pause(&mut self, name: &str) -> Result<bool, SchedulerError> {
        match self.jobs.iter_mut().find(|j| j.name() == name) {
            Some(job) => Ok(job.pause()),
            None => self.handle.pause(name).await,
        }
    }

    pub async fn resume(&mut self, name: &str) -> Result<bool, SchedulerError> {
        match self.jobs.iter_mut().find(|j| j.name() == name) {
            Some(job) => Ok(job.resume()),
            None => self.handle.resume(name).await,
        }
    }

    /// Start one actor per job. Returns how many were started.
    pub async fn spawn(&mut self, config: &RuntimeConfig) -> Result<usize, SchedulerError> {
        let jobs = std::mem::take(&mut self.jobs);
        let count = jobs.len();
        for job in jobs {
            self.handle.launch(job, config.idle_poll_interval).await?;
        }
        Ok(count)
    }

    /// Stop every spawned job actor.
    pub fn shutdown(&mut self) {
        self.handle.stop_all();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use relay_core::{JobOutput, Queue, QueueDefinition};

    fn registry_with(names: &[&str]) -> Arc<QueueRegistry> {
        let registry = QueueRegistry::new();
        for name in names {
            registry.create_queue(QueueDefinition::new(*name));
        }
        registry.create_queue(QueueDefinition::new("errors").for_type(ERROR_ITEM_TYPE));
        Arc::new(registry)
    }

    fn adder() -> JobDefinition {
        JobDefinition::new("adder", |call: JobCall| async move {
            let a = call.input(0).as_i64().ok_or("a")?;
            let b = call.input(1).as_i64().ok_or("b")?;
            Ok(JobOutput::Value(json!(a + b)))
        })
        .with_input("a")
        .with_input("b")
        .with_output("sum")
    }

    #[test]
    fn resolve_fails_for_missing_queue() {
        let registry = registry_with(&["a"]);
        let err = ScheduledJob::resolve(adder(), &registry);
        assert!(matches!(
            err,
            Err(SchedulerError::Queue { job, source: QueueError::NotResolved(id) })
                if job == "adder" && id == "b"
        ));
    }

    #[tokio::test]
    async fn partial_inputs_do_not_run() -> Result<(), SchedulerError> {
        let registry = registry_with(&["a", "b", "sum"]);
        let mut job = ScheduledJob::resolve(adder(), &registry)?;
        let a = registry.get_queue("a").unwrap();
        let b = registry.get_queue("b").unwrap();

        a.put(json!(1)).unwrap();
        assert_eq!(job.tick(None).await, TickOutcome::NoInput);
        assert_eq!(a.size(), 1);

        b.put(json!(2)).unwrap();
        assert_eq!(job.tick(None).await, TickOutcome::Ran { produced: 1 });
        assert_eq!(registry.get_queue("sum").unwrap().get().unwrap(), json!(3));
        assert!(matches!(job.status(), JobStatus::Active { runs: 1, .. }));
        Ok(())
    }

    #[tokio::test]
    async fn failures_go_to_error_queue() -> Result<(), SchedulerError> {
        let registry = registry_with(&["a", "b", "sum"]);
        let mut job = ScheduledJob::resolve(adder(), &registry)?;
        registry.get_queue("a").unwrap().put(json!("x")).unwrap();
        registry.get_queue("b").unwrap().put(json!(2)).unwrap();

        assert_eq!(job.tick(None).await, TickOutcome::Failed { error: "a".into() });
        assert!(matches!(job.status(), JobStatus::Failed { failures: 1, .. }));

        let record = registry.get_queue("errors").unwrap().get().unwrap();
        assert_eq!(record["job"], "adder");
        assert_eq!(record["error"], "a");
        Ok(())
    }

    #[test]
    fn unreturnable_inputs_are_reported() -> Result<(), SchedulerError> {
        let registry = registry_with(&["b", "sum"]);
        registry.create_queue(QueueDefinition::new("a").with_capacity(1));
        let job = ScheduledJob::resolve(adder(), &registry)?;
        let a = registry.get_queue("a").unwrap();
        a.put(json!(1)).unwrap();

        job.put_back(vec![json!(7), json!(8)]);

        assert_eq!(a.size(), 1);
        assert_eq!(registry.get_queue("b").unwrap().get().unwrap(), json!(8));
        let record = registry.get_queue("errors").unwrap().get().unwrap();
        assert_eq!(record["job"], "adder");
        assert_eq!(record["item"], json!(7));
        assert!(
            record["error"]
                .as_str()
                .unwrap()
                .starts_with("input item not returned")
        );
        Ok(())
    }

    #[tokio::test]
    async fn paused_jobs_are_skipped() -> Result<(), SchedulerError> {
        let registry = registry_with(&["a", "b", "sum"]);
        let mut scheduler = Scheduler::new(registry.clone());
        scheduler.add_job(adder())?;
        assert!(matches!(
            scheduler.add_job(adder()),
            Err(SchedulerError::DuplicateJob(name)) if name == "adder"
        ));

        registry.get_queue("a").unwrap().put(json!(1)).unwrap();
        registry.get_queue("b").unwrap().put(json!(1)).unwrap();

        assert!(scheduler.pause("adder").await?);
        assert_eq!(scheduler.status("adder").await?, JobStatus::Paused);
        assert_eq!(
            scheduler.tick().await,
            vec![("adder".to_string(), TickOutcome::Skipped)]
        );

        assert!(scheduler.resume("adder").await?);
        assert_eq!(scheduler.status("adder").await?, JobStatus::Pending);
        assert_eq!(
            scheduler.tick().await,
            vec![("adder".to_string(), TickOutcome::Ran { produced: 1 })]
        );

        scheduler.remove_job("adder")?;
        assert!(scheduler.job_names().is_empty());
        assert!(matches!(
            scheduler.remove_job("adder"),
            Err(SchedulerError::UnknownJob(_))
        ));
        Ok(())
    }
}
