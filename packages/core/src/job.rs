//! Job definitions, call bundles, outputs and lifecycle status.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dispatch::CentralApi;
use crate::queue::{QueueHandle, QueueReference};

/// Future returned by a job's run function.
pub type RunFuture = Pin<Box<dyn Future<Output = Result<JobOutput, String>> + Send>>;

/// Type-erased run function.
pub type RunFunction = Arc<dyn Fn(JobCall) -> RunFuture + Send + Sync>;

/// What a job produced on one run.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutput {
    /// One value, copied to every output queue.
    Value(Value),
    /// Positional values, one per output queue unless the job treats
    /// tuples as single values.
    Tuple(Vec<Value>),
    /// A batch bulk-put into every output queue.
    Many(Vec<Value>),
    /// No output.
    Nothing,
}

impl From<Value> for JobOutput {
    fn from(value: Value) -> Self {
        JobOutput::Value(value)
    }
}

/// Arguments handed to a run function.
#[derive(Clone, Default)]
pub struct JobCall {
    /// One item per input queue, in declaration order.
    pub inputs: Vec<Value>,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    /// Extra queues by reference identifier.
    pub queues: HashMap<String, QueueHandle>,
    pub api: Option<Arc<CentralApi>>,
}

impl JobCall {
    pub fn new(inputs: Vec<Value>) -> Self {
        Self {
            inputs,
            ..Default::default()
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    pub fn with_queue(mut self, identifier: impl Into<String>, queue: QueueHandle) -> Self {
        self.queues.insert(identifier.into(), queue);
        self
    }

    pub fn with_api(mut self, api: Arc<CentralApi>) -> Self {
        self.api = Some(api);
        self
    }

    /// Input at `index`, or `Null` when absent.
    pub fn input(&self, index: usize) -> &Value {
        self.inputs.get(index).unwrap_or(&Value::Null)
    }

    pub fn queue(&self, identifier: &str) -> Option<&QueueHandle> {
        self.queues.get(identifier)
    }
}

impl std::fmt::Debug for JobCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCall")
            .field("inputs", &self.inputs)
            .field("args", &self.args)
            .field("kwargs", &self.kwargs)
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .field("api", &self.api.is_some())
            .finish()
    }
}

/// Declarative description of a job. Immutable once registered.
#[derive(Clone)]
pub struct JobDefinition {
    pub name: String,
    pub description: Option<String>,
    run_function: RunFunction,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub input_queue_refs: Vec<QueueReference>,
    pub extra_queue_refs: Vec<QueueReference>,
    pub output_queue_refs: Vec<QueueReference>,
    /// Delay between successive runs.
    pub wait_time: Duration,
    /// Stop after the first completed or failed run.
    pub single_run: bool,
    /// Treat a `Tuple` result as one value instead of one value per output.
    pub tuple_result_is_single_value: bool,
}

impl JobDefinition {
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(JobCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JobOutput, String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: None,
            run_function: Arc::new(move |call| Box::pin(run(call))),
            args: Vec::new(),
            kwargs: Map::new(),
            input_queue_refs: Vec::new(),
            extra_queue_refs: Vec::new(),
            output_queue_refs: Vec::new(),
            wait_time: Duration::ZERO,
            single_run: false,
            tuple_result_is_single_value: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_input(mut self, reference: impl Into<QueueReference>) -> Self {
        self.input_queue_refs.push(reference.into());
        self
    }

    pub fn with_extra(mut self, reference: impl Into<QueueReference>) -> Self {
        self.extra_queue_refs.push(reference.into());
        self
    }

    pub fn with_output(mut self, reference: impl Into<QueueReference>) -> Self {
        self.output_queue_refs.push(reference.into());
        self
    }

    pub fn with_arg(mut self, arg: Value) -> Self {
        self.args.push(arg);
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    pub fn single_run(mut self) -> Self {
        self.single_run = true;
        self
    }

    pub fn tuple_result_is_single_value(mut self) -> Self {
        self.tuple_result_is_single_value = true;
        self
    }

    /// Every queue reference the job depends on.
    pub fn queue_refs(&self) -> impl Iterator<Item = &QueueReference> {
        self.input_queue_refs
            .iter()
            .chain(&self.extra_queue_refs)
            .chain(&self.output_queue_refs)
    }

    /// Invoke the run function with bound arguments merged in.
    ///
    /// Call-time positional args come first, followed by bound ones.
    /// Call-time kwargs override bound kwargs of the same name.
    pub fn run(&self, mut call: JobCall) -> RunFuture {
        call.args.extend(self.args.iter().cloned());
        for (key, value) in &self.kwargs {
            call.kwargs.entry(key.clone()).or_insert_with(|| value.clone());
        }
        (self.run_function)(call)
    }
}

impl std::fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("inputs", &self.input_queue_refs)
            .field("extras", &self.extra_queue_refs)
            .field("outputs", &self.output_queue_refs)
            .field("wait_time", &self.wait_time)
            .field("single_run", &self.single_run)
            .finish()
    }
}

/// Lifecycle status of a scheduled job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    /// Scheduled but not yet run.
    #[default]
    Pending,
    /// Has run successfully at least once and keeps running.
    Active {
        runs: u64,
        last_run_at: DateTime<Utc>,
    },
    /// Last run failed; will be retried on the next tick.
    Failed {
        error: String,
        failed_at: DateTime<Utc>,
        failures: u32,
    },
    /// Single-run job that finished.
    Completed { completed_at: DateTime<Utc> },
    /// Single-run job that failed and will not be retried.
    PermanentlyFailed {
        error: String,
        failed_at: DateTime<Utc>,
    },
    /// Skipped by the scheduler until resumed.
    Paused,
}

impl JobStatus {
    /// Check if the job will never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed { .. } | JobStatus::PermanentlyFailed { .. }
        )
    }

    /// Get a simple status string for display.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Active { .. } => "active",
            JobStatus::Failed { .. } => "failed",
            JobStatus::Completed { .. } => "completed",
            JobStatus::PermanentlyFailed { .. } => "permanently_failed",
            JobStatus::Paused => "paused",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Put a run's output into the job's output queues.
///
/// Returns how many items were put in total.
pub fn distribute(
    output: JobOutput,
    outputs: &[QueueHandle],
    tuple_is_single_value: bool,
) -> Result<usize, String> {
    if outputs.is_empty() {
        return Ok(0);
    }
    match output {
        JobOutput::Nothing => Ok(0),
        JobOutput::Value(value) => put_each(outputs, &value),
        JobOutput::Tuple(values) if tuple_is_single_value => {
            put_each(outputs, &Value::Array(values))
        }
        JobOutput::Tuple(values) if outputs.len() == 1 => put_all(&outputs[0], values),
        JobOutput::Tuple(values) => {
            if values.len() != outputs.len() {
                return Err(format!(
                    "result has {} values but job has {} output queues",
                    values.len(),
                    outputs.len()
                ));
            }
            for (queue, value) in outputs.iter().zip(values) {
                queue.put(value).map_err(|e| e.to_string())?;
            }
            Ok(outputs.len())
        }
        JobOutput::Many(values) => {
            let mut total = 0;
            for queue in outputs {
                total += put_all(queue, values.clone())?;
            }
            Ok(total)
        }
    }
}

fn put_each(outputs: &[QueueHandle], value: &Value) -> Result<usize, String> {
    for queue in outputs {
        queue.put(value.clone()).map_err(|e| e.to_string())?;
    }
    Ok(outputs.len())
}

fn put_all(queue: &QueueHandle, values: Vec<Value>) -> Result<usize, String> {
    let expected = values.len();
    let accepted = queue.put_iter(values);
    if accepted < expected {
        return Err(format!(
            "output queue accepted {accepted} of {expected} items"
        ));
    }
    Ok(accepted)
}
