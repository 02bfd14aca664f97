//! Job actor: ticks one scheduled job, then sleeps.

use std::sync::Arc;
use std::time::Duration;

use ractor::{Actor, ActorProcessingErr, ActorRef};
use relay_core::CentralApi;

use crate::error::SchedulerError;
use crate::messages::JobMessage;
use crate::scheduler::{ScheduledJob, TickOutcome};

/// State for the job actor.
pub struct JobActorState {
    job: ScheduledJob,
    api: Option<Arc<CentralApi>>,
    idle_poll_interval: Duration,
    /// A tick is scheduled or running.
    ticking: bool,
}

impl JobActorState {
    /// Delay before the tick after one with `outcome`.
    fn next_delay(&self, outcome: &TickOutcome) -> Duration {
        let wait_time = self.job.definition().wait_time;
        match outcome {
            TickOutcome::Ran { .. } | TickOutcome::Failed { .. } => wait_time,
            TickOutcome::NoInput | TickOutcome::Skipped => wait_time.max(self.idle_poll_interval),
        }
    }
}

/// Job actor arguments.
pub struct JobArgs {
    pub job: ScheduledJob,
    pub api: Option<Arc<CentralApi>>,
    pub idle_poll_interval: Duration,
}

/// Job actor that runs a single job on its own schedule.
pub struct JobActor;

fn schedule_tick(myself: &ActorRef<JobMessage>, delay: Duration) {
    let myself = myself.clone();
    tokio::spawn(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let _ = myself.send_message(JobMessage::Tick);
    });
}

impl Actor for JobActor {
    type Msg = JobMessage;
    type State = JobActorState;
    type Arguments = JobArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting job actor: {}", args.job.name());
        myself.send_message(JobMessage::Tick)?;

        Ok(JobActorState {
            job: args.job,
            api: args.api,
            idle_poll_interval: args.idle_poll_interval,
            ticking: true,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            JobMessage::Tick => {
                let outcome = state.job.tick(state.api.clone()).await;
                if state.job.is_finished() {
                    tracing::info!(
                        "Job {} finished: {}",
                        state.job.name(),
                        state.job.status()
                    );
                    state.ticking = false;
                    return Ok(());
                }
                let delay = state.next_delay(&outcome);
                schedule_tick(&myself, delay);
            }

            JobMessage::Pause { reply } => {
                let _ = reply.send(state.job.pause());
            }

            JobMessage::Resume { reply } => {
                let resumed = state.job.resume();
                if resumed && !state.ticking {
                    state.ticking = true;
                    schedule_tick(&myself, Duration::ZERO);
                }
                let _ = reply.send(resumed);
            }

            JobMessage::GetStatus { reply } => {
                let _ = reply.send(state.job.status().clone());
            }
        }

        Ok(())
    }
}

/// Spawn an actor for `job`.
pub async fn spawn_job(
    job: ScheduledJob,
    api: Option<Arc<CentralApi>>,
    idle_poll_interval: Duration,
) -> Result<ActorRef<JobMessage>, SchedulerError> {
    let args = JobArgs {
        job,
        api,
        idle_poll_interval,
    };
    let (actor, _handle) = Actor::spawn(None, JobActor, args)
        .await
        .map_err(|e| SchedulerError::Spawn(e.to_string()))?;
    Ok(actor)
}
