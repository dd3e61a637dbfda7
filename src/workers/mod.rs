use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    jobs::{self, JobKind, QueueError},
    models::Job,
    state::AppState,
};

pub mod contact;
pub mod email;
pub mod sequence;
pub mod thread_watch;

/// What a handler made of its job.
///
/// `Defer` without a delay falls back to the kind's backoff curve, and
/// the dispatcher parks the job once the kind's attempt allowance is
/// spent. `Abandon` parks it immediately; handlers use it after they
/// have done their own terminal bookkeeping.
#[derive(Debug)]
pub enum JobOutcome {
    Done,
    Defer {
        error: String,
        delay: Option<Duration>,
    },
    Abandon {
        error: String,
    },
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn kind(&self) -> JobKind;
    async fn run(&self, state: Arc<AppState>, job: Job) -> JobOutcome;
}

/// Routes claimed jobs to their family's handler and settles the result
/// back onto the queue.
///
/// Any number of dispatcher processes may run side by side; the claim's
/// row lock keeps them off each other's jobs, and handlers stay
/// idempotent per job id because the queue is at-least-once.
pub struct Dispatcher {
    state: Arc<AppState>,
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
    idle_wait: Duration,
}

impl Dispatcher {
    pub fn new(
        state: Arc<AppState>,
        handlers: Vec<Arc<dyn JobHandler>>,
        idle_wait: Duration,
    ) -> Self {
        let handlers = handlers
            .into_iter()
            .map(|handler| (handler.kind(), handler))
            .collect();
        Self {
            state,
            handlers,
            idle_wait,
        }
    }

    /// Drain jobs as fast as they come; sleep only when the queue is dry
    /// or unreachable.
    pub async fn run(&self) {
        let kinds: Vec<&str> = self.handlers.keys().map(|kind| kind.as_str()).collect();
        info!(kinds = ?kinds, "dispatcher online");
        loop {
            match self.poll_once().await {
                Ok(Some(_)) => {}
                Ok(None) => sleep(self.idle_wait).await,
                Err(err) => {
                    error!(error = %err, "queue poll failed");
                    sleep(self.idle_wait).await;
                }
            }
        }
    }

    /// Claim and settle at most one job; the settled job's id lets
    /// callers drain the queue to empty.
    pub async fn poll_once(&self) -> Result<Option<Uuid>, QueueError> {
        let kinds: Vec<JobKind> = self.handlers.keys().copied().collect();
        if kinds.is_empty() {
            return Ok(None);
        }

        let claimed = {
            let mut conn = match self.state.db() {
                Ok(conn) => conn,
                Err(err) => {
                    error!(?err, "no store connection, skipping dispatch round");
                    return Ok(None);
                }
            };
            jobs::claim(&mut conn, &kinds)?
        };
        let Some(job) = claimed else {
            return Ok(None);
        };
        let job_id = job.id;

        let outcome = match JobKind::parse(&job.job_type)
            .and_then(|kind| self.handlers.get(&kind))
        {
            Some(handler) => handler.run(self.state.clone(), job.clone()).await,
            None => JobOutcome::Abandon {
                error: format!("no handler registered for {}", job.job_type),
            },
        };

        self.settle(&job, outcome)?;
        Ok(Some(job_id))
    }

    fn settle(&self, job: &Job, outcome: JobOutcome) -> Result<(), QueueError> {
        let mut conn = match self.state.db() {
            Ok(conn) => conn,
            Err(err) => {
                // The job stays in `processing`; operators re-queue by hand.
                error!(?err, job_id = %job.id, "could not settle job, store unreachable");
                return Ok(());
            }
        };

        match outcome {
            JobOutcome::Done => {
                jobs::complete(&mut conn, job.id)?;
                info!(
                    job_id = %job.id,
                    kind = %job.job_type,
                    attempt = job.attempts,
                    "job done"
                );
            }
            JobOutcome::Defer { error, delay } => {
                let allowance_spent = JobKind::parse(&job.job_type)
                    .map(|kind| job.attempts >= kind.max_attempts())
                    .unwrap_or(true);
                if allowance_spent {
                    error!(
                        job_id = %job.id,
                        kind = %job.job_type,
                        attempt = job.attempts,
                        error = %error,
                        "attempt allowance spent, parking job"
                    );
                    jobs::abandon(&mut conn, job.id, &error)?;
                } else {
                    warn!(
                        job_id = %job.id,
                        kind = %job.job_type,
                        attempt = job.attempts,
                        error = %error,
                        "job deferred"
                    );
                    jobs::defer(&mut conn, job, delay, &error)?;
                }
            }
            JobOutcome::Abandon { error } => {
                error!(
                    job_id = %job.id,
                    kind = %job.job_type,
                    attempt = job.attempts,
                    error = %error,
                    "job abandoned"
                );
                jobs::abandon(&mut conn, job.id, &error)?;
            }
        }
        Ok(())
    }
}

pub fn core_handlers() -> Vec<Arc<dyn JobHandler>> {
    vec![
        Arc::new(sequence::ProcessSequenceJob::new()),
        Arc::new(email::SendEmailJob::new()),
        Arc::new(contact::SyncContactJob::new()),
        Arc::new(thread_watch::WatchThreadJob::new()),
    ]
}
