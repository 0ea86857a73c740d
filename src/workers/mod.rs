//! Worker pools. Each queue gets a fixed number of workers that loop
//! claim -> handle -> ack. Every handler is idempotent (idempotency store +
//! adapter idem-keys), because an expired reservation means another worker
//! will run the same job again.

mod backups;
mod emails;
mod invoices;

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::adapters::Adapters;
use crate::configuration::Settings;
use crate::orchestrator;
use crate::queue;
use crate::queue::FailureKind;
use crate::queue::Job;
use crate::queue::QueueError;
use crate::queue::QueueName;
use crate::startup::get_connection_pool;

/// Everything a worker needs; cloned per spawned worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub pool: PgPool,
    pub adapters: Arc<Adapters>,
    pub settings: Arc<Settings>,
    pub worker_id: String,
}

pub enum ExecutionOutcome {
    TaskCompleted,
    EmptyQueue,
}

/// What a handler decided about its job.
pub enum HandlerOutcome {
    Completed,
    /// Put the job back untouched and retry after a short delay (no attempt
    /// consumed); used when the subscription lock is held elsewhere.
    Deferred(Duration),
    /// The reservation was lost mid-run; do not ack, the reclaiming worker
    /// owns the job now.
    Abandoned,
}

pub struct HandlerFailure {
    pub kind: FailureKind,
    pub error: anyhow::Error,
}

impl HandlerFailure {
    pub fn retryable(error: anyhow::Error) -> Self {
        Self {
            kind: FailureKind::Retryable,
            error,
        }
    }

    pub fn fatal(error: anyhow::Error) -> Self {
        Self {
            kind: FailureKind::Fatal,
            error,
        }
    }
}

pub type HandlerResult = Result<HandlerOutcome, HandlerFailure>;

/// Spawn the configured number of workers for every queue. Handles are
/// detached; worker loops only exit on panic.
pub fn spawn_worker_pools(
    cfg: &Settings,
    adapters: Arc<Adapters>,
) -> Vec<JoinHandle<Result<(), anyhow::Error>>> {
    let pool = get_connection_pool(&cfg.database);
    let settings = Arc::new(cfg.clone());
    let mut handles = Vec::new();
    for queue in QueueName::all() {
        let count = match queue {
            QueueName::Provisioning => cfg.queue.workers.provisioning,
            QueueName::Emails => cfg.queue.workers.emails,
            QueueName::Invoices => cfg.queue.workers.invoices,
            QueueName::Backups => cfg.queue.workers.backups,
        };
        for n in 0..count {
            let ctx = WorkerContext {
                pool: pool.clone(),
                adapters: adapters.clone(),
                settings: settings.clone(),
                worker_id: format!("{queue}-{n}-{}", Uuid::new_v4()),
            };
            handles.push(tokio::spawn(run_worker_until_stopped(ctx, queue)));
        }
    }
    handles
}

pub async fn run_worker_until_stopped(
    ctx: WorkerContext,
    queue: QueueName,
) -> Result<(), anyhow::Error> {
    let mut consecutive_failures: u32 = 0;
    loop {
        match try_execute_one(&ctx, queue).await {
            Ok(ExecutionOutcome::EmptyQueue) => {
                consecutive_failures = 0;
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Ok(ExecutionOutcome::TaskCompleted) => {
                consecutive_failures = 0;
            }
            Err(e) => {
                // storage hiccups and repeated dead-letters slow the claim
                // rate linearly, capped at 30 s
                consecutive_failures += 1;
                let backoff = Duration::from_secs(u64::from(consecutive_failures).min(30));
                tracing::warn!(
                    error.cause_chain = ?e,
                    error.message = %e,
                    backoff_secs = backoff.as_secs(),
                    "worker iteration failed on queue {queue}"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Claim one job, run its handler, acknowledge the result. Public so the
/// test suite can drain queues deterministically.
#[tracing::instrument(skip_all, fields(queue = %queue, job_id = tracing::field::Empty))]
pub async fn try_execute_one(
    ctx: &WorkerContext,
    queue: QueueName,
) -> Result<ExecutionOutcome, anyhow::Error> {
    let ttl = ctx.settings.queue.reservation_ttl();
    let jobs = queue::claim(&ctx.pool, queue, &ctx.worker_id, 1, ttl).await?;
    let Some(job) = jobs.into_iter().next() else {
        return Ok(ExecutionOutcome::EmptyQueue);
    };
    tracing::Span::current().record("job_id", tracing::field::display(job.id));

    let result = dispatch(ctx, queue, &job).await;
    match result {
        Ok(HandlerOutcome::Completed) => {
            if let Err(QueueError::ReservationLost) =
                queue::complete(&ctx.pool, job.id, &ctx.worker_id).await
            {
                // another worker reclaimed it; its ack wins
                tracing::warn!("reservation lost before completion of job {}", job.id);
            }
        }
        Ok(HandlerOutcome::Deferred(delay)) => {
            queue::defer(&ctx.pool, job.id, &ctx.worker_id, delay).await?;
        }
        Ok(HandlerOutcome::Abandoned) => {
            tracing::warn!("job {} abandoned after losing its reservation", job.id);
        }
        Err(failure) => {
            tracing::error!(
                error.cause_chain = ?failure.error,
                error.message = %failure.error,
                "job {} failed ({:?})",
                job.id,
                failure.kind,
            );
            queue::fail(
                &ctx.pool,
                job.id,
                &ctx.worker_id,
                &failure.error.to_string(),
                failure.kind,
                ctx.settings.queue.backoff_max_secs,
            )
            .await?;
        }
    }
    Ok(ExecutionOutcome::TaskCompleted)
}

async fn dispatch(
    ctx: &WorkerContext,
    queue: QueueName,
    job: &Job,
) -> HandlerResult {
    match queue {
        QueueName::Provisioning => orchestrator::execute(ctx, job).await,
        QueueName::Emails => emails::handle(ctx, job).await,
        QueueName::Invoices => invoices::handle(ctx, job).await,
        QueueName::Backups => backups::handle(ctx, job).await,
    }
}
