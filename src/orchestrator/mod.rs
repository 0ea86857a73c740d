//! The six-step provisioning workflow. One run per job claim; steps that
//! already succeeded are skipped, so a retried or reclaimed task resumes at
//! the first non-succeeded step without touching the adapters for finished
//! work.

mod compensation;
mod steps;

use std::collections::HashSet;
use std::time::Duration;

use sha2::Digest;
use sha2::Sha256;
use tokio::time::Instant;
use uuid::Uuid;

use crate::domain::DomainName;
use crate::domain::EmailAddress;
use crate::queue;
use crate::queue::Job;
use crate::queue::ProvisioningJob;
use crate::queue::QueueError;
use crate::store::customers;
use crate::store::servers;
use crate::store::subscriptions;
use crate::store::tasks;
use crate::store::websites;
use crate::store::ProvisioningTask;
use crate::store::Server;
use crate::store::StepKind;
use crate::store::Subscription;
use crate::store::SubscriptionStatus;
use crate::store::TaskStatus;
use crate::workers::HandlerFailure;
use crate::workers::HandlerOutcome;
use crate::workers::HandlerResult;
use crate::workers::WorkerContext;

/// How long a loser of the subscription lock waits before its job becomes
/// eligible again.
const LOCK_RETRY_DELAY: Duration = Duration::from_secs(5);

/// The stable per-step idempotency key: identical across task attempts, so
/// the adapters can dedupe repeated calls. The trailing tag versions the
/// strategy.
pub fn step_idempotency_key(
    task_id: Uuid,
    step: StepKind,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_id.as_bytes());
    hasher.update(step.as_str().as_bytes());
    hasher.update(b"v1");
    hex::encode(&hasher.finalize()[..16])
}

fn subscription_lock_key(subscription_id: Uuid) -> i64 {
    let bytes: [u8; 8] = subscription_id.as_bytes()[..8]
        .try_into()
        .expect("uuid has 16 bytes");
    i64::from_le_bytes(bytes)
}

fn storage(e: sqlx::Error) -> HandlerFailure {
    HandlerFailure::retryable(anyhow::anyhow!("task store unavailable: {e}"))
}

/// Entry point for `provisioning` jobs.
#[tracing::instrument(
    skip_all,
    fields(
        task_id = tracing::field::Empty,
        subscription_id = tracing::field::Empty,
        attempt = tracing::field::Empty,
    )
)]
pub async fn execute(
    ctx: &WorkerContext,
    job: &Job,
) -> HandlerResult {
    let payload: ProvisioningJob = serde_json::from_value(job.payload.clone())
        .map_err(|e| HandlerFailure::fatal(anyhow::anyhow!("malformed provisioning payload: {e}")))?;
    tracing::Span::current()
        .record("task_id", tracing::field::display(payload.task_id))
        .record(
            "subscription_id",
            tracing::field::display(payload.subscription_id),
        );

    // At most one running task per subscription. The lock lives on a
    // dedicated session so it spans the many transactions a run makes; a
    // crashed worker's session drop releases it.
    let mut lock_conn = ctx.pool.acquire().await.map_err(storage)?;
    let lock_key = subscription_lock_key(payload.subscription_id);
    let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
        .bind(lock_key)
        .fetch_one(&mut *lock_conn)
        .await
        .map_err(storage)?;
    if !locked {
        tracing::info!("subscription lock busy; deferring job {}", job.id);
        return Ok(HandlerOutcome::Deferred(LOCK_RETRY_DELAY));
    }

    let result = run_task(ctx, job, &payload).await;

    let _ = sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(lock_key)
        .execute(&mut *lock_conn)
        .await;
    result
}

async fn run_task(
    ctx: &WorkerContext,
    job: &Job,
    payload: &ProvisioningJob,
) -> HandlerResult {
    let task = tasks::get(&ctx.pool, payload.task_id)
        .await
        .map_err(storage)?
        .ok_or_else(|| {
            HandlerFailure::fatal(anyhow::anyhow!("unknown task {}", payload.task_id))
        })?;

    // a duplicate job for finished work is a no-op
    if matches!(task.status, TaskStatus::Succeeded | TaskStatus::DeadLettered) {
        tracing::info!("task {} already terminal; nothing to do", task.id);
        return Ok(HandlerOutcome::Completed);
    }

    let subscription = subscriptions::get(&ctx.pool, payload.subscription_id)
        .await
        .map_err(storage)?
        .ok_or_else(|| {
            HandlerFailure::fatal(anyhow::anyhow!(
                "unknown subscription {}",
                payload.subscription_id
            ))
        })?;
    if subscription.status == SubscriptionStatus::Active {
        // a concurrent duplicate already finished the work
        tracing::info!("subscription {} already active; nothing to do", subscription.id);
        return Ok(HandlerOutcome::Completed);
    }

    let task = tasks::start_attempt(&ctx.pool, task.id)
        .await
        .map_err(storage)?
        .ok_or_else(|| {
            HandlerFailure::fatal(anyhow::anyhow!("task {} cannot be opened", payload.task_id))
        })?;
    tracing::Span::current().record("attempt", task.attempt_count);

    let customer = customers::get(&ctx.pool, payload.customer_id)
        .await
        .map_err(storage)?
        .ok_or_else(|| {
            HandlerFailure::fatal(anyhow::anyhow!("unknown customer {}", payload.customer_id))
        })?;

    let (domain, username) = match subscription_identity(&subscription) {
        Ok(pair) => pair,
        Err(e) => {
            tasks::mark_dead_lettered(&ctx.pool, task.id, &e.to_string())
                .await
                .map_err(storage)?;
            return Err(HandlerFailure::fatal(e));
        }
    };

    let server = match place_on_server(ctx, &task).await? {
        Some(server) => server,
        None => {
            let message = "no active server with spare capacity";
            return Err(step_failed_retryable(ctx, job, &task, message).await);
        }
    };

    let website = websites::upsert_pending(
        &ctx.pool,
        task.tenant_id,
        customer.id,
        subscription.id,
        server.id,
        domain.as_ref(),
    )
    .await
    .map_err(storage)?;

    let customer_email = match EmailAddress::parse(customer.email.clone()) {
        Ok(email) => email,
        Err(e) => {
            let message = format!("stored customer email is invalid: {e}");
            tasks::mark_dead_lettered(&ctx.pool, task.id, &message)
                .await
                .map_err(storage)?;
            return Err(HandlerFailure::fatal(anyhow::anyhow!(message)));
        }
    };

    let env = steps::StepEnv {
        ctx,
        task: &task,
        subscription: &subscription,
        customer: &customer,
        customer_email,
        server: &server,
        website: &website,
        domain,
        username,
        temporary_password: payload.temporary_password.clone(),
    };

    let deadline = Instant::now() + ctx.settings.queue.task_deadline();
    let succeeded: HashSet<StepKind> = tasks::succeeded_steps(&ctx.pool, task.id)
        .await
        .map_err(storage)?
        .into_iter()
        .collect();

    for step in StepKind::all() {
        if succeeded.contains(&step) {
            continue;
        }

        // keep the reservation ahead of the work
        match queue::extend(
            &ctx.pool,
            job.id,
            &ctx.worker_id,
            ctx.settings.queue.reservation_ttl(),
        )
        .await
        {
            Ok(()) => {}
            Err(QueueError::ReservationLost) => return Ok(HandlerOutcome::Abandoned),
            Err(QueueError::Storage(e)) => return Err(storage(e)),
        }

        if Instant::now() >= deadline {
            let message = format!("task deadline exceeded before step {step}");
            return Err(step_failed_retryable(ctx, job, &task, &message).await);
        }

        let attempt = tasks::next_step_attempt(&ctx.pool, task.id, step)
            .await
            .map_err(storage)?;
        let idem_key = step_idempotency_key(task.id, step);

        match steps::run_step(&env, step, attempt, &idem_key).await {
            Ok(()) => {}
            Err(steps::StepFailure::Storage(e)) => return Err(storage(e)),
            Err(steps::StepFailure::Retryable(message)) => {
                return Err(step_failed_retryable(ctx, job, &task, &message).await);
            }
            Err(steps::StepFailure::Fatal(message)) => {
                compensation::compensate(&env, step).await;
                tasks::mark_dead_lettered(&ctx.pool, task.id, &message)
                    .await
                    .map_err(storage)?;
                return Err(HandlerFailure::fatal(anyhow::anyhow!(message)));
            }
        }
    }

    // all six steps in; flip everything over in one transaction
    let mut transaction = ctx.pool.begin().await.map_err(storage)?;
    websites::set_status(&mut *transaction, website.id, crate::store::WebsiteStatus::Active)
        .await
        .map_err(storage)?;
    subscriptions::activate(&mut *transaction, subscription.id)
        .await
        .map_err(storage)?;
    tasks::mark_succeeded(&mut *transaction, task.id)
        .await
        .map_err(storage)?;
    transaction.commit().await.map_err(storage)?;

    tracing::info!("task {} provisioned {}", task.id, env.domain);
    Ok(HandlerOutcome::Completed)
}

/// Domain and hosting username were fixed at webhook time and ride in the
/// subscription metadata; a task without them can never succeed.
fn subscription_identity(
    subscription: &Subscription,
) -> Result<(DomainName, String), anyhow::Error> {
    let domain = subscription
        .metadata
        .get("domain")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("subscription metadata is missing the domain"))?;
    let domain = DomainName::parse(domain.to_string())
        .map_err(|e| anyhow::anyhow!("subscription domain is invalid: {e}"))?;
    let username = subscription
        .metadata
        .get("username")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("subscription metadata is missing the username"))?
        .to_string();
    Ok((domain, username))
}

/// Reuse the assigned server, or pick one and take a capacity slot in the
/// same transaction that records the assignment.
async fn place_on_server(
    ctx: &WorkerContext,
    task: &ProvisioningTask,
) -> Result<Option<Server>, HandlerFailure> {
    if let Some(server_id) = task.server_id {
        let server = servers::get(&ctx.pool, server_id)
            .await
            .map_err(storage)?
            .ok_or_else(|| {
                HandlerFailure::fatal(anyhow::anyhow!("assigned server {server_id} is gone"))
            })?;
        return Ok(Some(server));
    }

    let mut transaction = ctx.pool.begin().await.map_err(storage)?;
    let Some(server) = servers::pick_for_placement(&mut *transaction, task.tenant_id)
        .await
        .map_err(storage)?
    else {
        return Ok(None);
    };
    tasks::set_server(&mut *transaction, task.id, server.id)
        .await
        .map_err(storage)?;
    servers::increment_accounts(&mut *transaction, server.id)
        .await
        .map_err(storage)?;
    transaction.commit().await.map_err(storage)?;
    Ok(Some(server))
}

/// A retryable step failure: the queue schedules the next attempt, the task
/// waits - unless this was the last attempt, in which case job and task
/// dead-letter together.
async fn step_failed_retryable(
    ctx: &WorkerContext,
    job: &Job,
    task: &ProvisioningTask,
    message: &str,
) -> HandlerFailure {
    let exhausted = job.attempts >= job.max_attempts;
    let update = if exhausted {
        tasks::mark_dead_lettered(&ctx.pool, task.id, message).await
    } else {
        tasks::mark_retrying(&ctx.pool, task.id, message).await
    };
    if let Err(e) = update {
        tracing::error!(
            error.message = %e,
            "failed to record step failure on task {}", task.id
        );
    }
    HandlerFailure::retryable(anyhow::anyhow!("{message}"))
}
