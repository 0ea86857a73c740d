use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use sqlx::PgExecutor;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueName {
    Provisioning,
    Emails,
    Invoices,
    Backups,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Emails => "emails",
            Self::Invoices => "invoices",
            Self::Backups => "backups",
        }
    }

    pub fn all() -> [QueueName; 4] {
        [Self::Provisioning, Self::Emails, Self::Invoices, Self::Backups]
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Reserved,
    Done,
    Failed,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub eligible_at: DateTime<Utc>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub backoff_base_secs: i32,
    pub status: JobStatus,
    pub reserved_by: Option<String>,
    pub reserved_until: Option<DateTime<Utc>>,
    pub dead_letter_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

const COLUMNS: &str = "id, queue, payload, priority, eligible_at, attempts, max_attempts, \
                       backoff_base_secs, status, reserved_by, reserved_until, \
                       dead_letter_reason, created_at";

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The reservation ttl elapsed (or another worker took over); the
    /// handler must abort and let the reclaiming worker finish the job.
    #[error("job reservation no longer held")]
    ReservationLost,
    #[error("queue store unavailable")]
    Storage(#[from] sqlx::Error),
}

/// How a failed attempt should be treated, decided by the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Schedule another attempt after backoff (until attempts run out).
    Retryable,
    /// Dead-letter immediately.
    Fatal,
}

pub struct EnqueueOptions {
    /// Lower is sooner.
    pub priority: i32,
    pub delay: Duration,
    pub max_attempts: i32,
    pub backoff_base_secs: i32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 5,
            delay: Duration::ZERO,
            max_attempts: 3,
            backoff_base_secs: 1,
        }
    }
}

/// Insert a job. Runs on whatever executor the caller holds, so an enqueue
/// can commit atomically with the rows that justify it.
pub async fn enqueue(
    executor: impl PgExecutor<'_>,
    queue: QueueName,
    payload: &serde_json::Value,
    opts: &EnqueueOptions,
) -> Result<Uuid, QueueError> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO jobs
            (id, queue, payload, priority, eligible_at, max_attempts,
             backoff_base_secs)
        VALUES ($1, $2, $3, $4, now() + make_interval(secs => $5), $6, $7)
        "#,
    )
    .bind(id)
    .bind(queue.as_str())
    .bind(payload)
    .bind(opts.priority)
    .bind(opts.delay.as_secs_f64())
    .bind(opts.max_attempts)
    .bind(opts.backoff_base_secs)
    .execute(executor)
    .await?;
    Ok(id)
}

/// Atomically move up to `count` eligible jobs to `reserved` for this
/// worker. Expired reservations count as eligible again - that re-claim is
/// the at-least-once boundary every handler has to tolerate. Attempts are
/// counted at claim time, so a reclaimed job shows up with `attempts`
/// incremented.
pub async fn claim(
    executor: impl PgExecutor<'_>,
    queue: QueueName,
    worker_id: &str,
    count: i64,
    ttl: Duration,
) -> Result<Vec<Job>, QueueError> {
    let jobs = sqlx::query_as::<_, Job>(&format!(
        r#"
        UPDATE jobs
        SET status = 'reserved',
            reserved_by = $3,
            reserved_until = now() + make_interval(secs => $4),
            attempts = attempts + 1,
            updated_at = now()
        WHERE id IN (
            SELECT id FROM jobs
            WHERE queue = $1
              AND eligible_at <= now()
              AND (status = 'queued'
                   OR (status = 'reserved' AND reserved_until < now()))
            ORDER BY priority, eligible_at, id
            LIMIT $2
            FOR UPDATE SKIP LOCKED
        )
        RETURNING {COLUMNS}
        "#
    ))
    .bind(queue.as_str())
    .bind(count)
    .bind(worker_id)
    .bind(ttl.as_secs_f64())
    .fetch_all(executor)
    .await?;
    Ok(jobs)
}

/// Acknowledge success. Fails with [`QueueError::ReservationLost`] when the
/// ttl already elapsed; a `done` job is never re-emitted.
pub async fn complete(
    executor: impl PgExecutor<'_>,
    job_id: Uuid,
    worker_id: &str,
) -> Result<(), QueueError> {
    let updated = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'done', updated_at = now()
        WHERE id = $1 AND reserved_by = $2 AND status = 'reserved'
          AND reserved_until > now()
        "#,
    )
    .bind(job_id)
    .bind(worker_id)
    .execute(executor)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(QueueError::ReservationLost);
    }
    Ok(())
}

/// Record a failed attempt: dead-letter on `Fatal` or exhausted attempts,
/// otherwise schedule the next attempt with exponential backoff.
pub async fn fail(
    pool: &PgPool,
    job_id: Uuid,
    worker_id: &str,
    error: &str,
    kind: FailureKind,
    max_backoff_secs: u64,
) -> Result<(), QueueError> {
    let mut transaction = pool.begin().await?;

    let job = sqlx::query_as::<_, Job>(&format!(
        r#"
        SELECT {COLUMNS} FROM jobs
        WHERE id = $1 AND reserved_by = $2 AND status = 'reserved'
        FOR UPDATE
        "#
    ))
    .bind(job_id)
    .bind(worker_id)
    .fetch_optional(&mut *transaction)
    .await?
    .ok_or(QueueError::ReservationLost)?;

    let dead_letter = kind == FailureKind::Fatal || job.attempts >= job.max_attempts;
    if dead_letter {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', dead_letter_reason = $2, reserved_by = NULL,
                reserved_until = NULL, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(error)
        .execute(&mut *transaction)
        .await?;
    } else {
        let delay = backoff_delay(job.attempts, job.backoff_base_secs as u64, max_backoff_secs);
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', reserved_by = NULL, reserved_until = NULL,
                eligible_at = now() + make_interval(secs => $2),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(delay.as_secs_f64())
        .execute(&mut *transaction)
        .await?;
    }

    transaction.commit().await?;
    Ok(())
}

/// Lengthen the reservation of a long-running job. Must be called before the
/// current ttl elapses.
pub async fn extend(
    executor: impl PgExecutor<'_>,
    job_id: Uuid,
    worker_id: &str,
    ttl: Duration,
) -> Result<(), QueueError> {
    let updated = sqlx::query(
        r#"
        UPDATE jobs
        SET reserved_until = now() + make_interval(secs => $3), updated_at = now()
        WHERE id = $1 AND reserved_by = $2 AND status = 'reserved'
          AND reserved_until > now()
        "#,
    )
    .bind(job_id)
    .bind(worker_id)
    .bind(ttl.as_secs_f64())
    .execute(executor)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(QueueError::ReservationLost);
    }
    Ok(())
}

/// Give the job back without consuming an attempt; used when a worker finds
/// the work temporarily blocked (e.g. another task holds the subscription
/// lock).
pub async fn defer(
    executor: impl PgExecutor<'_>,
    job_id: Uuid,
    worker_id: &str,
    delay: Duration,
) -> Result<(), QueueError> {
    let updated = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'queued', reserved_by = NULL, reserved_until = NULL,
            attempts = greatest(attempts - 1, 0),
            eligible_at = now() + make_interval(secs => $3),
            updated_at = now()
        WHERE id = $1 AND reserved_by = $2 AND status = 'reserved'
        "#,
    )
    .bind(job_id)
    .bind(worker_id)
    .bind(delay.as_secs_f64())
    .execute(executor)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(QueueError::ReservationLost);
    }
    Ok(())
}

/// Move a dead-lettered job back to `queued` with a clean slate.
pub async fn replay(
    executor: impl PgExecutor<'_>,
    job_id: Uuid,
) -> Result<bool, QueueError> {
    let updated = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'queued', attempts = 0, eligible_at = now(),
            dead_letter_reason = NULL, reserved_by = NULL,
            reserved_until = NULL, updated_at = now()
        WHERE id = $1 AND status = 'failed'
        "#,
    )
    .bind(job_id)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(updated > 0)
}

/// The dead-lettered provisioning job carrying a task's payload; replaying
/// a task re-queues this same job so the payload (and its one-shot secrets)
/// survive.
pub async fn find_dead_lettered_for_task(
    executor: impl PgExecutor<'_>,
    task_id: Uuid,
) -> Result<Option<Job>, QueueError> {
    let job = sqlx::query_as::<_, Job>(&format!(
        r#"
        SELECT {COLUMNS} FROM jobs
        WHERE queue = 'provisioning'
          AND status = 'failed'
          AND payload->>'task_id' = $1
        ORDER BY created_at DESC
        LIMIT 1
        "#
    ))
    .bind(task_id.to_string())
    .fetch_optional(executor)
    .await?;
    Ok(job)
}

/// Per-queue counters for the control API. A reservation whose ttl is in
/// the past but that nobody reclaimed yet shows up as a leak - the telltale
/// of a crashed worker.
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct QueueCounters {
    #[serde(skip)]
    pub queue: String,
    pub queued: i64,
    pub reserved: i64,
    pub done: i64,
    pub failed: i64,
    pub oldest_eligible_at: Option<DateTime<Utc>>,
    pub reservation_leaks: i64,
}

pub async fn queue_stats(
    executor: impl PgExecutor<'_>,
) -> Result<Vec<QueueCounters>, QueueError> {
    let counters = sqlx::query_as::<_, QueueCounters>(
        r#"
        SELECT queue,
               count(*) FILTER (WHERE status = 'queued') AS queued,
               count(*) FILTER (WHERE status = 'reserved') AS reserved,
               count(*) FILTER (WHERE status = 'done') AS done,
               count(*) FILTER (WHERE status = 'failed') AS failed,
               min(eligible_at) FILTER (WHERE status = 'queued') AS oldest_eligible_at,
               count(*) FILTER (WHERE status = 'reserved' AND reserved_until < now())
                   AS reservation_leaks
        FROM jobs
        GROUP BY queue
        ORDER BY queue
        "#,
    )
    .fetch_all(executor)
    .await?;
    Ok(counters)
}

/// `min(base * 2^(n-1) + jitter, max)` with jitter uniform in `[0, delay)`.
pub fn backoff_delay(
    attempts: i32,
    base_secs: u64,
    max_secs: u64,
) -> Duration {
    let exponent = (attempts.max(1) - 1).min(20) as u32;
    let delay = base_secs.saturating_mul(1u64 << exponent);
    let jitter = rand::thread_rng().gen_range(0..delay.max(1));
    Duration::from_secs(delay.saturating_add(jitter).min(max_secs))
}
