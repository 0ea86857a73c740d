use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sqlx::PgExecutor;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    /// Between attempts: the last step failed retryably and the job is
    /// waiting out its backoff. Not terminal.
    Failed,
    DeadLettered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "step_kind", rename_all = "lowercase")]
pub enum StepKind {
    Account,
    Dns,
    Ssl,
    Email,
    Database,
    Notify,
}

impl StepKind {
    /// The fixed workflow order.
    pub fn all() -> [StepKind; 6] {
        [
            Self::Account,
            Self::Dns,
            Self::Ssl,
            Self::Email,
            Self::Database,
            Self::Notify,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Dns => "dns",
            Self::Ssl => "ssl",
            Self::Email => "email",
            Self::Database => "database",
            Self::Notify => "notify",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "step_status", rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Succeeded,
    Skipped,
    Failed,
}

/// One execution of the provisioning workflow for one subscription.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProvisioningTask {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub server_id: Option<Uuid>,
    pub status: TaskStatus,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One attempt at one step (or one compensation). Append-only.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StepRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    pub step: StepKind,
    pub status: StepStatus,
    pub attempt: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub idempotency_key: String,
    pub compensation: bool,
}

const TASK_COLUMNS: &str = "id, tenant_id, subscription_id, server_id, status, \
                            attempt_count, max_attempts, started_at, finished_at, \
                            last_error, created_at";

const STEP_COLUMNS: &str = "id, task_id, step, status, attempt, started_at, finished_at, \
                            result, error_code, error_message, idempotency_key, \
                            compensation";

pub async fn create(
    executor: impl PgExecutor<'_>,
    tenant_id: Uuid,
    subscription_id: Uuid,
    max_attempts: i32,
) -> Result<Uuid, sqlx::Error> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO provisioning_tasks (id, tenant_id, subscription_id, max_attempts)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(id)
    .bind(tenant_id)
    .bind(subscription_id)
    .bind(max_attempts)
    .execute(executor)
    .await?;
    Ok(id)
}

pub async fn get(
    executor: impl PgExecutor<'_>,
    id: Uuid,
) -> Result<Option<ProvisioningTask>, sqlx::Error> {
    sqlx::query_as::<_, ProvisioningTask>(&format!(
        "SELECT {TASK_COLUMNS} FROM provisioning_tasks WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(executor)
    .await
}

/// Open the task for a new attempt. Terminal rows are left alone (returns
/// `None`); a task already `running` is re-opened, which happens when a
/// worker died and its reservation expired mid-run.
pub async fn start_attempt(
    executor: impl PgExecutor<'_>,
    id: Uuid,
) -> Result<Option<ProvisioningTask>, sqlx::Error> {
    sqlx::query_as::<_, ProvisioningTask>(&format!(
        r#"
        UPDATE provisioning_tasks
        SET status = 'running',
            attempt_count = attempt_count + 1,
            started_at = COALESCE(started_at, now()),
            updated_at = now()
        WHERE id = $1 AND status IN ('queued', 'failed', 'running')
        RETURNING {TASK_COLUMNS}
        "#
    ))
    .bind(id)
    .fetch_optional(executor)
    .await
}

pub async fn set_server(
    executor: impl PgExecutor<'_>,
    id: Uuid,
    server_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE provisioning_tasks
        SET server_id = $2, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(server_id)
    .execute(executor)
    .await?;
    Ok(())
}

/// Undo the placement after a compensated account termination, so a replay
/// picks (and counts) a server afresh.
pub async fn clear_server(
    executor: impl PgExecutor<'_>,
    id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE provisioning_tasks
        SET server_id = NULL, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .execute(executor)
    .await?;
    Ok(())
}

/// Step failed retryably; the queue owns the backoff, the task just waits.
pub async fn mark_retrying(
    executor: impl PgExecutor<'_>,
    id: Uuid,
    error: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE provisioning_tasks
        SET status = 'failed', last_error = $2, updated_at = now()
        WHERE id = $1 AND status = 'running'
        "#,
    )
    .bind(id)
    .bind(error)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn mark_succeeded(
    executor: impl PgExecutor<'_>,
    id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE provisioning_tasks
        SET status = 'succeeded', finished_at = now(), last_error = NULL,
            updated_at = now()
        WHERE id = $1 AND status = 'running'
        "#,
    )
    .bind(id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn mark_dead_lettered(
    executor: impl PgExecutor<'_>,
    id: Uuid,
    error: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE provisioning_tasks
        SET status = 'dead_lettered', finished_at = now(), last_error = $2,
            updated_at = now()
        WHERE id = $1 AND status IN ('queued', 'running', 'failed')
        "#,
    )
    .bind(id)
    .bind(error)
    .execute(executor)
    .await?;
    Ok(())
}

/// Fresh attempt on a dead-lettered task: attempts reset, step log kept.
/// Succeeded steps stay succeeded, so only the rest re-execute.
pub async fn replay(
    executor: impl PgExecutor<'_>,
    id: Uuid,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        r#"
        UPDATE provisioning_tasks
        SET status = 'queued', attempt_count = 0, finished_at = NULL,
            last_error = NULL, updated_at = now()
        WHERE id = $1 AND status = 'dead_lettered'
        "#,
    )
    .bind(id)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(updated > 0)
}

pub struct NewStepRecord<'a> {
    pub task_id: Uuid,
    pub step: StepKind,
    pub status: StepStatus,
    pub attempt: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error_code: Option<&'a str>,
    pub error_message: Option<&'a str>,
    pub idempotency_key: &'a str,
    pub compensation: bool,
}

pub async fn insert_step(
    executor: impl PgExecutor<'_>,
    record: NewStepRecord<'_>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO task_steps
            (id, task_id, step, status, attempt, started_at, finished_at,
             result, error_code, error_message, idempotency_key, compensation)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(record.task_id)
    .bind(record.step)
    .bind(record.status)
    .bind(record.attempt)
    .bind(record.started_at)
    .bind(record.finished_at)
    .bind(record.result)
    .bind(record.error_code)
    .bind(record.error_message)
    .bind(record.idempotency_key)
    .bind(record.compensation)
    .execute(executor)
    .await?;
    Ok(())
}

/// Steps that already ran to completion for this task; retries resume after
/// them and never touch the adapter again. A step whose artefact was later
/// compensated away does not count - a replay has to rebuild it.
pub async fn succeeded_steps(
    executor: impl PgExecutor<'_>,
    task_id: Uuid,
) -> Result<Vec<StepKind>, sqlx::Error> {
    let rows: Vec<(StepKind,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT step FROM task_steps t
        WHERE task_id = $1 AND status = 'succeeded' AND compensation = false
          AND NOT EXISTS (
              SELECT 1 FROM task_steps c
              WHERE c.task_id = t.task_id AND c.step = t.step
                AND c.compensation = true AND c.status = 'succeeded'
          )
        "#,
    )
    .bind(task_id)
    .fetch_all(executor)
    .await?;
    Ok(rows.into_iter().map(|(step,)| step).collect())
}

/// The recorded result of a step's successful run, if any.
pub async fn step_result(
    executor: impl PgExecutor<'_>,
    task_id: Uuid,
    step: StepKind,
) -> Result<Option<serde_json::Value>, sqlx::Error> {
    let row: Option<(Option<serde_json::Value>,)> = sqlx::query_as(
        r#"
        SELECT result FROM task_steps
        WHERE task_id = $1 AND step = $2 AND status = 'succeeded'
          AND compensation = false
        ORDER BY started_at DESC
        LIMIT 1
        "#,
    )
    .bind(task_id)
    .bind(step)
    .fetch_optional(executor)
    .await?;
    Ok(row.and_then(|(result,)| result))
}

/// 1-based attempt number for the next run of a step within a task.
pub async fn next_step_attempt(
    executor: impl PgExecutor<'_>,
    task_id: Uuid,
    step: StepKind,
) -> Result<i32, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as(
        r#"
        SELECT count(*) FROM task_steps
        WHERE task_id = $1 AND step = $2 AND compensation = false
        "#,
    )
    .bind(task_id)
    .bind(step)
    .fetch_one(executor)
    .await?;
    Ok(count as i32 + 1)
}

pub async fn step_log(
    executor: impl PgExecutor<'_>,
    task_id: Uuid,
) -> Result<Vec<StepRecord>, sqlx::Error> {
    sqlx::query_as::<_, StepRecord>(&format!(
        r#"
        SELECT {STEP_COLUMNS} FROM task_steps
        WHERE task_id = $1
        ORDER BY started_at, id
        "#
    ))
    .bind(task_id)
    .fetch_all(executor)
    .await
}

pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub subscription_id: Option<Uuid>,
    pub created_after: Option<DateTime<Utc>>,
    pub page: i64,
    pub per_page: i64,
}

pub async fn list(
    executor: impl PgExecutor<'_>,
    filter: &TaskFilter,
) -> Result<Vec<ProvisioningTask>, sqlx::Error> {
    let offset = (filter.page.max(1) - 1) * filter.per_page;
    sqlx::query_as::<_, ProvisioningTask>(&format!(
        r#"
        SELECT {TASK_COLUMNS} FROM provisioning_tasks
        WHERE ($1::task_status IS NULL OR status = $1)
          AND ($2::uuid IS NULL OR subscription_id = $2)
          AND ($3::timestamptz IS NULL OR created_at >= $3)
        ORDER BY created_at DESC, id
        LIMIT $4 OFFSET $5
        "#
    ))
    .bind(filter.status)
    .bind(filter.subscription_id)
    .bind(filter.created_after)
    .bind(filter.per_page)
    .bind(offset)
    .fetch_all(executor)
    .await
}
