use std::collections::HashMap;

use actix_web::web;
use actix_web::web::Data;
use actix_web::HttpResponse;
use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::idempotency;
use crate::idempotency::IdempotencyError;
use crate::idempotency::IdempotencyKey;
use crate::idempotency::NextAction;
use crate::queue;
use crate::store::activity;
use crate::store::checkouts;
use crate::store::tasks;
use crate::store::tasks::TaskFilter;
use crate::store::ProvisioningTask;
use crate::store::StepRecord;
use crate::store::TaskStatus;
use crate::utils::error_400;
use crate::utils::error_500;
use crate::utils::not_found;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskListQuery {
    status: Option<TaskStatus>,
    subscription_id: Option<Uuid>,
    created_after: Option<DateTime<Utc>>,
    page: Option<i64>,
    per_page: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    id: Uuid,
    subscription_id: Uuid,
    server_id: Option<Uuid>,
    status: TaskStatus,
    attempt_count: i32,
    max_attempts: i32,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<ProvisioningTask> for TaskSummary {
    fn from(task: ProvisioningTask) -> Self {
        Self {
            id: task.id,
            subscription_id: task.subscription_id,
            server_id: task.server_id,
            status: task.status,
            attempt_count: task.attempt_count,
            max_attempts: task.max_attempts,
            started_at: task.started_at,
            finished_at: task.finished_at,
            last_error: task.last_error,
            created_at: task.created_at,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepView {
    step: crate::store::StepKind,
    status: crate::store::StepStatus,
    attempt: i32,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    result: Option<serde_json::Value>,
    error_code: Option<String>,
    error_message: Option<String>,
    idempotency_key: String,
    compensation: bool,
}

impl From<StepRecord> for StepView {
    fn from(record: StepRecord) -> Self {
        Self {
            step: record.step,
            status: record.status,
            attempt: record.attempt,
            started_at: record.started_at,
            finished_at: record.finished_at,
            result: record.result,
            error_code: record.error_code,
            error_message: record.error_message,
            idempotency_key: record.idempotency_key,
            compensation: record.compensation,
        }
    }
}

/// `GET /provisioning/tasks`
pub async fn list_tasks(
    query: web::Query<TaskListQuery>,
    pool: Data<PgPool>,
) -> Result<HttpResponse, actix_web::Error> {
    let filter = TaskFilter {
        status: query.status,
        subscription_id: query.subscription_id,
        created_after: query.created_after,
        page: query.page.unwrap_or(1),
        per_page: query.per_page.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE),
    };
    let page: Vec<TaskSummary> = tasks::list(pool.get_ref(), &filter)
        .await
        .map_err(error_500)?
        .into_iter()
        .map(TaskSummary::from)
        .collect();
    Ok(HttpResponse::Ok().json(page))
}

/// `GET /provisioning/tasks/{id}` - summary plus the ordered step log.
pub async fn get_task(
    path: web::Path<Uuid>,
    pool: Data<PgPool>,
) -> Result<HttpResponse, actix_web::Error> {
    let task_id = path.into_inner();
    let Some(task) = tasks::get(pool.get_ref(), task_id).await.map_err(error_500)? else {
        return Ok(not_found());
    };
    let steps: Vec<StepView> = tasks::step_log(pool.get_ref(), task_id)
        .await
        .map_err(error_500)?
        .into_iter()
        .map(StepView::from)
        .collect();
    Ok(HttpResponse::Ok().json(json!({
        "task": TaskSummary::from(task),
        "steps": steps,
    })))
}

/// How long a replay marker shields against duplicate replay requests.
const REPLAY_DEDUP_DAYS: i64 = 7;

/// `POST /provisioning/tasks/{id}/replay` - fresh attempt on a
/// dead-lettered task, run through the idempotency store. The marker is
/// keyed on the dead-letter instant, so every admin clicking replay for the
/// same round shares one re-enqueue; and the originating payment event's
/// dedup record is dropped in the same transaction, so the event is
/// deliberately reopened rather than silently bypassed.
pub async fn replay_task(
    path: web::Path<Uuid>,
    pool: Data<PgPool>,
) -> Result<HttpResponse, actix_web::Error> {
    let task_id = path.into_inner();
    let Some(task) = tasks::get(pool.get_ref(), task_id).await.map_err(error_500)? else {
        return Ok(not_found());
    };
    // a task that never finished has no round to key the marker on
    let Some(finished_at) = task.finished_at else {
        return Ok(HttpResponse::Conflict().json(json!({
            "error": "only dead-lettered tasks can be replayed"
        })));
    };

    let marker = format!("{task_id}-{}", finished_at.timestamp());
    let key = IdempotencyKey::try_from(marker).map_err(error_500)?;
    let mut transaction = match idempotency::try_begin(
        "replay",
        &key,
        Duration::days(REPLAY_DEDUP_DAYS),
        pool.get_ref(),
    )
    .await
    {
        Ok(NextAction::StartProcessing(transaction)) => transaction,
        Ok(NextAction::ReturnSavedOutcome(outcome)) => {
            // an identical replay already went through
            return Ok(HttpResponse::Accepted().json(outcome));
        }
        Err(IdempotencyError::InFlight) => {
            return Ok(HttpResponse::Conflict().json(json!({
                "error": "a replay of this task is already in flight"
            })));
        }
        Err(IdempotencyError::StorageUnavailable(e)) => return Err(error_500(e)),
    };

    let reset = tasks::replay(&mut *transaction, task_id)
        .await
        .map_err(error_500)?;
    if !reset {
        // rolls back on drop, the marker included
        return Ok(HttpResponse::Conflict().json(json!({
            "error": "only dead-lettered tasks can be replayed"
        })));
    }

    let Some(job) = queue::find_dead_lettered_for_task(&mut *transaction, task_id)
        .await
        .map_err(error_500)?
    else {
        // the job row was pruned; without its payload there is nothing to
        // re-run (the transaction rolls back on drop)
        return Ok(HttpResponse::Conflict().json(json!({
            "error": "original provisioning job is no longer available"
        })));
    };
    queue::replay(&mut *transaction, job.id)
        .await
        .map_err(error_500)?;

    // reopen the payment event that created this work
    if let Some(event_id) = checkouts::originating_event_id(&mut *transaction, task.subscription_id)
        .await
        .map_err(error_500)?
    {
        let event_key = IdempotencyKey::try_from(event_id).map_err(error_500)?;
        idempotency::forget("webhook", &event_key, &mut *transaction)
            .await
            .map_err(error_500)?;
    }

    activity::record(
        &mut *transaction,
        task.tenant_id,
        "task.replayed",
        Some(task_id),
        "dead-lettered provisioning task replayed by an administrator",
    )
    .await
    .map_err(error_500)?;

    let outcome = json!({ "replayed": true });
    idempotency::save_outcome("replay", &key, outcome.clone(), transaction)
        .await
        .map_err(error_500)?;

    tracing::info!("task {task_id} queued for replay");
    Ok(HttpResponse::Accepted().json(outcome))
}

/// `GET /provisioning/stats`
pub async fn queue_statistics(pool: Data<PgPool>) -> Result<HttpResponse, actix_web::Error> {
    let counters = queue::queue_stats(pool.get_ref()).await.map_err(error_500)?;
    let mut leaks = 0;
    let mut queues = HashMap::new();
    for counter in counters {
        leaks += counter.reservation_leaks;
        queues.insert(counter.queue.clone(), counter);
    }
    Ok(HttpResponse::Ok().json(json!({
        "queue": queues,
        "reservationLeaks": leaks,
    })))
}

/// `DELETE /provisioning/idempotency/{scope}/{key}` - administrative
/// forget, so the next delivery of an external event re-runs instead of
/// replaying the stored outcome.
pub async fn forget_idempotency(
    path: web::Path<(String, String)>,
    pool: Data<PgPool>,
) -> Result<HttpResponse, actix_web::Error> {
    let (scope, key) = path.into_inner();
    let key = IdempotencyKey::try_from(key).map_err(error_400)?;
    idempotency::forget(&scope, &key, pool.get_ref())
        .await
        .map_err(error_500)?;
    Ok(HttpResponse::NoContent().finish())
}
