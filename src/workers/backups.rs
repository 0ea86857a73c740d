use crate::queue::BackupJob;
use crate::queue::Job;
use crate::store::backups;
use crate::workers::HandlerFailure;
use crate::workers::HandlerOutcome;
use crate::workers::HandlerResult;
use crate::workers::WorkerContext;

#[tracing::instrument(skip_all, fields(job_id = %job.id))]
pub(super) async fn handle(
    ctx: &WorkerContext,
    job: &Job,
) -> HandlerResult {
    let payload: BackupJob = serde_json::from_value(job.payload.clone())
        .map_err(|e| HandlerFailure::fatal(anyhow::anyhow!("malformed backup payload: {e}")))?;

    match payload {
        BackupJob::CleanupExpired { retention_days } => {
            let removed = backups::delete_older_than(&ctx.pool, retention_days)
                .await
                .map_err(|e| {
                    HandlerFailure::retryable(anyhow::anyhow!("store unavailable: {e}"))
                })?;
            tracing::info!("removed {removed} backup records past retention");
            Ok(HandlerOutcome::Completed)
        }
    }
}
