use chrono::Utc;

use super::step_idempotency_key;
use super::steps::StepEnv;
use crate::store::servers;
use crate::store::tasks;
use crate::store::tasks::NewStepRecord;
use crate::store::StepKind;
use crate::store::StepStatus;

/// Best-effort cleanup after a fatal step failure: undo every step that
/// succeeded, in reverse order. Failures here are recorded as warnings in
/// the step log and never block the task from dead-lettering.
#[tracing::instrument(skip_all, fields(task_id = %env.task.id, failed_step = %failed_step))]
pub(crate) async fn compensate(
    env: &StepEnv<'_>,
    failed_step: StepKind,
) {
    // notify has nothing to undo and is never reached before a fatal step
    let reverse = [
        StepKind::Database,
        StepKind::Email,
        StepKind::Ssl,
        StepKind::Dns,
        StepKind::Account,
    ];

    for step in reverse {
        let result = match tasks::step_result(&env.ctx.pool, env.task.id, step).await {
            Ok(Some(result)) => result,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(
                    error.message = %e,
                    "could not read step log while compensating task {}", env.task.id
                );
                continue;
            }
        };

        let started_at = Utc::now();
        let outcome = undo(env, step, &result).await;
        let (status, error_message) = match outcome {
            Ok(()) => (StepStatus::Succeeded, None),
            Err(e) => {
                tracing::warn!(
                    error.message = %e,
                    "compensation of step {step} failed on task {}", env.task.id
                );
                (StepStatus::Failed, Some(format!("{e:#}")))
            }
        };

        let undo_key = format!("{}-undo", step_idempotency_key(env.task.id, step));
        let record = NewStepRecord {
            task_id: env.task.id,
            step,
            status,
            attempt: 1,
            started_at,
            finished_at: Some(Utc::now()),
            result: None,
            error_code: error_message.as_ref().map(|_| "compensation"),
            error_message: error_message.as_deref(),
            idempotency_key: &undo_key,
            compensation: true,
        };
        if let Err(e) = tasks::insert_step(&env.ctx.pool, record).await {
            tracing::warn!(
                error.message = %e,
                "could not record compensation of step {step} on task {}", env.task.id
            );
        }
    }
}

async fn undo(
    env: &StepEnv<'_>,
    step: StepKind,
    result: &serde_json::Value,
) -> Result<(), anyhow::Error> {
    let text = |key: &str| result.get(key).and_then(|v| v.as_str());
    match step {
        StepKind::Database => {
            let name = text("database")
                .ok_or_else(|| anyhow::anyhow!("step result has no database name"))?;
            env.ctx.adapters.database.drop_database(name).await?;
        }
        StepKind::Email => {
            let mailbox_id = text("mailbox_id")
                .ok_or_else(|| anyhow::anyhow!("step result has no mailbox id"))?;
            env.ctx.adapters.mail.delete(mailbox_id).await?;
        }
        StepKind::Ssl => {
            let cert_id =
                text("cert_id").ok_or_else(|| anyhow::anyhow!("step result has no cert id"))?;
            env.ctx.adapters.certificate.revoke(cert_id).await?;
        }
        StepKind::Dns => {
            let zone_id =
                text("zone_id").ok_or_else(|| anyhow::anyhow!("step result has no zone id"))?;
            env.ctx.adapters.dns.delete_zone(zone_id).await?;
        }
        StepKind::Account => {
            let account_id = text("account_id")
                .ok_or_else(|| anyhow::anyhow!("step result has no account id"))?;
            let hosting = env.ctx.adapters.hosting_for(env.server);
            hosting.terminate(account_id).await?;
            servers::decrement_accounts(&env.ctx.pool, env.server.id).await?;
            // a replay must re-place and take a fresh capacity slot
            tasks::clear_server(&env.ctx.pool, env.task.id).await?;
        }
        StepKind::Notify => {}
    }
    Ok(())
}
