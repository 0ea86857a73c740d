use sqlx::PgExecutor;
use uuid::Uuid;

/// Admin-visible activity entries (suspensions, replays). The read surface
/// lives in the dashboard application; this side only appends.
pub async fn record(
    executor: impl PgExecutor<'_>,
    tenant_id: Uuid,
    kind: &str,
    reference_id: Option<Uuid>,
    message: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO activity_log (id, tenant_id, kind, reference_id, message)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(tenant_id)
    .bind(kind)
    .bind(reference_id)
    .bind(message)
    .execute(executor)
    .await?;
    Ok(())
}
