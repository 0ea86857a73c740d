use chrono::Duration;
use chrono::Utc;
use sqlx::PgExecutor;
use uuid::Uuid;

pub async fn insert(
    executor: impl PgExecutor<'_>,
    tenant_id: Uuid,
    website_id: Uuid,
    label: &str,
    size_bytes: i64,
) -> Result<Uuid, sqlx::Error> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO backups (id, tenant_id, website_id, label, size_bytes)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(id)
    .bind(tenant_id)
    .bind(website_id)
    .bind(label)
    .bind(size_bytes)
    .execute(executor)
    .await?;
    Ok(id)
}

/// Drop backup records past the retention window. Returns how many went.
pub async fn delete_older_than(
    executor: impl PgExecutor<'_>,
    retention_days: i64,
) -> Result<u64, sqlx::Error> {
    let cutoff = Utc::now() - Duration::days(retention_days);
    let result = sqlx::query(
        r#"
        DELETE FROM backups
        WHERE created_at < $1
        "#,
    )
    .bind(cutoff)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}
