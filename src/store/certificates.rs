use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use sqlx::PgExecutor;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Certificate {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub website_id: Uuid,
    pub external_id: String,
    pub domain: String,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: DateTime<Utc>,
    pub reminded_at: Option<DateTime<Utc>>,
}

pub async fn insert(
    executor: impl PgExecutor<'_>,
    tenant_id: Uuid,
    website_id: Uuid,
    external_id: &str,
    domain: &str,
    not_before: Option<DateTime<Utc>>,
    not_after: DateTime<Utc>,
) -> Result<Uuid, sqlx::Error> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO certificates
            (id, tenant_id, website_id, external_id, domain, not_before, not_after)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(id)
    .bind(tenant_id)
    .bind(website_id)
    .bind(external_id)
    .bind(domain)
    .bind(not_before)
    .bind(not_after)
    .execute(executor)
    .await?;
    Ok(id)
}

pub async fn get(
    executor: impl PgExecutor<'_>,
    id: Uuid,
) -> Result<Option<Certificate>, sqlx::Error> {
    sqlx::query_as::<_, Certificate>(
        r#"
        SELECT id, tenant_id, website_id, external_id, domain, not_before,
               not_after, reminded_at
        FROM certificates
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await
}

/// Certificates expiring within `window_days` that have not been reminded
/// this window yet; feeds the SSL-reminder sweep.
pub async fn expiring_within(
    executor: impl PgExecutor<'_>,
    window_days: i64,
) -> Result<Vec<Certificate>, sqlx::Error> {
    let horizon = Utc::now() + Duration::days(window_days);
    sqlx::query_as::<_, Certificate>(
        r#"
        SELECT id, tenant_id, website_id, external_id, domain, not_before,
               not_after, reminded_at
        FROM certificates
        WHERE not_after <= $1
          AND not_after > now()
          AND (reminded_at IS NULL
               OR reminded_at < not_after - make_interval(days => $2))
        ORDER BY not_after
        "#,
    )
    .bind(horizon)
    .bind(window_days as i32)
    .fetch_all(executor)
    .await
}

pub async fn mark_reminded(
    executor: impl PgExecutor<'_>,
    id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE certificates
        SET reminded_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .execute(executor)
    .await?;
    Ok(())
}
