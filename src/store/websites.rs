use chrono::DateTime;
use chrono::Utc;
use sqlx::PgExecutor;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "website_status", rename_all = "lowercase")]
pub enum WebsiteStatus {
    Pending,
    Active,
    Suspended,
    Terminated,
}

/// The provisioned asset. Created `pending` when the orchestrator opens a
/// task; `active` only when the final step succeeds. Artifact ids (zone,
/// cert, mailbox, database) fill in as the steps complete.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Website {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub subscription_id: Uuid,
    pub server_id: Uuid,
    pub domain: String,
    pub account_id: Option<String>,
    pub document_root: Option<String>,
    pub dns_zone_id: Option<String>,
    pub ssl_cert_id: Option<String>,
    pub default_mailbox: Option<String>,
    pub default_database: Option<String>,
    pub status: WebsiteStatus,
    pub created_at: DateTime<Utc>,
}

const COLUMNS: &str = "id, tenant_id, customer_id, subscription_id, server_id, domain, \
                       account_id, document_root, dns_zone_id, ssl_cert_id, \
                       default_mailbox, default_database, status, created_at";

/// Insert the pending row, or return the existing one when a retried task
/// opens the same subscription again.
pub async fn upsert_pending(
    executor: impl PgExecutor<'_>,
    tenant_id: Uuid,
    customer_id: Uuid,
    subscription_id: Uuid,
    server_id: Uuid,
    domain: &str,
) -> Result<Website, sqlx::Error> {
    sqlx::query_as::<_, Website>(&format!(
        r#"
        INSERT INTO websites
            (id, tenant_id, customer_id, subscription_id, server_id, domain)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (subscription_id)
            DO UPDATE SET server_id = EXCLUDED.server_id, updated_at = now()
        RETURNING {COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(tenant_id)
    .bind(customer_id)
    .bind(subscription_id)
    .bind(server_id)
    .bind(domain)
    .fetch_one(executor)
    .await
}

pub async fn get(
    executor: impl PgExecutor<'_>,
    id: Uuid,
) -> Result<Option<Website>, sqlx::Error> {
    sqlx::query_as::<_, Website>(&format!("SELECT {COLUMNS} FROM websites WHERE id = $1"))
        .bind(id)
        .fetch_optional(executor)
        .await
}

pub async fn get_by_subscription(
    executor: impl PgExecutor<'_>,
    subscription_id: Uuid,
) -> Result<Option<Website>, sqlx::Error> {
    sqlx::query_as::<_, Website>(&format!(
        "SELECT {COLUMNS} FROM websites WHERE subscription_id = $1"
    ))
    .bind(subscription_id)
    .fetch_optional(executor)
    .await
}

pub async fn set_account_artifacts(
    executor: impl PgExecutor<'_>,
    id: Uuid,
    account_id: &str,
    document_root: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE websites
        SET account_id = $2, document_root = $3, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(account_id)
    .bind(document_root)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn set_dns_zone(
    executor: impl PgExecutor<'_>,
    id: Uuid,
    zone_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE websites
        SET dns_zone_id = $2, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(zone_id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn set_ssl_cert(
    executor: impl PgExecutor<'_>,
    id: Uuid,
    cert_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE websites
        SET ssl_cert_id = $2, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(cert_id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn set_default_mailbox(
    executor: impl PgExecutor<'_>,
    id: Uuid,
    mailbox: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE websites
        SET default_mailbox = $2, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(mailbox)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn set_default_database(
    executor: impl PgExecutor<'_>,
    id: Uuid,
    database: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE websites
        SET default_database = $2, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(database)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn set_status(
    executor: impl PgExecutor<'_>,
    id: Uuid,
    status: WebsiteStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE websites
        SET status = $2, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(status)
    .execute(executor)
    .await?;
    Ok(())
}
