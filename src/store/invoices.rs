use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use sqlx::PgExecutor;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "invoice_status", rename_all = "lowercase")]
pub enum InvoiceStatus {
    Open,
    Paid,
    Overdue,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Invoice {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub amount_minor: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub due_at: DateTime<Utc>,
}

const COLUMNS: &str = "id, tenant_id, subscription_id, period_start, period_end, \
                       amount_minor, currency, status, due_at";

/// At most one invoice per `(subscription, cycle)`: the uniqueness
/// constraint absorbs double-enqueued billing jobs. Returns `None` when the
/// cycle was already invoiced.
#[allow(clippy::too_many_arguments)]
pub async fn insert_for_cycle(
    executor: impl PgExecutor<'_>,
    tenant_id: Uuid,
    subscription_id: Uuid,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    amount_minor: i64,
    currency: &str,
    due_at: DateTime<Utc>,
) -> Result<Option<Invoice>, sqlx::Error> {
    sqlx::query_as::<_, Invoice>(&format!(
        r#"
        INSERT INTO invoices
            (id, tenant_id, subscription_id, period_start, period_end,
             amount_minor, currency, due_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (subscription_id, period_start) DO NOTHING
        RETURNING {COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(tenant_id)
    .bind(subscription_id)
    .bind(period_start)
    .bind(period_end)
    .bind(amount_minor)
    .bind(currency)
    .bind(due_at)
    .fetch_optional(executor)
    .await
}

pub async fn get(
    executor: impl PgExecutor<'_>,
    id: Uuid,
) -> Result<Option<Invoice>, sqlx::Error> {
    sqlx::query_as::<_, Invoice>(&format!("SELECT {COLUMNS} FROM invoices WHERE id = $1"))
        .bind(id)
        .fetch_optional(executor)
        .await
}

/// Invoices past due date plus grace; their subscriptions are suspension
/// candidates.
pub async fn overdue(
    executor: impl PgExecutor<'_>,
    grace_days: i64,
) -> Result<Vec<Invoice>, sqlx::Error> {
    let cutoff = Utc::now() - Duration::days(grace_days);
    sqlx::query_as::<_, Invoice>(&format!(
        r#"
        SELECT {COLUMNS} FROM invoices
        WHERE status IN ('open', 'overdue') AND due_at < $1
        ORDER BY due_at
        "#
    ))
    .bind(cutoff)
    .fetch_all(executor)
    .await
}

pub async fn mark_overdue(
    executor: impl PgExecutor<'_>,
    id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE invoices
        SET status = 'overdue', updated_at = now()
        WHERE id = $1 AND status = 'open'
        "#,
    )
    .bind(id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn mark_paid(
    executor: impl PgExecutor<'_>,
    id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE invoices
        SET status = 'paid', updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .execute(executor)
    .await?;
    Ok(())
}
