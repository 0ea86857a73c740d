use chrono::DateTime;
use chrono::Utc;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::domain::BillingPeriod;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "subscription_status", rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Suspended,
    Cancelled,
}

/// Recurring entitlement. Stays `pending` until a provisioning task for it
/// succeeds; a dead-lettered first provisioning leaves it `pending` for
/// staff to replay.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub product_code: String,
    pub billing_period: BillingPeriod,
    pub price_minor: i64,
    pub status: SubscriptionStatus,
    pub next_billing_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

const COLUMNS: &str = "id, tenant_id, customer_id, product_code, billing_period, \
                       price_minor, status, next_billing_at, metadata, created_at";

#[allow(clippy::too_many_arguments)]
pub async fn insert(
    executor: impl PgExecutor<'_>,
    tenant_id: Uuid,
    customer_id: Uuid,
    product_code: &str,
    billing_period: BillingPeriod,
    price_minor: i64,
    next_billing_at: DateTime<Utc>,
    metadata: serde_json::Value,
) -> Result<Uuid, sqlx::Error> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO subscriptions
            (id, tenant_id, customer_id, product_code, billing_period,
             price_minor, next_billing_at, metadata)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(id)
    .bind(tenant_id)
    .bind(customer_id)
    .bind(product_code)
    .bind(billing_period)
    .bind(price_minor)
    .bind(next_billing_at)
    .bind(metadata)
    .execute(executor)
    .await?;
    Ok(id)
}

pub async fn get(
    executor: impl PgExecutor<'_>,
    id: Uuid,
) -> Result<Option<Subscription>, sqlx::Error> {
    sqlx::query_as::<_, Subscription>(&format!(
        "SELECT {COLUMNS} FROM subscriptions WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(executor)
    .await
}

/// `pending -> active`, once the first provisioning task succeeds.
pub async fn activate(
    executor: impl PgExecutor<'_>,
    id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE subscriptions
        SET status = 'active', updated_at = now()
        WHERE id = $1 AND status = 'pending'
        "#,
    )
    .bind(id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn set_status(
    executor: impl PgExecutor<'_>,
    id: Uuid,
    status: SubscriptionStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE subscriptions
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

/// Subscriptions whose next billing instant falls within `horizon`; the
/// billing sweep turns each into (at most) one invoice per cycle.
pub async fn due_for_billing(
    executor: impl PgExecutor<'_>,
    horizon: DateTime<Utc>,
) -> Result<Vec<Subscription>, sqlx::Error> {
    sqlx::query_as::<_, Subscription>(&format!(
        r#"
        SELECT {COLUMNS} FROM subscriptions
        WHERE status = 'active' AND next_billing_at <= $1
        ORDER BY next_billing_at
        "#
    ))
    .bind(horizon)
    .fetch_all(executor)
    .await
}

/// Move `next_billing_at` forward one period; called when the cycle's
/// invoice is confirmed paid.
pub async fn advance_next_billing(
    executor: impl PgExecutor<'_>,
    id: Uuid,
    period: BillingPeriod,
    from: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE subscriptions
        SET next_billing_at = $2, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(period.advance(from))
    .execute(executor)
    .await?;
    Ok(())
}

/// Tenant-scoped counter feeding hosting-username derivation.
pub async fn count_for_tenant(
    executor: impl PgExecutor<'_>,
    tenant_id: Uuid,
) -> Result<i64, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as(
        r#"
        SELECT count(*) FROM subscriptions WHERE tenant_id = $1
        "#,
    )
    .bind(tenant_id)
    .fetch_one(executor)
    .await?;
    Ok(count)
}
