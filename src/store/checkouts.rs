use chrono::DateTime;
use chrono::Utc;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::domain::BillingPeriod;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "checkout_status", rename_all = "lowercase")]
pub enum CheckoutStatus {
    Pending,
    Completed,
    Abandoned,
    Failed,
}

/// One purchase attempt, created by the (external) checkout intent endpoint
/// and completed only by the payment webhook. Terminal rows never change.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CheckoutSession {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub external_session_id: String,
    pub customer_email: String,
    pub product_code: String,
    pub billing_period: BillingPeriod,
    pub amount_minor: i64,
    pub currency: String,
    pub status: CheckoutStatus,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub async fn get_by_external_id(
    executor: impl PgExecutor<'_>,
    external_session_id: &str,
) -> Result<Option<CheckoutSession>, sqlx::Error> {
    sqlx::query_as::<_, CheckoutSession>(
        r#"
        SELECT id, tenant_id, external_session_id, customer_email, product_code,
               billing_period, amount_minor, currency, status, metadata,
               created_at, completed_at
        FROM checkout_sessions
        WHERE external_session_id = $1
        "#,
    )
    .bind(external_session_id)
    .fetch_optional(executor)
    .await
}

#[allow(clippy::too_many_arguments)]
pub async fn insert(
    executor: impl PgExecutor<'_>,
    tenant_id: Uuid,
    external_session_id: &str,
    customer_email: &str,
    product_code: &str,
    billing_period: BillingPeriod,
    amount_minor: i64,
    currency: &str,
    metadata: serde_json::Value,
) -> Result<Uuid, sqlx::Error> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO checkout_sessions
            (id, tenant_id, external_session_id, customer_email, product_code,
             billing_period, amount_minor, currency, metadata)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(id)
    .bind(tenant_id)
    .bind(external_session_id)
    .bind(customer_email)
    .bind(product_code)
    .bind(billing_period)
    .bind(amount_minor)
    .bind(currency)
    .bind(metadata)
    .execute(executor)
    .await?;
    Ok(id)
}

/// The payment event that materialised a subscription, found back through
/// the checkout session it completed. Task replay reopens this event's
/// dedup record so a provider redelivery re-runs instead of replaying the
/// stale stored outcome.
pub async fn originating_event_id(
    executor: impl PgExecutor<'_>,
    subscription_id: Uuid,
) -> Result<Option<String>, sqlx::Error> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        SELECT w.external_event_id
        FROM subscriptions s
        JOIN checkout_sessions c ON c.id = (s.metadata->>'checkoutId')::uuid
        JOIN webhook_events w
          ON w.kind = 'checkout.completed'
         AND w.payload->>'sessionId' = c.external_session_id
        WHERE s.id = $1
        ORDER BY w.received_at DESC
        LIMIT 1
        "#,
    )
    .bind(subscription_id)
    .fetch_optional(executor)
    .await?;
    Ok(row.map(|(event_id,)| event_id))
}

/// `pending -> completed`, guarded so a terminal row is never rewritten.
pub async fn complete(
    executor: impl PgExecutor<'_>,
    id: Uuid,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        r#"
        UPDATE checkout_sessions
        SET status = 'completed', completed_at = now(), updated_at = now()
        WHERE id = $1 AND status = 'pending'
        "#,
    )
    .bind(id)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(updated > 0)
}
