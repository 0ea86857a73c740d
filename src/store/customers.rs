use chrono::DateTime;
use chrono::Utc;
use sqlx::PgExecutor;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Customer {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub display_name: String,
    pub phone: Option<String>,
    pub billing_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One customer per `(tenant, email)`. A second checkout for a known email
/// returns the existing row instead of erroring; the uniqueness constraint
/// folds into success here.
pub async fn upsert_by_email(
    executor: impl PgExecutor<'_>,
    tenant_id: Uuid,
    email: &str,
    display_name: &str,
) -> Result<Customer, sqlx::Error> {
    sqlx::query_as::<_, Customer>(
        r#"
        INSERT INTO customers (id, tenant_id, email, display_name)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (tenant_id, email)
            DO UPDATE SET updated_at = now()
        RETURNING id, tenant_id, email, display_name, phone, billing_address,
                  created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(tenant_id)
    .bind(email)
    .bind(display_name)
    .fetch_one(executor)
    .await
}

pub async fn get(
    executor: impl PgExecutor<'_>,
    id: Uuid,
) -> Result<Option<Customer>, sqlx::Error> {
    sqlx::query_as::<_, Customer>(
        r#"
        SELECT id, tenant_id, email, display_name, phone, billing_address,
               created_at
        FROM customers
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await
}
