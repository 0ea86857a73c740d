use sqlx::PgExecutor;
use uuid::Uuid;

/// Store a login record for a new customer. Only the PHC hash ever reaches
/// this table; the cleartext travels exclusively inside the provisioning job
/// payload for the one-shot welcome notification.
pub async fn insert(
    executor: impl PgExecutor<'_>,
    customer_id: Uuid,
    email: &str,
    password_hash: &str,
) -> Result<Uuid, sqlx::Error> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO user_credentials (id, customer_id, email, password_hash)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(id)
    .bind(customer_id)
    .bind(email)
    .bind(password_hash)
    .execute(executor)
    .await?;
    Ok(id)
}
