// this worker is solely responsible for periodically dropping idempotency
// rows whose expires_at has passed

use std::time::Duration;

use sqlx::PgPool;

use crate::configuration::Settings;
use crate::startup::get_connection_pool;

async fn expire_old_keys(pool: &PgPool) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"
        DELETE FROM idempotency
        WHERE expires_at < now()
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn expire_keys_loop(pool: &PgPool) -> Result<(), anyhow::Error> {
    loop {
        match expire_old_keys(pool).await {
            Err(_) => tokio::time::sleep(Duration::from_secs(60)).await,
            Ok(_) => tokio::time::sleep(Duration::from_secs(600)).await,
        }
    }
}

/// To be run as a separate worker, outside the main API
pub async fn init_expiry_worker(cfg: Settings) -> Result<(), anyhow::Error> {
    let pool = get_connection_pool(&cfg.database);
    expire_keys_loop(&pool).await
}
