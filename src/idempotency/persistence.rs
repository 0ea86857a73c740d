use chrono::Duration;
use chrono::Utc;
use sqlx::PgPool;
use sqlx::Postgres;
use sqlx::Row;
use sqlx::Transaction;

use super::IdempotencyKey;

// In-memory locks (e.g. tokio::sync::Mutex) would work if all incoming
// requests were served by a single instance. The webhook endpoint is
// replicated behind a load balancer, so the synchronisation mechanism has to
// live out-of-process - the database's uniqueness constraint on
// (scope, external_key) is it.
/// Used to achieve concurrency on a database level
pub enum NextAction {
    /// This caller won the insert; do the work inside the transaction and
    /// finish with [`save_outcome`].
    StartProcessing(Transaction<'static, Postgres>),
    /// A previous caller already completed this operation; here is what it
    /// produced.
    ReturnSavedOutcome(serde_json::Value),
}

#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    /// The backing store cannot be reached; callers surface this as 5xx so
    /// the producer retries.
    #[error("idempotency store unavailable")]
    StorageUnavailable(#[from] sqlx::Error),
    /// A concurrent caller holds the marker but has not stored an outcome
    /// yet. Retrying after its commit returns the saved outcome.
    #[error("operation for this key is already in flight")]
    InFlight,
}

/// Begin a transaction and try to insert a marker row (without an outcome).
/// Exactly one concurrent caller for a `(scope, key)` pair wins the insert
/// and gets to do the work; everyone else gets the stored outcome, or
/// [`IdempotencyError::InFlight`] while the winner is still running. Expired
/// markers are reclaimed in place.
pub async fn try_begin(
    scope: &str,
    key: &IdempotencyKey,
    ttl: Duration,
    pool: &PgPool,
) -> Result<NextAction, IdempotencyError> {
    let mut transaction = pool.begin().await?;
    let expires_at = Utc::now() + ttl;

    let inserted = sqlx::query(
        r#"
        INSERT INTO idempotency (scope, external_key, expires_at)
        VALUES ($1, $2, $3)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(scope)
    .bind(key.as_ref())
    .bind(expires_at)
    .execute(&mut *transaction)
    .await?
    .rows_affected()
        > 0;

    if inserted {
        return Ok(NextAction::StartProcessing(transaction));
    }

    // lost the insert: lock the existing row and inspect it
    let row = sqlx::query(
        r#"
        SELECT outcome, expires_at
        FROM idempotency
        WHERE scope = $1 AND external_key = $2
        FOR UPDATE
        "#,
    )
    .bind(scope)
    .bind(key.as_ref())
    .fetch_optional(&mut *transaction)
    .await?;

    let Some(row) = row else {
        // the winning row was rolled back between our insert and select;
        // treat as in-flight and let the caller retry
        return Err(IdempotencyError::InFlight);
    };

    let stored_expiry: chrono::DateTime<Utc> = row.get("expires_at");
    if stored_expiry <= Utc::now() {
        // expired marker: reclaim it for this caller
        sqlx::query(
            r#"
            UPDATE idempotency
            SET outcome = NULL, created_at = now(), expires_at = $3
            WHERE scope = $1 AND external_key = $2
            "#,
        )
        .bind(scope)
        .bind(key.as_ref())
        .bind(expires_at)
        .execute(&mut *transaction)
        .await?;
        return Ok(NextAction::StartProcessing(transaction));
    }

    match row.get::<Option<serde_json::Value>, _>("outcome") {
        Some(outcome) => Ok(NextAction::ReturnSavedOutcome(outcome)),
        None => Err(IdempotencyError::InFlight),
    }
}

/// Store the outcome against the marker and commit. This is the last action
/// of the protected block: the marker becomes visible to replays only
/// together with everything else the transaction did.
pub async fn save_outcome(
    scope: &str,
    key: &IdempotencyKey,
    outcome: serde_json::Value,
    mut transaction: Transaction<'static, Postgres>,
) -> Result<(), IdempotencyError> {
    sqlx::query(
        r#"
        UPDATE idempotency
        SET outcome = $3
        WHERE scope = $1 AND external_key = $2
        "#,
    )
    .bind(scope)
    .bind(key.as_ref())
    .bind(outcome)
    .execute(&mut *transaction)
    .await?;
    transaction.commit().await?;
    Ok(())
}

/// Remove a record so the next caller re-runs the operation. Administrative
/// replay only; runs on whatever executor the caller holds so it can commit
/// together with the replay itself.
pub async fn forget(
    scope: &str,
    key: &IdempotencyKey,
    executor: impl sqlx::PgExecutor<'_>,
) -> Result<(), IdempotencyError> {
    sqlx::query(
        r#"
        DELETE FROM idempotency
        WHERE scope = $1 AND external_key = $2
        "#,
    )
    .bind(scope)
    .bind(key.as_ref())
    .execute(executor)
    .await?;
    Ok(())
}
