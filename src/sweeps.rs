//! Clock-driven producers for the recurring back-office work. A sweep never
//! does the work itself; it enqueues jobs inside the transaction that holds
//! its run marker, so a producer restarted near the scheduled minute cannot
//! double-enqueue.

use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use sqlx::PgPool;
use sqlx::Postgres;
use sqlx::Transaction;

use crate::configuration::Settings;
use crate::idempotency;
use crate::idempotency::IdempotencyKey;
use crate::idempotency::IdempotencyError;
use crate::idempotency::NextAction;
use crate::queue;
use crate::queue::BackupJob;
use crate::queue::EmailJob;
use crate::queue::EnqueueOptions;
use crate::queue::InvoiceJob;
use crate::queue::QueueName;
use crate::startup::get_connection_pool;
use crate::store::certificates;
use crate::store::invoices;
use crate::store::subscriptions;

/// Markers outlive any plausible clock skew, then expire.
const MARKER_TTL_DAYS: i64 = 2;
/// Invoices are raised this many days ahead of the billing instant.
const BILLING_HORIZON_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sweep {
    Billing,
    Suspension,
    SslReminders,
    BackupCleanup,
}

impl Sweep {
    pub fn all() -> [Sweep; 4] {
        [
            Self::Billing,
            Self::Suspension,
            Self::SslReminders,
            Self::BackupCleanup,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Billing => "billing",
            Self::Suspension => "suspension",
            Self::SslReminders => "ssl-reminders",
            Self::BackupCleanup => "backup-cleanup",
        }
    }

    fn fire_at<'a>(
        &self,
        cfg: &'a Settings,
    ) -> &'a str {
        match self {
            Self::Billing => &cfg.sweeps.billing_at,
            Self::Suspension => &cfg.sweeps.suspension_at,
            Self::SslReminders => &cfg.sweeps.ssl_reminder_at,
            Self::BackupCleanup => &cfg.sweeps.backup_cleanup_at,
        }
    }
}

impl std::fmt::Display for Sweep {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// To be run as a separate worker, outside the main API. Ticks twice a
/// minute; the marker absorbs the double fire within a scheduled minute.
pub async fn run_sweeps_until_stopped(cfg: Settings) -> Result<(), anyhow::Error> {
    let pool = get_connection_pool(&cfg.database);
    loop {
        let now = Utc::now();
        for sweep in Sweep::all() {
            if now.format("%H:%M").to_string() == sweep.fire_at(&cfg) {
                if let Err(e) = run_sweep(&pool, &cfg, sweep, now).await {
                    tracing::warn!(
                        error.cause_chain = ?e,
                        error.message = %e,
                        "sweep {sweep} failed"
                    );
                }
            }
        }
        tokio::time::sleep(Duration::from_secs(30)).await;
    }
}

/// Run one sweep for one scheduled minute, exactly once across restarts and
/// replicas. Public so tests can fire sweeps at chosen instants.
#[tracing::instrument(skip(pool, cfg), fields(sweep = %sweep))]
pub async fn run_sweep(
    pool: &PgPool,
    cfg: &Settings,
    sweep: Sweep,
    now: DateTime<Utc>,
) -> Result<(), anyhow::Error> {
    let marker = format!("{}-{}", sweep.name(), now.format("%Y-%m-%d-%H-%M"));
    let key = IdempotencyKey::try_from(marker)?;

    let mut transaction =
        match idempotency::try_begin("sweep", &key, chrono::Duration::days(MARKER_TTL_DAYS), pool)
            .await
        {
            Ok(NextAction::StartProcessing(transaction)) => transaction,
            Ok(NextAction::ReturnSavedOutcome(_)) => {
                tracing::debug!("sweep {sweep} already ran this minute");
                return Ok(());
            }
            Err(IdempotencyError::InFlight) => {
                tracing::debug!("sweep {sweep} is running elsewhere");
                return Ok(());
            }
            Err(IdempotencyError::StorageUnavailable(e)) => return Err(e.into()),
        };

    let enqueued = produce(&mut transaction, cfg, sweep, now).await?;
    idempotency::save_outcome(
        "sweep",
        &key,
        serde_json::json!({ "enqueued": enqueued }),
        transaction,
    )
    .await?;

    tracing::info!("sweep {sweep} enqueued {enqueued} job(s)");
    Ok(())
}

async fn produce(
    transaction: &mut Transaction<'static, Postgres>,
    cfg: &Settings,
    sweep: Sweep,
    now: DateTime<Utc>,
) -> Result<u64, anyhow::Error> {
    let opts = EnqueueOptions {
        max_attempts: cfg.queue.max_attempts,
        backoff_base_secs: cfg.queue.backoff_base_secs as i32,
        ..EnqueueOptions::default()
    };
    let mut enqueued = 0;

    match sweep {
        Sweep::Billing => {
            let horizon = now + chrono::Duration::days(BILLING_HORIZON_DAYS);
            let due = subscriptions::due_for_billing(&mut **transaction, horizon).await?;
            for subscription in due {
                let payload = serde_json::to_value(InvoiceJob::GenerateInvoice {
                    subscription_id: subscription.id,
                })?;
                queue::enqueue(&mut **transaction, QueueName::Invoices, &payload, &opts).await?;
                enqueued += 1;
            }
        }
        Sweep::Suspension => {
            let delinquent = invoices::overdue(&mut **transaction, cfg.sweeps.grace_days).await?;
            for invoice in delinquent {
                let payload = serde_json::to_value(InvoiceJob::SuspendDelinquent {
                    subscription_id: invoice.subscription_id,
                    invoice_id: invoice.id,
                })?;
                queue::enqueue(&mut **transaction, QueueName::Invoices, &payload, &opts).await?;
                enqueued += 1;
            }
        }
        Sweep::SslReminders => {
            let expiring =
                certificates::expiring_within(&mut **transaction, cfg.sweeps.reminder_window_days)
                    .await?;
            for certificate in expiring {
                let payload = serde_json::to_value(EmailJob::SslExpiryReminder {
                    certificate_id: certificate.id,
                })?;
                queue::enqueue(&mut **transaction, QueueName::Emails, &payload, &opts).await?;
                enqueued += 1;
            }
        }
        Sweep::BackupCleanup => {
            let payload = serde_json::to_value(BackupJob::CleanupExpired {
                retention_days: cfg.sweeps.retention_days,
            })?;
            queue::enqueue(&mut **transaction, QueueName::Backups, &payload, &opts).await?;
            enqueued += 1;
        }
    }

    Ok(enqueued)
}
