use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Payload of a `provisioning` job. The cleartext temporary password rides
/// here (and only here) so the notify step can transmit it exactly once; it
/// must never be logged or copied into step results.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProvisioningJob {
    pub task_id: Uuid,
    pub subscription_id: Uuid,
    pub customer_id: Uuid,
    pub temporary_password: String,
}

/// Payload of an `emails` job.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmailJob {
    SslExpiryReminder { certificate_id: Uuid },
    InvoiceIssued { invoice_id: Uuid },
}

/// Payload of an `invoices` job.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvoiceJob {
    GenerateInvoice { subscription_id: Uuid },
    SuspendDelinquent { subscription_id: Uuid, invoice_id: Uuid },
}

/// Payload of a `backups` job.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackupJob {
    CleanupExpired { retention_days: i64 },
}
