//! Durable, Postgres-backed job queue. Enqueues ride the caller's
//! transaction so a job exists exactly when the rows that triggered it do;
//! claims use `FOR UPDATE SKIP LOCKED` so workers never double-run a live
//! reservation.

mod jobs;
mod payloads;

pub use jobs::backoff_delay;
pub use jobs::claim;
pub use jobs::complete;
pub use jobs::defer;
pub use jobs::enqueue;
pub use jobs::extend;
pub use jobs::fail;
pub use jobs::find_dead_lettered_for_task;
pub use jobs::queue_stats;
pub use jobs::replay;
pub use jobs::EnqueueOptions;
pub use jobs::FailureKind;
pub use jobs::Job;
pub use jobs::JobStatus;
pub use jobs::QueueCounters;
pub use jobs::QueueError;
pub use jobs::QueueName;
pub use payloads::BackupJob;
pub use payloads::EmailJob;
pub use payloads::InvoiceJob;
pub use payloads::ProvisioningJob;
