mod health_check;
mod provisioning;
mod webhooks;

pub use health_check::health_check;
pub use provisioning::forget_idempotency;
pub use provisioning::get_task;
pub use provisioning::list_tasks;
pub use provisioning::queue_statistics;
pub use provisioning::replay_task;
pub use webhooks::payments_webhook;
