//! Integration suite. One binary (faster linking); each test gets its own
//! randomly named database via `helpers::spawn_app`, and queue workers are
//! driven explicitly with `try_execute_one` so runs are deterministic.

mod control;
mod health_check;
mod helpers;
mod provisioning;
mod queue;
mod sweeps;
mod webhooks;
