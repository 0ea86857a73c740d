pub mod adapters;
pub mod authentication;
pub mod configuration;
pub mod domain;
pub mod idempotency;
pub mod orchestrator;
pub mod queue;
pub mod routes;
pub mod signature;
pub mod startup;
pub mod store;
pub mod sweeps;
pub mod telemetry;
pub mod utils;
pub mod workers;
