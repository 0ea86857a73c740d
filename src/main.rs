use std::fmt::Debug;
use std::fmt::Display;
use std::sync::Arc;

use hostforge::adapters::Adapters;
use hostforge::configuration::get_configuration;
use hostforge::idempotency::init_expiry_worker;
use hostforge::startup::Application;
use hostforge::sweeps::run_sweeps_until_stopped;
use hostforge::telemetry::get_subscriber;
use hostforge::telemetry::init_subscriber;
use hostforge::workers::spawn_worker_pools;
use tokio::task::JoinError;

fn report_exit(
    name: &str,
    outcome: Result<Result<(), impl Debug + Display>, JoinError>,
) {
    match outcome {
        Ok(Ok(())) => {
            tracing::info!("{name} exited gracefully")
        }

        Ok(Err(e)) => {
            tracing::error!(
                error.cause_chain = ?e,
                error.message = %e,
                "{name} failed (inner)"
            )
        }

        Err(e) => {
            tracing::error!(
                error.cause_chain = ?e,
                error.message = %e,
                "{name} failed (outer)"
            )
        }
    }
}

/// Initialise telemetry, load config, and start the API plus the worker
/// pools, the sweep scheduler, and the idempotency-expiry worker.
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let subscriber = get_subscriber("hostforge", "info", std::io::stdout);
    init_subscriber(subscriber);

    let cfg = get_configuration()?;
    let adapters = Arc::new(Adapters::from_settings(&cfg.adapters));

    let server = Application::build(cfg.clone()).await?.run_until_stopped();
    let sweeper = run_sweeps_until_stopped(cfg.clone());
    let expiry_worker = init_expiry_worker(cfg.clone());

    // queue workers run detached; their loops only end with the process
    let _worker_handles = spawn_worker_pools(&cfg, adapters);

    let server_thread = tokio::spawn(server);
    let sweeper_thread = tokio::spawn(sweeper);
    let expiry_thread = tokio::spawn(expiry_worker);

    tokio::select! {
        o = server_thread => { report_exit("API", o) },
        o = sweeper_thread => { report_exit("Sweep scheduler", o) },
        o = expiry_thread => { report_exit("Idempotency expiry worker", o) },
    }

    Ok(())
}
