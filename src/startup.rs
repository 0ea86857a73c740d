use std::net::TcpListener;

use actix_web::dev::Server;
use actix_web::web;
use actix_web::web::Data;
use actix_web::App;
use actix_web::HttpServer;
use actix_web_lab::middleware::from_fn;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_actix_web::TracingLogger;

use crate::authentication::reject_non_admin;
use crate::authentication::AdminToken;
use crate::configuration::DatabaseSettings;
use crate::configuration::Settings;
use crate::routes::forget_idempotency;
use crate::routes::get_task;
use crate::routes::health_check;
use crate::routes::list_tasks;
use crate::routes::payments_webhook;
use crate::routes::queue_statistics;
use crate::routes::replay_task;

/// Wrapper for actix's `Server` with access to the bound port (the OS picks
/// one when the configured port is 0, as in tests).
pub struct Application {
    port: u16,
    server: Server,
}

impl Application {
    pub async fn build(cfg: Settings) -> Result<Self, anyhow::Error> {
        let addr = format!("{}:{}", cfg.application.host, cfg.application.port);
        let listener = TcpListener::bind(addr)?;
        let port = listener.local_addr()?.port();

        let pool = get_connection_pool(&cfg.database);
        let server = run(listener, pool, cfg).await?;

        Ok(Self { port, server })
    }

    pub fn get_port(&self) -> u16 { self.port }

    /// Because this consumes `self`, this should be the final function call
    /// (or passed to `tokio::spawn`)
    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> { self.server.await }
}

pub fn get_connection_pool(db_cfg: &DatabaseSettings) -> PgPool {
    PgPoolOptions::new().connect_lazy_with(db_cfg.connection())
}

/// Declares all API endpoints. The server only listens; binding happened in
/// `Application::build`.
pub async fn run(
    listener: TcpListener,
    pool: PgPool,
    cfg: Settings,
) -> Result<Server, anyhow::Error> {
    let admin_token = Data::new(AdminToken(cfg.application.admin_token.clone()));
    let pool = Data::new(pool);
    let settings = Data::new(cfg);

    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .route("/health_check", web::get().to(health_check))
            .route("/webhooks/payments", web::post().to(payments_webhook))
            .service(
                web::scope("/provisioning")
                    .wrap(from_fn(reject_non_admin))
                    .route("/tasks", web::get().to(list_tasks))
                    .route("/tasks/{id}", web::get().to(get_task))
                    .route("/tasks/{id}/replay", web::post().to(replay_task))
                    .route("/stats", web::get().to(queue_statistics))
                    .route(
                        "/idempotency/{scope}/{key}",
                        web::delete().to(forget_idempotency),
                    ),
            )
            .app_data(pool.clone())
            .app_data(settings.clone())
            .app_data(admin_token.clone())
    })
    .listen(listener)?
    .run();

    Ok(server)
}
