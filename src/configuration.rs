use std::time::Duration;

use config::Config;
use config::ConfigError;
use config::FileFormat;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;
use sqlx::postgres::PgConnectOptions;
use sqlx::postgres::PgSslMode;

/// Process-level configuration, read once at start and immutable afterwards.
#[derive(Deserialize, Clone)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub database: DatabaseSettings,
    pub webhook: WebhookSettings,
    pub queue: QueueSettings,
    pub sweeps: SweepSettings,
    pub adapters: AdapterSettings,
}

#[derive(Deserialize, Clone)]
pub struct ApplicationSettings {
    pub host: String,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    pub base_url: String,
    /// Bearer token required by the task control endpoints.
    pub admin_token: Secret<String>,
}

#[derive(Deserialize, Clone)]
pub struct DatabaseSettings {
    pub username: String,
    pub password: Secret<String>,
    /// Port for the postgres database. This will be different from that of
    /// the server.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    pub host: String,
    pub database_name: String,
    pub require_ssl: bool,
}

impl DatabaseSettings {
    /// Connection options for the application database.
    pub fn connection(&self) -> PgConnectOptions {
        self.connection_without_db().database(&self.database_name)
    }

    /// Connection options for the top-level postgres instance; used by tests
    /// to create throwaway databases.
    pub fn connection_without_db(&self) -> PgConnectOptions {
        let ssl_mode = if self.require_ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        };
        PgConnectOptions::new()
            .host(&self.host)
            .username(&self.username)
            .password(self.password.expose_secret())
            .port(self.port)
            .ssl_mode(ssl_mode)
    }
}

#[derive(Deserialize, Clone)]
pub struct WebhookSettings {
    /// Shared secret for the payment provider's signed webhooks.
    pub signing_secret: Secret<String>,
    /// Signatures with a timestamp outside this window are rejected.
    pub timestamp_tolerance_secs: i64,
}

#[derive(Deserialize, Clone)]
pub struct QueueSettings {
    pub workers: WorkerCounts,
    pub max_attempts: i32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub reservation_ttl_secs: u64,
    pub task_deadline_secs: u64,
}

impl QueueSettings {
    pub fn reservation_ttl(&self) -> Duration { Duration::from_secs(self.reservation_ttl_secs) }

    pub fn task_deadline(&self) -> Duration { Duration::from_secs(self.task_deadline_secs) }
}

/// Worker pool size per queue.
#[derive(Deserialize, Clone)]
pub struct WorkerCounts {
    pub provisioning: usize,
    pub emails: usize,
    pub invoices: usize,
    pub backups: usize,
}

#[derive(Deserialize, Clone)]
pub struct SweepSettings {
    /// Daily fire times, as `HH:MM` in UTC.
    pub billing_at: String,
    pub suspension_at: String,
    pub ssl_reminder_at: String,
    pub backup_cleanup_at: String,
    /// Days past an invoice's due date before suspension kicks in.
    pub grace_days: i64,
    /// Backup records older than this are removed.
    pub retention_days: i64,
    /// Certificates expiring within this window get a reminder.
    pub reminder_window_days: i64,
}

#[derive(Deserialize, Clone)]
pub struct AdapterSettings {
    pub dns: HttpAdapterSettings,
    pub certificate: HttpAdapterSettings,
    pub mail: HttpAdapterSettings,
    pub database: HttpAdapterSettings,
    pub notification: NotificationSettings,
}

/// Shared shape for the HTTP adapters: a base URL, a bearer token, and a
/// per-call timeout.
#[derive(Deserialize, Clone)]
pub struct HttpAdapterSettings {
    pub base_url: String,
    pub api_token: Secret<String>,
    pub timeout_ms: u64,
}

impl HttpAdapterSettings {
    pub fn timeout(&self) -> Duration { Duration::from_millis(self.timeout_ms) }
}

#[derive(Deserialize, Clone)]
pub struct NotificationSettings {
    pub base_url: String,
    pub sender_email: String,
    pub authorization_token: Secret<String>,
    pub timeout_ms: u64,
}

impl NotificationSettings {
    pub fn timeout(&self) -> Duration { Duration::from_millis(self.timeout_ms) }
}

/// Loads `configuration.yaml` from the working directory, then applies
/// environment overrides of the form `APP__APPLICATION__PORT=8080`. All
/// fields must be present after merging, otherwise initialisation fails
/// immediately, and the server will not start.
pub fn get_configuration() -> Result<Settings, ConfigError> {
    let settings = Config::builder()
        .add_source(config::File::new("configuration.yaml", FileFormat::Yaml))
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("__")
                .separator("__"),
        )
        .build()?;
    settings.try_deserialize()
}
