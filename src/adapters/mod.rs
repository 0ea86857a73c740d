//! Clients for the external collaborators. Each adapter is the only code
//! allowed to talk to its backend, takes an idempotency key on every
//! mutating call, and collapses whatever the native protocol returns into
//! the one classification the orchestrator understands.

mod certificate;
mod database;
mod dns;
mod hosting;
mod mail;
mod notification;

use std::time::Duration;

pub use certificate::CertificateClient;
pub use certificate::IssuedCertificate;
pub use database::DatabaseClient;
pub use database::NewDatabase;
pub use database::ProvisionedDatabase;
pub use dns::DnsClient;
pub use dns::DnsRecord;
pub use dns::RecordType;
pub use dns::Zone;
pub use hosting::AccountInfo;
pub use hosting::CreateAccount;
pub use hosting::HostingClient;
pub use mail::CreatedMailbox;
pub use mail::MailClient;
pub use mail::NewMailbox;
pub use notification::NotificationClient;
pub use notification::WelcomeEmail;

use crate::configuration::AdapterSettings;
use crate::store::Server;

/// Every adapter failure lands in exactly one of these buckets; raw
/// transport errors never leave this module unclassified.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Network trouble, 5xx, rate limits: worth another attempt.
    #[error("retryable adapter failure")]
    Retryable(#[source] anyhow::Error),
    /// Validation and other permanent rejections: retrying cannot help.
    #[error("fatal adapter failure")]
    Fatal(#[source] anyhow::Error),
    /// The resource is already there (an earlier attempt got through);
    /// carries whatever the backend told us about the existing resource.
    #[error("resource already exists")]
    AlreadyExists(serde_json::Value),
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool { matches!(self, Self::Retryable(_)) }
}

/// Map a reqwest outcome to the classification. 409 means an earlier
/// attempt with the same idempotency key landed; its body (when JSON)
/// describes the existing resource.
pub(crate) async fn check_response(
    result: Result<reqwest::Response, reqwest::Error>,
    what: &'static str,
) -> Result<reqwest::Response, AdapterError> {
    let response = result.map_err(|e| {
        AdapterError::Retryable(anyhow::anyhow!("{what}: transport failure: {e}"))
    })?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::CONFLICT {
        let existing = response.json().await.unwrap_or(serde_json::Value::Null);
        return Err(AdapterError::AlreadyExists(existing));
    }
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(AdapterError::Retryable(anyhow::anyhow!(
            "{what}: backend returned {status}"
        )));
    }
    Err(AdapterError::Fatal(anyhow::anyhow!(
        "{what}: backend rejected the request with {status}"
    )))
}

/// The adapter bundle built once at startup. Hosting clients are the
/// exception: their endpoint and credentials live on the server row, so
/// they are constructed per placement.
pub struct Adapters {
    pub dns: DnsClient,
    pub certificate: CertificateClient,
    pub mail: MailClient,
    pub database: DatabaseClient,
    pub notification: NotificationClient,
    hosting_timeout: Duration,
}

impl Adapters {
    pub fn from_settings(cfg: &AdapterSettings) -> Self {
        Self {
            dns: DnsClient::new(&cfg.dns),
            certificate: CertificateClient::new(&cfg.certificate),
            mail: MailClient::new(&cfg.mail),
            database: DatabaseClient::new(&cfg.database),
            notification: NotificationClient::new(&cfg.notification),
            // hosting backends use the same per-call timeout as dns
            hosting_timeout: cfg.dns.timeout(),
        }
    }

    /// The control-panel client for a concrete server; selection is static
    /// given the server row.
    pub fn hosting_for(
        &self,
        server: &Server,
    ) -> HostingClient {
        HostingClient::for_server(server, self.hosting_timeout)
    }
}
