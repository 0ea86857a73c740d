use reqwest::Client;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Serialize;

use super::check_response;
use super::AdapterError;
use crate::configuration::NotificationSettings;
use crate::domain::EmailAddress;

/// Client for the transactional mail API that delivers customer-facing
/// notifications (welcome message, reminders, invoice notices).
pub struct NotificationClient {
    http_client: Client,
    base_url: String,
    sender: String,
    authorization_token: Secret<String>,
}

/// Everything the welcome message carries. The temporary password is
/// transmitted here exactly once and must never appear anywhere else.
pub struct WelcomeEmail<'a> {
    pub to: &'a EmailAddress,
    pub customer_name: &'a str,
    pub domain: &'a str,
    pub temporary_password: &'a str,
    pub control_panel_url: &'a str,
    pub nameservers: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text_body: &'a str,
}

impl NotificationClient {
    pub fn new(cfg: &NotificationSettings) -> Self {
        Self {
            http_client: Client::builder()
                .timeout(cfg.timeout())
                .build()
                .expect("failed to build notification HTTP client"),
            base_url: cfg.base_url.clone(),
            sender: cfg.sender_email.clone(),
            authorization_token: cfg.authorization_token.clone(),
        }
    }

    /// One-shot welcome notification at the end of provisioning.
    #[tracing::instrument(skip_all, fields(domain = %welcome.domain))]
    pub async fn send_welcome(
        &self,
        welcome: &WelcomeEmail<'_>,
        idempotency_key: &str,
    ) -> Result<(), AdapterError> {
        let subject = format!("Your hosting for {} is ready", welcome.domain);
        let body = format!(
            "Hello {name},\n\n\
             Your website {domain} has been set up.\n\n\
             Control panel: {panel}\n\
             Username: see the control panel invitation\n\
             Temporary password: {password}\n\
             Please change it after your first login.\n\n\
             Point your domain at these nameservers:\n{nameservers}\n",
            name = welcome.customer_name,
            domain = welcome.domain,
            panel = welcome.control_panel_url,
            password = welcome.temporary_password,
            nameservers = welcome.nameservers.join("\n"),
        );
        self.send(welcome.to, &subject, &body, idempotency_key).await
    }

    /// Generic transactional send, used by the reminder and invoice jobs.
    #[tracing::instrument(skip_all, fields(subject))]
    pub async fn send(
        &self,
        to: &EmailAddress,
        subject: &str,
        text_body: &str,
        idempotency_key: &str,
    ) -> Result<(), AdapterError> {
        let request = SendEmailRequest {
            from: &self.sender,
            to: to.as_ref(),
            subject,
            text_body,
        };
        let response = self
            .http_client
            .post(format!("{}/email", self.base_url))
            .header(
                "X-Server-Token",
                self.authorization_token.expose_secret().as_str(),
            )
            .header("Idempotency-Key", idempotency_key)
            .json(&request)
            .send()
            .await;
        match check_response(response, "notification send").await {
            Ok(_) => Ok(()),
            // the transport already delivered this key once; good enough
            Err(AdapterError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
