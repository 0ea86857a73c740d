use reqwest::Client;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;

use super::check_response;
use super::AdapterError;
use crate::configuration::HttpAdapterSettings;

/// Client for the mail backend's admin API.
pub struct MailClient {
    http_client: Client,
    base_url: String,
    api_token: Secret<String>,
}

pub struct NewMailbox<'a> {
    pub address: &'a str,
    /// Pre-hashed; the mail backend never sees a cleartext password.
    pub password_hash: &'a str,
    pub quota_mb: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreatedMailbox {
    pub mailbox_id: String,
}

impl MailClient {
    pub fn new(cfg: &HttpAdapterSettings) -> Self {
        Self {
            http_client: Client::builder()
                .timeout(cfg.timeout())
                .build()
                .expect("failed to build mail HTTP client"),
            base_url: cfg.base_url.clone(),
            api_token: cfg.api_token.clone(),
        }
    }

    #[tracing::instrument(skip(self, mailbox), fields(address = %mailbox.address))]
    pub async fn create_mailbox(
        &self,
        mailbox: &NewMailbox<'_>,
        idempotency_key: &str,
    ) -> Result<CreatedMailbox, AdapterError> {
        let response = self
            .http_client
            .post(format!("{}/mailboxes", self.base_url))
            .bearer_auth(self.api_token.expose_secret())
            .header("Idempotency-Key", idempotency_key)
            .json(&serde_json::json!({
                "address": mailbox.address,
                "password_hash": mailbox.password_hash,
                "quota_mb": mailbox.quota_mb,
            }))
            .send()
            .await;
        let response = check_response(response, "mail create_mailbox").await?;
        response.json::<CreatedMailbox>().await.map_err(|e| {
            AdapterError::Retryable(anyhow::anyhow!("mail create_mailbox: bad body: {e}"))
        })
    }

    #[tracing::instrument(skip(self, password_hash), fields(%mailbox_id))]
    pub async fn change_password(
        &self,
        mailbox_id: &str,
        password_hash: &str,
    ) -> Result<(), AdapterError> {
        let response = self
            .http_client
            .patch(format!("{}/mailboxes/{mailbox_id}", self.base_url))
            .bearer_auth(self.api_token.expose_secret())
            .json(&serde_json::json!({ "password_hash": password_hash }))
            .send()
            .await;
        check_response(response, "mail change_password").await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(%mailbox_id))]
    pub async fn set_quota(
        &self,
        mailbox_id: &str,
        quota_mb: i64,
    ) -> Result<(), AdapterError> {
        let response = self
            .http_client
            .patch(format!("{}/mailboxes/{mailbox_id}", self.base_url))
            .bearer_auth(self.api_token.expose_secret())
            .json(&serde_json::json!({ "quota_mb": quota_mb }))
            .send()
            .await;
        check_response(response, "mail set_quota").await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(%mailbox_id))]
    pub async fn delete(
        &self,
        mailbox_id: &str,
    ) -> Result<(), AdapterError> {
        let response = self
            .http_client
            .delete(format!("{}/mailboxes/{mailbox_id}", self.base_url))
            .bearer_auth(self.api_token.expose_secret())
            .send()
            .await
            .map_err(|e| {
                AdapterError::Retryable(anyhow::anyhow!("mail delete: transport failure: {e}"))
            })?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_response(Ok(response), "mail delete").await?;
        Ok(())
    }
}
