use chrono::DateTime;
use chrono::Utc;
use reqwest::Client;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;

use super::check_response;
use super::AdapterError;
use crate::configuration::HttpAdapterSettings;

/// Client for the certificate issuer's ordering API. The ACME challenge
/// dance happens behind this endpoint; we only ever see issued-or-not.
pub struct CertificateClient {
    http_client: Client,
    base_url: String,
    api_token: Secret<String>,
}

#[derive(Debug, Deserialize)]
pub struct IssuedCertificate {
    pub cert_id: String,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: DateTime<Utc>,
}

impl CertificateClient {
    pub fn new(cfg: &HttpAdapterSettings) -> Self {
        Self {
            http_client: Client::builder()
                .timeout(cfg.timeout())
                .build()
                .expect("failed to build certificate HTTP client"),
            base_url: cfg.base_url.clone(),
            api_token: cfg.api_token.clone(),
        }
    }

    #[tracing::instrument(skip(self), fields(%domain))]
    pub async fn issue(
        &self,
        domain: &str,
        contact_email: &str,
        idempotency_key: &str,
    ) -> Result<IssuedCertificate, AdapterError> {
        let response = self
            .http_client
            .post(format!("{}/certificates", self.base_url))
            .bearer_auth(self.api_token.expose_secret())
            .header("Idempotency-Key", idempotency_key)
            .json(&serde_json::json!({
                "domain": domain,
                "contact_email": contact_email,
            }))
            .send()
            .await;
        let response = check_response(response, "certificate issue").await?;
        response.json::<IssuedCertificate>().await.map_err(|e| {
            AdapterError::Retryable(anyhow::anyhow!("certificate issue: bad body: {e}"))
        })
    }

    #[tracing::instrument(skip(self), fields(%cert_id))]
    pub async fn renew(
        &self,
        cert_id: &str,
    ) -> Result<IssuedCertificate, AdapterError> {
        let response = self
            .http_client
            .post(format!("{}/certificates/{cert_id}/renew", self.base_url))
            .bearer_auth(self.api_token.expose_secret())
            .send()
            .await;
        let response = check_response(response, "certificate renew").await?;
        response.json::<IssuedCertificate>().await.map_err(|e| {
            AdapterError::Retryable(anyhow::anyhow!("certificate renew: bad body: {e}"))
        })
    }

    #[tracing::instrument(skip(self), fields(%cert_id))]
    pub async fn revoke(
        &self,
        cert_id: &str,
    ) -> Result<(), AdapterError> {
        let response = self
            .http_client
            .delete(format!("{}/certificates/{cert_id}", self.base_url))
            .bearer_auth(self.api_token.expose_secret())
            .send()
            .await
            .map_err(|e| {
                AdapterError::Retryable(anyhow::anyhow!(
                    "certificate revoke: transport failure: {e}"
                ))
            })?;
        // revoking a certificate that is already gone is fine
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_response(Ok(response), "certificate revoke").await?;
        Ok(())
    }
}
