use reqwest::Client;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;
use serde::Serialize;

use super::check_response;
use super::AdapterError;
use crate::configuration::HttpAdapterSettings;

/// Client for the authoritative DNS server's management API.
pub struct DnsClient {
    http_client: Client,
    base_url: String,
    api_token: Secret<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    A,
    Aaaa,
    Cname,
    Mx,
    Txt,
    Ns,
    Srv,
    Caa,
}

#[derive(Debug, Serialize)]
pub struct DnsRecord<'a> {
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub name: &'a str,
    pub content: &'a str,
    pub ttl: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct Zone {
    pub zone_id: String,
}

impl DnsClient {
    pub fn new(cfg: &HttpAdapterSettings) -> Self {
        Self {
            http_client: Client::builder()
                .timeout(cfg.timeout())
                .build()
                .expect("failed to build DNS HTTP client"),
            base_url: cfg.base_url.clone(),
            api_token: cfg.api_token.clone(),
        }
    }

    #[tracing::instrument(skip(self), fields(%domain))]
    pub async fn create_zone(
        &self,
        domain: &str,
        nameservers: &[String],
        idempotency_key: &str,
    ) -> Result<Zone, AdapterError> {
        let response = self
            .http_client
            .post(format!("{}/zones", self.base_url))
            .bearer_auth(self.api_token.expose_secret())
            .header("Idempotency-Key", idempotency_key)
            .json(&serde_json::json!({
                "domain": domain,
                "nameservers": nameservers,
            }))
            .send()
            .await;
        let response = check_response(response, "dns create_zone").await?;
        response
            .json::<Zone>()
            .await
            .map_err(|e| AdapterError::Retryable(anyhow::anyhow!("dns create_zone: bad body: {e}")))
    }

    #[tracing::instrument(skip(self, record), fields(%zone_id))]
    pub async fn add_record(
        &self,
        zone_id: &str,
        record: &DnsRecord<'_>,
        idempotency_key: &str,
    ) -> Result<(), AdapterError> {
        let response = self
            .http_client
            .post(format!("{}/zones/{zone_id}/records", self.base_url))
            .bearer_auth(self.api_token.expose_secret())
            .header("Idempotency-Key", idempotency_key)
            .json(record)
            .send()
            .await;
        match check_response(response, "dns add_record").await {
            Ok(_) => Ok(()),
            // a record that already exists is exactly what we wanted
            Err(AdapterError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[tracing::instrument(skip(self), fields(%zone_id))]
    pub async fn delete_zone(
        &self,
        zone_id: &str,
    ) -> Result<(), AdapterError> {
        let response = self
            .http_client
            .delete(format!("{}/zones/{zone_id}", self.base_url))
            .bearer_auth(self.api_token.expose_secret())
            .send()
            .await
            .map_err(|e| {
                AdapterError::Retryable(anyhow::anyhow!("dns delete_zone: transport failure: {e}"))
            })?;
        // already gone counts as deleted
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_response(Ok(response), "dns delete_zone").await?;
        Ok(())
    }
}
