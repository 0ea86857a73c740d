use reqwest::Client;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;

use super::check_response;
use super::AdapterError;
use crate::configuration::HttpAdapterSettings;

/// Client for the relational database engine's provisioning API.
pub struct DatabaseClient {
    http_client: Client,
    base_url: String,
    api_token: Secret<String>,
}

pub struct NewDatabase<'a> {
    pub name: &'a str,
    pub owner: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct ProvisionedDatabase {
    pub connection_string: String,
}

impl DatabaseClient {
    pub fn new(cfg: &HttpAdapterSettings) -> Self {
        Self {
            http_client: Client::builder()
                .timeout(cfg.timeout())
                .build()
                .expect("failed to build database HTTP client"),
            base_url: cfg.base_url.clone(),
            api_token: cfg.api_token.clone(),
        }
    }

    #[tracing::instrument(skip(self, database), fields(name = %database.name))]
    pub async fn create_database(
        &self,
        database: &NewDatabase<'_>,
        idempotency_key: &str,
    ) -> Result<ProvisionedDatabase, AdapterError> {
        let response = self
            .http_client
            .post(format!("{}/databases", self.base_url))
            .bearer_auth(self.api_token.expose_secret())
            .header("Idempotency-Key", idempotency_key)
            .json(&serde_json::json!({
                "name": database.name,
                "owner": database.owner,
                "password": database.password,
            }))
            .send()
            .await;
        let response = check_response(response, "database create").await?;
        response.json::<ProvisionedDatabase>().await.map_err(|e| {
            AdapterError::Retryable(anyhow::anyhow!("database create: bad body: {e}"))
        })
    }

    #[tracing::instrument(skip(self), fields(%name))]
    pub async fn drop_database(
        &self,
        name: &str,
    ) -> Result<(), AdapterError> {
        let response = self
            .http_client
            .delete(format!("{}/databases/{name}", self.base_url))
            .bearer_auth(self.api_token.expose_secret())
            .send()
            .await
            .map_err(|e| {
                AdapterError::Retryable(anyhow::anyhow!("database drop: transport failure: {e}"))
            })?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_response(Ok(response), "database drop").await?;
        Ok(())
    }
}
