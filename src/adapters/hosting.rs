use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;

use super::check_response;
use super::AdapterError;
use crate::store::ControlPanelKind;
use crate::store::Server;

pub struct CreateAccount<'a> {
    pub username: &'a str,
    pub domain: &'a str,
    pub password: &'a str,
    pub plan: &'a str,
    pub quota_mb: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountInfo {
    pub account_id: String,
    pub control_panel_url: String,
}

/// One variant per control-panel family. Selection is static given the
/// server row; each variant translates the uniform operations into the
/// panel's native protocol (WHM JSON, Plesk REST, DirectAdmin
/// form-encoded, or our own agent).
pub enum HostingClient {
    Cpanel(WhmClient),
    Plesk(PleskClient),
    Directadmin(DirectAdminClient),
    Native(NativeAgentClient),
}

impl HostingClient {
    pub fn for_server(
        server: &Server,
        timeout: Duration,
    ) -> Self {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build hosting HTTP client");
        match server.control_panel {
            ControlPanelKind::Cpanel => Self::Cpanel(WhmClient {
                http_client,
                base_url: server.base_url.clone(),
                token: server.admin_token.clone(),
                panel_url: format!("https://{}:2083", server.hostname),
            }),
            ControlPanelKind::Plesk => Self::Plesk(PleskClient {
                http_client,
                base_url: server.base_url.clone(),
                token: server.admin_token.clone(),
                panel_url: format!("https://{}:8443", server.hostname),
            }),
            ControlPanelKind::Directadmin => Self::Directadmin(DirectAdminClient {
                http_client,
                base_url: server.base_url.clone(),
                token: server.admin_token.clone(),
                panel_url: format!("https://{}:2222", server.hostname),
            }),
            ControlPanelKind::Native => Self::Native(NativeAgentClient {
                http_client,
                base_url: server.base_url.clone(),
                token: server.admin_token.clone(),
            }),
        }
    }

    pub async fn create_account(
        &self,
        account: &CreateAccount<'_>,
        idempotency_key: &str,
    ) -> Result<AccountInfo, AdapterError> {
        match self {
            Self::Cpanel(c) => c.create_account(account).await,
            Self::Plesk(c) => c.create_account(account, idempotency_key).await,
            Self::Directadmin(c) => c.create_account(account).await,
            Self::Native(c) => c.create_account(account, idempotency_key).await,
        }
    }

    pub async fn suspend(
        &self,
        account_id: &str,
    ) -> Result<(), AdapterError> {
        match self {
            Self::Cpanel(c) => c.account_action("suspendacct", account_id).await,
            Self::Plesk(c) => c.set_status(account_id, "suspended").await,
            Self::Directadmin(c) => c.select_users("dosuspend", account_id).await,
            Self::Native(c) => c.account_action(account_id, "suspend").await,
        }
    }

    pub async fn unsuspend(
        &self,
        account_id: &str,
    ) -> Result<(), AdapterError> {
        match self {
            Self::Cpanel(c) => c.account_action("unsuspendacct", account_id).await,
            Self::Plesk(c) => c.set_status(account_id, "active").await,
            Self::Directadmin(c) => c.select_users("dounsuspend", account_id).await,
            Self::Native(c) => c.account_action(account_id, "unsuspend").await,
        }
    }

    pub async fn terminate(
        &self,
        account_id: &str,
    ) -> Result<(), AdapterError> {
        match self {
            Self::Cpanel(c) => c.account_action("removeacct", account_id).await,
            Self::Plesk(c) => c.delete(account_id).await,
            Self::Directadmin(c) => c.select_users("delete", account_id).await,
            Self::Native(c) => c.terminate(account_id).await,
        }
    }
}

/// WHM's JSON API. Calls succeed at the HTTP layer and report their real
/// outcome in `metadata.result`, so both layers get checked.
pub struct WhmClient {
    http_client: Client,
    base_url: String,
    token: String,
    panel_url: String,
}

#[derive(Deserialize)]
struct WhmResponse {
    metadata: WhmMetadata,
}

#[derive(Deserialize)]
struct WhmMetadata {
    result: i64,
    #[serde(default)]
    reason: String,
}

impl WhmClient {
    fn auth_header(&self) -> String { format!("whm root:{}", self.token) }

    async fn create_account(
        &self,
        account: &CreateAccount<'_>,
    ) -> Result<AccountInfo, AdapterError> {
        // POST keeps the password out of the URL and of access logs
        let response = self
            .http_client
            .post(format!("{}/json-api/createacct", self.base_url))
            .header("Authorization", self.auth_header())
            .form(&[
                ("api.version", "1"),
                ("username", account.username),
                ("domain", account.domain),
                ("password", account.password),
                ("plan", account.plan),
                ("quota", &account.quota_mb.to_string()),
            ])
            .send()
            .await;
        let response = check_response(response, "whm createacct").await?;
        let body: WhmResponse = response.json().await.map_err(|e| {
            AdapterError::Retryable(anyhow::anyhow!("whm createacct: bad body: {e}"))
        })?;
        if body.metadata.result != 1 {
            if body.metadata.reason.to_lowercase().contains("already exists") {
                return Err(AdapterError::AlreadyExists(serde_json::json!({
                    "account_id": account.username,
                    "control_panel_url": self.panel_url,
                })));
            }
            return Err(AdapterError::Fatal(anyhow::anyhow!(
                "whm createacct rejected: {}",
                body.metadata.reason
            )));
        }
        Ok(AccountInfo {
            account_id: account.username.to_string(),
            control_panel_url: self.panel_url.clone(),
        })
    }

    async fn account_action(
        &self,
        action: &str,
        username: &str,
    ) -> Result<(), AdapterError> {
        let response = self
            .http_client
            .post(format!("{}/json-api/{action}", self.base_url))
            .header("Authorization", self.auth_header())
            .form(&[("api.version", "1"), ("user", username)])
            .send()
            .await;
        let response = check_response(response, "whm account action").await?;
        let body: WhmResponse = response.json().await.map_err(|e| {
            AdapterError::Retryable(anyhow::anyhow!("whm account action: bad body: {e}"))
        })?;
        if body.metadata.result != 1 {
            return Err(AdapterError::Fatal(anyhow::anyhow!(
                "whm {action} rejected: {}",
                body.metadata.reason
            )));
        }
        Ok(())
    }
}

/// Plesk's REST API (`/api/v2`).
pub struct PleskClient {
    http_client: Client,
    base_url: String,
    token: String,
    panel_url: String,
}

#[derive(Deserialize)]
struct PleskWebspace {
    id: i64,
}

impl PleskClient {
    async fn create_account(
        &self,
        account: &CreateAccount<'_>,
        idempotency_key: &str,
    ) -> Result<AccountInfo, AdapterError> {
        let response = self
            .http_client
            .post(format!("{}/api/v2/webspaces", self.base_url))
            .header("X-API-Key", &self.token)
            .header("Idempotency-Key", idempotency_key)
            .json(&serde_json::json!({
                "name": account.domain,
                "ftp_login": account.username,
                "ftp_password": account.password,
                "plan": { "name": account.plan },
                "quota_mb": account.quota_mb,
            }))
            .send()
            .await;
        match check_response(response, "plesk create webspace").await {
            Ok(response) => {
                let body: PleskWebspace = response.json().await.map_err(|e| {
                    AdapterError::Retryable(anyhow::anyhow!("plesk create: bad body: {e}"))
                })?;
                Ok(AccountInfo {
                    account_id: body.id.to_string(),
                    control_panel_url: self.panel_url.clone(),
                })
            }
            Err(AdapterError::AlreadyExists(existing)) => {
                // surface the existing webspace id when the panel tells us
                let account_id = existing
                    .get("id")
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| account.username.to_string());
                Err(AdapterError::AlreadyExists(serde_json::json!({
                    "account_id": account_id,
                    "control_panel_url": self.panel_url,
                })))
            }
            Err(e) => Err(e),
        }
    }

    async fn set_status(
        &self,
        webspace_id: &str,
        status: &str,
    ) -> Result<(), AdapterError> {
        let response = self
            .http_client
            .put(format!("{}/api/v2/webspaces/{webspace_id}", self.base_url))
            .header("X-API-Key", &self.token)
            .json(&serde_json::json!({ "status": status }))
            .send()
            .await;
        check_response(response, "plesk set status").await?;
        Ok(())
    }

    async fn delete(
        &self,
        webspace_id: &str,
    ) -> Result<(), AdapterError> {
        let response = self
            .http_client
            .delete(format!("{}/api/v2/webspaces/{webspace_id}", self.base_url))
            .header("X-API-Key", &self.token)
            .send()
            .await
            .map_err(|e| {
                AdapterError::Retryable(anyhow::anyhow!("plesk delete: transport failure: {e}"))
            })?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_response(Ok(response), "plesk delete").await?;
        Ok(())
    }
}

/// DirectAdmin's form-encoded command API. Responses are urlencoded
/// `error=0&text=...` pairs regardless of HTTP status.
pub struct DirectAdminClient {
    http_client: Client,
    base_url: String,
    token: String,
    panel_url: String,
}

impl DirectAdminClient {
    async fn create_account(
        &self,
        account: &CreateAccount<'_>,
    ) -> Result<AccountInfo, AdapterError> {
        let email = format!("admin@{}", account.domain);
        let quota = account.quota_mb.to_string();
        let response = self
            .http_client
            .post(format!("{}/CMD_API_ACCOUNT_USER", self.base_url))
            .basic_auth("admin", Some(&self.token))
            .form(&[
                ("action", "create"),
                ("add", "Submit"),
                ("username", account.username),
                ("email", &email),
                ("passwd", account.password),
                ("passwd2", account.password),
                ("domain", account.domain),
                ("package", account.plan),
                ("quota", &quota),
            ])
            .send()
            .await;
        let response = check_response(response, "directadmin create").await?;
        let body = response.text().await.map_err(|e| {
            AdapterError::Retryable(anyhow::anyhow!("directadmin create: bad body: {e}"))
        })?;
        match parse_da_response(&body) {
            DaOutcome::Ok => Ok(AccountInfo {
                account_id: account.username.to_string(),
                control_panel_url: self.panel_url.clone(),
            }),
            DaOutcome::Exists => Err(AdapterError::AlreadyExists(serde_json::json!({
                "account_id": account.username,
                "control_panel_url": self.panel_url,
            }))),
            DaOutcome::Error(text) => Err(AdapterError::Fatal(anyhow::anyhow!(
                "directadmin create rejected: {text}"
            ))),
        }
    }

    async fn select_users(
        &self,
        action: &str,
        username: &str,
    ) -> Result<(), AdapterError> {
        let mut form = vec![("select0", username), ("confirmed", "Confirm")];
        match action {
            "dosuspend" => form.push(("dosuspend", "Suspend")),
            "dounsuspend" => form.push(("dounsuspend", "Unsuspend")),
            _ => form.push(("delete", "yes")),
        }
        let response = self
            .http_client
            .post(format!("{}/CMD_API_SELECT_USERS", self.base_url))
            .basic_auth("admin", Some(&self.token))
            .form(&form)
            .send()
            .await;
        let response = check_response(response, "directadmin select users").await?;
        let body = response.text().await.map_err(|e| {
            AdapterError::Retryable(anyhow::anyhow!("directadmin select users: bad body: {e}"))
        })?;
        match parse_da_response(&body) {
            DaOutcome::Ok | DaOutcome::Exists => Ok(()),
            DaOutcome::Error(text) => Err(AdapterError::Fatal(anyhow::anyhow!(
                "directadmin {action} rejected: {text}"
            ))),
        }
    }
}

enum DaOutcome {
    Ok,
    Exists,
    Error(String),
}

fn parse_da_response(body: &str) -> DaOutcome {
    let mut error = false;
    let mut text = String::new();
    for pair in body.split('&') {
        match pair.split_once('=') {
            Some(("error", value)) => error = value != "0",
            Some(("text", value)) => text = value.replace('+', " "),
            _ => {}
        }
    }
    if !error {
        DaOutcome::Ok
    } else if text.to_lowercase().contains("exist") {
        DaOutcome::Exists
    } else {
        DaOutcome::Error(text)
    }
}

/// Our own minimal agent for panel-less servers; plain JSON with native
/// idempotency-key support.
pub struct NativeAgentClient {
    http_client: Client,
    base_url: String,
    token: String,
}

impl NativeAgentClient {
    async fn create_account(
        &self,
        account: &CreateAccount<'_>,
        idempotency_key: &str,
    ) -> Result<AccountInfo, AdapterError> {
        let response = self
            .http_client
            .post(format!("{}/v1/accounts", self.base_url))
            .bearer_auth(&self.token)
            .header("Idempotency-Key", idempotency_key)
            .json(&serde_json::json!({
                "username": account.username,
                "domain": account.domain,
                "password": account.password,
                "plan": account.plan,
                "quota_mb": account.quota_mb,
            }))
            .send()
            .await;
        let response = check_response(response, "native agent create").await?;
        response.json::<AccountInfo>().await.map_err(|e| {
            AdapterError::Retryable(anyhow::anyhow!("native agent create: bad body: {e}"))
        })
    }

    async fn account_action(
        &self,
        account_id: &str,
        action: &str,
    ) -> Result<(), AdapterError> {
        let response = self
            .http_client
            .post(format!(
                "{}/v1/accounts/{account_id}/{action}",
                self.base_url
            ))
            .bearer_auth(&self.token)
            .send()
            .await;
        check_response(response, "native agent account action").await?;
        Ok(())
    }

    async fn terminate(
        &self,
        account_id: &str,
    ) -> Result<(), AdapterError> {
        let response = self
            .http_client
            .delete(format!("{}/v1/accounts/{account_id}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| {
                AdapterError::Retryable(anyhow::anyhow!(
                    "native agent terminate: transport failure: {e}"
                ))
            })?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_response(Ok(response), "native agent terminate").await?;
        Ok(())
    }
}
