use chrono::DateTime;
use chrono::Utc;
use sqlx::PgExecutor;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "control_panel_kind", rename_all = "lowercase")]
pub enum ControlPanelKind {
    Cpanel,
    Plesk,
    Directadmin,
    Native,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "server_status", rename_all = "lowercase")]
pub enum ServerStatus {
    Active,
    Draining,
    Offline,
}

/// A host that can run provisioned services. The control-panel selection is
/// static per row; the hosting adapter picks its protocol from `control_panel`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Server {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub hostname: String,
    pub ip_address: String,
    pub control_panel: ControlPanelKind,
    pub base_url: String,
    pub admin_token: String,
    pub nameservers: Vec<String>,
    pub max_accounts: i32,
    pub current_accounts: i32,
    pub status: ServerStatus,
    pub created_at: DateTime<Utc>,
}

const COLUMNS: &str = "id, tenant_id, hostname, ip_address, control_panel, base_url, \
                       admin_token, nameservers, max_accounts, current_accounts, \
                       status, created_at";

#[allow(clippy::too_many_arguments)]
pub async fn insert(
    executor: impl PgExecutor<'_>,
    tenant_id: Uuid,
    hostname: &str,
    ip_address: &str,
    control_panel: ControlPanelKind,
    base_url: &str,
    admin_token: &str,
    nameservers: &[String],
    max_accounts: i32,
) -> Result<Uuid, sqlx::Error> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO servers
            (id, tenant_id, hostname, ip_address, control_panel, base_url,
             admin_token, nameservers, max_accounts)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(id)
    .bind(tenant_id)
    .bind(hostname)
    .bind(ip_address)
    .bind(control_panel)
    .bind(base_url)
    .bind(admin_token)
    .bind(nameservers)
    .bind(max_accounts)
    .execute(executor)
    .await?;
    Ok(id)
}

pub async fn get(
    executor: impl PgExecutor<'_>,
    id: Uuid,
) -> Result<Option<Server>, sqlx::Error> {
    sqlx::query_as::<_, Server>(&format!("SELECT {COLUMNS} FROM servers WHERE id = $1"))
        .bind(id)
        .fetch_optional(executor)
        .await
}

/// Placement target: the least-loaded `active` server with spare capacity,
/// locked so two concurrent tasks cannot both take the last slot. Returns
/// `None` when the fleet is full.
pub async fn pick_for_placement(
    executor: impl PgExecutor<'_>,
    tenant_id: Uuid,
) -> Result<Option<Server>, sqlx::Error> {
    sqlx::query_as::<_, Server>(&format!(
        r#"
        SELECT {COLUMNS} FROM servers
        WHERE tenant_id = $1
          AND status = 'active'
          AND current_accounts < max_accounts
        ORDER BY current_accounts ASC, id
        LIMIT 1
        FOR UPDATE
        "#
    ))
    .bind(tenant_id)
    .fetch_optional(executor)
    .await
}

pub async fn increment_accounts(
    executor: impl PgExecutor<'_>,
    id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE servers
        SET current_accounts = current_accounts + 1, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn decrement_accounts(
    executor: impl PgExecutor<'_>,
    id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE servers
        SET current_accounts = greatest(current_accounts - 1, 0), updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .execute(executor)
    .await?;
    Ok(())
}
