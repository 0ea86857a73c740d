use chrono::DateTime;
use chrono::Utc;
use serde_json::json;

use crate::adapters::AdapterError;
use crate::adapters::CreateAccount;
use crate::adapters::DnsRecord;
use crate::adapters::NewDatabase;
use crate::adapters::NewMailbox;
use crate::adapters::RecordType;
use crate::adapters::WelcomeEmail;
use crate::authentication::hash_password;
use crate::domain::DomainName;
use crate::domain::EmailAddress;
use crate::store::certificates;
use crate::store::tasks;
use crate::store::tasks::NewStepRecord;
use crate::store::websites;
use crate::store::Customer;
use crate::store::ProvisioningTask;
use crate::store::Server;
use crate::store::StepKind;
use crate::store::StepStatus;
use crate::store::Subscription;
use crate::store::Website;
use crate::telemetry::spawn_blocking_with_tracing;
use crate::workers::WorkerContext;

const ACCOUNT_QUOTA_MB: i64 = 10_240;
const MAILBOX_QUOTA_MB: i64 = 1_024;
const RECORD_TTL: u32 = 3_600;

pub(crate) struct StepEnv<'a> {
    pub ctx: &'a WorkerContext,
    pub task: &'a ProvisioningTask,
    pub subscription: &'a Subscription,
    pub customer: &'a Customer,
    pub customer_email: EmailAddress,
    pub server: &'a Server,
    pub website: &'a Website,
    pub domain: DomainName,
    pub username: String,
    pub temporary_password: String,
}

pub(crate) enum StepFailure {
    Storage(sqlx::Error),
    Retryable(String),
    Fatal(String),
}

/// What a successful step leaves behind on the website row (and friends).
enum Artifact {
    Account {
        account_id: String,
        document_root: String,
    },
    Zone {
        zone_id: String,
    },
    Cert {
        cert_id: String,
        not_before: Option<DateTime<Utc>>,
        not_after: Option<DateTime<Utc>>,
    },
    Mailbox {
        address: String,
    },
    Database {
        name: String,
    },
    None,
}

/// Run one step against its adapter and persist the outcome. The step-log
/// row and the artifact updates commit together; a crash in between leaves
/// the step un-logged, and the next attempt's adapter call dedupes on the
/// unchanged idempotency key.
#[tracing::instrument(
    skip_all,
    fields(task_id = %env.task.id, step = %step, attempt, idempotency_key = %idem_key)
)]
pub(crate) async fn run_step(
    env: &StepEnv<'_>,
    step: StepKind,
    attempt: i32,
    idem_key: &str,
) -> Result<(), StepFailure> {
    let started_at = Utc::now();
    let outcome = match step {
        StepKind::Account => run_account(env, idem_key).await,
        StepKind::Dns => run_dns(env, idem_key).await,
        StepKind::Ssl => run_ssl(env, idem_key).await,
        StepKind::Email => run_email(env, idem_key).await,
        StepKind::Database => run_database(env, idem_key).await,
        StepKind::Notify => run_notify(env, idem_key).await,
    };

    match outcome {
        Ok((result, artifact)) => {
            persist_success(env, step, attempt, idem_key, started_at, result, artifact).await
        }
        Err(AdapterError::AlreadyExists(existing)) => {
            // an earlier attempt got through; adopt whatever the backend
            // reported about the existing resource
            let artifact = artifact_from_existing(env, step, &existing);
            persist_success(env, step, attempt, idem_key, started_at, existing, artifact).await
        }
        Err(AdapterError::Retryable(e)) => {
            let message = format!("step {step} failed: {e:#}");
            persist_failure(env, step, attempt, idem_key, started_at, "retryable", &message)
                .await?;
            Err(StepFailure::Retryable(message))
        }
        Err(AdapterError::Fatal(e)) => {
            let message = format!("step {step} failed permanently: {e:#}");
            persist_failure(env, step, attempt, idem_key, started_at, "fatal", &message).await?;
            Err(StepFailure::Fatal(message))
        }
    }
}

async fn run_account(
    env: &StepEnv<'_>,
    idem_key: &str,
) -> Result<(serde_json::Value, Artifact), AdapterError> {
    let hosting = env.ctx.adapters.hosting_for(env.server);
    let account = CreateAccount {
        username: &env.username,
        domain: env.domain.as_ref(),
        password: &env.temporary_password,
        plan: &env.subscription.product_code,
        quota_mb: ACCOUNT_QUOTA_MB,
    };
    let info = hosting.create_account(&account, idem_key).await?;
    let result = json!({
        "account_id": info.account_id,
        "control_panel_url": info.control_panel_url,
    });
    let artifact = Artifact::Account {
        account_id: info.account_id,
        document_root: format!("/home/{}/public_html", env.username),
    };
    Ok((result, artifact))
}

async fn run_dns(
    env: &StepEnv<'_>,
    idem_key: &str,
) -> Result<(serde_json::Value, Artifact), AdapterError> {
    let dns = &env.ctx.adapters.dns;
    let domain = env.domain.as_ref();

    let zone_id = match dns
        .create_zone(domain, &env.server.nameservers, idem_key)
        .await
    {
        Ok(zone) => zone.zone_id,
        Err(AdapterError::AlreadyExists(existing)) => {
            match existing.get("zone_id").and_then(|v| v.as_str()) {
                Some(zone_id) => zone_id.to_string(),
                // nothing to hang the records on; report what we know
                None => return Err(AdapterError::AlreadyExists(existing)),
            }
        }
        Err(e) => return Err(e),
    };

    // baseline records; each add dedupes on its own key
    let apex_a = DnsRecord {
        record_type: RecordType::A,
        name: "@",
        content: &env.server.ip_address,
        ttl: RECORD_TTL,
        priority: None,
    };
    dns.add_record(&zone_id, &apex_a, &format!("{idem_key}-a"))
        .await?;

    let mail_host = format!("mail.{domain}");
    let mx = DnsRecord {
        record_type: RecordType::Mx,
        name: "@",
        content: &mail_host,
        ttl: RECORD_TTL,
        priority: Some(10),
    };
    dns.add_record(&zone_id, &mx, &format!("{idem_key}-mx"))
        .await?;

    for (i, nameserver) in env.server.nameservers.iter().enumerate() {
        let ns = DnsRecord {
            record_type: RecordType::Ns,
            name: "@",
            content: nameserver,
            ttl: RECORD_TTL,
            priority: None,
        };
        dns.add_record(&zone_id, &ns, &format!("{idem_key}-ns{i}"))
            .await?;
    }

    let spf = DnsRecord {
        record_type: RecordType::Txt,
        name: "@",
        content: "v=spf1 a mx ~all",
        ttl: RECORD_TTL,
        priority: None,
    };
    dns.add_record(&zone_id, &spf, &format!("{idem_key}-spf"))
        .await?;

    let result = json!({ "zone_id": zone_id });
    Ok((result, Artifact::Zone { zone_id }))
}

async fn run_ssl(
    env: &StepEnv<'_>,
    idem_key: &str,
) -> Result<(serde_json::Value, Artifact), AdapterError> {
    let issued = env
        .ctx
        .adapters
        .certificate
        .issue(env.domain.as_ref(), env.customer_email.as_ref(), idem_key)
        .await?;
    let result = json!({
        "cert_id": issued.cert_id,
        "not_before": issued.not_before,
        "not_after": issued.not_after,
    });
    let artifact = Artifact::Cert {
        cert_id: issued.cert_id,
        not_before: issued.not_before,
        not_after: Some(issued.not_after),
    };
    Ok((result, artifact))
}

async fn run_email(
    env: &StepEnv<'_>,
    idem_key: &str,
) -> Result<(serde_json::Value, Artifact), AdapterError> {
    let address = EmailAddress::mailbox("admin", &env.domain)
        .map_err(|e| AdapterError::Fatal(anyhow::anyhow!("cannot build admin mailbox: {e}")))?;
    let password = secrecy::Secret::new(env.temporary_password.clone());
    let password_hash = spawn_blocking_with_tracing(move || hash_password(&password))
        .await
        .map_err(|e| AdapterError::Retryable(anyhow::anyhow!("hashing thread died: {e}")))?
        .map_err(AdapterError::Fatal)?;

    let mailbox = NewMailbox {
        address: address.as_ref(),
        password_hash: &password_hash,
        quota_mb: MAILBOX_QUOTA_MB,
    };
    let created = env
        .ctx
        .adapters
        .mail
        .create_mailbox(&mailbox, idem_key)
        .await?;
    let result = json!({
        "mailbox_id": created.mailbox_id,
        "address": address.as_ref(),
    });
    Ok((
        result,
        Artifact::Mailbox {
            address: address.to_string(),
        },
    ))
}

async fn run_database(
    env: &StepEnv<'_>,
    idem_key: &str,
) -> Result<(serde_json::Value, Artifact), AdapterError> {
    let name = format!("{}_main", env.username);
    let database = NewDatabase {
        name: &name,
        owner: &env.username,
        password: &env.temporary_password,
    };
    // connection string carries credentials; only the name is recorded
    let _ = env
        .ctx
        .adapters
        .database
        .create_database(&database, idem_key)
        .await?;
    let result = json!({ "database": name });
    Ok((result, Artifact::Database { name }))
}

async fn run_notify(
    env: &StepEnv<'_>,
    idem_key: &str,
) -> Result<(serde_json::Value, Artifact), AdapterError> {
    // the panel URL was recorded by the account step, possibly in an
    // earlier attempt
    let control_panel_url = tasks::step_result(&env.ctx.pool, env.task.id, StepKind::Account)
        .await
        .ok()
        .flatten()
        .and_then(|result| {
            result
                .get("control_panel_url")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| env.server.base_url.clone());

    let welcome = WelcomeEmail {
        to: &env.customer_email,
        customer_name: &env.customer.display_name,
        domain: env.domain.as_ref(),
        temporary_password: &env.temporary_password,
        control_panel_url: &control_panel_url,
        nameservers: &env.server.nameservers,
    };
    env.ctx
        .adapters
        .notification
        .send_welcome(&welcome, idem_key)
        .await?;
    // the step log records that we notified, never what we sent
    Ok((json!({ "notified": true }), Artifact::None))
}

fn artifact_from_existing(
    env: &StepEnv<'_>,
    step: StepKind,
    existing: &serde_json::Value,
) -> Artifact {
    let text = |key: &str| {
        existing
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    match step {
        StepKind::Account => match text("account_id") {
            Some(account_id) => Artifact::Account {
                account_id,
                document_root: format!("/home/{}/public_html", env.username),
            },
            None => Artifact::None,
        },
        StepKind::Dns => match text("zone_id") {
            Some(zone_id) => Artifact::Zone { zone_id },
            None => Artifact::None,
        },
        StepKind::Ssl => match text("cert_id") {
            Some(cert_id) => Artifact::Cert {
                cert_id,
                not_before: None,
                not_after: existing
                    .get("not_after")
                    .and_then(|v| serde_json::from_value(v.clone()).ok()),
            },
            None => Artifact::None,
        },
        StepKind::Email => Artifact::Mailbox {
            address: format!("admin@{}", env.domain),
        },
        StepKind::Database => Artifact::Database {
            name: format!("{}_main", env.username),
        },
        StepKind::Notify => Artifact::None,
    }
}

/// Step row and artifact updates in one transaction.
async fn persist_success(
    env: &StepEnv<'_>,
    step: StepKind,
    attempt: i32,
    idem_key: &str,
    started_at: DateTime<Utc>,
    result: serde_json::Value,
    artifact: Artifact,
) -> Result<(), StepFailure> {
    let mut transaction = env.ctx.pool.begin().await.map_err(StepFailure::Storage)?;

    match artifact {
        Artifact::Account {
            account_id,
            document_root,
        } => {
            websites::set_account_artifacts(
                &mut *transaction,
                env.website.id,
                &account_id,
                &document_root,
            )
            .await
            .map_err(StepFailure::Storage)?;
        }
        Artifact::Zone { zone_id } => {
            websites::set_dns_zone(&mut *transaction, env.website.id, &zone_id)
                .await
                .map_err(StepFailure::Storage)?;
        }
        Artifact::Cert {
            cert_id,
            not_before,
            not_after,
        } => {
            websites::set_ssl_cert(&mut *transaction, env.website.id, &cert_id)
                .await
                .map_err(StepFailure::Storage)?;
            if let Some(not_after) = not_after {
                certificates::insert(
                    &mut *transaction,
                    env.task.tenant_id,
                    env.website.id,
                    &cert_id,
                    env.domain.as_ref(),
                    not_before,
                    not_after,
                )
                .await
                .map_err(StepFailure::Storage)?;
            }
        }
        Artifact::Mailbox { address } => {
            websites::set_default_mailbox(&mut *transaction, env.website.id, &address)
                .await
                .map_err(StepFailure::Storage)?;
        }
        Artifact::Database { name } => {
            websites::set_default_database(&mut *transaction, env.website.id, &name)
                .await
                .map_err(StepFailure::Storage)?;
        }
        Artifact::None => {}
    }

    tasks::insert_step(
        &mut *transaction,
        NewStepRecord {
            task_id: env.task.id,
            step,
            status: StepStatus::Succeeded,
            attempt,
            started_at,
            finished_at: Some(Utc::now()),
            result: Some(result),
            error_code: None,
            error_message: None,
            idempotency_key: idem_key,
            compensation: false,
        },
    )
    .await
    .map_err(StepFailure::Storage)?;

    transaction.commit().await.map_err(StepFailure::Storage)?;
    Ok(())
}

async fn persist_failure(
    env: &StepEnv<'_>,
    step: StepKind,
    attempt: i32,
    idem_key: &str,
    started_at: DateTime<Utc>,
    error_code: &str,
    message: &str,
) -> Result<(), StepFailure> {
    tasks::insert_step(
        &env.ctx.pool,
        NewStepRecord {
            task_id: env.task.id,
            step,
            status: StepStatus::Failed,
            attempt,
            started_at,
            finished_at: Some(Utc::now()),
            result: None,
            error_code: Some(error_code),
            error_message: Some(message),
            idempotency_key: idem_key,
            compensation: false,
        },
    )
    .await
    .map_err(StepFailure::Storage)?;
    Ok(())
}
