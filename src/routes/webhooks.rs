use actix_web::web;
use actix_web::web::Data;
use actix_web::HttpRequest;
use actix_web::HttpResponse;
use actix_web::ResponseError;
use anyhow::Context;
use chrono::Utc;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use sqlx::Postgres;
use sqlx::Transaction;
use uuid::Uuid;

use crate::authentication::generate_temporary_password;
use crate::authentication::hash_password;
use crate::configuration::Settings;
use crate::domain::DomainName;
use crate::domain::EmailAddress;
use crate::domain::HostingUsername;
use crate::idempotency;
use crate::idempotency::IdempotencyError;
use crate::idempotency::IdempotencyKey;
use crate::idempotency::NextAction;
use crate::queue;
use crate::queue::EnqueueOptions;
use crate::queue::ProvisioningJob;
use crate::queue::QueueName;
use crate::signature::verify_signature;
use crate::store::checkouts;
use crate::store::credentials;
use crate::store::customers;
use crate::store::invoices;
use crate::store::subscriptions;
use crate::store::tasks;
use crate::store::CheckoutSession;
use crate::store::CheckoutStatus;
use crate::telemetry::spawn_blocking_with_tracing;
use crate::utils::error_chain_fmt;

/// How long a processed event id shields against provider redeliveries.
const WEBHOOK_DEDUP_DAYS: i64 = 7;

/// The provider's event envelope. Fields beyond the discriminating ones are
/// optional because other event kinds share the same shape.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEvent {
    event_id: String,
    kind: String,
    session_id: Option<String>,
    domain: Option<String>,
    name: Option<String>,
    invoice_id: Option<Uuid>,
}

#[derive(thiserror::Error)]
pub enum WebhookError {
    #[error("invalid request")]
    BadSignature,
    #[error("invalid request")]
    Validation(#[source] anyhow::Error),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl std::fmt::Debug for WebhookError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl ResponseError for WebhookError {
    fn error_response(&self) -> HttpResponse {
        // one opaque body for every client error; storage trouble is 5xx so
        // the provider retries
        match self {
            Self::BadSignature | Self::Validation(_) => {
                HttpResponse::BadRequest().json(json!({ "error": "invalid request" }))
            }
            Self::Unexpected(_) => HttpResponse::InternalServerError().finish(),
        }
    }
}

/// `POST /webhooks/payments` - the single authoritative provisioning
/// trigger. Everything between signature check and the 2xx happens inside
/// one transaction guarded by the event-id idempotency marker, so provider
/// redeliveries replay the stored outcome instead of the work.
#[tracing::instrument(
    name = "Handling payment webhook",
    skip_all,
    fields(event_id = tracing::field::Empty, kind = tracing::field::Empty)
)]
pub async fn payments_webhook(
    request: HttpRequest,
    body: web::Bytes,
    pool: Data<PgPool>,
    cfg: Data<Settings>,
) -> Result<HttpResponse, WebhookError> {
    let header = request
        .headers()
        .get("Signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    verify_signature(
        &cfg.webhook.signing_secret,
        header,
        &body,
        cfg.webhook.timestamp_tolerance_secs,
        Utc::now(),
    )
    .map_err(|_| WebhookError::BadSignature)?;

    let event: PaymentEvent = serde_json::from_slice(&body)
        .map_err(|e| WebhookError::Validation(anyhow::anyhow!("undecodable envelope: {e}")))?;
    tracing::Span::current()
        .record("event_id", tracing::field::display(&event.event_id))
        .record("kind", tracing::field::display(&event.kind));

    let raw: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| WebhookError::Validation(anyhow::anyhow!("undecodable envelope: {e}")))?;

    let key = IdempotencyKey::try_from(event.event_id.clone()).map_err(WebhookError::Validation)?;
    let mut transaction = match idempotency::try_begin(
        "webhook",
        &key,
        chrono::Duration::days(WEBHOOK_DEDUP_DAYS),
        &pool,
    )
    .await
    {
        Ok(NextAction::StartProcessing(transaction)) => transaction,
        Ok(NextAction::ReturnSavedOutcome(outcome)) => {
            tracing::info!("replaying stored outcome for event");
            return Ok(HttpResponse::Ok().json(outcome));
        }
        // 5xx so the provider redelivers once the first delivery settles
        Err(IdempotencyError::InFlight) => {
            return Err(WebhookError::Unexpected(anyhow::anyhow!(
                "concurrent delivery of the same event in flight"
            )))
        }
        Err(IdempotencyError::StorageUnavailable(e)) => {
            return Err(WebhookError::Unexpected(e.into()))
        }
    };

    journal_event(&mut transaction, &event, &raw).await?;

    let outcome = match event.kind.as_str() {
        "checkout.completed" => handle_checkout_completed(&mut transaction, &cfg, &event).await?,
        "invoice.paid" => handle_invoice_paid(&mut transaction, &event).await?,
        // accepted and journaled, but nothing to provision
        _ => json!({ "received": true }),
    };

    idempotency::save_outcome("webhook", &key, outcome.clone(), transaction)
        .await
        .context("failed to store webhook outcome")?;
    Ok(HttpResponse::Ok().json(outcome))
}

async fn journal_event(
    transaction: &mut Transaction<'static, Postgres>,
    event: &PaymentEvent,
    raw: &serde_json::Value,
) -> Result<(), WebhookError> {
    sqlx::query(
        r#"
        INSERT INTO webhook_events (id, external_event_id, kind, payload)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (external_event_id) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&event.event_id)
    .bind(&event.kind)
    .bind(raw)
    .execute(&mut **transaction)
    .await
    .context("failed to journal webhook event")?;
    Ok(())
}

/// Steps 4-7 of the intake contract: materialise the paid checkout into
/// customer + credential + subscription + task, and enqueue the
/// provisioning job - all in the caller's transaction.
async fn handle_checkout_completed(
    transaction: &mut Transaction<'static, Postgres>,
    cfg: &Settings,
    event: &PaymentEvent,
) -> Result<serde_json::Value, WebhookError> {
    let session_id = event
        .session_id
        .as_deref()
        .ok_or_else(|| WebhookError::Validation(anyhow::anyhow!("missing sessionId")))?;

    let checkout = checkouts::get_by_external_id(&mut **transaction, session_id)
        .await
        .context("failed to look up checkout session")?;
    let Some(checkout) = checkout else {
        // no matching intent; acknowledge so the provider stops retrying
        tracing::warn!("webhook referenced an unknown checkout session");
        return Ok(json!({ "received": true, "session": "unknown" }));
    };
    if checkout.status != CheckoutStatus::Pending {
        tracing::info!("checkout session is already settled; acknowledging");
        return Ok(json!({ "received": true }));
    }

    let email = EmailAddress::parse(checkout.customer_email.clone())
        .map_err(|e| WebhookError::Validation(anyhow::anyhow!("invalid customer email: {e}")))?;
    let domain = resolve_domain(event, &checkout)?;
    let display_name = event
        .name
        .clone()
        .unwrap_or_else(|| email.local_part().to_string());

    let customer =
        customers::upsert_by_email(&mut **transaction, checkout.tenant_id, email.as_ref(), &display_name)
            .await
            .context("failed to upsert customer")?;

    // fresh high-entropy secret; the cleartext lives only in the job payload
    let temporary_password = generate_temporary_password();
    let password_for_hash = temporary_password.clone();
    let password_hash = spawn_blocking_with_tracing(move || hash_password(&password_for_hash))
        .await
        .context("hashing thread died")?
        .context("failed to hash temporary password")?;
    credentials::insert(&mut **transaction, customer.id, email.as_ref(), &password_hash)
        .await
        .context("failed to store user credential")?;

    let counter = subscriptions::count_for_tenant(&mut **transaction, checkout.tenant_id)
        .await
        .context("failed to derive username counter")?
        + 1;
    let username = HostingUsername::derive(&domain, counter as u32);

    let metadata = json!({
        "checkoutId": checkout.id,
        "domain": domain.as_ref(),
        "username": username.as_ref(),
        "currency": checkout.currency,
    });
    let subscription_id = subscriptions::insert(
        &mut **transaction,
        checkout.tenant_id,
        customer.id,
        &checkout.product_code,
        checkout.billing_period,
        checkout.amount_minor,
        checkout.billing_period.advance(Utc::now()),
        metadata,
    )
    .await
    .context("failed to create subscription")?;

    let task_id = tasks::create(
        &mut **transaction,
        checkout.tenant_id,
        subscription_id,
        cfg.queue.max_attempts,
    )
    .await
    .context("failed to create provisioning task")?;

    checkouts::complete(&mut **transaction, checkout.id)
        .await
        .context("failed to complete checkout session")?;

    let payload = serde_json::to_value(ProvisioningJob {
        task_id,
        subscription_id,
        customer_id: customer.id,
        temporary_password: temporary_password.expose_secret().clone(),
    })
    .context("failed to serialise job payload")?;
    queue::enqueue(
        &mut **transaction,
        QueueName::Provisioning,
        &payload,
        &EnqueueOptions {
            priority: 5,
            max_attempts: cfg.queue.max_attempts,
            backoff_base_secs: cfg.queue.backoff_base_secs as i32,
            ..EnqueueOptions::default()
        },
    )
    .await
    .context("failed to enqueue provisioning job")?;

    tracing::info!("checkout materialised into subscription {subscription_id}");
    Ok(json!({ "received": true }))
}

/// Renewal confirmation: settle the invoice and move the billing horizon
/// one period forward.
async fn handle_invoice_paid(
    transaction: &mut Transaction<'static, Postgres>,
    event: &PaymentEvent,
) -> Result<serde_json::Value, WebhookError> {
    let invoice_id = event
        .invoice_id
        .ok_or_else(|| WebhookError::Validation(anyhow::anyhow!("missing invoiceId")))?;
    let Some(invoice) = invoices::get(&mut **transaction, invoice_id)
        .await
        .context("failed to look up invoice")?
    else {
        tracing::warn!("webhook referenced an unknown invoice");
        return Ok(json!({ "received": true, "invoice": "unknown" }));
    };

    let subscription = subscriptions::get(&mut **transaction, invoice.subscription_id)
        .await
        .context("failed to look up subscription")?
        .ok_or_else(|| {
            WebhookError::Unexpected(anyhow::anyhow!("invoice references a missing subscription"))
        })?;

    invoices::mark_paid(&mut **transaction, invoice.id)
        .await
        .context("failed to mark invoice paid")?;
    if let Some(next_billing_at) = subscription.next_billing_at {
        subscriptions::advance_next_billing(
            &mut **transaction,
            subscription.id,
            subscription.billing_period,
            next_billing_at,
        )
        .await
        .context("failed to advance billing date")?;
    }

    Ok(json!({ "received": true }))
}

fn resolve_domain(
    event: &PaymentEvent,
    checkout: &CheckoutSession,
) -> Result<DomainName, WebhookError> {
    let raw = event
        .domain
        .clone()
        .or_else(|| {
            checkout
                .metadata
                .get("domain")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
        .ok_or_else(|| WebhookError::Validation(anyhow::anyhow!("missing domain")))?;
    DomainName::parse(raw)
        .map_err(|e| WebhookError::Validation(anyhow::anyhow!("invalid domain: {e}")))
}
