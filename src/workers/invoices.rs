use crate::adapters::AdapterError;
use crate::queue;
use crate::queue::EmailJob;
use crate::queue::EnqueueOptions;
use crate::queue::InvoiceJob;
use crate::queue::Job;
use crate::queue::QueueName;
use crate::store::activity;
use crate::store::invoices;
use crate::store::servers;
use crate::store::subscriptions;
use crate::store::websites;
use crate::store::SubscriptionStatus;
use crate::store::WebsiteStatus;
use crate::workers::HandlerFailure;
use crate::workers::HandlerOutcome;
use crate::workers::HandlerResult;
use crate::workers::WorkerContext;

fn storage(e: sqlx::Error) -> HandlerFailure {
    HandlerFailure::retryable(anyhow::anyhow!("store unavailable: {e}"))
}

#[tracing::instrument(skip_all, fields(job_id = %job.id))]
pub(super) async fn handle(
    ctx: &WorkerContext,
    job: &Job,
) -> HandlerResult {
    let payload: InvoiceJob = serde_json::from_value(job.payload.clone())
        .map_err(|e| HandlerFailure::fatal(anyhow::anyhow!("malformed invoice payload: {e}")))?;

    match payload {
        InvoiceJob::GenerateInvoice { subscription_id } => {
            generate_invoice(ctx, subscription_id).await
        }
        InvoiceJob::SuspendDelinquent {
            subscription_id,
            invoice_id,
        } => suspend_delinquent(ctx, subscription_id, invoice_id).await,
    }
}

/// One invoice per cycle; the `(subscription, period_start)` constraint
/// absorbs duplicate jobs. The notice email is enqueued in the same
/// transaction that creates the invoice.
async fn generate_invoice(
    ctx: &WorkerContext,
    subscription_id: uuid::Uuid,
) -> HandlerResult {
    let subscription = subscriptions::get(&ctx.pool, subscription_id)
        .await
        .map_err(storage)?
        .ok_or_else(|| {
            HandlerFailure::fatal(anyhow::anyhow!("unknown subscription {subscription_id}"))
        })?;
    let Some(period_start) = subscription.next_billing_at else {
        return Ok(HandlerOutcome::Completed);
    };
    let period_end = subscription.billing_period.advance(period_start);
    let currency = subscription
        .metadata
        .get("currency")
        .and_then(|v| v.as_str())
        .unwrap_or("USD")
        .to_string();

    let mut transaction = ctx.pool.begin().await.map_err(storage)?;
    let invoice = invoices::insert_for_cycle(
        &mut *transaction,
        subscription.tenant_id,
        subscription.id,
        period_start,
        period_end,
        subscription.price_minor,
        &currency,
        period_start,
    )
    .await
    .map_err(storage)?;

    let Some(invoice) = invoice else {
        // this cycle was already invoiced
        return Ok(HandlerOutcome::Completed);
    };

    let notice = serde_json::to_value(EmailJob::InvoiceIssued {
        invoice_id: invoice.id,
    })
    .map_err(|e| HandlerFailure::fatal(anyhow::anyhow!("payload serialisation: {e}")))?;
    queue::enqueue(
        &mut *transaction,
        QueueName::Emails,
        &notice,
        &EnqueueOptions::default(),
    )
    .await
    .map_err(|e| HandlerFailure::retryable(anyhow::anyhow!("enqueue failed: {e}")))?;
    transaction.commit().await.map_err(storage)?;

    tracing::info!(
        "invoiced subscription {} for the cycle starting {}",
        subscription.id,
        period_start,
    );
    Ok(HandlerOutcome::Completed)
}

/// Suspend the hosted service behind a delinquent subscription and record
/// the action.
async fn suspend_delinquent(
    ctx: &WorkerContext,
    subscription_id: uuid::Uuid,
    invoice_id: uuid::Uuid,
) -> HandlerResult {
    let subscription = subscriptions::get(&ctx.pool, subscription_id)
        .await
        .map_err(storage)?
        .ok_or_else(|| {
            HandlerFailure::fatal(anyhow::anyhow!("unknown subscription {subscription_id}"))
        })?;
    if subscription.status == SubscriptionStatus::Suspended {
        return Ok(HandlerOutcome::Completed);
    }

    let website = websites::get_by_subscription(&ctx.pool, subscription.id)
        .await
        .map_err(storage)?;

    // suspend the control-panel account when there is one; a subscription
    // whose provisioning never finished has nothing to suspend externally
    if let Some(website) = &website {
        if let Some(account_id) = &website.account_id {
            let server = servers::get(&ctx.pool, website.server_id)
                .await
                .map_err(storage)?
                .ok_or_else(|| {
                    HandlerFailure::fatal(anyhow::anyhow!("website references a missing server"))
                })?;
            match ctx.adapters.hosting_for(&server).suspend(account_id).await {
                Ok(()) | Err(AdapterError::AlreadyExists(_)) => {}
                Err(AdapterError::Retryable(e)) => return Err(HandlerFailure::retryable(e)),
                Err(AdapterError::Fatal(e)) => return Err(HandlerFailure::fatal(e)),
            }
        }
    }

    let mut transaction = ctx.pool.begin().await.map_err(storage)?;
    if let Some(website) = &website {
        websites::set_status(&mut *transaction, website.id, WebsiteStatus::Suspended)
            .await
            .map_err(storage)?;
    }
    subscriptions::set_status(&mut *transaction, subscription.id, SubscriptionStatus::Suspended)
        .await
        .map_err(storage)?;
    invoices::mark_overdue(&mut *transaction, invoice_id)
        .await
        .map_err(storage)?;
    activity::record(
        &mut *transaction,
        subscription.tenant_id,
        "subscription.suspended",
        Some(subscription.id),
        "suspended for non-payment past the grace period",
    )
    .await
    .map_err(storage)?;
    transaction.commit().await.map_err(storage)?;

    tracing::info!("suspended subscription {} for non-payment", subscription.id);
    Ok(HandlerOutcome::Completed)
}
