use crate::adapters::AdapterError;
use crate::domain::EmailAddress;
use crate::queue::EmailJob;
use crate::queue::Job;
use crate::store::certificates;
use crate::store::customers;
use crate::store::invoices;
use crate::store::subscriptions;
use crate::store::websites;
use crate::workers::HandlerFailure;
use crate::workers::HandlerOutcome;
use crate::workers::HandlerResult;
use crate::workers::WorkerContext;

fn storage(e: sqlx::Error) -> HandlerFailure {
    HandlerFailure::retryable(anyhow::anyhow!("store unavailable: {e}"))
}

fn send_outcome(result: Result<(), AdapterError>) -> HandlerResult {
    match result {
        // a duplicate send was already absorbed by the transport
        Ok(()) | Err(AdapterError::AlreadyExists(_)) => Ok(HandlerOutcome::Completed),
        Err(AdapterError::Retryable(e)) => Err(HandlerFailure::retryable(e)),
        Err(AdapterError::Fatal(e)) => Err(HandlerFailure::fatal(e)),
    }
}

#[tracing::instrument(skip_all, fields(job_id = %job.id))]
pub(super) async fn handle(
    ctx: &WorkerContext,
    job: &Job,
) -> HandlerResult {
    let payload: EmailJob = serde_json::from_value(job.payload.clone())
        .map_err(|e| HandlerFailure::fatal(anyhow::anyhow!("malformed email payload: {e}")))?;

    match payload {
        EmailJob::SslExpiryReminder { certificate_id } => {
            let Some(certificate) = certificates::get(&ctx.pool, certificate_id)
                .await
                .map_err(storage)?
            else {
                // pruned since the sweep ran; nothing to remind about
                return Ok(HandlerOutcome::Completed);
            };
            let website = websites::get(&ctx.pool, certificate.website_id)
                .await
                .map_err(storage)?
                .ok_or_else(|| {
                    HandlerFailure::fatal(anyhow::anyhow!(
                        "certificate {certificate_id} references a missing website"
                    ))
                })?;
            let customer = customers::get(&ctx.pool, website.customer_id)
                .await
                .map_err(storage)?
                .ok_or_else(|| {
                    HandlerFailure::fatal(anyhow::anyhow!("website references a missing customer"))
                })?;
            let to = EmailAddress::parse(customer.email.clone())
                .map_err(|e| HandlerFailure::fatal(anyhow::anyhow!("stored email invalid: {e}")))?;

            let subject = format!(
                "Your certificate for {} expires on {}",
                certificate.domain,
                certificate.not_after.format("%Y-%m-%d"),
            );
            let body = format!(
                "Hello {},\n\nThe SSL certificate for {} expires on {}. It will \
                 be renewed automatically; no action is needed unless you manage \
                 your own certificate.\n",
                customer.display_name,
                certificate.domain,
                certificate.not_after.format("%Y-%m-%d"),
            );
            // one reminder per certificate per expiry window
            let idem_key = format!(
                "ssl-reminder-{}-{}",
                certificate.id,
                certificate.not_after.format("%Y%m%d"),
            );
            send_outcome(
                ctx.adapters
                    .notification
                    .send(&to, &subject, &body, &idem_key)
                    .await,
            )?;
            certificates::mark_reminded(&ctx.pool, certificate.id)
                .await
                .map_err(storage)?;
            Ok(HandlerOutcome::Completed)
        }

        EmailJob::InvoiceIssued { invoice_id } => {
            let Some(invoice) = invoices::get(&ctx.pool, invoice_id).await.map_err(storage)?
            else {
                return Ok(HandlerOutcome::Completed);
            };
            let subscription = subscriptions::get(&ctx.pool, invoice.subscription_id)
                .await
                .map_err(storage)?
                .ok_or_else(|| {
                    HandlerFailure::fatal(anyhow::anyhow!("invoice references a missing subscription"))
                })?;
            let customer = customers::get(&ctx.pool, subscription.customer_id)
                .await
                .map_err(storage)?
                .ok_or_else(|| {
                    HandlerFailure::fatal(anyhow::anyhow!("subscription references a missing customer"))
                })?;
            let to = EmailAddress::parse(customer.email.clone())
                .map_err(|e| HandlerFailure::fatal(anyhow::anyhow!("stored email invalid: {e}")))?;

            let amount = invoice.amount_minor as f64 / 100.0;
            let subject = format!("Invoice for {}", subscription.product_code);
            let body = format!(
                "Hello {},\n\nYour invoice over {:.2} {} for {} is due on {}.\n",
                customer.display_name,
                amount,
                invoice.currency,
                subscription.product_code,
                invoice.due_at.format("%Y-%m-%d"),
            );
            let idem_key = format!("invoice-issued-{}", invoice.id);
            send_outcome(
                ctx.adapters
                    .notification
                    .send(&to, &subject, &body, &idem_key)
                    .await,
            )
        }
    }
}
