use chrono::Utc;
use hostforge::signature;
use secrecy::Secret;
use serde_json::json;

use crate::helpers::spawn_app;

#[tokio::test]
async fn webhook_without_valid_signature_is_rejected_opaquely() {
    let app = spawn_app().await;
    let body = app
        .checkout_completed_event("e_001", "cs_001", "alice@example.com", "alice.example.com")
        .to_string();

    // no header at all
    let resp = reqwest::Client::new()
        .post(format!("{}/webhooks/payments", app.addr))
        .header("Content-Type", "application/json")
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    // signed with the wrong secret
    let forged = signature::sign(
        &Secret::new("not-the-secret".to_string()),
        Utc::now().timestamp(),
        body.as_bytes(),
    );
    let resp = app.post_webhook_raw(&body, &forged).await;
    assert_eq!(resp.status().as_u16(), 400);

    // stale timestamp, otherwise valid
    let stale = signature::sign(
        &app.cfg.webhook.signing_secret,
        Utc::now().timestamp() - 3_600,
        body.as_bytes(),
    );
    let resp = app.post_webhook_raw(&body, &stale).await;
    assert_eq!(resp.status().as_u16(), 400);

    // the two rejections are indistinguishable
    assert_eq!(app.count("subscriptions").await, 0);
}

#[tokio::test]
async fn completed_checkout_materialises_customer_subscription_and_job() {
    let app = spawn_app().await;
    app.seed_server(10).await;
    app.seed_checkout("cs_001", "alice@example.com", "alice.example.com")
        .await;

    let event =
        app.checkout_completed_event("e_001", "cs_001", "alice@example.com", "alice.example.com");
    let resp = app.post_webhook(&event).await;

    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["received"], json!(true));

    // customer, credential, pending subscription, queued task, one job
    assert_eq!(app.count("customers").await, 1);
    assert_eq!(app.count("user_credentials").await, 1);
    assert_eq!(app.count("provisioning_tasks").await, 1);

    let (email, status): (String, String) = sqlx::query_as(
        "SELECT c.email, s.status::text FROM subscriptions s \
         JOIN customers c ON c.id = s.customer_id",
    )
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert_eq!(email, "alice@example.com");
    assert_eq!(status, "pending");

    let (metadata,): (serde_json::Value,) =
        sqlx::query_as("SELECT metadata FROM subscriptions")
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert_eq!(metadata["domain"], json!("alice.example.com"));
    // first-eight-alnum prefix + 4-digit counter
    assert_eq!(metadata["username"], json!("alice0001"));

    let (queue, status, priority): (String, String, i32) =
        sqlx::query_as("SELECT queue, status::text, priority FROM jobs")
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert_eq!(queue, "provisioning");
    assert_eq!(status, "queued");
    assert_eq!(priority, 5);

    // checkout session settled exactly once
    let (checkout_status,): (String,) =
        sqlx::query_as("SELECT status::text FROM checkout_sessions")
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert_eq!(checkout_status, "completed");

    // the credential is a PHC hash, not the password
    let (hash,): (String,) = sqlx::query_as("SELECT password_hash FROM user_credentials")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    assert!(hash.starts_with("$argon2id$"));
}

#[tokio::test]
async fn duplicate_webhook_delivery_is_replayed_not_reprocessed() {
    let app = spawn_app().await;
    app.seed_server(10).await;
    app.seed_checkout("cs_001", "alice@example.com", "alice.example.com")
        .await;
    let event =
        app.checkout_completed_event("e_001", "cs_001", "alice@example.com", "alice.example.com");

    let first = app.post_webhook(&event).await;
    let second = app.post_webhook(&event).await;

    assert_eq!(first.status().as_u16(), 200);
    assert_eq!(second.status().as_u16(), 200);

    // exactly one of everything
    assert_eq!(app.count("customers").await, 1);
    assert_eq!(app.count("subscriptions").await, 1);
    assert_eq!(app.count("provisioning_tasks").await, 1);
    assert_eq!(app.count("jobs").await, 1);
}

#[tokio::test]
async fn webhook_for_unknown_session_is_acknowledged_without_side_effects() {
    let app = spawn_app().await;

    let event =
        app.checkout_completed_event("e_404", "cs_missing", "bob@example.com", "bob.example.com");
    let resp = app.post_webhook(&event).await;

    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(app.count("subscriptions").await, 0);
    assert_eq!(app.count("jobs").await, 0);
}

#[tokio::test]
async fn other_event_kinds_are_journaled_but_not_enqueued() {
    let app = spawn_app().await;

    let event = json!({
        "eventId": "e_777",
        "kind": "customer.updated",
    });
    let resp = app.post_webhook(&event).await;

    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(app.count("webhook_events").await, 1);
    assert_eq!(app.count("jobs").await, 0);
}

#[tokio::test]
async fn webhook_returns_500_on_storage_failure_so_provider_retries() {
    let app = spawn_app().await;
    app.seed_checkout("cs_001", "alice@example.com", "alice.example.com")
        .await;

    // sabotage the queue
    sqlx::query("ALTER TABLE jobs DROP COLUMN payload")
        .execute(&app.pool)
        .await
        .unwrap();

    let event =
        app.checkout_completed_event("e_001", "cs_001", "alice@example.com", "alice.example.com");
    let resp = app.post_webhook(&event).await;
    assert_eq!(resp.status().as_u16(), 500);

    // nothing committed, so the provider's retry will do the real work
    assert_eq!(app.count("subscriptions").await, 0);
}

#[tokio::test]
async fn invoice_paid_event_settles_invoice_and_advances_billing() {
    let app = spawn_app().await;
    app.seed_server(10).await;
    app.seed_checkout("cs_001", "alice@example.com", "alice.example.com")
        .await;
    let event =
        app.checkout_completed_event("e_001", "cs_001", "alice@example.com", "alice.example.com");
    assert_eq!(app.post_webhook(&event).await.status().as_u16(), 200);

    let (subscription_id, tenant_id, next_billing_at): (
        uuid::Uuid,
        uuid::Uuid,
        chrono::DateTime<Utc>,
    ) = sqlx::query_as("SELECT id, tenant_id, next_billing_at FROM subscriptions")
        .fetch_one(&app.pool)
        .await
        .unwrap();

    let invoice = hostforge::store::invoices::insert_for_cycle(
        &app.pool,
        tenant_id,
        subscription_id,
        next_billing_at,
        next_billing_at + chrono::Duration::days(31),
        799,
        "USD",
        next_billing_at,
    )
    .await
    .unwrap()
    .unwrap();

    let paid = json!({
        "eventId": "e_002",
        "kind": "invoice.paid",
        "invoiceId": invoice.id,
    });
    assert_eq!(app.post_webhook(&paid).await.status().as_u16(), 200);

    let (invoice_status,): (String,) = sqlx::query_as("SELECT status::text FROM invoices")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    assert_eq!(invoice_status, "paid");

    let (advanced,): (chrono::DateTime<Utc>,) =
        sqlx::query_as("SELECT next_billing_at FROM subscriptions")
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert!(advanced > next_billing_at);
}
