use chrono::TimeZone;
use chrono::Utc;
use hostforge::queue::QueueName;
use hostforge::store::backups;
use hostforge::store::customers;
use hostforge::store::invoices;
use hostforge::store::subscriptions;
use hostforge::store::websites;
use hostforge::sweeps::run_sweep;
use hostforge::sweeps::Sweep;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::method;
use wiremock::matchers::path_regex;
use wiremock::Mock;
use wiremock::ResponseTemplate;

use crate::helpers::days_from_now;
use crate::helpers::spawn_app;
use crate::helpers::TestApp;

/// An `active` subscription billed soon, the billing sweep's prey.
async fn seed_active_subscription(app: &TestApp) -> Uuid {
    let customer = customers::upsert_by_email(&app.pool, app.tenant_id, "alice@example.com", "alice")
        .await
        .unwrap();
    let subscription_id = subscriptions::insert(
        &app.pool,
        app.tenant_id,
        customer.id,
        "hosting-basic",
        hostforge::domain::BillingPeriod::Monthly,
        799,
        days_from_now(3),
        json!({ "currency": "USD" }),
    )
    .await
    .unwrap();
    subscriptions::activate(&app.pool, subscription_id).await.unwrap();
    subscription_id
}

#[tokio::test]
async fn a_sweep_fired_twice_in_the_same_minute_enqueues_once() {
    let app = spawn_app().await;
    let at = Utc.with_ymd_and_hms(2025, 1, 15, 2, 0, 0).unwrap();

    run_sweep(&app.pool, &app.cfg, Sweep::BackupCleanup, at)
        .await
        .unwrap();
    // clock skew after a restart: same scheduled minute, second producer
    run_sweep(&app.pool, &app.cfg, Sweep::BackupCleanup, at + chrono::Duration::seconds(30))
        .await
        .unwrap();

    assert_eq!(app.count("jobs").await, 1);

    // the next day's run is a fresh marker
    run_sweep(
        &app.pool,
        &app.cfg,
        Sweep::BackupCleanup,
        at + chrono::Duration::days(1),
    )
    .await
    .unwrap();
    assert_eq!(app.count("jobs").await, 2);
}

#[tokio::test]
async fn billing_sweep_invoices_each_due_subscription_exactly_once() {
    let app = spawn_app().await;
    let subscription_id = seed_active_subscription(&app).await;

    // notification transport for the invoice notice
    Mock::given(method("POST"))
        .and(path_regex("^/email$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&app.notification_server)
        .await;

    let at = Utc.with_ymd_and_hms(2025, 1, 15, 2, 0, 0).unwrap();
    run_sweep(&app.pool, &app.cfg, Sweep::Billing, at).await.unwrap();

    // one invoices job for the due subscription
    let (invoice_jobs,): (i64,) =
        sqlx::query_as("SELECT count(*) FROM jobs WHERE queue = 'invoices'")
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert_eq!(invoice_jobs, 1);

    app.drain_queue(QueueName::Invoices).await;
    assert_eq!(app.count("invoices").await, 1);

    // the invoice notice rode the same transaction
    app.drain_queue(QueueName::Emails).await;
    let sent = app.notification_server.received_requests().await.unwrap();
    assert_eq!(sent.len(), 1);

    // a duplicate billing job cannot double-invoice the cycle
    let payload = serde_json::to_value(hostforge::queue::InvoiceJob::GenerateInvoice {
        subscription_id,
    })
    .unwrap();
    hostforge::queue::enqueue(
        &app.pool,
        QueueName::Invoices,
        &payload,
        &hostforge::queue::EnqueueOptions::default(),
    )
    .await
    .unwrap();
    app.drain_queue(QueueName::Invoices).await;
    assert_eq!(app.count("invoices").await, 1);
}

#[tokio::test]
async fn suspension_sweep_suspends_services_past_due_plus_grace() {
    let app = spawn_app().await;
    let server_id = app.seed_server(10).await;
    let subscription_id = seed_active_subscription(&app).await;

    let customer_id: (Uuid,) = sqlx::query_as("SELECT id FROM customers")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    let website = websites::upsert_pending(
        &app.pool,
        app.tenant_id,
        customer_id.0,
        subscription_id,
        server_id,
        "alice.example.com",
    )
    .await
    .unwrap();
    websites::set_account_artifacts(
        &app.pool,
        website.id,
        "alice0001",
        "/home/alice0001/public_html",
    )
    .await
    .unwrap();

    // due 10 days ago; grace is 3
    invoices::insert_for_cycle(
        &app.pool,
        app.tenant_id,
        subscription_id,
        days_from_now(-40),
        days_from_now(-10),
        799,
        "USD",
        days_from_now(-10),
    )
    .await
    .unwrap()
    .unwrap();

    Mock::given(method("POST"))
        .and(path_regex("^/v1/accounts/alice0001/suspend$"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&app.hosting_server)
        .await;

    let at = Utc.with_ymd_and_hms(2025, 1, 15, 2, 30, 0).unwrap();
    run_sweep(&app.pool, &app.cfg, Sweep::Suspension, at).await.unwrap();
    app.drain_queue(QueueName::Invoices).await;

    let (subscription_status,): (String,) =
        sqlx::query_as("SELECT status::text FROM subscriptions")
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert_eq!(subscription_status, "suspended");
    let (website_status,): (String,) = sqlx::query_as("SELECT status::text FROM websites")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    assert_eq!(website_status, "suspended");

    let suspends = app
        .hosting_server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/v1/accounts/alice0001/suspend")
        .count();
    assert_eq!(suspends, 1);

    // the action is on the activity record
    assert_eq!(app.count("activity_log").await, 1);
}

#[tokio::test]
async fn ssl_reminder_sweep_reminds_once_per_expiry_window() {
    let app = spawn_app().await;
    let server_id = app.seed_server(10).await;
    let subscription_id = seed_active_subscription(&app).await;
    let customer_id: (Uuid,) = sqlx::query_as("SELECT id FROM customers")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    let website = websites::upsert_pending(
        &app.pool,
        app.tenant_id,
        customer_id.0,
        subscription_id,
        server_id,
        "alice.example.com",
    )
    .await
    .unwrap();

    hostforge::store::certificates::insert(
        &app.pool,
        app.tenant_id,
        website.id,
        "cert-1",
        "alice.example.com",
        None,
        days_from_now(10),
    )
    .await
    .unwrap();

    Mock::given(method("POST"))
        .and(path_regex("^/email$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&app.notification_server)
        .await;

    let at = Utc.with_ymd_and_hms(2025, 1, 15, 3, 0, 0).unwrap();
    run_sweep(&app.pool, &app.cfg, Sweep::SslReminders, at).await.unwrap();
    app.drain_queue(QueueName::Emails).await;

    let sent = app.notification_server.received_requests().await.unwrap();
    assert_eq!(sent.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&sent[0].body).unwrap();
    assert!(body["Subject"].as_str().unwrap().contains("alice.example.com"));

    // next day: already reminded for this window
    run_sweep(
        &app.pool,
        &app.cfg,
        Sweep::SslReminders,
        at + chrono::Duration::days(1),
    )
    .await
    .unwrap();
    let (email_jobs,): (i64,) = sqlx::query_as(
        "SELECT count(*) FROM jobs WHERE queue = 'emails' AND status = 'queued'",
    )
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert_eq!(email_jobs, 0);
}

#[tokio::test]
async fn backup_cleanup_removes_only_records_past_retention() {
    let app = spawn_app().await;
    let server_id = app.seed_server(10).await;
    let subscription_id = seed_active_subscription(&app).await;
    let customer_id: (Uuid,) = sqlx::query_as("SELECT id FROM customers")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    let website = websites::upsert_pending(
        &app.pool,
        app.tenant_id,
        customer_id.0,
        subscription_id,
        server_id,
        "alice.example.com",
    )
    .await
    .unwrap();

    let old = backups::insert(&app.pool, app.tenant_id, website.id, "weekly", 1_024).await.unwrap();
    let fresh = backups::insert(&app.pool, app.tenant_id, website.id, "daily", 2_048).await.unwrap();
    // age one of them past the 30-day retention
    sqlx::query("UPDATE backups SET created_at = now() - interval '45 days' WHERE id = $1")
        .bind(old)
        .execute(&app.pool)
        .await
        .unwrap();

    let at = Utc.with_ymd_and_hms(2025, 1, 15, 3, 30, 0).unwrap();
    run_sweep(&app.pool, &app.cfg, Sweep::BackupCleanup, at).await.unwrap();
    app.drain_queue(QueueName::Backups).await;

    let remaining: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM backups")
        .fetch_all(&app.pool)
        .await
        .unwrap();
    assert_eq!(remaining, vec![(fresh,)]);
}
