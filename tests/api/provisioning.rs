use hostforge::queue::QueueName;
use hostforge::store::tasks;
use hostforge::store::StepKind;
use hostforge::store::StepStatus;
use hostforge::store::TaskStatus;
use serde_json::json;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;

use crate::helpers::notification_body;
use crate::helpers::spawn_app;
use crate::helpers::TestApp;

async fn requests_to(
    server: &MockServer,
    http_method: &str,
    path_str: &str,
) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.method.as_str() == http_method && r.url.path() == path_str)
        .count()
}

/// Webhook in, drained provisioning queue out.
async fn provision(app: &TestApp) {
    app.seed_checkout("cs_001", "alice@example.com", "alice.example.com")
        .await;
    let event =
        app.checkout_completed_event("e_001", "cs_001", "alice@example.com", "alice.example.com");
    assert_eq!(app.post_webhook(&event).await.status().as_u16(), 200);
    app.drain_queue(QueueName::Provisioning).await;
}

#[tokio::test]
async fn happy_path_provisions_all_six_steps() {
    let app = spawn_app().await;
    app.seed_server(10).await;
    app.mount_happy_adapters().await;

    provision(&app).await;

    let task = app.only_task().await;
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert!(task.finished_at.is_some());

    let steps = tasks::step_log(&app.pool, task.id).await.unwrap();
    let succeeded: Vec<StepKind> = steps
        .iter()
        .filter(|s| s.status == StepStatus::Succeeded)
        .map(|s| s.step)
        .collect();
    assert_eq!(
        succeeded,
        vec![
            StepKind::Account,
            StepKind::Dns,
            StepKind::Ssl,
            StepKind::Email,
            StepKind::Database,
            StepKind::Notify,
        ]
    );

    // website active with every artifact recorded
    let (status, account_id, zone, cert, mailbox, database): (
        String,
        String,
        String,
        String,
        String,
        String,
    ) = sqlx::query_as(
        "SELECT status::text, account_id, dns_zone_id, ssl_cert_id, \
         default_mailbox, default_database FROM websites",
    )
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert_eq!(status, "active");
    assert_eq!(account_id, "alice0001");
    assert_eq!(zone, "zone-1");
    assert_eq!(cert, "cert-1");
    assert_eq!(mailbox, "admin@alice.example.com");
    assert_eq!(database, "alice0001_main");

    let (subscription_status,): (String,) =
        sqlx::query_as("SELECT status::text FROM subscriptions")
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert_eq!(subscription_status, "active");

    // the welcome message went to alice with her domain, panel and
    // nameservers
    let notifications = app.notification_server.received_requests().await.unwrap();
    assert_eq!(notifications.len(), 1);
    let body = notification_body(&notifications[0]);
    assert_eq!(body["To"], json!("alice@example.com"));
    let text = body["TextBody"].as_str().unwrap();
    assert!(text.contains("alice.example.com"));
    assert!(text.contains("s1.example.net"));
    assert!(text.contains("ns1.example.net"));
    assert!(text.contains("ns2.example.net"));

    // one hosting account, created once
    assert_eq!(requests_to(&app.hosting_server, "POST", "/v1/accounts").await, 1);

    // issued certificate recorded for the renewal sweeps
    assert_eq!(app.count("certificates").await, 1);

    // the step log never contains the temporary password
    for step in &steps {
        if let Some(result) = &step.result {
            assert!(!result.to_string().to_lowercase().contains("password"));
        }
    }
}

#[tokio::test]
async fn transient_dns_failure_retries_and_resumes_after_the_account_step() {
    let app = spawn_app().await;
    app.seed_server(10).await;

    // first two zone creations fail retryably, then the backend recovers
    Mock::given(method("POST"))
        .and(path("/zones"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&app.dns_server)
        .await;
    app.mount_happy_adapters().await;

    provision(&app).await;

    let task = app.only_task().await;
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.attempt_count, 3);

    // dns step-log: two failures, then one success
    let steps = tasks::step_log(&app.pool, task.id).await.unwrap();
    let dns_statuses: Vec<StepStatus> = steps
        .iter()
        .filter(|s| s.step == StepKind::Dns)
        .map(|s| s.status)
        .collect();
    assert_eq!(
        dns_statuses,
        vec![StepStatus::Failed, StepStatus::Failed, StepStatus::Succeeded]
    );

    // the dns step reused one idempotency key across attempts
    let dns_keys: std::collections::HashSet<String> = steps
        .iter()
        .filter(|s| s.step == StepKind::Dns)
        .map(|s| s.idempotency_key.clone())
        .collect();
    assert_eq!(dns_keys.len(), 1);

    // the account step ran exactly once despite three task attempts
    assert_eq!(requests_to(&app.hosting_server, "POST", "/v1/accounts").await, 1);
}

#[tokio::test]
async fn fatal_certificate_failure_dead_letters_and_compensates() {
    let app = spawn_app().await;
    app.seed_server(10).await;

    // permanent rejection from the certificate backend
    Mock::given(method("POST"))
        .and(path("/certificates"))
        .respond_with(ResponseTemplate::new(422))
        .mount(&app.certificate_server)
        .await;
    // compensation endpoints
    Mock::given(method("DELETE"))
        .and(path("/zones/zone-1"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&app.dns_server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1/accounts/alice0001"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&app.hosting_server)
        .await;
    app.mount_happy_adapters().await;

    provision(&app).await;

    let task = app.only_task().await;
    assert_eq!(task.status, TaskStatus::DeadLettered);
    assert!(task.last_error.is_some());

    // job dead-lettered alongside the task
    let (job_status, reason): (String, Option<String>) =
        sqlx::query_as("SELECT status::text, dead_letter_reason FROM jobs")
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert_eq!(job_status, "failed");
    assert!(reason.is_some());

    // cleanup ran in reverse: zone deleted, account terminated
    assert_eq!(requests_to(&app.dns_server, "DELETE", "/zones/zone-1").await, 1);
    assert_eq!(
        requests_to(&app.hosting_server, "DELETE", "/v1/accounts/alice0001").await,
        1
    );

    // compensations are on the record
    let steps = tasks::step_log(&app.pool, task.id).await.unwrap();
    let compensated: Vec<StepKind> = steps
        .iter()
        .filter(|s| s.compensation && s.status == StepStatus::Succeeded)
        .map(|s| s.step)
        .collect();
    assert_eq!(compensated, vec![StepKind::Dns, StepKind::Account]);

    // nothing went live, nobody was welcomed
    let (website_status,): (String,) = sqlx::query_as("SELECT status::text FROM websites")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    assert_eq!(website_status, "pending");
    let (subscription_status,): (String,) =
        sqlx::query_as("SELECT status::text FROM subscriptions")
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert_eq!(subscription_status, "pending");
    assert_eq!(requests_to(&app.notification_server, "POST", "/email").await, 0);

    // the capacity slot was handed back
    let (current_accounts,): (i32,) = sqlx::query_as("SELECT current_accounts FROM servers")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    assert_eq!(current_accounts, 0);
}

#[tokio::test]
async fn subscription_lock_defers_a_concurrent_duplicate() {
    let app = spawn_app().await;
    app.seed_server(10).await;
    app.mount_happy_adapters().await;
    app.seed_checkout("cs_001", "alice@example.com", "alice.example.com")
        .await;
    let event =
        app.checkout_completed_event("e_001", "cs_001", "alice@example.com", "alice.example.com");
    assert_eq!(app.post_webhook(&event).await.status().as_u16(), 200);

    let (subscription_id,): (uuid::Uuid,) = sqlx::query_as("SELECT id FROM subscriptions")
        .fetch_one(&app.pool)
        .await
        .unwrap();

    // hold the per-subscription advisory lock (same first-8-bytes
    // derivation the orchestrator uses) from another session
    let lock_key = i64::from_le_bytes(subscription_id.as_bytes()[..8].try_into().unwrap());
    let mut blocker = app.pool.acquire().await.unwrap();
    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(lock_key)
        .execute(&mut *blocker)
        .await
        .unwrap();

    // the worker cannot enter; the job goes back with a short delay and no
    // attempt burned
    let ctx = app.worker_context();
    hostforge::workers::try_execute_one(&ctx, QueueName::Provisioning)
        .await
        .unwrap();
    let (status, attempts): (String, i32) =
        sqlx::query_as("SELECT status::text, attempts FROM jobs")
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert_eq!(status, "queued");
    assert_eq!(attempts, 0);

    // release and let it through
    sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(lock_key)
        .execute(&mut *blocker)
        .await
        .unwrap();
    drop(blocker);

    app.drain_queue(QueueName::Provisioning).await;
    assert_eq!(app.only_task().await.status, TaskStatus::Succeeded);
}

#[tokio::test]
async fn duplicate_provisioning_job_is_a_no_op_once_the_subscription_is_active() {
    let app = spawn_app().await;
    app.seed_server(10).await;
    app.mount_happy_adapters().await;

    provision(&app).await;
    assert_eq!(requests_to(&app.hosting_server, "POST", "/v1/accounts").await, 1);

    // a manual re-enqueue of the same payload
    let (payload,): (serde_json::Value,) = sqlx::query_as("SELECT payload FROM jobs")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    hostforge::queue::enqueue(
        &app.pool,
        QueueName::Provisioning,
        &payload,
        &hostforge::queue::EnqueueOptions::default(),
    )
    .await
    .unwrap();
    app.drain_queue(QueueName::Provisioning).await;

    // no second account, no second welcome
    assert_eq!(requests_to(&app.hosting_server, "POST", "/v1/accounts").await, 1);
    assert_eq!(requests_to(&app.notification_server, "POST", "/email").await, 1);
}

#[tokio::test]
async fn replay_after_exhausted_retries_keeps_succeeded_steps() {
    let app = spawn_app().await;
    app.seed_server(10).await;

    // dns down for good; three attempts exhaust the job
    Mock::given(method("POST"))
        .and(path("/zones"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .mount(&app.dns_server)
        .await;
    app.mount_happy_adapters().await;

    provision(&app).await;
    let task = app.only_task().await;
    assert_eq!(task.status, TaskStatus::DeadLettered);
    assert_eq!(requests_to(&app.hosting_server, "POST", "/v1/accounts").await, 1);

    // operator replays once the backend recovered (the 503 mock is spent)
    let resp = app
        .post_admin(&format!("/provisioning/tasks/{}/replay", task.id))
        .await;
    assert_eq!(resp.status().as_u16(), 202);

    app.drain_queue(QueueName::Provisioning).await;

    let task = app.task_row(task.id).await;
    assert_eq!(task.status, TaskStatus::Succeeded);
    // the account step's external artefact was reused, not recreated
    assert_eq!(requests_to(&app.hosting_server, "POST", "/v1/accounts").await, 1);
}

#[tokio::test]
async fn provisioning_without_capacity_retries_until_dead_letter() {
    let app = spawn_app().await;
    // a full server: no placement possible
    let server_id = app.seed_server(1).await;
    sqlx::query("UPDATE servers SET current_accounts = max_accounts WHERE id = $1")
        .bind(server_id)
        .execute(&app.pool)
        .await
        .unwrap();
    app.mount_happy_adapters().await;

    provision(&app).await;

    let task = app.only_task().await;
    assert_eq!(task.status, TaskStatus::DeadLettered);
    assert!(task
        .last_error
        .as_deref()
        .unwrap()
        .contains("no active server with spare capacity"));
    assert_eq!(requests_to(&app.hosting_server, "POST", "/v1/accounts").await, 0);
}
