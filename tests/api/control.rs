use hostforge::queue::QueueName;
use serde_json::json;

use crate::helpers::spawn_app;

#[tokio::test]
async fn control_endpoints_require_the_admin_token() {
    let app = spawn_app().await;

    let no_token = reqwest::Client::new()
        .get(format!("{}/provisioning/tasks", app.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(no_token.status().as_u16(), 401);

    let wrong_token = reqwest::Client::new()
        .get(format!("{}/provisioning/tasks", app.addr))
        .bearer_auth("not-the-admin-token")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong_token.status().as_u16(), 401);

    let with_token = app.get_admin("/provisioning/tasks").await;
    assert_eq!(with_token.status().as_u16(), 200);
}

#[tokio::test]
async fn task_list_filters_by_status() {
    let app = spawn_app().await;
    app.seed_server(10).await;
    app.seed_checkout("cs_001", "alice@example.com", "alice.example.com")
        .await;
    let event =
        app.checkout_completed_event("e_001", "cs_001", "alice@example.com", "alice.example.com");
    assert_eq!(app.post_webhook(&event).await.status().as_u16(), 200);

    let queued: serde_json::Value = app
        .get_admin("/provisioning/tasks?status=queued")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(queued.as_array().unwrap().len(), 1);
    assert_eq!(queued[0]["status"], json!("queued"));

    let succeeded: serde_json::Value = app
        .get_admin("/provisioning/tasks?status=succeeded")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(succeeded.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn task_detail_includes_the_ordered_step_log() {
    let app = spawn_app().await;
    app.seed_server(10).await;
    app.mount_happy_adapters().await;
    app.seed_checkout("cs_001", "alice@example.com", "alice.example.com")
        .await;
    let event =
        app.checkout_completed_event("e_001", "cs_001", "alice@example.com", "alice.example.com");
    assert_eq!(app.post_webhook(&event).await.status().as_u16(), 200);
    app.drain_queue(QueueName::Provisioning).await;

    let task = app.only_task().await;
    let detail: serde_json::Value = app
        .get_admin(&format!("/provisioning/tasks/{}", task.id))
        .await
        .json()
        .await
        .unwrap();

    assert_eq!(detail["task"]["status"], json!("succeeded"));
    let steps = detail["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 6);
    assert_eq!(steps[0]["step"], json!("account"));
    assert_eq!(steps[5]["step"], json!("notify"));
    // the notify record says that, not what, we sent
    assert_eq!(steps[5]["result"], json!({ "notified": true }));
}

#[tokio::test]
async fn unknown_task_detail_is_404() {
    let app = spawn_app().await;
    let resp = app
        .get_admin(&format!("/provisioning/tasks/{}", uuid::Uuid::new_v4()))
        .await;
    assert_eq!(resp.status().as_u16(), 404);
}

#[tokio::test]
async fn replaying_a_live_task_conflicts() {
    let app = spawn_app().await;
    app.seed_server(10).await;
    app.seed_checkout("cs_001", "alice@example.com", "alice.example.com")
        .await;
    let event =
        app.checkout_completed_event("e_001", "cs_001", "alice@example.com", "alice.example.com");
    assert_eq!(app.post_webhook(&event).await.status().as_u16(), 200);

    let task = app.only_task().await;
    let resp = app
        .post_admin(&format!("/provisioning/tasks/{}/replay", task.id))
        .await;
    assert_eq!(resp.status().as_u16(), 409);
}

#[tokio::test]
async fn replay_goes_through_the_idempotency_store() {
    let app = spawn_app().await;
    app.seed_server(10).await;
    app.seed_checkout("cs_001", "alice@example.com", "alice.example.com")
        .await;
    let event =
        app.checkout_completed_event("e_001", "cs_001", "alice@example.com", "alice.example.com");
    assert_eq!(app.post_webhook(&event).await.status().as_u16(), 200);

    // force the round into dead-letter without running workers
    sqlx::query(
        "UPDATE provisioning_tasks SET status = 'dead_lettered', finished_at = now(), \
         last_error = 'boom'",
    )
    .execute(&app.pool)
    .await
    .unwrap();
    sqlx::query("UPDATE jobs SET status = 'failed', dead_letter_reason = 'boom', attempts = 3")
        .execute(&app.pool)
        .await
        .unwrap();

    let task = app.only_task().await;
    let first = app
        .post_admin(&format!("/provisioning/tasks/{}/replay", task.id))
        .await;
    assert_eq!(first.status().as_u16(), 202);

    // the originating event's dedup record was dropped in the same commit,
    // and the replay left its own marker behind
    let (webhook_markers,): (i64,) = sqlx::query_as(
        "SELECT count(*) FROM idempotency WHERE scope = 'webhook' AND external_key = 'e_001'",
    )
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert_eq!(webhook_markers, 0);
    let (replay_markers,): (i64,) =
        sqlx::query_as("SELECT count(*) FROM idempotency WHERE scope = 'replay'")
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert_eq!(replay_markers, 1);

    // a duplicate click replays the stored outcome instead of touching the
    // queue again
    let second = app
        .post_admin(&format!("/provisioning/tasks/{}/replay", task.id))
        .await;
    assert_eq!(second.status().as_u16(), 202);
    let body: serde_json::Value = second.json().await.unwrap();
    assert_eq!(body["replayed"], json!(true));

    let (queued, attempts): (i64, i64) = sqlx::query_as(
        "SELECT count(*), coalesce(sum(attempts), 0) FROM jobs WHERE status = 'queued'",
    )
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert_eq!(queued, 1);
    assert_eq!(attempts, 0);
}

#[tokio::test]
async fn stats_report_queue_counters_and_reservation_leaks() {
    let app = spawn_app().await;
    app.seed_server(10).await;
    app.seed_checkout("cs_001", "alice@example.com", "alice.example.com")
        .await;
    let event =
        app.checkout_completed_event("e_001", "cs_001", "alice@example.com", "alice.example.com");
    assert_eq!(app.post_webhook(&event).await.status().as_u16(), 200);

    let stats: serde_json::Value = app
        .get_admin("/provisioning/stats")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(stats["queue"]["provisioning"]["queued"], json!(1));
    assert_eq!(stats["reservationLeaks"], json!(0));

    // simulate a crashed worker: reserved with an expired ttl
    sqlx::query(
        "UPDATE jobs SET status = 'reserved', reserved_by = 'dead-worker', \
         reserved_until = now() - interval '1 minute'",
    )
    .execute(&app.pool)
    .await
    .unwrap();

    let stats: serde_json::Value = app
        .get_admin("/provisioning/stats")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(stats["reservationLeaks"], json!(1));
}

#[tokio::test]
async fn forgetting_an_idempotency_record_reopens_the_event() {
    let app = spawn_app().await;
    app.seed_server(10).await;
    app.seed_checkout("cs_001", "alice@example.com", "alice.example.com")
        .await;
    let event =
        app.checkout_completed_event("e_001", "cs_001", "alice@example.com", "alice.example.com");
    assert_eq!(app.post_webhook(&event).await.status().as_u16(), 200);

    let resp = app.delete_admin("/provisioning/idempotency/webhook/e_001").await;
    assert_eq!(resp.status().as_u16(), 204);

    // the re-delivered event re-runs, finds the settled checkout, and
    // changes nothing
    assert_eq!(app.post_webhook(&event).await.status().as_u16(), 200);
    assert_eq!(app.count("subscriptions").await, 1);
    assert_eq!(app.count("jobs").await, 1);
}
