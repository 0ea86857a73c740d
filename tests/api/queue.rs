use std::time::Duration;

use claims::assert_err;
use claims::assert_ok;
use hostforge::queue;
use hostforge::queue::EnqueueOptions;
use hostforge::queue::FailureKind;
use hostforge::queue::QueueError;
use hostforge::queue::QueueName;
use serde_json::json;

use crate::helpers::spawn_app;

const TTL: Duration = Duration::from_secs(60);

#[tokio::test]
async fn jobs_are_claimed_in_priority_then_fifo_order() {
    let app = spawn_app().await;

    let low = queue::enqueue(
        &app.pool,
        QueueName::Emails,
        &json!({"n": "low"}),
        &EnqueueOptions {
            priority: 9,
            ..EnqueueOptions::default()
        },
    )
    .await
    .unwrap();
    let first = queue::enqueue(
        &app.pool,
        QueueName::Emails,
        &json!({"n": "first"}),
        &EnqueueOptions {
            priority: 1,
            ..EnqueueOptions::default()
        },
    )
    .await
    .unwrap();
    let second = queue::enqueue(
        &app.pool,
        QueueName::Emails,
        &json!({"n": "second"}),
        &EnqueueOptions {
            priority: 1,
            ..EnqueueOptions::default()
        },
    )
    .await
    .unwrap();

    let claimed = queue::claim(&app.pool, QueueName::Emails, "w1", 3, TTL)
        .await
        .unwrap();
    let order: Vec<uuid::Uuid> = claimed.iter().map(|j| j.id).collect();
    // ascending priority, then eligible-at/id for the tie
    assert_eq!(order, vec![first, second, low]);
}

#[tokio::test]
async fn queues_are_isolated() {
    let app = spawn_app().await;
    queue::enqueue(
        &app.pool,
        QueueName::Backups,
        &json!({}),
        &EnqueueOptions::default(),
    )
    .await
    .unwrap();

    let other = queue::claim(&app.pool, QueueName::Emails, "w1", 10, TTL)
        .await
        .unwrap();
    assert!(other.is_empty());
}

#[tokio::test]
async fn delayed_jobs_become_eligible_only_after_their_delay() {
    let app = spawn_app().await;
    queue::enqueue(
        &app.pool,
        QueueName::Emails,
        &json!({}),
        &EnqueueOptions {
            delay: Duration::from_secs(3_600),
            ..EnqueueOptions::default()
        },
    )
    .await
    .unwrap();

    let claimed = queue::claim(&app.pool, QueueName::Emails, "w1", 1, TTL)
        .await
        .unwrap();
    assert!(claimed.is_empty());
}

#[tokio::test]
async fn a_reserved_job_is_invisible_until_its_ttl_expires() {
    let app = spawn_app().await;
    let job_id = queue::enqueue(
        &app.pool,
        QueueName::Emails,
        &json!({}),
        &EnqueueOptions::default(),
    )
    .await
    .unwrap();

    let first = queue::claim(&app.pool, QueueName::Emails, "w1", 1, TTL)
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].attempts, 1);

    // second worker sees nothing while the reservation holds
    let second = queue::claim(&app.pool, QueueName::Emails, "w2", 1, TTL)
        .await
        .unwrap();
    assert!(second.is_empty());

    // force the ttl into the past: the reclaim is the at-least-once
    // boundary, and the reclaiming worker sees attempts incremented
    sqlx::query("UPDATE jobs SET reserved_until = now() - interval '1 second' WHERE id = $1")
        .bind(job_id)
        .execute(&app.pool)
        .await
        .unwrap();
    let reclaimed = queue::claim(&app.pool, QueueName::Emails, "w2", 1, TTL)
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, job_id);
    assert_eq!(reclaimed[0].attempts, 2);

    // the original worker's ack now fails
    assert_err!(queue::complete(&app.pool, job_id, "w1").await);
}

#[tokio::test]
async fn a_done_job_is_never_re_emitted() {
    let app = spawn_app().await;
    let job_id = queue::enqueue(
        &app.pool,
        QueueName::Emails,
        &json!({}),
        &EnqueueOptions::default(),
    )
    .await
    .unwrap();

    queue::claim(&app.pool, QueueName::Emails, "w1", 1, TTL)
        .await
        .unwrap();
    assert_ok!(queue::complete(&app.pool, job_id, "w1").await);

    let again = queue::claim(&app.pool, QueueName::Emails, "w1", 1, TTL)
        .await
        .unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn retryable_failures_back_off_then_dead_letter_at_max_attempts() {
    let app = spawn_app().await;
    let job_id = queue::enqueue(
        &app.pool,
        QueueName::Emails,
        &json!({}),
        &EnqueueOptions {
            max_attempts: 2,
            ..EnqueueOptions::default()
        },
    )
    .await
    .unwrap();

    // attempt 1: fails, schedules a backoff
    queue::claim(&app.pool, QueueName::Emails, "w1", 1, TTL)
        .await
        .unwrap();
    queue::fail(&app.pool, job_id, "w1", "boom", FailureKind::Retryable, 300)
        .await
        .unwrap();
    let (status, eligible_in_future): (String, bool) = sqlx::query_as(
        "SELECT status::text, eligible_at > now() FROM jobs WHERE id = $1",
    )
    .bind(job_id)
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert_eq!(status, "queued");
    assert!(eligible_in_future);

    // attempt 2 = max: dead-letter, not re-queued
    sqlx::query("UPDATE jobs SET eligible_at = now() WHERE id = $1")
        .bind(job_id)
        .execute(&app.pool)
        .await
        .unwrap();
    queue::claim(&app.pool, QueueName::Emails, "w1", 1, TTL)
        .await
        .unwrap();
    queue::fail(&app.pool, job_id, "w1", "boom again", FailureKind::Retryable, 300)
        .await
        .unwrap();

    let (status, reason): (String, Option<String>) =
        sqlx::query_as("SELECT status::text, dead_letter_reason FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert_eq!(status, "failed");
    assert_eq!(reason.as_deref(), Some("boom again"));
}

#[tokio::test]
async fn fatal_failures_dead_letter_immediately() {
    let app = spawn_app().await;
    let job_id = queue::enqueue(
        &app.pool,
        QueueName::Emails,
        &json!({}),
        &EnqueueOptions::default(),
    )
    .await
    .unwrap();

    queue::claim(&app.pool, QueueName::Emails, "w1", 1, TTL)
        .await
        .unwrap();
    queue::fail(&app.pool, job_id, "w1", "bad request", FailureKind::Fatal, 300)
        .await
        .unwrap();

    let (status, attempts): (String, i32) =
        sqlx::query_as("SELECT status::text, attempts FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert_eq!(status, "failed");
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn replay_resets_a_dead_lettered_job() {
    let app = spawn_app().await;
    let job_id = queue::enqueue(
        &app.pool,
        QueueName::Emails,
        &json!({}),
        &EnqueueOptions::default(),
    )
    .await
    .unwrap();
    queue::claim(&app.pool, QueueName::Emails, "w1", 1, TTL)
        .await
        .unwrap();
    queue::fail(&app.pool, job_id, "w1", "nope", FailureKind::Fatal, 300)
        .await
        .unwrap();

    assert!(queue::replay(&app.pool, job_id).await.unwrap());

    let claimed = queue::claim(&app.pool, QueueName::Emails, "w1", 1, TTL)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    // attempts were reset before the fresh claim
    assert_eq!(claimed[0].attempts, 1);
    assert_eq!(claimed[0].dead_letter_reason, None);

    // replaying a live job is refused
    assert!(!queue::replay(&app.pool, job_id).await.unwrap());
}

#[tokio::test]
async fn extend_lengthens_a_held_reservation_only() {
    let app = spawn_app().await;
    let job_id = queue::enqueue(
        &app.pool,
        QueueName::Emails,
        &json!({}),
        &EnqueueOptions::default(),
    )
    .await
    .unwrap();
    queue::claim(&app.pool, QueueName::Emails, "w1", 1, TTL)
        .await
        .unwrap();

    assert_ok!(queue::extend(&app.pool, job_id, "w1", Duration::from_secs(600)).await);

    // the wrong worker cannot extend
    let err = queue::extend(&app.pool, job_id, "w2", Duration::from_secs(600)).await;
    assert!(matches!(err, Err(QueueError::ReservationLost)));
}

#[tokio::test]
async fn defer_releases_without_consuming_an_attempt() {
    let app = spawn_app().await;
    let job_id = queue::enqueue(
        &app.pool,
        QueueName::Emails,
        &json!({}),
        &EnqueueOptions::default(),
    )
    .await
    .unwrap();
    queue::claim(&app.pool, QueueName::Emails, "w1", 1, TTL)
        .await
        .unwrap();

    assert_ok!(queue::defer(&app.pool, job_id, "w1", Duration::from_secs(5)).await);

    let (status, attempts): (String, i32) =
        sqlx::query_as("SELECT status::text, attempts FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert_eq!(status, "queued");
    assert_eq!(attempts, 0);
}
