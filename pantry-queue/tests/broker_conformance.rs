//! One set of `Broker` contract checks, run against every broker.
//!
//! The Redis variants are ignored by default; run them with
//! `--features redis -- --ignored` and `REDIS_HOST`/`REDIS_PORT` pointing at
//! a disposable server.

use std::time::Duration;

use chrono::Utc;
use pantry_queue::{
    BackoffPolicy, Broker, JobId, JobOptions, JobPriority, JobRecord, JobStatus, MemoryBroker, QueueError,
    Settlement, WorkerId,
};
use serde_json::json;

const QUEUE: &str = "conformance";
const LOCK: Duration = Duration::from_secs(30);

async fn add(broker: &dyn Broker, options: JobOptions) -> JobRecord {
    let id = match options.job_id.clone() {
        Some(id) => id,
        None => broker.next_id().await.unwrap(),
    };
    let record = JobRecord::new(
        id,
        QUEUE,
        "index_recipe",
        json!({"recipe_id": 7}),
        &options,
        options.attempts.unwrap_or(3),
        options.backoff.unwrap_or(BackoffPolicy::fixed(0)),
    );
    let (stored, created) = broker.add(record).await.unwrap();
    assert!(created);
    stored
}

fn worker() -> WorkerId {
    WorkerId::new(QUEUE)
}

async fn claim_id(broker: &dyn Broker) -> Option<JobId> {
    broker.claim(QUEUE, &worker(), LOCK).await.unwrap().map(|job| job.id)
}

fn retryable(error: &str) -> Settlement {
    Settlement::Failed { error: error.to_string(), retryable: true, backoff_cap: None }
}

async fn claims_by_priority_then_fifo(broker: &dyn Broker) {
    let low = add(broker, JobOptions::new().with_priority(JobPriority::Low)).await;
    let first = add(broker, JobOptions::new()).await;
    let second = add(broker, JobOptions::new()).await;
    let critical = add(broker, JobOptions::new().with_priority(JobPriority::Critical)).await;
    let high = add(broker, JobOptions::new().with_priority(JobPriority::High)).await;

    let mut order = Vec::new();
    while let Some(id) = claim_id(broker).await {
        order.push(id);
    }
    assert_eq!(order, vec![critical.id, high.id, first.id, second.id, low.id]);
}

async fn claimed_job_is_active_and_exclusive(broker: &dyn Broker) {
    let job = add(broker, JobOptions::new()).await;
    let holder = worker();

    let claimed = broker.claim(QUEUE, &holder, LOCK).await.unwrap().unwrap();
    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.status, JobStatus::Active);
    assert_eq!(claimed.worker_id.as_ref(), Some(&holder));
    assert!(claimed.lock_until.unwrap() > Utc::now());

    assert!(claim_id(broker).await.is_none());
    assert_eq!(broker.get(QUEUE, &job.id).await.unwrap().unwrap().status, JobStatus::Active);
}

async fn settles_at_most_once(broker: &dyn Broker) {
    let job = add(broker, JobOptions::new()).await;
    claim_id(broker).await.unwrap();

    let done = broker.settle(QUEUE, &job.id, Settlement::Completed).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.completed_at.is_some());

    assert!(broker.settle(QUEUE, &job.id, Settlement::Completed).await.unwrap().is_none());
    assert!(broker.settle(QUEUE, &job.id, retryable("late failure")).await.unwrap().is_none());

    let counts = broker.counts(QUEUE).await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.failed, 0);
}

async fn waiting_job_cannot_be_settled(broker: &dyn Broker) {
    let job = add(broker, JobOptions::new()).await;
    assert!(broker.settle(QUEUE, &job.id, Settlement::Completed).await.unwrap().is_none());
    assert_eq!(broker.counts(QUEUE).await.unwrap().waiting, 1);
}

async fn failures_retry_then_fail(broker: &dyn Broker) {
    let job = add(broker, JobOptions::new().with_attempts(2)).await;

    claim_id(broker).await.unwrap();
    let parked = broker.settle(QUEUE, &job.id, retryable("es down")).await.unwrap().unwrap();
    assert_eq!(parked.status, JobStatus::Delayed);
    assert_eq!(parked.attempts, 1);
    assert_eq!(parked.last_error.as_deref(), Some("es down"));

    // zero backoff: eligible again straight away
    assert_eq!(claim_id(broker).await, Some(job.id.clone()));
    let failed = broker.settle(QUEUE, &job.id, retryable("es still down")).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, 2);

    assert!(claim_id(broker).await.is_none());
    assert_eq!(broker.counts(QUEUE).await.unwrap().failed, 1);
}

async fn delayed_job_promoted_when_due(broker: &dyn Broker) {
    let job = add(broker, JobOptions::new().with_delay(Duration::from_millis(100))).await;
    assert_eq!(job.status, JobStatus::Delayed);

    assert!(claim_id(broker).await.is_none());
    assert_eq!(broker.counts(QUEUE).await.unwrap().delayed, 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let counts = broker.counts(QUEUE).await.unwrap();
    assert_eq!((counts.waiting, counts.delayed), (1, 0));
    assert_eq!(claim_id(broker).await, Some(job.id));
}

async fn promoted_job_keeps_priority(broker: &dyn Broker) {
    add(broker, JobOptions::new()).await;
    let urgent = add(
        broker,
        JobOptions::new()
            .with_priority(JobPriority::Critical)
            .with_delay(Duration::from_millis(50)),
    )
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(claim_id(broker).await, Some(urgent.id));
}

async fn duplicate_id_returns_stored_job(broker: &dyn Broker) {
    let first = add(broker, JobOptions::new().with_job_id("recipe-7")).await;

    let again = JobRecord::new(
        JobId::from("recipe-7"),
        QUEUE,
        "index_recipe",
        json!({"recipe_id": 8}),
        &JobOptions::new(),
        3,
        BackoffPolicy::fixed(0),
    );
    let (stored, created) = broker.add(again).await.unwrap();

    assert!(!created);
    assert_eq!(stored.id, first.id);
    assert_eq!(stored.payload, json!({"recipe_id": 7}));
    assert_eq!(broker.counts(QUEUE).await.unwrap().waiting, 1);
}

async fn clean_removes_strictly_older(broker: &dyn Broker) {
    let done = add(broker, JobOptions::new()).await;
    let pending = add(broker, JobOptions::new()).await;
    claim_id(broker).await.unwrap();
    let settled = broker.settle(QUEUE, &done.id, Settlement::Completed).await.unwrap().unwrap();
    let finished = settled.completed_at.unwrap();

    let kept = broker.clean(QUEUE, JobStatus::Completed, finished).await.unwrap();
    assert!(kept.is_empty());
    assert!(broker.get(QUEUE, &done.id).await.unwrap().is_some());

    let removed = broker
        .clean(QUEUE, JobStatus::Completed, finished + chrono::Duration::milliseconds(1))
        .await
        .unwrap();
    assert_eq!(removed, vec![done.id.clone()]);
    assert!(broker.get(QUEUE, &done.id).await.unwrap().is_none());
    assert!(broker.get(QUEUE, &pending.id).await.unwrap().is_some());
    assert_eq!(broker.counts(QUEUE).await.unwrap().completed, 0);

    let refused = broker.clean(QUEUE, JobStatus::Waiting, Utc::now()).await;
    assert!(matches!(refused, Err(QueueError::InvalidConfig(_))));
}

async fn lock_renewal_requires_holder(broker: &dyn Broker) {
    let job = add(broker, JobOptions::new()).await;
    let holder = worker();
    broker.claim(QUEUE, &holder, LOCK).await.unwrap().unwrap();

    assert!(broker.extend_lock(QUEUE, &job.id, &holder, LOCK).await.unwrap());
    assert!(!broker.extend_lock(QUEUE, &job.id, &worker(), LOCK).await.unwrap());

    broker.settle(QUEUE, &job.id, Settlement::Completed).await.unwrap();
    assert!(!broker.extend_lock(QUEUE, &job.id, &holder, LOCK).await.unwrap());
}

async fn expired_locks_are_reported(broker: &dyn Broker) {
    let stale = add(broker, JobOptions::new()).await;
    let fresh = add(broker, JobOptions::new()).await;
    broker.claim(QUEUE, &worker(), Duration::from_millis(1)).await.unwrap().unwrap();
    broker.claim(QUEUE, &worker(), LOCK).await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let expired = broker.expired_locks(QUEUE, Utc::now()).await.unwrap();
    let ids: Vec<_> = expired.iter().map(|job| job.id.clone()).collect();
    assert_eq!(ids, vec![stale.id.clone()]);
    assert!(!ids.contains(&fresh.id));

    // reporting never requeues
    assert_eq!(broker.get(QUEUE, &stale.id).await.unwrap().unwrap().status, JobStatus::Active);
}

async fn counts_cover_every_status(broker: &dyn Broker) {
    let completed = add(broker, JobOptions::new()).await;
    let failed = add(broker, JobOptions::new()).await;
    add(broker, JobOptions::new()).await;
    add(broker, JobOptions::new()).await;
    add(broker, JobOptions::new().with_delay(Duration::from_secs(3600))).await;

    claim_id(broker).await.unwrap();
    broker.settle(QUEUE, &completed.id, Settlement::Completed).await.unwrap();
    claim_id(broker).await.unwrap();
    broker
        .settle(QUEUE, &failed.id, Settlement::Failed { error: "corrupt".into(), retryable: false, backoff_cap: None })
        .await
        .unwrap();
    claim_id(broker).await.unwrap();

    let counts = broker.counts(QUEUE).await.unwrap();
    assert_eq!(
        (counts.waiting, counts.delayed, counts.active, counts.completed, counts.failed),
        (1, 1, 1, 1, 1)
    );
    assert_eq!(broker.list(QUEUE, JobStatus::Active, 10).await.unwrap().len(), 1);
    assert_eq!(broker.list(QUEUE, JobStatus::Failed, 10).await.unwrap()[0].id, failed.id);
}

async fn unknown_queue_is_empty(broker: &dyn Broker) {
    assert!(broker.claim("nobody", &worker(), LOCK).await.unwrap().is_none());
    assert_eq!(broker.counts("nobody").await.unwrap().total(), 0);
    assert!(broker.get("nobody", &JobId::from("1")).await.unwrap().is_none());
}

async fn closed_broker_rejects_calls(broker: &dyn Broker) {
    add(broker, JobOptions::new()).await;
    broker.close().await.unwrap();

    assert!(broker.next_id().await.unwrap_err().is_transient());
    assert!(broker.claim(QUEUE, &worker(), LOCK).await.unwrap_err().is_transient());
    assert!(broker.counts(QUEUE).await.unwrap_err().is_transient());
}

#[cfg(feature = "redis")]
async fn connect_redis() -> pantry_queue::RedisBroker {
    let config = pantry_queue::BrokerConfig::from_env().unwrap();
    let prefix = format!("pantry-test-{}", uuid::Uuid::new_v4());
    pantry_queue::RedisBroker::connect(&config, prefix).await.unwrap()
}

macro_rules! broker_suite {
    ($($check:ident),* $(,)?) => {
        mod memory_broker {
            use super::*;

            $(
                #[tokio::test]
                async fn $check() {
                    let broker = MemoryBroker::new();
                    super::$check(&broker).await;
                }
            )*
        }

        #[cfg(feature = "redis")]
        mod redis_broker {
            $(
                #[tokio::test]
                #[ignore = "needs a Redis server (REDIS_HOST, REDIS_PORT)"]
                async fn $check() {
                    let broker = super::connect_redis().await;
                    super::$check(&broker).await;
                }
            )*
        }
    };
}

broker_suite!(
    claims_by_priority_then_fifo,
    claimed_job_is_active_and_exclusive,
    settles_at_most_once,
    waiting_job_cannot_be_settled,
    failures_retry_then_fail,
    delayed_job_promoted_when_due,
    promoted_job_keeps_priority,
    duplicate_id_returns_stored_job,
    clean_removes_strictly_older,
    lock_renewal_requires_holder,
    expired_locks_are_reported,
    counts_cover_every_status,
    unknown_queue_is_empty,
    closed_broker_rejects_calls,
);

#[cfg(feature = "redis")]
#[tokio::test]
#[ignore = "needs a Redis server (REDIS_HOST, REDIS_PORT)"]
async fn redis_registry_uses_configured_prefix() {
    use pantry_queue::{BrokerConfig, QueueConfig, QueueRegistry, RegistryConfig};

    let prefix = format!("pantry-test-{}", uuid::Uuid::new_v4());
    let broker_config = BrokerConfig::from_env().unwrap();
    let registry = QueueRegistry::redis(
        RegistryConfig::new()
            .with_queue(QueueConfig::new("email"))
            .with_metrics_interval(None)
            .with_stalled_interval(None)
            .with_key_prefix(prefix.clone()),
        &broker_config,
    )
    .await
    .unwrap();

    let job = registry
        .add_job("email", "send_email", json!({"to": "cook@example.com"}), JobOptions::new())
        .await
        .unwrap();

    let client = ::redis::Client::open(broker_config.url()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let exists: bool = ::redis::cmd("EXISTS")
        .arg(format!("{}:email:job:{}", prefix, job.id))
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(exists);

    registry.shutdown().await.unwrap();
}
