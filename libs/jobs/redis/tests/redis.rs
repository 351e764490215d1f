//! Redis driver against a real server. Run with `cargo test -- --ignored`.

use jobs::{Broker, Job, Pipeline, Registry};
use jobs_redis::{DRIVER, RedisFactory};
use redis::AsyncCommands;
use std::time::Duration;
use test_utils::TestDataBuilder;
use test_utils::TestRedis;
use test_utils::assertions::{assert_empty_for, expect_pop};
use tokio::time::Instant;

fn broker(redis: &TestRedis) -> Broker {
    Broker::new(
        Registry::builder()
            .driver(RedisFactory::new(redis.connection_string()))
            .build(),
    )
}

fn fast(pipeline: Pipeline) -> Pipeline {
    pipeline
        .with_option("block_ms", 200)
        .with_option("promote_interval_ms", 100)
        .with_option("redial_base_ms", 50)
        .with_option("redial_max_ms", 500)
        .with_option("redial_max_elapsed_secs", 20)
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_immediate_then_delayed_job() {
    let redis = TestRedis::new().await;
    let broker = broker(&redis);
    broker
        .declare(fast(Pipeline::new("p1", DRIVER).with_priority(5)))
        .await
        .unwrap();

    let started = Instant::now();
    broker
        .push(Job::new("A", "").with_id("A").on_pipeline("p1"))
        .await
        .unwrap();
    broker
        .push(Job::new("B", "").with_id("B").on_pipeline("p1").with_delay(2))
        .await
        .unwrap();

    let queue = broker.queue();
    let first = expect_pop(&queue, Duration::from_secs(2), "immediate job").await;
    assert_eq!(first.job().id, "A");
    assert_eq!(first.priority(), 5);
    first.ack().await.unwrap();

    let second = expect_pop(&queue, Duration::from_secs(5), "delayed job").await;
    assert_eq!(second.job().id, "B");
    assert!(started.elapsed() >= Duration::from_secs(2));
    second.ack().await.unwrap();

    // Settled entries are deleted from the stream
    assert_eq!(redis.stream_len("jobs:p1").await, 0);
    assert_eq!(redis.pending("jobs:p1", "jobs").await, 0);
    assert_eq!(redis.delayed("jobs:p1:delayed").await, 0);

    broker.stop().await.unwrap();
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_exhausted_job_goes_to_dlq() {
    let redis = TestRedis::new().await;
    let builder = TestDataBuilder::from_test_name("test_exhausted_job_goes_to_dlq");
    let pipeline = fast(builder.pipeline(DRIVER, "dlq"));
    let stream = format!("jobs:{}", pipeline.name);

    let broker = broker(&redis);
    broker.declare(pipeline.clone()).await.unwrap();
    broker.push(builder.job(&pipeline, "poison")).await.unwrap();

    let queue = broker.queue();
    let item = expect_pop(&queue, Duration::from_secs(2), "first delivery").await;
    item.nack(true, 0).await.unwrap();

    let again = expect_pop(&queue, Duration::from_secs(2), "retry").await;
    assert_eq!(again.job().attempt, 1);
    again.nack(false, 0).await.unwrap();

    assert_eq!(redis.stream_len(&format!("{stream}:dlq")).await, 1);
    assert_eq!(redis.stream_len(&stream).await, 0);

    let mut conn = redis.connection();
    let dead: redis::streams::StreamRangeReply = conn.xrange_all(format!("{stream}:dlq")).await.unwrap();
    let entry = &dead.ids[0];
    assert_eq!(entry.get::<String>("attempt").as_deref(), Some("1"));
    assert!(entry.contains_key("failed_at"));

    broker.stop().await.unwrap();
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_pause_holds_jobs_in_stream() {
    let redis = TestRedis::new().await;
    let broker = broker(&redis);
    broker.declare(fast(Pipeline::new("p1", DRIVER))).await.unwrap();
    broker.pause("p1").await.unwrap();

    for i in 0..2 {
        broker
            .push(Job::new("a", "").with_id(format!("a-{i}")).on_pipeline("p1"))
            .await
            .unwrap();
    }

    let queue = broker.queue();
    assert_empty_for(&queue, Duration::from_millis(500), "paused pipeline").await;
    assert_eq!(redis.stream_len("jobs:p1").await, 2);
    let paused = broker.stats("p1").await.unwrap();
    assert_eq!(paused.active_count, 2);
    assert!(!paused.ready);

    broker.resume("p1").await.unwrap();
    for _ in 0..2 {
        expect_pop(&queue, Duration::from_secs(2), "resumed pipeline")
            .await
            .ack()
            .await
            .unwrap();
    }
    broker.stop().await.unwrap();
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_push_recovers_after_connection_loss() {
    let redis = TestRedis::new().await;
    let broker = broker(&redis);
    broker.declare(fast(Pipeline::new("p1", DRIVER))).await.unwrap();
    let queue = broker.queue();

    broker
        .push(Job::new("before", "").on_pipeline("p1"))
        .await
        .unwrap();
    expect_pop(&queue, Duration::from_secs(2), "before outage")
        .await
        .ack()
        .await
        .unwrap();

    assert!(redis.kill_clients().await >= 2);

    // The first push may observe the dead socket; later ones run on the
    // redialed connection
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match broker.push(Job::new("after", "").on_pipeline("p1")).await {
            Ok(()) => break,
            Err(e) if Instant::now() < deadline => {
                tracing::debug!(error = %e, "push during redial");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => panic!("push never recovered: {e}"),
        }
    }

    let item = expect_pop(&queue, Duration::from_secs(5), "after outage").await;
    assert_eq!(item.job().name, "after");
    item.ack().await.unwrap();
    assert!(broker.stats("p1").await.unwrap().ready);

    broker.stop().await.unwrap();
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_in_flight_delivery_not_duplicated_by_redial() {
    let redis = TestRedis::new().await;
    let broker = broker(&redis);
    broker.declare(fast(Pipeline::new("p1", DRIVER))).await.unwrap();
    let queue = broker.queue();

    broker
        .push(Job::new("A", "").with_id("A").on_pipeline("p1"))
        .await
        .unwrap();
    let held = expect_pop(&queue, Duration::from_secs(2), "first delivery").await;

    // The listener's blocking read dies with the connection and the redial
    // replays this consumer's pending list. The held entry is still in flight,
    // so it is not handed out a second time.
    assert!(redis.kill_clients().await >= 1);
    assert_empty_for(&queue, Duration::from_secs(2), "entry already in flight").await;
    assert_eq!(broker.stats("p1").await.unwrap().reserved_count, 1);

    // Acking over the redialed connection settles the entry
    held.ack().await.unwrap();
    assert_eq!(redis.stream_len("jobs:p1").await, 0);
    assert_eq!(redis.pending("jobs:p1", "jobs").await, 0);
    assert_eq!(broker.stats("p1").await.unwrap().reserved_count, 0);

    broker.stop().await.unwrap();
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_resume_replays_entries_read_while_pausing() {
    let redis = TestRedis::new().await;
    let broker = broker(&redis);
    broker
        .declare(fast(Pipeline::new("p1", DRIVER).with_option("consumer", "worker-1")))
        .await
        .unwrap();
    broker.pause("p1").await.unwrap();
    broker
        .push(Job::new("A", "").with_id("A").on_pipeline("p1"))
        .await
        .unwrap();

    // A read cancelled by pause after the server answered leaves the entry
    // pending on this consumer without anyone holding it
    let _: redis::Value = redis::cmd("XREADGROUP")
        .arg("GROUP")
        .arg("jobs")
        .arg("worker-1")
        .arg("COUNT")
        .arg(10)
        .arg("STREAMS")
        .arg("jobs:p1")
        .arg(">")
        .query_async(&mut redis.connection())
        .await
        .unwrap();
    assert_eq!(redis.pending("jobs:p1", "jobs").await, 1);

    broker.resume("p1").await.unwrap();
    let queue = broker.queue();
    let item = expect_pop(&queue, Duration::from_secs(2), "entry pending before resume").await;
    assert_eq!(item.job().id, "A");
    item.ack().await.unwrap();
    assert_eq!(redis.pending("jobs:p1", "jobs").await, 0);

    broker.stop().await.unwrap();
}
