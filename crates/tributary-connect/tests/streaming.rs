//! Fetch-acknowledge loop scenarios, plus end-to-end runs against the
//! in-memory backend.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tributary_connect::config::AckMode;
use tributary_connect::error::{ApiError, ConnectorError, StatusCode};
use tributary_connect::lifecycle::{LifecycleState, StopCause};
use tributary_connect::pubsub::{
    BucketCounter, InMemoryClientFactory, InMemoryPubSub, PubSubReceiver, ReceiverGroup,
    ReceiverSettings, SubscriptionTarget,
};
use tributary_connect::testing::{
    pulled, CollectingSink, RecordingScheduler, RecordingStopHook, ScriptedClient, ScriptedFactory,
};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    receiver: PubSubReceiver,
    client: Arc<ScriptedClient>,
    scheduler: Arc<RecordingScheduler>,
    hook: Arc<RecordingStopHook>,
    sink: Arc<CollectingSink>,
}

fn settings() -> ReceiverSettings {
    ReceiverSettings::new(SubscriptionTarget::new("p", "orders").with_topic("events"))
}

fn harness(settings: ReceiverSettings) -> Harness {
    let client = Arc::new(ScriptedClient::new());
    let scheduler = Arc::new(RecordingScheduler::new());
    let hook = Arc::new(RecordingStopHook::new());
    let sink = Arc::new(CollectingSink::new());

    let receiver = PubSubReceiver::builder(settings)
        .client_factory(Arc::new(ScriptedFactory::new(client.clone())))
        .scheduler(scheduler.clone())
        .stop_hook(hook.clone())
        .sink(sink.clone())
        .build()
        .unwrap();

    Harness {
        receiver,
        client,
        scheduler,
        hook,
        sink,
    }
}

async fn finish(handle: tokio::task::JoinHandle<Option<StopCause>>) -> Option<StopCause> {
    tokio::time::timeout(WAIT, handle)
        .await
        .expect("receiver did not finish")
        .unwrap()
}

#[tokio::test]
async fn auto_mode_acknowledges_after_delivery() {
    let h = harness(settings());
    h.client
        .push_pull(Ok(vec![pulled("1", "first"), pulled("2", "second")]));

    let handle = h.receiver.start();
    assert!(h.sink.wait_for(2, WAIT).await);
    assert!(h.client.wait_for_pulls(2, WAIT).await);

    let acked: Vec<String> = h
        .client
        .acked()
        .iter()
        .map(|a| a.as_str().to_string())
        .collect();
    assert_eq!(acked, vec!["ack-1", "ack-2"]);
    assert_eq!(h.receiver.state(), LifecycleState::Streaming);

    h.receiver.stop(StopCause::requested("done"));
    let cause = finish(handle).await.unwrap();
    assert!(!cause.is_failure());

    let messages = h.sink.messages();
    assert_eq!(messages[0].payload, "first".as_bytes());
    assert_eq!(messages[1].receipt_handle.as_str(), "ack-2");
    assert!(messages.iter().all(|m| m.bucket == 0));

    let metrics = h.receiver.metrics();
    assert_eq!(metrics.messages_received, 2);
    assert_eq!(metrics.messages_delivered, 2);
    assert_eq!(metrics.messages_acked, 2);
    assert_eq!(metrics.unacked(), 0);
}

#[tokio::test]
async fn stop_unblocks_pending_pull_and_releases_client_once() {
    let h = harness(settings());

    let handle = h.receiver.start();
    assert!(h.client.wait_for_pulls(1, WAIT).await);

    assert!(h.receiver.stop(StopCause::requested("shutdown")));
    assert!(!h.receiver.stop(StopCause::requested("again")));
    finish(handle).await;

    assert!(h.receiver.is_stopped());
    assert_eq!(h.client.close_calls(), 1);
    assert_eq!(h.hook.stop_count(), 1);
    assert!(h.receiver.acknowledger().is_none());
}

#[tokio::test]
async fn manual_mode_leaves_acknowledgment_to_sink() {
    let h = harness(settings().with_ack_mode(AckMode::Manual));
    h.client.push_pull(Ok(vec![pulled("1", "a"), pulled("2", "b")]));

    let handle = h.receiver.start();
    assert!(h.sink.wait_for(2, WAIT).await);
    assert!(h.client.wait_for_pulls(2, WAIT).await);
    assert_eq!(h.client.ack_calls(), 0);

    let acknowledger = h.receiver.acknowledger().unwrap();
    assert_eq!(acknowledger.subscription(), "projects/p/subscriptions/orders");
    let handles: Vec<_> = h
        .sink
        .messages()
        .into_iter()
        .map(|m| m.receipt_handle)
        .collect();
    acknowledger.ack(&handles).await.unwrap();
    assert_eq!(h.client.acked().len(), 2);

    h.receiver.stop(StopCause::requested("done"));
    finish(handle).await;
    assert_eq!(h.receiver.metrics().messages_acked, 0);
}

#[tokio::test]
async fn retryable_pull_error_is_retried_in_place() {
    let h = harness(settings());
    h.client.push_pull(Err(ApiError::unavailable("blip")));
    h.client.push_pull(Ok(vec![pulled("1", "after blip")]));

    let handle = h.receiver.start();
    assert!(h.sink.wait_for(1, WAIT).await);

    h.receiver.stop(StopCause::requested("done"));
    finish(handle).await;

    assert_eq!(h.client.create_calls(), 1);
    assert_eq!(h.receiver.metrics().retries, 1);
    assert_eq!(h.scheduler.delays()[0], Duration::from_millis(100));
    assert_eq!(h.hook.stop_count(), 1);
    assert!(!h.hook.causes()[0].is_failure());
}

#[tokio::test]
async fn persistent_pull_errors_stop_after_attempt_bound() {
    let h = harness(settings());
    for _ in 0..5 {
        h.client.push_pull(Err(ApiError::unavailable("down")));
    }

    let cause = finish(h.receiver.start()).await.unwrap();

    assert!(cause.is_failure());
    assert_eq!(h.client.pull_calls(), 5);
    assert_eq!(h.hook.stop_count(), 1);
}

#[tokio::test]
async fn non_retryable_pull_error_is_fatal() {
    let h = harness(settings());
    h.client
        .push_pull(Err(ApiError::new(StatusCode::PermissionDenied, "denied")));

    let cause = finish(h.receiver.start()).await.unwrap();

    assert_eq!(
        cause.error().and_then(ConnectorError::status_code),
        Some(StatusCode::PermissionDenied)
    );
    assert_eq!(h.client.pull_calls(), 1);
    assert!(h.scheduler.delays().is_empty());
    assert_eq!(h.hook.stop_count(), 1);
}

#[tokio::test]
async fn empty_pull_pauses_before_next_fetch() {
    let h = harness(settings().with_empty_poll_delay(Duration::from_millis(250)));
    h.client.push_pull(Ok(vec![]));

    let handle = h.receiver.start();
    assert!(h.client.wait_for_pulls(2, WAIT).await);
    h.receiver.stop(StopCause::requested("done"));
    finish(handle).await;

    assert_eq!(h.scheduler.delays(), vec![Duration::from_millis(250)]);
    assert_eq!(h.receiver.metrics().empty_pulls, 1);
}

#[tokio::test]
async fn retryable_sink_error_skips_acknowledgment() {
    let h = harness(settings());
    h.sink
        .fail_next(ConnectorError::sink_retryable("downstream busy"));
    h.client
        .push_pull(Ok(vec![pulled("1", "rejected"), pulled("2", "accepted")]));

    let handle = h.receiver.start();
    assert!(h.sink.wait_for(1, WAIT).await);
    assert!(h.client.wait_for_pulls(2, WAIT).await);
    h.receiver.stop(StopCause::requested("done"));
    finish(handle).await;

    let acked: Vec<String> = h
        .client
        .acked()
        .iter()
        .map(|a| a.as_str().to_string())
        .collect();
    assert_eq!(acked, vec!["ack-2"]);
    assert_eq!(h.receiver.metrics().delivery_failures, 1);
}

#[tokio::test]
async fn fatal_sink_error_stops_receiver() {
    let h = harness(settings());
    h.sink.fail_next(ConnectorError::sink_fatal("closed"));
    h.client.push_pull(Ok(vec![pulled("1", "x")]));

    let cause = finish(h.receiver.start()).await.unwrap();

    assert!(matches!(cause.error(), Some(ConnectorError::Sink { .. })));
    assert_eq!(h.client.ack_calls(), 0);
    assert_eq!(h.hook.stop_count(), 1);
}

#[tokio::test]
async fn retryable_ack_error_is_retried() {
    let h = harness(settings());
    h.client.push_pull(Ok(vec![pulled("1", "x")]));
    h.client.push_ack(Err(ApiError::unavailable("blip")));

    let handle = h.receiver.start();
    assert!(h.client.wait_for_pulls(2, WAIT).await);
    h.receiver.stop(StopCause::requested("done"));
    finish(handle).await;

    assert_eq!(h.client.ack_calls(), 2);
    assert_eq!(h.client.acked().len(), 1);
    assert_eq!(h.receiver.metrics().messages_acked, 1);
}

#[tokio::test]
async fn non_retryable_ack_error_is_fatal() {
    let h = harness(settings());
    h.client.push_pull(Ok(vec![pulled("1", "x")]));
    h.client
        .push_ack(Err(ApiError::new(StatusCode::InvalidArgument, "bad ack id")));

    let cause = finish(h.receiver.start()).await.unwrap();

    assert!(cause.is_failure());
    assert_eq!(h.receiver.metrics().ack_failures, 1);
    assert_eq!(h.sink.len(), 1);
}

#[tokio::test]
async fn no_fetch_when_provisioning_failed() {
    let h = harness(settings());
    h.client
        .push_create(Err(ApiError::new(StatusCode::PermissionDenied, "denied")));

    finish(h.receiver.start()).await;

    assert_eq!(h.client.pull_calls(), 0);
    assert!(h.sink.is_empty());
}

#[tokio::test]
async fn end_to_end_with_in_memory_backend() {
    let backend = InMemoryPubSub::with_pull_wait(Duration::from_millis(20));
    backend.create_topic("p", "events");

    let sink = Arc::new(CollectingSink::new());
    let receiver = PubSubReceiver::builder(settings())
        .client_factory(Arc::new(InMemoryClientFactory::new(backend.clone())))
        .sink(sink.clone())
        .build()
        .unwrap();

    let handle = receiver.start();
    // the subscription only receives messages published after it exists
    let path = "projects/p/subscriptions/orders";
    let deadline = tokio::time::Instant::now() + WAIT;
    while receiver.state() != LifecycleState::Streaming {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for i in 0..5 {
        backend
            .publish("p", "events", format!("order-{}", i), HashMap::new())
            .unwrap();
    }
    assert!(sink.wait_for(5, WAIT).await);

    receiver.stop(StopCause::requested("done"));
    finish(handle).await;

    assert_eq!(backend.backlog(path), 0);
    assert_eq!(backend.outstanding(path), 0);
    let payloads: HashSet<Vec<u8>> = sink.messages().iter().map(|m| m.payload.to_vec()).collect();
    assert_eq!(payloads.len(), 5);
}

#[tokio::test]
async fn group_receivers_get_distinct_buckets() {
    let backend = InMemoryPubSub::with_pull_wait(Duration::from_millis(20));
    backend.create_topic("p", "events");
    let hook = Arc::new(RecordingStopHook::new());
    let sink = Arc::new(CollectingSink::new());

    let builder = PubSubReceiver::builder(settings().with_max_messages(1))
        .client_factory(Arc::new(InMemoryClientFactory::new(backend.clone())))
        .stop_hook(hook.clone())
        .sink(sink.clone())
        .bucket_counter(BucketCounter::new(), 3);
    let group = Arc::new(ReceiverGroup::build(builder, 3).unwrap());

    let buckets: HashSet<u32> = group.receivers().iter().map(|r| r.bucket()).collect();
    assert_eq!(buckets, HashSet::from([0, 1, 2]));

    let runner = {
        let group = group.clone();
        tokio::spawn(async move { group.run().await })
    };

    let deadline = tokio::time::Instant::now() + WAIT;
    while !group
        .receivers()
        .iter()
        .all(|r| r.state() == LifecycleState::Streaming)
    {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for i in 0..9 {
        backend
            .publish("p", "events", format!("m{}", i), HashMap::new())
            .unwrap();
    }
    assert!(sink.wait_for(9, WAIT).await);

    assert_eq!(group.stop_all("done"), 3);
    let causes = tokio::time::timeout(WAIT, runner).await.unwrap().unwrap();

    assert_eq!(causes.len(), 3);
    assert!(causes.iter().flatten().all(|c| !c.is_failure()));
    assert_eq!(hook.stop_count(), 3);
    assert!(sink
        .messages()
        .iter()
        .all(|m| buckets.contains(&m.bucket)));
}
