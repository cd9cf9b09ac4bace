mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use common::{
    consumer_config, credentials, endpoint, memory_store, receiver_config, wait_for_condition,
    RecordingHandler, POLL_INTERVAL, WAIT_TIMEOUT,
};
use stream_client::checkpoint::CheckpointStore;
use stream_client::{
    ConsumerClient, Coordinator, CoordinatorConfig, MemoryEndpoint, PartitionReceiver,
    PartitionTarget, Producer, ProducerConfig, ReceiverState, Record, StartPosition,
};

const GROUP: &str = "$Default";

fn producer(endpoint: &MemoryEndpoint) -> Producer {
    Producer::new(
        Arc::new(endpoint.clone()),
        credentials(),
        ProducerConfig::default(),
    )
}

fn start_coordinator(
    partitions: u32,
    store: CheckpointStore,
    cancel: CancellationToken,
) -> Arc<Coordinator> {
    let coordinator = Arc::new(
        Coordinator::new(
            GROUP,
            (0..partitions).collect(),
            CoordinatorConfig {
                check_interval: Duration::from_millis(50),
                rebalance_debounce_interval: Duration::from_millis(10),
                revocation_timeout: Duration::from_secs(1),
                ..Default::default()
            },
        )
        .with_checkpoint_store(store),
    );
    let runner = coordinator.clone();
    tokio::spawn(async move { runner.run(cancel).await });
    coordinator
}

fn member(
    endpoint: &MemoryEndpoint,
    store: &CheckpointStore,
    member: &str,
    handler: Arc<RecordingHandler>,
) -> Arc<ConsumerClient> {
    Arc::new(
        ConsumerClient::new(
            Arc::new(endpoint.clone()),
            credentials(),
            handler,
            consumer_config(member, StartPosition::Earliest),
        )
        .with_checkpoint_store(store.clone()),
    )
}

fn start_consumer(
    endpoint: &MemoryEndpoint,
    store: &CheckpointStore,
    coordinator: &Arc<Coordinator>,
    member_id: &str,
    handler: Arc<RecordingHandler>,
    cancel: CancellationToken,
) -> (Arc<ConsumerClient>, JoinHandle<()>) {
    let consumer = member(endpoint, store, member_id, handler);
    let handle = tokio::spawn(consumer.clone().run(coordinator.clone(), cancel));
    (consumer, handle)
}

#[tokio::test]
async fn receiver_from_latest_sees_records_sent_after_it_started() {
    let endpoint = endpoint(2);
    let producer = producer(&endpoint);
    producer
        .send_record(Record::new("before"), PartitionTarget::Id(0))
        .await
        .unwrap();

    let handler = Arc::new(RecordingHandler::default());
    let mut receiver =
        PartitionReceiver::new(Arc::new(endpoint.clone()), credentials(), receiver_config("r"));
    receiver
        .start(0, StartPosition::Latest, handler.clone())
        .await
        .unwrap();
    assert_eq!(receiver.state(), ReceiverState::Streaming);

    for i in 0..5 {
        producer
            .send_record(Record::new(format!("event {i}")), PartitionTarget::Id(0))
            .await
            .unwrap();
    }

    let check = handler.clone();
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
        let handler = check.clone();
        async move { handler.seen().len() == 5 }
    })
    .await;

    assert_eq!(
        handler.bodies(),
        (0..5).map(|i| format!("event {i}")).collect::<Vec<_>>()
    );
    assert_eq!(handler.offsets_for(0), vec![1, 2, 3, 4, 5]);

    receiver.stop().await.unwrap();
    assert_eq!(receiver.state(), ReceiverState::Stopped);
    producer.close().await;
}

#[tokio::test]
async fn large_batch_is_received_in_order() {
    let endpoint = endpoint(1);
    let producer = producer(&endpoint);

    let mut batch = producer.create_batch_for(PartitionTarget::Id(0));
    for i in 0..3000 {
        batch
            .try_add(Record::new(format!("Event from demo - {i}")))
            .unwrap();
    }
    let receipt = producer.send_batch(batch.seal()).await.unwrap();
    assert_eq!((receipt.first_offset, receipt.last_offset), (0, 2999));

    let handler = Arc::new(RecordingHandler::default());
    let mut receiver =
        PartitionReceiver::new(Arc::new(endpoint.clone()), credentials(), receiver_config("r"));
    receiver
        .start(0, StartPosition::Earliest, handler.clone())
        .await
        .unwrap();

    let check = handler.clone();
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
        let handler = check.clone();
        async move { handler.seen().len() == 3000 }
    })
    .await;

    assert_eq!(handler.offsets_for(0), (0..3000).collect::<Vec<u64>>());
    receiver.stop().await.unwrap();
}

#[tokio::test]
async fn group_consumer_resumes_from_checkpoints_after_restart() {
    let endpoint = endpoint(2);
    let store = memory_store(GROUP);
    let producer = producer(&endpoint);
    let cancel = CancellationToken::new();
    let coordinator = start_coordinator(2, store.clone(), cancel.clone());

    let first_run = CancellationToken::new();
    let first = Arc::new(RecordingHandler::checkpointing());
    let (_, handle) = start_consumer(
        &endpoint,
        &store,
        &coordinator,
        "consumer-a",
        first.clone(),
        first_run.clone(),
    );

    for i in 0..10 {
        producer
            .send_record(Record::new(format!("first {i}")), PartitionTarget::Id(i % 2))
            .await
            .unwrap();
    }
    let check = first.clone();
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
        let handler = check.clone();
        async move { handler.seen().len() == 10 }
    })
    .await;

    first_run.cancel();
    handle.await.unwrap();
    assert_eq!(store.read(0).await.unwrap().map(|c| c.offset), Some(4));
    assert_eq!(store.read(1).await.unwrap().map(|c| c.offset), Some(4));

    for i in 0..4 {
        producer
            .send_record(Record::new(format!("second {i}")), PartitionTarget::Id(i % 2))
            .await
            .unwrap();
    }

    let second = Arc::new(RecordingHandler::checkpointing());
    let (consumer, handle) = start_consumer(
        &endpoint,
        &store,
        &coordinator,
        "consumer-b",
        second.clone(),
        cancel.clone(),
    );
    let check = second.clone();
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
        let handler = check.clone();
        async move { handler.seen().len() == 4 }
    })
    .await;

    let mut bodies = second.bodies();
    bodies.sort();
    assert_eq!(bodies, vec!["second 0", "second 1", "second 2", "second 3"]);
    assert_eq!(second.offsets_for(0), vec![5, 6]);
    assert_eq!(consumer.owned_partitions().await, vec![0, 1]);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn remaining_consumer_takes_over_partitions_of_one_that_left() {
    let endpoint = endpoint(4);
    let store = memory_store(GROUP);
    let producer = producer(&endpoint);
    let cancel = CancellationToken::new();
    let coordinator = start_coordinator(4, store.clone(), cancel.clone());

    let stays = Arc::new(RecordingHandler::checkpointing());
    let leaves = Arc::new(RecordingHandler::checkpointing());
    let leaving_run = CancellationToken::new();
    let (remaining, remaining_handle) = start_consumer(
        &endpoint,
        &store,
        &coordinator,
        "consumer-a",
        stays.clone(),
        cancel.clone(),
    );
    let (_, leaving_handle) = start_consumer(
        &endpoint,
        &store,
        &coordinator,
        "consumer-b",
        leaves.clone(),
        leaving_run.clone(),
    );

    let check = coordinator.clone();
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
        let coordinator = check.clone();
        async move {
            coordinator.assignments_for("consumer-a").len() == 2
                && coordinator.assignments_for("consumer-b").len() == 2
        }
    })
    .await;

    leaving_run.cancel();
    leaving_handle.await.unwrap();

    let check = coordinator.clone();
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
        let coordinator = check.clone();
        async move { coordinator.assignments_for("consumer-a") == vec![0, 1, 2, 3] }
    })
    .await;
    assert_eq!(remaining.owned_partitions().await, vec![0, 1, 2, 3]);

    for partition in 0..4 {
        producer
            .send_record(Record::new(format!("to {partition}")), PartitionTarget::Id(partition))
            .await
            .unwrap();
    }
    let check = stays.clone();
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
        let handler = check.clone();
        async move { handler.seen().len() == 4 }
    })
    .await;
    assert!(leaves.seen().is_empty());

    cancel.cancel();
    remaining_handle.await.unwrap();
}

#[tokio::test]
async fn forced_handoff_keeps_partition_with_new_owner() {
    let endpoint = endpoint(1);
    let store = memory_store(GROUP);
    let producer = producer(&endpoint);
    let coordinator = Coordinator::new(
        GROUP,
        vec![0],
        CoordinatorConfig {
            revocation_timeout: Duration::from_millis(100),
            ..Default::default()
        },
    )
    .with_checkpoint_store(store.clone());

    // The old owner is still inside offset 3 when it loses the partition, and checkpoints it
    // while the new owner is working on the same record.
    let a_handler = Arc::new(RecordingHandler::checkpointing().pausing_at(3, Duration::from_millis(300)));
    let b_handler = Arc::new(RecordingHandler::checkpointing().pausing_at(3, Duration::from_millis(600)));
    let a = member(&endpoint, &store, "a", a_handler.clone());
    let b = member(&endpoint, &store, "b", b_handler.clone());

    coordinator.join("a", a.clone());
    coordinator.rebalance().await;
    for i in 0..4 {
        producer
            .send_record(Record::new(format!("{i}")), PartitionTarget::Id(0))
            .await
            .unwrap();
    }
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
        let seen = a_handler.offsets_for(0);
        async move { seen.contains(&3) }
    })
    .await;

    coordinator.join("b", b.clone());
    coordinator.leave("a");
    let summary = coordinator.rebalance().await;
    assert_eq!((summary.moved, summary.forced), (1, 1));

    for i in 4..9 {
        producer
            .send_record(Record::new(format!("{i}")), PartitionTarget::Id(0))
            .await
            .unwrap();
    }
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
        let seen = b_handler.offsets_for(0);
        async move { seen.contains(&8) }
    })
    .await;

    assert_eq!(a_handler.offsets_for(0), vec![0, 1, 2, 3]);
    assert_eq!(b_handler.offsets_for(0), vec![3, 4, 5, 6, 7, 8]);
    assert!(b_handler.errors().is_empty());
    assert_eq!(b.owned_partitions().await, vec![0]);
    assert_eq!(coordinator.assignments_for("b"), vec![0]);
    let stored = store.read(0).await.unwrap().unwrap();
    assert_eq!((stored.offset, stored.owner.as_str()), (8, "b"));

    b.shutdown().await;
    a.shutdown().await;
}
