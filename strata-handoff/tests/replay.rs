//! Integration tests for the per-node replay pipeline.

mod common;

use common::{point, test_config, RecordingWriter, WriterResponse};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use strata_handoff::{HandoffError, HandoffMetrics, NodeId, NodeProcessor, Queue, ShardId};

const DEST: NodeId = NodeId::new(42);

fn processor(
    dir: &Path,
    writer: Arc<RecordingWriter>,
) -> (NodeProcessor, Arc<HandoffMetrics>) {
    let metrics = Arc::new(HandoffMetrics::new());
    let processor = NodeProcessor::new(
        DEST,
        dir,
        writer,
        test_config(dir),
        Arc::clone(&metrics),
    );
    (processor, metrics)
}

/// Wait until the processor's queue is drained (bounded by `rounds`).
async fn wait_drained(processor: &NodeProcessor, rounds: u32) {
    for _ in 0..rounds {
        if processor.queue_size() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("queue did not drain: {} bytes left", processor.queue_size());
}

#[tokio::test(start_paused = true)]
async fn happy_replay_after_destination_recovers() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let writer = RecordingWriter::new();
    // Destination offline for the first three attempts
    writer.push_responses(3, WriterResponse::Retryable);

    let (processor, metrics) = processor(dir.path(), Arc::clone(&writer));
    processor.open().unwrap();

    let points = vec![point("a"), point("b")];
    processor.write_shard(ShardId::new(7), &points).unwrap();
    let modified_after_write = processor.last_modified();

    wait_drained(&processor, 200).await;

    let calls = writer.calls();
    assert_eq!(calls.len(), 4);
    let delivered = calls.last().unwrap();
    assert_eq!(delivered.shard_id, ShardId::new(7));
    assert_eq!(delivered.destination, DEST);
    assert_eq!(delivered.points, points);

    assert_eq!(processor.queue_size(), 0);
    assert!(processor.last_modified() >= modified_after_write);
    assert_eq!(metrics.snapshot().deliveries, 1);
    assert_eq!(metrics.snapshot().delivery_points, 2);

    processor.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn backoff_follows_exponential_envelope() {
    let dir = tempfile::tempdir().unwrap();
    let writer = RecordingWriter::new();
    // initial=100ms, max=1s: expected gaps 100, 200, 400, 800, 1000
    writer.push_responses(6, WriterResponse::Retryable);

    let (processor, _) = processor(dir.path(), Arc::clone(&writer));
    processor.open().unwrap();
    processor.write_shard(ShardId::new(1), &[point("x")]).unwrap();

    while writer.call_count() < 6 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let calls = writer.calls();
    let gaps: Vec<Duration> = calls
        .windows(2)
        .map(|pair| pair[1].at - pair[0].at)
        .collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400),
            Duration::from_millis(800),
            Duration::from_millis(1000),
        ]
    );

    processor.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn backoff_resets_after_success() {
    let dir = tempfile::tempdir().unwrap();
    let writer = RecordingWriter::new();
    writer.push_responses(3, WriterResponse::Retryable);
    writer.push_response(WriterResponse::Ok);
    writer.push_response(WriterResponse::Retryable);
    writer.push_response(WriterResponse::Ok);

    let (processor, _) = processor(dir.path(), Arc::clone(&writer));
    processor.open().unwrap();
    processor.write_shard(ShardId::new(1), &[point("x")]).unwrap();
    wait_drained(&processor, 200).await;
    processor.write_shard(ShardId::new(2), &[point("y")]).unwrap();
    wait_drained(&processor, 200).await;

    // The second record's retry gap restarted at the initial backoff
    // rather than continuing the first record's doubling.
    let calls = writer.calls();
    assert_eq!(calls.len(), 6);
    let gap = calls[5].at - calls[4].at;
    assert_eq!(gap, Duration::from_millis(100));

    processor.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn poison_record_advances_head() {
    let dir = tempfile::tempdir().unwrap();
    let writer = RecordingWriter::new();
    writer.push_response(WriterResponse::Permanent);

    let (processor, metrics) = processor(dir.path(), Arc::clone(&writer));
    processor.open().unwrap();
    processor.write_shard(ShardId::new(1), &[point("bad")]).unwrap();
    processor.write_shard(ShardId::new(2), &[point("good")]).unwrap();

    wait_drained(&processor, 200).await;

    let calls = writer.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].shard_id, ShardId::new(1));
    assert_eq!(calls[1].shard_id, ShardId::new(2));

    let snap = metrics.snapshot();
    assert_eq!(snap.poison_dropped, 1);
    assert_eq!(snap.deliveries, 1);

    processor.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn undecodable_record_is_dropped() {
    let dir = tempfile::tempdir().unwrap();

    // Seed the queue directory with bytes that do not decode as a shard
    // write, as if a partial deploy left junk behind.
    {
        let config = test_config(dir.path());
        let queue = Queue::open(
            dir.path(),
            config.segment_size,
            config.max_size,
            Arc::new(HandoffMetrics::new()),
        )
        .unwrap();
        queue.append(b"junk").unwrap();
    }

    let writer = RecordingWriter::new();
    let (processor, metrics) = processor(dir.path(), Arc::clone(&writer));
    processor.open().unwrap();
    processor.write_shard(ShardId::new(3), &[point("ok")]).unwrap();

    wait_drained(&processor, 200).await;

    // Junk was skipped without a single delivery attempt
    let calls = writer.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].shard_id, ShardId::new(3));
    assert_eq!(metrics.snapshot().poison_dropped, 1);

    processor.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn delivery_preserves_append_order() {
    let dir = tempfile::tempdir().unwrap();
    let writer = RecordingWriter::new();

    let (processor, _) = processor(dir.path(), Arc::clone(&writer));
    processor.open().unwrap();
    for i in 0..5 {
        processor.write_shard(ShardId::new(i), &[point("p")]).unwrap();
    }

    wait_drained(&processor, 200).await;

    let shards: Vec<u64> = writer.calls().iter().map(|c| c.shard_id.as_u64()).collect();
    assert_eq!(shards, vec![0, 1, 2, 3, 4]);

    processor.close().await.unwrap();
}

#[tokio::test]
async fn lifecycle_guards() {
    let dir = tempfile::tempdir().unwrap();
    let writer = RecordingWriter::new();
    let (processor, _) = processor(dir.path(), Arc::clone(&writer));

    // Not yet open
    assert!(matches!(
        processor.write_shard(ShardId::new(1), &[point("x")]),
        Err(HandoffError::ProcessorClosed { .. })
    ));

    processor.open().unwrap();
    assert!(matches!(
        processor.open(),
        Err(HandoffError::AlreadyOpen { .. })
    ));

    // Purge is illegal while open
    assert!(matches!(
        processor.purge(),
        Err(HandoffError::PurgeBeforeClose { .. })
    ));

    processor.close().await.unwrap();
    processor.close().await.unwrap();

    assert!(matches!(
        processor.write_shard(ShardId::new(1), &[point("x")]),
        Err(HandoffError::ProcessorClosed { .. })
    ));

    processor.purge().unwrap();
    assert!(!dir.path().join("00000000000000000001.hh").exists());
}

#[tokio::test]
async fn queue_survives_close_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let writer = RecordingWriter::new();
    // Destination stays down the whole time
    writer.push_responses(1000, WriterResponse::Retryable);

    {
        let (processor, _) = processor(dir.path(), Arc::clone(&writer));
        processor.open().unwrap();
        processor.write_shard(ShardId::new(9), &[point("kept")]).unwrap();
        processor.close().await.unwrap();
    }

    let succeeding = RecordingWriter::new();
    let (processor, _) = processor(dir.path(), Arc::clone(&succeeding));
    processor.open().unwrap();
    wait_drained(&processor, 200).await;

    let calls = succeeding.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].shard_id, ShardId::new(9));
    assert_eq!(calls[0].points, vec![point("kept")]);

    processor.close().await.unwrap();
}
