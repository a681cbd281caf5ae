// Write-then-resend tests against a standalone node
//
// Messages go through the write path (bucket resolution, batching, backend
// insert) and come back out through the resend handler.

mod harness;

use harness::{
    message, node_config, standalone_node, standalone_node_with, stream_part, transcript,
    write_all, STREAM,
};
use streamvault_core::{MessageRef, ResendRequest};

#[tokio::test(start_paused = true)]
async fn writes_roll_over_into_separate_buckets() {
    let (backend, node) = standalone_node();
    let messages: Vec<_> = [1_000, 2_000, 3_000, 4_000]
        .into_iter()
        .map(|ts| message(ts, 0, "publisher"))
        .collect();

    write_all(&node, &messages).await;

    assert_eq!(backend.row_count(), 4);
    assert!(backend.buckets().len() >= 3);
    node.shutdown();
}

#[tokio::test(start_paused = true)]
async fn range_spanning_buckets_is_resent_in_order() {
    let (_backend, node) = standalone_node();
    let messages: Vec<_> = [1_000, 2_000, 3_000, 4_000]
        .into_iter()
        .map(|ts| message(ts, 0, "publisher"))
        .collect();
    write_all(&node, &messages).await;

    let request = ResendRequest::range(
        STREAM,
        0,
        "range",
        MessageRef::new(2_000, 0),
        MessageRef::new(3_000, 0),
        None,
        None,
    );
    let outputs = transcript(node.resend(request, None).unwrap()).await;

    assert_eq!(outputs, vec!["Resending", "2000", "3000", "Resent"]);
    node.shutdown();
}

#[tokio::test(start_paused = true)]
async fn last_larger_than_stream_returns_everything() {
    let (_backend, node) = standalone_node();
    let messages: Vec<_> = [1_000, 2_000, 3_000, 4_000]
        .into_iter()
        .map(|ts| message(ts, 0, "publisher"))
        .collect();
    write_all(&node, &messages).await;

    let outputs = transcript(
        node.resend(ResendRequest::last(STREAM, 0, "last", 5), None)
            .unwrap(),
    )
    .await;

    assert_eq!(
        outputs,
        vec!["Resending", "1000", "2000", "3000", "4000", "Resent"]
    );
    node.shutdown();
}

#[tokio::test(start_paused = true)]
async fn from_with_publisher_skips_earlier_sequence_numbers() {
    // Same-timestamp messages share a bucket
    let mut config = node_config();
    config.bucket.max_bucket_records = 100;
    let (_backend, node) = standalone_node_with(config);
    let messages = vec![
        message(1_000, 0, "publisher"),
        message(2_000, 0, "publisher"),
        message(2_000, 1, "publisher"),
        message(3_000, 0, "publisher"),
    ];
    write_all(&node, &messages).await;

    let request = ResendRequest::starting_at(
        STREAM,
        0,
        "from",
        MessageRef::new(2_000, 1),
        Some("publisher".into()),
        Some("chain".into()),
    );
    let outputs = transcript(node.resend(request, None).unwrap()).await;

    assert_eq!(outputs, vec!["Resending", "2000", "3000", "Resent"]);
    node.shutdown();
}

#[tokio::test(start_paused = true)]
async fn unknown_stream_gets_no_resend() {
    let (_backend, node) = standalone_node();

    let outputs = transcript(
        node.resend(ResendRequest::last("no-such-stream", 0, "missing", 10), None)
            .unwrap(),
    )
    .await;

    assert_eq!(outputs, vec!["NoResend"]);
    node.shutdown();
}

#[tokio::test(start_paused = true)]
async fn stats_reflect_written_messages() {
    let (_backend, node) = standalone_node();
    let messages: Vec<_> = [1_000, 2_000, 3_000]
        .into_iter()
        .map(|ts| message(ts, 0, "publisher"))
        .collect();
    write_all(&node, &messages).await;

    let stats = node.store().stream_stats(&stream_part()).await.unwrap();

    assert_eq!(stats.message_count, 3);
    assert_eq!(stats.first_message_timestamp, Some(1_000));
    assert_eq!(stats.last_message_timestamp, Some(3_000));
    node.shutdown();
}

#[tokio::test(start_paused = true)]
async fn shutdown_rejects_further_work() {
    let (_backend, node) = standalone_node();
    node.shutdown();

    assert!(node.write(message(1_000, 0, "publisher")).await.is_err());
    assert!(node
        .resend(ResendRequest::last(STREAM, 0, "late", 1), None)
        .is_err());
}
