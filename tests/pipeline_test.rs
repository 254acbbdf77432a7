//! End-to-end runs of the service against the scripted collaborators.
//!
//! Run with: cargo test --test pipeline_test

mod common;

use pretty_assertions::assert_eq;
use std::time::Duration;

use common::{drain, TestEnvironment};
use mediagate::core::{AppError, QueueError};
use mediagate::download::{CompletionHandle, ProgressPhase};
use mediagate::storage::{DownloadStatus, Persistence};
use mediagate::testing::{MockEngine, MockTransport, TransportCall};
use mediagate::{FetchRequest, Submission};

#[tokio::test]
async fn e2e_free_plan_download_walks_every_status_and_costs_nothing() {
    let env = TestEnvironment::new(MockEngine::new().with_file_size(4096), MockTransport::new());
    env.add_user(1, "free", 0).await;

    let (id, outcome) = env.fetch_and_wait(1, "https://youtu.be/dQw4w9WgXcQ").await;

    assert!(outcome.is_success());
    assert_eq!(
        env.store.statuses(id),
        vec![
            DownloadStatus::Pending,
            DownloadStatus::Downloading,
            DownloadStatus::Processing,
            DownloadStatus::Uploading,
            DownloadStatus::Completed,
        ]
    );

    let record = env.record(id).await;
    assert_eq!(record.file_size, Some(4096));
    assert_eq!(record.file_id, outcome.file_id);
    assert!(record.completed_at.is_some());
    assert_eq!(record.error_message, None);
    // info written by the worker lands next to what admission stored
    assert_eq!(record.metadata["plan"], "free");
    assert_eq!(record.metadata["uploader"], "Mock channel");

    assert_eq!(env.balance(1).await, 0);
    let events = env.store.events().await;
    assert!(events.iter().all(|e| e.event_type != "credits_deducted"));
    assert!(events.iter().any(|e| e.event_type == "download_completed"));

    assert_eq!(env.leftover_workspaces(), 0);
    env.service.shutdown().await;
}

#[tokio::test]
async fn paid_plan_is_debited_once_the_size_is_known() {
    let env = TestEnvironment::new(MockEngine::new(), MockTransport::new());
    env.add_user(2, "basic", 10).await;

    let (_, outcome) = env.fetch_and_wait(2, "https://youtu.be/paid").await;
    assert!(outcome.is_success());

    assert_eq!(env.balance(2).await, 9);
    let deducted: Vec<_> = env
        .store
        .events()
        .await
        .into_iter()
        .filter(|e| e.event_type == "credits_deducted")
        .collect();
    assert_eq!(deducted.len(), 1);
    assert_eq!(deducted[0].data["amount"], 1);
    assert_eq!(deducted[0].data["new_balance"], 9);
    env.service.shutdown().await;
}

#[tokio::test]
async fn failed_upload_refunds_the_debit() {
    let env = TestEnvironment::new(MockEngine::new(), MockTransport::new().fail_everything());
    env.add_user(3, "basic", 10).await;

    let (id, outcome) = env.fetch_and_wait(3, "https://youtu.be/unlucky").await;

    assert_eq!(outcome.status, DownloadStatus::Failed);
    let record = env.record(id).await;
    assert_eq!(record.status, DownloadStatus::Failed);
    assert!(record.error_message.unwrap().contains("mock transport is down"));
    assert_eq!(env.store.statuses(id).last(), Some(&DownloadStatus::Failed));

    assert_eq!(env.balance(3).await, 10);
    let refund = env
        .store
        .events()
        .await
        .into_iter()
        .find(|e| e.event_type == "credits_added")
        .expect("refund event");
    assert_eq!(refund.data["reason"], "refund_upload_failed");

    assert_eq!(env.leftover_workspaces(), 0);
    env.service.shutdown().await;
}

#[tokio::test]
async fn extraction_failure_leaves_a_retryable_record() {
    let env = TestEnvironment::new(
        MockEngine::new().fail_url("https://youtu.be/gone", "Video unavailable"),
        MockTransport::new(),
    );
    env.add_user(4, "free", 0).await;

    let (id, outcome) = env.fetch_and_wait(4, "https://youtu.be/gone").await;
    assert_eq!(outcome.status, DownloadStatus::Failed);
    let record = env.record(id).await;
    assert!(record.error_message.as_deref().unwrap().contains("Video unavailable"));
    assert!(env.transport.calls().is_empty());

    let retried = env.service.retry(id).await.unwrap();
    let Submission::Queued {
        download_id, handle, ..
    } = retried
    else {
        panic!("retry was denied");
    };
    assert_ne!(download_id, id);
    assert_eq!(env.record(download_id).await.retry_count, 1);
    assert_eq!(handle.wait().await.unwrap().status, DownloadStatus::Failed);

    // the worker is still alive for the next request
    let (fine_id, outcome) = env.fetch_and_wait(4, "https://youtu.be/fine").await;
    assert!(outcome.is_success());

    let err = env.service.retry(fine_id).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    env.service.shutdown().await;
}

#[tokio::test]
async fn cancelling_mid_download_releases_the_workspace() {
    let env = TestEnvironment::new(
        MockEngine::new().with_delay(Duration::from_secs(5)),
        MockTransport::new(),
    );
    env.add_user(5, "free", 0).await;

    let submission = env.fetch(5, "https://youtu.be/slow").await;
    let Submission::Queued {
        download_id, handle, ..
    } = submission
    else {
        panic!("request was denied");
    };
    env.wait_for_status(download_id, DownloadStatus::Downloading).await;

    assert!(env.service.cancel(download_id, 5).await.unwrap());
    let outcome = tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.status, DownloadStatus::Cancelled);
    assert_eq!(env.record(download_id).await.status, DownloadStatus::Cancelled);
    assert_eq!(env.leftover_workspaces(), 0);
    assert!(env.transport.calls().is_empty());

    // terminal records cannot be cancelled again, and only by their owner
    assert!(!env.service.cancel(download_id, 5).await.unwrap());
    assert!(env.service.cancel(download_id, 6).await.is_err());
    env.service.shutdown().await;
}

#[tokio::test]
async fn progress_reaches_the_sink_and_the_lookup() {
    let env = TestEnvironment::new(MockEngine::new().with_file_size(10_000), MockTransport::new());
    env.add_user(6, "free", 0).await;

    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    let submission = env
        .service
        .submit(
            FetchRequest::builder()
                .user_id(6)
                .url("https://youtu.be/progress")
                .progress_sink(tx)
                .build(),
        )
        .await
        .unwrap();
    let Submission::Queued {
        download_id, handle, ..
    } = submission
    else {
        panic!("request was denied");
    };
    assert!(handle.wait().await.unwrap().is_success());

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| e.phase == ProgressPhase::Download));
    assert!(events.iter().any(|e| e.phase == ProgressPhase::Upload));
    assert!(events.iter().all(|e| e.download_id == download_id));
    assert!(events.iter().all(|e| e.percentage <= 100.0));

    let progress = env.service.download_progress(download_id).await.unwrap().unwrap();
    assert_eq!(progress.status, DownloadStatus::Completed);
    assert_eq!(progress.percentage, 100.0);
    assert_eq!(progress.snapshot.unwrap().phase, ProgressPhase::Upload);

    assert!(env.service.download_progress(9999).await.unwrap().is_none());
    env.service.shutdown().await;
}

#[tokio::test]
async fn missing_file_part_switches_to_chunked_upload() {
    let env = TestEnvironment::with_settings(
        MockEngine::new().with_file_size(3 * 1024 * 1024),
        MockTransport::new().part_missing_on_direct(1),
        |s| s.chunk_size_mb = 2,
    );
    env.add_user(7, "free", 0).await;

    let (_, outcome) = env.fetch_and_wait(7, "https://youtu.be/flaky").await;
    assert!(outcome.is_success());

    let calls = env.transport.calls();
    assert!(matches!(calls[0], TransportCall::Direct { .. }));
    assert!(matches!(calls[1], TransportCall::OpenSession { .. }));
    // 2 MB halved to 1 MB chunks
    assert_eq!(env.transport.chunk_calls(), 3);
    assert_eq!(
        calls.last(),
        Some(&TransportCall::Finalize {
            received: 3 * 1024 * 1024
        })
    );
    env.service.shutdown().await;
}

#[tokio::test]
async fn full_download_queue_fails_the_new_record() {
    let env = TestEnvironment::with_settings(
        MockEngine::new().with_delay(Duration::from_millis(500)),
        MockTransport::new(),
        |s| {
            s.download_workers = 1;
            s.queue_capacity = 1;
        },
    );
    env.add_user(8, "unlimited", 100).await;

    assert!(env.fetch(8, "https://youtu.be/one").await.download_id().is_some());
    // let the only worker pick up the first request
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(env.fetch(8, "https://youtu.be/two").await.download_id().is_some());

    let err = env
        .service
        .submit(FetchRequest::builder().user_id(8).url("https://youtu.be/three").build())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Queue(QueueError::Full { .. })));

    let failed = env
        .store
        .get_user_downloads(8, 10, Some(DownloadStatus::Failed))
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].url, "https://youtu.be/three");
    assert!(failed[0].error_message.as_deref().unwrap().contains("queue is full"));
    env.service.shutdown().await;
}

#[tokio::test]
async fn oversized_download_fails_after_extraction() {
    let env = TestEnvironment::with_settings(
        MockEngine::new().with_file_size(2 * 1024 * 1024),
        MockTransport::new(),
        |s| s.free_max_file_size_mb = 1,
    );
    env.add_user(9, "free", 0).await;

    let (id, outcome) = env.fetch_and_wait(9, "https://youtu.be/huge").await;
    assert_eq!(outcome.status, DownloadStatus::Failed);
    assert!(env
        .record(id)
        .await
        .error_message
        .unwrap()
        .contains("exceeds the allowed limit (1 MB)"));
    assert!(env.transport.calls().is_empty());
    assert_eq!(env.leftover_workspaces(), 0);
    env.service.shutdown().await;
}

fn queued(submission: Submission) -> (i64, CompletionHandle) {
    match submission {
        Submission::Queued {
            download_id, handle, ..
        } => (download_id, handle),
        Submission::Denied(reason) => panic!("request was denied: {}", reason),
    }
}

#[tokio::test]
async fn shutdown_fails_and_refunds_uploads_still_queued() {
    let env = TestEnvironment::with_settings(
        MockEngine::new(),
        MockTransport::new().with_delay(Duration::from_millis(400)),
        |s| {
            s.download_workers = 2;
            s.upload_workers = 1;
        },
    );
    env.add_user(10, "basic", 10).await;
    env.add_user(11, "basic", 10).await;

    let (first, first_handle) = queued(env.fetch(10, "https://youtu.be/first").await);
    let (second, second_handle) = queued(env.fetch(11, "https://youtu.be/second").await);

    // one upload in flight, the other charged and waiting behind it
    tokio::time::timeout(Duration::from_secs(5), async {
        while env.service.queue_depths().await.1 != 1 || env.transport.calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("an upload was never queued");
    env.service.shutdown().await;

    let mut outcomes = Vec::new();
    for handle in [first_handle, second_handle] {
        let outcome = tokio::time::timeout(Duration::from_secs(2), handle.wait())
            .await
            .expect("waiter was never woken")
            .unwrap();
        outcomes.push(outcome);
    }

    let completed = outcomes.iter().filter(|o| o.is_success()).count();
    assert_eq!(completed, 1);
    let failed = outcomes
        .iter()
        .find(|o| o.status == DownloadStatus::Failed)
        .expect("one upload failed");
    assert!(failed.error.as_deref().unwrap().contains("upload queue is closed"));

    for id in [first, second] {
        assert!(env.record(id).await.status.is_terminal());
    }
    assert_eq!(env.balance(10).await + env.balance(11).await, 19);
    assert!(env
        .store
        .events()
        .await
        .iter()
        .any(|e| e.event_type == "credits_added" && e.data["reason"] == "refund_upload_failed"));
    assert_eq!(env.leftover_workspaces(), 0);
}

#[tokio::test]
async fn shutdown_fails_downloads_still_queued() {
    let env = TestEnvironment::with_settings(
        MockEngine::new().with_delay(Duration::from_millis(300)),
        MockTransport::new(),
        |s| s.download_workers = 1,
    );
    env.add_user(12, "unlimited", 100).await;

    let (running, running_handle) = queued(env.fetch(12, "https://youtu.be/running").await);
    env.wait_for_status(running, DownloadStatus::Downloading).await;
    let (waiting, waiting_handle) = queued(env.fetch(12, "https://youtu.be/waiting").await);

    env.service.shutdown().await;

    // the running download finishes; its upload may or may not start before the upload pool stops
    let outcome = tokio::time::timeout(Duration::from_secs(2), running_handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.status.is_terminal());
    assert!(!outcome.error.unwrap_or_default().contains("download queue"));

    let outcome = tokio::time::timeout(Duration::from_secs(2), waiting_handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, DownloadStatus::Failed);
    assert!(outcome.error.unwrap().contains("download queue is closed"));
    assert_eq!(env.record(waiting).await.status, DownloadStatus::Failed);
    assert_eq!(env.engine.download_calls(), 1);
}
