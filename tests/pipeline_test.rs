//! Pipeline behaviour over the in-memory backends: submission, delivery,
//! processing, redelivery and status reconciliation, without external services.
//!
//! Run with: cargo test --test pipeline_test

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use voice_pipeline::models::job::{SeparationMode, Stage};
use voice_pipeline::models::status::{RecordKey, StageStatus, StatusRecord};
use voice_pipeline::services::processor::ErrorClass;
use voice_pipeline::services::producer::SubmitError;
use voice_pipeline::services::queue::{ReceiveOptions, WorkQueue};
use voice_pipeline::services::worker::DeliveryOutcome;
use voice_pipeline::testing::fixtures::{wav, Backends, LEASE};
use voice_pipeline::testing::MockEngine;

fn key() -> RecordKey {
    RecordKey::new("u1", "lee")
}

/// Record fields that stages write, without the timestamp.
fn outputs(record: &StatusRecord) -> Vec<Option<String>> {
    vec![
        record.origin_url.clone(),
        record.vocal_url.clone(),
        record.instrum_url.clone(),
        record.vc_source_url.clone(),
        record.vc_instrum_url.clone(),
        record.model_url.clone(),
        record.vc_vocal_url.clone(),
        Some(record.trained.to_string()),
    ]
}

#[tokio::test]
async fn test_separation_submit_and_process() {
    let backends = Backends::new();
    let receipt = backends
        .producer()
        .submit_separation("u1", "lee", wav("song.wav"), SeparationMode::Library)
        .await
        .unwrap();

    assert_eq!(receipt.stage, Stage::Separation);
    assert_eq!(receipt.group_key, "u1");
    assert_eq!(backends.queue.len("separation").await, 1);

    // Placeholder written before the job is visible.
    let placeholder = backends.status.record(&key()).await.unwrap();
    assert_eq!(
        placeholder.origin_url.as_deref(),
        Some("https://blobs.test/u1/origin/song.wav")
    );
    assert_eq!(placeholder.stage_status(Stage::Separation), StageStatus::Processing);

    let engine = MockEngine::new(Stage::Separation);
    let mut worker = backends.worker(Stage::Separation, &engine);
    let outcomes = worker.poll_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(outcomes, vec![DeliveryOutcome::Acknowledged]);

    let record = backends.status.record(&key()).await.unwrap();
    assert_eq!(
        record.vocal_url.as_deref(),
        Some("https://blobs.test/u1/separation/song_vocals.wav")
    );
    assert_eq!(
        record.instrum_url.as_deref(),
        Some("https://blobs.test/u1/separation/song_instrum.wav")
    );
    assert_eq!(record.stage_status(Stage::Separation), StageStatus::Completed);
    assert!(backends.queue.is_empty("separation").await);
    assert_eq!(
        backends.blobs.content_type("u1/separation/song_vocals.wav").await.as_deref(),
        Some("audio/wav")
    );
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_submission_processed_once() {
    let backends = Backends::new();
    let producer = backends.producer();

    let first = producer
        .submit_separation("u1", "lee", wav("song.wav"), SeparationMode::Library)
        .await
        .unwrap();
    let second = producer
        .submit_separation("u1", "lee", wav("song.wav"), SeparationMode::Library)
        .await
        .unwrap();
    assert_eq!(first.message_id, second.message_id);
    assert_eq!(backends.queue.len("separation").await, 1);

    let engine = MockEngine::new(Stage::Separation);
    let mut worker = backends.worker(Stage::Separation, &engine);
    let shutdown = CancellationToken::new();
    assert_eq!(
        worker.poll_once(&shutdown).await.unwrap(),
        vec![DeliveryOutcome::Acknowledged]
    );
    assert!(worker.poll_once(&shutdown).await.unwrap().is_empty());
    assert_eq!(engine.run_count(), 1);
}

#[tokio::test]
async fn test_concurrent_duplicates_collapse() {
    let backends = Backends::new();
    let producer = backends.producer();

    let receipts = futures::future::join_all((0..5).map(|_| {
        producer.submit_training("u1", "lee", vec![wav("take1.wav"), wav("take2.wav")])
    }))
    .await;

    let ids: Vec<String> = receipts
        .into_iter()
        .map(|receipt| receipt.unwrap().message_id)
        .collect();
    assert!(ids.iter().all(|id| id == &ids[0]));
    assert_eq!(backends.queue.len("training").await, 1);
}

#[tokio::test]
async fn test_library_and_vc_modes_are_distinct_jobs() {
    let backends = Backends::new();
    let producer = backends.producer();

    let library = producer
        .submit_separation("u1", "lee", wav("song.wav"), SeparationMode::Library)
        .await
        .unwrap();
    let vc = producer
        .submit_separation("u1", "lee", wav("song.wav"), SeparationMode::VoiceConversion)
        .await
        .unwrap();
    assert_ne!(library.message_id, vc.message_id);
    assert_eq!(backends.queue.len("separation").await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_run_redelivered_with_same_result() {
    let failing = Backends::new();
    failing
        .producer()
        .submit_separation("u1", "lee", wav("song.wav"), SeparationMode::Library)
        .await
        .unwrap();

    let engine = MockEngine::new(Stage::Separation);
    engine.fail_next_runs(1);
    let mut worker = failing.worker(Stage::Separation, &engine);
    let shutdown = CancellationToken::new();

    assert_eq!(
        worker.poll_once(&shutdown).await.unwrap(),
        vec![DeliveryOutcome::Abandoned {
            class: ErrorClass::Processing
        }]
    );
    let record = failing.status.record(&key()).await.unwrap();
    assert!(record.vocal_url.is_none());

    tokio::time::advance(LEASE).await;
    assert_eq!(
        worker.poll_once(&shutdown).await.unwrap(),
        vec![DeliveryOutcome::Acknowledged]
    );

    // Same submission on a clean pipeline that never fails.
    let clean = Backends::new();
    clean
        .producer()
        .submit_separation("u1", "lee", wav("song.wav"), SeparationMode::Library)
        .await
        .unwrap();
    let clean_engine = MockEngine::new(Stage::Separation);
    clean
        .worker(Stage::Separation, &clean_engine)
        .poll_once(&shutdown)
        .await
        .unwrap();

    let retried = failing.status.record(&key()).await.unwrap();
    let once = clean.status.record(&key()).await.unwrap();
    assert_eq!(outputs(&retried), outputs(&once));
    assert_eq!(failing.blobs.keys().await, clean.blobs.keys().await);
    for key in clean.blobs.keys().await {
        assert_eq!(failing.blobs.object(&key).await, clean.blobs.object(&key).await);
    }
}

#[tokio::test(start_paused = true)]
async fn test_same_user_jobs_are_serialized() {
    let backends = Backends::new();
    let producer = backends.producer();
    for name in ["one.wav", "two.wav"] {
        producer
            .submit_separation("u1", "lee", wav(name), SeparationMode::Library)
            .await
            .unwrap();
    }
    producer
        .submit_separation("u2", "iu", wav("three.wav"), SeparationMode::Library)
        .await
        .unwrap();

    // Another consumer holds u1's first job.
    let options = ReceiveOptions {
        max_messages: 1,
        wait: Duration::from_secs(1),
        visibility: LEASE,
    };
    let held = backends.queue.receive("separation", options).await.unwrap();
    assert_eq!(held.len(), 1);

    let engine = MockEngine::new(Stage::Separation);
    let mut worker = backends.worker(Stage::Separation, &engine);
    let shutdown = CancellationToken::new();

    // Only u2's job is available while u1's head is leased.
    assert_eq!(
        worker.poll_once(&shutdown).await.unwrap(),
        vec![DeliveryOutcome::Acknowledged]
    );
    assert!(worker.poll_once(&shutdown).await.unwrap().is_empty());
    assert!(backends
        .status
        .record(&RecordKey::new("u1", "lee"))
        .await
        .unwrap()
        .vocal_url
        .is_none());

    backends
        .queue
        .delete("separation", &held[0].receipt)
        .await
        .unwrap();
    assert_eq!(
        worker.poll_once(&shutdown).await.unwrap(),
        vec![DeliveryOutcome::Acknowledged]
    );
    let record = backends.status.record(&key()).await.unwrap();
    assert_eq!(
        record.vocal_url.as_deref(),
        Some("https://blobs.test/u1/separation/two_vocals.wav")
    );
}

#[tokio::test(start_paused = true)]
async fn test_status_write_failure_is_retried() {
    let backends = Backends::new();
    backends
        .producer()
        .submit_separation("u1", "lee", wav("song.wav"), SeparationMode::Library)
        .await
        .unwrap();

    let engine = MockEngine::new(Stage::Separation);
    let mut worker = backends.worker(Stage::Separation, &engine);
    let shutdown = CancellationToken::new();

    backends.status.fail_next_merges(1);
    assert_eq!(
        worker.poll_once(&shutdown).await.unwrap(),
        vec![DeliveryOutcome::Abandoned {
            class: ErrorClass::Reconciliation
        }]
    );
    // Outputs are already uploaded but not recorded.
    assert!(backends
        .blobs
        .object("u1/separation/song_vocals.wav")
        .await
        .is_some());
    assert!(backends.status.record(&key()).await.unwrap().vocal_url.is_none());

    tokio::time::advance(LEASE).await;
    assert_eq!(
        worker.poll_once(&shutdown).await.unwrap(),
        vec![DeliveryOutcome::Acknowledged]
    );
    let record = backends.status.record(&key()).await.unwrap();
    assert!(record.vocal_url.is_some());
    assert_eq!(
        backends.blobs.keys().await,
        vec![
            "u1/origin/song.wav",
            "u1/separation/song_instrum.wav",
            "u1/separation/song_vocals.wav",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_job_keeps_its_place_in_group() {
    let backends = Backends::new();
    let producer = backends.producer();
    for name in ["one.wav", "two.wav"] {
        producer
            .submit_separation("u1", "lee", wav(name), SeparationMode::Library)
            .await
            .unwrap();
    }

    let engine = MockEngine::new(Stage::Separation);
    engine.fail_next_runs(1);
    let mut worker = backends.worker(Stage::Separation, &engine);
    let shutdown = CancellationToken::new();

    assert_eq!(
        worker.poll_once(&shutdown).await.unwrap(),
        vec![DeliveryOutcome::Abandoned {
            class: ErrorClass::Processing
        }]
    );
    // The failed head still holds the group until its lease runs out.
    assert!(worker.poll_once(&shutdown).await.unwrap().is_empty());
    assert_eq!(engine.run_count(), 1);

    tokio::time::advance(LEASE).await;
    for _ in 0..2 {
        assert_eq!(
            worker.poll_once(&shutdown).await.unwrap(),
            vec![DeliveryOutcome::Acknowledged]
        );
    }

    let inputs: Vec<String> = engine
        .recorded_requests()
        .await
        .iter()
        .filter_map(|request| request.input.as_ref())
        .filter_map(|path| path.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .collect();
    assert_eq!(inputs, vec!["one.wav", "one.wav", "two.wav"]);
}

#[tokio::test]
async fn test_identities_with_separators_do_not_collapse() {
    let backends = Backends::new();
    let producer = backends.producer();

    let first = producer
        .submit_separation("a:b", "c", wav("song.wav"), SeparationMode::Library)
        .await
        .unwrap();
    let second = producer
        .submit_separation("a", "b:c", wav("song.wav"), SeparationMode::Library)
        .await
        .unwrap();

    assert_ne!(first.message_id, second.message_id);
    assert_eq!(backends.queue.len("separation").await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_inference_waits_for_earlier_stages() {
    let backends = Backends::new();
    let producer = backends.producer();
    let shutdown = CancellationToken::new();

    producer.submit_inference("u1", "lee", "song.wav").await.unwrap();
    let inference_engine = MockEngine::new(Stage::Inference);
    let mut inference = backends.worker(Stage::Inference, &inference_engine);
    assert_eq!(
        inference.poll_once(&shutdown).await.unwrap(),
        vec![DeliveryOutcome::Abandoned {
            class: ErrorClass::Processing
        }]
    );
    assert_eq!(inference_engine.run_count(), 0);

    producer
        .submit_separation("u1", "lee", wav("song.wav"), SeparationMode::VoiceConversion)
        .await
        .unwrap();
    producer
        .submit_training("u1", "lee", vec![wav("take1.wav"), wav("take2.wav")])
        .await
        .unwrap();

    let separation_engine = MockEngine::new(Stage::Separation);
    let training_engine = MockEngine::new(Stage::Training);
    assert_eq!(
        backends
            .worker(Stage::Separation, &separation_engine)
            .poll_once(&shutdown)
            .await
            .unwrap(),
        vec![DeliveryOutcome::Acknowledged]
    );
    assert_eq!(
        backends
            .worker(Stage::Training, &training_engine)
            .poll_once(&shutdown)
            .await
            .unwrap(),
        vec![DeliveryOutcome::Acknowledged]
    );

    let requests = training_engine.recorded_requests().await;
    assert_eq!(requests[0].options["model_name"], "lee");

    tokio::time::advance(LEASE).await;
    assert_eq!(
        inference.poll_once(&shutdown).await.unwrap(),
        vec![DeliveryOutcome::Acknowledged]
    );

    let record = backends.status.record(&key()).await.unwrap();
    assert_eq!(
        record.vc_source_url.as_deref(),
        Some("https://blobs.test/u1/separation/vc/song_vocals.wav")
    );
    assert!(record.vocal_url.is_none());
    assert!(record.trained);
    assert_eq!(
        record.model_url.as_deref(),
        Some("https://blobs.test/u1/training/lee/lee.pth")
    );
    assert_eq!(
        record.vc_vocal_url.as_deref(),
        Some("https://blobs.test/u1/inference/lee/song_output.wav")
    );
    for stage in Stage::ALL {
        assert_eq!(record.stage_status(stage), StageStatus::Completed);
    }
}

#[tokio::test]
async fn test_training_without_dataset_rejected() {
    let backends = Backends::new();
    let result = backends.producer().submit_training("u1", "lee", vec![]).await;
    assert!(matches!(result, Err(SubmitError::EmptyDataset)));
    assert!(backends.queue.is_empty("training").await);
}

#[tokio::test]
async fn test_enqueue_retried_on_transport_failure() {
    let backends = Backends::new();
    backends.queue.fail_next_enqueues(2);

    backends
        .producer()
        .submit_separation("u1", "lee", wav("song.wav"), SeparationMode::Library)
        .await
        .unwrap();
    assert_eq!(backends.queue.len("separation").await, 1);
}

#[tokio::test]
async fn test_enqueue_failure_surfaces_as_transient() {
    let backends = Backends::new();
    backends.queue.fail_next_enqueues(3);

    let err = backends
        .producer()
        .submit_separation("u1", "lee", wav("song.wav"), SeparationMode::Library)
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::Queue(_)));
    assert!(err.is_transient());
    assert!(backends.queue.is_empty("separation").await);

    // Resubmitting is safe: the upload is overwritten and one job is queued.
    backends
        .producer()
        .submit_separation("u1", "lee", wav("song.wav"), SeparationMode::Library)
        .await
        .unwrap();
    assert_eq!(backends.queue.len("separation").await, 1);
}
