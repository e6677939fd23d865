use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::models::job::{JobDescriptor, JobPayload, Stage};
use crate::services::processor::{ErrorClass, ProcessError, StageProcessor};
use crate::services::queue::{Delivery, QueueError, ReceiveOptions, WorkQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub stage: Stage,
    pub receive: ReceiveOptions,
    /// Deliveries received more often than this are moved to the dead-letter
    /// queue instead of processed. `None` retries forever.
    pub max_receive_count: Option<u32>,
    /// Pause after a failed `receive` before polling again.
    pub error_backoff: Duration,
}

impl WorkerSettings {
    pub fn new(stage: Stage, receive: ReceiveOptions) -> Self {
        Self {
            stage,
            receive,
            max_receive_count: None,
            error_backoff: Duration::from_secs(1),
        }
    }

    pub fn with_max_receive_count(mut self, max: Option<u32>) -> Self {
        self.max_receive_count = max;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Polling,
    Processing,
    Acknowledging,
    Abandoning,
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Processed and deleted.
    Acknowledged,
    /// Processing failed; left on the queue for redelivery after its lease.
    Abandoned { class: ErrorClass },
    /// Processed, but the delete was rejected or failed. The message will be
    /// delivered again and reprocessed.
    AcknowledgeFailed,
    /// Received too often; moved to the dead-letter queue unprocessed.
    DeadLettered,
}

/// Sequential poll loop feeding one stage processor.
///
/// Scaling out means running more worker processes; per-group exclusion comes
/// from the queue, not from anything held here.
pub struct Worker {
    queue: Arc<dyn WorkQueue>,
    processor: Arc<dyn StageProcessor>,
    settings: WorkerSettings,
    queue_name: String,
    state: WorkerState,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        processor: Arc<dyn StageProcessor>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            processor,
            queue_name: settings.stage.queue_name(),
            settings,
            state: WorkerState::Idle,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Poll until `shutdown` fires.
    ///
    /// Cancellation only interrupts the long-poll. A batch already received is
    /// processed and settled before the loop exits.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        let stage = self.settings.stage;
        tracing::info!(stage = %stage, queue = %self.queue_name, "Worker polling");

        while !shutdown.is_cancelled() {
            match self.poll_once(&shutdown).await {
                Ok(_) => self.record_depth().await,
                Err(e) => {
                    tracing::error!(stage = %stage, error = %e, "Receive failed, backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(self.settings.error_backoff) => {}
                    }
                }
            }
        }

        self.state = WorkerState::Idle;
        tracing::info!(stage = %stage, "Worker stopped");
    }

    /// Receive one batch and settle every delivery in it.
    pub async fn poll_once(
        &mut self,
        shutdown: &CancellationToken,
    ) -> Result<Vec<DeliveryOutcome>, QueueError> {
        self.state = WorkerState::Polling;
        let received = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Ok(Vec::new()),
            result = self.queue.receive(&self.queue_name, self.settings.receive) => result,
        };
        let deliveries = match received {
            Ok(deliveries) => deliveries,
            Err(e) => {
                self.state = WorkerState::Idle;
                return Err(e);
            }
        };

        let mut outcomes = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            outcomes.push(self.handle(delivery).await);
        }
        self.state = WorkerState::Polling;
        Ok(outcomes)
    }

    async fn handle(&mut self, delivery: Delivery) -> DeliveryOutcome {
        let stage = self.settings.stage;

        if let Some(max) = self.settings.max_receive_count {
            if delivery.receive_count > max {
                return self.dead_letter(&delivery).await;
            }
        }

        tracing::info!(
            stage = %stage,
            message_id = %delivery.message_id,
            receive_count = delivery.receive_count,
            "Processing delivery"
        );

        self.state = WorkerState::Processing;
        let started = Instant::now();
        let result = match serde_json::from_str::<JobPayload>(&delivery.body) {
            Ok(payload) => {
                let processor = Arc::clone(&self.processor);
                // Run on its own task so a panicking processor is caught here
                // rather than unwinding through the loop.
                match tokio::spawn(async move { processor.process(payload).await }).await {
                    Ok(result) => result,
                    Err(join) => Err(ProcessError::Panicked(join.to_string())),
                }
            }
            Err(e) => Err(ProcessError::Payload(e)),
        };
        metrics::histogram!("pipeline_processing_seconds", "stage" => stage.to_string())
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(record) => {
                self.state = WorkerState::Acknowledging;
                match self.queue.delete(&self.queue_name, &delivery.receipt).await {
                    Ok(()) => {
                        metrics::counter!("pipeline_jobs_acknowledged_total", "stage" => stage.to_string())
                            .increment(1);
                        tracing::info!(
                            stage = %stage,
                            message_id = %delivery.message_id,
                            user_id = %record.user_id,
                            artist = %record.artist,
                            status = ?record.stage_status(stage),
                            "Job acknowledged"
                        );
                        DeliveryOutcome::Acknowledged
                    }
                    Err(e) => {
                        tracing::warn!(
                            stage = %stage,
                            message_id = %delivery.message_id,
                            receipt = %delivery.receipt,
                            error = %e,
                            "Acknowledge failed, job will be redelivered"
                        );
                        DeliveryOutcome::AcknowledgeFailed
                    }
                }
            }
            Err(e) => {
                self.state = WorkerState::Abandoning;
                let class = e.class();
                metrics::counter!(
                    "pipeline_jobs_abandoned_total",
                    "stage" => stage.to_string(),
                    "class" => class.to_string()
                )
                .increment(1);
                match class {
                    ErrorClass::Reconciliation => tracing::error!(
                        stage = %stage,
                        message_id = %delivery.message_id,
                        receive_count = delivery.receive_count,
                        class = %class,
                        error = %e,
                        "Job abandoned"
                    ),
                    _ => tracing::warn!(
                        stage = %stage,
                        message_id = %delivery.message_id,
                        receive_count = delivery.receive_count,
                        class = %class,
                        error = %e,
                        "Job abandoned"
                    ),
                }
                DeliveryOutcome::Abandoned { class }
            }
        }
    }

    /// Move a delivery to the stage's dead-letter queue, then delete it here.
    ///
    /// If either step fails the delivery stays leased and comes back after its
    /// lease, so the move is retried; dedup keeps the dead-letter copy single.
    async fn dead_letter(&mut self, delivery: &Delivery) -> DeliveryOutcome {
        let stage = self.settings.stage;
        self.state = WorkerState::Abandoning;

        let (group_key, dedup_key) = match serde_json::from_str::<JobPayload>(&delivery.body) {
            Ok(payload) => {
                let descriptor = JobDescriptor::new(payload);
                (descriptor.group_key, descriptor.dedup_key)
            }
            Err(_) => (delivery.message_id.clone(), delivery.message_id.clone()),
        };

        let dlq = stage.dead_letter_queue_name();
        let moved = match self
            .queue
            .enqueue(&dlq, &group_key, &dedup_key, &delivery.body)
            .await
        {
            Ok(_) => self.queue.delete(&self.queue_name, &delivery.receipt).await,
            Err(e) => Err(e),
        };

        match moved {
            Ok(()) => {
                metrics::counter!("pipeline_jobs_dead_lettered_total", "stage" => stage.to_string())
                    .increment(1);
                tracing::error!(
                    stage = %stage,
                    message_id = %delivery.message_id,
                    receive_count = delivery.receive_count,
                    queue = %dlq,
                    "Job dead-lettered"
                );
                DeliveryOutcome::DeadLettered
            }
            Err(e) => {
                tracing::warn!(
                    stage = %stage,
                    message_id = %delivery.message_id,
                    error = %e,
                    "Dead-letter move failed, will retry on redelivery"
                );
                DeliveryOutcome::AcknowledgeFailed
            }
        }
    }

    async fn record_depth(&self) {
        let stage = self.settings.stage.to_string();
        match self.queue.stats(&self.queue_name).await {
            Ok(stats) => {
                metrics::gauge!("pipeline_queue_depth", "stage" => stage.clone())
                    .set(stats.visible as f64);
                metrics::gauge!("pipeline_queue_in_flight", "stage" => stage)
                    .set(stats.in_flight as f64);
            }
            Err(e) => tracing::debug!(stage = %stage, error = %e, "Queue stats unavailable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{SeparationJob, SeparationMode};
    use crate::models::status::{RecordKey, StatusRecord};
    use crate::testing::MemoryQueue;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    const LEASE: Duration = Duration::from_secs(30);

    #[derive(Clone, Copy)]
    enum Step {
        Succeed,
        Fail,
        Panic,
        Stall(Duration),
    }

    struct ScriptedProcessor {
        steps: Mutex<VecDeque<Step>>,
        calls: AtomicUsize,
    }

    impl ScriptedProcessor {
        fn new(steps: &[Step]) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.iter().copied().collect()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl StageProcessor for ScriptedProcessor {
        fn stage(&self) -> Stage {
            Stage::Separation
        }

        async fn process(&self, payload: JobPayload) -> Result<StatusRecord, ProcessError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.steps.lock().await.pop_front().unwrap_or(Step::Succeed);
            match step {
                Step::Succeed => {}
                Step::Fail => return Err(ProcessError::MissingOutput("_vocals.wav".into())),
                Step::Panic => panic!("engine crashed"),
                Step::Stall(d) => tokio::time::sleep(d).await,
            }
            Ok(StatusRecord::empty(&RecordKey::new(
                payload.user_id(),
                payload.artist(),
            )))
        }
    }

    fn body(filename: &str) -> (String, String, String) {
        let descriptor = JobDescriptor::new(JobPayload::Separation(SeparationJob {
            user_id: "u1".into(),
            artist: "lee".into(),
            filename: filename.into(),
            artifact_key: format!("u1/origin/{filename}"),
            mode: SeparationMode::Library,
        }));
        let body = descriptor.body().unwrap();
        (descriptor.group_key, descriptor.dedup_key, body)
    }

    async fn seeded(filenames: &[&str]) -> MemoryQueue {
        let queue = MemoryQueue::new(Duration::from_secs(300));
        for name in filenames {
            let (group, dedup, body) = body(name);
            queue.enqueue("separation", &group, &dedup, &body).await.unwrap();
        }
        queue
    }

    fn worker(queue: &MemoryQueue, processor: Arc<ScriptedProcessor>, max: Option<u32>) -> Worker {
        let settings = WorkerSettings::new(
            Stage::Separation,
            ReceiveOptions {
                max_messages: 1,
                wait: Duration::from_secs(5),
                visibility: LEASE,
            },
        )
        .with_max_receive_count(max);
        Worker::new(Arc::new(queue.clone()), processor, settings)
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_deletes_message() {
        let queue = seeded(&["song.wav"]).await;
        let processor = ScriptedProcessor::new(&[Step::Succeed]);
        let mut worker = worker(&queue, processor.clone(), None);

        let outcomes = worker.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcomes, vec![DeliveryOutcome::Acknowledged]);
        assert!(queue.is_empty("separation").await);
        assert_eq!(worker.state(), WorkerState::Polling);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_redelivered_after_lease() {
        let queue = seeded(&["song.wav"]).await;
        let processor = ScriptedProcessor::new(&[Step::Fail, Step::Succeed]);
        let mut worker = worker(&queue, processor.clone(), None);
        let shutdown = CancellationToken::new();

        let first = worker.poll_once(&shutdown).await.unwrap();
        assert_eq!(
            first,
            vec![DeliveryOutcome::Abandoned {
                class: ErrorClass::Processing
            }]
        );
        assert_eq!(queue.len("separation").await, 1);

        // Hidden until the lease runs out; the long-poll waits it out.
        let second = worker.poll_once(&shutdown).await.unwrap();
        assert!(second.is_empty());
        tokio::time::advance(LEASE).await;
        let third = worker.poll_once(&shutdown).await.unwrap();
        assert_eq!(third, vec![DeliveryOutcome::Acknowledged]);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
        assert!(queue.is_empty("separation").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_is_contained() {
        let queue = seeded(&["song.wav"]).await;
        let processor = ScriptedProcessor::new(&[Step::Panic]);
        let mut worker = worker(&queue, processor, None);

        let outcomes = worker.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcomes,
            vec![DeliveryOutcome::Abandoned {
                class: ErrorClass::Processing
            }]
        );
        assert_eq!(queue.len("separation").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_body_is_abandoned_without_processing() {
        let queue = MemoryQueue::new(Duration::from_secs(300));
        queue.enqueue("separation", "u1", "junk", "not json").await.unwrap();
        let processor = ScriptedProcessor::new(&[]);
        let mut worker = worker(&queue, processor.clone(), None);

        let outcomes = worker.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcomes,
            vec![DeliveryOutcome::Abandoned {
                class: ErrorClass::Processing
            }]
        );
        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlong_processing_loses_lease() {
        let queue = seeded(&["song.wav"]).await;
        let processor = ScriptedProcessor::new(&[Step::Stall(LEASE + Duration::from_secs(1))]);
        let mut worker = worker(&queue, processor, None);

        let outcomes = worker.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcomes, vec![DeliveryOutcome::AcknowledgeFailed]);
        assert_eq!(queue.len("separation").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letter_after_max_receives() {
        let queue = seeded(&["song.wav"]).await;
        let processor = ScriptedProcessor::new(&[Step::Fail, Step::Fail]);
        let mut worker = worker(&queue, processor.clone(), Some(1));
        let shutdown = CancellationToken::new();

        let first = worker.poll_once(&shutdown).await.unwrap();
        assert!(matches!(first[..], [DeliveryOutcome::Abandoned { .. }]));

        tokio::time::advance(LEASE).await;
        let second = worker.poll_once(&shutdown).await.unwrap();
        assert_eq!(second, vec![DeliveryOutcome::DeadLettered]);

        assert!(queue.is_empty("separation").await);
        assert_eq!(queue.len("separation-dead-letter").await, 1);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let queue = seeded(&["a.wav", "b.wav"]).await;
        let processor = ScriptedProcessor::new(&[]);
        let mut worker = worker(&queue, processor.clone(), None);
        let shutdown = CancellationToken::new();

        let trigger = shutdown.clone();
        let handle = tokio::spawn(async move {
            worker.run(shutdown).await;
            worker
        });
        // Both jobs share a group, so they are processed one after the other.
        while !queue.is_empty("separation").await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        trigger.cancel();

        let worker = handle.await.unwrap();
        assert_eq!(worker.state(), WorkerState::Idle);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_poll_returns_nothing() {
        let queue = seeded(&["song.wav"]).await;
        let processor = ScriptedProcessor::new(&[]);
        let mut worker = worker(&queue, processor.clone(), None);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let outcomes = worker.poll_once(&shutdown).await.unwrap();
        assert!(outcomes.is_empty());
        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
    }
}
