//! In-process backends and fixtures for tests.
//!
//! Every external collaborator of the pipeline has an in-memory counterpart
//! here, so the full submit → poll → process → reconcile path can run without
//! Redis, PostgreSQL, S3 or a model runtime.
//!
//! # Example
//!
//! ```rust,ignore
//! use voice_pipeline::testing::{MemoryBlobStore, MemoryQueue, MemoryStatusStore, MockEngine};
//!
//! let queue = MemoryQueue::new(Duration::from_secs(300));
//! let blobs = MemoryBlobStore::new();
//! let status = MemoryStatusStore::new();
//! let engine = MockEngine::new(Stage::Separation);
//! engine.fail_next_runs(1);
//! ```

mod memory_blob;
mod memory_queue;
mod memory_status;
mod mock_engine;

pub use memory_blob::MemoryBlobStore;
pub use memory_queue::MemoryQueue;
pub use memory_status::MemoryStatusStore;
pub use mock_engine::MockEngine;

/// Wiring helpers shared by unit and integration tests.
pub mod fixtures {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{MemoryBlobStore, MemoryQueue, MemoryStatusStore, MockEngine};
    use crate::models::job::Stage;
    use crate::services::processor::{StageContext, StageProcessor};
    use crate::services::producer::{JobProducer, Upload};
    use crate::services::queue::ReceiveOptions;
    use crate::services::stages::processor_for;
    use crate::services::worker::{Worker, WorkerSettings};

    /// Default lease used by test workers.
    pub const LEASE: Duration = Duration::from_secs(60);

    /// One set of in-memory backends shared by a producer and workers.
    #[derive(Clone)]
    pub struct Backends {
        pub queue: MemoryQueue,
        pub blobs: MemoryBlobStore,
        pub status: MemoryStatusStore,
    }

    impl Default for Backends {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Backends {
        pub fn new() -> Self {
            Self {
                queue: MemoryQueue::new(Duration::from_secs(300)),
                blobs: MemoryBlobStore::new(),
                status: MemoryStatusStore::new(),
            }
        }

        pub fn producer(&self) -> JobProducer {
            JobProducer::new(
                Arc::new(self.queue.clone()),
                Arc::new(self.blobs.clone()),
                Arc::new(self.status.clone()),
            )
            .with_enqueue_retry(3, Duration::from_millis(10))
        }

        pub fn context(&self) -> StageContext {
            StageContext::new(
                Arc::new(self.blobs.clone()),
                Arc::new(self.status.clone()),
                None,
            )
        }

        pub fn processor(&self, stage: Stage, engine: &MockEngine) -> Arc<dyn StageProcessor> {
            processor_for(stage, self.context(), Arc::new(engine.clone()))
        }

        /// Worker for `stage` with a one-message batch and a short long-poll.
        pub fn worker(&self, stage: Stage, engine: &MockEngine) -> Worker {
            let settings = WorkerSettings::new(
                stage,
                ReceiveOptions {
                    max_messages: 1,
                    wait: Duration::from_secs(1),
                    visibility: LEASE,
                },
            );
            Worker::new(
                Arc::new(self.queue.clone()),
                self.processor(stage, engine),
                settings,
            )
        }
    }

    /// A short fake WAV upload.
    pub fn wav(filename: &str) -> Upload {
        Upload {
            filename: filename.to_string(),
            data: format!("RIFF-{filename}").into_bytes(),
        }
    }
}
