use std::sync::Arc;

use crate::services::{producer::JobProducer, queue::WorkQueue, status::StatusStore};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub producer: Arc<JobProducer>,
    pub status: Arc<dyn StatusStore>,
    pub queue: Arc<dyn WorkQueue>,
}

impl AppState {
    pub fn new(
        producer: JobProducer,
        status: Arc<dyn StatusStore>,
        queue: Arc<dyn WorkQueue>,
    ) -> Self {
        Self {
            producer: Arc::new(producer),
            status,
            queue,
        }
    }
}
