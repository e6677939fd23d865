//! Voice pipeline
//!
//! Queue-driven audio pipeline with three independent stages: vocal
//! separation, voice model training and voice conversion. An HTTP API
//! uploads inputs and enqueues jobs on per-stage Redis queues; stage workers
//! long-poll their queue, run the stage engine, upload outputs to S3 under
//! deterministic keys and merge progress into a shared PostgreSQL status record.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod shutdown;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
