use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use voice_pipeline::app_state::AppState;
use voice_pipeline::config::AppConfig;
use voice_pipeline::db;
use voice_pipeline::routes;
use voice_pipeline::services::{
    producer::JobProducer, queue::RedisQueue, status::PgStatusStore, storage::S3BlobStore,
};
use voice_pipeline::shutdown;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing voice-pipeline API server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");

    metrics::describe_counter!(
        "pipeline_jobs_submitted_total",
        "Jobs enqueued by the API, by stage"
    );
    metrics::describe_gauge!(
        "pipeline_queue_depth",
        "Messages waiting on each stage queue"
    );
    metrics::describe_gauge!(
        "pipeline_queue_in_flight",
        "Messages currently leased to workers"
    );

    // Status records
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");
    let status = Arc::new(PgStatusStore::new(db_pool));

    // Blob store
    tracing::info!(bucket = %config.s3_bucket, "Initializing S3 storage client");
    let blobs = Arc::new(
        S3BlobStore::new(
            &config.s3_bucket,
            &config.s3_region,
            &config.s3_endpoint,
            &config.s3_access_key,
            &config.s3_secret_key,
            &config.public_base_url(),
        )
        .expect("Failed to initialize S3 client"),
    );

    // Stage queues
    tracing::info!("Connecting to Redis stage queues");
    let queue = Arc::new(
        RedisQueue::new(
            &config.redis_url,
            &config.queue_prefix,
            config.dedup_window(),
            config.retention(),
        )
        .expect("Failed to initialize stage queues"),
    );

    let producer = JobProducer::new(queue.clone(), blobs, status.clone());
    let state = AppState::new(producer, status, queue);
    let app = routes::router(state, prometheus_handle, config.max_upload_bytes());

    tracing::info!("Starting voice-pipeline on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    let shutdown = shutdown::cancel_on_signal();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .expect("Server error");
}
