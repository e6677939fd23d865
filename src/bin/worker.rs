use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use voice_pipeline::{
    config::AppConfig,
    db,
    models::job::Stage,
    services::{
        engine::CommandEngine,
        processor::StageContext,
        queue::{ReceiveOptions, RedisQueue},
        stages::processor_for,
        status::PgStatusStore,
        storage::S3BlobStore,
        worker::{Worker, WorkerSettings},
    },
    shutdown,
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");
    let stage: Stage = config
        .worker_stage
        .expect("WORKER_STAGE must name the stage to serve (separation, training or inference)");

    tracing::info!(stage = %stage, "Starting stage worker");

    // Metrics are pulled from the worker's own scrape listener, when configured.
    match &config.worker_metrics_addr {
        Some(addr) => {
            let addr: SocketAddr = addr.parse().expect("WORKER_METRICS_ADDR is not a socket address");
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .expect("Failed to install Prometheus exporter");
            tracing::info!(%addr, "Serving worker metrics");
        }
        None => {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("Failed to install Prometheus metrics recorder");
        }
    }
    metrics::describe_histogram!(
        "pipeline_processing_seconds",
        "Time spent processing one delivery"
    );
    metrics::describe_counter!(
        "pipeline_jobs_acknowledged_total",
        "Jobs processed and deleted from their queue"
    );
    metrics::describe_counter!(
        "pipeline_jobs_abandoned_total",
        "Jobs left for redelivery after a failure, by error class"
    );
    metrics::describe_counter!(
        "pipeline_jobs_dead_lettered_total",
        "Jobs moved to a dead-letter queue after too many receives"
    );

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    let status = Arc::new(PgStatusStore::new(db_pool));

    // Initialize services
    tracing::info!("Initializing services");
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

    let queue = Arc::new(
        RedisQueue::new(
            &config.redis_url,
            &config.queue_prefix,
            config.dedup_window(),
            config.retention(),
        )
        .expect("Failed to initialize stage queues"),
    );

    let engine = Arc::new(
        CommandEngine::new(
            &stage.to_string(),
            config.engine_command(stage),
            config.engine_timeout(stage),
        )
        .expect("Invalid engine command line"),
    );

    let context = StageContext::new(blobs, status, config.scratch_dir.clone());
    let processor = processor_for(stage, context, engine);

    let settings = WorkerSettings::new(
        stage,
        ReceiveOptions {
            max_messages: config.batch_size.max(1),
            wait: config.receive_wait(),
            visibility: config.visibility_timeout(stage),
        },
    )
    .with_max_receive_count(config.max_receive_count);

    tracing::info!(
        stage = %stage,
        visibility_secs = settings.receive.visibility.as_secs(),
        engine_timeout_secs = config.engine_timeout(stage).as_secs(),
        max_receive_count = ?settings.max_receive_count,
        "Worker ready, starting poll loop"
    );

    let mut worker = Worker::new(queue, processor, settings);
    worker.run(shutdown::cancel_on_signal()).await;
}
