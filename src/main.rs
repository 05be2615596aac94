mod batched_engine;
mod bert_engine;
mod config;
mod engine;
mod error;
mod history;
mod routes;
mod types;
mod upload;

use axum::routing::get;
use axum_prometheus::PrometheusMetricLayer;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use batched_engine::BatchedClassifierWrapper;
use bert_engine::{BertBatchedClassifier, BertConfig};
use config::{BatchConfig, Config};
use history::History;
use routes::AppState;
use upload::UploadDir;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(config.log_json);
    tracing::info!("Starting hatescan with config: {:?}", config);

    let uploads = UploadDir::create(&config.upload_dir).await?;
    tracing::info!(path = %uploads.path().display(), "Upload directory ready");

    let batch_config = BatchConfig::from(&config);
    let bert_config = BertConfig::from(&config);

    tracing::info!("Loading BERT classifier...");
    let bert = BertBatchedClassifier::new(bert_config).await?;
    tracing::info!("Model loaded successfully");

    let (classifier, processor) = BatchedClassifierWrapper::new(batch_config.clone(), bert);

    tokio::spawn(async move {
        tracing::info!("Starting inference worker");
        if let Err(e) = processor.run_forever().await {
            tracing::error!("Inference worker error: {}", e);
        }
    });

    let state = AppState::new(
        Arc::new(classifier),
        Arc::new(History::default()),
        uploads,
    );

    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
    let app = routes::router(state, config.max_upload_bytes)
        .route("/metrics", get(|| async move { metric_handle.render() }))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(prometheus_layer),
        );

    let listener = TcpListener::bind(&config.server_address()).await?;
    tracing::info!("Server running on http://{}", config.server_address());
    tracing::info!(
        "Batch size: {}, Tick duration: {:?}",
        batch_config.batch_size,
        batch_config.tick_duration
    );

    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hatescan=debug".into());

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
