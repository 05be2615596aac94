use axum::{
    Router,
    body::Bytes,
    extract::{
        DefaultBodyLimit, Multipart, State, multipart::MultipartRejection,
        rejection::BytesRejection,
    },
    response::{Html, Json},
    routing::{get, post},
};
use metrics::counter;
use std::sync::Arc;

use crate::engine::{Classification, Classifier};
use crate::error::ApiError;
use crate::history::{HISTORY_VIEW, History};
use crate::types::{
    AnalysisEntry, BatchItem, BatchRequest, BatchResponse, CONTENT_PREVIEW_CHARS,
    HistoryResponse, PredictRequest, PredictResponse, UploadResponse, confidence_percent,
    truncate_chars,
};
use crate::upload::UploadDir;

const INDEX_HTML: &str = include_str!("../templates/index.html");

#[derive(Clone)]
pub struct AppState {
    classifier: Arc<dyn Classifier + Send + Sync>,
    history: Arc<History>,
    uploads: UploadDir,
}

impl AppState {
    pub fn new(
        classifier: Arc<dyn Classifier + Send + Sync>,
        history: Arc<History>,
        uploads: UploadDir,
    ) -> Self {
        Self {
            classifier,
            history,
            uploads,
        }
    }

    async fn classify(&self, text: String) -> Result<Classification, ApiError> {
        let classification = self
            .classifier
            .classify(text)
            .await
            .map_err(ApiError::Inference)?;
        counter!("analysis_results_total", "sentiment" => classification.label.as_str())
            .increment(1);
        Ok(classification)
    }
}

/// `max_body_bytes` caps every request body, JSON and multipart alike.
pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/", get(home_handler))
        .route("/predict", post(predict_handler))
        .route("/upload", post(upload_handler))
        .route("/history", get(history_handler))
        .route("/batch", post(batch_handler))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

async fn home_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Body is parsed as JSON whatever the declared content type.
#[tracing::instrument(skip(state, body))]
async fn predict_handler(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<PredictResponse>, ApiError> {
    counter!("analysis_requests_total", "endpoint" => "predict").increment(1);

    let request: PredictRequest = serde_json::from_slice(&body?)?;
    let text = request.text.ok_or(ApiError::MissingText)?;

    let classification = state.classify(text.clone()).await?;
    state.history.append(AnalysisEntry::new(&text, &classification));

    tracing::info!(
        sentiment = %classification.label,
        confidence = classification.confidence,
        probs = ?classification.probs,
        "Text classified"
    );
    Ok(Json(PredictResponse::from_classification(&classification)))
}

#[tracing::instrument(skip(state, multipart))]
async fn upload_handler(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, ApiError> {
    counter!("analysis_requests_total", "endpoint" => "upload").increment(1);

    let multipart = multipart.map_err(|rejection| {
        tracing::debug!("Not a multipart request: {rejection}");
        ApiError::NoFile
    })?;
    let content = state.uploads.intake(multipart).await?;

    let classification = state.classify(content.clone()).await?;

    tracing::info!(
        sentiment = %classification.label,
        content_chars = content.chars().count(),
        "Upload classified"
    );
    Ok(Json(UploadResponse {
        sentiment: classification.label,
        confidence: confidence_percent(classification.confidence),
        content: truncate_chars(&content, CONTENT_PREVIEW_CHARS),
    }))
}

async fn history_handler(State(state): State<AppState>) -> Json<HistoryResponse> {
    tracing::debug!(stored = state.history.len(), "Reading history");
    Json(HistoryResponse {
        history: state.history.recent(HISTORY_VIEW),
    })
}

/// Batch results never enter history.
#[tracing::instrument(skip(state, body))]
async fn batch_handler(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<BatchResponse>, ApiError> {
    counter!("analysis_requests_total", "endpoint" => "batch").increment(1);

    let request: BatchRequest = serde_json::from_slice(&body?)?;
    let texts = request.texts.unwrap_or_default();
    if texts.is_empty() {
        return Err(ApiError::MissingTexts);
    }

    let futures = texts.iter().map(|text| state.classify(text.clone()));
    let classifications = futures::future::join_all(futures).await;

    let mut results = Vec::with_capacity(classifications.len());
    for (index, (text, classification)) in texts.iter().zip(classifications).enumerate() {
        match classification {
            Ok(classification) => results.push(BatchItem::new(text, &classification)),
            Err(err) => {
                tracing::error!(input_index = index, "Batch item failed");
                return Err(err);
            }
        }
    }

    tracing::info!(count = results.len(), "Batch classified");
    Ok(Json(BatchResponse { results }))
}
