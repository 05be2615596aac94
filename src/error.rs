use axum::Json;
use axum::extract::multipart::MultipartError;
use axum::extract::rejection::BytesRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use metrics::counter;
use serde_json::json;
use thiserror::Error;

/// Everything a handler can fail with.
///
/// Client mistakes become a 400 carrying `{"error": message}`. Storage and
/// inference failures are not the caller's fault and surface as a bare 500.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request body could not be buffered, e.g. it is over the size cap.
    #[error("{}", .0.body_text())]
    Body(#[from] BytesRejection),

    #[error("Invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("No text provided")]
    MissingText,

    #[error("No texts provided")]
    MissingTexts,

    #[error("No file uploaded")]
    NoFile,

    #[error("No file selected")]
    EmptyFilename,

    #[error("Invalid file type")]
    InvalidFileType,

    /// Transport-level failure while streaming the multipart body, e.g. the
    /// body limit being exceeded.
    #[error("{}", .0.body_text())]
    Multipart(#[from] MultipartError),

    #[error("Error reading file: {0}")]
    FileRead(String),

    #[error("failed to store upload: {0}")]
    Storage(#[from] std::io::Error),

    #[error("inference failed: {0:#}")]
    Inference(anyhow::Error),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidJson(_)
            | Self::MissingText
            | Self::MissingTexts
            | Self::NoFile
            | Self::EmptyFilename
            | Self::InvalidFileType
            | Self::FileRead(_) => StatusCode::BAD_REQUEST,
            Self::Body(err) => err.status(),
            Self::Multipart(err) => err.status(),
            Self::Storage(_) | Self::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Label used for the rejection counter.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Body(_) => "body",
            Self::InvalidJson(_) => "invalid_json",
            Self::MissingText | Self::MissingTexts => "missing_field",
            Self::NoFile => "no_file",
            Self::EmptyFilename => "empty_filename",
            Self::InvalidFileType => "invalid_file_type",
            Self::Multipart(_) => "multipart",
            Self::FileRead(_) => "file_read",
            Self::Storage(_) => "storage",
            Self::Inference(_) => "inference",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        counter!("request_errors_total", "reason" => self.reason()).increment(1);

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
            return status.into_response();
        }

        tracing::debug!(%status, error = %self, "Rejecting request");
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_bad_requests() {
        for err in [
            ApiError::MissingText,
            ApiError::MissingTexts,
            ApiError::NoFile,
            ApiError::EmptyFilename,
            ApiError::InvalidFileType,
            ApiError::FileRead("stream did not contain valid UTF-8".into()),
        ] {
            assert_eq!(err.status_code(), StatusCode::BAD_REQUEST, "{err}");
        }
    }

    #[test]
    fn messages_match_api_contract() {
        assert_eq!(ApiError::MissingText.to_string(), "No text provided");
        assert_eq!(ApiError::MissingTexts.to_string(), "No texts provided");
        assert_eq!(ApiError::NoFile.to_string(), "No file uploaded");
        assert_eq!(ApiError::EmptyFilename.to_string(), "No file selected");
        assert_eq!(ApiError::InvalidFileType.to_string(), "Invalid file type");
        assert_eq!(
            ApiError::FileRead("bad bytes".into()).to_string(),
            "Error reading file: bad bytes"
        );
    }

    #[tokio::test]
    async fn inference_failure_has_no_body() {
        let response = ApiError::Inference(anyhow::anyhow!("tensor shape mismatch")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn client_error_body_carries_message() {
        let response = ApiError::InvalidFileType.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Invalid file type");
    }
}
