use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::{Classification, Label};

/// Character budget for texts echoed back by `/predict`, `/batch` and history.
pub const TEXT_PREVIEW_CHARS: usize = 100;
/// Character budget for file content echoed back by `/upload`.
pub const CONTENT_PREVIEW_CHARS: usize = 500;

const ELLIPSIS: &str = "...";

#[derive(Debug, Clone, Deserialize)]
pub struct PredictRequest {
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    /// Absent and `null` both read as no texts.
    #[serde(default)]
    pub texts: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictResponse {
    pub sentiment: Label,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadResponse {
    pub sentiment: Label,
    pub confidence: f64,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchItem {
    pub text: String,
    pub sentiment: Label,
    pub confidence: f64,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub results: Vec<BatchItem>,
}

/// One past `/predict` call. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisEntry {
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub sentiment: Label,
    pub confidence: f64,
}

impl AnalysisEntry {
    pub fn new(text: &str, classification: &Classification) -> Self {
        Self {
            timestamp: Utc::now(),
            text: truncate_chars(text, TEXT_PREVIEW_CHARS),
            sentiment: classification.label,
            confidence: confidence_percent(classification.confidence),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub history: Vec<AnalysisEntry>,
}

impl PredictResponse {
    pub fn from_classification(classification: &Classification) -> Self {
        Self {
            sentiment: classification.label,
            confidence: confidence_percent(classification.confidence),
        }
    }
}

impl BatchItem {
    pub fn new(text: &str, classification: &Classification) -> Self {
        Self {
            text: truncate_chars(text, TEXT_PREVIEW_CHARS),
            sentiment: classification.label,
            confidence: confidence_percent(classification.confidence),
        }
    }
}

/// Keeps the first `max_chars` characters, appending `...` when anything was cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}{ELLIPSIS}", &text[..byte_idx]),
        None => text.to_string(),
    }
}

/// Maps a probability in [0, 1] to a percentage rounded to two decimals.
pub fn confidence_percent(confidence: f32) -> f64 {
    (f64::from(confidence) * 100.0 * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_kept_verbatim() {
        let text = "a".repeat(TEXT_PREVIEW_CHARS);
        assert_eq!(truncate_chars(&text, TEXT_PREVIEW_CHARS), text);
        assert_eq!(truncate_chars("", TEXT_PREVIEW_CHARS), "");
    }

    #[test]
    fn long_text_is_cut_with_ellipsis() {
        let text = "b".repeat(TEXT_PREVIEW_CHARS + 1);
        let truncated = truncate_chars(&text, TEXT_PREVIEW_CHARS);
        assert_eq!(truncated.len(), TEXT_PREVIEW_CHARS + 3);
        assert!(truncated.ends_with("b..."));
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let text = "é".repeat(150);
        let truncated = truncate_chars(&text, TEXT_PREVIEW_CHARS);
        assert_eq!(truncated.chars().count(), TEXT_PREVIEW_CHARS + 3);
        assert!(truncated.starts_with(&"é".repeat(TEXT_PREVIEW_CHARS)));
    }

    #[test]
    fn confidence_is_percentage_with_two_decimals() {
        assert_eq!(confidence_percent(1.0), 100.0);
        assert_eq!(confidence_percent(0.0), 0.0);
        assert_eq!(confidence_percent(0.5), 50.0);
        assert!((confidence_percent(0.987_654) - 98.77).abs() < 1e-9);
    }

    #[test]
    fn label_serializes_to_display_name() {
        let item = BatchItem::new(
            "x",
            &Classification::from_probs(vec![0.1, 0.9]).unwrap(),
        );
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["sentiment"], "Hate/Offensive");
        assert_eq!(json["confidence"], 90.0);
        assert_eq!(json["text"], "x");
    }
}
