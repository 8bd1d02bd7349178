use crate::reading::MeasurementFault;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("MQTT error: {0}")]
    Mqtt(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("InfluxDB write rejected with status {status}: {body}")]
    InfluxStatus { status: u16, body: String },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Transport failures, throttling and server-side errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Http(_) => true,
            AppError::InfluxStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Why a single inbound message was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("missing required field: {0}")]
    MissingRequiredField(&'static str),
    #[error("invalid reading: {0}")]
    InvalidReading(String),
    #[error("invalid measurement at index {index}{}: {fault}", .kind.as_deref().map(|k| format!(" ({k})")).unwrap_or_default())]
    InvalidMeasurement {
        index: usize,
        kind: Option<String>,
        fault: MeasurementFault,
    },
    #[error("point not accepted by sink: {0}")]
    SubmitFailed(String),
}

impl IngestError {
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::MalformedPayload(_) => "MalformedPayload",
            IngestError::MissingRequiredField(_) => "MissingRequiredField",
            IngestError::InvalidReading(_) => "InvalidReading",
            IngestError::InvalidMeasurement { .. } => "InvalidMeasurement",
            IngestError::SubmitFailed(_) => "SubmitFailed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        let status = |s| AppError::InfluxStatus {
            status: s,
            body: String::new(),
        };
        assert!(status(429).is_retryable());
        assert!(status(503).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(401).is_retryable());
        assert!(!AppError::Config("x".into()).is_retryable());
    }

    #[test]
    fn test_invalid_measurement_message_names_kind() {
        let err = IngestError::InvalidMeasurement {
            index: 1,
            kind: Some("humidity".into()),
            fault: MeasurementFault::NonNumericValue,
        };
        assert_eq!(err.kind(), "InvalidMeasurement");
        assert_eq!(
            err.to_string(),
            "invalid measurement at index 1 (humidity): measurement value must be a number"
        );
    }
}
