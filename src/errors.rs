use serde::Serialize;

use crate::oracle::OracleError;
use crate::semantic::EmbeddingError;

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// An external call failed after exhausting its retries
    #[error("external call failed: {0}")]
    TransientExternal(String),

    #[error("{item}: extractor output violates schema: {message}")]
    SchemaViolation { item: String, message: String },

    #[error("insufficient input for place {place}: {message}")]
    InsufficientInput { place: String, message: String },

    /// A local artifact, or an upstream resource that does not exist
    #[error("{place}: missing {artifact}")]
    ResourceMissing { place: String, artifact: String },

    #[error("place {0} is locked by another run")]
    Locked(String),

    #[error("io error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("malformed artifact: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn insufficient(place: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InsufficientInput {
            place: place.into(),
            message: message.into(),
        }
    }

    pub fn missing(place: impl Into<String>, artifact: impl Into<String>) -> Self {
        Self::ResourceMissing {
            place: place.into(),
            artifact: artifact.into(),
        }
    }

    pub fn schema(item: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SchemaViolation {
            item: item.into(),
            message: message.into(),
        }
    }

    /// Stable identifier used in structured failure payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientExternal(_) => "transient_external",
            Self::SchemaViolation { .. } => "schema_violation",
            Self::InsufficientInput { .. } => "insufficient_input",
            Self::ResourceMissing { .. } => "resource_missing",
            Self::Locked(_) => "locked",
            Self::Io(_) => "io",
            Self::Json(_) => "malformed_artifact",
            Self::Other(_) => "internal",
        }
    }

    /// Attaches an item id to an oracle failure.
    pub fn from_oracle(item: &str, err: OracleError) -> Self {
        match err {
            OracleError::SchemaValidation(message) => Self::schema(item, message),
            OracleError::NotFound(resource) => Self::missing(item, resource),
            other => Self::TransientExternal(format!("{item}: {other}")),
        }
    }
}

impl From<OracleError> for PipelineError {
    fn from(err: OracleError) -> Self {
        match err {
            OracleError::SchemaValidation(message) => Self::schema("record", message),
            OracleError::NotFound(resource) => Self::missing("upstream", resource),
            other => Self::TransientExternal(other.to_string()),
        }
    }
}

impl From<EmbeddingError> for PipelineError {
    fn from(err: EmbeddingError) -> Self {
        Self::TransientExternal(err.to_string())
    }
}

/// Structured failure payload returned by every entry point.
#[derive(Debug, Clone, Serialize)]
pub struct FailurePayload {
    pub status: &'static str,
    pub kind: &'static str,
    pub message: String,
}

impl From<&PipelineError> for FailurePayload {
    fn from(err: &PipelineError) -> Self {
        Self {
            status: "failed",
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oracle_errors_map_to_taxonomy() {
        let err = PipelineError::from_oracle("menu:3", OracleError::SchemaValidation("bad".into()));
        assert_eq!(err.kind(), "schema_violation");
        assert!(err.to_string().contains("menu:3"));

        let err = PipelineError::from_oracle("menu:3", OracleError::RateLimited);
        assert_eq!(err.kind(), "transient_external");

        let err = PipelineError::from_oracle(
            "board-7",
            OracleError::NotFound("https://img.test/7-board.jpg".into()),
        );
        assert_eq!(err.kind(), "resource_missing");
        assert!(err.to_string().contains("https://img.test/7-board.jpg"));

        let err = PipelineError::from(OracleError::NotFound("place p1".into()));
        assert_eq!(err.kind(), "resource_missing");
    }

    #[test]
    fn test_failure_payload() {
        let err = PipelineError::insufficient("p1", "only 12 reviews");
        let payload = FailurePayload::from(&err);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["kind"], "insufficient_input");
        assert!(json["message"].as_str().unwrap().contains("only 12 reviews"));
    }
}
