//! Boundaries to the external model services.
//!
//! Every collaborator the pipeline cannot run itself (review scraping, media
//! download, structured extraction, image generation) is a trait here, so
//! stages can be driven by the HTTP implementation in [`http`] or by fakes.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::retry::{RetryPolicy, Transient};
use crate::reviews::ScrapedReview;

pub mod http;

pub use http::HttpOracle;

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("output does not match schema: {0}")]
    SchemaValidation(String),

    #[error("rate limited")]
    RateLimited,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected oracle failure: {0}")]
    Unknown(String),
}

impl Transient for OracleError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            OracleError::RateLimited | OracleError::Timeout | OracleError::Network(_)
        )
    }
}

/// An image (or other media) handed to an oracle.
#[derive(Clone, Debug, PartialEq)]
pub struct Media {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    /// Text placed right before the media in the request
    pub caption: Option<String>,
}

impl Media {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let mime_type = infer::get(&bytes)
            .map(|kind| kind.mime_type().to_string())
            .unwrap_or_else(|| "image/jpeg".to_string());
        Self {
            bytes,
            mime_type,
            caption: None,
        }
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }
}

pub trait ReviewSource: Send + Sync {
    fn scrape(&self, place_id: &str, max_reviews: usize) -> Result<Vec<ScrapedReview>, OracleError>;
}

pub trait MediaFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Media, OracleError>;
}

/// Prompt + media in, JSON record conforming to `schema` out.
pub trait StructuredExtractor: Send + Sync {
    fn extract(&self, media: &[Media], prompt: &str, schema: &Value) -> Result<Value, OracleError>;
}

pub trait ImageGenerator: Send + Sync {
    /// `Ok(None)` when the model answered without an image.
    fn generate(&self, reference: &Media, prompt: &str) -> Result<Option<Vec<u8>>, OracleError>;
}

/// A record type the structured extractor can produce.
pub trait Extractable: DeserializeOwned {
    const NAME: &'static str;

    /// JSON schema sent along with the prompt.
    fn schema() -> Value;

    /// Checks beyond what deserialization enforces.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Runs the extractor and turns its output into a validated `T`.
///
/// Transient failures are retried with `retry`; anything that does not
/// deserialize or validate is a `SchemaValidation` error.
pub fn extract_record<T: Extractable>(
    extractor: &dyn StructuredExtractor,
    media: &[Media],
    prompt: &str,
    retry: &RetryPolicy,
    label: &str,
) -> Result<T, OracleError> {
    let schema = T::schema();
    let value = retry.run(label, || extractor.extract(media, prompt, &schema))?;

    let record: T = serde_json::from_value(value)
        .map_err(|e| OracleError::SchemaValidation(format!("{}: {e}", T::NAME)))?;
    record
        .validate()
        .map_err(|e| OracleError::SchemaValidation(format!("{}: {e}", T::NAME)))?;

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Deserialize)]
    struct Dish {
        name: String,
    }

    impl Extractable for Dish {
        const NAME: &'static str = "Dish";

        fn schema() -> Value {
            json!({"type": "object", "properties": {"name": {"type": "string"}}})
        }

        fn validate(&self) -> Result<(), String> {
            if self.name.is_empty() {
                return Err("empty name".to_string());
            }
            Ok(())
        }
    }

    enum Reply {
        Record(Value),
        RateLimited,
    }

    struct Scripted {
        calls: AtomicUsize,
        responses: Vec<Reply>,
    }

    impl StructuredExtractor for Scripted {
        fn extract(&self, _: &[Media], _: &str, _: &Value) -> Result<Value, OracleError> {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.responses[idx.min(self.responses.len() - 1)] {
                Reply::Record(v) => Ok(v.clone()),
                Reply::RateLimited => Err(OracleError::RateLimited),
            }
        }
    }

    #[test]
    fn test_rate_limit_is_retried() {
        let extractor = Scripted {
            calls: AtomicUsize::new(0),
            responses: vec![Reply::RateLimited, Reply::Record(json!({"name": "pho"}))],
        };
        let dish: Dish =
            extract_record(&extractor, &[], "p", &RetryPolicy::immediate(5), "t").unwrap();
        assert_eq!(dish.name, "pho");
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_schema_mismatch_is_not_retried() {
        let extractor = Scripted {
            calls: AtomicUsize::new(0),
            responses: vec![Reply::Record(json!({"title": "pho"}))],
        };
        let result: Result<Dish, _> =
            extract_record(&extractor, &[], "p", &RetryPolicy::immediate(5), "t");
        assert!(matches!(result, Err(OracleError::SchemaValidation(_))));
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_validation_failure_is_schema_violation() {
        let extractor = Scripted {
            calls: AtomicUsize::new(0),
            responses: vec![Reply::Record(json!({"name": ""}))],
        };
        let result: Result<Dish, _> =
            extract_record(&extractor, &[], "p", &RetryPolicy::immediate(5), "t");
        assert!(matches!(result, Err(OracleError::SchemaValidation(ref m)) if m.contains("empty name")));
    }

    #[test]
    fn test_media_sniffs_mime_type() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        assert_eq!(Media::from_bytes(png.to_vec()).mime_type, "image/png");
        assert_eq!(Media::from_bytes(vec![1, 2, 3]).mime_type, "image/jpeg");
    }
}
