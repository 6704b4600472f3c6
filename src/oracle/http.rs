//! JSON-over-HTTP client for the model service.
//!
//! One blocking client with a mandatory per-request timeout serves every
//! boundary: review scraping, media download, structured extraction, image
//! generation and both embedding spaces. Media travels base64-encoded.

use std::time::Duration;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ImageGenerator, Media, MediaFetcher, OracleError, ReviewSource, StructuredExtractor};
use crate::reviews::ScrapedReview;
use crate::semantic::{check_batch, EmbeddingError, EmbeddingOracle, TextTask};

#[derive(Clone)]
pub struct HttpOracle {
    client: Client,
    base_url: String,
}

impl HttpOracle {
    pub fn new(base_url: &str, timeout: Duration, api_key: Option<String>) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key.filter(|key| !key.trim().is_empty()) {
            let auth = format!("Bearer {}", key.trim());
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth).context("invalid api key")?,
            );
        }

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp, OracleError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .map_err(classify_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(classify_status(status, &url, &body));
        }

        resp.json::<Resp>()
            .map_err(|e| OracleError::Unknown(format!("failed to parse response from {url}: {e}")))
    }
}

fn classify_status(status: StatusCode, url: &str, body: &str) -> OracleError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => OracleError::RateLimited,
        StatusCode::NOT_FOUND => OracleError::NotFound(url.to_string()),
        StatusCode::UNPROCESSABLE_ENTITY => OracleError::SchemaValidation(body.to_string()),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => OracleError::Timeout,
        s if s.is_server_error() => OracleError::Network(format!("{s}: {body}")),
        s => OracleError::Unknown(format!("{s}: {body}")),
    }
}

fn classify_transport(err: reqwest::Error) -> OracleError {
    if err.is_timeout() {
        OracleError::Timeout
    } else if err.is_connect() || err.is_request() || err.is_body() {
        OracleError::Network(err.to_string())
    } else {
        OracleError::Unknown(err.to_string())
    }
}

fn to_embedding_error(err: OracleError) -> EmbeddingError {
    match err {
        OracleError::RateLimited => EmbeddingError::RateLimited,
        OracleError::Timeout => EmbeddingError::Timeout,
        OracleError::Network(msg) => EmbeddingError::DownloadFailed(msg),
        other => EmbeddingError::Unknown(other.to_string()),
    }
}

#[derive(Serialize)]
struct MediaPart<'a> {
    mime_type: &'a str,
    data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    caption: Option<&'a str>,
}

impl<'a> MediaPart<'a> {
    fn new(media: &'a Media) -> Self {
        Self {
            mime_type: &media.mime_type,
            data: STANDARD.encode(&media.bytes),
            caption: media.caption.as_deref(),
        }
    }
}

#[derive(Serialize)]
struct ReviewsRequest<'a> {
    place_id: &'a str,
    max_reviews: usize,
}

#[derive(Deserialize)]
struct ReviewsResponse {
    reviews: Vec<ScrapedReview>,
}

#[derive(Serialize)]
struct ExtractRequest<'a> {
    prompt: &'a str,
    schema: &'a Value,
    media: Vec<MediaPart<'a>>,
}

#[derive(Deserialize)]
struct ExtractResponse {
    record: Value,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    reference: MediaPart<'a>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    image: Option<String>,
}

#[derive(Serialize)]
struct EmbedImageRequest<'a> {
    image: MediaPart<'a>,
    dimension: usize,
}

#[derive(Deserialize)]
struct EmbedImageResponse {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct EmbedTextRequest<'a> {
    texts: &'a [String],
    dimension: usize,
    task: TextTask,
}

#[derive(Deserialize)]
struct EmbedTextResponse {
    embeddings: Vec<Vec<f32>>,
}

impl ReviewSource for HttpOracle {
    fn scrape(&self, place_id: &str, max_reviews: usize) -> Result<Vec<ScrapedReview>, OracleError> {
        let resp: ReviewsResponse = self.post(
            "/v1/reviews",
            &ReviewsRequest {
                place_id,
                max_reviews,
            },
        )?;
        Ok(resp.reviews)
    }
}

impl MediaFetcher for HttpOracle {
    fn fetch(&self, url: &str) -> Result<Media, OracleError> {
        // media urls are absolute and usually point outside the model service
        let resp = self.client.get(url).send().map_err(classify_transport)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(status, url, ""));
        }
        let bytes = resp.bytes().map_err(classify_transport)?;
        if bytes.is_empty() {
            return Err(OracleError::NotFound(format!("{url} returned an empty body")));
        }
        Ok(Media::from_bytes(bytes.to_vec()))
    }
}

impl StructuredExtractor for HttpOracle {
    fn extract(&self, media: &[Media], prompt: &str, schema: &Value) -> Result<Value, OracleError> {
        let resp: ExtractResponse = self.post(
            "/v1/extract",
            &ExtractRequest {
                prompt,
                schema,
                media: media.iter().map(MediaPart::new).collect(),
            },
        )?;
        Ok(resp.record)
    }
}

impl ImageGenerator for HttpOracle {
    fn generate(&self, reference: &Media, prompt: &str) -> Result<Option<Vec<u8>>, OracleError> {
        let resp: GenerateResponse = self.post(
            "/v1/generate-image",
            &GenerateRequest {
                prompt,
                reference: MediaPart::new(reference),
            },
        )?;

        resp.image
            .map(|data| {
                STANDARD
                    .decode(data.as_bytes())
                    .map_err(|e| OracleError::SchemaValidation(format!("image is not base64: {e}")))
            })
            .transpose()
    }
}

impl EmbeddingOracle for HttpOracle {
    fn embed_image(
        &self,
        image: &[u8],
        mime_type: &str,
        dim: usize,
    ) -> Result<Vec<f32>, EmbeddingError> {
        let media = Media {
            bytes: image.to_vec(),
            mime_type: mime_type.to_string(),
            caption: None,
        };
        let resp: EmbedImageResponse = self
            .post(
                "/v1/embed/image",
                &EmbedImageRequest {
                    image: MediaPart::new(&media),
                    dimension: dim,
                },
            )
            .map_err(to_embedding_error)?;

        if resp.embedding.len() != dim {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dim,
                got: resp.embedding.len(),
            });
        }
        Ok(resp.embedding)
    }

    fn embed_texts(
        &self,
        texts: &[String],
        dim: usize,
        task: TextTask,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let resp: EmbedTextResponse = self
            .post(
                "/v1/embed/text",
                &EmbedTextRequest {
                    texts,
                    dimension: dim,
                    task,
                },
            )
            .map_err(to_embedding_error)?;

        check_batch(resp.embeddings, texts.len(), dim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "u", ""),
            OracleError::RateLimited
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "u", ""),
            OracleError::NotFound(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, "u", "missing name"),
            OracleError::SchemaValidation(ref m) if m == "missing name"
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "u", ""),
            OracleError::Network(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "u", ""),
            OracleError::Unknown(_)
        ));
    }

    #[test]
    fn test_embedding_error_mapping_keeps_transience() {
        use crate::retry::Transient;
        assert!(to_embedding_error(OracleError::RateLimited).is_transient());
        assert!(to_embedding_error(OracleError::Network("reset".into())).is_transient());
        assert!(!to_embedding_error(OracleError::NotFound("x".into())).is_transient());
    }

    #[test]
    fn test_media_part_encodes_base64() {
        let media = Media::from_bytes(vec![1, 2, 3]).with_caption("Image 1 from 2024-01-01");
        let part = MediaPart::new(&media);
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["data"], "AQID");
        assert_eq!(json["caption"], "Image 1 from 2024-01-01");
    }
}
