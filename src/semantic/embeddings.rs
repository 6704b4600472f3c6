//! Embedding oracle boundary.
//!
//! Two embedding spaces are used by the pipeline:
//! - an image space (review photos, concept queries, item appearance texts)
//! - a text space (review texts, paraphrased item queries)
//!
//! Both go through [`EmbeddingOracle`]. The HTTP implementation lives in
//! `oracle::http`; text embeddings can also run in-process on fastembed.

use serde::Serialize;

use crate::retry::Transient;

/// Intended use of a text embedding, forwarded to models that embed queries
/// and documents asymmetrically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TextTask {
    RetrievalDocument,
    RetrievalQuery,
}

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("rate limited by embedding service")]
    RateLimited,

    #[error("media download failed: {0}")]
    DownloadFailed(String),

    #[error("embedding request timed out")]
    Timeout,

    #[error("expected {expected}-dim embedding, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("embedding failed: {0}")]
    Unknown(String),
}

impl Transient for EmbeddingError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            EmbeddingError::RateLimited | EmbeddingError::DownloadFailed(_) | EmbeddingError::Timeout
        )
    }
}

pub trait EmbeddingOracle: Send + Sync {
    /// Embeds one image into a `dim`-dimensional vector.
    fn embed_image(&self, image: &[u8], mime_type: &str, dim: usize)
        -> Result<Vec<f32>, EmbeddingError>;

    /// Embeds texts into `dim`-dimensional vectors, one per input, in order.
    fn embed_texts(
        &self,
        texts: &[String],
        dim: usize,
        task: TextTask,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Checks the oracle returned one vector of the right length per input.
pub fn check_batch(
    vectors: Vec<Vec<f32>>,
    expected_len: usize,
    dim: usize,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if vectors.len() != expected_len {
        return Err(EmbeddingError::Unknown(format!(
            "oracle returned {} embeddings for {} inputs",
            vectors.len(),
            expected_len
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dim) {
        return Err(EmbeddingError::DimensionMismatch {
            expected: dim,
            got: bad.len(),
        });
    }
    Ok(vectors)
}

#[cfg(feature = "local-embeddings")]
pub use local::LocalTextEmbedder;

#[cfg(feature = "local-embeddings")]
mod local {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use fastembed::{InitOptions, TextEmbedding};

    use super::{check_batch, EmbeddingError, EmbeddingOracle, TextTask};

    struct LoadedModel {
        model: TextEmbedding,
        dimensions: usize,
    }

    /// In-process text embedder on top of fastembed.
    ///
    /// The model is loaded on first use, so runs that only touch cached
    /// artifacts never download it. Images are not supported.
    pub struct LocalTextEmbedder {
        model_name: String,
        base_dir: PathBuf,
        /// Uses Mutex<Option<_>> because fastembed's embed() requires &mut self
        /// and get_or_try_init is unstable.
        state: Mutex<Option<LoadedModel>>,
    }

    impl LocalTextEmbedder {
        /// Models are cached under `<base_dir>/models`.
        pub fn new(model_name: &str, base_dir: PathBuf) -> Result<Self, EmbeddingError> {
            // fail on unknown names before any download happens
            parse_model_name(model_name)?;
            Ok(Self {
                model_name: model_name.to_string(),
                base_dir,
                state: Mutex::new(None),
            })
        }

        pub fn name(&self) -> &str {
            &self.model_name
        }

        pub fn models_dir(&self) -> PathBuf {
            self.base_dir.join("models")
        }

        fn load(&self) -> Result<LoadedModel, EmbeddingError> {
            let model_enum = parse_model_name(&self.model_name)?;

            let models_dir = self.models_dir();
            std::fs::create_dir_all(&models_dir).map_err(|e| {
                EmbeddingError::Unknown(format!("Failed to create models directory: {}", e))
            })?;

            log::info!("loading text embedding model {}", self.model_name);
            let options = InitOptions::new(model_enum)
                .with_cache_dir(models_dir)
                .with_show_download_progress(true);

            let mut model = TextEmbedding::try_new(options)
                .map_err(|e| EmbeddingError::Unknown(format!("model init failed: {e}")))?;

            let dimensions = model
                .embed(vec!["test"], None)
                .map_err(|e| EmbeddingError::Unknown(format!("Failed to read model dimensions: {e}")))?
                .first()
                .map(|v| v.len())
                .ok_or_else(|| EmbeddingError::Unknown("Model returned no embedding".to_string()))?;

            Ok(LoadedModel { model, dimensions })
        }
    }

    impl EmbeddingOracle for LocalTextEmbedder {
        fn embed_image(
            &self,
            _image: &[u8],
            _mime_type: &str,
            _dim: usize,
        ) -> Result<Vec<f32>, EmbeddingError> {
            Err(EmbeddingError::Unknown(format!(
                "{} is a text-only model",
                self.model_name
            )))
        }

        fn embed_texts(
            &self,
            texts: &[String],
            dim: usize,
            _task: TextTask,
        ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            if texts.is_empty() {
                return Ok(vec![]);
            }

            let mut guard = self.state.lock().map_err(|e| {
                EmbeddingError::Unknown(format!("Failed to acquire model lock: {}", e))
            })?;

            if guard.is_none() {
                *guard = Some(self.load()?);
            }
            let Some(loaded) = guard.as_mut() else {
                return Err(EmbeddingError::Unknown("model not loaded".to_string()));
            };

            if loaded.dimensions != dim {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: dim,
                    got: loaded.dimensions,
                });
            }

            let vectors = loaded
                .model
                .embed(texts.to_vec(), None)
                .map_err(|e| EmbeddingError::Unknown(e.to_string()))?;

            check_batch(vectors, texts.len(), dim)
        }
    }

    /// Parse model name string to fastembed enum.
    fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
        match name.to_lowercase().as_str() {
            "all-minilm-l6-v2" | "allminiml6v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "bge-small-en-v1.5" | "bgesmallenv15" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" | "bgebaseenv15" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-large-en-v1.5" | "bgelargeenv15" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
            _ => Err(EmbeddingError::Unknown(format!(
                "Unknown model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5",
                name
            ))),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EmbeddingError::RateLimited.is_transient());
        assert!(EmbeddingError::Timeout.is_transient());
        assert!(EmbeddingError::DownloadFailed("503".into()).is_transient());
        assert!(!EmbeddingError::Unknown("bad input".into()).is_transient());
        assert!(!EmbeddingError::DimensionMismatch { expected: 2, got: 3 }.is_transient());
    }

    #[test]
    fn test_check_batch() {
        assert!(check_batch(vec![vec![1.0, 0.0]], 1, 2).is_ok());
        assert!(matches!(
            check_batch(vec![vec![1.0]], 1, 2),
            Err(EmbeddingError::DimensionMismatch { expected: 2, got: 1 })
        ));
        assert!(check_batch(vec![], 1, 2).is_err());
    }
}
