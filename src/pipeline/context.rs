use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use super::artifacts::{PlaceArtifacts, PlaceId, PLACES_DIR};
use crate::config::Config;
use crate::errors::PipelineError;
use crate::lock::PlaceLock;
use crate::oracle::{HttpOracle, ImageGenerator, MediaFetcher, ReviewSource, StructuredExtractor};
use crate::retry::RetryPolicy;
use crate::semantic::concepts::ConceptCatalog;
use crate::semantic::EmbeddingOracle;
use crate::storage::{ArtifactStore, BackendLocal};

/// Everything a stage needs: configuration, storage and the external
/// collaborators. Built once per process and shared by reference.
pub struct PipelineContext {
    config: Config,
    base_path: PathBuf,
    store: Arc<dyn ArtifactStore>,
    /// Image space: photos, concept texts, appearance texts
    image_embedder: Arc<dyn EmbeddingOracle>,
    /// Text space: review texts and paraphrased item queries
    text_embedder: Arc<dyn EmbeddingOracle>,
    extractor: Arc<dyn StructuredExtractor>,
    fetcher: Arc<dyn MediaFetcher>,
    review_source: Arc<dyn ReviewSource>,
    generator: Arc<dyn ImageGenerator>,
    concepts: ConceptCatalog,
    retry: RetryPolicy,
}

impl PipelineContext {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn artifacts<'a>(&'a self, place: &'a PlaceId) -> PlaceArtifacts<'a> {
        PlaceArtifacts::new(self.store.as_ref(), place)
    }

    pub fn image_embedder(&self) -> &dyn EmbeddingOracle {
        self.image_embedder.as_ref()
    }

    pub fn text_embedder(&self) -> &dyn EmbeddingOracle {
        self.text_embedder.as_ref()
    }

    pub fn extractor(&self) -> &dyn StructuredExtractor {
        self.extractor.as_ref()
    }

    pub fn fetcher(&self) -> &dyn MediaFetcher {
        self.fetcher.as_ref()
    }

    pub fn review_source(&self) -> &dyn ReviewSource {
        self.review_source.as_ref()
    }

    pub fn generator(&self) -> &dyn ImageGenerator {
        self.generator.as_ref()
    }

    pub fn concepts(&self) -> &ConceptCatalog {
        &self.concepts
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn place_dir(&self, place: &PlaceId) -> PathBuf {
        self.base_path.join(PLACES_DIR).join(place.as_str())
    }

    /// Exclusive lock on the place for the lifetime of the returned guard.
    pub fn lock_place(&self, place: &PlaceId) -> Result<PlaceLock, PipelineError> {
        PlaceLock::try_acquire(&self.place_dir(place)).map_err(|err| {
            if err.kind() == std::io::ErrorKind::WouldBlock {
                PipelineError::Locked(place.to_string())
            } else {
                PipelineError::Io(err)
            }
        })
    }
}

/// Builder for [`PipelineContext`]
#[derive(Default)]
pub struct PipelineContextBuilder {
    config: Option<Config>,
    store: Option<Arc<dyn ArtifactStore>>,
    image_embedder: Option<Arc<dyn EmbeddingOracle>>,
    text_embedder: Option<Arc<dyn EmbeddingOracle>>,
    extractor: Option<Arc<dyn StructuredExtractor>>,
    fetcher: Option<Arc<dyn MediaFetcher>>,
    review_source: Option<Arc<dyn ReviewSource>>,
    generator: Option<Arc<dyn ImageGenerator>>,
    retry: Option<RetryPolicy>,
}

impl PipelineContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Defaults to the local disk under the config's base path
    pub fn store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Uses one HTTP service for every collaborator not set explicitly
    pub fn http(mut self, oracle: Arc<HttpOracle>) -> Self {
        let embedder: Arc<dyn EmbeddingOracle> = oracle.clone();
        let extractor: Arc<dyn StructuredExtractor> = oracle.clone();
        let fetcher: Arc<dyn MediaFetcher> = oracle.clone();
        let review_source: Arc<dyn ReviewSource> = oracle.clone();
        let generator: Arc<dyn ImageGenerator> = oracle;

        self.image_embedder.get_or_insert_with(|| embedder.clone());
        self.text_embedder.get_or_insert(embedder);
        self.extractor.get_or_insert(extractor);
        self.fetcher.get_or_insert(fetcher);
        self.review_source.get_or_insert(review_source);
        self.generator.get_or_insert(generator);
        self
    }

    pub fn image_embedder(mut self, oracle: Arc<dyn EmbeddingOracle>) -> Self {
        self.image_embedder = Some(oracle);
        self
    }

    pub fn text_embedder(mut self, oracle: Arc<dyn EmbeddingOracle>) -> Self {
        self.text_embedder = Some(oracle);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn StructuredExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn MediaFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn review_source(mut self, source: Arc<dyn ReviewSource>) -> Self {
        self.review_source = Some(source);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn ImageGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Defaults to the policy in the config's `retry` section
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> Result<PipelineContext> {
        let config = self.config.context("Configuration is required")?;
        let base_path = config.base_path().to_path_buf();

        let store: Arc<dyn ArtifactStore> = match self.store {
            Some(store) => store,
            None => Arc::new(
                BackendLocal::new(&base_path)
                    .with_context(|| format!("Failed to open artifact store at {}", base_path.display()))?,
            ),
        };

        let image_embedder = self.image_embedder.context("Image embedding oracle is required")?;
        let text_embedder = self.text_embedder.context("Text embedding oracle is required")?;
        let extractor = self.extractor.context("Structured extractor is required")?;
        let fetcher = self.fetcher.context("Media fetcher is required")?;
        let review_source = self.review_source.context("Review source is required")?;
        let generator = self.generator.context("Image generator is required")?;
        let retry = self
            .retry
            .unwrap_or_else(|| RetryPolicy::from_config(&config.retry));

        let concepts = ConceptCatalog::new(
            &config.concepts,
            store.clone(),
            image_embedder.clone(),
            retry.clone(),
        );

        Ok(PipelineContext {
            config,
            base_path,
            store,
            image_embedder,
            text_embedder,
            extractor,
            fetcher,
            review_source,
            generator,
            concepts,
            retry,
        })
    }
}

/// `$MENULENS_BASE_PATH`, otherwise `~/.local/share/menulens`.
pub fn default_base_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("MENULENS_BASE_PATH") {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = homedir::my_home()
        .context("Could not determine home directory")?
        .context("Home directory path is empty")?;
    Ok(home.join(".local/share/menulens"))
}
