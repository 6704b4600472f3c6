//! Concept queries photos are scored against.
//!
//! Each (text, dimension) pair is embedded once and cached in
//! `query_vectors.json` at the store root, so later runs and other places
//! reuse the vector without an oracle call. The catalog is built explicitly
//! and passed around through the pipeline context.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::embeddings::{EmbeddingOracle, TextTask};
use super::vector::is_usable;
use crate::config::ConceptsConfig;
use crate::errors::PipelineError;
use crate::retry::RetryPolicy;
use crate::storage::ArtifactStore;

pub const QUERY_VECTORS_KEY: &str = "query_vectors.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConceptPurpose {
    IsMenu,
    IsInterior,
    IsExterior,
    IsFood,
}

impl ConceptPurpose {
    pub const ALL: [ConceptPurpose; 4] = [
        ConceptPurpose::IsMenu,
        ConceptPurpose::IsInterior,
        ConceptPurpose::IsExterior,
        ConceptPurpose::IsFood,
    ];
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConceptQuery {
    pub purpose: ConceptPurpose,
    pub text: String,
    pub vector: Vec<f32>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct QueryVectorCache {
    #[serde(default)]
    entries: BTreeMap<String, CachedVector>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CachedVector {
    text: String,
    dim: usize,
    vector: Vec<f32>,
}

fn cache_key(text: &str, dim: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("{hex}:{dim}")
}

pub struct ConceptCatalog {
    texts: BTreeMap<ConceptPurpose, String>,
    store: Arc<dyn ArtifactStore>,
    oracle: Arc<dyn EmbeddingOracle>,
    retry: RetryPolicy,
    /// Loaded from the store on first use
    cache: Mutex<Option<QueryVectorCache>>,
}

impl ConceptCatalog {
    pub fn new(
        concepts: &ConceptsConfig,
        store: Arc<dyn ArtifactStore>,
        oracle: Arc<dyn EmbeddingOracle>,
        retry: RetryPolicy,
    ) -> Self {
        let texts = BTreeMap::from([
            (ConceptPurpose::IsMenu, concepts.is_menu.clone()),
            (ConceptPurpose::IsInterior, concepts.is_interior.clone()),
            (ConceptPurpose::IsExterior, concepts.is_exterior.clone()),
            (ConceptPurpose::IsFood, concepts.is_food.clone()),
        ]);

        Self {
            texts,
            store,
            oracle,
            retry,
            cache: Mutex::new(None),
        }
    }

    fn load_cache(&self) -> QueryVectorCache {
        if !self.store.exists(QUERY_VECTORS_KEY) {
            return QueryVectorCache::default();
        }
        match self
            .store
            .read(QUERY_VECTORS_KEY)
            .map_err(PipelineError::from)
            .and_then(|data| serde_json::from_slice(&data).map_err(PipelineError::from))
        {
            Ok(cache) => cache,
            Err(err) => {
                log::warn!("ignoring unreadable {QUERY_VECTORS_KEY}: {err}");
                QueryVectorCache::default()
            }
        }
    }

    /// Vector of `purpose`'s text in the `dim`-dimensional image space.
    pub fn query(&self, purpose: ConceptPurpose, dim: usize) -> Result<ConceptQuery, PipelineError> {
        let text = self
            .texts
            .get(&purpose)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no text configured for {purpose:?}"))?;

        let mut guard = self
            .cache
            .lock()
            .map_err(|e| anyhow::anyhow!("concept cache lock poisoned: {e}"))?;
        let cache = guard.get_or_insert_with(|| self.load_cache());

        let key = cache_key(&text, dim);
        if let Some(cached) = cache.entries.get(&key) {
            if is_usable(&cached.vector, dim) {
                return Ok(ConceptQuery {
                    purpose,
                    text,
                    vector: cached.vector.clone(),
                });
            }
        }

        log::info!("computing concept vector purpose={purpose:?} dim={dim}");
        let label = format!("embed concept {purpose:?}");
        let vectors = self.retry.run(&label, || {
            self.oracle
                .embed_texts(std::slice::from_ref(&text), dim, TextTask::RetrievalQuery)
        })?;
        let vector = vectors
            .into_iter()
            .next()
            .filter(|v| is_usable(v, dim))
            .ok_or_else(|| {
                PipelineError::TransientExternal(format!("unusable vector for concept {purpose:?}"))
            })?;

        cache.entries.insert(
            key,
            CachedVector {
                text: text.clone(),
                dim,
                vector: vector.clone(),
            },
        );
        self.store
            .write_atomic(QUERY_VECTORS_KEY, &serde_json::to_vec(&*cache)?)?;

        Ok(ConceptQuery {
            purpose,
            text,
            vector,
        })
    }

    /// All concept queries for `dim`, in [`ConceptPurpose::ALL`] order.
    pub fn queries(&self, dim: usize) -> Result<Vec<ConceptQuery>, PipelineError> {
        ConceptPurpose::ALL
            .iter()
            .map(|purpose| self.query(*purpose, dim))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::EmbeddingError;
    use crate::storage::BackendLocal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingOracle(AtomicUsize);

    impl EmbeddingOracle for CountingOracle {
        fn embed_image(&self, _: &[u8], _: &str, _: usize) -> Result<Vec<f32>, EmbeddingError> {
            unreachable!()
        }

        fn embed_texts(
            &self,
            texts: &[String],
            dim: usize,
            task: TextTask,
        ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            assert_eq!(task, TextTask::RetrievalQuery);
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.1; dim];
                    v[t.len() % dim] = 1.0;
                    v
                })
                .collect())
        }
    }

    #[test]
    fn test_vectors_are_cached_across_catalogs() {
        let tmp = tempfile::tempdir().unwrap();
        let store: Arc<dyn ArtifactStore> = Arc::new(BackendLocal::new(tmp.path()).unwrap());
        let oracle = Arc::new(CountingOracle(AtomicUsize::new(0)));

        let catalog = ConceptCatalog::new(
            &ConceptsConfig::default(),
            store.clone(),
            oracle.clone(),
            RetryPolicy::immediate(1),
        );
        let queries = catalog.queries(8).unwrap();
        assert_eq!(queries.len(), 4);
        assert_eq!(queries[0].purpose, ConceptPurpose::IsMenu);
        assert_eq!(oracle.0.load(Ordering::SeqCst), 4);

        // same catalog, in-memory hit
        catalog.query(ConceptPurpose::IsFood, 8).unwrap();
        assert_eq!(oracle.0.load(Ordering::SeqCst), 4);

        // fresh catalog, persisted hit
        let reloaded = ConceptCatalog::new(
            &ConceptsConfig::default(),
            store.clone(),
            oracle.clone(),
            RetryPolicy::immediate(1),
        );
        let again = reloaded.queries(8).unwrap();
        assert_eq!(oracle.0.load(Ordering::SeqCst), 4);
        assert_eq!(again, queries);

        // other dimension is a separate entry
        reloaded.query(ConceptPurpose::IsMenu, 4).unwrap();
        assert_eq!(oracle.0.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_cache_key_depends_on_text_and_dim() {
        assert_ne!(cache_key("menu", 128), cache_key("menu", 256));
        assert_ne!(cache_key("menu", 128), cache_key("food", 128));
        assert_eq!(cache_key("menu", 128), cache_key("menu", 128));
    }
}
