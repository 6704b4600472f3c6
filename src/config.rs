use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::storage::{ArtifactStore, BackendLocal};

const CONFIG_FILE: &str = "config.yaml";

/// Worker pool sizes for the parallel parts of the pipeline
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Concurrent image downloads + embedding calls
    pub embedding: usize,
    /// Concurrent per-item review summaries
    pub summaries: usize,
    /// Concurrent collage builds
    pub collages: usize,
    /// Concurrent image generation calls
    pub generation: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            embedding: 20,
            summaries: 10,
            collages: 10,
            generation: 3,
        }
    }
}

/// Bounded exponential backoff for external calls
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 6_000,
            max_delay_ms: 120_000,
            max_jitter_ms: 1_000,
        }
    }
}

/// Menu-board retrieval over image embeddings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Dimension of the image embedding space
    pub embed_dim: usize,
    /// Images are requested at this max side length, which is also part of
    /// their natural key
    pub max_side: u32,
    pub top_k: usize,
    /// Scores below this floor end the candidate walk
    pub min_similarity: f32,
    /// Initial published-date cutoff
    pub min_date: NaiveDate,
    /// How far the cutoff moves back on each relaxation
    pub relax_step_days: i64,
    pub max_relaxations: u32,
    /// Number of diverse boards sent to extraction
    pub n_clusters: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            embed_dim: 128,
            max_side: 1024,
            top_k: 10,
            min_similarity: 0.355,
            min_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default(),
            relax_step_days: 6 * 30,
            max_relaxations: 5,
            n_clusters: 4,
        }
    }
}

/// Thresholds for tagging review photos as likely food
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FoodFilterConfig {
    /// Menu/interior/exterior similarity below which a photo is not a scene shot
    pub scene_threshold: f32,
    pub food_threshold: f32,
    /// Food similarity must exceed menu similarity minus this margin
    pub food_margin: f32,
}

impl Default for FoodFilterConfig {
    fn default() -> Self {
        Self {
            scene_threshold: 0.33,
            food_threshold: 0.30,
            food_margin: 0.20,
        }
    }
}

/// Review to menu item matching
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Dimension of the review text embedding space
    pub text_embed_dim: usize,
    pub threshold_start: f32,
    /// Exclusive
    pub threshold_end: f32,
    pub threshold_step: f32,
    /// No item may match more than this fraction of all reviews
    pub max_match_fraction: f32,
    pub fallback_threshold: f32,
    /// Items kept after binarization, by match count
    pub top_n: usize,
    /// `{ITEM}` is replaced by the item name and each of its nicknames
    pub query_templates: Vec<String>,
    pub review_text_limit: usize,
    pub document_batch_size: usize,
    pub query_batch_size: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            text_embed_dim: 768,
            threshold_start: 0.60,
            threshold_end: 0.90,
            threshold_step: 0.01,
            max_match_fraction: 0.80,
            fallback_threshold: 0.70,
            top_n: 20,
            query_templates: vec!["ordered {ITEM}".to_string(), "the {ITEM} was".to_string()],
            review_text_limit: 1000,
            document_batch_size: 100,
            query_batch_size: 250,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Places with fewer scraped reviews are rejected
    pub min_reviews: usize,
    pub max_reviews: usize,
    /// Embedding results are flushed to disk every N items
    pub checkpoint_every: usize,
    /// Most mentioned items that get sample reviews in the overview prompt
    pub overview_top_items: usize,
    pub overview_sample_reviews: usize,
    pub collage_top_k: usize,
    pub max_images_per_review: usize,
    pub collage_tile_px: u32,
    /// Most mentioned items that get a generated image in a full run
    pub generate_top_n: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_reviews: 200,
            max_reviews: 500,
            checkpoint_every: 50,
            overview_top_items: 3,
            overview_sample_reviews: 5,
            collage_top_k: 9,
            max_images_per_review: 2,
            collage_tile_px: 512,
            generate_top_n: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextEmbedderKind {
    /// Same HTTP service as every other oracle
    Http,
    /// In-process fastembed model
    Local,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Base URL of the JSON service fronting the embedding, extraction,
    /// generation and scraping models
    pub endpoint: String,
    /// Name of the environment variable holding a bearer token, if any
    pub api_key_env: Option<String>,
    pub request_timeout_secs: u64,
    pub text_embedder: TextEmbedderKind,
    /// fastembed model name, used when `text_embedder` is `local`
    pub local_model: String,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8088".to_string(),
            api_key_env: None,
            request_timeout_secs: 120,
            text_embedder: TextEmbedderKind::Http,
            local_model: "bge-base-en-v1.5".to_string(),
        }
    }
}

/// Texts of the concept queries photos are scored against
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConceptsConfig {
    pub is_menu: String,
    pub is_interior: String,
    pub is_exterior: String,
    pub is_food: String,
}

impl Default for ConceptsConfig {
    fn default() -> Self {
        Self {
            is_menu: "A photo of a full restaurant menu showing all menu items and prices, with the entire menu visible in frame and little surrounding background, organized for customer ordering.".to_string(),
            is_interior: "An overview image of a restaurant dining space capturing the interior layout and ambiance.".to_string(),
            is_exterior: "A street-level view of a restaurant exterior with the storefront, entrance, and clearly visible restaurant logo or sign.".to_string(),
            is_food: "A detailed food photo showing plated dish or dishes as served, with textures and ingredients clearly visible.".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub food_filter: FoodFilterConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub oracles: OracleConfig,
    #[serde(default)]
    pub concepts: ConceptsConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        let workers = &self.workers;
        if workers.embedding == 0
            || workers.summaries == 0
            || workers.collages == 0
            || workers.generation == 0
        {
            bail!("workers.* must be greater than 0");
        }

        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be greater than 0");
        }

        let retrieval = &self.retrieval;
        if retrieval.embed_dim == 0 {
            bail!("retrieval.embed_dim must be greater than 0");
        }
        if retrieval.top_k == 0 {
            bail!("retrieval.top_k must be greater than 0");
        }
        if !(-1.0..=1.0).contains(&retrieval.min_similarity) {
            bail!(
                "retrieval.min_similarity must be between -1.0 and 1.0, got {}",
                retrieval.min_similarity
            );
        }
        if retrieval.relax_step_days <= 0 {
            bail!("retrieval.relax_step_days must be greater than 0");
        }
        if retrieval.n_clusters == 0 {
            bail!("retrieval.n_clusters must be greater than 0");
        }

        let calibration = &self.calibration;
        if calibration.text_embed_dim == 0 {
            bail!("calibration.text_embed_dim must be greater than 0");
        }
        if calibration.threshold_step <= 0.0 {
            bail!("calibration.threshold_step must be greater than 0");
        }
        if calibration.threshold_start >= calibration.threshold_end {
            bail!(
                "calibration.threshold_start ({}) must be below threshold_end ({})",
                calibration.threshold_start,
                calibration.threshold_end
            );
        }
        if !(0.0..=1.0).contains(&calibration.max_match_fraction) {
            bail!(
                "calibration.max_match_fraction must be between 0.0 and 1.0, got {}",
                calibration.max_match_fraction
            );
        }
        if calibration.query_templates.is_empty() {
            bail!("calibration.query_templates must not be empty");
        }
        if let Some(template) = calibration
            .query_templates
            .iter()
            .find(|template| !template.contains("{ITEM}"))
        {
            bail!("calibration.query_templates entry {template:?} has no {{ITEM}} placeholder");
        }
        if calibration.document_batch_size == 0 || calibration.query_batch_size == 0 {
            bail!("calibration batch sizes must be greater than 0");
        }

        if self.pipeline.checkpoint_every == 0 {
            bail!("pipeline.checkpoint_every must be greater than 0");
        }
        if self.pipeline.collage_tile_px == 0 {
            bail!("pipeline.collage_tile_px must be greater than 0");
        }

        if self.oracles.request_timeout_secs == 0 {
            bail!("oracles.request_timeout_secs must be greater than 0");
        }
        url::Url::parse(&self.oracles.endpoint)
            .with_context(|| format!("oracles.endpoint is not a valid url: {}", self.oracles.endpoint))?;

        Ok(())
    }

    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        let store = BackendLocal::new(base_path)?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            store.write_atomic(CONFIG_FILE, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let config_str =
            String::from_utf8(store.read(CONFIG_FILE)?).context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case new fields were filled with defaults
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write_atomic(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}
