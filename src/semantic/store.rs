//! Persisted embedding tables and the runners that fill them.
//!
//! Image embeddings are keyed by the normalized media URL and carry one
//! vector column per dimension (`embedding_<D>`). Rows are created on the
//! first successful embedding and only ever gain columns afterwards, so a
//! merge never drops vectors of another dimension, tags, or unknown fields.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::IsTerminal;
use std::sync::{mpsc, OnceLock};

use chrono::NaiveDate;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::embeddings::{EmbeddingError, EmbeddingOracle, TextTask};
use super::vector::is_usable;
use crate::errors::PipelineError;
use crate::oracle::{MediaFetcher, OracleError};
use crate::retry::RetryPolicy;
use crate::reviews::{truncate_chars, Review};

/// Tag set on photos that look like food rather than menus or the venue
pub const LIKELY_FOOD: &str = "likely_food";

pub fn vector_column(dim: usize) -> String {
    format!("embedding_{dim}")
}

/// Natural key of a review photo: the URL requested at a fixed max side.
///
/// Scheme and host are lower-cased by the URL parser, fragments dropped, and
/// any sizing suffix (`=s800`, `=w400-h300-k-no`, ...) replaced with
/// `=s<max_side>`. Returns `None` for anything that is not an http(s) URL.
pub fn normalize_media_url(raw: &str, max_side: u32) -> Option<String> {
    let mut url = url::Url::parse(raw.trim()).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    url.set_fragment(None);

    let base = size_suffix().replace(url.as_str(), "").to_string();
    Some(format!("{base}=s{max_side}"))
}

fn size_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"=[swh]\d+[-a-zA-Z0-9]*$").expect("static regex"))
}

/// One review photo to embed.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageRef {
    pub image_url: String,
    pub review_id: String,
    pub published_date: Option<NaiveDate>,
}

/// Photos of all reviews, deduplicated by natural key (first occurrence wins).
pub fn collect_images(reviews: &[Review], max_side: u32) -> Vec<ImageRef> {
    let mut seen = HashSet::new();
    let mut images = vec![];

    for review in reviews {
        let published_date = review.published_date();
        for raw in &review.image_urls {
            let Some(image_url) = normalize_media_url(raw, max_side) else {
                log::debug!("review={} skipping unusable image url {raw:?}", review.id);
                continue;
            };
            if seen.insert(image_url.clone()) {
                images.push(ImageRef {
                    image_url,
                    review_id: review.id.clone(),
                    published_date,
                });
            }
        }
    }

    images
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRow {
    pub image_url: String,
    pub review_id: String,
    #[serde(default)]
    pub published_date: Option<NaiveDate>,
    #[serde(default)]
    pub vectors: BTreeMap<String, Vec<f32>>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Columns written by other tools, kept verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl EmbeddingRow {
    pub fn vector(&self, dim: usize) -> Option<&[f32]> {
        self.vectors
            .get(&vector_column(dim))
            .map(|v| v.as_slice())
            .filter(|v| is_usable(v, dim))
    }
}

/// An item of the similarity pool for one embedding dimension.
#[derive(Clone, Debug, PartialEq)]
pub struct EmbeddedItem {
    pub id: String,
    /// Review the photo belongs to
    pub source: String,
    pub vector: Vec<f32>,
    pub published_date: Option<NaiveDate>,
    pub tags: BTreeSet<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingTable {
    /// Labeling passes already applied to every row
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub rows: Vec<EmbeddingRow>,
}

impl EmbeddingTable {
    pub fn already_embedded(&self, image_url: &str, dim: usize) -> bool {
        self.rows
            .iter()
            .any(|row| row.image_url == image_url && row.vector(dim).is_some())
    }

    /// Sets the `dim` vector of the row keyed by `image.image_url`, creating
    /// the row when needed.
    pub fn upsert_vector(&mut self, image: &ImageRef, dim: usize, vector: Vec<f32>) {
        let column = vector_column(dim);
        match self.rows.iter_mut().find(|row| row.image_url == image.image_url) {
            Some(row) => {
                row.vectors.insert(column, vector);
            }
            None => {
                let mut row = EmbeddingRow {
                    image_url: image.image_url.clone(),
                    review_id: image.review_id.clone(),
                    published_date: image.published_date,
                    ..Default::default()
                };
                row.vectors.insert(column, vector);
                self.rows.push(row);
            }
        }
    }

    /// Rows holding a usable vector of dimension `dim`.
    pub fn items(&self, dim: usize) -> Vec<EmbeddedItem> {
        self.rows
            .iter()
            .filter_map(|row| {
                row.vector(dim).map(|vector| EmbeddedItem {
                    id: row.image_url.clone(),
                    source: row.review_id.clone(),
                    vector: vector.to_vec(),
                    published_date: row.published_date,
                    tags: row.tags.clone(),
                })
            })
            .collect()
    }

    pub fn set_tag(&mut self, image_url: &str, tag: &str, on: bool) {
        if let Some(row) = self.rows.iter_mut().find(|row| row.image_url == image_url) {
            if on {
                row.tags.insert(tag.to_string());
            } else {
                row.tags.remove(tag);
            }
        }
    }
}

/// Outcome of an embedding batch.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EmbedReport {
    pub requested: usize,
    pub skipped: usize,
    pub embedded: usize,
    /// Items that exhausted their retries, with the last error
    pub failed: Vec<(String, String)>,
}

fn progress_bar(len: usize, label: &str) -> ProgressBar {
    if !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::with_template("{msg} [{bar:30}] {pos}/{len} ({eta})") {
        bar.set_style(style);
    }
    bar.set_message(label.to_string());
    bar
}

fn download_error(err: OracleError) -> EmbeddingError {
    match err {
        OracleError::RateLimited => EmbeddingError::RateLimited,
        OracleError::Timeout => EmbeddingError::Timeout,
        OracleError::Network(msg) => EmbeddingError::DownloadFailed(msg),
        other => EmbeddingError::Unknown(format!("download failed: {other}")),
    }
}

/// Downloads and embeds review photos on a bounded worker pool.
pub struct ImageEmbedder<'a> {
    pub oracle: &'a dyn EmbeddingOracle,
    pub fetcher: &'a dyn MediaFetcher,
    pub retry: RetryPolicy,
    pub workers: usize,
    pub checkpoint_every: usize,
}

impl ImageEmbedder<'_> {
    fn embed_one(&self, image: &ImageRef, dim: usize) -> Result<Vec<f32>, EmbeddingError> {
        let label = format!("embed image {}", image.image_url);
        let vector = self.retry.run(&label, || {
            let media = self.fetcher.fetch(&image.image_url).map_err(download_error)?;
            self.oracle.embed_image(&media.bytes, &media.mime_type, dim)
        })?;

        if !is_usable(&vector, dim) {
            return Err(EmbeddingError::Unknown(format!(
                "unusable {}-dim vector",
                vector.len()
            )));
        }
        Ok(vector)
    }

    /// Embeds every image of `images` that has no `dim` vector in `table` yet.
    ///
    /// Results are merged as they arrive and `persist` is called every
    /// `checkpoint_every` new vectors and once at the end, so work done before
    /// a crash survives. Items that keep failing are reported, not fatal.
    pub fn embed_missing<F>(
        &self,
        table: &mut EmbeddingTable,
        images: &[ImageRef],
        dim: usize,
        mut persist: F,
    ) -> Result<EmbedReport, PipelineError>
    where
        F: FnMut(&EmbeddingTable) -> Result<(), PipelineError>,
    {
        let pending: Vec<&ImageRef> = images
            .iter()
            .filter(|image| !table.already_embedded(&image.image_url, dim))
            .collect();

        let mut report = EmbedReport {
            requested: images.len(),
            skipped: images.len() - pending.len(),
            ..Default::default()
        };

        if pending.is_empty() {
            return Ok(report);
        }

        log::info!(
            "embedding {} images ({} already embedded) dim={dim}",
            pending.len(),
            report.skipped
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers.max(1))
            .build()
            .map_err(|e| PipelineError::Other(e.into()))?;

        let bar = progress_bar(pending.len(), "embedding images");
        let mut since_checkpoint = 0usize;
        let mut persist_error = None;

        std::thread::scope(|s| {
            let (tx, rx) = mpsc::channel();
            let pending = &pending;
            let pool = &pool;

            s.spawn(move || {
                pool.install(|| {
                    pending.par_iter().for_each_with(tx, |tx, image| {
                        let result = self.embed_one(image, dim);
                        let _ = tx.send((*image, result));
                    })
                })
            });

            for (image, result) in rx {
                bar.inc(1);
                match result {
                    Ok(vector) => {
                        table.upsert_vector(image, dim, vector);
                        report.embedded += 1;
                        since_checkpoint += 1;
                    }
                    Err(err) => {
                        log::warn!("image={} outcome=unembeddable error={err}", image.image_url);
                        report.failed.push((image.image_url.clone(), err.to_string()));
                    }
                }

                if since_checkpoint >= self.checkpoint_every && persist_error.is_none() {
                    since_checkpoint = 0;
                    if let Err(err) = persist(table) {
                        persist_error = Some(err);
                    }
                }
            }
        });

        bar.finish_and_clear();

        if let Some(err) = persist_error {
            return Err(err);
        }
        if since_checkpoint > 0 {
            persist(table)?;
        }

        log::info!(
            "embedded {} images, {} failed",
            report.embedded,
            report.failed.len()
        );

        Ok(report)
    }
}

/// Persisted review text embedding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReviewEmbedding {
    pub review_id: String,
    /// Text as embedded, after truncation
    pub text: String,
    #[serde(default)]
    pub published_date: Option<NaiveDate>,
    pub vector: Vec<f32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewEmbeddingTable {
    pub dimension: usize,
    /// Set once every review with text went through a batch; checkpoints
    /// written mid-run leave it false
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub rows: Vec<ReviewEmbedding>,
}

impl ReviewEmbeddingTable {
    /// Every review with text went through a batch at dimension `dim`.
    pub fn is_complete(&self, dim: usize) -> bool {
        self.complete && self.dimension == dim
    }
}

/// Embeds review texts in fixed-size batches.
pub struct ReviewEmbedder<'a> {
    pub oracle: &'a dyn EmbeddingOracle,
    pub retry: RetryPolicy,
    pub batch_size: usize,
    pub text_limit: usize,
}

impl ReviewEmbedder<'_> {
    /// Embeds reviews with text that are not in `table` yet.
    ///
    /// A batch that keeps failing leaves its reviews out of the table (and
    /// thus out of matching); `persist` runs after every successful batch.
    pub fn embed_missing<F>(
        &self,
        table: &mut ReviewEmbeddingTable,
        reviews: &[Review],
        dim: usize,
        mut persist: F,
    ) -> Result<EmbedReport, PipelineError>
    where
        F: FnMut(&ReviewEmbeddingTable) -> Result<(), PipelineError>,
    {
        if table.dimension != dim {
            table.complete = false;
        }
        table.dimension = dim;
        // rows of another dimension are re-embedded
        table.rows.retain(|row| is_usable(&row.vector, dim));
        let done: HashSet<&str> = table.rows.iter().map(|row| row.review_id.as_str()).collect();

        let mut seen = HashSet::new();
        let with_text: Vec<(&Review, &str)> = reviews
            .iter()
            .filter_map(|review| review.text().map(|text| (review, text)))
            .filter(|(review, _)| seen.insert(review.id.as_str()))
            .collect();

        let pending: Vec<(&Review, String)> = with_text
            .iter()
            .filter(|(review, _)| !done.contains(review.id.as_str()))
            .map(|(review, text)| (*review, truncate_chars(text, self.text_limit).to_string()))
            .collect();

        let mut report = EmbedReport {
            requested: with_text.len(),
            skipped: with_text.len() - pending.len(),
            ..Default::default()
        };

        if pending.is_empty() {
            return Ok(report);
        }

        log::info!("embedding {} review texts dim={dim}", pending.len());
        let bar = progress_bar(pending.len(), "embedding reviews");

        for (batch_idx, batch) in pending.chunks(self.batch_size.max(1)).enumerate() {
            let texts: Vec<String> = batch.iter().map(|(_, text)| text.clone()).collect();
            let label = format!("embed review batch {batch_idx}");
            let result = self.retry.run(&label, || {
                self.oracle.embed_texts(&texts, dim, TextTask::RetrievalDocument)
            });

            bar.inc(batch.len() as u64);
            match result {
                Ok(vectors) if vectors.len() == batch.len() => {
                    for ((review, text), vector) in batch.iter().zip(vectors) {
                        if !is_usable(&vector, dim) {
                            report
                                .failed
                                .push((review.id.clone(), "unusable vector".to_string()));
                            continue;
                        }
                        report.embedded += 1;
                        table.rows.push(ReviewEmbedding {
                            review_id: review.id.clone(),
                            text: text.clone(),
                            published_date: review.published_date(),
                            vector,
                        });
                    }
                    persist(table)?;
                }
                Ok(vectors) => {
                    let message = format!("{} vectors for {} texts", vectors.len(), batch.len());
                    log::warn!("review batch={batch_idx} outcome=failed error={message}");
                    report
                        .failed
                        .extend(batch.iter().map(|(review, _)| (review.id.clone(), message.clone())));
                }
                Err(err) => {
                    log::warn!("review batch={batch_idx} outcome=failed error={err}");
                    report
                        .failed
                        .extend(batch.iter().map(|(review, _)| (review.id.clone(), err.to_string())));
                }
            }
        }

        bar.finish_and_clear();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::Media;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct UrlFetcher;

    impl MediaFetcher for UrlFetcher {
        fn fetch(&self, url: &str) -> Result<Media, OracleError> {
            if url.contains("broken") {
                return Err(OracleError::Network("connection reset".into()));
            }
            Ok(Media::from_bytes(url.as_bytes().to_vec()))
        }
    }

    /// Vector derived from the payload length so results are deterministic.
    struct LengthEmbedder {
        calls: AtomicUsize,
        fail_texts_containing: Option<&'static str>,
    }

    impl LengthEmbedder {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_texts_containing: None,
            }
        }
    }

    impl EmbeddingOracle for LengthEmbedder {
        fn embed_image(&self, image: &[u8], _: &str, dim: usize) -> Result<Vec<f32>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut v = vec![0.0; dim];
            v[image.len() % dim] = 1.0;
            Ok(v)
        }

        fn embed_texts(
            &self,
            texts: &[String],
            dim: usize,
            _: TextTask,
        ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(needle) = self.fail_texts_containing {
                if texts.iter().any(|t| t.contains(needle)) {
                    return Err(EmbeddingError::RateLimited);
                }
            }
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0; dim];
                    v[t.len() % dim] = 1.0;
                    v
                })
                .collect())
        }
    }

    fn review(id: &str, urls: &[&str]) -> Review {
        Review {
            id: id.to_string(),
            text: Some(format!("review {id}")),
            published_at: Some("2024-03-01T00:00:00Z".to_string()),
            review_url: None,
            image_urls: urls.iter().map(|u| u.to_string()).collect(),
        }
    }

    #[test]
    fn test_normalize_media_url() {
        assert_eq!(
            normalize_media_url("https://LH3.Example.com/p/AbC=w400-h300-k-no", 1024).as_deref(),
            Some("https://lh3.example.com/p/AbC=s1024")
        );
        assert_eq!(
            normalize_media_url("https://lh3.example.com/p/abc#frag", 1024).as_deref(),
            Some("https://lh3.example.com/p/abc=s1024")
        );
        assert_eq!(normalize_media_url("not a url", 1024), None);
        assert_eq!(normalize_media_url("ftp://x/y", 1024), None);
    }

    #[test]
    fn test_collect_images_dedups_by_natural_key() {
        let reviews = vec![
            review("0", &["https://img/a=s200", "https://img/b"]),
            review("1", &["https://img/a=s800"]),
        ];
        let images = collect_images(&reviews, 1024);
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].image_url, "https://img/a=s1024");
        assert_eq!(images[0].review_id, "0");
    }

    #[test]
    fn test_embed_missing_skips_existing_and_preserves_columns() {
        let mut table = EmbeddingTable::default();
        let a = ImageRef {
            image_url: "https://img/a=s1024".into(),
            review_id: "0".into(),
            published_date: None,
        };
        table.upsert_vector(&a, 4, vec![1.0, 0.0, 0.0, 0.0]);
        table.upsert_vector(&a, 2, vec![0.0, 1.0]);
        table.set_tag(&a.image_url, LIKELY_FOOD, true);
        table.rows[0]
            .extra
            .insert("note".into(), serde_json::json!("kept"));

        let b = ImageRef {
            image_url: "https://img/b=s1024".into(),
            review_id: "1".into(),
            published_date: None,
        };

        let oracle = LengthEmbedder::new();
        let embedder = ImageEmbedder {
            oracle: &oracle,
            fetcher: &UrlFetcher,
            retry: RetryPolicy::immediate(2),
            workers: 2,
            checkpoint_every: 10,
        };

        let persisted = Mutex::new(0);
        let report = embedder
            .embed_missing(&mut table, &[a.clone(), b.clone()], 4, |_| {
                *persisted.lock().unwrap() += 1;
                Ok(())
            })
            .unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.embedded, 1);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*persisted.lock().unwrap(), 1);

        let row_a = &table.rows[0];
        assert!(row_a.vector(2).is_some());
        assert!(row_a.tags.contains(LIKELY_FOOD));
        assert_eq!(row_a.extra["note"], "kept");
        assert!(table.already_embedded(&b.image_url, 4));
        assert_eq!(table.items(4).len(), 2);
        assert_eq!(table.items(2).len(), 1);
    }

    #[test]
    fn test_failed_items_are_reported_and_excluded() {
        let mut table = EmbeddingTable::default();
        let images: Vec<ImageRef> = ["https://img/ok1", "https://img/broken", "https://img/ok2"]
            .iter()
            .map(|u| ImageRef {
                image_url: u.to_string(),
                review_id: "0".into(),
                published_date: None,
            })
            .collect();

        let oracle = LengthEmbedder::new();
        let embedder = ImageEmbedder {
            oracle: &oracle,
            fetcher: &UrlFetcher,
            retry: RetryPolicy::immediate(3),
            workers: 3,
            checkpoint_every: 1,
        };

        let checkpoints = AtomicUsize::new(0);
        let report = embedder
            .embed_missing(&mut table, &images, 8, |_| {
                checkpoints.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        assert_eq!(report.embedded, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "https://img/broken");
        assert_eq!(checkpoints.load(Ordering::SeqCst), 2);
        assert!(!table.already_embedded("https://img/broken", 8));
        assert_eq!(table.items(8).len(), 2);
    }

    #[test]
    fn test_table_json_keeps_unknown_columns() {
        let json = r#"{"labels": [], "rows": [{"image_url": "u", "review_id": "1",
            "vectors": {"embedding_2": [1.0, 0.0]}, "legacy_score": 0.4}]}"#;
        let table: EmbeddingTable = serde_json::from_str(json).unwrap();
        assert_eq!(table.rows[0].extra["legacy_score"], 0.4);

        let out = serde_json::to_value(&table).unwrap();
        assert_eq!(out["rows"][0]["legacy_score"], 0.4);
    }

    #[test]
    fn test_review_embedder_batches_and_skips_done() {
        let reviews: Vec<Review> = (0..5)
            .map(|i| review(&i.to_string(), &[]))
            .chain(std::iter::once(Review {
                id: "5".into(),
                text: None,
                published_at: None,
                review_url: None,
                image_urls: vec![],
            }))
            .collect();

        let oracle = LengthEmbedder::new();
        let embedder = ReviewEmbedder {
            oracle: &oracle,
            retry: RetryPolicy::immediate(1),
            batch_size: 2,
            text_limit: 1000,
        };

        let mut table = ReviewEmbeddingTable::default();
        let report = embedder
            .embed_missing(&mut table, &reviews, 16, |_| Ok(()))
            .unwrap();
        assert_eq!(report.requested, 5);
        assert_eq!(report.embedded, 5);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 3);
        let ids: Vec<_> = table.rows.iter().map(|r| r.review_id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "2", "3", "4"]);

        let again = embedder
            .embed_missing(&mut table, &reviews, 16, |_| Ok(()))
            .unwrap();
        assert_eq!(again.skipped, 5);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_review_embedder_redoes_rows_of_another_dimension() {
        let reviews: Vec<Review> = (0..3).map(|i| review(&i.to_string(), &[])).collect();
        let oracle = LengthEmbedder::new();
        let embedder = ReviewEmbedder {
            oracle: &oracle,
            retry: RetryPolicy::immediate(1),
            batch_size: 10,
            text_limit: 1000,
        };

        let mut table = ReviewEmbeddingTable::default();
        embedder
            .embed_missing(&mut table, &reviews, 16, |_| Ok(()))
            .unwrap();
        table.complete = true;

        let report = embedder
            .embed_missing(&mut table, &reviews, 8, |_| Ok(()))
            .unwrap();

        assert_eq!(report.skipped, 0);
        assert_eq!(report.embedded, 3);
        assert!(!table.complete);
        assert_eq!(table.rows.len(), 3);
        assert!(table.rows.iter().all(|row| row.vector.len() == 8));
    }

    #[test]
    fn test_review_embedder_failed_batch_is_excluded() {
        let reviews: Vec<Review> = (0..4).map(|i| review(&i.to_string(), &[])).collect();
        let oracle = LengthEmbedder {
            calls: AtomicUsize::new(0),
            fail_texts_containing: Some("review 3"),
        };
        let embedder = ReviewEmbedder {
            oracle: &oracle,
            retry: RetryPolicy::immediate(2),
            batch_size: 2,
            text_limit: 8,
        };

        let mut table = ReviewEmbeddingTable::default();
        let report = embedder
            .embed_missing(&mut table, &reviews, 16, |_| Ok(()))
            .unwrap();

        assert_eq!(report.embedded, 2);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].text, "review 0");
    }
}
