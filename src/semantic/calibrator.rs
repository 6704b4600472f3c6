//! Review to menu item matching with one calibrated threshold per run.
//!
//! Every item is expanded into paraphrased queries ("ordered {ITEM}",
//! "the {ITEM} was", for its name and each nickname). The similarity of an
//! item to a review is the best score over its queries. A single threshold is
//! then chosen for the whole run: the lowest one on the grid at which no item
//! matches more than a fixed fraction of all reviews. Without such a
//! threshold a fallback is used and flagged.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::vector::{cosine_similarity, is_usable};
use crate::config::CalibrationConfig;
use crate::errors::PipelineError;

/// A unit of text evidence (one review) with its embedding.
#[derive(Clone, Debug, PartialEq)]
pub struct TextUnit {
    pub id: String,
    pub vector: Vec<f32>,
}

/// A menu item as seen by the matcher.
#[derive(Clone, Debug, PartialEq)]
pub struct MatchEntity {
    pub id: String,
    pub name: String,
    pub aliases: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParaphraseQuery {
    pub entity_id: String,
    pub text: String,
}

#[derive(Clone, Debug)]
pub struct CalibrationParams {
    pub threshold_start: f32,
    pub threshold_end: f32,
    pub threshold_step: f32,
    pub max_match_fraction: f32,
    pub fallback_threshold: f32,
    pub top_n: usize,
    pub query_templates: Vec<String>,
    pub query_batch_size: usize,
}

impl CalibrationParams {
    pub fn from_config(config: &CalibrationConfig) -> Self {
        Self {
            threshold_start: config.threshold_start,
            threshold_end: config.threshold_end,
            threshold_step: config.threshold_step,
            max_match_fraction: config.max_match_fraction,
            fallback_threshold: config.fallback_threshold,
            top_n: config.top_n,
            query_templates: config.query_templates.clone(),
            query_batch_size: config.query_batch_size,
        }
    }

    /// Candidate thresholds, ascending, rounded to two decimals. The end is
    /// exclusive.
    pub fn threshold_grid(&self) -> Vec<f32> {
        let span = (self.threshold_end - self.threshold_start) / self.threshold_step;
        let steps = (span - 1e-4).ceil().max(0.0) as usize;
        (0..steps)
            .map(|i| round2(self.threshold_start + i as f32 * self.threshold_step))
            .collect()
    }

    /// Largest number of units a single entity may match.
    pub fn cap(&self, n_units: usize) -> usize {
        (self.max_match_fraction as f64 * n_units as f64 + 1e-6).floor() as usize
    }
}

fn round2(value: f32) -> f32 {
    (value * 100.0).round() / 100.0
}

/// Template × (name + aliases), deduplicated per entity (case-insensitive).
pub fn paraphrase_queries(entities: &[MatchEntity], templates: &[String]) -> Vec<ParaphraseQuery> {
    let mut queries = vec![];
    for entity in entities {
        let mut seen = HashSet::new();
        let names = std::iter::once(&entity.name).chain(entity.aliases.iter());
        for name in names {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            for template in templates {
                let text = template.replace("{ITEM}", name);
                if seen.insert(text.to_lowercase()) {
                    queries.push(ParaphraseQuery {
                        entity_id: entity.id.clone(),
                        text,
                    });
                }
            }
        }
    }
    queries
}

/// Entity × unit similarity, the max over each entity's query vectors.
#[derive(Clone, Debug, PartialEq)]
pub struct SimilarityMatrix {
    pub entity_ids: Vec<String>,
    pub unit_ids: Vec<String>,
    /// `scores[entity][unit]`
    pub scores: Vec<Vec<f32>>,
}

impl SimilarityMatrix {
    pub fn build(units: &[TextUnit], entity_vectors: &[(String, Vec<Vec<f32>>)]) -> Self {
        let unit_ids = units.iter().map(|u| u.id.clone()).collect();
        let mut entity_ids = vec![];
        let mut scores = vec![];

        for (entity_id, vectors) in entity_vectors {
            if vectors.is_empty() {
                continue;
            }
            let row = units
                .iter()
                .map(|unit| {
                    vectors
                        .iter()
                        .map(|q| cosine_similarity(q, &unit.vector))
                        .fold(f32::MIN, f32::max)
                })
                .collect();
            entity_ids.push(entity_id.clone());
            scores.push(row);
        }

        Self {
            entity_ids,
            unit_ids,
            scores,
        }
    }

    pub fn counts_at(&self, threshold: f32) -> Vec<usize> {
        self.scores
            .iter()
            .map(|row| row.iter().filter(|s| **s >= threshold).count())
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ThresholdChoice {
    pub threshold: f32,
    pub fallback_used: bool,
    pub cap: usize,
}

/// First grid threshold at which every entity stays within the cap.
pub fn choose_threshold(matrix: &SimilarityMatrix, params: &CalibrationParams) -> ThresholdChoice {
    let cap = params.cap(matrix.unit_ids.len());

    for threshold in params.threshold_grid() {
        let max_count = matrix.counts_at(threshold).into_iter().max().unwrap_or(0);
        if max_count <= cap {
            return ThresholdChoice {
                threshold,
                fallback_used: false,
                cap,
            };
        }
    }

    ThresholdChoice {
        threshold: round2(params.fallback_threshold),
        fallback_used: true,
        cap,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityMatches {
    pub entity_id: String,
    pub unit_ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub threshold: f32,
    /// No grid threshold satisfied the cap; `threshold` is the fallback
    pub fallback_used: bool,
    pub cap: usize,
    pub n_units: usize,
    /// Match count of every scored entity at `threshold`
    pub match_counts: BTreeMap<String, usize>,
    /// Top entities by match count, descending
    pub matches: Vec<EntityMatches>,
}

pub struct MatchCalibrator {
    params: CalibrationParams,
}

impl MatchCalibrator {
    pub fn new(params: CalibrationParams) -> Self {
        Self { params }
    }

    /// Binarizes `matrix` at the chosen threshold and keeps the top entities.
    pub fn label(&self, matrix: &SimilarityMatrix) -> Calibration {
        let choice = choose_threshold(matrix, &self.params);
        if choice.fallback_used {
            log::warn!(
                "no threshold keeps every item under {} of {} reviews, using fallback {}",
                choice.cap,
                matrix.unit_ids.len(),
                choice.threshold
            );
        }

        let mut matches: Vec<EntityMatches> = matrix
            .entity_ids
            .iter()
            .zip(matrix.scores.iter())
            .map(|(entity_id, row)| EntityMatches {
                entity_id: entity_id.clone(),
                unit_ids: row
                    .iter()
                    .zip(matrix.unit_ids.iter())
                    .filter(|(score, _)| **score >= choice.threshold)
                    .map(|(_, id)| id.clone())
                    .collect(),
            })
            .collect();

        let match_counts = matches
            .iter()
            .map(|m| (m.entity_id.clone(), m.unit_ids.len()))
            .collect();

        // stable: ties keep entity order
        matches.sort_by(|a, b| b.unit_ids.len().cmp(&a.unit_ids.len()));
        matches.truncate(self.params.top_n);

        Calibration {
            threshold: choice.threshold,
            fallback_used: choice.fallback_used,
            cap: choice.cap,
            n_units: matrix.unit_ids.len(),
            match_counts,
            matches,
        }
    }

    /// Embeds paraphrase queries with `embed_queries` (in batches), builds the
    /// similarity matrix against `units`, and labels it.
    ///
    /// Units and query vectors that are empty or non-finite are left out
    /// rather than scored.
    pub fn calibrate_and_label<F>(
        &self,
        units: &[TextUnit],
        entities: &[MatchEntity],
        dim: usize,
        mut embed_queries: F,
    ) -> Result<Calibration, PipelineError>
    where
        F: FnMut(&[String]) -> Result<Vec<Vec<f32>>, PipelineError>,
    {
        let units: Vec<TextUnit> = units
            .iter()
            .filter(|u| is_usable(&u.vector, dim))
            .cloned()
            .collect();

        let queries = paraphrase_queries(entities, &self.params.query_templates);
        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(queries.len());
        for batch in queries.chunks(self.params.query_batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|q| q.text.clone()).collect();
            let embedded = embed_queries(&texts)?;
            if embedded.len() != texts.len() {
                return Err(PipelineError::TransientExternal(format!(
                    "got {} query vectors for {} queries",
                    embedded.len(),
                    texts.len()
                )));
            }
            vectors.extend(embedded);
        }

        let mut per_entity: Vec<(String, Vec<Vec<f32>>)> = entities
            .iter()
            .map(|e| (e.id.clone(), vec![]))
            .collect();
        for (query, vector) in queries.iter().zip(vectors) {
            if !is_usable(&vector, dim) {
                log::debug!("dropping unusable vector for query {:?}", query.text);
                continue;
            }
            if let Some((_, bucket)) = per_entity.iter_mut().find(|(id, _)| *id == query.entity_id) {
                bucket.push(vector);
            }
        }

        let matrix = SimilarityMatrix::build(&units, &per_entity);
        let calibration = self.label(&matrix);

        log::info!(
            "matched {} items against {} reviews threshold={} fallback={}",
            calibration.matches.len(),
            calibration.n_units,
            calibration.threshold,
            calibration.fallback_used
        );

        Ok(calibration)
    }
}
