//! Similarity retrieval with similarity floor and date backoff.
//!
//! Items are ranked by cosine similarity to a concept query. The walk stops
//! at the first score under the floor and keeps only items published on or
//! after a cutoff date. When fewer than half of `top_k` survive, the cutoff
//! moves back in fixed steps, a bounded number of times.

use chrono::{NaiveDate, TimeDelta};
use serde::{Deserialize, Serialize};

use super::store::EmbeddedItem;
use super::vector::cosine_similarity;
use crate::config::RetrievalConfig;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CandidateResult {
    pub item_id: String,
    /// Review the item belongs to
    pub source: String,
    pub score: f32,
    pub published_date: Option<NaiveDate>,
    #[serde(skip)]
    pub vector: Vec<f32>,
}

#[derive(Clone, Debug)]
pub struct RetrievalParams {
    pub top_k: usize,
    pub min_similarity: f32,
    pub min_date: NaiveDate,
    pub relax_step_days: i64,
    pub max_relaxations: u32,
}

impl RetrievalParams {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            top_k: config.top_k,
            min_similarity: config.min_similarity,
            min_date: config.min_date,
            relax_step_days: config.relax_step_days,
            max_relaxations: config.max_relaxations,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Retrieval {
    /// Descending by score, at most `top_k`
    pub candidates: Vec<CandidateResult>,
    /// Number of times the cutoff was moved back
    pub relaxations: u32,
    /// Cutoff the candidates were collected with
    pub cutoff: NaiveDate,
}

fn collect(
    ranked: &[(&EmbeddedItem, f32)],
    cutoff: NaiveDate,
    params: &RetrievalParams,
) -> Vec<CandidateResult> {
    let mut kept = vec![];
    for (item, score) in ranked {
        if kept.len() >= params.top_k || *score < params.min_similarity {
            break;
        }
        let recent = item.published_date.is_some_and(|date| date >= cutoff);
        if !recent {
            continue;
        }
        kept.push(CandidateResult {
            item_id: item.id.clone(),
            source: item.source.clone(),
            score: *score,
            published_date: item.published_date,
            vector: item.vector.clone(),
        });
    }
    kept
}

pub fn retrieve(pool: &[EmbeddedItem], query: &[f32], params: &RetrievalParams) -> Retrieval {
    let mut ranked: Vec<(&EmbeddedItem, f32)> = pool
        .iter()
        .map(|item| (item, cosine_similarity(query, &item.vector)))
        .collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let target = params.top_k / 2;
    let step = TimeDelta::days(params.relax_step_days);
    let mut cutoff = params.min_date;
    let mut relaxations = 0;

    loop {
        let candidates = collect(&ranked, cutoff, params);

        if candidates.len() >= target || relaxations >= params.max_relaxations {
            log::debug!(
                "retrieved {} candidates cutoff={cutoff} relaxations={relaxations}",
                candidates.len()
            );
            return Retrieval {
                candidates,
                relaxations,
                cutoff,
            };
        }

        log::info!(
            "only {} candidates since {cutoff}, relaxing date cutoff",
            candidates.len()
        );
        cutoff = cutoff.checked_sub_signed(step).unwrap_or(NaiveDate::MIN);
        relaxations += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    /// Unit vector at `score` cosine from the query `[1, 0]`.
    fn item(id: usize, score: f32, date: Option<(i32, u32, u32)>) -> EmbeddedItem {
        let angle = score.clamp(-1.0, 1.0).acos();
        EmbeddedItem {
            id: format!("img-{id}"),
            source: format!("{id}"),
            vector: vec![angle.cos(), angle.sin()],
            published_date: date.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
            tags: BTreeSet::new(),
        }
    }

    fn params() -> RetrievalParams {
        RetrievalParams {
            top_k: 10,
            min_similarity: 0.355,
            min_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            relax_step_days: 180,
            max_relaxations: 5,
        }
    }

    const QUERY: [f32; 2] = [1.0, 0.0];

    #[test]
    fn test_top_k_recent_items_without_relaxation() {
        // 12 recent items above the floor, 13 more that are either old or weak
        let mut pool: Vec<EmbeddedItem> = (0..12)
            .map(|i| item(i, 0.9 - i as f32 * 0.02, Some((2024, 6, 1))))
            .collect();
        pool.extend((12..20).map(|i| item(i, 0.95, Some((2022, 1, 1)))));
        pool.extend((20..25).map(|i| item(i, 0.2, Some((2024, 6, 1)))));

        let result = retrieve(&pool, &QUERY, &params());

        assert_eq!(result.relaxations, 0);
        assert_eq!(result.candidates.len(), 10);
        assert!(result
            .candidates
            .iter()
            .all(|c| c.published_date >= NaiveDate::from_ymd_opt(2024, 1, 1)));
        assert!(result.candidates.windows(2).all(|w| w[0].score >= w[1].score));
        assert_eq!(result.candidates[0].item_id, "img-0");
    }

    #[test]
    fn test_relaxes_until_half_of_top_k() {
        let mut pool: Vec<EmbeddedItem> = (0..3)
            .map(|i| item(i, 0.8, Some((2024, 3, 1))))
            .collect();
        // about eight months before the initial cutoff
        pool.extend((3..9).map(|i| item(i, 0.7, Some((2023, 5, 1)))));

        let result = retrieve(&pool, &QUERY, &params());

        assert_eq!(result.relaxations, 2);
        assert_eq!(result.candidates.len(), 9);
        assert!(result.cutoff <= NaiveDate::from_ymd_opt(2023, 5, 1).unwrap());
    }

    #[test]
    fn test_relaxation_is_bounded() {
        let pool: Vec<EmbeddedItem> = (0..6)
            .map(|i| item(i, 0.9, Some((2010, 1, 1))))
            .collect();

        let result = retrieve(&pool, &QUERY, &params());

        assert_eq!(result.relaxations, 5);
        assert!(result.candidates.is_empty());
    }

    #[test]
    fn test_walk_stops_at_floor_and_skips_undated() {
        let pool = vec![
            item(0, 0.9, None),
            item(1, 0.8, Some((2024, 2, 1))),
            item(2, 0.3, Some((2024, 2, 1))),
            item(3, 0.6, Some((2024, 2, 1))),
        ];
        let mut p = params();
        p.top_k = 2;

        let result = retrieve(&pool, &QUERY, &p);
        let ids: Vec<_> = result.candidates.iter().map(|c| c.item_id.as_str()).collect();
        assert_eq!(ids, vec!["img-1", "img-3"]);
    }

    #[test]
    fn test_zero_vectors_and_empty_pool() {
        let result = retrieve(&[], &QUERY, &params());
        assert!(result.candidates.is_empty());

        let mut zero = item(0, 0.9, Some((2024, 5, 1)));
        zero.vector = vec![0.0, 0.0];
        let result = retrieve(&[zero], &QUERY, &params());
        assert!(result.candidates.is_empty());
    }

    #[test]
    fn test_never_exceeds_top_k() {
        let pool: Vec<EmbeddedItem> = (0..40)
            .map(|i| item(i, 0.99 - i as f32 * 0.001, Some((2024, 1, 1))))
            .collect();
        for top_k in [0, 1, 3, 10, 39, 50] {
            let mut p = params();
            p.top_k = top_k;
            assert!(retrieve(&pool, &QUERY, &p).candidates.len() <= top_k);
        }
    }
}
