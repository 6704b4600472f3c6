//! Diversity-preserving reduction of a candidate list.
//!
//! Candidates are L2-normalized and grouped with Ward agglomerative
//! clustering (Euclidean metric) into exactly `k` clusters; the most recent
//! member of each cluster represents it. Near-duplicate photos of the same
//! menu board collapse into one cluster, so the survivors show different
//! boards.

use chrono::NaiveDate;

use super::retriever::CandidateResult;
use super::vector::{normalize, squared_euclidean};

pub trait DiversityItem {
    fn vector(&self) -> &[f32];
    fn published_date(&self) -> Option<NaiveDate>;
}

impl DiversityItem for CandidateResult {
    fn vector(&self) -> &[f32] {
        &self.vector
    }

    fn published_date(&self) -> Option<NaiveDate> {
        self.published_date
    }
}

/// Ward linkage down to `k` clusters.
///
/// Returns a cluster label per point. Labels are numbered by each cluster's
/// lowest member index, so label order follows input (rank) order.
pub fn ward_labels(points: &[Vec<f32>], k: usize) -> Vec<usize> {
    let n = points.len();
    if k == 0 || n == 0 {
        return vec![0; n];
    }
    if k >= n {
        return (0..n).collect();
    }

    // Lance-Williams on squared euclidean distances
    let mut dist = vec![vec![0.0f64; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let d = squared_euclidean(&points[i], &points[j]);
            dist[i][j] = d;
            dist[j][i] = d;
        }
    }

    let mut size = vec![1usize; n];
    let mut active = vec![true; n];
    // cluster i always keeps its lowest member index as its id
    let mut owner: Vec<usize> = (0..n).collect();
    let mut clusters = n;

    while clusters > k {
        let mut best: Option<(usize, usize, f64)> = None;
        for i in 0..n {
            if !active[i] {
                continue;
            }
            for j in (i + 1)..n {
                if !active[j] {
                    continue;
                }
                if best.map_or(true, |(_, _, d)| dist[i][j] < d) {
                    best = Some((i, j, dist[i][j]));
                }
            }
        }

        let Some((a, b, d_ab)) = best else {
            break;
        };

        let (na, nb) = (size[a] as f64, size[b] as f64);
        for m in 0..n {
            if !active[m] || m == a || m == b {
                continue;
            }
            let nm = size[m] as f64;
            let updated = ((na + nm) * dist[a][m] + (nb + nm) * dist[b][m] - nm * d_ab)
                / (na + nb + nm);
            dist[a][m] = updated;
            dist[m][a] = updated;
        }

        size[a] += size[b];
        active[b] = false;
        for o in owner.iter_mut() {
            if *o == b {
                *o = a;
            }
        }
        clusters -= 1;
    }

    let mut label_of_owner = vec![usize::MAX; n];
    let mut next = 0;
    for i in 0..n {
        if active[i] {
            label_of_owner[i] = next;
            next += 1;
        }
    }

    owner.iter().map(|o| label_of_owner[*o]).collect()
}

/// Picks one representative per cluster, at most `k` items.
///
/// When there are no more candidates than `k` they are returned unchanged.
/// Otherwise the result holds exactly `k` items in cluster-label order; each
/// is its cluster's most recent member (undated counts as oldest, ties keep
/// the better-ranked one).
pub fn select_diverse<T: DiversityItem + Clone>(candidates: &[T], k: usize) -> Vec<T> {
    if k == 0 {
        return vec![];
    }
    if candidates.len() <= k {
        return candidates.to_vec();
    }

    let points: Vec<Vec<f32>> = candidates.iter().map(|c| normalize(c.vector())).collect();
    let labels = ward_labels(&points, k);

    let mut best: Vec<Option<usize>> = vec![None; k];
    for (idx, label) in labels.iter().enumerate() {
        let slot = &mut best[*label];
        let newer = match slot {
            None => true,
            Some(current) => {
                candidates[idx].published_date() > candidates[*current].published_date()
            }
        };
        if newer {
            *slot = Some(idx);
        }
    }

    best.into_iter()
        .flatten()
        .map(|idx| candidates[idx].clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn candidate(id: &str, vector: Vec<f32>, date: Option<(i32, u32, u32)>) -> CandidateResult {
        CandidateResult {
            item_id: id.to_string(),
            source: "0".to_string(),
            score: 0.5,
            published_date: date.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
            vector,
        }
    }

    /// Ten photos of four boards: each board is a different axis plus noise.
    fn four_boards() -> Vec<CandidateResult> {
        let board = |axis: usize, jitter: f32| {
            let mut v = vec![0.05; 4];
            v[axis] = 1.0;
            v[(axis + 1) % 4] += jitter;
            v
        };
        vec![
            candidate("a1", board(0, 0.00), Some((2024, 1, 1))),
            candidate("b1", board(1, 0.00), Some((2024, 3, 1))),
            candidate("a2", board(0, 0.03), Some((2024, 5, 1))),
            candidate("c1", board(2, 0.00), None),
            candidate("d1", board(3, 0.02), Some((2023, 1, 1))),
            candidate("b2", board(1, 0.02), Some((2024, 2, 1))),
            candidate("c2", board(2, 0.04), Some((2022, 7, 1))),
            candidate("a3", board(0, 0.05), Some((2024, 4, 1))),
            candidate("d2", board(3, 0.00), Some((2023, 6, 1))),
            candidate("b3", board(1, 0.05), Some((2024, 3, 1))),
        ]
    }

    #[test]
    fn test_ward_labels_separates_groups() {
        let points = vec![
            vec![0.0, 0.0],
            vec![10.0, 10.0],
            vec![0.1, 0.0],
            vec![10.0, 10.1],
            vec![0.0, 0.2],
        ];
        let labels = ward_labels(&points, 2);
        assert_eq!(labels, vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn test_ward_labels_trivial_cases() {
        assert_eq!(ward_labels(&[vec![1.0], vec![2.0]], 5), vec![0, 1]);
        assert!(ward_labels(&[], 3).is_empty());
    }

    #[test]
    fn test_one_most_recent_per_board() {
        let selected = select_diverse(&four_boards(), 4);
        let ids: Vec<_> = selected.iter().map(|c| c.item_id.as_str()).collect();

        // cluster order follows the first-ranked member of each board
        assert_eq!(ids, vec!["a2", "b1", "c2", "d2"]);
    }

    #[test]
    fn test_cardinality_and_distinct_clusters() {
        let candidates = four_boards();
        for k in 1..=candidates.len() + 2 {
            let selected = select_diverse(&candidates, k);
            assert_eq!(selected.len(), k.min(candidates.len()));

            let unique: HashSet<_> = selected.iter().map(|c| c.item_id.clone()).collect();
            assert_eq!(unique.len(), selected.len());
        }
    }

    #[test]
    fn test_few_candidates_returned_unchanged() {
        let candidates: Vec<_> = four_boards().into_iter().take(3).collect();
        assert_eq!(select_diverse(&candidates, 4), candidates);
        assert!(select_diverse(&candidates, 0).is_empty());
    }

    #[test]
    fn test_tie_on_date_keeps_better_rank() {
        let candidates = vec![
            candidate("x1", vec![1.0, 0.0], Some((2024, 1, 1))),
            candidate("x2", vec![1.0, 0.01], Some((2024, 1, 1))),
            candidate("y1", vec![0.0, 1.0], Some((2024, 1, 1))),
        ];
        let ids: Vec<_> = select_diverse(&candidates, 2)
            .into_iter()
            .map(|c| c.item_id)
            .collect();
        assert_eq!(ids, vec!["x1", "y1"]);
    }
}
