//! Tagging of review photos that most likely show food.

use super::concepts::{ConceptPurpose, ConceptQuery};
use super::store::{EmbeddingTable, LIKELY_FOOD};
use super::vector::cosine_similarity;
use crate::config::FoodFilterConfig;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ConceptScores {
    pub menu: f32,
    pub interior: f32,
    pub exterior: f32,
    pub food: f32,
}

impl ConceptScores {
    pub fn of(vector: &[f32], queries: &[ConceptQuery]) -> Self {
        let mut scores = Self::default();
        for query in queries {
            let score = cosine_similarity(vector, &query.vector);
            match query.purpose {
                ConceptPurpose::IsMenu => scores.menu = score,
                ConceptPurpose::IsInterior => scores.interior = score,
                ConceptPurpose::IsExterior => scores.exterior = score,
                ConceptPurpose::IsFood => scores.food = score,
            }
        }
        scores
    }
}

#[derive(Clone, Debug)]
pub struct FoodFilter {
    config: FoodFilterConfig,
}

impl FoodFilter {
    pub fn new(config: FoodFilterConfig) -> Self {
        Self { config }
    }

    /// A photo is likely food when it resembles none of the scene concepts,
    /// or when it resembles food clearly and not much less than a menu.
    pub fn is_likely_food(&self, scores: &ConceptScores) -> bool {
        let c = &self.config;
        let not_a_scene = scores.menu < c.scene_threshold
            && scores.exterior < c.scene_threshold
            && scores.interior < c.scene_threshold;
        let clearly_food =
            scores.food > c.food_threshold && scores.food > scores.menu - c.food_margin;

        not_a_scene || clearly_food
    }

    /// Tags every row with a `dim` vector and marks the pass as applied.
    /// Returns how many rows were tagged.
    pub fn label_table(&self, table: &mut EmbeddingTable, dim: usize, queries: &[ConceptQuery]) -> usize {
        let decisions: Vec<(String, bool)> = table
            .items(dim)
            .iter()
            .map(|item| {
                let scores = ConceptScores::of(&item.vector, queries);
                (item.id.clone(), self.is_likely_food(&scores))
            })
            .collect();

        let tagged = decisions.iter().filter(|(_, on)| *on).count();
        for (image_url, on) in decisions {
            table.set_tag(&image_url, LIKELY_FOOD, on);
        }
        table.labels.insert(LIKELY_FOOD.to_string());

        log::info!("tagged {tagged} of {} photos as {LIKELY_FOOD}", table.rows.len());
        tagged
    }
}
