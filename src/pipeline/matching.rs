//! Review to menu item matching and per-item review summaries.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::artifacts::{Artifact, PlaceId};
use super::context::PipelineContext;
use super::fanout::run_bounded;
use super::report::{ItemFailure, Stage, StageReport};
use crate::errors::PipelineError;
use crate::menu::{MenuMetadata, MenuReviewSummary};
use crate::oracle::extract_record;
use crate::prompts::review_summary_prompt;
use crate::semantic::calibrator::{Calibration, CalibrationParams, MatchCalibrator, TextUnit};
use crate::semantic::store::ReviewEmbeddingTable;
use crate::semantic::TextTask;

/// `review_matches.json`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReviewMatches {
    #[serde(flatten)]
    pub calibration: Calibration,
    /// Items that got a review summary
    pub summarized: Vec<String>,
    #[serde(default)]
    pub failures: Vec<ItemFailure>,
}

fn summarize_item(
    ctx: &PipelineContext,
    menu: &MenuMetadata,
    texts: &HashMap<&str, &str>,
    menu_id: &str,
    review_ids: Vec<String>,
) -> Result<MenuReviewSummary, PipelineError> {
    let entry = menu
        .get(menu_id)
        .ok_or_else(|| PipelineError::schema(menu_id, "matched an unknown menu item"))?;

    let reviews: Vec<(&str, &str)> = review_ids
        .iter()
        .filter_map(|id| texts.get(id.as_str()).map(|text| (id.as_str(), *text)))
        .collect();
    let prompt = review_summary_prompt(&entry.from_menuboard, &menu.sibling_names(menu_id), &reviews);

    let label = format!("summarize reviews of item {menu_id}");
    let mut summary =
        extract_record::<MenuReviewSummary>(ctx.extractor(), &[], &prompt, ctx.retry(), &label)
            .map_err(|err| PipelineError::from_oracle(menu_id, err))?;

    // only reviews that were actually shown can be relevant
    let shown: HashSet<&str> = reviews.iter().map(|(id, _)| *id).collect();
    summary
        .relevant_review_ids
        .retain(|id| shown.contains(id.as_str()));
    Ok(summary)
}

/// Matches reviews to menu items, summarizes each matched item and rewrites
/// `menus.json`. `review_matches.json` is written last and marks completion.
pub fn match_reviews(ctx: &PipelineContext, place: &PlaceId) -> Result<StageReport, PipelineError> {
    let artifacts = ctx.artifacts(place);
    if artifacts.exists(&Artifact::ReviewMatches) {
        return Ok(StageReport::skipped(Stage::Matching, place));
    }

    let config = &ctx.config().calibration;
    let dim = config.text_embed_dim;
    // the threshold search needs every review embedded
    let embeddings: ReviewEmbeddingTable = artifacts
        .read_json_opt(&Artifact::ReviewEmbeddings)?
        .filter(|table: &ReviewEmbeddingTable| table.is_complete(dim))
        .ok_or_else(|| {
            PipelineError::missing(place.as_str(), "review_embeddings.json (complete)")
        })?;
    let mut menu: MenuMetadata = artifacts.read_json(&Artifact::Menus)?;
    let units: Vec<TextUnit> = embeddings
        .rows
        .iter()
        .map(|row| TextUnit {
            id: row.review_id.clone(),
            vector: row.vector.clone(),
        })
        .collect();

    let calibrator = MatchCalibrator::new(CalibrationParams::from_config(config));
    let mut batch_idx = 0usize;
    let calibration = calibrator.calibrate_and_label(&units, &menu.match_entities(), dim, |texts| {
        batch_idx += 1;
        let label = format!("embed item queries batch {batch_idx}");
        ctx.retry()
            .run(&label, || {
                ctx.text_embedder()
                    .embed_texts(texts, dim, TextTask::RetrievalQuery)
            })
            .map_err(PipelineError::from)
    })?;

    let texts: HashMap<&str, &str> = embeddings
        .rows
        .iter()
        .map(|row| (row.review_id.as_str(), row.text.as_str()))
        .collect();
    let targets: Vec<(String, Vec<String>)> = calibration
        .matches
        .iter()
        .filter(|m| !m.unit_ids.is_empty())
        .map(|m| (m.entity_id.clone(), m.unit_ids.clone()))
        .collect();

    let fan_out = {
        let menu = &menu;
        let texts = &texts;
        run_bounded("summaries", ctx.config().workers.summaries, targets, |menu_id, review_ids| {
            summarize_item(ctx, menu, texts, menu_id, review_ids)
        })?
    };

    let mut summaries: HashMap<String, MenuReviewSummary> = fan_out
        .succeeded
        .into_iter()
        .filter(|(_, summary)| !summary.relevant_review_ids.is_empty())
        .collect();
    let mut summarized: Vec<String> = summaries.keys().cloned().collect();
    summarized.sort_by_key(|id| (id.parse::<u64>().unwrap_or(u64::MAX), id.clone()));

    for (menu_id, entry) in menu.entries.iter_mut() {
        entry.apply_reviews(summaries.remove(menu_id));
    }
    artifacts.write_json(&Artifact::Menus, &menu)?;

    let record = ReviewMatches {
        calibration,
        summarized,
        failures: fan_out.failures,
    };
    artifacts.write_json(&Artifact::ReviewMatches, &record)?;

    Ok(StageReport::completed(Stage::Matching, place, record.summarized.len())
        .with_failures(record.failures.clone())
        .with_details(json!({
            "reviews": record.calibration.n_units,
            "threshold": record.calibration.threshold,
            "fallback_used": record.calibration.fallback_used,
        }))
        .log())
}
