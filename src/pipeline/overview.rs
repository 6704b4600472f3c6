use std::collections::HashMap;

use rand::seq::IndexedRandom;
use serde_json::json;

use super::artifacts::{Artifact, PlaceId, PlaceInfo};
use super::context::PipelineContext;
use super::report::{Stage, StageReport};
use crate::errors::PipelineError;
use crate::menu::MenuMetadata;
use crate::oracle::extract_record;
use crate::overview::{prompt_name, OverviewSummary, RestaurantOverview};
use crate::prompts::{overview_prompt, OverviewItem};
use crate::reviews::Review;

/// Writes `restaurant_overview.json` from the matched menu.
pub fn write_overview(ctx: &PipelineContext, place: &PlaceId) -> Result<StageReport, PipelineError> {
    let artifacts = ctx.artifacts(place);
    if artifacts.exists(&Artifact::Overview) {
        return Ok(StageReport::skipped(Stage::Overview, place));
    }
    if !artifacts.exists(&Artifact::ReviewMatches) {
        return Err(PipelineError::missing(
            place.as_str(),
            Artifact::ReviewMatches.name(),
        ));
    }

    let menu: MenuMetadata = artifacts.read_json(&Artifact::Menus)?;
    let reviews: Vec<Review> = artifacts.read_json(&Artifact::Reviews)?;
    let texts: HashMap<&str, &str> = reviews
        .iter()
        .filter_map(|r| r.text().map(|text| (r.id.as_str(), text)))
        .collect();

    let name = artifacts
        .read_json_opt::<PlaceInfo>(&Artifact::PlaceInfo)?
        .map(|info| prompt_name(&info.name))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| place.to_string());

    let settings = &ctx.config().pipeline;
    let mut rng = rand::rng();
    let items: Vec<OverviewItem> = menu
        .ranked_by_mentions()
        .into_iter()
        .enumerate()
        .map(|(rank, (id, entry))| {
            let board = &entry.from_menuboard;
            let mut item = OverviewItem {
                id,
                name: &board.name,
                price: board.price,
                mentions: entry.mentions(),
                description: &board.description,
                objective_summary: "",
                sample_reviews: vec![],
            };
            if let Some(summary) = entry.from_reviews.as_ref().filter(|_| rank < settings.overview_top_items) {
                let relevant: Vec<&str> = summary
                    .relevant_review_ids
                    .iter()
                    .filter_map(|id| texts.get(id.as_str()).copied())
                    .collect();
                item.objective_summary = &summary.objective_summary;
                item.sample_reviews = relevant
                    .choose_multiple(&mut rng, settings.overview_sample_reviews)
                    .map(|text| text.replace('\n', " "))
                    .collect();
            }
            item
        })
        .collect();

    let prompt = overview_prompt(&name, &items);
    let label = format!("overview {place}");
    let summary =
        extract_record::<OverviewSummary>(ctx.extractor(), &[], &prompt, ctx.retry(), &label)
            .map_err(|err| PipelineError::from_oracle(place.as_str(), err))?;

    let overview = RestaurantOverview::from(summary);
    artifacts.write_json(&Artifact::Overview, &overview)?;

    Ok(StageReport::completed(Stage::Overview, place, 1)
        .with_details(json!({ "glossary_terms": overview.glossary.len() }))
        .log())
}
