use serde_json::json;

use super::artifacts::{Artifact, PlaceId, PlaceInfo};
use super::context::PipelineContext;
use super::report::{Stage, StageReport};
use crate::errors::PipelineError;
use crate::reviews::Review;

/// Fetches reviews of `place` into `reviews.json`.
///
/// Nothing is written when the source returns fewer than `min_reviews`, so a
/// rejected place can be retried later.
pub fn scrape(
    ctx: &PipelineContext,
    place: &PlaceId,
    name: Option<&str>,
) -> Result<StageReport, PipelineError> {
    let artifacts = ctx.artifacts(place);

    if let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) {
        artifacts.write_json(
            &Artifact::PlaceInfo,
            &PlaceInfo {
                name: name.to_string(),
            },
        )?;
    }

    if artifacts.exists(&Artifact::Reviews) {
        return Ok(StageReport::skipped(Stage::Scrape, place));
    }

    let settings = &ctx.config().pipeline;
    let label = format!("scrape {place}");
    let scraped = ctx
        .retry()
        .run(&label, || ctx.review_source().scrape(place.as_str(), settings.max_reviews))
        .map_err(|err| PipelineError::from_oracle(place.as_str(), err))?;

    if scraped.len() < settings.min_reviews {
        return Err(PipelineError::insufficient(
            place.as_str(),
            format!(
                "{} reviews scraped, at least {} required",
                scraped.len(),
                settings.min_reviews
            ),
        ));
    }

    let reviews = Review::from_scraped(scraped);
    let with_photos = reviews.iter().filter(|r| !r.image_urls.is_empty()).count();
    artifacts.write_json(&Artifact::Reviews, &reviews)?;

    Ok(StageReport::completed(Stage::Scrape, place, reviews.len())
        .with_details(json!({ "with_photos": with_photos }))
        .log())
}
