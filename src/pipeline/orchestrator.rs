//! Full runs and progress derived from the artifacts on disk.

use std::collections::BTreeMap;
use std::thread::ScopedJoinHandle;

use serde::Serialize;

use super::artifacts::{Artifact, PlaceId};
use super::collage::build_collages;
use super::context::PipelineContext;
use super::generate::generate_images;
use super::matching::match_reviews;
use super::menu_listing::{images_embedded, run_menu_branch};
use super::overview::write_overview;
use super::report::{StageReport, StageStatus};
use super::review_embedding::embed_reviews;
use super::scrape::scrape;
use crate::errors::PipelineError;
use crate::semantic::store::{EmbeddingTable, ReviewEmbeddingTable, LIKELY_FOOD};

/// How far a place got. Each state implies all earlier ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(tag = "state", content = "generated", rename_all = "snake_case")]
pub enum PlaceState {
    NotStarted,
    Scraped,
    ImagesEmbedded,
    BoardsExtracted,
    ImagesLabeled,
    ReviewsEmbedded,
    MatchedAndSummarized,
    OverviewGenerated,
    CollagesBuilt,
    ImagesGenerated(usize),
}

#[derive(Clone, Debug, Serialize)]
pub struct PlaceStatus {
    pub place: PlaceId,
    pub state: PlaceState,
    /// Artifact name to presence
    pub artifacts: BTreeMap<String, bool>,
    pub generated: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub place: PlaceId,
    pub status: StageStatus,
    pub stages: Vec<StageReport>,
}

/// Current state and artifact presence of `place`. Reads only.
pub fn status(ctx: &PipelineContext, place: &PlaceId) -> Result<PlaceStatus, PipelineError> {
    let artifacts = ctx.artifacts(place);
    let dim = ctx.config().retrieval.embed_dim;

    let table: Option<EmbeddingTable> = artifacts.read_json_opt(&Artifact::ImageEmbeddings)?;
    let review_table: Option<ReviewEmbeddingTable> =
        artifacts.read_json_opt(&Artifact::ReviewEmbeddings)?;
    let generated = artifacts.generated_ids();

    let checks = [
        (PlaceState::Scraped, artifacts.exists(&Artifact::Reviews)),
        (
            PlaceState::ImagesEmbedded,
            table.as_ref().is_some_and(|t| images_embedded(t, dim)),
        ),
        (PlaceState::BoardsExtracted, artifacts.exists(&Artifact::Menus)),
        (
            PlaceState::ImagesLabeled,
            table.as_ref().is_some_and(|t| t.labels.contains(LIKELY_FOOD)),
        ),
        (
            PlaceState::ReviewsEmbedded,
            review_table
                .as_ref()
                .is_some_and(|t| t.is_complete(ctx.config().calibration.text_embed_dim)),
        ),
        (
            PlaceState::MatchedAndSummarized,
            artifacts.exists(&Artifact::ReviewMatches),
        ),
        (PlaceState::OverviewGenerated, artifacts.exists(&Artifact::Overview)),
        (PlaceState::CollagesBuilt, artifacts.exists(&Artifact::Collages)),
        (
            PlaceState::ImagesGenerated(generated.len()),
            !generated.is_empty(),
        ),
    ];

    let mut state = PlaceState::NotStarted;
    for (next, done) in checks {
        if !done {
            break;
        }
        state = next;
    }

    let artifact_names = [
        Artifact::PlaceInfo,
        Artifact::Reviews,
        Artifact::ImageEmbeddings,
        Artifact::MenuboardCandidates,
        Artifact::Menus,
        Artifact::ReviewEmbeddings,
        Artifact::ReviewMatches,
        Artifact::Overview,
        Artifact::Collages,
    ];
    let presence = artifact_names
        .iter()
        .map(|artifact| (artifact.name(), artifacts.exists(artifact)))
        .collect();

    Ok(PlaceStatus {
        place: place.clone(),
        state,
        artifacts: presence,
        generated,
    })
}

/// Runs `op` while holding the place lock.
pub fn with_place_lock<T>(
    ctx: &PipelineContext,
    place: &PlaceId,
    op: impl FnOnce() -> Result<T, PipelineError>,
) -> Result<T, PipelineError> {
    let _lock = ctx.lock_place(place)?;
    op()
}

fn join<T>(
    handle: ScopedJoinHandle<'_, Result<T, PipelineError>>,
    branch: &str,
) -> Result<T, PipelineError> {
    handle.join().unwrap_or_else(|_| {
        Err(PipelineError::Other(anyhow::anyhow!(
            "{branch} branch panicked"
        )))
    })
}

/// Takes `place` from wherever it is to generated images.
///
/// The menu and reviews branches run concurrently and both finish before
/// matching starts. Completed stages are skipped without external calls.
pub fn run(
    ctx: &PipelineContext,
    place: &PlaceId,
    name: Option<&str>,
) -> Result<RunReport, PipelineError> {
    let _span = tracing::info_span!("run", place = %place).entered();
    with_place_lock(ctx, place, || {
        log::info!("place={place} run started");
        let mut stages = vec![scrape(ctx, place, name)?];

        let (menu, reviews) = std::thread::scope(|s| {
            let menu = s.spawn(|| run_menu_branch(ctx, place));
            let reviews = s.spawn(|| embed_reviews(ctx, place));
            (join(menu, "menu"), join(reviews, "reviews"))
        });
        stages.extend(menu?);
        stages.push(reviews?);

        stages.push(match_reviews(ctx, place)?);
        stages.push(write_overview(ctx, place)?);
        stages.push(build_collages(ctx, place)?);
        stages.push(generate_images(ctx, place, None)?);

        let status = if stages.iter().any(|s| s.status == StageStatus::Partial) {
            StageStatus::Partial
        } else {
            StageStatus::Completed
        };
        log::info!(
            "place={place} run finished status={status:?} skipped_stages={}",
            stages.iter().filter(|s| s.is_skipped()).count()
        );

        Ok(RunReport {
            place: place.clone(),
            status,
            stages,
        })
    })
}
