//! Menu branch: review photos to a structured menu.
//!
//! Each step checks its own artifact, so a branch interrupted halfway resumes
//! at the first missing one.

use std::collections::HashMap;

use serde_json::json;

use super::artifacts::{Artifact, PlaceArtifacts, PlaceId};
use super::context::PipelineContext;
use super::report::{ItemFailure, Stage, StageReport};
use crate::errors::PipelineError;
use crate::menu::{MenuExtraction, MenuMetadata};
use crate::oracle::{extract_record, Media};
use crate::prompts::{board_caption, MENU_READ_PROMPT};
use crate::reviews::Review;
use crate::semantic::concepts::ConceptPurpose;
use crate::semantic::diversity::select_diverse;
use crate::semantic::food::FoodFilter;
use crate::semantic::retriever::{retrieve, CandidateResult, Retrieval, RetrievalParams};
use crate::semantic::store::{
    collect_images, vector_column, EmbeddingTable, ImageEmbedder, LIKELY_FOOD,
};

fn load_table(artifacts: &PlaceArtifacts) -> Result<EmbeddingTable, PipelineError> {
    Ok(artifacts
        .read_json_opt(&Artifact::ImageEmbeddings)?
        .unwrap_or_default())
}

/// Whether every photo went through an embedding pass of dimension `dim`.
pub fn images_embedded(table: &EmbeddingTable, dim: usize) -> bool {
    table.labels.contains(&vector_column(dim))
}

/// Embeds review photos into `image_embeddings.json`, checkpointing as it goes.
pub fn embed_images(ctx: &PipelineContext, place: &PlaceId) -> Result<StageReport, PipelineError> {
    let artifacts = ctx.artifacts(place);
    let dim = ctx.config().retrieval.embed_dim;

    let mut table = load_table(&artifacts)?;
    if images_embedded(&table, dim) {
        return Ok(StageReport::skipped(Stage::ImageEmbedding, place));
    }

    let reviews: Vec<Review> = artifacts.read_json(&Artifact::Reviews)?;
    let images = collect_images(&reviews, ctx.config().retrieval.max_side);

    let embedder = ImageEmbedder {
        oracle: ctx.image_embedder(),
        fetcher: ctx.fetcher(),
        retry: ctx.retry().clone(),
        workers: ctx.config().workers.embedding,
        checkpoint_every: ctx.config().pipeline.checkpoint_every,
    };
    let report = embedder.embed_missing(&mut table, &images, dim, |table| {
        artifacts.write_json(&Artifact::ImageEmbeddings, table)
    })?;

    table.labels.insert(vector_column(dim));
    artifacts.write_json(&Artifact::ImageEmbeddings, &table)?;

    let failures = report
        .failed
        .iter()
        .map(|(url, message)| ItemFailure {
            item_id: url.clone(),
            kind: "transient_external".to_string(),
            message: message.clone(),
        })
        .collect();

    Ok(StageReport::completed(Stage::ImageEmbedding, place, report.embedded)
        .with_failures(failures)
        .with_details(json!({
            "photos": report.requested,
            "already_embedded": report.skipped,
        }))
        .log())
}

/// Ranks embedded photos against the menu concept into
/// `menuboard_candidates.json`.
///
/// The candidates are written even when empty; the place is then rejected.
pub fn retrieve_boards(ctx: &PipelineContext, place: &PlaceId) -> Result<StageReport, PipelineError> {
    let artifacts = ctx.artifacts(place);
    if artifacts.exists(&Artifact::MenuboardCandidates) {
        return Ok(StageReport::skipped(Stage::BoardRetrieval, place));
    }

    let dim = ctx.config().retrieval.embed_dim;
    let table: EmbeddingTable = artifacts.read_json(&Artifact::ImageEmbeddings)?;
    let pool = table.items(dim);
    let query = ctx.concepts().query(ConceptPurpose::IsMenu, dim)?;

    let params = RetrievalParams::from_config(&ctx.config().retrieval);
    let retrieval = retrieve(&pool, &query.vector, &params);
    artifacts.write_json(&Artifact::MenuboardCandidates, &retrieval)?;

    if retrieval.candidates.is_empty() {
        return Err(no_boards(place, pool.len()));
    }

    Ok(
        StageReport::completed(Stage::BoardRetrieval, place, retrieval.candidates.len())
            .with_details(json!({
                "pool": pool.len(),
                "relaxations": retrieval.relaxations,
                "cutoff": retrieval.cutoff,
            }))
            .log(),
    )
}

fn no_boards(place: &PlaceId, pool: usize) -> PipelineError {
    PipelineError::insufficient(
        place.as_str(),
        format!("no menu board candidates among {pool} embedded photos"),
    )
}

/// Tags embedded photos as likely food or not.
pub fn label_food(ctx: &PipelineContext, place: &PlaceId) -> Result<StageReport, PipelineError> {
    let artifacts = ctx.artifacts(place);
    let mut table: EmbeddingTable = artifacts.read_json(&Artifact::ImageEmbeddings)?;
    if table.labels.contains(LIKELY_FOOD) {
        return Ok(StageReport::skipped(Stage::FoodLabeling, place));
    }

    let dim = ctx.config().retrieval.embed_dim;
    let queries = ctx.concepts().queries(dim)?;
    let tagged = FoodFilter::new(ctx.config().food_filter.clone()).label_table(&mut table, dim, &queries);
    artifacts.write_json(&Artifact::ImageEmbeddings, &table)?;

    Ok(StageReport::completed(Stage::FoodLabeling, place, tagged).log())
}

/// Candidates as persisted, with their vectors re-attached from the table.
fn load_candidates(
    artifacts: &PlaceArtifacts,
    dim: usize,
) -> Result<Vec<CandidateResult>, PipelineError> {
    let retrieval: Retrieval = artifacts.read_json(&Artifact::MenuboardCandidates)?;
    let table: EmbeddingTable = artifacts.read_json(&Artifact::ImageEmbeddings)?;
    let vectors: HashMap<String, Vec<f32>> = table
        .items(dim)
        .into_iter()
        .map(|item| (item.id, item.vector))
        .collect();

    Ok(retrieval
        .candidates
        .into_iter()
        .filter_map(|mut candidate| {
            let vector = vectors.get(&candidate.item_id)?;
            candidate.vector = vector.clone();
            Some(candidate)
        })
        .collect())
}

/// Reads a diverse set of board photos into `menus.json`.
pub fn extract_menu(ctx: &PipelineContext, place: &PlaceId) -> Result<StageReport, PipelineError> {
    let artifacts = ctx.artifacts(place);
    if artifacts.exists(&Artifact::Menus) {
        return Ok(StageReport::skipped(Stage::MenuExtraction, place));
    }

    let retrieval = &ctx.config().retrieval;
    let candidates = load_candidates(&artifacts, retrieval.embed_dim)?;
    if candidates.is_empty() {
        return Err(no_boards(place, 0));
    }

    let boards = select_diverse(&candidates, retrieval.n_clusters);
    log::info!(
        "place={place} selected {} of {} board candidates",
        boards.len(),
        candidates.len()
    );

    let mut media = vec![];
    let mut failures = vec![];
    for board in &boards {
        let label = format!("download board {}", board.item_id);
        match ctx.retry().run(&label, || ctx.fetcher().fetch(&board.item_id)) {
            Ok(photo) => {
                let date = board.published_date.map(|d| d.to_string());
                media.push(photo.with_caption(board_caption(media.len(), date.as_deref())));
            }
            Err(err) => {
                log::warn!("place={place} board={} outcome=download_failed error={err}", board.item_id);
                failures.push(ItemFailure::new(
                    board.item_id.clone(),
                    &PipelineError::from_oracle(&board.item_id, err),
                ));
            }
        }
    }

    if media.is_empty() {
        return Err(PipelineError::TransientExternal(format!(
            "none of {} menu board photos could be downloaded",
            boards.len()
        )));
    }

    let extraction = read_boards(ctx, place, &media)?;
    let menu = MenuMetadata::from_items(extraction.items);
    if menu.is_empty() {
        return Err(PipelineError::insufficient(
            place.as_str(),
            "no menu items could be read from the menu boards",
        ));
    }
    artifacts.write_json(&Artifact::Menus, &menu)?;

    Ok(StageReport::completed(Stage::MenuExtraction, place, menu.len())
        .with_failures(failures)
        .with_details(json!({ "boards": media.len() }))
        .log())
}

fn read_boards(
    ctx: &PipelineContext,
    place: &PlaceId,
    media: &[Media],
) -> Result<MenuExtraction, PipelineError> {
    let label = format!("read menu boards {place}");
    extract_record::<MenuExtraction>(ctx.extractor(), media, MENU_READ_PROMPT, ctx.retry(), &label)
        .map_err(|err| PipelineError::from_oracle(place.as_str(), err))
}

/// The whole menu branch, stopping at the first failing step.
pub fn run_menu_branch(ctx: &PipelineContext, place: &PlaceId) -> Result<Vec<StageReport>, PipelineError> {
    Ok(vec![
        embed_images(ctx, place)?,
        retrieve_boards(ctx, place)?,
        label_food(ctx, place)?,
        extract_menu(ctx, place)?,
    ])
}
