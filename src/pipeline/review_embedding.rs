use serde_json::json;

use super::artifacts::{Artifact, PlaceId};
use super::context::PipelineContext;
use super::report::{ItemFailure, Stage, StageReport};
use crate::errors::PipelineError;
use crate::reviews::Review;
use crate::semantic::store::{ReviewEmbedder, ReviewEmbeddingTable};

/// Reviews branch: embeds review texts into `review_embeddings.json`.
///
/// Batches are checkpointed; the table is marked complete once every review
/// with text was attempted.
pub fn embed_reviews(ctx: &PipelineContext, place: &PlaceId) -> Result<StageReport, PipelineError> {
    let artifacts = ctx.artifacts(place);
    let mut table: ReviewEmbeddingTable = artifacts
        .read_json_opt(&Artifact::ReviewEmbeddings)?
        .unwrap_or_default();
    let dim = ctx.config().calibration.text_embed_dim;
    if table.is_complete(dim) {
        return Ok(StageReport::skipped(Stage::ReviewEmbedding, place));
    }

    let reviews: Vec<Review> = artifacts.read_json(&Artifact::Reviews)?;
    let calibration = &ctx.config().calibration;
    let embedder = ReviewEmbedder {
        oracle: ctx.text_embedder(),
        retry: ctx.retry().clone(),
        batch_size: calibration.document_batch_size,
        text_limit: calibration.review_text_limit,
    };
    let report = embedder.embed_missing(&mut table, &reviews, dim, |table| {
        artifacts.write_json(&Artifact::ReviewEmbeddings, table)
    })?;

    table.complete = true;
    artifacts.write_json(&Artifact::ReviewEmbeddings, &table)?;

    let failures = report
        .failed
        .iter()
        .map(|(review_id, message)| ItemFailure {
            item_id: review_id.clone(),
            kind: "transient_external".to_string(),
            message: message.clone(),
        })
        .collect();

    Ok(StageReport::completed(Stage::ReviewEmbedding, place, report.embedded)
        .with_failures(failures)
        .with_details(json!({
            "with_text": report.requested,
            "already_embedded": report.skipped,
        }))
        .log())
}
