//! Per-item photo collages built from likely-food review photos.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::artifacts::{Artifact, PlaceArtifacts, PlaceId};
use super::context::PipelineContext;
use super::fanout::run_bounded;
use super::report::{ItemFailure, Stage, StageReport};
use crate::errors::PipelineError;
use crate::images::{compose_collage, decode, encode_png};
use crate::menu::{MenuEntry, MenuMetadata};
use crate::reviews::Review;
use crate::semantic::store::{EmbeddedItem, EmbeddingTable, LIKELY_FOOD};
use crate::semantic::vector::{cosine_similarity, is_usable};
use crate::semantic::TextTask;

/// One tile of a collage, `collage_src/<id>/sources.json`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollageSource {
    /// Position in the grid, 1-based
    pub rank: usize,
    pub image_url: String,
    #[serde(default)]
    pub review_url: Option<String>,
    pub score: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollageInfo {
    pub image: String,
    pub sources: String,
    pub photos: usize,
}

/// `collages.json`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CollageIndex {
    pub collages: BTreeMap<String, CollageInfo>,
    /// Items with review evidence but no usable photo
    #[serde(default)]
    pub without_images: Vec<String>,
    #[serde(default)]
    pub failures: Vec<ItemFailure>,
}

fn collage_info(menu_id: &str, photos: usize) -> CollageInfo {
    CollageInfo {
        image: Artifact::Collage(menu_id.to_string()).name(),
        sources: Artifact::CollageSources(menu_id.to_string()).name(),
        photos,
    }
}

/// Likely-food photos of `relevant` reviews ranked by similarity to
/// `target`, at most `per_review` from any one review.
pub fn rank_photos<'a>(
    pool: &'a [EmbeddedItem],
    relevant: &HashSet<&str>,
    target: &[f32],
    per_review: usize,
) -> Vec<(&'a EmbeddedItem, f32)> {
    let mut by_review: HashMap<&str, Vec<(&EmbeddedItem, f32)>> = HashMap::new();
    for item in pool
        .iter()
        .filter(|item| item.tags.contains(LIKELY_FOOD) && relevant.contains(item.source.as_str()))
    {
        by_review
            .entry(item.source.as_str())
            .or_default()
            .push((item, cosine_similarity(&item.vector, target)));
    }

    let mut ranked: Vec<(&EmbeddedItem, f32)> = by_review
        .into_values()
        .flat_map(|mut photos| {
            photos.sort_by(|a, b| b.1.total_cmp(&a.1));
            photos.truncate(per_review);
            photos
        })
        .collect();
    // ties by url so the order does not depend on map iteration
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id)));
    ranked
}

struct CollageInputs<'a> {
    pool: Vec<EmbeddedItem>,
    review_urls: HashMap<&'a str, &'a str>,
}

/// `Ok(None)` when the item has no photo to show.
fn build_collage(
    ctx: &PipelineContext,
    artifacts: &PlaceArtifacts,
    inputs: &CollageInputs,
    menu_id: &str,
    entry: &MenuEntry,
) -> Result<Option<CollageInfo>, PipelineError> {
    let image_key = Artifact::Collage(menu_id.to_string());
    let sources_key = Artifact::CollageSources(menu_id.to_string());
    if artifacts.exists(&image_key) && artifacts.exists(&sources_key) {
        let sources: Vec<CollageSource> = artifacts.read_json(&sources_key)?;
        return Ok(Some(collage_info(menu_id, sources.len())));
    }

    let Some(summary) = entry.from_reviews.as_ref() else {
        return Ok(None);
    };
    let relevant: HashSet<&str> = summary
        .relevant_review_ids
        .iter()
        .map(|id| id.as_str())
        .collect();
    if !inputs
        .pool
        .iter()
        .any(|item| item.tags.contains(LIKELY_FOOD) && relevant.contains(item.source.as_str()))
    {
        return Ok(None);
    }

    let dim = ctx.config().retrieval.embed_dim;
    let label = format!("embed appearance of item {menu_id}");
    let texts = [summary.appearance.clone()];
    let target = ctx
        .retry()
        .run(&label, || {
            ctx.image_embedder()
                .embed_texts(&texts, dim, TextTask::RetrievalQuery)
        })?
        .into_iter()
        .next()
        .filter(|v| is_usable(v, dim))
        .ok_or_else(|| {
            PipelineError::TransientExternal(format!("{menu_id}: unusable appearance vector"))
        })?;

    let settings = &ctx.config().pipeline;
    let ranked = rank_photos(&inputs.pool, &relevant, &target, settings.max_images_per_review);

    let mut photos = vec![];
    let mut sources = vec![];
    for (item, score) in ranked {
        if photos.len() >= settings.collage_top_k {
            break;
        }
        let label = format!("download photo {}", item.id);
        let photo = match ctx.retry().run(&label, || ctx.fetcher().fetch(&item.id)) {
            Ok(media) => media,
            Err(err) => {
                log::debug!("item={menu_id} photo={} outcome=download_failed error={err}", item.id);
                continue;
            }
        };
        match decode(&photo.bytes) {
            Ok(img) => photos.push(img),
            Err(err) => {
                log::debug!("item={menu_id} photo={} outcome=undecodable error={err:?}", item.id);
                continue;
            }
        }
        sources.push(CollageSource {
            rank: sources.len() + 1,
            image_url: item.id.clone(),
            review_url: inputs.review_urls.get(item.source.as_str()).map(|u| u.to_string()),
            score,
        });
    }

    let Some(canvas) = compose_collage(&photos, settings.collage_tile_px) else {
        return Ok(None);
    };
    artifacts.write_bytes(&image_key, &encode_png(&canvas)?)?;
    artifacts.write_json(&sources_key, &sources)?;

    Ok(Some(collage_info(menu_id, sources.len())))
}

/// Builds a collage for every item with review evidence, then `collages.json`.
pub fn build_collages(ctx: &PipelineContext, place: &PlaceId) -> Result<StageReport, PipelineError> {
    let artifacts = ctx.artifacts(place);
    if artifacts.exists(&Artifact::Collages) {
        return Ok(StageReport::skipped(Stage::Collage, place));
    }
    if !artifacts.exists(&Artifact::ReviewMatches) {
        return Err(PipelineError::missing(
            place.as_str(),
            Artifact::ReviewMatches.name(),
        ));
    }

    let table: EmbeddingTable = artifacts.read_json(&Artifact::ImageEmbeddings)?;
    if !table.labels.contains(LIKELY_FOOD) {
        return Err(PipelineError::missing(
            place.as_str(),
            format!("{} ({LIKELY_FOOD} labels)", Artifact::ImageEmbeddings.name()),
        ));
    }

    let menu: MenuMetadata = artifacts.read_json(&Artifact::Menus)?;
    let reviews: Vec<Review> = artifacts.read_json(&Artifact::Reviews)?;
    let inputs = CollageInputs {
        pool: table.items(ctx.config().retrieval.embed_dim),
        review_urls: reviews
            .iter()
            .filter_map(|r| r.review_url.as_deref().map(|url| (r.id.as_str(), url)))
            .collect(),
    };

    let mut index = CollageIndex::default();
    let mut targets = vec![];
    for (menu_id, entry) in menu.ordered() {
        let has_appearance = entry
            .from_reviews
            .as_ref()
            .is_some_and(|r| !r.appearance.trim().is_empty());
        if has_appearance {
            targets.push((menu_id.to_string(), entry));
        } else if entry.from_reviews.is_some() {
            index.without_images.push(menu_id.to_string());
        }
    }

    let fan_out = run_bounded("collages", ctx.config().workers.collages, targets, |menu_id, entry| {
        build_collage(ctx, &artifacts, &inputs, menu_id, entry)
    })?;

    for (menu_id, info) in fan_out.succeeded {
        match info {
            Some(info) => {
                index.collages.insert(menu_id, info);
            }
            None => index.without_images.push(menu_id),
        }
    }
    index.failures = fan_out.failures;
    artifacts.write_json(&Artifact::Collages, &index)?;

    Ok(StageReport::completed(Stage::Collage, place, index.collages.len())
        .with_failures(index.failures.clone())
        .with_details(json!({ "without_images": index.without_images }))
        .log())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn photo(url: &str, review: &str, vector: Vec<f32>, food: bool) -> EmbeddedItem {
        EmbeddedItem {
            id: url.to_string(),
            source: review.to_string(),
            vector,
            published_date: None,
            tags: if food {
                BTreeSet::from([LIKELY_FOOD.to_string()])
            } else {
                BTreeSet::new()
            },
        }
    }

    #[test]
    fn test_rank_photos_caps_per_review_and_filters() {
        let pool = vec![
            photo("a1", "r1", vec![1.0, 0.0], true),
            photo("a2", "r1", vec![0.9, 0.1], true),
            photo("a3", "r1", vec![0.8, 0.2], true),
            photo("b1", "r2", vec![0.0, 1.0], true),
            photo("c1", "r3", vec![1.0, 0.0], true),
            photo("d1", "r1", vec![1.0, 0.0], false),
        ];
        let relevant = HashSet::from(["r1", "r2"]);

        let ranked = rank_photos(&pool, &relevant, &[1.0, 0.0], 2);
        let urls: Vec<_> = ranked.iter().map(|(item, _)| item.id.as_str()).collect();

        assert_eq!(urls, vec!["a1", "a2", "b1"]);
        assert!(ranked[0].1 > ranked[1].1);
    }
}
