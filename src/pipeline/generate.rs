use serde_json::json;

use super::artifacts::{Artifact, PlaceArtifacts, PlaceId};
use super::collage::CollageIndex;
use super::context::PipelineContext;
use super::fanout::run_bounded;
use super::report::{Stage, StageReport};
use crate::errors::PipelineError;
use crate::images::get_dimensions;
use crate::menu::{MenuEntry, MenuMetadata};
use crate::oracle::Media;
use crate::prompts::dish_image_prompt;

/// Items to generate: `menu_id` alone, or the most mentioned ones with a
/// collage.
fn targets<'a>(
    ctx: &PipelineContext,
    place: &PlaceId,
    menu: &'a MenuMetadata,
    index: &CollageIndex,
    menu_id: Option<&str>,
) -> Result<Vec<(String, &'a MenuEntry)>, PipelineError> {
    if let Some(menu_id) = menu_id {
        let entry = menu
            .get(menu_id)
            .ok_or_else(|| PipelineError::missing(place.as_str(), format!("menu item {menu_id}")))?;
        if !index.collages.contains_key(menu_id) {
            return Err(PipelineError::missing(
                place.as_str(),
                Artifact::Collage(menu_id.to_string()).name(),
            ));
        }
        return Ok(vec![(menu_id.to_string(), entry)]);
    }

    Ok(menu
        .ranked_by_mentions()
        .into_iter()
        .filter(|(id, _)| index.collages.contains_key(*id))
        .take(ctx.config().pipeline.generate_top_n)
        .map(|(id, entry)| (id.to_string(), entry))
        .collect())
}

/// `Ok(false)` when the generator answered without an image.
fn generate_one(
    ctx: &PipelineContext,
    artifacts: &PlaceArtifacts,
    menu_id: &str,
    entry: &MenuEntry,
) -> Result<bool, PipelineError> {
    let collage = artifacts.read_bytes(&Artifact::Collage(menu_id.to_string()))?;
    let reference = Media::from_bytes(collage);

    let (appearance, ingredients): (&str, Vec<String>) = match &entry.from_reviews {
        Some(summary) => (
            summary.appearance.as_str(),
            summary.ingredients_by_category.all().cloned().collect(),
        ),
        None => ("", vec![]),
    };
    let prompt = dish_image_prompt(&entry.from_menuboard, appearance, &ingredients);

    let label = format!("generate image for item {menu_id}");
    let image = ctx
        .retry()
        .run(&label, || ctx.generator().generate(&reference, &prompt))
        .map_err(|err| PipelineError::from_oracle(menu_id, err))?;

    match image {
        Some(bytes) => {
            let (width, height) = get_dimensions(&bytes)
                .map_err(|e| PipelineError::schema(menu_id, format!("generated image: {e:#}")))?;
            log::debug!("item={menu_id} generated {width}x{height}");
            artifacts.write_bytes(&Artifact::Generated(menu_id.to_string()), &bytes)?;
            Ok(true)
        }
        None => {
            log::warn!("item={menu_id} outcome=no_image");
            Ok(false)
        }
    }
}

/// Generates a dish photo from each target's collage into `generated/<id>.png`.
pub fn generate_images(
    ctx: &PipelineContext,
    place: &PlaceId,
    menu_id: Option<&str>,
) -> Result<StageReport, PipelineError> {
    let artifacts = ctx.artifacts(place);
    let menu: MenuMetadata = artifacts.read_json(&Artifact::Menus)?;
    let index: CollageIndex = artifacts.read_json(&Artifact::Collages)?;

    let (done, pending): (Vec<_>, Vec<_>) = targets(ctx, place, &menu, &index, menu_id)?
        .into_iter()
        .partition(|(id, _)| artifacts.exists(&Artifact::Generated(id.clone())));

    if pending.is_empty() && !done.is_empty() {
        return Ok(StageReport::skipped(Stage::Generate, place));
    }

    let fan_out = run_bounded("generation", ctx.config().workers.generation, pending, |id, entry| {
        generate_one(ctx, &artifacts, id, entry)
    })?;

    let (generated, no_image): (Vec<_>, Vec<_>) =
        fan_out.succeeded.into_iter().partition(|(_, produced)| *produced);
    let generated: Vec<String> = generated.into_iter().map(|(id, _)| id).collect();
    let no_image: Vec<String> = no_image.into_iter().map(|(id, _)| id).collect();
    let already: Vec<String> = done.into_iter().map(|(id, _)| id).collect();

    Ok(StageReport::completed(Stage::Generate, place, generated.len())
        .with_failures(fan_out.failures)
        .with_details(json!({
            "generated": generated,
            "no_image": no_image,
            "already_generated": already,
        }))
        .log())
}
