use clap::{Args as ClapArgs, Parser, Subcommand};
use serde_json::Value;

use crate::errors::PipelineError;
use crate::pipeline::{
    self, collage, generate, matching, menu_listing, overview, review_embedding, scrape,
    PipelineContext, PlaceId,
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Data directory, defaults to $MENULENS_BASE_PATH or ~/.local/share/menulens
    #[clap(long, global = true)]
    pub base_path: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct PlaceArgs {
    /// Place id, e.g. a Google Maps place id
    pub place: String,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Scrape reviews of a place
    Scrape {
        #[command(flatten)]
        place: PlaceArgs,

        /// Restaurant name used in prompts
        #[clap(long)]
        name: Option<String>,
    },

    /// Embed photos, find menu boards and read the menu
    Menu {
        #[command(flatten)]
        place: PlaceArgs,
    },

    /// Embed review texts
    Reviews {
        #[command(flatten)]
        place: PlaceArgs,
    },

    /// Match reviews to menu items and summarize them
    Match {
        #[command(flatten)]
        place: PlaceArgs,
    },

    /// Write the restaurant overview
    Overview {
        #[command(flatten)]
        place: PlaceArgs,
    },

    /// Build per-item photo collages
    Collage {
        #[command(flatten)]
        place: PlaceArgs,
    },

    /// Generate dish images from collages
    Generate {
        #[command(flatten)]
        place: PlaceArgs,

        /// Only this menu item
        #[clap(long)]
        menu_id: Option<String>,
    },

    /// Run every stage that has not completed yet
    Run {
        #[command(flatten)]
        place: PlaceArgs,

        /// Restaurant name used in prompts
        #[clap(long)]
        name: Option<String>,
    },

    /// Show how far a place got
    Status {
        #[command(flatten)]
        place: PlaceArgs,
    },
}

impl Command {
    pub fn place(&self) -> &str {
        match self {
            Command::Scrape { place, .. }
            | Command::Menu { place }
            | Command::Reviews { place }
            | Command::Match { place }
            | Command::Overview { place }
            | Command::Collage { place }
            | Command::Generate { place, .. }
            | Command::Run { place, .. }
            | Command::Status { place } => &place.place,
        }
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, PipelineError> {
    Ok(serde_json::to_value(value)?)
}

/// Single stages hold the place lock like a full run does.
fn locked<T: serde::Serialize>(
    ctx: &PipelineContext,
    place: &PlaceId,
    op: impl FnOnce() -> Result<T, PipelineError>,
) -> Result<Value, PipelineError> {
    to_value(&pipeline::with_place_lock(ctx, place, op)?)
}

/// Runs `command` and returns the JSON payload to print.
pub fn execute(command: &Command, ctx: &PipelineContext) -> Result<Value, PipelineError> {
    let place: PlaceId = command.place().parse()?;
    let place = &place;

    match command {
        Command::Status { .. } => to_value(&pipeline::status(ctx, place)?),
        Command::Run { name, .. } => to_value(&pipeline::run(ctx, place, name.as_deref())?),
        Command::Scrape { name, .. } => {
            locked(ctx, place, || scrape::scrape(ctx, place, name.as_deref()))
        }
        Command::Menu { .. } => locked(ctx, place, || menu_listing::run_menu_branch(ctx, place)),
        Command::Reviews { .. } => {
            locked(ctx, place, || review_embedding::embed_reviews(ctx, place))
        }
        Command::Match { .. } => locked(ctx, place, || matching::match_reviews(ctx, place)),
        Command::Overview { .. } => locked(ctx, place, || overview::write_overview(ctx, place)),
        Command::Collage { .. } => locked(ctx, place, || collage::build_collages(ctx, place)),
        Command::Generate { menu_id, .. } => locked(ctx, place, || {
            generate::generate_images(ctx, place, menu_id.as_deref())
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_generate_with_menu_id() {
        let args = Args::try_parse_from(["menulens", "generate", "p1", "--menu-id", "3"]).unwrap();
        match args.command {
            Command::Generate { place, menu_id } => {
                assert_eq!(place.place, "p1");
                assert_eq!(menu_id.as_deref(), Some("3"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_every_command_takes_a_place() {
        for sub in ["scrape", "menu", "reviews", "match", "overview", "collage", "generate", "run", "status"] {
            let args = Args::try_parse_from(["menulens", sub, "p1"]).unwrap();
            assert_eq!(args.command.place(), "p1");
        }
        assert!(Args::try_parse_from(["menulens", "menu"]).is_err());
    }
}
