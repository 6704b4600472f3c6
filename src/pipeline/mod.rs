//! Per-place stages and their orchestration.
//!
//! Every stage reads its inputs from and writes its outputs to the artifact
//! store, checks its own completion artifact first, and reports a
//! [`report::StageReport`]. Stages can be run one by one or through [`run`].

pub mod artifacts;
pub mod collage;
pub mod context;
pub mod fanout;
pub mod generate;
pub mod matching;
pub mod menu_listing;
pub mod orchestrator;
pub mod overview;
pub mod report;
pub mod review_embedding;
pub mod scrape;

pub use artifacts::PlaceId;
pub use context::{default_base_path, PipelineContext, PipelineContextBuilder};
pub use orchestrator::{run, status, with_place_lock};
