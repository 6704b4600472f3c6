//! Structured stage outcomes returned by every entry point.

use serde::Serialize;
use serde_json::Value;

use super::artifacts::PlaceId;
use crate::errors::PipelineError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scrape,
    ImageEmbedding,
    BoardRetrieval,
    FoodLabeling,
    MenuExtraction,
    ReviewEmbedding,
    Matching,
    Overview,
    Collage,
    Generate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    /// Artifact already present, nothing was called
    Skipped,
    /// Completed with some items failed
    Partial,
}

#[derive(Clone, Debug, PartialEq, Serialize, serde::Deserialize)]
pub struct ItemFailure {
    pub item_id: String,
    pub kind: String,
    pub message: String,
}

impl ItemFailure {
    pub fn new(item_id: impl Into<String>, err: &PipelineError) -> Self {
        Self {
            item_id: item_id.into(),
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub place: PlaceId,
    pub status: StageStatus,
    /// Items produced by this invocation
    pub produced: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ItemFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl StageReport {
    pub fn skipped(stage: Stage, place: &PlaceId) -> Self {
        log::info!("place={place} stage={stage:?} outcome=skipped");
        Self {
            stage,
            place: place.clone(),
            status: StageStatus::Skipped,
            produced: 0,
            failures: vec![],
            details: None,
        }
    }

    pub fn completed(stage: Stage, place: &PlaceId, produced: usize) -> Self {
        Self {
            stage,
            place: place.clone(),
            status: StageStatus::Completed,
            produced,
            failures: vec![],
            details: None,
        }
    }

    pub fn with_failures(mut self, failures: Vec<ItemFailure>) -> Self {
        if !failures.is_empty() {
            self.status = StageStatus::Partial;
        }
        self.failures = failures;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_skipped(&self) -> bool {
        self.status == StageStatus::Skipped
    }

    pub fn log(self) -> Self {
        log::info!(
            "place={} stage={:?} outcome={:?} produced={} failed={}",
            self.place,
            self.stage,
            self.status,
            self.produced,
            self.failures.len()
        );
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_make_report_partial() {
        let place: PlaceId = "p1".parse().unwrap();
        let report = StageReport::completed(Stage::Collage, &place, 2).with_failures(vec![
            ItemFailure::new("4", &PipelineError::schema("4", "missing appearance")),
        ]);

        assert_eq!(report.status, StageStatus::Partial);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["stage"], "collage");
        assert_eq!(json["status"], "partial");
        assert_eq!(json["failures"][0]["item_id"], "4");
        assert_eq!(json["failures"][0]["kind"], "schema_violation");
        assert!(json.get("details").is_none());
    }
}
