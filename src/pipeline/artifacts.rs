//! Place-scoped artifact keys and typed JSON access.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;
use crate::storage::ArtifactStore;

pub const PLACES_DIR: &str = "places";

/// Identifier of a restaurant, used as a directory name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PlaceId(String);

impl PlaceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PlaceId {
    type Err = PipelineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let id = raw.trim();
        let valid = !id.is_empty()
            && id.len() <= 256
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(PipelineError::insufficient(
                raw,
                "place id must be 1-256 characters of [A-Za-z0-9_-]",
            ));
        }
        Ok(PlaceId(id.to_string()))
    }
}

impl fmt::Display for PlaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Artifact {
    /// Optional `{name}` of the place
    PlaceInfo,
    Reviews,
    ImageEmbeddings,
    MenuboardCandidates,
    Menus,
    ReviewEmbeddings,
    ReviewMatches,
    Overview,
    Collages,
    Collage(String),
    CollageSources(String),
    Generated(String),
}

impl Artifact {
    /// Key relative to the place directory.
    pub fn name(&self) -> String {
        match self {
            Artifact::PlaceInfo => "place.json".to_string(),
            Artifact::Reviews => "reviews.json".to_string(),
            Artifact::ImageEmbeddings => "image_embeddings.json".to_string(),
            Artifact::MenuboardCandidates => "menuboard_candidates.json".to_string(),
            Artifact::Menus => "menus.json".to_string(),
            Artifact::ReviewEmbeddings => "review_embeddings.json".to_string(),
            Artifact::ReviewMatches => "review_matches.json".to_string(),
            Artifact::Overview => "restaurant_overview.json".to_string(),
            Artifact::Collages => "collages.json".to_string(),
            Artifact::Collage(menu_id) => format!("collage/{menu_id}.png"),
            Artifact::CollageSources(menu_id) => format!("collage_src/{menu_id}/sources.json"),
            Artifact::Generated(menu_id) => format!("generated/{menu_id}.png"),
        }
    }

    pub fn key(&self, place: &PlaceId) -> String {
        format!("{PLACES_DIR}/{place}/{}", self.name())
    }
}

/// Typed access to one place's artifacts.
#[derive(Clone, Copy)]
pub struct PlaceArtifacts<'a> {
    pub store: &'a dyn ArtifactStore,
    pub place: &'a PlaceId,
}

impl<'a> PlaceArtifacts<'a> {
    pub fn new(store: &'a dyn ArtifactStore, place: &'a PlaceId) -> Self {
        Self { store, place }
    }

    pub fn exists(&self, artifact: &Artifact) -> bool {
        self.store.exists(&artifact.key(self.place))
    }

    /// Fails with `ResourceMissing` when absent.
    pub fn read_bytes(&self, artifact: &Artifact) -> Result<Vec<u8>, PipelineError> {
        if !self.exists(artifact) {
            return Err(PipelineError::missing(self.place.as_str(), artifact.name()));
        }
        Ok(self.store.read(&artifact.key(self.place))?)
    }

    pub fn read_json<T: DeserializeOwned>(&self, artifact: &Artifact) -> Result<T, PipelineError> {
        let data = self.read_bytes(artifact)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn read_json_opt<T: DeserializeOwned>(
        &self,
        artifact: &Artifact,
    ) -> Result<Option<T>, PipelineError> {
        if !self.exists(artifact) {
            return Ok(None);
        }
        self.read_json(artifact).map(Some)
    }

    pub fn write_bytes(&self, artifact: &Artifact, data: &[u8]) -> Result<(), PipelineError> {
        self.store.write_atomic(&artifact.key(self.place), data)?;
        Ok(())
    }

    pub fn write_json<T: Serialize + ?Sized>(
        &self,
        artifact: &Artifact,
        value: &T,
    ) -> Result<(), PipelineError> {
        let data = serde_json::to_vec_pretty(value)?;
        self.write_bytes(artifact, &data)?;
        log::debug!("place={} wrote {}", self.place, artifact.name());
        Ok(())
    }

    /// Menu ids with a generated image.
    pub fn generated_ids(&self) -> Vec<String> {
        let prefix = format!("{PLACES_DIR}/{}/generated", self.place);
        self.store
            .list(&prefix)
            .iter()
            .filter_map(|key| key.rsplit('/').next())
            .filter_map(|name| name.strip_suffix(".png"))
            .map(|id| id.to_string())
            .collect()
    }
}

/// `place.json`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaceInfo {
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BackendLocal;

    #[test]
    fn test_place_id_validation() {
        assert_eq!(
            "ChIJT2NxLBPKj4ARRivowJnL3Wg".parse::<PlaceId>().unwrap().as_str(),
            "ChIJT2NxLBPKj4ARRivowJnL3Wg"
        );
        assert!("".parse::<PlaceId>().is_err());
        assert!("../etc".parse::<PlaceId>().is_err());
        assert!("a/b".parse::<PlaceId>().is_err());
    }

    #[test]
    fn test_keys() {
        let place: PlaceId = "p1".parse().unwrap();
        assert_eq!(Artifact::Menus.key(&place), "places/p1/menus.json");
        assert_eq!(
            Artifact::CollageSources("3".into()).key(&place),
            "places/p1/collage_src/3/sources.json"
        );
    }

    #[test]
    fn test_json_roundtrip_and_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BackendLocal::new(tmp.path()).unwrap();
        let place: PlaceId = "p1".parse().unwrap();
        let artifacts = PlaceArtifacts::new(&store, &place);

        let err = artifacts.read_json::<PlaceInfo>(&Artifact::PlaceInfo).unwrap_err();
        assert_eq!(err.kind(), "resource_missing");
        assert!(artifacts
            .read_json_opt::<PlaceInfo>(&Artifact::PlaceInfo)
            .unwrap()
            .is_none());

        let info = PlaceInfo {
            name: "Pho House".into(),
        };
        artifacts.write_json(&Artifact::PlaceInfo, &info).unwrap();
        assert_eq!(artifacts.read_json::<PlaceInfo>(&Artifact::PlaceInfo).unwrap(), info);
        assert!(tmp.path().join("places/p1/place.json").is_file());
    }

    #[test]
    fn test_generated_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BackendLocal::new(tmp.path()).unwrap();
        let place: PlaceId = "p1".parse().unwrap();
        let artifacts = PlaceArtifacts::new(&store, &place);

        artifacts.write_bytes(&Artifact::Generated("2".into()), b"png").unwrap();
        artifacts.write_bytes(&Artifact::Generated("0".into()), b"png").unwrap();
        assert_eq!(artifacts.generated_ids(), vec!["0", "2"]);
    }
}
