//! Artifact storage.
//!
//! Artifacts are addressed by relative, `/`-separated keys
//! (e.g. `places/<place_id>/menus.json`). Writes are atomic: data goes to a
//! temp file in the destination directory, is fsynced, then renamed over the
//! target, so readers never observe a partially written artifact.

use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use crate::eid::Eid;

pub trait ArtifactStore: Send + Sync {
    fn exists(&self, key: &str) -> bool;
    fn read(&self, key: &str) -> io::Result<Vec<u8>>;
    fn write_atomic(&self, key: &str, data: &[u8]) -> io::Result<()>;
    /// Keys of the files directly under `prefix`, sorted.
    fn list(&self, prefix: &str) -> Vec<String>;
}

#[derive(Clone, Debug)]
pub struct BackendLocal {
    pub base_dir: PathBuf,
}

impl BackendLocal {
    pub fn new(base_dir: impl AsRef<Path>) -> io::Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(BackendLocal { base_dir })
    }

    fn resolve(&self, key: &str) -> io::Result<PathBuf> {
        let relative = Path::new(key);
        let is_clean = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));

        if !is_clean {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid artifact key: {key:?}"),
            ));
        }

        Ok(self.base_dir.join(relative))
    }
}

impl ArtifactStore for BackendLocal {
    fn exists(&self, key: &str) -> bool {
        self.resolve(key)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    fn read(&self, key: &str) -> io::Result<Vec<u8>> {
        std::fs::read(self.resolve(key)?)
    }

    fn write_atomic(&self, key: &str, data: &[u8]) -> io::Result<()> {
        let path = self.resolve(key)?;
        let dir = path
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "artifact has no parent"))?;
        std::fs::create_dir_all(dir)?;

        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("artifact");
        let temp_path = dir.join(format!(".{}-{file_name}.tmp", Eid::new()));

        let result = (|| {
            let mut file = std::fs::File::create(&temp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
            std::fs::rename(&temp_path, &path)
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
        }

        result
    }

    fn list(&self, prefix: &str) -> Vec<String> {
        let Ok(dir) = self.resolve(prefix) else {
            return vec![];
        };
        let prefix = prefix.trim_end_matches('/');

        let mut keys: Vec<String> = std::fs::read_dir(&dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter_map(|entry| {
                        let path = entry.path();
                        if !path.is_file() {
                            return None;
                        }
                        let name = path.file_name()?.to_str()?;
                        if name.starts_with('.') {
                            return None;
                        }
                        Some(format!("{prefix}/{name}"))
                    })
                    .collect()
            })
            .unwrap_or_default();

        keys.sort();
        keys
    }
}
