//! Immutable run snapshot storage with an atomically swapped `CURRENT` pointer.
//!
//! Layout under the warehouse root:
//!
//! ```text
//! snapshots/<run_id>/<file>
//! CURRENT            # run id of the latest published snapshot
//! ```

use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "medwh-storage";
pub const CURRENT_POINTER: &str = "CURRENT";
pub const SNAPSHOTS_DIR: &str = "snapshots";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path} already exists with different content")]
    Conflict { path: PathBuf },
    #[error("invalid run id {0:?}")]
    InvalidRunId(String),
    #[error("invalid snapshot file name {0:?}")]
    InvalidFileName(String),
    #[error("snapshot {0} does not exist")]
    MissingSnapshot(String),
}

fn io_err<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> StoreError + 'a {
    move |source| StoreError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredFile {
    pub name: String,
    pub sha256: String,
    pub bytes: usize,
    #[serde(skip)]
    pub absolute_path: PathBuf,
    #[serde(skip)]
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn snapshot_dir(&self, run_id: &str) -> Result<PathBuf, StoreError> {
        validate_run_id(run_id)?;
        Ok(self.root.join(SNAPSHOTS_DIR).join(run_id))
    }

    /// Write one file of a snapshot via temp file + rename. Rewriting identical bytes is a
    /// no-op; different bytes under an existing name are refused.
    pub async fn store_bytes(
        &self,
        run_id: &str,
        name: &str,
        bytes: &[u8],
    ) -> Result<StoredFile, StoreError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(StoreError::InvalidFileName(name.to_string()));
        }
        let dir = self.snapshot_dir(run_id)?;
        let absolute_path = dir.join(name);
        let sha256 = Self::sha256_hex(bytes);
        let stored = |deduplicated| StoredFile {
            name: name.to_string(),
            sha256: sha256.clone(),
            bytes: bytes.len(),
            absolute_path: absolute_path.clone(),
            deduplicated,
        };

        fs::create_dir_all(&dir)
            .await
            .map_err(io_err("creating snapshot directory", &dir))?;

        if fs::try_exists(&absolute_path)
            .await
            .map_err(io_err("checking snapshot file", &absolute_path))?
        {
            let existing = fs::read(&absolute_path)
                .await
                .map_err(io_err("reading snapshot file", &absolute_path))?;
            if Self::sha256_hex(&existing) == sha256 {
                debug!(path = %absolute_path.display(), "snapshot file unchanged");
                return Ok(stored(true));
            }
            return Err(StoreError::Conflict {
                path: absolute_path.clone(),
            });
        }

        write_atomically(&dir, &absolute_path, bytes, false).await?;
        Ok(stored(false))
    }

    pub async fn read_bytes(&self, run_id: &str, name: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.snapshot_dir(run_id)?.join(name);
        fs::read(&path)
            .await
            .map_err(io_err("reading snapshot file", &path))
    }

    /// Point `CURRENT` at `run_id`. Readers see either the previous or the new run id.
    pub async fn publish(&self, run_id: &str) -> Result<(), StoreError> {
        let dir = self.snapshot_dir(run_id)?;
        if !fs::try_exists(&dir)
            .await
            .map_err(io_err("checking snapshot directory", &dir))?
        {
            return Err(StoreError::MissingSnapshot(run_id.to_string()));
        }
        let pointer = self.root.join(CURRENT_POINTER);
        write_atomically(&self.root, &pointer, format!("{run_id}\n").as_bytes(), true).await?;
        info!(run_id, "published snapshot");
        Ok(())
    }

    pub async fn current(&self) -> Result<Option<String>, StoreError> {
        let pointer = self.root.join(CURRENT_POINTER);
        match fs::read_to_string(&pointer).await {
            Ok(text) => Ok(Some(text.trim().to_string()).filter(|id| !id.is_empty())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                action: "reading current pointer",
                path: pointer,
                source,
            }),
        }
    }

    /// Run ids with a snapshot directory, oldest first.
    pub async fn list_runs(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.root.join(SNAPSHOTS_DIR);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    action: "listing snapshots",
                    path: dir,
                    source,
                })
            }
        };
        let mut runs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_err("listing snapshots", &dir))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map_err(io_err("inspecting snapshot entry", &dir))?
                .is_dir();
            if is_dir {
                if let Some(name) = entry.file_name().to_str() {
                    runs.push(name.to_string());
                }
            }
        }
        runs.sort();
        Ok(runs)
    }
}

fn validate_run_id(run_id: &str) -> Result<(), StoreError> {
    let ok = !run_id.is_empty()
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidRunId(run_id.to_string()))
    }
}

async fn write_atomically(
    dir: &Path,
    target: &Path,
    bytes: &[u8],
    replace: bool,
) -> Result<(), StoreError> {
    fs::create_dir_all(dir)
        .await
        .map_err(io_err("creating directory", dir))?;
    let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err("opening temp file", &temp_path))?;
    file.write_all(bytes)
        .await
        .map_err(io_err("writing temp file", &temp_path))?;
    file.sync_all()
        .await
        .map_err(io_err("syncing temp file", &temp_path))?;
    drop(file);

    if !replace
        && fs::try_exists(target)
            .await
            .map_err(io_err("checking target", target))?
    {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::Conflict {
            path: target.to_path_buf(),
        });
    }

    if let Err(source) = fs::rename(&temp_path, target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::Io {
            action: "renaming temp file",
            path: target.to_path_buf(),
            source,
        });
    }
    Ok(())
}
