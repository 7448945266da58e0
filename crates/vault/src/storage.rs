//! Write-through persistence for the in-process repositories.
//!
//! [`StateCell`] holds a repository's state behind an async `RwLock`. When it
//! was opened on a file, every mutation is applied to a copy of the state, the
//! copy is written to `<path>.tmp` and renamed over `<path>`, and only then
//! does the copy replace the live state. A failed write leaves both the file
//! and the in-memory state as they were.
//!
//! The write happens under the write lock, so the file always reflects the
//! latest committed mutation.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::info;

/// Failures of the storage layer underneath a repository.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode state for {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The file exists but does not parse. Never silently replaced.
    #[error("stored state in {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Repository state, optionally mirrored to a JSON file.
pub struct StateCell<T> {
    state: RwLock<T>,
    path: Option<PathBuf>,
}

impl<T> StateCell<T>
where
    T: Clone + Default + Serialize + DeserializeOwned + Send + Sync,
{
    /// State that lives only as long as the process.
    pub fn memory() -> Self {
        Self {
            state: RwLock::new(T::default()),
            path: None,
        }
    }

    /// Load state from `path`, starting empty if the file does not exist yet.
    ///
    /// # Errors
    ///
    /// [`StorageError::Read`] if the file cannot be read and
    /// [`StorageError::Corrupt`] if it does not parse.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|source| StorageError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no stored state yet; starting empty");
                T::default()
            }
            Err(source) => return Err(StorageError::Read { path, source }),
        };
        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, T> {
        self.state.read().await
    }

    /// Apply `op` and persist the result.
    ///
    /// A failed write leaves the state unchanged. Without a file `op` works on
    /// the live state, so it must validate before it mutates.
    pub async fn mutate<R, E>(&self, op: impl FnOnce(&mut T) -> Result<R, E>) -> Result<R, E>
    where
        E: From<StorageError>,
    {
        let mut state = self.state.write().await;
        let Some(path) = &self.path else {
            return op(&mut state);
        };
        let mut draft = state.clone();
        let out = op(&mut draft)?;
        persist(path, &draft).await?;
        *state = draft;
        Ok(out)
    }
}

async fn persist<T: Serialize>(path: &Path, state: &T) -> Result<(), StorageError> {
    let write_err = |source| StorageError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    let payload = serde_json::to_vec(state).map_err(|source| StorageError::Encode {
        path: path.to_path_buf(),
        source,
    })?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, payload).await.map_err(write_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(write_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    type Counts = BTreeMap<String, u32>;

    fn bump(name: &str) -> impl FnOnce(&mut Counts) -> Result<u32, StorageError> + '_ {
        move |state| {
            let n = state.entry(name.to_owned()).or_default();
            *n += 1;
            Ok(*n)
        }
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("counts.json");

        let cell = StateCell::<Counts>::open(&path).await.unwrap();
        cell.mutate(bump("a")).await.unwrap();
        cell.mutate(bump("a")).await.unwrap();
        drop(cell);

        let reopened = StateCell::<Counts>::open(&path).await.unwrap();
        assert_eq!(reopened.read().await.get("a"), Some(&2));
        assert!(!dir.path().join("nested").join("counts.json.tmp").exists());
    }

    #[tokio::test]
    async fn failed_mutation_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counts.json");
        let cell = StateCell::<Counts>::open(&path).await.unwrap();
        cell.mutate(bump("a")).await.unwrap();

        let err = cell
            .mutate(|state: &mut Counts| {
                state.insert("b".into(), 9);
                Err::<(), _>(StorageError::Corrupt {
                    path: PathBuf::from("x"),
                    source: serde_json::from_str::<u8>("nope").unwrap_err(),
                })
            })
            .await;
        assert!(err.is_err());
        assert_eq!(cell.read().await.get("b"), None);

        let reopened = StateCell::<Counts>::open(&path).await.unwrap();
        assert_eq!(reopened.read().await.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_file_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counts.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            StateCell::<Counts>::open(&path).await,
            Err(StorageError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn memory_cell_has_no_file() {
        let cell = StateCell::<Counts>::memory();
        assert_eq!(cell.mutate(bump("a")).await.unwrap(), 1);
        assert!(cell.path().is_none());
    }
}
