use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::archive::{self, ArchiveError};

pub const ZIP_KINDS: &[&str] = &["application/zip", "application/x-zip-compressed"];
pub const FOLDER_KIND: &str = "application/vnd.google-apps.folder";

/// One remote object, as listed by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub size: Option<u64>,
    pub parents: Vec<String>,
    pub modified: DateTime<Utc>,
}

impl BackupRecord {
    pub fn is_zip(&self) -> bool {
        ZIP_KINDS.contains(&self.kind.as_str())
    }

    pub fn is_folder(&self) -> bool {
        self.kind == FOLDER_KIND
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{operation} returned {status}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// The five remote operations backups rely on.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list(&self) -> Result<Vec<BackupRecord>, StoreError>;
    async fn download(&self, id: &str) -> Result<Vec<u8>, StoreError>;
    async fn upload(&self, name: &str, parent_id: &str, bytes: Vec<u8>) -> Result<String, StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
    async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<String, StoreError>;
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no remote save named {name} found")]
    NoSaveFound { name: String },
    #[error("remote store: {0}")]
    Store(#[from] StoreError),
    #[error("archive: {0}")]
    Archive(#[from] ArchiveError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// The new save is uploaded but the eldest one could not be removed.
    #[error("uploaded {uploaded} but failed to delete eldest backup {eldest}: {source}")]
    Partial {
        uploaded: String,
        eldest: String,
        #[source]
        source: StoreError,
    },
}

/// Newest zip archive named `name`.
pub fn latest_save<'a>(records: &'a [BackupRecord], name: &str) -> Option<&'a BackupRecord> {
    records
        .iter()
        .filter(|r| r.name == name && r.is_zip())
        .max_by_key(|r| r.modified)
}

/// Oldest save folder named `name`.
pub fn eldest_folder<'a>(records: &'a [BackupRecord], name: &str) -> Option<&'a BackupRecord> {
    records
        .iter()
        .filter(|r| r.name == name && r.is_folder())
        .min_by_key(|r| r.modified)
}

pub struct BackupSynchronizer {
    store: Arc<dyn ObjectStore>,
    archive_name: String,
    folder_name: String,
    scratch_dir: PathBuf,
}

impl BackupSynchronizer {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        archive_name: impl Into<String>,
        folder_name: impl Into<String>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            archive_name: archive_name.into(),
            folder_name: folder_name.into(),
            scratch_dir: scratch_dir.into(),
        }
    }

    fn scratch_archive(&self) -> PathBuf {
        self.scratch_dir.join(&self.archive_name)
    }

    /// Downloads the newest save and extracts it over `destination`, after
    /// removing `stale` (the local copies of whatever the archive holds).
    pub async fn restore(
        &self,
        destination: &Path,
        stale: &[PathBuf],
    ) -> Result<BackupRecord, SyncError> {
        info!("listing remote saves");
        let records = self.store.list().await?;
        let latest = latest_save(&records, &self.archive_name)
            .cloned()
            .ok_or_else(|| SyncError::NoSaveFound {
                name: self.archive_name.clone(),
            })?;
        info!(
            id = %latest.id,
            modified = %latest.modified,
            size = ?latest.size,
            parents = ?latest.parents,
            "downloading latest save"
        );

        let bytes = self.store.download(&latest.id).await?;
        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let tmp = self.scratch_archive();
        tokio::fs::write(&tmp, &bytes).await?;

        let dest = destination.to_path_buf();
        let stale = stale.to_vec();
        let zip_path = tmp.clone();
        let extracted = tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>, ArchiveError> {
            // The local world stays untouched unless the download is a readable archive.
            archive::check_zip(&zip_path)?;
            archive::remove_paths(&stale);
            archive::extract_zip(&zip_path, &dest)
        })
        .await
        .map_err(std::io::Error::other)?;

        if let Err(e) = tokio::fs::remove_file(&tmp).await {
            warn!(path = %tmp.display(), error = %e, "failed to remove downloaded archive");
        }
        let roots = extracted?;
        info!(entries = roots.len(), dest = %destination.display(), "save restored");
        Ok(latest)
    }

    /// Uploads `sources` as a new save, then rotates out the eldest existing
    /// save folder. Upload happens first so a failed upload never costs an
    /// existing backup; a failed delete afterwards is reported as `Partial`.
    pub async fn backup(&self, sources: &[PathBuf]) -> Result<String, SyncError> {
        info!("listing remote saves");
        let records = self.store.list().await?;
        let eldest = eldest_folder(&records, &self.folder_name).cloned();

        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let tmp = self.scratch_archive();
        let zip_path = tmp.clone();
        let sources = sources.to_vec();
        let zipped = tokio::task::spawn_blocking(move || archive::zip_paths(&sources, &zip_path))
            .await
            .map_err(std::io::Error::other)?;
        let bytes = match zipped {
            Ok(entries) => {
                info!(entries, archive = %tmp.display(), "save archived");
                tokio::fs::read(&tmp).await
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e.into());
            }
        };
        if let Err(e) = tokio::fs::remove_file(&tmp).await {
            warn!(path = %tmp.display(), error = %e, "failed to remove local archive");
        }
        let bytes = bytes?;

        let folder_id = self.store.create_folder(&self.folder_name, None).await?;
        let uploaded = match self.store.upload(&self.archive_name, &folder_id, bytes).await {
            Ok(id) => id,
            Err(e) => {
                if let Err(cleanup) = self.store.delete(&folder_id).await {
                    warn!(folder = %folder_id, error = %cleanup, "failed to remove empty save folder");
                }
                return Err(e.into());
            }
        };
        info!(id = %uploaded, folder = %folder_id, "save uploaded");

        match eldest {
            Some(eldest) => {
                if let Err(source) = self.store.delete(&eldest.id).await {
                    return Err(SyncError::Partial {
                        uploaded,
                        eldest: eldest.id,
                        source,
                    });
                }
                info!(id = %eldest.id, modified = %eldest.modified, "eldest save removed");
            }
            None => info!("no earlier save folder to rotate out"),
        }
        Ok(uploaded)
    }
}


#[cfg(test)]
mod tests {
    use std::fs;

    use super::memory::MemoryStore;
    use super::*;

    fn zip_bytes(marker: &str) -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        let world = dir.path().join("world");
        fs::create_dir_all(&world).unwrap();
        fs::write(world.join("level.dat"), marker).unwrap();
        let out = dir.path().join("save.zip");
        archive::zip_paths(&[world], &out).unwrap();
        fs::read(out).unwrap()
    }

    fn sync(store: Arc<MemoryStore>, scratch: &Path) -> BackupSynchronizer {
        BackupSynchronizer::new(store, "world_save.zip", "world", scratch)
    }

    fn record(id: &str, name: &str, kind: &str, minute: u32) -> BackupRecord {
        BackupRecord {
            id: id.to_string(),
            name: name.to_string(),
            kind: kind.to_string(),
            size: None,
            parents: Vec::new(),
            modified: MemoryStore::at(minute),
        }
    }

    #[test]
    fn latest_save_ignores_other_names_and_kinds() {
        let records = vec![
            record("a", "world_save.zip", ZIP_KINDS[0], 1),
            record("b", "world_save.zip", ZIP_KINDS[1], 3),
            record("c", "other.zip", ZIP_KINDS[0], 9),
            record("d", "world_save.zip", "text/plain", 8),
        ];
        assert_eq!(latest_save(&records, "world_save.zip").unwrap().id, "b");
    }

    #[test]
    fn eldest_folder_picks_minimum_timestamp() {
        let records = vec![
            record("f2", "world", FOLDER_KIND, 20),
            record("f1", "world", FOLDER_KIND, 10),
            record("z", "world", ZIP_KINDS[0], 1),
        ];
        assert_eq!(eldest_folder(&records, "world").unwrap().id, "f1");
        assert!(eldest_folder(&records, "nether").is_none());
    }

    #[tokio::test]
    async fn restore_downloads_the_newest_archive() {
        let store = Arc::new(MemoryStore::default());
        store.insert("old", "world_save.zip", ZIP_KINDS[0], 1, zip_bytes("old"));
        store.insert("new", "world_save.zip", ZIP_KINDS[0], 30, zip_bytes("new"));
        store.insert("mid", "world_save.zip", ZIP_KINDS[1], 15, zip_bytes("mid"));

        let dest = tempfile::tempdir().unwrap();
        fs::create_dir_all(dest.path().join("world")).unwrap();
        fs::write(dest.path().join("world/stale.dat"), b"stale").unwrap();

        let picked = sync(store, dest.path())
            .restore(dest.path(), &[dest.path().join("world")])
            .await
            .unwrap();
        assert_eq!(picked.id, "new");
        assert_eq!(fs::read_to_string(dest.path().join("world/level.dat")).unwrap(), "new");
        assert!(!dest.path().join("world/stale.dat").exists());
        assert!(!dest.path().join("world_save.zip").exists());
    }

    #[tokio::test]
    async fn restore_without_saves_is_an_error() {
        let store = Arc::new(MemoryStore::default());
        store.insert("f", "world", FOLDER_KIND, 1, Vec::new());
        let dest = tempfile::tempdir().unwrap();
        let err = sync(store, dest.path()).restore(dest.path(), &[]).await.unwrap_err();
        assert!(matches!(err, SyncError::NoSaveFound { .. }));
    }

    #[tokio::test]
    async fn corrupt_download_leaves_local_world_in_place() {
        let store = Arc::new(MemoryStore::default());
        store.insert("bad", "world_save.zip", ZIP_KINDS[0], 1, b"not a zip archive".to_vec());

        let dest = tempfile::tempdir().unwrap();
        fs::create_dir_all(dest.path().join("world")).unwrap();
        fs::write(dest.path().join("world/level.dat"), b"local").unwrap();

        let err = sync(store, dest.path())
            .restore(dest.path(), &[dest.path().join("world")])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Archive(_)));
        assert_eq!(fs::read(dest.path().join("world/level.dat")).unwrap(), b"local");
        assert!(!dest.path().join("world_save.zip").exists());
    }

    fn world_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("world")).unwrap();
        fs::write(dir.path().join("world/level.dat"), b"level").unwrap();
        dir
    }

    #[tokio::test]
    async fn backup_rotates_exactly_the_eldest_folder() {
        let store = Arc::new(MemoryStore::default());
        store.insert("f-new", "world", FOLDER_KIND, 40, Vec::new());
        store.insert("f-old", "world", FOLDER_KIND, 5, Vec::new());
        store.insert("f-mid", "world", FOLDER_KIND, 20, Vec::new());

        let server = world_dir();
        let scratch = tempfile::tempdir().unwrap();
        sync(store.clone(), scratch.path())
            .backup(&[server.path().join("world")])
            .await
            .unwrap();

        assert_eq!(*store.deleted.lock().unwrap(), vec!["f-old".to_string()]);
        let records = store.records();
        let folders: Vec<_> = records.iter().filter(|r| r.is_folder()).collect();
        assert_eq!(folders.len(), 3);
        assert_eq!(folders.iter().filter(|r| r.id.starts_with("new-")).count(), 1);
        let archive = records.iter().find(|r| r.is_zip()).unwrap();
        assert_eq!(archive.name, "world_save.zip");
        assert!(!scratch.path().join("world_save.zip").exists());
    }

    #[tokio::test]
    async fn backup_without_existing_folders_deletes_nothing() {
        let store = Arc::new(MemoryStore::default());
        let server = world_dir();
        let scratch = tempfile::tempdir().unwrap();
        sync(store.clone(), scratch.path())
            .backup(&[server.path().join("world")])
            .await
            .unwrap();
        assert!(store.deleted.lock().unwrap().is_empty());
        assert_eq!(store.records().iter().filter(|r| r.is_folder()).count(), 1);
    }

    #[tokio::test]
    async fn failed_upload_keeps_existing_backups() {
        let store = Arc::new(MemoryStore::failing(true, false));
        store.insert("f-old", "world", FOLDER_KIND, 5, Vec::new());
        let server = world_dir();
        let scratch = tempfile::tempdir().unwrap();
        let err = sync(store.clone(), scratch.path())
            .backup(&[server.path().join("world")])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));
        let ids: Vec<_> = store.records().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["f-old".to_string()]);
    }

    #[tokio::test]
    async fn failed_rotation_is_partial() {
        let store = Arc::new(MemoryStore::failing(false, true));
        store.insert("f-old", "world", FOLDER_KIND, 5, Vec::new());
        let server = world_dir();
        let scratch = tempfile::tempdir().unwrap();
        let err = sync(store.clone(), scratch.path())
            .backup(&[server.path().join("world")])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Partial { ref eldest, .. } if eldest == "f-old"));
    }
}
