//! Backup store for files touched by repairs
//!
//! Layout under the backup root:
//!
//! ```text
//! <id>/record.json     manifest: record + one entry per source path
//! <id>/<n>.bak         payload of the n-th source path
//! ```
//!
//! Paths that did not exist at backup time are stored as tombstones, so a
//! restore removes files the repair created.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MANIFEST: &str = "record.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub source_paths: Vec<PathBuf>,
    pub restorable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub id: String,
    pub restored: Vec<PathBuf>,
    /// Paths removed because they did not exist when the backup was taken
    pub removed: Vec<PathBuf>,
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup '{id}' not found")]
    NotFound { id: String },
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("backup '{id}' is corrupted: payload for {} does not match its hash", path.display())]
    Corrupted { id: String, path: PathBuf },
    #[error("backup manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
}

impl BackupError {
    pub fn suggestion(&self) -> String {
        match self {
            BackupError::NotFound { .. } => "List available backups with `credfix backups list`".to_string(),
            BackupError::Read { path, .. } => format!("Check that {} is readable by the current user", path.display()),
            BackupError::Write { path, .. } => format!(
                "Check free space and permissions for {}, or set `paths.backup_dir` in the settings file",
                path.display()
            ),
            BackupError::Corrupted { .. } => {
                "Do not restore this backup; pick an older one or repair the file by hand".to_string()
            }
            BackupError::Manifest(_) => "The backup directory was modified outside credfix; delete the backup".to_string(),
        }
    }
}

/// Backup collaborator of the consent flow
pub trait BackupStore: Send + Sync {
    fn create_backup(&self, paths: &[PathBuf]) -> Result<BackupRecord, BackupError>;
    fn list_backups(&self) -> Result<Vec<BackupRecord>, BackupError>;
    fn restore_backup(&self, id: &str) -> Result<RestoreOutcome, BackupError>;
    fn delete_backup(&self, id: &str) -> Result<(), BackupError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    record: BackupRecord,
    entries: Vec<Entry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    source: PathBuf,
    /// `None` is a tombstone
    payload: Option<String>,
    sha256: Option<String>,
}

/// Backups as plain directories on the local disk
#[derive(Debug, Clone)]
pub struct FileBackupStore {
    root: PathBuf,
}

impl FileBackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn backup_dir(&self, id: &str) -> Result<PathBuf, BackupError> {
        // ids are generated here; anything path-like is not one of ours
        if id.is_empty() || id.contains(|c: char| c == '/' || c == '\\') || id.contains("..") {
            return Err(BackupError::NotFound { id: id.to_string() });
        }
        Ok(self.root.join(id))
    }

    fn load_manifest(&self, id: &str) -> Result<Manifest, BackupError> {
        let path = self.backup_dir(id)?.join(MANIFEST);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackupError::NotFound { id: id.to_string() })
            }
            Err(source) => return Err(BackupError::Read { path, source }),
        };
        Ok(serde_json::from_str(&raw)?)
    }
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), BackupError> {
    let write_err = |source| BackupError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    std::fs::write(path, bytes).map_err(write_err)
}

impl BackupStore for FileBackupStore {
    fn create_backup(&self, paths: &[PathBuf]) -> Result<BackupRecord, BackupError> {
        let created_at = Utc::now();
        let id = format!(
            "{}-{}",
            created_at.format("%Y%m%dT%H%M%SZ"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let dir = self.backup_dir(&id)?;

        let mut entries = Vec::with_capacity(paths.len());
        for (index, source) in paths.iter().enumerate() {
            let bytes = match std::fs::read(source) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("Backup {}: {} does not exist, storing tombstone", id, source.display());
                    entries.push(Entry {
                        source: source.clone(),
                        payload: None,
                        sha256: None,
                    });
                    continue;
                }
                Err(source_err) => {
                    let _ = std::fs::remove_dir_all(&dir);
                    return Err(BackupError::Read {
                        path: source.clone(),
                        source: source_err,
                    });
                }
            };

            let payload = format!("{index}.bak");
            let target = dir.join(&payload);
            let hash = digest(&bytes);
            let written = write_file(&target, &bytes).and_then(|_| {
                std::fs::read(&target).map_err(|source| BackupError::Read {
                    path: target.clone(),
                    source,
                })
            });
            // Confirm the payload on disk before reporting success
            match written {
                Ok(copy) if digest(&copy) == hash => {}
                Ok(_) => {
                    let _ = std::fs::remove_dir_all(&dir);
                    return Err(BackupError::Corrupted {
                        id,
                        path: source.clone(),
                    });
                }
                Err(e) => {
                    let _ = std::fs::remove_dir_all(&dir);
                    return Err(e);
                }
            }
            entries.push(Entry {
                source: source.clone(),
                payload: Some(payload),
                sha256: Some(hash),
            });
        }

        let record = BackupRecord {
            id: id.clone(),
            created_at,
            source_paths: paths.to_vec(),
            restorable: true,
        };
        let manifest = Manifest {
            record: record.clone(),
            entries,
        };
        write_file(&dir.join(MANIFEST), serde_json::to_string_pretty(&manifest)?.as_bytes())?;

        info!("Created backup {} of {} path(s)", id, paths.len());
        Ok(record)
    }

    fn list_backups(&self) -> Result<Vec<BackupRecord>, BackupError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(BackupError::Read {
                    path: self.root.clone(),
                    source,
                })
            }
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let id = entry.file_name().to_string_lossy().to_string();
            match self.load_manifest(&id) {
                Ok(manifest) => records.push(manifest.record),
                Err(e) => warn!("Skipping unreadable backup {}: {}", id, e),
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    fn restore_backup(&self, id: &str) -> Result<RestoreOutcome, BackupError> {
        let manifest = self.load_manifest(id)?;
        let dir = self.backup_dir(id)?;

        // Verify everything before touching anything
        let mut payloads = Vec::with_capacity(manifest.entries.len());
        for entry in &manifest.entries {
            let bytes = match (&entry.payload, &entry.sha256) {
                (Some(payload), Some(expected)) => {
                    let path = dir.join(payload);
                    let bytes = std::fs::read(&path).map_err(|source| BackupError::Read { path, source })?;
                    if &digest(&bytes) != expected {
                        return Err(BackupError::Corrupted {
                            id: id.to_string(),
                            path: entry.source.clone(),
                        });
                    }
                    Some(bytes)
                }
                _ => None,
            };
            payloads.push(bytes);
        }

        let mut outcome = RestoreOutcome {
            id: id.to_string(),
            restored: Vec::new(),
            removed: Vec::new(),
        };
        for (entry, bytes) in manifest.entries.iter().zip(payloads) {
            match bytes {
                Some(bytes) => {
                    write_file(&entry.source, &bytes)?;
                    outcome.restored.push(entry.source.clone());
                }
                None => match std::fs::remove_file(&entry.source) {
                    Ok(()) => outcome.removed.push(entry.source.clone()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(source) => {
                        return Err(BackupError::Write {
                            path: entry.source.clone(),
                            source,
                        })
                    }
                },
            }
        }

        info!(
            "Restored backup {}: {} restored, {} removed",
            id,
            outcome.restored.len(),
            outcome.removed.len()
        );
        Ok(outcome)
    }

    fn delete_backup(&self, id: &str) -> Result<(), BackupError> {
        let dir = self.backup_dir(id)?;
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!("Deleted backup {}", id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BackupError::NotFound { id: id.to_string() }),
            Err(source) => Err(BackupError::Write { path: dir, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_and_restore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBackupStore::new(dir.path().join("backups"));
        let config = dir.path().join("config.json");
        std::fs::write(&config, r#"{"credsStore": "secretservice"}"#).unwrap();

        let record = store.create_backup(&[config.clone()]).unwrap();
        assert!(record.restorable);
        std::fs::write(&config, r#"{"credsStore": "pass"}"#).unwrap();

        let outcome = store.restore_backup(&record.id).unwrap();
        assert_eq!(outcome.restored, vec![config.clone()]);
        assert_eq!(std::fs::read_to_string(&config).unwrap(), r#"{"credsStore": "secretservice"}"#);
    }

    #[test]
    fn test_tombstone_removes_created_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBackupStore::new(dir.path().join("backups"));
        let config = dir.path().join(".docker").join("config.json");

        let record = store.create_backup(&[config.clone()]).unwrap();
        std::fs::create_dir_all(config.parent().unwrap()).unwrap();
        std::fs::write(&config, "{}").unwrap();

        let outcome = store.restore_backup(&record.id).unwrap();
        assert_eq!(outcome.removed, vec![config.clone()]);
        assert!(!config.exists());
    }

    #[test]
    fn test_tampered_payload_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBackupStore::new(dir.path().join("backups"));
        let config = dir.path().join("config.json");
        std::fs::write(&config, "{}").unwrap();

        let record = store.create_backup(&[config.clone()]).unwrap();
        std::fs::write(store.root().join(&record.id).join("0.bak"), "tampered").unwrap();
        std::fs::write(&config, r#"{"auths": {}}"#).unwrap();

        let err = store.restore_backup(&record.id).unwrap_err();
        assert!(matches!(err, BackupError::Corrupted { .. }));
        assert_eq!(std::fs::read_to_string(&config).unwrap(), r#"{"auths": {}}"#);
    }

    #[test]
    fn test_list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBackupStore::new(dir.path().join("backups"));
        assert!(store.list_backups().unwrap().is_empty());

        let record = store.create_backup(&[dir.path().join("missing.json")]).unwrap();
        assert_eq!(store.list_backups().unwrap(), vec![record.clone()]);

        store.delete_backup(&record.id).unwrap();
        assert!(store.list_backups().unwrap().is_empty());
        assert!(matches!(store.delete_backup(&record.id), Err(BackupError::NotFound { .. })));
        assert!(matches!(store.restore_backup("../etc"), Err(BackupError::NotFound { .. })));
    }
}
