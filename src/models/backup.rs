use std::{
    fs, io,
    path::{Path, PathBuf},
};

use semver::Version;
use serde::{Deserialize, Serialize};
use sysinfo::Disks;
use time::OffsetDateTime;

use super::{
    error::BackupError,
    metadata::{compute_sha256, Digest},
    state::{sync_dir, write_atomic},
};

pub const BACKUP_META: &str = "backup.json";
const DEFAULT_HEADROOM_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupRecord {
    pub model_id: String,
    pub version: Version,
    pub checksum: Digest,
    pub size_bytes: u64,
    pub file_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupHandle {
    pub record: BackupRecord,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRestored {
    pub path: PathBuf,
    pub record: BackupRecord,
}

pub trait SpaceProbe: Send + Sync {
    /// Free bytes on the volume holding `path`, or `None` when it cannot be determined.
    fn available_space(&self, path: &Path) -> Option<u64>;
}

pub struct SystemSpaceProbe;

impl SpaceProbe for SystemSpaceProbe {
    fn available_space(&self, path: &Path) -> Option<u64> {
        let target = existing_ancestor(path)?;
        let target = fs::canonicalize(&target).unwrap_or(target);
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}

pub struct FixedSpace(pub u64);

impl SpaceProbe for FixedSpace {
    fn available_space(&self, _path: &Path) -> Option<u64> {
        Some(self.0)
    }
}

fn existing_ancestor(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .find(|candidate| candidate.exists())
        .map(Path::to_path_buf)
}

pub struct BackupManager {
    root: PathBuf,
    probe: Box<dyn SpaceProbe>,
    headroom_bytes: u64,
}

impl BackupManager {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            probe: Box::new(SystemSpaceProbe),
            headroom_bytes: DEFAULT_HEADROOM_BYTES,
        }
    }

    #[must_use]
    pub fn with_probe(mut self, probe: Box<dyn SpaceProbe>) -> Self {
        self.probe = probe;
        self
    }

    #[must_use]
    pub fn with_headroom(mut self, headroom_bytes: u64) -> Self {
        self.headroom_bytes = headroom_bytes;
        self
    }

    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    fn model_dir(&self, model_id: &str) -> PathBuf {
        self.root.join(model_id)
    }

    fn version_dir(&self, model_id: &str, version: &Version) -> PathBuf {
        self.model_dir(model_id).join(version.to_string())
    }

    /// Copies the installed artifact into the backup store. The source is left untouched.
    pub fn snapshot(
        &self,
        model_id: &str,
        version: &Version,
        source_path: &Path,
        checksum: &Digest,
    ) -> Result<BackupHandle, BackupError> {
        let dir = self.version_dir(model_id, version);
        if let Some(existing) = self.find(model_id, version)? {
            let path = dir.join(&existing.file_name);
            if &existing.checksum == checksum && path.exists() {
                // Reuse counts as a fresh snapshot for rollback ordering and pruning.
                let record = BackupRecord {
                    created_at: OffsetDateTime::now_utc(),
                    ..existing
                };
                write_record(&dir, &record)?;
                tracing::debug!("Reusing existing snapshot of {model_id} {version}");
                return Ok(BackupHandle { record, path });
            }
        }

        let size_bytes = fs::metadata(source_path)
            .map_err(|error| {
                BackupError::io(format!("stat {}", source_path.display()), error)
            })?
            .len();
        let required = size_bytes.saturating_add(self.headroom_bytes);
        let available = self.probe.available_space(&self.root).unwrap_or_else(|| {
            tracing::warn!(
                "Could not determine free space under {}",
                self.root.display()
            );
            0
        });
        if available < required {
            return Err(BackupError::InsufficientSpace {
                path: self.root.clone(),
                required,
                available,
            });
        }

        let file_name = source_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model.bin".into());
        fs::create_dir_all(&dir)
            .map_err(|error| BackupError::io(format!("create {}", dir.display()), error))?;
        let path = dir.join(&file_name);
        copy_verified(source_path, &path, checksum).map_err(|error| match error {
            CopyError::Io(error) => {
                BackupError::io(format!("copy {} to backup", source_path.display()), error)
            }
            CopyError::Mismatch(actual) => BackupError::Corrupt {
                model_id: model_id.to_string(),
                version: version.clone(),
                expected: checksum.clone(),
                actual,
            },
        })?;

        let record = BackupRecord {
            model_id: model_id.to_string(),
            version: version.clone(),
            checksum: checksum.clone(),
            size_bytes,
            file_name,
            created_at: OffsetDateTime::now_utc(),
        };
        write_record(&dir, &record)?;

        tracing::info!("Snapshot of {model_id} {version} stored at {}", path.display());
        Ok(BackupHandle { record, path })
    }

    /// Copies the snapshot for `version` to `destination`, verifying it on the way.
    pub fn restore(
        &self,
        model_id: &str,
        version: &Version,
        destination: &Path,
    ) -> Result<PathRestored, BackupError> {
        let record = self
            .find(model_id, version)?
            .ok_or_else(|| BackupError::NotFound {
                model_id: model_id.to_string(),
                version: version.clone(),
            })?;
        let source = self.version_dir(model_id, version).join(&record.file_name);
        if !source.exists() {
            return Err(BackupError::NotFound {
                model_id: model_id.to_string(),
                version: version.clone(),
            });
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|error| BackupError::io(format!("create {}", parent.display()), error))?;
        }
        copy_verified(&source, destination, &record.checksum).map_err(|error| match error {
            CopyError::Io(error) => BackupError::io(
                format!("restore {} to {}", source.display(), destination.display()),
                error,
            ),
            CopyError::Mismatch(actual) => BackupError::Corrupt {
                model_id: model_id.to_string(),
                version: version.clone(),
                expected: record.checksum.clone(),
                actual,
            },
        })?;
        tracing::info!("Restored {model_id} {version} to {}", destination.display());
        Ok(PathRestored {
            path: destination.to_path_buf(),
            record,
        })
    }

    pub fn find(
        &self,
        model_id: &str,
        version: &Version,
    ) -> Result<Option<BackupRecord>, BackupError> {
        let meta = self.version_dir(model_id, version).join(BACKUP_META);
        match read_record(&meta) {
            Ok(record) => Ok(Some(record)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => {
                tracing::warn!("Ignoring unreadable backup record {}: {error}", meta.display());
                Ok(None)
            }
        }
    }

    /// Snapshots for `model_id`, newest first.
    pub fn list(&self, model_id: &str) -> Result<Vec<BackupRecord>, BackupError> {
        let dir = self.model_dir(model_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => {
                return Err(BackupError::io(format!("list {}", dir.display()), error))
            }
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let meta = entry.path().join(BACKUP_META);
            match read_record(&meta) {
                Ok(record) => records.push(record),
                Err(error) => {
                    tracing::warn!("Skipping backup without readable record {}: {error}", meta.display())
                }
            }
        }
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.version.cmp(&a.version))
        });
        Ok(records)
    }

    /// Newest snapshot whose version differs from `exclude`.
    pub fn latest_excluding(
        &self,
        model_id: &str,
        exclude: Option<&Version>,
    ) -> Result<Option<BackupRecord>, BackupError> {
        Ok(self
            .list(model_id)?
            .into_iter()
            .find(|record| Some(&record.version) != exclude))
    }

    /// Deletes the oldest snapshots beyond `keep_count`. Returns what was removed.
    pub fn prune(&self, model_id: &str, keep_count: usize) -> Result<Vec<BackupRecord>, BackupError> {
        let records = self.list(model_id)?;
        let mut removed = Vec::new();
        for record in records.into_iter().skip(keep_count) {
            let dir = self.version_dir(model_id, &record.version);
            fs::remove_dir_all(&dir)
                .map_err(|error| BackupError::io(format!("remove {}", dir.display()), error))?;
            tracing::info!("Pruned backup {model_id} {}", record.version);
            removed.push(record);
        }
        remove_if_empty(&self.model_dir(model_id));
        Ok(removed)
    }

    pub fn model_ids(&self) -> Result<Vec<String>, BackupError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => {
                return Err(BackupError::io(format!("list {}", self.root.display()), error))
            }
        };
        let mut ids: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str().map(ToOwned::to_owned))
            .collect();
        ids.sort();
        Ok(ids)
    }
}

fn read_record(path: &Path) -> io::Result<BackupRecord> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))
}

fn write_record(dir: &Path, record: &BackupRecord) -> Result<(), BackupError> {
    let meta = serde_json::to_vec_pretty(record).map_err(|error| {
        BackupError::io("serialize backup record", io::Error::new(io::ErrorKind::Other, error))
    })?;
    write_atomic(&dir.join(BACKUP_META), &meta)
        .map_err(|error| BackupError::io("write backup record", error))
}

enum CopyError {
    Io(io::Error),
    Mismatch(Digest),
}

fn copy_verified(source: &Path, destination: &Path, expected: &Digest) -> Result<(), CopyError> {
    let parent = destination.parent().unwrap_or_else(|| Path::new("."));
    let temp = parent.join(format!(".restore-{}.tmp", uuid::Uuid::new_v4()));
    let result = (|| {
        fs::copy(source, &temp).map_err(CopyError::Io)?;
        let actual = compute_sha256(&temp).map_err(CopyError::Io)?;
        if &actual != expected {
            return Err(CopyError::Mismatch(actual));
        }
        fs::rename(&temp, destination).map_err(CopyError::Io)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp);
    } else {
        sync_dir(parent);
    }
    result
}

pub(crate) fn remove_if_empty(dir: &Path) {
    let empty = fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    if empty {
        let _ = fs::remove_dir(dir);
    }
}
