use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use semver::Version;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{error::ModelError, metadata::Digest};

pub const STATE_FILE: &str = "local-state.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstalledModel {
    pub model_id: String,
    pub version: Version,
    #[serde(with = "time::serde::rfc3339")]
    pub installed_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_used: Option<OffsetDateTime>,
    pub file_path: PathBuf,
    pub checksum: Digest,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalState {
    #[serde(default)]
    pub installed_models: BTreeMap<String, InstalledModel>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_check: Option<OffsetDateTime>,
    #[serde(default)]
    pub auto_update_enabled: bool,
}

impl LocalState {
    #[must_use]
    pub fn installed(&self, model_id: &str) -> Option<&InstalledModel> {
        self.installed_models.get(model_id)
    }
}

/// Sole writer of the local state document. Every mutation is load, change, atomic replace.
pub struct LocalStateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalStateStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(STATE_FILE))
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn load(&self) -> Result<LocalState, ModelError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Ok(LocalState::default())
            }
            Err(error) => {
                return Err(ModelError::io(
                    format!("read local state {}", self.path.display()),
                    error,
                ))
            }
        };
        serde_json::from_slice(&bytes).map_err(|error| ModelError::StateCorrupted {
            path: self.path.clone(),
            reason: error.to_string(),
        })
    }

    pub fn save(&self, state: &LocalState) -> Result<(), ModelError> {
        let _guard = self.write_lock.lock();
        self.write(state)
    }

    /// Applies `mutate` to freshly loaded state and persists the result. Nothing is written
    /// when `mutate` fails.
    pub fn update<T, F>(&self, mutate: F) -> Result<T, ModelError>
    where
        F: FnOnce(&mut LocalState) -> Result<T, ModelError>,
    {
        let _guard = self.write_lock.lock();
        let mut state = self.load()?;
        let value = mutate(&mut state)?;
        self.write(&state)?;
        Ok(value)
    }

    pub fn upsert_installed(
        &self,
        model_id: &str,
        mut model: InstalledModel,
    ) -> Result<Option<InstalledModel>, ModelError> {
        model.model_id = model_id.to_string();
        self.update(|state| Ok(state.installed_models.insert(model_id.to_string(), model)))
    }

    pub fn remove_installed(&self, model_id: &str) -> Result<Option<InstalledModel>, ModelError> {
        self.update(|state| Ok(state.installed_models.remove(model_id)))
    }

    /// Moves an unparsable state file aside so a fresh state can be started. Returns where
    /// the old file went, or `None` when the current file parses fine.
    pub fn quarantine_corrupted(&self) -> Result<Option<PathBuf>, ModelError> {
        let _guard = self.write_lock.lock();
        match self.load() {
            Ok(_) => Ok(None),
            Err(ModelError::StateCorrupted { .. }) => {
                let stamp = OffsetDateTime::now_utc().unix_timestamp();
                let mut name = self.path.as_os_str().to_owned();
                name.push(format!(".corrupt-{stamp}"));
                let target = PathBuf::from(name);
                fs::rename(&self.path, &target).map_err(|error| {
                    ModelError::io(format!("move aside {}", self.path.display()), error)
                })?;
                tracing::warn!(
                    "Corrupted local state moved to {}; starting with empty state",
                    target.display()
                );
                Ok(Some(target))
            }
            Err(error) => Err(error),
        }
    }

    fn write(&self, state: &LocalState) -> Result<(), ModelError> {
        let serialized = serde_json::to_vec_pretty(state).map_err(|error| {
            ModelError::io("serialize local state", io::Error::new(io::ErrorKind::Other, error))
        })?;
        write_atomic(&self.path, &serialized)
            .map_err(|error| ModelError::io(format!("write {}", self.path.display()), error))
    }
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".into());
    let temp = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

    let result = (|| {
        let mut file = File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result?;
    sync_dir(parent);
    Ok(())
}

pub(crate) fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}
