use std::{
    collections::HashMap,
    env, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use semver::Version;
use serde::Serialize;
use sysinfo::System;
use time::OffsetDateTime;

use crate::core::{
    events::{emit_model_progress, emit_model_status, EventSink, LifecycleState, NoopSink},
    settings::ManagerConfig,
};

use super::{
    backup::{remove_if_empty, BackupManager, BackupRecord, SpaceProbe},
    download::{CancellationToken, DownloadEngine, DownloadRequest},
    error::{BackupError, LifecycleError, ModelError, Operation},
    metadata::{compute_sha256, verify_file, verify_or_discard, Digest, Verification},
    registry::{is_valid_model_id, Registry, RegistrySource, VersionRecord},
    state::{sync_dir, InstalledModel, LocalState, LocalStateStore},
};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Directory layout under the models root.
#[derive(Debug, Clone)]
pub struct ModelLayout {
    root: PathBuf,
    artifacts: PathBuf,
    staging: PathBuf,
    backups: PathBuf,
}

impl ModelLayout {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            artifacts: root.join("artifacts"),
            staging: root.join("staging"),
            backups: root.join("backups"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifacts(&self) -> &Path {
        &self.artifacts
    }

    pub fn backups(&self) -> &Path {
        &self.backups
    }

    #[must_use]
    pub fn artifact_dir(&self, model_id: &str, version: &Version) -> PathBuf {
        self.artifacts.join(model_id).join(version.to_string())
    }

    #[must_use]
    pub fn artifact_path(&self, model_id: &str, version: &Version, file_name: &str) -> PathBuf {
        self.artifact_dir(model_id, version).join(file_name)
    }

    #[must_use]
    pub fn staging_path(&self, model_id: &str, version: &Version) -> PathBuf {
        self.staging.join(format!("{model_id}-{version}.part"))
    }

    fn ensure(&self) -> io::Result<()> {
        for dir in [&self.root, &self.artifacts, &self.staging, &self.backups] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Major,
    Minor,
    Patch,
    Security,
}

impl UpdateKind {
    /// A registry `security` flag wins over the version component that changed.
    #[must_use]
    pub fn classify(from: &Version, to: &Version, security: bool) -> Self {
        if security {
            UpdateKind::Security
        } else if from.major != to.major {
            UpdateKind::Major
        } else if from.minor != to.minor {
            UpdateKind::Minor
        } else {
            UpdateKind::Patch
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvailableUpdate {
    pub model_id: String,
    pub from: Version,
    pub to: Version,
    pub kind: UpdateKind,
    pub size_bytes: u64,
    pub deprecated: bool,
    pub changelog: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum OrphanReason {
    NotInRegistry,
    AheadOfRegistry { registry_version: Version },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanedEntry {
    pub model_id: String,
    pub installed: Version,
    #[serde(flatten)]
    pub reason: OrphanReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateReport {
    pub updates: Vec<AvailableUpdate>,
    pub orphaned: Vec<OrphanedEntry>,
    pub up_to_date: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum IntegrityStatus {
    Ok,
    Missing,
    Corrupt { expected: Digest, actual: Digest },
    Unreadable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub model_id: String,
    pub version: Version,
    pub file_path: PathBuf,
    #[serde(flatten)]
    pub status: IntegrityStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupFailure {
    pub model_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub pruned: Vec<BackupRecord>,
    pub removed_artifacts: Vec<PathBuf>,
    pub failures: Vec<CleanupFailure>,
}

/// Coordinates registry, local state, downloads and backups for every model under one root.
pub struct ModelLifecycleManager {
    config: ManagerConfig,
    layout: ModelLayout,
    source: RegistrySource,
    registry: RwLock<Option<Arc<Registry>>>,
    state: LocalStateStore,
    downloads: DownloadEngine,
    backups: BackupManager,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    events: Arc<dyn EventSink>,
}

impl ModelLifecycleManager {
    pub fn new(config: ManagerConfig) -> Result<Self, ModelError> {
        let root = absolute(&config.models_dir)?;
        let layout = ModelLayout::new(&root);
        layout
            .ensure()
            .map_err(|error| ModelError::io(format!("create {}", root.display()), error))?;

        let downloads = DownloadEngine::new(&config.download, config.download_slots())?;
        let backups = BackupManager::new(layout.backups().to_path_buf())
            .with_headroom(config.backup_headroom_bytes);
        let source = config.registry_source();
        tracing::debug!(
            "Model root {} using registry {source}",
            layout.root().display()
        );

        Ok(Self {
            state: LocalStateStore::in_dir(layout.root()),
            config,
            layout,
            source,
            registry: RwLock::new(None),
            downloads,
            backups,
            locks: Mutex::new(HashMap::new()),
            events: Arc::new(NoopSink),
        })
    }

    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub fn with_space_probe(mut self, probe: Box<dyn SpaceProbe>) -> Self {
        self.backups = BackupManager::new(self.layout.backups().to_path_buf())
            .with_probe(probe)
            .with_headroom(self.config.backup_headroom_bytes);
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn layout(&self) -> &ModelLayout {
        &self.layout
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// Fetches the registry again and replaces the cached copy wholesale.
    pub fn refresh_registry(&self) -> Result<Arc<Registry>, LifecycleError> {
        self.load_registry()
            .map_err(|kind| LifecycleError::new(Operation::RefreshRegistry, None, kind))
    }

    /// The registry from the last successful fetch, if any.
    pub fn registry(&self) -> Option<Arc<Registry>> {
        self.registry.read().clone()
    }

    pub fn local_state(&self) -> Result<LocalState, LifecycleError> {
        self.state
            .load()
            .map_err(|kind| LifecycleError::new(Operation::LoadState, None, kind))
    }

    pub fn check_for_updates(&self) -> Result<UpdateReport, LifecycleError> {
        let fail = |kind| LifecycleError::new(Operation::CheckUpdates, None, kind);
        let registry = self.load_registry().map_err(fail)?;
        let checked_at = OffsetDateTime::now_utc();
        let state = self
            .state
            .update(|state| {
                state.last_check = Some(checked_at);
                Ok(state.clone())
            })
            .map_err(fail)?;

        let mut report = UpdateReport {
            updates: Vec::new(),
            orphaned: Vec::new(),
            up_to_date: Vec::new(),
            checked_at,
        };

        for (model_id, installed) in &state.installed_models {
            let Some(descriptor) = registry.model(model_id) else {
                report.orphaned.push(OrphanedEntry {
                    model_id: model_id.clone(),
                    installed: installed.version.clone(),
                    reason: OrphanReason::NotInRegistry,
                });
                continue;
            };
            let available = &descriptor.current_version;
            if available > &installed.version {
                let Some(record) = descriptor.current() else {
                    continue;
                };
                report.updates.push(AvailableUpdate {
                    model_id: model_id.clone(),
                    from: installed.version.clone(),
                    to: available.clone(),
                    kind: UpdateKind::classify(&installed.version, available, record.security),
                    size_bytes: record.size_bytes,
                    deprecated: record.deprecated,
                    changelog: record.changelog.clone(),
                });
            } else if available < &installed.version {
                report.orphaned.push(OrphanedEntry {
                    model_id: model_id.clone(),
                    installed: installed.version.clone(),
                    reason: OrphanReason::AheadOfRegistry {
                        registry_version: available.clone(),
                    },
                });
            } else {
                report.up_to_date.push(model_id.clone());
            }
        }

        tracing::info!(
            "Update check: {} update(s), {} orphaned, {} up to date",
            report.updates.len(),
            report.orphaned.len(),
            report.up_to_date.len()
        );
        Ok(report)
    }

    pub fn install(
        &self,
        model_id: &str,
        version: Option<&Version>,
        host: &Version,
        cancel: &CancellationToken,
    ) -> Result<InstalledModel, LifecycleError> {
        self.with_model_lock(model_id, || self.install_locked(model_id, version, host, cancel))
            .map_err(|kind| self.failed(Operation::Install, model_id, kind))
    }

    fn install_locked(
        &self,
        model_id: &str,
        version: Option<&Version>,
        host: &Version,
        cancel: &CancellationToken,
    ) -> Result<InstalledModel, ModelError> {
        let state = self.state.load()?;
        if let Some(existing) = state.installed(model_id) {
            return Err(ModelError::AlreadyInstalled {
                version: existing.version.clone(),
            });
        }

        let registry = self.current_registry()?;
        let record = registry.resolve(model_id, version)?.clone();
        ensure_compatible(&record, host)?;
        memory_advisory(model_id, &record);

        let destination =
            self.layout
                .artifact_path(model_id, &record.version, &record.file_name());
        if let Err(error) = self.fetch_verified(model_id, &record, &destination, cancel) {
            self.emit_failure(model_id, &error);
            emit_model_status(self.events.as_ref(), model_id, LifecycleState::NotInstalled);
            return Err(error);
        }

        let installed = InstalledModel {
            model_id: model_id.to_string(),
            version: record.version.clone(),
            installed_at: OffsetDateTime::now_utc(),
            last_used: None,
            file_path: destination.clone(),
            checksum: record.checksum.clone(),
            size_bytes: record.size_bytes,
        };
        if let Err(error) = self.state.upsert_installed(model_id, installed.clone()) {
            remove_artifact(&destination);
            self.emit_failure(model_id, &error);
            return Err(error);
        }

        tracing::info!("Installed {model_id} {}", installed.version);
        emit_model_status(
            self.events.as_ref(),
            model_id,
            LifecycleState::Installed {
                version: installed.version.clone(),
            },
        );
        Ok(installed)
    }

    pub fn update(
        &self,
        model_id: &str,
        target: Option<&Version>,
        host: &Version,
        cancel: &CancellationToken,
    ) -> Result<InstalledModel, LifecycleError> {
        self.with_model_lock(model_id, || self.update_locked(model_id, target, host, cancel))
            .map_err(|kind| self.failed(Operation::Update, model_id, kind))
    }

    fn update_locked(
        &self,
        model_id: &str,
        target: Option<&Version>,
        host: &Version,
        cancel: &CancellationToken,
    ) -> Result<InstalledModel, ModelError> {
        let state = self.state.load()?;
        let current = state
            .installed(model_id)
            .cloned()
            .ok_or(ModelError::NotInstalled)?;

        let registry = self.current_registry()?;
        let descriptor = registry.model(model_id).ok_or(ModelError::OrphanedModel)?;
        let record = match target {
            Some(version) => descriptor
                .version(version)
                .ok_or_else(|| ModelError::UnknownVersion {
                    version: version.clone(),
                })?,
            None => {
                let record = registry.resolve(model_id, None)?;
                if record.version < current.version {
                    return Err(ModelError::NoUpdateAvailable {
                        installed: current.version.clone(),
                        available: record.version.clone(),
                    });
                }
                record
            }
        }
        .clone();

        if record.version == current.version {
            return Err(ModelError::AlreadyAtVersion {
                version: current.version.clone(),
            });
        }
        ensure_compatible(&record, host)?;
        memory_advisory(model_id, &record);

        emit_model_status(
            self.events.as_ref(),
            model_id,
            LifecycleState::Updating {
                from: current.version.clone(),
                to: record.version.clone(),
            },
        );

        // Nothing destructive happens before the current artifact is safely copied.
        match self.backups.snapshot(
            model_id,
            &current.version,
            &current.file_path,
            &current.checksum,
        ) {
            Ok(_) => {}
            Err(BackupError::Corrupt {
                expected, actual, ..
            }) => {
                tracing::warn!(
                    "Installed {model_id} {} is already corrupt (expected {expected}, found {actual}); updating without a snapshot",
                    current.version
                );
            }
            Err(BackupError::Io { ref source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(
                    "Installed {model_id} {} is missing from {}; updating without a snapshot",
                    current.version,
                    current.file_path.display()
                );
            }
            Err(error) => {
                let error = ModelError::from(error);
                self.emit_failure(model_id, &error);
                emit_installed(self.events.as_ref(), model_id, &current.version);
                return Err(error);
            }
        }

        let destination =
            self.layout
                .artifact_path(model_id, &record.version, &record.file_name());
        if let Err(error) = self.fetch_verified(model_id, &record, &destination, cancel) {
            self.emit_failure(model_id, &error);
            emit_model_status(
                self.events.as_ref(),
                model_id,
                LifecycleState::RolledBack {
                    version: current.version.clone(),
                },
            );
            return Err(error);
        }

        let installed = InstalledModel {
            model_id: model_id.to_string(),
            version: record.version.clone(),
            installed_at: OffsetDateTime::now_utc(),
            last_used: current.last_used,
            file_path: destination.clone(),
            checksum: record.checksum.clone(),
            size_bytes: record.size_bytes,
        };
        if let Err(error) = self.state.upsert_installed(model_id, installed.clone()) {
            remove_artifact(&destination);
            self.emit_failure(model_id, &error);
            emit_model_status(
                self.events.as_ref(),
                model_id,
                LifecycleState::RolledBack {
                    version: current.version.clone(),
                },
            );
            return Err(error);
        }

        if current.file_path != installed.file_path {
            remove_artifact(&current.file_path);
        }
        self.prune_backups(model_id);

        tracing::info!(
            "Updated {model_id} from {} to {}",
            current.version,
            installed.version
        );
        emit_installed(self.events.as_ref(), model_id, &installed.version);
        Ok(installed)
    }

    pub fn rollback(
        &self,
        model_id: &str,
        target: Option<&Version>,
    ) -> Result<InstalledModel, LifecycleError> {
        self.with_model_lock(model_id, || self.rollback_locked(model_id, target))
            .map_err(|kind| self.failed(Operation::Rollback, model_id, kind))
    }

    fn rollback_locked(
        &self,
        model_id: &str,
        target: Option<&Version>,
    ) -> Result<InstalledModel, ModelError> {
        let state = self.state.load()?;
        let current = state
            .installed(model_id)
            .cloned()
            .ok_or(ModelError::NotInstalled)?;

        let backup = match target {
            Some(version) => self.backups.find(model_id, version)?,
            None => self
                .backups
                .latest_excluding(model_id, Some(&current.version))?,
        }
        .ok_or(ModelError::NoBackupAvailable)?;
        if backup.version == current.version {
            return Err(ModelError::AlreadyAtVersion {
                version: current.version.clone(),
            });
        }

        emit_model_status(
            self.events.as_ref(),
            model_id,
            LifecycleState::Updating {
                from: current.version.clone(),
                to: backup.version.clone(),
            },
        );

        // Keep the version being replaced so the rollback itself can be undone.
        match self.backups.snapshot(
            model_id,
            &current.version,
            &current.file_path,
            &current.checksum,
        ) {
            Ok(_) => {}
            Err(BackupError::Corrupt { .. }) => {
                tracing::warn!(
                    "Installed {model_id} {} is corrupt; rolling back without keeping it",
                    current.version
                );
            }
            Err(BackupError::Io { ref source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(
                    "Installed {model_id} {} is missing; rolling back without keeping it",
                    current.version
                );
            }
            Err(error) => {
                let error = ModelError::from(error);
                self.emit_failure(model_id, &error);
                emit_installed(self.events.as_ref(), model_id, &current.version);
                return Err(error);
            }
        }

        let destination = self
            .layout
            .artifact_path(model_id, &backup.version, &backup.file_name);
        let restored = match self.backups.restore(model_id, &backup.version, &destination) {
            Ok(restored) => restored,
            Err(error) => {
                let error = ModelError::from(error);
                self.emit_failure(model_id, &error);
                emit_installed(self.events.as_ref(), model_id, &current.version);
                return Err(error);
            }
        };

        let installed = InstalledModel {
            model_id: model_id.to_string(),
            version: restored.record.version.clone(),
            installed_at: OffsetDateTime::now_utc(),
            last_used: current.last_used,
            file_path: restored.path.clone(),
            checksum: restored.record.checksum.clone(),
            size_bytes: restored.record.size_bytes,
        };
        if let Err(error) = self.state.upsert_installed(model_id, installed.clone()) {
            if restored.path != current.file_path {
                remove_artifact(&restored.path);
            }
            self.emit_failure(model_id, &error);
            return Err(error);
        }

        if current.file_path != installed.file_path {
            remove_artifact(&current.file_path);
        }
        self.prune_backups(model_id);

        tracing::info!(
            "Rolled back {model_id} from {} to {}",
            current.version,
            installed.version
        );
        emit_model_status(
            self.events.as_ref(),
            model_id,
            LifecycleState::RolledBack {
                version: installed.version.clone(),
            },
        );
        emit_installed(self.events.as_ref(), model_id, &installed.version);
        Ok(installed)
    }

    /// Downloads the installed version again and replaces the artifact once it verifies.
    pub fn reinstall(
        &self,
        model_id: &str,
        cancel: &CancellationToken,
    ) -> Result<InstalledModel, LifecycleError> {
        self.with_model_lock(model_id, || self.reinstall_locked(model_id, cancel))
            .map_err(|kind| self.failed(Operation::Reinstall, model_id, kind))
    }

    fn reinstall_locked(
        &self,
        model_id: &str,
        cancel: &CancellationToken,
    ) -> Result<InstalledModel, ModelError> {
        let state = self.state.load()?;
        let current = state
            .installed(model_id)
            .cloned()
            .ok_or(ModelError::NotInstalled)?;

        let registry = self.current_registry()?;
        let record = registry
            .model(model_id)
            .ok_or(ModelError::OrphanedModel)?
            .version(&current.version)
            .ok_or_else(|| ModelError::UnknownVersion {
                version: current.version.clone(),
            })?
            .clone();
        if record.checksum != current.checksum {
            tracing::warn!(
                "Registry digest for {model_id} {} changed from {} to {}",
                current.version,
                current.checksum,
                record.checksum
            );
        }

        let destination =
            self.layout
                .artifact_path(model_id, &record.version, &record.file_name());
        // A stale partial for this version must not be resumed into a forced download.
        let staging = self.layout.staging_path(model_id, &record.version);
        discard_file(&staging);
        // The installed file keeps matching its recorded digest until the new entry commits.
        let fetched = sibling_temp(&destination, "reinstall");
        if let Err(error) = self.fetch_verified(model_id, &record, &fetched, cancel) {
            self.emit_failure(model_id, &error);
            emit_installed(self.events.as_ref(), model_id, &current.version);
            return Err(error);
        }

        let installed = InstalledModel {
            installed_at: OffsetDateTime::now_utc(),
            file_path: destination.clone(),
            checksum: record.checksum.clone(),
            size_bytes: record.size_bytes,
            ..current.clone()
        };
        let committed = commit_then_promote(
            &fetched,
            &destination,
            || self.state.upsert_installed(model_id, installed.clone()).map(|_| ()),
            || {
                if let Err(error) = self.state.upsert_installed(model_id, current.clone()) {
                    tracing::warn!("Failed to restore state entry of {model_id}: {error}");
                }
            },
        );
        if let Err(error) = committed {
            self.emit_failure(model_id, &error);
            emit_installed(self.events.as_ref(), model_id, &current.version);
            return Err(error);
        }
        if current.file_path != installed.file_path {
            remove_artifact(&current.file_path);
        }

        tracing::info!("Reinstalled {model_id} {}", installed.version);
        emit_installed(self.events.as_ref(), model_id, &installed.version);
        Ok(installed)
    }

    /// Adopts a file already on disk as `version` of `model_id`.
    pub fn register_local(
        &self,
        model_id: &str,
        version: &Version,
        source: &Path,
    ) -> Result<InstalledModel, LifecycleError> {
        self.with_model_lock(model_id, || self.register_local_locked(model_id, version, source))
            .map_err(|kind| self.failed(Operation::RegisterLocal, model_id, kind))
    }

    fn register_local_locked(
        &self,
        model_id: &str,
        version: &Version,
        source: &Path,
    ) -> Result<InstalledModel, ModelError> {
        if !is_valid_model_id(model_id) {
            return Err(ModelError::InvalidModelId {
                model_id: model_id.to_string(),
            });
        }
        let state = self.state.load()?;
        if let Some(existing) = state.installed(model_id) {
            return Err(ModelError::AlreadyInstalled {
                version: existing.version.clone(),
            });
        }

        let checksum = compute_sha256(source)
            .map_err(|error| ModelError::io(format!("read {}", source.display()), error))?;
        match self.current_registry() {
            Ok(registry) => {
                if let Some(record) = registry
                    .model(model_id)
                    .and_then(|descriptor| descriptor.version(version))
                {
                    if let Verification::Mismatch { expected, actual } =
                        super::metadata::verify(&checksum, &record.checksum)
                    {
                        return Err(ModelError::ChecksumMismatch { expected, actual });
                    }
                } else {
                    tracing::warn!("Registry does not list {model_id} {version}; registering unchecked");
                }
            }
            Err(error) => {
                tracing::warn!("Registering {model_id} {version} without registry cross-check: {error}");
            }
        }

        let file_name = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model.bin".into());
        let destination = self.layout.artifact_path(model_id, version, &file_name);
        copy_into_place(source, &destination, &checksum)?;
        let size_bytes = fs::metadata(&destination)
            .map_err(|error| ModelError::io(format!("stat {}", destination.display()), error))?
            .len();

        let installed = InstalledModel {
            model_id: model_id.to_string(),
            version: version.clone(),
            installed_at: OffsetDateTime::now_utc(),
            last_used: None,
            file_path: destination.clone(),
            checksum,
            size_bytes,
        };
        if let Err(error) = self.state.upsert_installed(model_id, installed.clone()) {
            remove_artifact(&destination);
            return Err(error);
        }

        tracing::info!("Registered local file {} as {model_id} {version}", source.display());
        emit_installed(self.events.as_ref(), model_id, version);
        Ok(installed)
    }

    /// Drops the state entry first, then the artifact, so state never names a deleted file.
    pub fn uninstall(&self, model_id: &str) -> Result<InstalledModel, LifecycleError> {
        let removed = self
            .with_model_lock(model_id, || {
                let removed = self
                    .state
                    .remove_installed(model_id)
                    .and_then(|removed| removed.ok_or(ModelError::NotInstalled))?;
                remove_artifact(&removed.file_path);
                Ok(removed)
            })
            .map_err(|kind| self.failed(Operation::Uninstall, model_id, kind))?;
        tracing::info!("Uninstalled {model_id} {}", removed.version);
        emit_model_status(self.events.as_ref(), model_id, LifecycleState::NotInstalled);
        Ok(removed)
    }

    pub fn list_installed(&self) -> Result<Vec<InstalledModel>, LifecycleError> {
        Ok(self
            .local_state()?
            .installed_models
            .into_values()
            .collect())
    }

    /// Re-digests every installed artifact.
    pub fn verify_installed(&self) -> Result<Vec<IntegrityReport>, LifecycleError> {
        let state = self
            .state
            .load()
            .map_err(|kind| LifecycleError::new(Operation::Verify, None, kind))?;

        let mut reports = Vec::with_capacity(state.installed_models.len());
        for model_id in state.installed_models.keys() {
            let report = self
                .with_model_lock(model_id, || self.verify_one(model_id))
                .map_err(|kind| {
                    LifecycleError::new(Operation::Verify, Some(model_id.as_str()), kind)
                })?;
            reports.extend(report);
        }
        Ok(reports)
    }

    fn verify_one(&self, model_id: &str) -> Result<Option<IntegrityReport>, ModelError> {
        let state = self.state.load()?;
        let Some(installed) = state.installed(model_id) else {
            return Ok(None);
        };
        let status = if !installed.file_path.exists() {
            IntegrityStatus::Missing
        } else {
            match verify_file(&installed.file_path, &installed.checksum) {
                Ok(Verification::Match) => IntegrityStatus::Ok,
                Ok(Verification::Mismatch { expected, actual }) => {
                    IntegrityStatus::Corrupt { expected, actual }
                }
                Err(error) => IntegrityStatus::Unreadable {
                    reason: error.to_string(),
                },
            }
        };
        if status != IntegrityStatus::Ok {
            tracing::warn!("Integrity check of {model_id}: {status:?}");
        }
        Ok(Some(IntegrityReport {
            model_id: model_id.to_string(),
            version: installed.version.clone(),
            file_path: installed.file_path.clone(),
            status,
        }))
    }

    /// Prunes backups beyond `keep_count` and removes artifacts that local state does not
    /// reference. Failures for one model are collected and do not stop the sweep.
    pub fn cleanup(&self, keep_count: usize) -> Result<CleanupReport, LifecycleError> {
        let fail = |kind| LifecycleError::new(Operation::Cleanup, None, kind);
        self.state.load().map_err(fail)?;
        let mut report = CleanupReport::default();

        for model_id in self.backups.model_ids().map_err(|error| fail(error.into()))? {
            match self.with_model_lock(&model_id, || self.backups.prune(&model_id, keep_count)) {
                Ok(pruned) => report.pruned.extend(pruned),
                Err(error) => {
                    tracing::warn!("Pruning backups of {model_id} failed: {error}");
                    report.failures.push(CleanupFailure {
                        model_id,
                        reason: error.to_string(),
                    });
                }
            }
        }

        for model_id in list_dir_names(self.layout.artifacts()).map_err(|error| {
            fail(ModelError::io(
                format!("list {}", self.layout.artifacts().display()),
                error,
            ))
        })? {
            match self.remove_orphan_artifacts(&model_id) {
                Ok(removed) => report.removed_artifacts.extend(removed),
                Err(error) => {
                    tracing::warn!("Removing orphan artifacts of {model_id} failed: {error}");
                    report.failures.push(CleanupFailure {
                        model_id,
                        reason: error.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            "Cleanup pruned {} backup(s), removed {} orphan artifact(s), {} failure(s)",
            report.pruned.len(),
            report.removed_artifacts.len(),
            report.failures.len()
        );
        Ok(report)
    }

    fn remove_orphan_artifacts(&self, model_id: &str) -> Result<Vec<PathBuf>, ModelError> {
        self.with_model_lock(model_id, || self.remove_orphan_artifacts_locked(model_id))
    }

    fn remove_orphan_artifacts_locked(&self, model_id: &str) -> Result<Vec<PathBuf>, ModelError> {
        let state = self.state.load()?;
        let keep = state
            .installed(model_id)
            .map(|installed| installed.file_path.clone());

        let model_dir = self.layout.artifacts().join(model_id);
        let mut removed = Vec::new();
        let entries = fs::read_dir(&model_dir)
            .map_err(|error| ModelError::io(format!("list {}", model_dir.display()), error))?;
        for entry in entries.flatten() {
            let path = entry.path();
            match &keep {
                Some(keep) if keep.starts_with(&path) && path.is_dir() => {
                    let inner = fs::read_dir(&path).map_err(|error| {
                        ModelError::io(format!("list {}", path.display()), error)
                    })?;
                    for stray in inner.flatten().map(|entry| entry.path()) {
                        if &stray != keep {
                            remove_path(&stray)?;
                            removed.push(stray);
                        }
                    }
                }
                Some(keep) if keep == &path => {}
                _ => {
                    remove_path(&path)?;
                    removed.push(path);
                }
            }
        }
        remove_if_empty(&model_dir);
        Ok(removed)
    }

    pub fn mark_used(&self, model_id: &str) -> Result<InstalledModel, LifecycleError> {
        self.state
            .update(|state| {
                let entry = state
                    .installed_models
                    .get_mut(model_id)
                    .ok_or(ModelError::NotInstalled)?;
                entry.last_used = Some(OffsetDateTime::now_utc());
                Ok(entry.clone())
            })
            .map_err(|kind| LifecycleError::new(Operation::MarkUsed, Some(model_id), kind))
    }

    pub fn set_auto_update(&self, enabled: bool) -> Result<(), LifecycleError> {
        self.state
            .update(|state| {
                state.auto_update_enabled = enabled;
                Ok(())
            })
            .map_err(|kind| LifecycleError::new(Operation::LoadState, None, kind))
    }

    /// Moves an unparsable state file aside. Never called implicitly.
    pub fn reset_corrupted_state(&self) -> Result<Option<PathBuf>, LifecycleError> {
        self.state
            .quarantine_corrupted()
            .map_err(|kind| LifecycleError::new(Operation::LoadState, None, kind))
    }

    fn load_registry(&self) -> Result<Arc<Registry>, ModelError> {
        let registry = Arc::new(Registry::fetch(&self.source, self.downloads.client())?);
        *self.registry.write() = Some(registry.clone());
        Ok(registry)
    }

    fn current_registry(&self) -> Result<Arc<Registry>, ModelError> {
        if let Some(registry) = self.registry.read().as_ref() {
            return Ok(registry.clone());
        }
        self.load_registry()
    }

    /// Runs `work` while holding the lock for `model_id`. The lock entry is dropped again
    /// once no other caller holds or waits on it.
    fn with_model_lock<T>(&self, model_id: &str, work: impl FnOnce() -> T) -> T {
        let lock = self
            .locks
            .lock()
            .entry(model_id.to_string())
            .or_default()
            .clone();
        let result = {
            let _guard = lock.lock();
            work()
        };
        let mut locks = self.locks.lock();
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(model_id);
        }
        result
    }

    /// Streams the record into staging, verifies it and renames it onto `destination`.
    fn fetch_verified(
        &self,
        model_id: &str,
        record: &VersionRecord,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ModelError> {
        let staging = self.layout.staging_path(model_id, &record.version);
        let events = self.events.as_ref();
        emit_model_status(events, model_id, LifecycleState::Downloading);

        let progress = |downloaded: u64, total: u64| {
            emit_model_progress(events, model_id, &record.version, downloaded, total)
        };
        let outcome = self.downloads.download(
            &DownloadRequest {
                url: &record.download_url,
                staging_path: &staging,
                expected_size: record.size_bytes,
            },
            &progress,
            cancel,
        )?;
        tracing::info!(
            "Downloaded {model_id} {} ({} bytes in {} attempt(s), resumed from {})",
            record.version,
            outcome.bytes_downloaded,
            outcome.attempts,
            outcome.resumed_from
        );

        emit_model_status(events, model_id, LifecycleState::Verifying);
        match verify_or_discard(&staging, &record.checksum)
            .map_err(|error| ModelError::io("verify staged download", error))?
        {
            Verification::Match => {}
            Verification::Mismatch { expected, actual } => {
                return Err(ModelError::ChecksumMismatch { expected, actual })
            }
        }
        promote(&staging, destination)
    }

    fn prune_backups(&self, model_id: &str) {
        if let Err(error) = self.backups.prune(model_id, self.config.backup_retention) {
            tracing::warn!("Failed to prune backups of {model_id}: {error}");
        }
    }

    fn emit_failure(&self, model_id: &str, error: &ModelError) {
        let retryable = match error {
            ModelError::Download(error) => error.is_retryable(),
            ModelError::ChecksumMismatch { .. } => true,
            _ => false,
        };
        emit_model_status(
            self.events.as_ref(),
            model_id,
            LifecycleState::Failed {
                reason: error.to_string(),
                retryable,
            },
        );
    }

    fn failed(&self, operation: Operation, model_id: &str, kind: ModelError) -> LifecycleError {
        let error = LifecycleError::new(operation, Some(model_id), kind);
        tracing::warn!("{error}");
        error
    }
}

fn emit_installed(events: &dyn EventSink, model_id: &str, version: &Version) {
    emit_model_status(
        events,
        model_id,
        LifecycleState::Installed {
            version: version.clone(),
        },
    );
}

fn ensure_compatible(record: &VersionRecord, host: &Version) -> Result<(), ModelError> {
    if record.is_compatible_with(host) {
        Ok(())
    } else {
        Err(ModelError::IncompatibleVersion {
            version: record.version.clone(),
            host_version: host.clone(),
            ranges: record.compatibility_ranges(),
        })
    }
}

fn memory_advisory(model_id: &str, record: &VersionRecord) {
    if record.minimum_ram_gb.is_none() && record.recommended_ram_gb.is_none() {
        return;
    }
    let mut system = System::new();
    system.refresh_memory();
    let total_gb = system.total_memory() as f64 / GIB;
    if total_gb <= 0.0 {
        return;
    }
    if let Some(minimum) = record.minimum_ram_gb {
        if total_gb < minimum {
            tracing::warn!(
                "{model_id} {} needs at least {minimum:.1} GiB RAM; this machine has {total_gb:.1} GiB",
                record.version
            );
            return;
        }
    }
    if let Some(recommended) = record.recommended_ram_gb {
        if total_gb < recommended {
            tracing::warn!(
                "{model_id} {} recommends {recommended:.1} GiB RAM; this machine has {total_gb:.1} GiB",
                record.version
            );
        }
    }
}

fn promote(staging: &Path, destination: &Path) -> Result<(), ModelError> {
    let parent = destination.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .map_err(|error| ModelError::io(format!("create {}", parent.display()), error))?;
    fs::rename(staging, destination).map_err(|error| {
        ModelError::io(
            format!("move {} to {}", staging.display(), destination.display()),
            error,
        )
    })?;
    sync_dir(parent);
    Ok(())
}

fn sibling_temp(destination: &Path, purpose: &str) -> PathBuf {
    destination.with_file_name(format!(".{purpose}-{}.tmp", uuid::Uuid::new_v4()))
}

/// Runs `commit`, then moves `fetched` onto `destination`. A failed commit leaves
/// `destination` alone; a failed move runs `undo`.
fn commit_then_promote(
    fetched: &Path,
    destination: &Path,
    commit: impl FnOnce() -> Result<(), ModelError>,
    undo: impl FnOnce(),
) -> Result<(), ModelError> {
    if let Err(error) = commit() {
        discard_file(fetched);
        return Err(error);
    }
    if let Err(error) = promote(fetched, destination) {
        undo();
        discard_file(fetched);
        return Err(error);
    }
    Ok(())
}

fn discard_file(path: &Path) {
    if let Err(error) = fs::remove_file(path) {
        if error.kind() != io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove {}: {error:?}", path.display());
        }
    }
}

fn copy_into_place(source: &Path, destination: &Path, expected: &Digest) -> Result<(), ModelError> {
    let parent = destination.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .map_err(|error| ModelError::io(format!("create {}", parent.display()), error))?;
    let temp = parent.join(format!(".register-{}.tmp", uuid::Uuid::new_v4()));
    fs::copy(source, &temp)
        .map_err(|error| ModelError::io(format!("copy {}", source.display()), error))?;
    match verify_or_discard(&temp, expected)
        .map_err(|error| ModelError::io("verify copied artifact", error))?
    {
        Verification::Match => promote(&temp, destination),
        Verification::Mismatch { expected, actual } => {
            Err(ModelError::ChecksumMismatch { expected, actual })
        }
    }
}

fn remove_artifact(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => {
            tracing::warn!("Failed to remove {}: {error:?}", path.display());
            return;
        }
    }
    if let Some(parent) = path.parent() {
        remove_if_empty(parent);
        if let Some(model_dir) = parent.parent() {
            remove_if_empty(model_dir);
        }
    }
}

fn remove_path(path: &Path) -> Result<(), ModelError> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|error| ModelError::io(format!("remove {}", path.display()), error))?;
    tracing::info!("Removed orphan artifact {}", path.display());
    Ok(())
}

fn list_dir_names(dir: &Path) -> io::Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(error),
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str().map(ToOwned::to_owned))
        .collect();
    names.sort();
    Ok(names)
}

fn absolute(path: &Path) -> Result<PathBuf, ModelError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = env::current_dir().map_err(|error| ModelError::io("resolve working directory", error))?;
    Ok(cwd.join(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(raw: &str) -> Version {
        Version::parse(raw).unwrap()
    }

    #[test]
    fn classifies_by_changed_component() {
        assert_eq!(UpdateKind::classify(&v("1.0.0"), &v("2.0.0"), false), UpdateKind::Major);
        assert_eq!(UpdateKind::classify(&v("1.0.0"), &v("1.1.0"), false), UpdateKind::Minor);
        assert_eq!(UpdateKind::classify(&v("1.0.0"), &v("1.0.1"), false), UpdateKind::Patch);
        assert_eq!(
            UpdateKind::classify(&v("1.0.0-rc.1"), &v("1.0.0"), false),
            UpdateKind::Patch
        );
        assert_eq!(UpdateKind::classify(&v("1.0.0"), &v("2.0.0"), true), UpdateKind::Security);
    }

    #[test]
    fn lock_entries_are_released_after_use() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            ModelLifecycleManager::new(ManagerConfig::with_models_dir(dir.path().join("models")))
                .unwrap();

        let held = manager.with_model_lock("phi", || manager.locks.lock().len());
        assert_eq!(held, 1);
        assert!(manager
            .install("no such model!", None, &v("1.0.0"), &CancellationToken::new())
            .is_err());
        assert!(manager.uninstall("phi").is_err());
        assert!(manager.locks.lock().is_empty());
    }

    #[test]
    fn failed_commit_leaves_destination_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("phi.onnx");
        fs::write(&destination, b"old weights").unwrap();
        let fetched = sibling_temp(&destination, "reinstall");
        fs::write(&fetched, b"new weights").unwrap();

        let error = commit_then_promote(
            &fetched,
            &destination,
            || Err(ModelError::io("write state", io::Error::new(io::ErrorKind::Other, "disk full"))),
            || panic!("nothing to undo"),
        )
        .unwrap_err();
        assert!(error.to_string().contains("disk full"));
        assert_eq!(fs::read(&destination).unwrap(), b"old weights");
        assert!(!fetched.exists());
    }

    #[test]
    fn failed_move_undoes_commit() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"").unwrap();
        let fetched = dir.path().join(".reinstall.tmp");
        fs::write(&fetched, b"new weights").unwrap();

        let mut undone = false;
        let result = commit_then_promote(
            &fetched,
            &blocker.join("phi.onnx"),
            || Ok(()),
            || undone = true,
        );
        assert!(result.is_err());
        assert!(undone);
        assert!(!fetched.exists());
    }

    #[test]
    fn layout_is_versioned() {
        let layout = ModelLayout::new(Path::new("/srv/models"));
        assert_eq!(
            layout.artifact_path("phi-3-mini", &v("1.1.0"), "phi.onnx"),
            PathBuf::from("/srv/models/artifacts/phi-3-mini/1.1.0/phi.onnx")
        );
        assert_eq!(
            layout.staging_path("phi-3-mini", &v("1.1.0")),
            PathBuf::from("/srv/models/staging/phi-3-mini-1.1.0.part")
        );
    }

    #[test]
    fn orphan_report_serializes_reason_inline() {
        let entry = OrphanedEntry {
            model_id: "phi".into(),
            installed: v("2.0.0"),
            reason: OrphanReason::AheadOfRegistry {
                registry_version: v("1.0.0"),
            },
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["reason"], "ahead-of-registry");
        assert_eq!(value["registry_version"], "1.0.0");
    }

    #[test]
    fn incompatible_host_lists_ranges() {
        let record: VersionRecord = Registry::from_json(
            br#"{
                "models": { "phi": {
                    "model_id": "phi", "name": "Phi", "description": "",
                    "current_version": "1.0.0",
                    "versions": { "1.0.0": {
                        "checksum": "sha256:0000000000000000000000000000000000000000000000000000000000000000",
                        "download_url": "https://example.invalid/phi.onnx",
                        "size_bytes": 10,
                        "compatibility": [">=2.0.0"]
                    } }
                } }
            }"#,
        )
        .unwrap()
        .resolve("phi", None)
        .unwrap()
        .clone();

        let error = ensure_compatible(&record, &v("1.5.0")).unwrap_err();
        match error {
            ModelError::IncompatibleVersion { ranges, .. } => {
                assert_eq!(ranges, vec![">=2.0.0".to_string()])
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(ensure_compatible(&record, &v("2.1.0")).is_ok());
    }
}
