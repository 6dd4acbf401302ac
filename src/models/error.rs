use std::{fmt, io, path::PathBuf};

use semver::Version;
use serde::Serialize;
use thiserror::Error;

use super::metadata::Digest;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("transient network failure after {attempts} attempt(s): {reason}")]
    Transient { attempts: u32, reason: String },
    #[error("server answered HTTP {status} for {url}")]
    ClientError { status: u16, url: String },
    #[error("invalid download url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("size mismatch: expected {expected} bytes, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("download cancelled; {bytes_on_disk} bytes kept for resume")]
    Cancelled { bytes_on_disk: u64 },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl DownloadError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        DownloadError::Io {
            context: context.into(),
            source,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DownloadError::Transient { .. } | DownloadError::Cancelled { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error(
        "insufficient space for snapshot under {}: need {required} bytes, {available} available",
        .path.display()
    )]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },
    #[error("no backup of {model_id} version {version}")]
    NotFound { model_id: String, version: Version },
    #[error("backup copy of {model_id} {version} is corrupt: expected {expected}, found {actual}")]
    Corrupt {
        model_id: String,
        version: Version,
        expected: Digest,
        actual: Digest,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl BackupError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        BackupError::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("registry {source_name} unreachable: {reason}")]
    RegistryUnreachable { source_name: String, reason: String },
    #[error("registry malformed: {reason}")]
    RegistryMalformed { reason: String },
    #[error("local state {} is corrupted: {reason}", .path.display())]
    StateCorrupted { path: PathBuf, reason: String },
    #[error(
        "version {version} is incompatible with host {host_version} (requires one of: {})",
        .ranges.join(" | ")
    )]
    IncompatibleVersion {
        version: Version,
        host_version: Version,
        ranges: Vec<String>,
    },
    #[error("download failed: {0}")]
    Download(#[from] DownloadError),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: Digest, actual: Digest },
    #[error("backup failed: {0}")]
    Backup(#[from] BackupError),
    #[error("no backup available to roll back to")]
    NoBackupAvailable,
    #[error("model is installed but no longer listed in the registry")]
    OrphanedModel,
    #[error("model is not listed in the registry")]
    UnknownModel,
    #[error("`{model_id}` is not a valid model id")]
    InvalidModelId { model_id: String },
    #[error("registry does not list version {version}")]
    UnknownVersion { version: Version },
    #[error("model is not installed")]
    NotInstalled,
    #[error("version {version} is already installed; use update or rollback")]
    AlreadyInstalled { version: Version },
    #[error("version {version} is already the installed version")]
    AlreadyAtVersion { version: Version },
    #[error("no newer version available (installed {installed}, registry offers {available})")]
    NoUpdateAvailable {
        installed: Version,
        available: Version,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl ModelError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        ModelError::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    RefreshRegistry,
    CheckUpdates,
    Install,
    Update,
    Rollback,
    Reinstall,
    RegisterLocal,
    Uninstall,
    Verify,
    Cleanup,
    MarkUsed,
    LoadState,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::RefreshRegistry => "refresh-registry",
            Operation::CheckUpdates => "check-updates",
            Operation::Install => "install",
            Operation::Update => "update",
            Operation::Rollback => "rollback",
            Operation::Reinstall => "reinstall",
            Operation::RegisterLocal => "register-local",
            Operation::Uninstall => "uninstall",
            Operation::Verify => "verify",
            Operation::Cleanup => "cleanup",
            Operation::MarkUsed => "mark-used",
            Operation::LoadState => "load-state",
        };
        f.write_str(name)
    }
}

/// A failed lifecycle operation, naming the model and the attempted step.
#[derive(Debug)]
pub struct LifecycleError {
    pub operation: Operation,
    pub model_id: Option<String>,
    pub kind: ModelError,
}

impl LifecycleError {
    pub fn new(operation: Operation, model_id: Option<&str>, kind: ModelError) -> Self {
        Self {
            operation,
            model_id: model_id.map(ToOwned::to_owned),
            kind,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &ModelError {
        &self.kind
    }
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.model_id {
            Some(model_id) => write!(f, "{} of {model_id} failed: {}", self.operation, self.kind),
            None => write!(f, "{} failed: {}", self.operation, self.kind),
        }
    }
}

impl std::error::Error for LifecycleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}
