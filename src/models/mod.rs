pub mod backup;
pub mod download;
pub mod error;
pub mod manager;
pub mod metadata;
pub mod registry;
pub mod service;
pub mod state;

pub use backup::{BackupManager, BackupRecord, FixedSpace, SpaceProbe, SystemSpaceProbe};
pub use download::{CancellationToken, DownloadEngine, DownloadOutcome, RetryPolicy};
pub use error::{BackupError, DownloadError, LifecycleError, ModelError, Operation};
pub use manager::{
    AvailableUpdate, CleanupReport, IntegrityReport, IntegrityStatus, ModelLayout,
    ModelLifecycleManager, OrphanReason, OrphanedEntry, UpdateKind, UpdateReport,
};
pub use metadata::{compute_sha256, Digest, Verification};
pub use registry::{ModelDescriptor, ModelVariant, Registry, RegistrySource, VersionRecord};
pub use service::{JobKind, JobOutcome, JobTicket, LifecycleJob, ModelUpdateService, SweepReport};
pub use state::{InstalledModel, LocalState, LocalStateStore};
