use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use semver::Version;
use serde::Serialize;

use super::{
    download::CancellationToken,
    error::LifecycleError,
    manager::{ModelLifecycleManager, OrphanedEntry},
    state::InstalledModel,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    Install { version: Option<Version> },
    Update { version: Option<Version> },
    Rollback { version: Option<Version> },
    Reinstall,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleJob {
    pub model_id: String,
    pub kind: JobKind,
}

impl LifecycleJob {
    pub fn update(model_id: impl Into<String>, version: Option<Version>) -> Self {
        Self {
            model_id: model_id.into(),
            kind: JobKind::Update { version },
        }
    }
}

#[derive(Debug)]
pub struct JobOutcome {
    pub job: LifecycleJob,
    pub result: Result<InstalledModel, LifecycleError>,
}

struct Envelope {
    job: LifecycleJob,
    reply: Sender<JobOutcome>,
}

pub struct JobTicket {
    model_id: String,
    receiver: Receiver<JobOutcome>,
}

impl JobTicket {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Blocks until a worker finishes the job.
    pub fn wait(self) -> Result<JobOutcome> {
        self.receiver
            .recv()
            .with_context(|| format!("worker dropped job for {}", self.model_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepFailure {
    pub model_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub updated: Vec<InstalledModel>,
    pub failed: Vec<SweepFailure>,
    pub orphaned: Vec<OrphanedEntry>,
}

/// Runs lifecycle jobs on a fixed pool of worker threads. Per-model ordering is enforced by
/// the manager, so jobs for different models run side by side.
pub struct ModelUpdateService {
    manager: Arc<ModelLifecycleManager>,
    sender: Option<Sender<Envelope>>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl ModelUpdateService {
    pub fn new(manager: Arc<ModelLifecycleManager>, host: Version, workers: usize) -> Result<Self> {
        let (sender, receiver) = unbounded::<Envelope>();
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();
        for index in 0..workers.max(1) {
            let receiver = receiver.clone();
            let manager = manager.clone();
            let host = host.clone();
            let cancel = cancel.clone();
            let handle = thread::Builder::new()
                .name(format!("model-worker-{index}"))
                .spawn(move || worker_loop(receiver, manager, host, cancel))
                .context("spawn model worker")?;
            handles.push(handle);
        }
        Ok(Self {
            manager,
            sender: Some(sender),
            workers: handles,
            cancel,
        })
    }

    pub fn manager(&self) -> &Arc<ModelLifecycleManager> {
        &self.manager
    }

    pub fn submit(&self, job: LifecycleJob) -> Result<JobTicket> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("model job queue is shut down"))?;
        let (reply, receiver) = bounded(1);
        let model_id = job.model_id.clone();
        sender
            .send(Envelope { job, reply })
            .map_err(|_| anyhow!("model job queue is closed"))?;
        Ok(JobTicket { model_id, receiver })
    }

    /// Checks for updates and applies every one. A failing model is recorded and the
    /// sweep carries on with the rest.
    pub fn update_all(&self) -> Result<SweepReport> {
        let report = self.manager.check_for_updates()?;
        let mut sweep = SweepReport {
            orphaned: report.orphaned,
            ..SweepReport::default()
        };

        let tickets = report
            .updates
            .into_iter()
            .map(|update| self.submit(LifecycleJob::update(update.model_id, Some(update.to))))
            .collect::<Result<Vec<_>>>()?;

        for ticket in tickets {
            let model_id = ticket.model_id().to_string();
            match ticket.wait() {
                Ok(JobOutcome { result: Ok(installed), .. }) => sweep.updated.push(installed),
                Ok(JobOutcome { result: Err(error), .. }) => sweep.failed.push(SweepFailure {
                    model_id,
                    error: error.to_string(),
                }),
                Err(error) => sweep.failed.push(SweepFailure {
                    model_id,
                    error: format!("{error:#}"),
                }),
            }
        }

        tracing::info!(
            "Update sweep finished: {} updated, {} failed",
            sweep.updated.len(),
            sweep.failed.len()
        );
        Ok(sweep)
    }

    /// Cancels running downloads and every job still queued. Partial files are kept.
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("Model worker panicked");
            }
        }
    }
}

impl Drop for ModelUpdateService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    receiver: Receiver<Envelope>,
    manager: Arc<ModelLifecycleManager>,
    host: Version,
    cancel: CancellationToken,
) {
    for Envelope { job, reply } in receiver.iter() {
        tracing::debug!("Running {:?} for {}", job.kind, job.model_id);
        let result = run_job(&manager, &job, &host, &cancel);
        let _ = reply.send(JobOutcome { job, result });
    }
}

fn run_job(
    manager: &ModelLifecycleManager,
    job: &LifecycleJob,
    host: &Version,
    cancel: &CancellationToken,
) -> Result<InstalledModel, LifecycleError> {
    let model_id = job.model_id.as_str();
    match &job.kind {
        JobKind::Install { version } => manager.install(model_id, version.as_ref(), host, cancel),
        JobKind::Update { version } => manager.update(model_id, version.as_ref(), host, cancel),
        JobKind::Rollback { version } => manager.rollback(model_id, version.as_ref()),
        JobKind::Reinstall => manager.reinstall(model_id, cancel),
    }
}
