use crossbeam_channel::Sender;
use semver::Version;
use serde::Serialize;

pub const EVENT_MODEL_STATUS: &str = "model-status";
pub const EVENT_MODEL_PROGRESS: &str = "model-progress";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum LifecycleState {
    NotInstalled,
    Downloading,
    Verifying,
    Installed { version: Version },
    Updating { from: Version, to: Version },
    Failed { reason: String, retryable: bool },
    RolledBack { version: Version },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ModelEvent {
    #[serde(rename = "model-status")]
    Status {
        model_id: String,
        #[serde(flatten)]
        state: LifecycleState,
    },
    #[serde(rename = "model-progress")]
    Progress {
        model_id: String,
        version: Version,
        downloaded: u64,
        total: u64,
    },
}

impl ModelEvent {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ModelEvent::Status { .. } => EVENT_MODEL_STATUS,
            ModelEvent::Progress { .. } => EVENT_MODEL_PROGRESS,
        }
    }

    #[must_use]
    pub fn model_id(&self) -> &str {
        match self {
            ModelEvent::Status { model_id, .. } | ModelEvent::Progress { model_id, .. } => {
                model_id
            }
        }
    }

    #[must_use]
    pub fn fraction(&self) -> Option<f32> {
        match self {
            ModelEvent::Progress {
                downloaded, total, ..
            } if *total > 0 => Some((*downloaded as f64 / *total as f64).clamp(0.0, 1.0) as f32),
            _ => None,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: ModelEvent);
}

pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: ModelEvent) {}
}

pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: ModelEvent) {
        match &event {
            ModelEvent::Status { model_id, state } => {
                tracing::info!("{model_id}: {state:?}");
            }
            ModelEvent::Progress { model_id, .. } => {
                if let Some(fraction) = event.fraction() {
                    tracing::debug!("{model_id}: {:.1}%", fraction * 100.0);
                }
            }
        }
    }
}

/// Forwards events into a channel. A disconnected receiver drops events silently.
pub struct ChannelSink {
    sender: Sender<ModelEvent>,
}

impl ChannelSink {
    pub fn new(sender: Sender<ModelEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: ModelEvent) {
        let _ = self.sender.send(event);
    }
}

pub fn emit_model_status(sink: &dyn EventSink, model_id: &str, state: LifecycleState) {
    sink.emit(ModelEvent::Status {
        model_id: model_id.to_string(),
        state,
    });
}

pub fn emit_model_progress(
    sink: &dyn EventSink,
    model_id: &str,
    version: &Version,
    downloaded: u64,
    total: u64,
) {
    sink.emit(ModelEvent::Progress {
        model_id: model_id.to_string(),
        version: version.clone(),
        downloaded,
        total,
    });
}
