#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
};

use semver::Version;
use serde_json::{json, Map, Value};
use sha2::{Digest as _, Sha256};
use tempfile::TempDir;
use tiny_http::{Header, Response, Server};

use yarn_models::{
    core::{
        events::{EventSink, LifecycleState, ModelEvent},
        settings::{DownloadSettings, ManagerConfig},
    },
    models::{FixedSpace, ModelLifecycleManager},
};

#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Status(u16),
    /// Serves only the first `n` bytes of the requested range as a complete response.
    Truncate(usize),
    /// Answers a range request with a 206 that starts at this offset instead.
    RangeFrom(usize),
}

#[derive(Default)]
struct ServerState {
    files: HashMap<String, Vec<u8>>,
    no_ranges: HashSet<String>,
    faults: HashMap<String, VecDeque<Fault>>,
    hits: HashMap<String, Vec<Option<String>>>,
}

/// Local HTTP server with byte-range support and scripted failures.
pub struct ArtifactServer {
    base: String,
    server: Arc<Server>,
    state: Arc<Mutex<ServerState>>,
    handle: Option<JoinHandle<()>>,
}

impl ArtifactServer {
    pub fn start() -> Self {
        let server = Arc::new(Server::http("127.0.0.1:0").expect("bind test server"));
        let addr = server.server_addr().to_ip().expect("ip listener");
        let state = Arc::new(Mutex::new(ServerState::default()));

        let handle = {
            let server = server.clone();
            let state = state.clone();
            thread::spawn(move || {
                for request in server.incoming_requests() {
                    let path = request.url().to_string();
                    let range = request
                        .headers()
                        .iter()
                        .find(|header| header.field.equiv("Range"))
                        .map(|header| header.value.as_str().to_string());
                    let response = respond_to(&state, &path, range);
                    let _ = request.respond(response);
                }
            })
        };

        Self {
            base: format!("http://{addr}"),
            server,
            state,
            handle: Some(handle),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub fn serve(&self, path: &str, bytes: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), bytes.to_vec());
    }

    pub fn without_ranges(&self, path: &str) {
        self.state
            .lock()
            .unwrap()
            .no_ranges
            .insert(path.to_string());
    }

    pub fn script(&self, path: &str, faults: impl IntoIterator<Item = Fault>) {
        self.state
            .lock()
            .unwrap()
            .faults
            .entry(path.to_string())
            .or_default()
            .extend(faults);
    }

    /// Range headers of every request made for `path`, in order.
    pub fn hits(&self, path: &str) -> Vec<Option<String>> {
        self.state
            .lock()
            .unwrap()
            .hits
            .get(path)
            .cloned()
            .unwrap_or_default()
    }
}

impl Drop for ArtifactServer {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn respond_to(
    state: &Mutex<ServerState>,
    path: &str,
    range: Option<String>,
) -> Response<std::io::Cursor<Vec<u8>>> {
    let mut state = state.lock().unwrap();
    state
        .hits
        .entry(path.to_string())
        .or_default()
        .push(range.clone());

    let fault = state.faults.get_mut(path).and_then(VecDeque::pop_front);
    if let Some(Fault::Status(code)) = fault {
        return Response::from_data(Vec::new()).with_status_code(code);
    }
    let Some(bytes) = state.files.get(path).cloned() else {
        return Response::from_data(Vec::new()).with_status_code(404);
    };

    let offset = if state.no_ranges.contains(path) {
        None
    } else {
        match (fault, range.as_deref().and_then(parse_range_start)) {
            (Some(Fault::RangeFrom(start)), Some(_)) => Some(start),
            (_, requested) => requested,
        }
    };

    let (status, mut body, content_range) = match offset {
        Some(start) if start >= bytes.len() => {
            let header = format!("bytes */{}", bytes.len());
            return Response::from_data(Vec::new())
                .with_status_code(416)
                .with_header(header_of("Content-Range", &header));
        }
        Some(start) => (
            206,
            bytes[start..].to_vec(),
            Some(format!("bytes {start}-{}/{}", bytes.len() - 1, bytes.len())),
        ),
        None => (200, bytes, None),
    };
    if let Some(Fault::Truncate(limit)) = fault {
        body.truncate(limit);
    }

    let mut response = Response::from_data(body)
        .with_status_code(status)
        .with_header(header_of("Accept-Ranges", "bytes"));
    if let Some(value) = content_range {
        response = response.with_header(header_of("Content-Range", &value));
    }
    response
}

fn parse_range_start(value: &str) -> Option<usize> {
    value
        .strip_prefix("bytes=")?
        .strip_suffix('-')?
        .parse()
        .ok()
}

fn header_of(name: &str, value: &str) -> Header {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).expect("valid header")
}

/// Deterministic artifact content; different seeds give different bytes.
pub fn artifact_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i * 31 + seed as usize * 7) % 251) as u8)
        .collect()
}

pub fn sha256(bytes: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(bytes))
}

pub fn artifact_path(model_id: &str, version: &str) -> String {
    format!("/{model_id}/{version}/{model_id}.onnx")
}

#[derive(Default)]
pub struct RegistryBuilder {
    models: Map<String, Value>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `bytes` and lists them as `version`; the last release of a model is current.
    pub fn release(self, server: &ArtifactServer, model_id: &str, version: &str, bytes: &[u8]) -> Self {
        self.release_with(server, model_id, version, bytes, |_| {})
    }

    pub fn release_with(
        mut self,
        server: &ArtifactServer,
        model_id: &str,
        version: &str,
        bytes: &[u8],
        tweak: impl FnOnce(&mut Value),
    ) -> Self {
        let path = artifact_path(model_id, version);
        server.serve(&path, bytes);
        let mut entry = json!({
            "checksum": sha256(bytes),
            "download_url": server.url(&path),
            "size_bytes": bytes.len(),
            "compatibility": [">=0.1.0"],
            "release_date": "2026-01-15",
            "changelog": format!("{model_id} {version}"),
            "variant": "fp16"
        });
        tweak(&mut entry);

        let model = self.models.entry(model_id.to_string()).or_insert_with(|| {
            json!({
                "model_id": model_id,
                "name": model_id,
                "description": "test model",
                "versions": {},
                "tags": ["test"],
                "category": "llm"
            })
        });
        model["current_version"] = json!(version);
        model["versions"][version] = entry;
        self
    }

    pub fn current(mut self, model_id: &str, version: &str) -> Self {
        if let Some(model) = self.models.get_mut(model_id) {
            model["current_version"] = json!(version);
        }
        self
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec_pretty(&json!({
            "registry_version": "1",
            "last_updated": "2026-01-15T00:00:00Z",
            "models": self.models
        }))
        .unwrap()
    }

    pub fn write(&self, path: &Path) {
        fs::write(path, self.to_json()).unwrap();
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ModelEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ModelEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn states(&self, model_id: &str) -> Vec<LifecycleState> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ModelEvent::Status { model_id: id, state } if id == model_id => Some(state),
                _ => None,
            })
            .collect()
    }

    pub fn progress_count(&self, model_id: &str) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, ModelEvent::Progress { .. }) && event.model_id() == model_id)
            .count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: ModelEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub server: ArtifactServer,
    pub events: Arc<RecordingSink>,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            server: ArtifactServer::start(),
            events: Arc::new(RecordingSink::default()),
        }
    }

    pub fn models_dir(&self) -> PathBuf {
        self.dir.path().join("models")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.dir.path().join("registry.json")
    }

    pub fn config(&self) -> ManagerConfig {
        ManagerConfig {
            registry_url: Some(self.registry_path().display().to_string()),
            backup_headroom_bytes: 0,
            download: DownloadSettings {
                max_attempts: 4,
                base_backoff_ms: 10,
                max_backoff_ms: 40,
                connect_timeout_secs: 5,
                stall_timeout_secs: 5,
                progress_interval_ms: 0,
            },
            ..ManagerConfig::with_models_dir(self.models_dir())
        }
    }

    pub fn publish(&self, registry: &RegistryBuilder) {
        registry.write(&self.registry_path());
    }

    pub fn manager(&self) -> ModelLifecycleManager {
        self.manager_with(self.config())
    }

    pub fn manager_with(&self, config: ManagerConfig) -> ModelLifecycleManager {
        ModelLifecycleManager::new(config)
            .unwrap()
            .with_space_probe(Box::new(FixedSpace(u64::MAX)))
            .with_event_sink(self.events.clone())
    }
}

pub fn host() -> Version {
    Version::new(1, 0, 0)
}

pub fn v(raw: &str) -> Version {
    Version::parse(raw).unwrap()
}
