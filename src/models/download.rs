use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use reqwest::{
    blocking::{Client, Response},
    header::{CONTENT_RANGE, RANGE},
    StatusCode,
};

use super::error::DownloadError;
use crate::core::settings::DownloadSettings;

const CHUNK_SIZE: usize = 64 * 1024;
const CANCEL_POLL: Duration = Duration::from_millis(25);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

pub trait BackoffPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration;
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy for RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` unless cancelled first. Returns `true` when cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(CANCEL_POLL.min(deadline - now));
        }
    }
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, downloaded: u64, total: u64);
}

impl<F> ProgressSink for F
where
    F: Fn(u64, u64) + Send + Sync,
{
    fn on_progress(&self, downloaded: u64, total: u64) {
        self(downloaded, total)
    }
}

struct ProgressThrottle<'a> {
    sink: &'a dyn ProgressSink,
    interval: Duration,
    last_emit: Option<Instant>,
}

impl<'a> ProgressThrottle<'a> {
    fn new(sink: &'a dyn ProgressSink, interval: Duration) -> Self {
        Self {
            sink,
            interval,
            last_emit: None,
        }
    }

    fn offer(&mut self, downloaded: u64, total: u64) {
        let due = self
            .last_emit
            .map_or(true, |last| last.elapsed() >= self.interval);
        if due || downloaded >= total {
            self.emit(downloaded, total);
        }
    }

    fn emit(&mut self, downloaded: u64, total: u64) {
        self.sink.on_progress(downloaded, total);
        self.last_emit = Some(Instant::now());
    }
}

/// Admission gate capping how many downloads stream at once. Extra callers queue.
pub struct DownloadGate {
    permits: Receiver<()>,
    returns: Sender<()>,
}

pub struct DownloadPermit<'a> {
    gate: &'a DownloadGate,
}

impl DownloadGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (returns, permits) = bounded(capacity);
        for _ in 0..capacity {
            let _ = returns.send(());
        }
        Self { permits, returns }
    }

    pub fn acquire(&self, cancel: &CancellationToken) -> Option<DownloadPermit<'_>> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            match self.permits.recv_timeout(CANCEL_POLL) {
                Ok(()) => return Some(DownloadPermit { gate: self }),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.len()
    }
}

impl Drop for DownloadPermit<'_> {
    fn drop(&mut self) {
        let _ = self.gate.returns.send(());
    }
}

#[derive(Debug, Clone)]
pub struct DownloadRequest<'a> {
    pub url: &'a str,
    pub staging_path: &'a Path,
    pub expected_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub staging_path: PathBuf,
    pub bytes_downloaded: u64,
    pub resumed_from: u64,
    pub attempts: u32,
}

enum Failure {
    Transient(String),
    Fatal(DownloadError),
}

struct AttemptReport {
    bytes_downloaded: u64,
    resumed_from: u64,
}

pub struct DownloadEngine {
    client: Client,
    retry: RetryPolicy,
    gate: DownloadGate,
    progress_interval: Duration,
}

pub fn build_http_client(settings: &DownloadSettings) -> Result<Client, DownloadError> {
    // The blocking client applies `timeout` to every blocking wait, so it acts as a stall timeout.
    Client::builder()
        .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
        .timeout(Duration::from_secs(settings.stall_timeout_secs))
        .user_agent(concat!("yarn-models/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|error| {
            DownloadError::io(
                "create http client",
                io::Error::new(io::ErrorKind::Other, error),
            )
        })
}

impl DownloadEngine {
    pub fn new(settings: &DownloadSettings, max_concurrent: usize) -> Result<Self, DownloadError> {
        let client = build_http_client(settings)?;
        Ok(Self::with_client(
            client,
            settings.retry_policy(),
            max_concurrent,
            Duration::from_millis(settings.progress_interval_ms),
        ))
    }

    pub fn with_client(
        client: Client,
        retry: RetryPolicy,
        max_concurrent: usize,
        progress_interval: Duration,
    ) -> Self {
        Self {
            client,
            retry,
            gate: DownloadGate::new(max_concurrent),
            progress_interval,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn gate(&self) -> &DownloadGate {
        &self.gate
    }

    /// Streams `request.url` into the staging path, resuming a partial file when the server
    /// honours range requests. The staged file is exactly `expected_size` bytes on success.
    pub fn download(
        &self,
        request: &DownloadRequest<'_>,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, DownloadError> {
        let Some(_permit) = self.gate.acquire(cancel) else {
            return Err(DownloadError::Cancelled {
                bytes_on_disk: staged_len(request.staging_path),
            });
        };

        if let Some(parent) = request.staging_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|error| DownloadError::io("create staging directory", error))?;
        }

        let mut throttle = ProgressThrottle::new(progress, self.progress_interval);
        let mut attempt = 0u32;
        let mut bytes_downloaded = 0u64;
        let mut resumed_from = 0u64;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled {
                    bytes_on_disk: staged_len(request.staging_path),
                });
            }

            match self.attempt(request, &mut throttle, cancel) {
                Ok(report) => {
                    bytes_downloaded += report.bytes_downloaded;
                    resumed_from = report.resumed_from;
                    break;
                }
                Err(Failure::Fatal(error)) => return Err(error),
                Err(Failure::Transient(reason)) => {
                    if attempt >= self.retry.max_attempts {
                        tracing::warn!(
                            "Giving up on {} after {attempt} attempt(s): {reason}",
                            request.url
                        );
                        return Err(DownloadError::Transient {
                            attempts: attempt,
                            reason,
                        });
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        "Download attempt {attempt} for {} failed: {reason}; retrying in {delay:?}",
                        request.url
                    );
                    if cancel.sleep(delay) {
                        return Err(DownloadError::Cancelled {
                            bytes_on_disk: staged_len(request.staging_path),
                        });
                    }
                }
            }
        }

        let size = fs::metadata(request.staging_path)
            .map_err(|error| DownloadError::io("stat staged download", error))?
            .len();
        if size != request.expected_size {
            discard(request.staging_path);
            return Err(DownloadError::SizeMismatch {
                expected: request.expected_size,
                actual: size,
            });
        }

        Ok(DownloadOutcome {
            staging_path: request.staging_path.to_path_buf(),
            bytes_downloaded,
            resumed_from,
            attempts: attempt,
        })
    }

    fn attempt(
        &self,
        request: &DownloadRequest<'_>,
        throttle: &mut ProgressThrottle<'_>,
        cancel: &CancellationToken,
    ) -> Result<AttemptReport, Failure> {
        let expected = request.expected_size;
        let mut existing = staged_len(request.staging_path);
        if existing > expected {
            tracing::warn!(
                "Staged file {} is larger than expected ({existing} > {expected}); restarting",
                request.staging_path.display()
            );
            discard(request.staging_path);
            existing = 0;
        }
        if existing == expected {
            throttle.emit(existing, expected);
            return Ok(AttemptReport {
                bytes_downloaded: 0,
                resumed_from: existing,
            });
        }

        let mut builder = self.client.get(request.url);
        if existing > 0 {
            builder = builder.header(RANGE, format!("bytes={existing}-"));
        }
        let mut response = builder.send().map_err(|error| classify_send_error(request.url, error))?;
        let status = response.status();

        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            discard(request.staging_path);
            return Err(Failure::Transient(format!(
                "server rejected resume at byte {existing}; restarting from zero"
            )));
        }
        if !status.is_success() {
            return Err(classify_status(request.url, status));
        }

        let resumed = existing > 0 && status == StatusCode::PARTIAL_CONTENT;
        if existing > 0 && !resumed {
            tracing::info!(
                "Server ignored range request for {}; restarting download",
                request.url
            );
        }
        if resumed {
            let start = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(content_range_start);
            if start != Some(existing) {
                discard(request.staging_path);
                return Err(Failure::Transient(format!(
                    "server resumed at {start:?} instead of byte {existing}; restarting from zero"
                )));
            }
        }
        let offset = if resumed { existing } else { 0 };
        if resumed {
            tracing::info!("Resuming {} from byte {offset}", request.url);
        }

        let mut file = open_staging(request.staging_path, resumed)
            .map_err(|error| Failure::Fatal(DownloadError::io("open staging file", error)))?;
        let written = stream_body(&mut response, &mut file, offset, expected, throttle, cancel);
        let sync = file.flush().and_then(|()| file.sync_all());
        drop(file);

        let downloaded = match written {
            Ok(downloaded) => downloaded,
            Err(StreamError::Cancelled(on_disk)) => {
                tracing::info!(
                    "Download of {} cancelled at byte {on_disk}; partial file kept",
                    request.url
                );
                return Err(Failure::Fatal(DownloadError::Cancelled {
                    bytes_on_disk: on_disk,
                }));
            }
            Err(StreamError::Oversized(actual)) => {
                discard(request.staging_path);
                return Err(Failure::Fatal(DownloadError::SizeMismatch {
                    expected,
                    actual,
                }));
            }
            Err(StreamError::Write(error)) => {
                return Err(Failure::Fatal(DownloadError::io("write download chunk", error)))
            }
            Err(StreamError::Read(error, on_disk)) => {
                return Err(Failure::Transient(format!(
                    "connection interrupted at byte {on_disk}: {error}"
                )))
            }
        };
        sync.map_err(|error| Failure::Fatal(DownloadError::io("flush staging file", error)))?;

        if downloaded < expected {
            return Err(Failure::Transient(format!(
                "connection closed after {downloaded} of {expected} bytes"
            )));
        }
        Ok(AttemptReport {
            bytes_downloaded: downloaded - offset,
            resumed_from: offset,
        })
    }
}

enum StreamError {
    Cancelled(u64),
    Oversized(u64),
    Write(io::Error),
    Read(io::Error, u64),
}

fn stream_body(
    response: &mut Response,
    file: &mut File,
    offset: u64,
    expected: u64,
    throttle: &mut ProgressThrottle<'_>,
    cancel: &CancellationToken,
) -> Result<u64, StreamError> {
    let mut downloaded = offset;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        if cancel.is_cancelled() {
            return Err(StreamError::Cancelled(downloaded));
        }
        let read = match response.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(StreamError::Read(error, downloaded)),
        };
        if downloaded + read as u64 > expected {
            return Err(StreamError::Oversized(downloaded + read as u64));
        }
        file.write_all(&buffer[..read]).map_err(StreamError::Write)?;
        downloaded += read as u64;
        throttle.offer(downloaded, expected);
    }
    Ok(downloaded)
}

fn open_staging(path: &Path, append: bool) -> io::Result<File> {
    if append {
        OpenOptions::new().append(true).open(path)
    } else {
        File::create(path)
    }
}

fn classify_send_error(url: &str, error: reqwest::Error) -> Failure {
    if error.is_builder() {
        return Failure::Fatal(DownloadError::InvalidUrl {
            url: url.to_string(),
            reason: error.to_string(),
        });
    }
    if let Some(status) = error.status() {
        return classify_status(url, status);
    }
    Failure::Transient(error.to_string())
}

fn classify_status(url: &str, status: StatusCode) -> Failure {
    if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
        Failure::Fatal(DownloadError::ClientError {
            status: status.as_u16(),
            url: url.to_string(),
        })
    } else {
        Failure::Transient(format!("HTTP {status}"))
    }
}

/// First byte position of a `Content-Range: bytes <start>-<end>/<total>` value.
fn content_range_start(value: &str) -> Option<u64> {
    let (start, _) = value.trim().strip_prefix("bytes ")?.split_once('-')?;
    start.trim().parse().ok()
}

pub fn staged_len(path: &Path) -> u64 {
    fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

fn discard(path: &Path) {
    if let Err(error) = fs::remove_file(path) {
        if error.kind() != io::ErrorKind::NotFound {
            tracing::warn!("Failed to discard staged file {}: {error:?}", path.display());
        }
    }
}
