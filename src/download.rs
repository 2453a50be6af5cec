//! Resumable model downloads with progress, ETA and manifest handoff.
//!
//! One transfer per model id. Bytes land in `{destination}.part`; the part file
//! is only renamed into place once the length and signature checks pass, and
//! the manifest entry is added after the rename. A cancelled or interrupted
//! transfer keeps a [`ResumeToken`] in memory so `resume` can continue it with a
//! range request.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use futures_util::StreamExt;

use crate::catalog::{resolve_download_url, select_weight_file, RemoteModel};
use crate::config::Config;
use crate::error::DownloadError;
use crate::manifest::{ManifestEntry, ManifestStore};
use crate::transport::{FetchRequest, FetchResponse, Fetcher};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "camelCase")]
pub enum DownloadStatus {
    Idle,
    Running,
    Completed,
    Failed(String),
    Cancelled,
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed(_) | DownloadStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadState {
    pub bytes_written: u64,
    pub total_bytes: u64,
    pub progress: f64,
    pub eta_seconds: f64,
    pub status: DownloadStatus,
}

impl Default for DownloadState {
    fn default() -> Self {
        Self {
            bytes_written: 0,
            total_bytes: 0,
            progress: 0.0,
            eta_seconds: 0.0,
            status: DownloadStatus::Idle,
        }
    }
}

/// Everything needed to continue a transfer where it stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeToken {
    pub url: String,
    pub auth_token: Option<String>,
    pub part_path: PathBuf,
    pub destination: PathBuf,
    pub offset: u64,
    pub validator: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Started { id: String },
    Progress { id: String, state: DownloadState },
    Finished { id: String, status: DownloadStatus },
}

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub models_root: PathBuf,
    pub catalog_base_url: String,
    pub stall_timeout: Duration,
    pub progress_interval: Duration,
}

impl DownloadSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            models_root: config.models_root.clone(),
            catalog_base_url: config.catalog_base_url.clone(),
            stall_timeout: config.stall_timeout,
            progress_interval: config.progress_interval,
        }
    }
}

/// Progress and ETA from the most recent sample, with notification throttling.
///
/// Instants are passed in so the arithmetic can be driven deterministically.
pub struct ProgressTracker {
    total: u64,
    last_bytes: u64,
    last_at: Instant,
    eta: f64,
    interval: Duration,
    last_notified: Option<Instant>,
}

impl ProgressTracker {
    pub fn new(total: u64, start_bytes: u64, now: Instant, interval: Duration) -> Self {
        Self {
            total,
            last_bytes: start_bytes,
            last_at: now,
            eta: 0.0,
            interval,
            last_notified: None,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Returns `(progress, eta_seconds)` after `written` bytes at `now`.
    pub fn record(&mut self, written: u64, now: Instant) -> (f64, f64) {
        let dt = now
            .saturating_duration_since(self.last_at)
            .as_secs_f64()
            .max(0.001);
        let delta = written.saturating_sub(self.last_bytes);
        if delta > 0 {
            let rate = delta as f64 / dt;
            let remaining = self.total.saturating_sub(written) as f64;
            self.eta = remaining / rate.max(f64::EPSILON);
        }
        self.last_at = now;
        self.last_bytes = written;
        (self.progress(written), self.eta)
    }

    pub fn progress(&self, written: u64) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (written as f64 / self.total as f64).min(1.0)
        }
    }

    /// At most one `true` per interval.
    pub fn should_notify(&mut self, now: Instant) -> bool {
        match self.last_notified {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_notified = Some(now);
                true
            }
        }
    }
}

/// Filesystem-safe directory name for a catalog id.
pub fn sanitize_id(id: &str) -> String {
    let out = id.trim().replace(['/', '\\'], "_");
    if out.is_empty() || out.chars().all(|c| c == '.') {
        format!("_{out}")
    } else {
        out
    }
}

/// `{models_root}/{sanitizedId}/{filename}`
pub fn destination_path(models_root: &Path, id: &str, filename: &str) -> PathBuf {
    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .unwrap_or("model.bin");
    models_root.join(sanitize_id(id)).join(name)
}

fn part_path_for(destination: &Path) -> PathBuf {
    let mut s = destination.as_os_str().to_owned();
    s.push(".part");
    PathBuf::from(s)
}

fn file_starts_with(path: &Path, magic: &[u8]) -> bool {
    use std::io::Read;
    let mut buf = vec![0u8; magic.len()];
    match std::fs::File::open(path) {
        Ok(mut f) => f.read_exact(&mut buf).is_ok() && buf == magic,
        Err(_) => false,
    }
}

fn is_gguf(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("gguf"))
        .unwrap_or(false)
}

enum Interrupted {
    Cancelled,
    Failed { reason: String, resumable: bool },
}

impl Interrupted {
    fn resumable(reason: impl Into<String>) -> Self {
        Interrupted::Failed {
            reason: reason.into(),
            resumable: true,
        }
    }

    fn fatal(reason: impl Into<String>) -> Self {
        Interrupted::Failed {
            reason: reason.into(),
            resumable: false,
        }
    }
}

struct ActiveTransfer {
    run_id: u64,
    cancel: CancellationToken,
    done: CancellationToken,
}

#[derive(Default)]
struct Table {
    states: HashMap<String, DownloadState>,
    active: HashMap<String, ActiveTransfer>,
    resume: HashMap<String, ResumeToken>,
    /// Files on disk whose manifest registration failed.
    unregistered: HashMap<String, PathBuf>,
    next_run: u64,
}

struct Inner {
    fetcher: Arc<dyn Fetcher>,
    manifest: Arc<ManifestStore>,
    settings: DownloadSettings,
    table: Mutex<Table>,
    events: broadcast::Sender<DownloadEvent>,
}

#[derive(Clone)]
pub struct DownloadCoordinator {
    inner: Arc<Inner>,
}

impl DownloadCoordinator {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        manifest: Arc<ManifestStore>,
        settings: DownloadSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                fetcher,
                manifest,
                settings,
                table: Mutex::new(Table::default()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self, id: &str) -> Option<DownloadState> {
        self.inner.table.lock().states.get(id).cloned()
    }

    pub fn states(&self) -> HashMap<String, DownloadState> {
        self.inner.table.lock().states.clone()
    }

    pub fn is_downloading(&self, id: &str) -> bool {
        self.inner.table.lock().active.contains_key(id)
    }

    pub fn resume_token(&self, id: &str) -> Option<ResumeToken> {
        self.inner.table.lock().resume.get(id).cloned()
    }

    /// Begin a fresh transfer of the first weight file of `model`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        &self,
        model: &RemoteModel,
        auth_token: Option<String>,
    ) -> Result<(), DownloadError> {
        let id = model.id.clone();
        if self.is_downloading(&id) {
            return Err(DownloadError::AlreadyRunning(id));
        }
        let file = select_weight_file(model)
            .ok_or_else(|| DownloadError::NoCompatibleFile(id.clone()))?;
        let settings = &self.inner.settings;
        let url = resolve_download_url(&settings.catalog_base_url, &id, &file.rfilename)?;
        let destination = destination_path(&settings.models_root, &id, &file.rfilename);

        let token = ResumeToken {
            url: url.to_string(),
            auth_token: auth_token.filter(|t| !t.trim().is_empty()),
            part_path: part_path_for(&destination),
            destination,
            offset: 0,
            validator: None,
        };
        log::info!("[download] starting {} -> {}", id, token.destination.display());
        self.spawn(id, token, true)
    }

    /// Continue a cancelled or interrupted transfer. `Ok(false)` when there is
    /// nothing to resume.
    pub fn resume(&self, id: &str) -> Result<bool, DownloadError> {
        let token = {
            let mut table = self.inner.table.lock();
            if table.active.contains_key(id) {
                return Err(DownloadError::AlreadyRunning(id.to_string()));
            }
            table.resume.remove(id)
        };
        match token {
            Some(token) => {
                log::info!("[download] resuming {} at byte {}", id, token.offset);
                self.spawn(id.to_string(), token, false)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Request cancellation. The transfer reports `Cancelled` once it stops.
    pub fn cancel(&self, id: &str) -> bool {
        let table = self.inner.table.lock();
        match table.active.get(id) {
            Some(active) => {
                active.cancel.cancel();
                log::info!("[download] cancel requested for {}", id);
                true
            }
            None => false,
        }
    }

    /// Wait for the running transfer of `id` to end and return its final state.
    pub async fn wait(&self, id: &str) -> Option<DownloadState> {
        let done = self
            .inner
            .table
            .lock()
            .active
            .get(id)
            .map(|a| a.done.clone());
        if let Some(done) = done {
            done.cancelled().await;
        }
        self.state(id)
    }

    /// Add an already downloaded file to the manifest after a failed registration.
    pub fn retry_registration(&self, id: &str) -> Result<(), DownloadError> {
        let path = {
            let table = self.inner.table.lock();
            if table.active.contains_key(id) {
                return Err(DownloadError::AlreadyRunning(id.to_string()));
            }
            table.unregistered.get(id).cloned()
        };
        let path = match path {
            Some(p) if p.is_file() => p,
            _ => {
                self.inner.table.lock().unregistered.remove(id);
                return Err(DownloadError::NotRegistrable(id.to_string()));
            }
        };

        self.inner.manifest.add(ManifestEntry::new(id, &path))?;
        {
            let mut table = self.inner.table.lock();
            table.unregistered.remove(id);
            let state = table.states.entry(id.to_string()).or_default();
            state.status = DownloadStatus::Completed;
            state.progress = 1.0;
        }
        log::info!("[download] registered {} on retry", id);
        let _ = self.inner.events.send(DownloadEvent::Finished {
            id: id.to_string(),
            status: DownloadStatus::Completed,
        });
        Ok(())
    }

    fn spawn(&self, id: String, token: ResumeToken, fresh: bool) -> Result<(), DownloadError> {
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let run_id = {
            let mut table = self.inner.table.lock();
            if table.active.contains_key(&id) {
                return Err(DownloadError::AlreadyRunning(id));
            }
            table.next_run += 1;
            let run_id = table.next_run;
            if fresh {
                table.resume.remove(&id);
                table.unregistered.remove(&id);
            }
            table.active.insert(
                id.clone(),
                ActiveTransfer {
                    run_id,
                    cancel: cancel.clone(),
                    done: done.clone(),
                },
            );
            let previous = table.states.get(&id).cloned().unwrap_or_default();
            table.states.insert(
                id.clone(),
                DownloadState {
                    bytes_written: token.offset,
                    total_bytes: if fresh { 0 } else { previous.total_bytes },
                    progress: if fresh { 0.0 } else { previous.progress },
                    eta_seconds: 0.0,
                    status: DownloadStatus::Running,
                },
            );
            run_id
        };
        let _ = self.inner.events.send(DownloadEvent::Started { id: id.clone() });

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut token = token;
            let result = inner.transfer(&id, &mut token, &cancel).await;
            inner.finish(&id, token, result, run_id);
            done.cancel();
        });
        Ok(())
    }
}

impl Inner {
    async fn transfer(
        &self,
        id: &str,
        token: &mut ResumeToken,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, Interrupted> {
        if let Some(parent) = token.destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Interrupted::fatal(format!("mkdir failed: {e}")))?;
        }

        // The part file is the source of truth for how much we have.
        let on_disk = tokio::fs::metadata(&token.part_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if on_disk != token.offset {
            if token.offset > 0 {
                log::warn!(
                    "[download] {} part file has {} bytes, expected {}; restarting",
                    id,
                    on_disk,
                    token.offset
                );
            }
            token.offset = 0;
            token.validator = None;
        }

        let request = FetchRequest {
            url: token.url.clone(),
            auth_token: token.auth_token.clone(),
            offset: token.offset,
            validator: token.validator.clone(),
        };
        let stall = self.settings.stall_timeout;
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Interrupted::Cancelled),
            opened = tokio::time::timeout(stall, self.fetcher.open(&request)) => match opened {
                Ok(opened) => opened.map_err(|e| Interrupted::resumable(e.to_string()))?,
                Err(_) => {
                    return Err(Interrupted::resumable(format!(
                        "stalled: no response for {stall:?}"
                    )))
                }
            },
        };
        let FetchResponse {
            total_bytes,
            resumed,
            validator,
            mut body,
        } = response;

        if !resumed {
            token.offset = 0;
        }
        if validator.is_some() || !resumed {
            token.validator = validator;
        }

        let opened = if resumed {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&token.part_path)
                .await
        } else {
            tokio::fs::File::create(&token.part_path).await
        };
        let mut file = opened.map_err(|e| {
            Interrupted::fatal(format!("open {} failed: {e}", token.part_path.display()))
        })?;

        let mut tracker = ProgressTracker::new(
            total_bytes.unwrap_or(0),
            token.offset,
            Instant::now(),
            self.settings.progress_interval,
        );
        self.record_progress(id, &mut tracker, token.offset, Instant::now());

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = file.flush().await;
                    return Err(Interrupted::Cancelled);
                }
                next = tokio::time::timeout(stall, body.next()) => next,
            };
            let chunk = match next {
                Err(_) => {
                    let _ = file.flush().await;
                    return Err(Interrupted::resumable(format!(
                        "stalled: no data for {stall:?}"
                    )));
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    let _ = file.flush().await;
                    return Err(Interrupted::resumable(e.to_string()));
                }
                Ok(Some(Ok(chunk))) => chunk,
            };
            if let Err(e) = file.write_all(&chunk).await {
                return Err(Interrupted::fatal(format!("write failed: {e}")));
            }
            token.offset += chunk.len() as u64;
            self.record_progress(id, &mut tracker, token.offset, Instant::now());
        }

        file.flush()
            .await
            .map_err(|e| Interrupted::fatal(format!("write failed: {e}")))?;
        drop(file);

        if let Some(total) = total_bytes {
            if token.offset != total {
                let resumable = token.offset < total;
                if !resumable {
                    let _ = tokio::fs::remove_file(&token.part_path).await;
                }
                return Err(Interrupted::Failed {
                    reason: format!("incomplete download ({}/{})", token.offset, total),
                    resumable,
                });
            }
        }

        if is_gguf(&token.destination) && !file_starts_with(&token.part_path, b"GGUF") {
            let _ = tokio::fs::remove_file(&token.part_path).await;
            return Err(Interrupted::fatal(
                "downloaded file is not a valid GGUF model (signature mismatch)",
            ));
        }

        // Windows refuses to rename over an existing file.
        #[cfg(windows)]
        if token.destination.exists() {
            let _ = tokio::fs::remove_file(&token.destination).await;
        }
        tokio::fs::rename(&token.part_path, &token.destination)
            .await
            .map_err(|e| Interrupted::fatal(format!("move into place failed: {e}")))?;
        Ok(token.destination.clone())
    }

    fn record_progress(&self, id: &str, tracker: &mut ProgressTracker, written: u64, now: Instant) {
        let (progress, eta) = tracker.record(written, now);
        let state = {
            let mut table = self.table.lock();
            let Some(state) = table.states.get_mut(id) else {
                return;
            };
            state.bytes_written = written;
            state.total_bytes = tracker.total();
            state.progress = progress;
            state.eta_seconds = eta;
            state.clone()
        };
        if tracker.should_notify(now) {
            let _ = self.events.send(DownloadEvent::Progress {
                id: id.to_string(),
                state,
            });
        }
    }

    fn finish(
        &self,
        id: &str,
        token: ResumeToken,
        result: Result<PathBuf, Interrupted>,
        run_id: u64,
    ) {
        let mut unregistered = None;
        let (status, keep) = match result {
            Ok(path) => match self.manifest.add(ManifestEntry::new(id, &path)) {
                Ok(()) => (DownloadStatus::Completed, false),
                Err(e) => {
                    unregistered = Some(path);
                    (
                        DownloadStatus::Failed(format!("downloaded but not registered: {e}")),
                        false,
                    )
                }
            },
            Err(Interrupted::Cancelled) => (DownloadStatus::Cancelled, true),
            Err(Interrupted::Failed { reason, resumable }) => {
                (DownloadStatus::Failed(reason), resumable)
            }
        };

        {
            let mut table = self.table.lock();
            if table.active.get(id).map(|a| a.run_id) == Some(run_id) {
                table.active.remove(id);
            }
            if keep && token.offset > 0 {
                table.resume.insert(id.to_string(), token);
            }
            if let Some(path) = unregistered {
                table.unregistered.insert(id.to_string(), path);
            }
            let state = table.states.entry(id.to_string()).or_default();
            state.status = status.clone();
            if status == DownloadStatus::Completed {
                state.progress = 1.0;
                state.eta_seconds = 0.0;
            }
        }

        match &status {
            DownloadStatus::Completed => log::info!("[download] {} completed", id),
            DownloadStatus::Cancelled => log::info!("[download] {} cancelled", id),
            DownloadStatus::Failed(reason) => log::warn!("[download] {} failed: {}", id, reason),
            _ => {}
        }
        let _ = self.events.send(DownloadEvent::Finished {
            id: id.to_string(),
            status,
        });
    }
}
