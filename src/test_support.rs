//! Fakes shared by the unit tests.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::engine::{Engine, EngineLoader, GenerationRequest, TokenStream, MIN_MODEL_BYTES};
use crate::error::{EngineLoadError, GenerationError, TransportError};
use crate::transport::{FetchRequest, FetchResponse, Fetcher};

/// Writes a GGUF file that passes `validate_model_file`.
pub fn write_model_file(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    let mut data = vec![0u8; MIN_MODEL_BYTES as usize];
    data[..4].copy_from_slice(b"GGUF");
    std::fs::write(&path, data).unwrap();
    path
}

#[derive(Default)]
pub struct EngineStats {
    pub loads: AtomicUsize,
    pub drops: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
}

#[derive(Clone)]
pub struct Script {
    pub tokens: Vec<String>,
    pub delay: Duration,
    /// Yield an engine error in place of the token at this index.
    pub fail_at: Option<usize>,
}

pub struct FakeLoader {
    stats: Arc<EngineStats>,
    script: Mutex<Script>,
    load_delay: Duration,
    next_error: Mutex<Option<EngineLoadError>>,
}

impl FakeLoader {
    pub fn new(tokens: Vec<String>) -> Self {
        Self {
            stats: Arc::new(EngineStats::default()),
            script: Mutex::new(Script {
                tokens,
                delay: Duration::ZERO,
                fail_at: None,
            }),
            load_delay: Duration::ZERO,
            next_error: Mutex::new(None),
        }
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.script.lock().delay = delay;
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn failing_at(self, index: usize) -> Self {
        self.script.lock().fail_at = Some(index);
        self
    }

    pub fn fail_next(&self, error: EngineLoadError) {
        *self.next_error.lock() = Some(error);
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    pub fn load_count(&self) -> usize {
        self.stats.loads.load(Ordering::SeqCst)
    }

    pub fn dropped_count(&self) -> usize {
        self.stats.drops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineLoader for FakeLoader {
    async fn load(&self, _path: &Path) -> Result<Arc<dyn Engine>, EngineLoadError> {
        if let Some(e) = self.next_error.lock().take() {
            return Err(e);
        }
        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        Ok(Arc::new(FakeEngine {
            script: self.script.lock().clone(),
            stats: Arc::clone(&self.stats),
        }))
    }
}

pub struct FakeEngine {
    script: Script,
    stats: Arc<EngineStats>,
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        self.stats.drops.fetch_add(1, Ordering::SeqCst);
    }
}

struct ActiveStream(Arc<EngineStats>);

impl ActiveStream {
    fn start(stats: Arc<EngineStats>) -> Self {
        let now = stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_active.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Engine for FakeEngine {
    fn stream(&self, request: GenerationRequest) -> TokenStream {
        self.stats.prompts.lock().push(request.prompt);
        let active = ActiveStream::start(Arc::clone(&self.stats));
        let Script {
            tokens,
            delay,
            fail_at,
        } = self.script.clone();

        stream::iter(tokens.into_iter().enumerate())
            .then(move |(i, token)| {
                let _active = &active;
                async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    match fail_at {
                        Some(n) if i >= n => Err(GenerationError::Engine("engine crashed".into())),
                        _ => Ok(token),
                    }
                }
            })
            .boxed()
    }
}

/// Fails every request, for runtimes that never download.
pub struct OfflineFetcher;

#[async_trait]
impl Fetcher for OfflineFetcher {
    async fn open(&self, request: &FetchRequest) -> Result<FetchResponse, TransportError> {
        Err(TransportError::Request(format!("offline: {}", request.url)))
    }
}
