//! Inference engines and the llama.cpp server backend.
//!
//! An [`Engine`] turns a prompt into a stream of text pieces. Production engines
//! are `llama-server` child processes owned by [`LlamaServerEngine`]; the process
//! is killed when the engine is dropped, so whoever owns the `Arc` owns the
//! native resource.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
#[cfg(not(target_os = "macos"))]
use libloading::Library;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Read;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;

use crate::error::{EngineLoadError, GenerationError};

/// Anything smaller cannot be a usable weight file.
pub const MIN_MODEL_BYTES: u64 = 1_048_576;
pub const MODEL_EXTENSIONS: [&str; 2] = ["gguf", "bin"];
const GGUF_MAGIC: &[u8; 4] = b"GGUF";

pub type TokenStream = BoxStream<'static, Result<String, GenerationError>>;

/// Sampling parameters, passed through to the engine unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSettings {
    pub temperature: f32,
    pub max_tokens: i32,
    pub top_p: f32,
    pub top_k: i32,
    pub repeat_penalty: f32,
    pub system_prompt: String,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 512,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.1,
            system_prompt: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub settings: GenerationSettings,
}

pub trait Engine: Send + Sync {
    /// Start generating. The stream ends after the last token; dropping it
    /// abandons the generation.
    fn stream(&self, request: GenerationRequest) -> TokenStream;
}

#[async_trait]
pub trait EngineLoader: Send + Sync {
    /// Bring up an engine for an already validated model file.
    async fn load(&self, path: &Path) -> Result<Arc<dyn Engine>, EngineLoadError>;
}

/// Checks that `path` plausibly holds model weights and returns its size.
pub fn validate_model_file(path: &Path) -> Result<u64, EngineLoadError> {
    let meta = match std::fs::metadata(path) {
        Ok(m) if m.is_file() => m,
        Ok(_) => return Err(EngineLoadError::NotFound(path.to_path_buf())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(EngineLoadError::NotFound(path.to_path_buf()))
        }
        Err(_) => return Err(EngineLoadError::NotReadable(path.to_path_buf())),
    };
    let mut file =
        std::fs::File::open(path).map_err(|_| EngineLoadError::NotReadable(path.to_path_buf()))?;

    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    if !MODEL_EXTENSIONS.contains(&ext.as_str()) {
        return Err(EngineLoadError::InvalidFormat(format!(".{ext}")));
    }

    let size = meta.len();
    if size < MIN_MODEL_BYTES {
        return Err(EngineLoadError::TooSmall(size));
    }

    if ext == "gguf" {
        let mut magic = [0u8; 4];
        if file.read_exact(&mut magic).is_err() || &magic != GGUF_MAGIC {
            return Err(EngineLoadError::InvalidFormat(
                ".gguf (signature mismatch)".to_string(),
            ));
        }
    }
    Ok(size)
}

pub fn has_model_extension(file_name: &str) -> bool {
    let lower = file_name.to_ascii_lowercase();
    MODEL_EXTENSIONS
        .iter()
        .any(|ext| lower.ends_with(&format!(".{ext}")))
}

// ── llama-server backend ──

pub struct LlamaServerLoader {
    server_bin: Option<PathBuf>,
    runtime_dir: PathBuf,
    ctx_size: u32,
    gpu_layers: Option<i32>,
    start_timeout: Duration,
}

impl LlamaServerLoader {
    pub fn new(
        server_bin: Option<PathBuf>,
        runtime_dir: PathBuf,
        ctx_size: u32,
        gpu_layers: Option<i32>,
    ) -> Self {
        Self {
            server_bin,
            runtime_dir,
            ctx_size,
            gpu_layers,
            start_timeout: Duration::from_secs(60),
        }
    }

    fn server_path(&self) -> Result<PathBuf, EngineLoadError> {
        if let Some(bin) = &self.server_bin {
            return Ok(bin.clone());
        }
        find_llama_server(&self.runtime_dir).ok_or_else(|| {
            EngineLoadError::LoadFailed(format!(
                "llama-server not found. Please place it under: {}",
                self.runtime_dir.display()
            ))
        })
    }
}

#[async_trait]
impl EngineLoader for LlamaServerLoader {
    async fn load(&self, path: &Path) -> Result<Arc<dyn Engine>, EngineLoadError> {
        let server = self.server_path()?;

        let required = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let available = available_memory_bytes();
        if required > available {
            return Err(EngineLoadError::OutOfMemory {
                required,
                available,
            });
        }

        let port = pick_free_port().map_err(|e| EngineLoadError::LoadFailed(e.to_string()))?;
        let gpu_layers = self.gpu_layers.unwrap_or_else(default_gpu_layers);

        let mut cmd = Command::new(&server);
        cmd.arg("-m")
            .arg(path)
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(port.to_string())
            .arg("--ctx-size")
            .arg(self.ctx_size.to_string())
            .arg("--n-gpu-layers")
            .arg(gpu_layers.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let child = cmd
            .spawn()
            .map_err(|e| EngineLoadError::LoadFailed(format!("{}: {}", server.display(), e)))?;
        log::info!(
            "[engine] started llama-server pid={} port={} model={}",
            child.id(),
            port,
            path.display()
        );
        let engine = LlamaServerEngine::new(child, port, path.to_path_buf());

        if !wait_port_open(port, self.start_timeout, &engine).await {
            // Dropping the engine kills the half-started process.
            return Err(EngineLoadError::LoadFailed(
                "llama-server failed to start".to_string(),
            ));
        }
        Ok(Arc::new(engine))
    }
}

pub struct LlamaServerEngine {
    child: Mutex<Option<Child>>,
    model_path: PathBuf,
    base_url: String,
    client: reqwest::Client,
}

impl LlamaServerEngine {
    fn new(child: Child, port: u16, model_path: PathBuf) -> Self {
        Self {
            child: Mutex::new(Some(child)),
            model_path,
            base_url: format!("http://127.0.0.1:{port}"),
            client: reqwest::Client::new(),
        }
    }

    fn has_exited(&self) -> bool {
        let mut guard = self.child.lock();
        match guard.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    fn stop(&self) {
        if let Some(mut child) = self.child.lock().take() {
            #[cfg(target_os = "windows")]
            {
                use std::os::windows::process::CommandExt;
                let _ = Command::new("taskkill")
                    .args(["/F", "/T", "/PID", &child.id().to_string()])
                    .creation_flags(0x08000000)
                    .output();
            }
            #[cfg(not(target_os = "windows"))]
            {
                let _ = child.kill();
            }
            let _ = child.wait();
            log::info!("[engine] stopped llama-server for {}", self.model_path.display());
        }
    }
}

impl Drop for LlamaServerEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Engine for LlamaServerEngine {
    fn stream(&self, request: GenerationRequest) -> TokenStream {
        let client = self.client.clone();
        let url = format!("{}/completion", self.base_url);
        let body = completion_body(&request);

        let open = async move {
            let resp = client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| GenerationError::Engine(format!("llama-server request failed: {e}")))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                return Err(GenerationError::Engine(format!(
                    "llama-server returned HTTP {status} :: {text}"
                )));
            }
            Ok(resp.bytes_stream().boxed())
        };

        stream::once(open)
            .map(|opened| match opened {
                Ok(body) => sse_tokens(body),
                Err(e) => stream::once(async move { Err::<String, _>(e) }).boxed(),
            })
            .flatten()
            .boxed()
    }
}

fn completion_body(request: &GenerationRequest) -> serde_json::Value {
    let s = &request.settings;
    serde_json::json!({
        "prompt": request.prompt,
        "stream": true,
        "n_predict": s.max_tokens,
        "temperature": s.temperature,
        "top_p": s.top_p,
        "top_k": s.top_k,
        "repeat_penalty": s.repeat_penalty,
    })
}

fn sse_tokens(body: BoxStream<'static, reqwest::Result<Bytes>>) -> TokenStream {
    stream::unfold(
        (body, SseParser::default(), VecDeque::new()),
        |(mut body, mut parser, mut ready)| async move {
            loop {
                if let Some(item) = ready.pop_front() {
                    return Some((item, (body, parser, ready)));
                }
                if parser.finished {
                    return None;
                }
                match body.next().await {
                    Some(Ok(bytes)) => ready.extend(parser.push(&bytes)),
                    Some(Err(e)) => {
                        parser.finished = true;
                        ready.push_back(Err(GenerationError::Engine(format!(
                            "stream read error: {e}"
                        ))));
                    }
                    None => return None,
                }
            }
        },
    )
    .boxed()
}

/// Incremental parser for llama-server's `data: {json}` event lines.
#[derive(Default)]
struct SseParser {
    buffer: Vec<u8>,
    finished: bool,
}

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    content: String,
    #[serde(default)]
    stop: bool,
    error: Option<serde_json::Value>,
}

impl SseParser {
    fn push(&mut self, bytes: &[u8]) -> Vec<Result<String, GenerationError>> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if self.finished {
                continue;
            }
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let chunk: CompletionChunk = match serde_json::from_str(payload.trim()) {
                Ok(c) => c,
                Err(_) => continue,
            };
            if let Some(err) = chunk.error {
                out.push(Err(GenerationError::Engine(err.to_string())));
                self.finished = true;
                continue;
            }
            if !chunk.content.is_empty() {
                out.push(Ok(chunk.content));
            }
            if chunk.stop {
                self.finished = true;
            }
        }
        out
    }
}

fn find_llama_server(runtime: &Path) -> Option<PathBuf> {
    let candidates = [
        runtime.join("llama-server.exe"),
        runtime.join("server.exe"),
        runtime.join("llama-server"),
        runtime.join("server"),
    ];
    candidates.into_iter().find(|c| c.is_file())
}

fn pick_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

async fn wait_port_open(port: u16, timeout: Duration, engine: &LlamaServerEngine) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if engine.has_exited() {
            return false;
        }
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    false
}

fn available_memory_bytes() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.available_memory()
}

/// Offload everything when a GPU runtime library is present, nothing otherwise.
fn default_gpu_layers() -> i32 {
    if gpu_runtime_present() {
        999
    } else {
        0
    }
}

fn gpu_runtime_present() -> bool {
    #[cfg(target_os = "macos")]
    {
        true
    }
    #[cfg(target_os = "windows")]
    {
        unsafe { Library::new("vulkan-1.dll") }.is_ok()
            || unsafe { Library::new("nvcuda.dll") }.is_ok()
    }
    #[cfg(all(not(target_os = "windows"), not(target_os = "macos")))]
    {
        unsafe { Library::new("libvulkan.so.1") }.is_ok()
            || unsafe { Library::new("libcuda.so.1") }.is_ok()
            || unsafe { Library::new("libcuda.so") }.is_ok()
    }
}
