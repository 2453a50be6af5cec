use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_ENGINE_CAPACITY: usize = 3;
pub const DEFAULT_HISTORY_WINDOW: usize = 20;
pub const DEFAULT_CATALOG_BASE_URL: &str = "https://huggingface.co";

/// Keys accepted in `{base}/config.json`. Everything is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    models_dir: Option<PathBuf>,
    engine_capacity: Option<usize>,
    history_window: Option<usize>,
    stall_timeout_secs: Option<u64>,
    progress_interval_ms: Option<u64>,
    llama_server: Option<PathBuf>,
    ctx_size: Option<u32>,
    gpu_layers: Option<i32>,
    catalog_base_url: Option<String>,
    hf_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub base_dir: PathBuf,
    /// Root of the `{sanitizedId}/{filename}` tree.
    pub models_root: PathBuf,
    pub engine_capacity: usize,
    pub history_window: usize,
    pub stall_timeout: Duration,
    pub progress_interval: Duration,
    pub llama_server: Option<PathBuf>,
    pub ctx_size: u32,
    /// `None` means probe the GPU at load time.
    pub gpu_layers: Option<i32>,
    pub catalog_base_url: String,
    pub hf_token: Option<String>,
}

impl Config {
    /// Defaults rooted at `base_dir`, without reading anything from disk.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            models_root: base_dir.join("Models"),
            base_dir,
            engine_capacity: DEFAULT_ENGINE_CAPACITY,
            history_window: DEFAULT_HISTORY_WINDOW,
            stall_timeout: Duration::from_secs(60),
            progress_interval: Duration::from_millis(1000),
            llama_server: None,
            ctx_size: 4096,
            gpu_layers: None,
            catalog_base_url: DEFAULT_CATALOG_BASE_URL.to_string(),
            hf_token: None,
        }
    }

    /// Read `{base_dir}/config.json` on top of the defaults. A missing file is
    /// normal; a corrupt one is logged and ignored.
    pub fn load(base_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::with_base_dir(base_dir);
        let path = config.base_dir.join("config.json");
        let file = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<ConfigFile>(&raw) {
                Ok(f) => f,
                Err(e) => {
                    log::warn!("[config] ignoring unreadable {}: {}", path.display(), e);
                    ConfigFile::default()
                }
            },
            Err(_) => ConfigFile::default(),
        };
        config.apply(file);
        config
    }

    fn apply(&mut self, file: ConfigFile) {
        if let Some(dir) = file.models_dir {
            self.models_root = dir;
        }
        if let Some(n) = file.engine_capacity {
            self.engine_capacity = n.max(1);
        }
        if let Some(n) = file.history_window {
            self.history_window = n.max(1);
        }
        if let Some(s) = file.stall_timeout_secs {
            self.stall_timeout = Duration::from_secs(s.max(1));
        }
        if let Some(ms) = file.progress_interval_ms {
            self.progress_interval = Duration::from_millis(ms);
        }
        self.llama_server = file.llama_server.or(self.llama_server.take());
        if let Some(n) = file.ctx_size {
            self.ctx_size = n;
        }
        self.gpu_layers = file.gpu_layers.or(self.gpu_layers);
        if let Some(url) = file.catalog_base_url {
            self.catalog_base_url = url;
        }
        self.hf_token = file.hf_token.filter(|t| !t.trim().is_empty());
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.base_dir.join("models.json")
    }

    pub fn database_path(&self) -> PathBuf {
        self.base_dir.join("edgechat.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.base_dir.join("runtime")
    }
}

/// `EDGECHAT_HOME`, else the platform data dir, else the working directory.
pub fn default_base_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("EDGECHAT_HOME") {
        return PathBuf::from(home);
    }
    dirs::data_dir()
        .map(|d| d.join("edgechat"))
        .unwrap_or_else(|| Path::new(".").join("edgechat-data"))
}
