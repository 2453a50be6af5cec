pub mod catalog;
pub mod cli;
pub mod config;
pub mod database;
pub mod download;
pub mod engine;
pub mod engine_cache;
pub mod error;
pub mod generation;
pub mod logging;
pub mod manifest;
pub mod transport;

#[cfg(test)]
mod test_support;

use clap::Parser;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use catalog::CatalogClient;
use config::Config;
use database::{Conversation, Database};
use download::{DownloadCoordinator, DownloadSettings};
use engine::{EngineLoader, LlamaServerLoader};
use engine_cache::EngineCache;
use error::{DeleteModelError, EngineLoadError, StartupError, StoreError};
use generation::GenerationOrchestrator;
use logging::FileLogger;
use manifest::ManifestStore;
use transport::{Fetcher, HttpFetcher};

/// Every long-lived service, built once at startup.
pub struct Runtime {
    pub config: Config,
    pub manifest: Arc<ManifestStore>,
    pub cache: Arc<EngineCache>,
    pub db: Arc<Database>,
    pub downloads: DownloadCoordinator,
    pub generation: Arc<GenerationOrchestrator>,
    pub catalog: CatalogClient,
    shutdown: CancellationToken,
}

impl Runtime {
    /// Production wiring: llama-server engines and HTTP downloads.
    pub fn open(config: Config) -> Result<Self, StartupError> {
        let loader = Arc::new(LlamaServerLoader::new(
            config.llama_server.clone(),
            config.runtime_dir(),
            config.ctx_size,
            config.gpu_layers,
        ));
        let fetcher = Arc::new(HttpFetcher::new().map_err(|e| StartupError::Http(e.to_string()))?);
        let db = Database::open(&config.database_path())?;
        Self::with_backends(config, loader, fetcher, db)
    }

    /// Must be called from within a tokio runtime.
    pub fn with_backends(
        config: Config,
        loader: Arc<dyn EngineLoader>,
        fetcher: Arc<dyn Fetcher>,
        db: Database,
    ) -> Result<Self, StartupError> {
        let manifest = Arc::new(ManifestStore::open(config.manifest_path()));
        let cache = Arc::new(EngineCache::new(loader, config.engine_capacity));
        let db = Arc::new(db);
        let downloads = DownloadCoordinator::new(
            fetcher,
            manifest.clone(),
            DownloadSettings::from_config(&config),
        );
        let generation = Arc::new(GenerationOrchestrator::new(
            db.clone(),
            manifest.clone(),
            cache.clone(),
            config.history_window,
        ));
        let catalog = CatalogClient::new(config.catalog_base_url.clone())
            .map_err(|e| StartupError::Http(e.to_string()))?;

        let runtime = Self {
            config,
            manifest,
            cache,
            db,
            downloads,
            generation,
            catalog,
            shutdown: CancellationToken::new(),
        };
        runtime.sanitize_conversations();
        runtime.spawn_manifest_listener();
        Ok(runtime)
    }

    /// Conversations pointing at a model that is no longer downloaded lose it.
    fn sanitize_conversations(&self) {
        sanitize_with(&self.manifest, &self.db);
    }

    fn spawn_manifest_listener(&self) {
        let mut changes = self.manifest.subscribe();
        let manifest = self.manifest.clone();
        let db = self.db.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    change = changes.recv() => change,
                };
                match change {
                    Ok(_) | Err(RecvError::Lagged(_)) => sanitize_with(&manifest, &db),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    /// New conversation; without an explicit model it uses the first
    /// downloaded one.
    pub fn new_conversation(
        &self,
        title: Option<&str>,
        model_id: Option<&str>,
    ) -> Result<Conversation, StoreError> {
        let model_id = match model_id {
            Some(id) => id.to_string(),
            None => self
                .manifest
                .all()
                .first()
                .map(|e| e.id.clone())
                .unwrap_or_default(),
        };
        self.db.create_conversation(title, &model_id)
    }

    /// Release the idle engine, drop the manifest entry, then delete the file.
    pub fn delete_model(&self, id: &str) -> Result<(), DeleteModelError> {
        let entry = self
            .manifest
            .get(id)
            .ok_or_else(|| DeleteModelError::NotDownloaded(id.to_string()))?;
        if self.downloads.is_downloading(id) {
            return Err(DeleteModelError::InUse(id.to_string()));
        }
        match self.cache.release_path(&entry.local_path) {
            Ok(_) => {}
            Err(EngineLoadError::Busy(_)) => return Err(DeleteModelError::InUse(id.to_string())),
            Err(e) => log::warn!("[runtime] releasing engine for {}: {}", id, e),
        }

        self.manifest.remove(id)?;
        match std::fs::remove_file(&entry.local_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(DeleteModelError::Io {
                    path: entry.local_path.clone(),
                    reason: e.to_string(),
                })
            }
        }
        // The per-model directory only holds this file.
        if let Some(parent) = entry.local_path.parent() {
            if parent.starts_with(&self.config.models_root) && parent != self.config.models_root {
                let _ = std::fs::remove_dir(parent);
            }
        }
        log::info!("[runtime] deleted model {}", id);
        Ok(())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn sanitize_with(manifest: &ManifestStore, db: &Database) {
    let valid: Vec<String> = manifest.all().into_iter().map(|e| e.id).collect();
    match db.clear_model_references(&valid) {
        Ok(0) => {}
        Ok(n) => log::info!("[runtime] cleared stale model on {} conversations", n),
        Err(e) => log::warn!("[runtime] failed to clear stale models: {}", e),
    }
}

pub fn run() {
    let cli = cli::Cli::parse();
    let base_dir = cli
        .base_dir
        .clone()
        .unwrap_or_else(config::default_base_dir);

    let log_dir = Config::with_base_dir(&base_dir).log_dir();
    if let Err(e) = FileLogger::new(log_dir, logging::level_from_env()).install() {
        eprintln!("[edgechat] logger not installed: {e}");
    }
    let config = Config::load(&base_dir);

    let tokio_rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start async runtime: {e}");
            std::process::exit(1);
        }
    };

    let result = tokio_rt.block_on(async move {
        let runtime = Runtime::open(config).map_err(|e| e.to_string())?;
        cli::dispatch(&runtime, cli.command).await
    });
    if let Err(message) = result {
        log::error!("[cli] {}", message);
        eprintln!("error: {message}");
        std::process::exit(1);
    }
}
