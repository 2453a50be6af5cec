use std::path::PathBuf;

use thiserror::Error;

/// Why an engine could not be produced for a model file.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineLoadError {
    #[error("Model file not found at path: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Model file is not readable: {}", .0.display())]
    NotReadable(PathBuf),

    #[error("Invalid model format: {0}. Expected .gguf or .bin")]
    InvalidFormat(String),

    #[error("Model file too small ({0} bytes). May be corrupted.")]
    TooSmall(u64),

    #[error("Failed to load model: {0}")]
    LoadFailed(String),

    #[error("Not enough memory to load model ({required} bytes needed, {available} available)")]
    OutOfMemory { required: u64, available: u64 },

    #[error("All {capacity} cached engines are in use")]
    CacheFull { capacity: usize },

    #[error("Engine for {} is in use", .0.display())]
    Busy(PathBuf),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GenerationError {
    #[error("Prompt cannot be empty")]
    EmptyPrompt,

    #[error("Max tokens must be between 1 and 4096 (got {0})")]
    TokenLimit(i32),

    #[error("Prompt too long ({0} characters, max 50,000)")]
    PromptTooLong(usize),

    #[error("Text generation failed: {0}")]
    Engine(String),

    #[error("Generation cancelled")]
    Cancelled,

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Conversation store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DownloadError {
    #[error("Invalid download URL: {0}")]
    InvalidUrl(String),

    #[error("No compatible weight file (.gguf or .bin) in {0}")]
    NoCompatibleFile(String),

    #[error("Download failed: {0}")]
    Transport(String),

    #[error("Download cancelled")]
    Cancelled,

    #[error("A download for {0} is already running")]
    AlreadyRunning(String),

    #[error("Nothing to register for {0}: no downloaded file on disk")]
    NotRegistrable(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PersistenceError {
    #[error("Failed to read manifest {}: {reason}", .path.display())]
    Read { path: PathBuf, reason: String },

    #[error("Failed to write manifest {}: {reason}", .path.display())]
    Write { path: PathBuf, reason: String },

    #[error("Manifest {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("Model not downloaded: {0}")]
pub struct ManifestResolutionError(pub String);

/// Failures while talking to the remote file host.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("stream read error: {0}")]
    Read(String),
}

/// Conversation database failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeleteModelError {
    #[error("Model not downloaded: {0}")]
    NotDownloaded(String),

    #[error("Cannot delete {0} while it is generating or downloading. Stop it first.")]
    InUse(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Failed to delete {}: {reason}", .path.display())]
    Io { path: PathBuf, reason: String },
}

/// Failures while wiring up the runtime at startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to build HTTP client: {0}")]
    Http(String),
}

impl From<StoreError> for GenerationError {
    fn from(e: StoreError) -> Self {
        GenerationError::Store(e.to_string())
    }
}
