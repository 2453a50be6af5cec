use log::{LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;
use std::io::Write;
use std::path::PathBuf;

/// Appends `[timestamp] [LEVEL] message` lines to `{log_dir}/YYYY-MM-DD.log`.
pub struct FileLogger {
    log_dir: PathBuf,
    level: LevelFilter,
    lock: Mutex<()>,
}

impl FileLogger {
    pub fn new(log_dir: PathBuf, level: LevelFilter) -> Self {
        Self {
            log_dir,
            level,
            lock: Mutex::new(()),
        }
    }

    /// Install as the global logger. Fails if one is already set.
    pub fn install(self) -> Result<(), log::SetLoggerError> {
        let level = self.level;
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(level);
        Ok(())
    }

    fn write_line(&self, level: &str, message: &str) -> std::io::Result<()> {
        let _guard = self.lock.lock();
        std::fs::create_dir_all(&self.log_dir)?;
        let file_name = format!("{}.log", chrono::Utc::now().format("%Y-%m-%d"));
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_dir.join(file_name))?;
        let ts = chrono::Utc::now().to_rfc3339();
        writeln!(file, "[{}] [{}] {}", ts, level, message)
    }
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Nowhere left to report a failing log write.
        let _ = self.write_line(record.level().as_str(), &record.args().to_string());
    }

    fn flush(&self) {}
}

/// `EDGECHAT_LOG` as a level name, default `info`.
pub fn level_from_env() -> LevelFilter {
    std::env::var("EDGECHAT_LOG")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(LevelFilter::Info)
}
