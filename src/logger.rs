// Session log for a bridge process: one timestamped file per run, old runs rotated out.
// Every line is mirrored to `tracing` so embedders with their own subscriber see it too.
use anyhow::Result;
use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn prefix(self) -> &'static str {
        match self {
            LogLevel::Info => "",
            LogLevel::Warn => "WARN: ",
            LogLevel::Error => "ERROR: ",
        }
    }
}

pub struct SessionLogger {
    pending: Mutex<Vec<String>>,
    log_path: PathBuf,
    app_name: String,
    streaming: bool,
}

impl SessionLogger {
    pub fn new(log_dir: &Path, app_name: &str, retention_count: usize, streaming: bool) -> Result<Self> {
        fs::create_dir_all(log_dir)?;

        // Millisecond stamp so two sessions started in the same second do not share a file
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%3f");
        let log_path = log_dir.join(format!("{}_{}.log", app_name, stamp));

        // Keep room for the file we are about to create
        prune_logs(log_dir, app_name, retention_count.saturating_sub(1))?;

        let logger = Self {
            pending: Mutex::new(Vec::new()),
            log_path,
            app_name: app_name.to_string(),
            streaming,
        };
        logger.write(LogLevel::Info, &format!("=== {} session started ===", app_name));

        Ok(logger)
    }

    pub fn write(&self, level: LogLevel, message: &str) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let line = format!("[{}] {}{}", timestamp, level.prefix(), message);

        if self.streaming {
            if let Err(e) = self.append(std::slice::from_ref(&line)) {
                tracing::warn!("failed to stream log line to {}: {}", self.log_path.display(), e);
            }
        } else {
            self.pending.lock().push(line);
        }
    }

    fn append(&self, lines: &[String]) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        for line in lines {
            writeln!(file, "{}", line)?;
        }
        file.flush()?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return Ok(());
        }
        self.append(&pending)?;
        pending.clear();
        Ok(())
    }

    pub fn finalize(&self) -> Result<()> {
        self.write(LogLevel::Info, &format!("=== {} session ended ===", self.app_name));
        self.flush()
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

impl Drop for SessionLogger {
    fn drop(&mut self) {
        let _ = self.finalize();
    }
}

/// Removes all but the newest `keep` log files that belong to `app_name`.
pub fn prune_logs(log_dir: &Path, app_name: &str, keep: usize) -> Result<()> {
    let prefix = format!("{}_", app_name);
    let mut logs: Vec<(PathBuf, std::time::SystemTime)> = fs::read_dir(log_dir)?
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let name = path.file_name()?.to_str()?;
            if !name.starts_with(&prefix) || path.extension()?.to_str()? != "log" {
                return None;
            }
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((path, modified))
        })
        .collect();

    logs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    for (path, _) in logs.iter().skip(keep) {
        let _ = fs::remove_file(path);
    }

    Ok(())
}

static LOGGER: once_cell::sync::OnceCell<SessionLogger> = once_cell::sync::OnceCell::new();

pub fn init_logger(log_dir: &Path, app_name: &str, retention_count: usize, streaming: bool) -> Result<()> {
    let logger = SessionLogger::new(log_dir, app_name, retention_count, streaming)?;
    LOGGER
        .set(logger)
        .map_err(|_| anyhow::anyhow!("Logger already initialized"))?;
    Ok(())
}

pub fn log(level: LogLevel, message: impl AsRef<str>) {
    let message = message.as_ref();
    match level {
        LogLevel::Info => tracing::info!(target: "frameshare", "{}", message),
        LogLevel::Warn => tracing::warn!(target: "frameshare", "{}", message),
        LogLevel::Error => tracing::error!(target: "frameshare", "{}", message),
    }
    if let Some(logger) = LOGGER.get() {
        logger.write(level, message);
    }
}

pub fn finalize_logs() -> Result<()> {
    if let Some(logger) = LOGGER.get() {
        logger.finalize()?;
    }
    Ok(())
}

pub fn log_path() -> Option<PathBuf> {
    LOGGER.get().map(|logger| logger.path().to_path_buf())
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logger::log($crate::logger::LogLevel::Info, format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logger::log($crate::logger::LogLevel::Warn, format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logger::log($crate::logger::LogLevel::Error, format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("frameshare-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn buffered_lines_reach_disk_on_flush() {
        let dir = scratch_dir("logger-flush");
        let logger = SessionLogger::new(&dir, "probe", 5, false).unwrap();
        logger.write(LogLevel::Warn, "swap chain resized");
        assert!(!logger.path().exists());

        logger.flush().unwrap();
        let contents = fs::read_to_string(logger.path()).unwrap();
        assert!(contents.contains("session started"));
        assert!(contents.contains("WARN: swap chain resized"));

        drop(logger);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn streaming_writes_immediately() {
        let dir = scratch_dir("logger-stream");
        let logger = SessionLogger::new(&dir, "probe", 5, true).unwrap();
        logger.write(LogLevel::Error, "leak");
        let contents = fs::read_to_string(logger.path()).unwrap();
        assert!(contents.contains("ERROR: leak"));

        drop(logger);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn prune_keeps_newest_and_ignores_other_apps() {
        let dir = scratch_dir("logger-prune");
        for i in 0..4 {
            fs::write(dir.join(format!("probe_2025010{}_000000_000.log", i)), "x").unwrap();
        }
        fs::write(dir.join("other_20250101_000000_000.log"), "x").unwrap();

        prune_logs(&dir, "probe", 2).unwrap();

        let remaining: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("probe_"))
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(dir.join("other_20250101_000000_000.log").exists());

        let _ = fs::remove_dir_all(&dir);
    }
}
