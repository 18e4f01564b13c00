// src/logging.rs
//
// Operator log. Lines go to stderr with a local wall-clock prefix and, once a
// log directory is set up, are mirrored into a per-run file there.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Per-run log file; `None` until `init_file_logging` succeeds.
pub(crate) static LOG_FILE: Mutex<Option<std::fs::File>> = Mutex::new(None);

/// Always points at the newest run's file.
const LATEST_LOG_NAME: &str = "tabmask.log";

/// `HH:MM:SS.mmm` in local time
pub(crate) fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

/// e.g. `20261016-093012-tabmask.log`
fn log_file_name(now: chrono::DateTime<chrono::Local>) -> String {
    now.format("%Y%m%d-%H%M%S-tabmask.log").to_string()
}

/// Print one already-prefixed line and append it to the log file if open.
pub(crate) fn emit(line: &str) {
    eprintln!("{}", line);
    if let Ok(mut guard) = LOG_FILE.lock() {
        if let Some(file) = guard.as_mut() {
            let _ = writeln!(file, "{}", line);
        }
    }
}

/// Repoint `tabmask.log` at `filename`. Skipped off Unix.
#[cfg(unix)]
fn link_latest(log_dir: &Path, filename: &str) {
    let link = log_dir.join(LATEST_LOG_NAME);
    let _ = std::fs::remove_file(&link);
    if let Err(e) = std::os::unix::fs::symlink(filename, &link) {
        eprintln!("{} [logging] Could not link {}: {}", timestamp(), LATEST_LOG_NAME, e);
    }
}

#[cfg(not(unix))]
fn link_latest(_log_dir: &Path, _filename: &str) {}

/// Start mirroring log lines into a new file under `log_dir`.
/// Returns the file's path.
pub fn init_file_logging(log_dir: &Path) -> Result<PathBuf, String> {
    std::fs::create_dir_all(log_dir)
        .map_err(|e| format!("Failed to create log dir {}: {}", log_dir.display(), e))?;

    let filename = log_file_name(chrono::Local::now());
    let log_path = log_dir.join(&filename);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| format!("Failed to open {}: {}", log_path.display(), e))?;

    link_latest(log_dir, &filename);

    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = Some(file);
    }
    emit(&format!("{} [logging] Writing to {}", timestamp(), log_path.display()));

    Ok(log_path)
}

/// Close the log file; stderr output continues.
pub fn stop_file_logging() {
    let closed = LOG_FILE
        .lock()
        .map(|mut guard| guard.take().is_some())
        .unwrap_or(false);
    if closed {
        eprintln!("{} [logging] File logging stopped", timestamp());
    }
}

/// Timestamped log line to stderr and, when enabled, the log file.
macro_rules! tlog {
    ($($arg:tt)*) => {
        $crate::logging::emit(&format!("{} {}", $crate::logging::timestamp(), format_args!($($arg)*)))
    };
}
