//! Logging with console and daily rotated file output.
//!
//! The protocol crate logs through the `log` facade; those records are
//! bridged into the tracing subscriber installed here.

use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Local};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Base name of the rolling log files.
pub const LOG_FILE_NAME: &str = "prf-tool.log";

/// Initialize console + file logging.
///
/// Filter precedence: `RUST_LOG`, then `level` from the config file, then
/// `debug` with `verbose` or `info` otherwise.
pub fn init_logging(
    log_dir: &Path,
    retention_days: u64,
    verbose: bool,
    level: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(log_dir)?;

    let removed = clean_old_logs(log_dir, retention_days, Local::now())?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // Keep the writer thread alive for the whole run.
    Box::leak(Box::new(guard));

    let default_level = match (verbose, level) {
        (true, _) => "debug",
        (false, Some(level)) => level,
        (false, None) => "info",
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(io::stderr)
                .with_target(false)
                .with_level(true)
                .with_timer(LocalTimeTimer),
        )
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_timer(LocalTimeTimer),
        );

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("Failed to set default subscriber: {}", e))?;
    tracing_log::LogTracer::init().map_err(|e| format!("Failed to initialize LogTracer: {}", e))?;

    if removed > 0 {
        tracing::debug!("Removed {} expired log files", removed);
    }
    Ok(())
}

/// Remove our log files last modified before `now - retention_days`.
/// Returns how many were removed.
fn clean_old_logs(log_dir: &Path, retention_days: u64, now: DateTime<Local>) -> io::Result<usize> {
    if !log_dir.exists() {
        return Ok(0);
    }
    let cutoff = now - chrono::Duration::days(retention_days as i64);

    let mut removed = 0;
    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_ours = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_NAME));
        if !path.is_file() || !is_ours {
            continue;
        }

        let modified: Option<SystemTime> = entry.metadata().and_then(|m| m.modified()).ok();
        if let Some(modified) = modified {
            let modified: DateTime<Local> = modified.into();
            if modified < cutoff {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => eprintln!("Failed to remove old log file {:?}: {}", path, e),
                }
            }
        }
    }
    Ok(removed)
}

#[derive(Debug, Clone, Copy)]
struct LocalTimeTimer;

impl fmt::time::FormatTime for LocalTimeTimer {
    fn format_time(&self, w: &mut fmt::format::Writer) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_old_logs() {
        let dir = tempfile::tempdir().unwrap();
        let ours = dir.path().join(format!("{}.2020-01-01", LOG_FILE_NAME));
        let other = dir.path().join("unrelated.log");
        fs::write(&ours, b"old").unwrap();
        fs::write(&other, b"keep").unwrap();

        // Files were just written; nothing is older than a week.
        assert_eq!(clean_old_logs(dir.path(), 7, Local::now()).unwrap(), 0);

        // Seen from ten days in the future, ours has expired.
        let later = Local::now() + chrono::Duration::days(10);
        assert_eq!(clean_old_logs(dir.path(), 7, later).unwrap(), 1);
        assert!(!ours.exists());
        assert!(other.exists());
    }

    #[test]
    fn test_clean_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert_eq!(clean_old_logs(&missing, 7, Local::now()).unwrap(), 0);
    }
}
