//! Logging system with console and daily-rotated file output.
//!
//! `log` macros are bridged into `tracing`, so session code can keep using
//! `info!("[Session {}] ...")` while both layers receive the events.

use std::fs;
use std::io;
use std::path::Path;

use chrono::Local;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// File name prefix of the rotated log files.
const LOG_FILE_NAME: &str = "chrometuner.log";

/// Initialize the logging system with both console and file output.
///
/// # Arguments
/// * `log_dir` - Directory where log files will be stored
/// * `retention_days` - Number of days to keep log files
/// * `verbose` - Whether to enable debug-level logging
/// * `level` - Filter from the config file, used when neither `RUST_LOG` nor `verbose` is set
pub fn init_logging(
    log_dir: &Path,
    retention_days: u64,
    verbose: bool,
    level: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(log_dir)?;
    clean_old_logs(log_dir, retention_days)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program lifetime.
    let _ = Box::leak(Box::new(guard));

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose, level)));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(io::stdout)
                .with_target(true)
                .with_level(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
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

    Ok(())
}

/// Filter directive used when `RUST_LOG` is unset.
fn default_directive(verbose: bool, level: Option<&str>) -> String {
    if verbose {
        return "debug".to_string();
    }
    match level.map(str::trim) {
        Some(level) if !level.is_empty() => level.to_string(),
        _ => "info".to_string(),
    }
}

/// Remove log files older than the retention window.
fn clean_old_logs(log_dir: &Path, retention_days: u64) -> io::Result<()> {
    if !log_dir.exists() {
        return Ok(());
    }

    let cutoff = Local::now() - chrono::Duration::days(retention_days as i64);

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let is_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_NAME));
        if !is_log {
            continue;
        }

        if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
            let modified: chrono::DateTime<Local> = modified.into();
            if modified < cutoff {
                if let Err(e) = fs::remove_file(&path) {
                    eprintln!("Failed to remove old log file {:?}: {}", path, e);
                }
            }
        }
    }

    Ok(())
}

/// Custom timer for local time formatting in logs
#[derive(Debug, Clone, Copy)]
struct LocalTimeTimer;

impl fmt::time::FormatTime for LocalTimeTimer {
    fn format_time(&self, w: &mut fmt::format::Writer) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.6f"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(true, Some("warn")), "debug");
        assert_eq!(default_directive(false, Some("warn")), "warn");
        assert_eq!(default_directive(false, Some("  ")), "info");
        assert_eq!(default_directive(false, None), "info");
    }

    #[test]
    fn test_clean_old_logs_keeps_recent_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let recent = dir.path().join(format!("{}.2026-10-16", LOG_FILE_NAME));
        let other = dir.path().join("notes.txt");
        fs::write(&recent, "line\n").unwrap();
        fs::write(&other, "keep\n").unwrap();

        clean_old_logs(dir.path(), 7).unwrap();

        assert!(recent.exists());
        assert!(other.exists());
    }

    #[test]
    fn test_clean_old_logs_zero_retention_removes_logs() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join(format!("{}.2026-10-01", LOG_FILE_NAME));
        let other = dir.path().join("notes.txt");
        fs::write(&log, "line\n").unwrap();
        fs::write(&other, "keep\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        clean_old_logs(dir.path(), 0).unwrap();

        assert!(!log.exists());
        assert!(other.exists());
    }
}
