// ABOUTME: Shared logging setup for coven-ops binaries
// ABOUTME: init() logs to stderr, init_file() to a per-app file for detached daemons

use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Filter from RUST_LOG, or `default` when RUST_LOG is unset or invalid.
/// Child process output is traced at TRACE, so RUST_LOG=coven_ops=trace shows it.
pub fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Logging to stderr. Default: INFO, RUST_LOG override.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(filter("info"))
        .with_target(false)
        .init();
}

/// Logging to ~/.config/coven/{app_name}/{app_name}.log. Default: WARN.
/// If setup fails, prints a warning and falls back to stderr.
pub fn init_file(app_name: &str) {
    if let Err(e) = init_file_inner(app_name) {
        eprintln!("Warning: failed to set up file logging: {e}");
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter("info"))
            .try_init();
    }
}

/// Directory holding an app's log file
pub fn log_dir(app_name: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("coven").join(app_name))
}

type InitError = Box<dyn std::error::Error + Send + Sync>;

fn init_file_inner(app_name: &str) -> Result<(), InitError> {
    let log_dir = log_dir(app_name).ok_or("could not determine config directory")?;
    init_file_at(&log_dir, app_name)
}

fn init_file_at(log_dir: &Path, app_name: &str) -> Result<(), InitError> {
    std::fs::create_dir_all(log_dir)?;

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(format!("{app_name}.log")))?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_env_filter(filter("warn"))
        .with_ansi(false)
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_dir_is_namespaced() {
        if let Some(dir) = log_dir("coven-ops") {
            assert!(dir.ends_with("coven/coven-ops"));
        }
    }

    #[test]
    fn file_logging_writes_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("coven").join("coven-ops");
        init_file_at(&nested, "coven-ops").unwrap();

        tracing::warn!(id = "api", "port 8080 unreachable");
        tracing::info!("below the default level");

        let written = std::fs::read_to_string(nested.join("coven-ops.log")).unwrap();
        assert!(written.contains("port 8080 unreachable"));
        assert!(written.contains("id=\"api\""));
        assert!(!written.contains("below the default level"));

        // A second global subscriber is refused, not a panic
        assert!(init_file_at(&nested, "coven-ops").is_err());
    }

    #[test]
    fn exports_init() {
        let _ = super::init as fn();
        let _ = super::init_file as fn(&str);
    }
}
