//! Tracing subscriber setup.
//!
//! JSON lines go to stdout. When `LOG_FILE` is set, the same events are also
//! appended to that file as plain text. `RUST_LOG` overrides `LOG_LEVEL`.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Directives used when `RUST_LOG` is not set
fn fallback_directives(level: &str) -> Result<String> {
    let level = level.trim().to_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {
            Ok(format!("{level},hyper=info,reqwest=info,h2=info"))
        }
        "warning" => Ok("warn,hyper=info,reqwest=info,h2=info".to_string()),
        other => bail!("Invalid LOG_LEVEL {other}: expected trace, debug, info, warn or error"),
    }
}

fn open_log_file(path: &str) -> Result<File> {
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {path}"))
}

/// Install the global subscriber. Call once, before anything logs.
pub fn init_tracing(config: &Config) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(fallback_directives(&config.log_level)?)
            .context("Invalid log filter")?,
    };

    let file_layer = match config.log_file.as_deref() {
        Some(path) => Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(Mutex::new(open_log_file(path)?)),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    if let Some(path) = config.log_file.as_deref() {
        tracing::info!(log_file = %path, "Writing logs to file");
    }
    Ok(())
}
