//! Tracing subscriber setup.

use std::path::Path;

use anyhow::{Context, Result};
use ctxd_config::LoggingConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "CTXD_LOG";

/// Filter from `CTXD_LOG`, else `debug` or `info`.
pub fn env_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }))
}

/// Minimal stderr subscriber used before the configuration is known.
pub fn bootstrap_subscriber(debug: bool) -> impl tracing::Subscriber + Send + Sync {
    fmt()
        .with_env_filter(env_filter(debug))
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish()
}

/// Install the global subscriber: text or JSON on stderr, plus an optional
/// plain-text log file. Relative file paths resolve against `project_root`.
pub fn init_logging(debug: bool, config: &LoggingConfig, project_root: &Path) -> Result<()> {
    let json = config.json.then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text = (!config.json).then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));

    let file = match &config.file {
        Some(path) => {
            let path = if path.is_absolute() {
                path.clone()
            } else {
                project_root.join(path)
            };
            let dir = path.parent().unwrap_or(project_root);
            std::fs::create_dir_all(dir).with_context(|| format!("Failed to create log directory {:?}", dir))?;
            let name = path
                .file_name()
                .with_context(|| format!("Log file path has no file name: {:?}", path))?;
            let appender = tracing_appender::rolling::never(dir, name);
            Some(fmt::layer().with_writer(appender).with_ansi(false))
        }
        None => None,
    };

    Registry::default()
        .with(env_filter(debug))
        .with(json)
        .with(text)
        .with(file)
        .try_init()
        .context("Failed to initialise logging")?;
    Ok(())
}

