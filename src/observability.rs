//! `tracing` setup for the agent binary.
//!
//! Events go to a daily rolling file and, optionally, to stderr. Targets follow
//! the loop stages (`agent.loop`, `agent.decide`, `agent.ground`, `agent.act`,
//! `agent.guard`, `agent.web`) so `RUST_LOG=agent.guard=debug` isolates one.

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static LOG_DIR: OnceLock<PathBuf> = OnceLock::new();

pub const LOG_DIR_ENV: &str = "CART_PILOT_LOG_DIR";
const LOG_FILE: &str = "agent.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Overrides `CART_PILOT_LOG_DIR` and the platform data dir.
    pub log_dir: Option<PathBuf>,
    pub emit_stderr: bool,
    pub format: LogFormat,
    /// Used when `RUST_LOG` is unset.
    pub default_filter: &'static str,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            emit_stderr: true,
            format: LogFormat::Text,
            default_filter: "info,headless_chrome=warn,tungstenite=warn",
        }
    }
}

/// Installs the global subscriber once and returns the log directory.
/// Later calls hand back the first directory.
pub fn init_logging(config: LogConfig) -> anyhow::Result<PathBuf> {
    if let Some(dir) = LOG_DIR.get() {
        return Ok(dir.clone());
    }

    let dir = resolve_log_dir(config.log_dir.as_deref());
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory: {}", dir.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(rolling::daily(&dir, LOG_FILE));
    let _ = LOG_GUARD.set(guard);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.default_filter));
    let emit_stderr = config.emit_stderr;

    let result = match config.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(writer).with_ansi(false))
            .with(emit_stderr.then(|| fmt::layer().with_writer(std::io::stderr)))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(writer))
            .with(emit_stderr.then(|| fmt::layer().with_writer(std::io::stderr)))
            .try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("tracing setup failed: {e}"))?;

    let _ = LOG_DIR.set(dir.clone());
    Ok(dir)
}

fn resolve_log_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return expand_home(dir);
    }
    if let Ok(env_dir) = std::env::var(LOG_DIR_ENV) {
        return expand_home(Path::new(&env_dir));
    }
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cart-pilot")
        .join("logs")
}

fn expand_home(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&raw).into_owned())
}
