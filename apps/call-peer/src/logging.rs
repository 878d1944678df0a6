use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Overrides the level-derived directives when set.
const FILTER_ENV: &str = "CALL_LOG_FILTER";

const CALL_CRATES: &[&str] = &["call_peer", "call_core", "call_media", "call_signaling"];

/// Dependencies that flood debug output; held at warn unless the filter is
/// given explicitly.
const NOISY_DEPENDENCIES: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "tungstenite",
    "tokio_tungstenite",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

/// Flushes the background writer when dropped. Hold it for the life of
/// `main`.
#[must_use = "log lines are lost once the guard is dropped"]
pub struct LogGuard {
    _writer: WorkerGuard,
}

/// Installs the global subscriber, writing to `config.file` or stderr.
pub fn init(config: &LogConfig) -> Result<LogGuard, InitError> {
    let (writer, guard) = open_writer(config.file.as_deref())?;
    let filter = match std::env::var(FILTER_ENV) {
        Ok(directives) => EnvFilter::new(directives),
        Err(_) => EnvFilter::new(directives(config.level)),
    };

    let output = tracing_subscriber::fmt::layer()
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_ids(config.level == LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .try_init()
        .map_err(|err| InitError::Configure(err.to_string()))?;
    Ok(LogGuard { _writer: guard })
}

fn open_writer(path: Option<&Path>) -> Result<(NonBlocking, WorkerGuard), InitError> {
    let Some(path) = path else {
        return Ok(tracing_appender::non_blocking(std::io::stderr()));
    };
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| InitError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(tracing_appender::non_blocking(file))
}

/// Quiet levels apply everywhere. Debug and trace only open up the call
/// crates; everything else stays at info and the noisy dependencies at warn.
fn directives(level: LogLevel) -> String {
    if level < LogLevel::Debug {
        return level.directive().to_string();
    }
    let mut directives = vec!["info".to_string()];
    directives.extend(
        CALL_CRATES
            .iter()
            .map(|krate| format!("{krate}={}", level.directive())),
    );
    directives.extend(NOISY_DEPENDENCIES.iter().map(|dep| format!("{dep}=warn")));
    directives.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn quiet_levels_are_global() {
        assert_eq!(directives(LogLevel::Warn), "warn");
        assert_eq!(directives(LogLevel::Info), "info");
    }

    #[test_timeout::timeout]
    fn verbose_levels_stay_inside_the_call_crates() {
        let debug = directives(LogLevel::Debug);
        assert!(debug.starts_with("info,"), "{debug}");
        assert!(debug.contains("call_core=debug"), "{debug}");
        assert!(debug.contains("webrtc_ice=warn"), "{debug}");
        assert!(directives(LogLevel::Trace).contains("call_signaling=trace"));
    }

    #[test_timeout::timeout]
    fn missing_log_directory_is_reported() {
        let path = std::env::temp_dir()
            .join("call-peer-no-such-dir")
            .join("peer.log");
        assert!(matches!(
            open_writer(Some(path.as_path())),
            Err(InitError::Io { .. })
        ));
    }
}
