//! Global `tracing` subscriber for the console binary.
//!
//! Logs go to stderr (stdout belongs to the console) or to a file. Only this
//! workspace's crates log at the chosen level; dependencies stay at `warn`.
//! Raw protocol traffic is traced by two `v8_debug_client` modules and is
//! shown only when wire logging is asked for.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Replaces the computed directives entirely.
pub const FILTER_ENV: &str = "JSCONSOLE_LOG_FILTER";

const OWN_TARGETS: &[&str] = &["jsconsole", "jsconsole_core", "v8_debug_client"];
const WIRE_TARGETS: &[&str] = &["v8_debug_client::framed", "v8_debug_client::protocol::client"];

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
    pub fn as_str(self) -> &'static str {
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
    /// Trace every frame sent to and received from the debug agent.
    pub wire: bool,
}

impl LogConfig {
    /// `EnvFilter` directives for this config, unless `custom` overrides them.
    pub fn directives(&self, custom: Option<String>) -> String {
        if let Some(custom) = custom.filter(|custom| !custom.trim().is_empty()) {
            return custom;
        }
        let mut directives = vec!["warn".to_string()];
        if self.level != LogLevel::Warn {
            for target in OWN_TARGETS {
                directives.push(format!("{target}={}", self.level.as_str()));
            }
        }
        if self.wire {
            for target in WIRE_TARGETS {
                directives.push(format!("{target}=trace"));
            }
        } else if self.level == LogLevel::Trace {
            // Trace level without wire logging still hides frame payloads.
            for target in WIRE_TARGETS {
                directives.push(format!("{target}=debug"));
            }
        }
        directives.join(",")
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid log filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },
    #[error("failed to install logger: {0}")]
    Install(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let directives = config.directives(std::env::var(FILTER_ENV).ok());
    let filter = EnvFilter::try_new(&directives).map_err(|err| InitError::Filter {
        filter: directives.clone(),
        reason: err.to_string(),
    })?;

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level >= LogLevel::Debug || config.wire)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Install(err.to_string()))?;

    let _ = GUARD.set(guard);
    tracing::debug!(filter = %directives, "logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(level: LogLevel, wire: bool) -> LogConfig {
        LogConfig {
            level,
            file: None,
            wire,
        }
    }

    #[test]
    fn default_level_keeps_everything_at_warn() {
        assert_eq!(LogConfig::default().directives(None), "warn");
    }

    #[test]
    fn debug_level_applies_to_workspace_crates_only() {
        let directives = config(LogLevel::Debug, false).directives(None);
        assert_eq!(
            directives,
            "warn,jsconsole=debug,jsconsole_core=debug,v8_debug_client=debug"
        );
    }

    #[test]
    fn trace_level_hides_frames_unless_wire_is_on() {
        let quiet = config(LogLevel::Trace, false).directives(None);
        assert!(quiet.contains("jsconsole_core=trace"));
        assert!(quiet.ends_with("v8_debug_client::protocol::client=debug"));

        let wire = config(LogLevel::Warn, true).directives(None);
        assert_eq!(
            wire,
            "warn,v8_debug_client::framed=trace,v8_debug_client::protocol::client=trace"
        );
    }

    #[test]
    fn error_level_silences_workspace_warnings() {
        let directives = config(LogLevel::Error, false).directives(None);
        assert!(directives.contains("v8_debug_client=error"));
    }

    #[test]
    fn custom_filter_wins_unless_blank() {
        let base = config(LogLevel::Info, true);
        assert_eq!(base.directives(Some("tungstenite=trace".into())), "tungstenite=trace");
        assert!(base.directives(Some("  ".into())).contains("jsconsole=info"));
    }
}
