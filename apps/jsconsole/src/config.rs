use std::env;
use std::time::Duration;

use v8_debug_client::ClientOptions;
use v8_debug_client::protocol::{DEFAULT_EVENT_CAPACITY, DEFAULT_REQUEST_TIMEOUT};

pub const DEFAULT_DEBUG_HOST: &str = "127.0.0.1";
pub const DEFAULT_MAX_SCOPE_DEPTH: usize = 32;

/// Debug session configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Host the engine's debug port listens on (defaults to loopback)
    pub debug_host: String,
    /// Default per-request timeout; `None` waits for the response or the close
    pub request_timeout: Option<Duration>,
    /// Deepest reference chain scope resolution follows
    pub max_scope_depth: usize,
    pub event_buffer: usize,
}

impl SessionConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let debug_host = env::var("JSCONSOLE_DEBUG_HOST")
            .ok()
            .map(|host| host.trim().to_string())
            .filter(|host| !host.is_empty())
            .unwrap_or_else(|| DEFAULT_DEBUG_HOST.to_string());
        // Normalize localhost to IPv4 so the agent's IPv4-only listener is reachable
        let debug_host = if debug_host == "localhost" {
            DEFAULT_DEBUG_HOST.to_string()
        } else {
            debug_host
        };

        let timeout = parse_duration_env("JSCONSOLE_REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT);
        Self {
            debug_host,
            request_timeout: (!timeout.is_zero()).then_some(timeout),
            max_scope_depth: parse_usize_env(
                "JSCONSOLE_MAX_SCOPE_DEPTH",
                DEFAULT_MAX_SCOPE_DEPTH,
                1,
            ),
            event_buffer: parse_usize_env("JSCONSOLE_EVENT_BUFFER", DEFAULT_EVENT_CAPACITY, 1),
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            request_timeout: self.request_timeout,
            event_capacity: self.event_buffer,
        }
    }

    pub fn debug_uri(&self, port: u16) -> String {
        format!("tcp://{}:{port}", self.debug_host)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debug_host: DEFAULT_DEBUG_HOST.to_string(),
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            max_scope_depth: DEFAULT_MAX_SCOPE_DEPTH,
            event_buffer: DEFAULT_EVENT_CAPACITY,
        }
    }
}

fn parse_duration_env(var: &str, default: Duration) -> Duration {
    match env::var(var) {
        Ok(value) => match value.trim().parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(err) => {
                tracing::warn!(
                    target = "jsconsole::config",
                    var,
                    error = %err,
                    default_ms = default.as_millis(),
                    "invalid duration env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_usize_env(var: &str, default: usize, min: usize) -> usize {
    match env::var(var) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                tracing::warn!(
                    target = "jsconsole::config",
                    var,
                    parsed,
                    min,
                    default,
                    "session config below minimum; using default"
                );
                default
            }
            Err(err) => {
                tracing::warn!(
                    target = "jsconsole::config",
                    var,
                    error = %err,
                    default,
                    "failed to parse session config from env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Environment variable tests must not run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const VARS: &[&str] = &[
        "JSCONSOLE_DEBUG_HOST",
        "JSCONSOLE_REQUEST_TIMEOUT_MS",
        "JSCONSOLE_MAX_SCOPE_DEPTH",
        "JSCONSOLE_EVENT_BUFFER",
    ];

    fn clear_env() {
        unsafe {
            for var in VARS {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn defaults_without_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        assert_eq!(SessionConfig::from_env(), SessionConfig::default());
    }

    #[test]
    fn reads_custom_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("JSCONSOLE_DEBUG_HOST", "localhost");
            env::set_var("JSCONSOLE_REQUEST_TIMEOUT_MS", "250");
            env::set_var("JSCONSOLE_MAX_SCOPE_DEPTH", "4");
            env::set_var("JSCONSOLE_EVENT_BUFFER", "8");
        }
        let config = SessionConfig::from_env();
        clear_env();

        assert_eq!(config.debug_host, "127.0.0.1");
        assert_eq!(config.request_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.max_scope_depth, 4);
        assert_eq!(config.client_options().event_capacity, 8);
        assert_eq!(config.debug_uri(5858), "tcp://127.0.0.1:5858");
    }

    #[test]
    fn zero_timeout_disables_default_timeout() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("JSCONSOLE_REQUEST_TIMEOUT_MS", "0");
        }
        let config = SessionConfig::from_env();
        clear_env();
        assert_eq!(config.request_timeout, None);
    }

    #[test]
    fn invalid_values_fall_back() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("JSCONSOLE_REQUEST_TIMEOUT_MS", "soon");
            env::set_var("JSCONSOLE_MAX_SCOPE_DEPTH", "0");
            env::set_var("JSCONSOLE_EVENT_BUFFER", "-1");
        }
        let config = SessionConfig::from_env();
        clear_env();
        assert_eq!(config, SessionConfig::default());
    }
}
