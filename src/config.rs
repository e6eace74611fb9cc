//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `SHELLMUX_IP`, `SHELLMUX_SHELL_PORT`,
//!    `SHELLMUX_STDIN_PORT`
//! 2. **Config file** — path via `--config <path>`, or `shellmux.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! ip = "127.0.0.1"
//! shell_port = 0      # 0 requests an ephemeral port
//! stdin_port = 0
//! poll_interval_ms = 100
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Endpoint and routing settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the public endpoints bind to (default `127.0.0.1`).
    #[serde(default = "default_ip")]
    pub ip: String,
    /// Public shell endpoint port. 0 requests an ephemeral port (default 0).
    #[serde(default)]
    pub shell_port: u16,
    /// Public stdin endpoint port. 0 requests an ephemeral port (default 0).
    #[serde(default)]
    pub stdin_port: u16,
    /// Channel poll timeout for the default subshell loop, in milliseconds
    /// (default 100).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            shell_port: 0,
            stdin_port: 0,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `shellmux.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("shellmux.toml").exists() {
            let content =
                std::fs::read_to_string("shellmux.toml").expect("Failed to read shellmux.toml");
            toml::from_str(&content).expect("Failed to parse shellmux.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(ip) = std::env::var("SHELLMUX_IP") {
            config.server.ip = ip;
        }
        if let Ok(port) = std::env::var("SHELLMUX_SHELL_PORT") {
            if let Ok(port) = port.parse() {
                config.server.shell_port = port;
            }
        }
        if let Ok(port) = std::env::var("SHELLMUX_STDIN_PORT") {
            if let Ok(port) = port.parse() {
                config.server.stdin_port = port;
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.ip, "127.0.0.1");
        assert_eq!(config.server.shell_port, 0);
        assert_eq!(config.server.stdin_port, 0);
        assert_eq!(config.server.poll_interval_ms, 100);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r"
            [server]
            shell_port = 5555
            ",
        )
        .unwrap();
        assert_eq!(config.server.shell_port, 5555);
        // Unset fields keep their defaults.
        assert_eq!(config.server.stdin_port, 0);
        assert_eq!(config.server.ip, "127.0.0.1");
    }
}
