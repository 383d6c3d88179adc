//! Supervisor configuration
//!
//! Precedence: environment variables > config file > defaults. The config
//! file is TOML, read from an explicit path or from
//! `$XDG_CONFIG_HOME/ptykit/config.toml`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

use crate::broker::ExitPolicy;
use crate::session::ResizePolicy;

/// Tunables for a [`SessionSupervisor`](crate::SessionSupervisor)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SupervisorConfig {
    /// Capacity of each pump queue, in bytes
    pub buffer_capacity: usize,
    /// Largest single read from a master descriptor
    pub read_chunk: usize,
    /// Longest poll slice between child-exit sweeps
    pub reap_interval_ms: u64,
    /// Poll slice while a consumer is refusing output
    pub sink_retry_ms: u64,
    pub exit_policy: ExitPolicy,
    /// How long to wait for master EOF after the child is reaped
    pub eof_linger_ms: u64,
    pub resize_policy: ResizePolicy,
    /// Signal name used for graceful termination, e.g. "SIGHUP"
    pub terminate_signal: String,
    /// How long to wait for a child to disappear after SIGKILL
    pub kill_timeout_ms: u64,
    /// `TERM` given to children whose environment has none
    pub term: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            buffer_capacity: 64 * 1024,
            read_chunk: 4096,
            reap_interval_ms: 20,
            sink_retry_ms: 10,
            exit_policy: ExitPolicy::default(),
            eof_linger_ms: 200,
            resize_policy: ResizePolicy::default(),
            terminate_signal: "SIGHUP".to_string(),
            kill_timeout_ms: 5000,
            term: "xterm-256color".to_string(),
        }
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub message: String,
    pub field: Option<String>,
}

impl ConfigError {
    fn field(field: &str, message: impl Into<String>) -> Self {
        ConfigError {
            message: message.into(),
            field: Some(field.to_string()),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(field) = &self.field {
            write!(f, "Config error in '{}': {}", field, self.message)
        } else {
            write!(f, "Config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl SupervisorConfig {
    /// Load with full precedence: env > `path` (or the default location) > defaults.
    ///
    /// A missing file is not an error; an unreadable or invalid one is.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).or_else(Self::default_config_path);
        let mut config = match path {
            Some(path) if path.exists() => Self::load_from_file(&path)?,
            _ => SupervisorConfig::default(),
        };
        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError {
            message: format!("Failed to read config file {}: {}", path.display(), e),
            field: None,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError {
            message: format!("Failed to parse config file: {}", e),
            field: None,
        })
    }

    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("ptykit").join("config.toml"))
    }

    /// Apply `PTYKIT_*` overrides looked up through `var`.
    fn apply_env<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::field(key, format!("Invalid value '{}'", value)))
        }

        if let Some(v) = var("PTYKIT_BUFFER_CAPACITY") {
            self.buffer_capacity = parse("PTYKIT_BUFFER_CAPACITY", v)?;
        }
        if let Some(v) = var("PTYKIT_READ_CHUNK") {
            self.read_chunk = parse("PTYKIT_READ_CHUNK", v)?;
        }
        if let Some(v) = var("PTYKIT_REAP_INTERVAL_MS") {
            self.reap_interval_ms = parse("PTYKIT_REAP_INTERVAL_MS", v)?;
        }
        if let Some(v) = var("PTYKIT_SINK_RETRY_MS") {
            self.sink_retry_ms = parse("PTYKIT_SINK_RETRY_MS", v)?;
        }
        if let Some(v) = var("PTYKIT_EOF_LINGER_MS") {
            self.eof_linger_ms = parse("PTYKIT_EOF_LINGER_MS", v)?;
        }
        if let Some(v) = var("PTYKIT_EXIT_POLICY") {
            self.exit_policy = match v.as_str() {
                "first-confirmation" => ExitPolicy::FirstConfirmation,
                "await-eof" => ExitPolicy::AwaitEof,
                _ => {
                    return Err(ConfigError::field(
                        "PTYKIT_EXIT_POLICY",
                        format!("Unknown exit policy '{}'", v),
                    ))
                }
            };
        }
        if let Some(v) = var("PTYKIT_RESIZE_POLICY") {
            self.resize_policy = match v.as_str() {
                "signal-on-change" => ResizePolicy::SignalOnChange,
                "always-signal" => ResizePolicy::AlwaysSignal,
                _ => {
                    return Err(ConfigError::field(
                        "PTYKIT_RESIZE_POLICY",
                        format!("Unknown resize policy '{}'", v),
                    ))
                }
            };
        }
        if let Some(v) = var("PTYKIT_TERMINATE_SIGNAL") {
            self.terminate_signal = v;
        }
        if let Some(v) = var("PTYKIT_KILL_TIMEOUT_MS") {
            self.kill_timeout_ms = parse("PTYKIT_KILL_TIMEOUT_MS", v)?;
        }
        if let Some(v) = var("PTYKIT_TERM") {
            self.term = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_capacity == 0 {
            return Err(ConfigError::field(
                "buffer-capacity",
                "Buffer capacity must be at least 1 byte",
            ));
        }
        if self.read_chunk == 0 {
            return Err(ConfigError::field(
                "read-chunk",
                "Read chunk must be at least 1 byte",
            ));
        }
        if self.reap_interval_ms == 0 {
            return Err(ConfigError::field(
                "reap-interval-ms",
                "Reap interval must be at least 1ms",
            ));
        }
        self.parse_terminate_signal()?;
        if self.term.is_empty() || self.term.contains('\0') {
            return Err(ConfigError::field("term", "TERM must be a non-empty string"));
        }
        Ok(())
    }

    fn parse_terminate_signal(&self) -> Result<Signal, ConfigError> {
        let name = self.terminate_signal.trim().to_ascii_uppercase();
        let name = if name.starts_with("SIG") {
            name
        } else {
            format!("SIG{}", name)
        };
        Signal::from_str(&name).map_err(|_| {
            ConfigError::field(
                "terminate-signal",
                format!("Unknown signal '{}'", self.terminate_signal),
            )
        })
    }

    /// The graceful termination signal, SIGHUP if the name does not parse
    pub fn terminate_signal(&self) -> Signal {
        self.parse_terminate_signal().unwrap_or(Signal::SIGHUP)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn sink_retry(&self) -> Duration {
        Duration::from_millis(self.sink_retry_ms.max(1))
    }

    pub fn eof_linger(&self) -> Duration {
        Duration::from_millis(self.eof_linger_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = SupervisorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.terminate_signal(), Signal::SIGHUP);
        assert_eq!(config.exit_policy, ExitPolicy::FirstConfirmation);
        assert_eq!(config.resize_policy, ResizePolicy::SignalOnChange);
    }

    #[test]
    fn test_config_toml_parsing() {
        let config = SupervisorConfig::from_toml_str(
            r#"
            buffer-capacity = 1024
            exit-policy = "await-eof"
            resize-policy = "always-signal"
            terminate-signal = "TERM"
            "#,
        )
        .unwrap();
        assert_eq!(config.buffer_capacity, 1024);
        assert_eq!(config.exit_policy, ExitPolicy::AwaitEof);
        assert_eq!(config.resize_policy, ResizePolicy::AlwaysSignal);
        assert_eq!(config.terminate_signal(), Signal::SIGTERM);
        // Unspecified keys keep their defaults
        assert_eq!(config.read_chunk, 4096);
    }

    #[test]
    fn test_config_validation() {
        let mut config = SupervisorConfig::default();

        config.buffer_capacity = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.field.as_deref(), Some("buffer-capacity"));
        config.buffer_capacity = 16;

        config.terminate_signal = "SIGNOPE".to_string();
        assert!(config.validate().is_err());
        config.terminate_signal = "sigterm".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PTYKIT_BUFFER_CAPACITY", "2048"),
            ("PTYKIT_RESIZE_POLICY", "always-signal"),
            ("PTYKIT_TERMINATE_SIGNAL", "SIGINT"),
            ("PTYKIT_SINK_RETRY_MS", "25"),
            ("PTYKIT_EOF_LINGER_MS", "750"),
        ]
        .into_iter()
        .collect();

        let mut config = SupervisorConfig::default();
        config
            .apply_env(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.buffer_capacity, 2048);
        assert_eq!(config.resize_policy, ResizePolicy::AlwaysSignal);
        assert_eq!(config.terminate_signal(), Signal::SIGINT);
        assert_eq!(config.sink_retry(), Duration::from_millis(25));
        assert_eq!(config.eof_linger(), Duration::from_millis(750));

        let err = config
            .apply_env(|key| (key == "PTYKIT_READ_CHUNK").then(|| "lots".to_string()))
            .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("PTYKIT_READ_CHUNK"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "read-chunk = 512\nterm = \"vt100\"").unwrap();

        let config = SupervisorConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.read_chunk, 512);
        assert_eq!(config.term, "vt100");
    }

    #[test]
    fn test_load_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "buffer-capacity = \"big\"").unwrap();

        let err = SupervisorConfig::load_from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }
}
