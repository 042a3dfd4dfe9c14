//! Configuration module for the lifecycle controller
//!
//! Supports loading configuration from a TOML file.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::lifecycle::{ControllerOptions, PowerWaitConfig, RunningUpdatePolicy};

/// Controller configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Host endpoint
    #[serde(default)]
    pub host: HostConfig,

    /// Power waits and update policy
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Hyper-V host connection settings
#[derive(Deserialize, Clone)]
pub struct HostConfig {
    /// Remote machine name; absent means the local host
    #[serde(default)]
    pub machine_name: Option<String>,

    #[serde(default)]
    pub domain: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Connection timeout in seconds (default: 30)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

// Keeps the password out of logs.
impl std::fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConfig")
            .field("machine_name", &self.machine_name)
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

/// Lifecycle controller settings
#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleConfig {
    /// Time allowed for each power transition (default: 120)
    #[serde(default = "default_power_timeout_secs")]
    pub power_timeout_secs: u64,

    /// Power state polling interval (default: 500)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Time allowed for one host job (default: 300)
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// `reject` or `stop-and-restart` (default: reject)
    #[serde(default)]
    pub running_update: RunningUpdatePolicy,

    /// Start a stopped VM before the stop-then-destroy sequence (default: true)
    #[serde(default = "default_start_before_delete")]
    pub start_before_delete: bool,

    /// Power on a newly created VM once its devices are attached (default: true)
    #[serde(default = "default_start_after_create")]
    pub start_after_create: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level filter (default: "hyperv_machine=info")
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_power_timeout_secs() -> u64 {
    120
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_job_timeout_secs() -> u64 {
    300
}

fn default_start_before_delete() -> bool {
    true
}

fn default_start_after_create() -> bool {
    true
}

fn default_log_level() -> String {
    "hyperv_machine=info".to_string()
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            machine_name: None,
            domain: None,
            username: None,
            password: None,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            power_timeout_secs: default_power_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            job_timeout_secs: default_job_timeout_secs(),
            running_update: RunningUpdatePolicy::default(),
            start_before_delete: default_start_before_delete(),
            start_after_create: default_start_after_create(),
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
    /// Load configuration from a TOML file
    ///
    /// If the file doesn't exist, returns default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }
}

impl HostConfig {
    pub fn is_local(&self) -> bool {
        self.machine_name
            .as_deref()
            .map_or(true, |m| m.is_empty() || m == "." || m.eq_ignore_ascii_case("localhost"))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// WMI connection settings for this host.
    #[cfg(windows)]
    pub fn connection_config(&self) -> crate::host::wmi::ConnectionConfig {
        use crate::host::wmi::{ConnectionConfig, Credentials};

        let mut config = match &self.machine_name {
            Some(machine) if !self.is_local() => ConnectionConfig::remote(machine.clone()),
            _ => ConnectionConfig::local(),
        };
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            let credentials = Credentials::new(username.clone(), password.clone());
            config = config.with_credentials(match &self.domain {
                Some(domain) => credentials.with_domain(domain.clone()),
                None => credentials,
            });
        }
        config.with_timeout(self.connect_timeout())
    }
}

impl LifecycleConfig {
    pub fn power_wait(&self) -> PowerWaitConfig {
        PowerWaitConfig::with_timeout(Duration::from_secs(self.power_timeout_secs))
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            power: self.power_wait(),
            running_update: self.running_update,
            start_before_delete: self.start_before_delete,
            start_after_create: self.start_after_create,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {message}")]
    Read { path: String, message: String },
    #[error("Failed to parse config file '{path}': {message}")]
    Parse { path: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.host.is_local());
        assert_eq!(config.host.connect_timeout_secs, 30);
        assert_eq!(config.lifecycle.power_timeout_secs, 120);
        assert_eq!(config.lifecycle.poll_interval_ms, 500);
        assert_eq!(config.lifecycle.job_timeout_secs, 300);
        assert_eq!(config.lifecycle.running_update, RunningUpdatePolicy::Reject);
        assert!(config.lifecycle.start_before_delete);
        assert!(config.lifecycle.start_after_create);
        assert_eq!(config.logging.level, "hyperv_machine=info");
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [lifecycle]
            running_update = "stop-and-restart"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(
            config.lifecycle.running_update,
            RunningUpdatePolicy::StopAndRestart
        );
        assert_eq!(config.lifecycle.power_timeout_secs, 120); // default
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [host]
            machine_name = "hv01"
            domain = "CONTOSO"
            username = "admin"
            password = "secret"
            connect_timeout_secs = 10

            [lifecycle]
            power_timeout_secs = 60
            poll_interval_ms = 250
            job_timeout_secs = 600
            running_update = "reject"
            start_before_delete = false
            start_after_create = false

            [logging]
            level = "hyperv_machine=debug"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(!config.host.is_local());
        assert_eq!(config.host.connect_timeout(), Duration::from_secs(10));

        let options = config.lifecycle.controller_options();
        assert_eq!(options.power.timeout, Duration::from_secs(60));
        assert_eq!(options.power.poll_interval, Duration::from_millis(250));
        assert!(!options.start_before_delete);
        assert!(!options.start_after_create);
        assert_eq!(config.lifecycle.job_timeout(), Duration::from_secs(600));
        assert_eq!(config.logging.level, "hyperv_machine=debug");
    }

    #[test]
    fn test_host_debug_redacts_password() {
        let config: Config = toml::from_str(
            r#"
            [host]
            username = "admin"
            password = "hunter2"
        "#,
        )
        .unwrap();
        let debug = format!("{:?}", config.host);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_localhost_names_are_local() {
        for name in ["", ".", "LOCALHOST"] {
            let host = HostConfig {
                machine_name: Some(name.to_string()),
                ..Default::default()
            };
            assert!(host.is_local(), "{name:?} should be local");
        }
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.lifecycle.power_timeout_secs, 120);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[lifecycle]\npower_timeout_secs = 5").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.lifecycle.power_timeout_secs, 5);
    }

    #[test]
    fn test_load_invalid_file_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[lifecycle\npower_timeout_secs = ").unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().starts_with("Failed to parse config file"));
    }
}
