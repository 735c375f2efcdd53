use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    env, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use crate::hub::DEFAULT_SUBSCRIBER_CAPACITY;
use crate::session::Role;
use crate::settings::{CalibrationSettings, ConnectionSettings};

pub const CONFIG_PATH_ENV: &str = "MSR_RELAY_CONFIG";
pub const LISTEN_ENV: &str = "MSR_RELAY_LISTEN";
pub const HOST_ENV: &str = "MSR_RELAY_HOST";
pub const PORT_ENV: &str = "MSR_RELAY_PORT";

const DEFAULT_CONFIG_FILE: &str = "msr-relay.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub connection: ConnectionSettings,
    pub calibration: CalibrationSettings,
    pub hub_capacity: usize,
    /// Seed for the in-memory user directory.
    pub users: BTreeMap<String, Role>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            connection: ConnectionSettings::default(),
            calibration: CalibrationSettings::default(),
            hub_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            users: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Loads from `$MSR_RELAY_CONFIG` (or `msr-relay.json`), then applies
    /// environment overrides and validates.
    pub fn load() -> Result<Self> {
        let path = env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut config = Self::from_path(&path)?;
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// A missing file yields defaults; an unreadable or invalid one is an error.
    pub fn from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(listen) = lookup(LISTEN_ENV) {
            self.listen_addr = listen
                .trim()
                .parse()
                .with_context(|| format!("{LISTEN_ENV} is not a socket address: {listen}"))?;
        }
        if let Some(host) = lookup(HOST_ENV) {
            self.connection.host = host.trim().to_string();
        }
        if let Some(port) = lookup(PORT_ENV) {
            self.connection.port = port
                .trim()
                .parse()
                .with_context(|| format!("{PORT_ENV} is not a port number: {port}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.connection
            .validate()
            .context("Invalid connection settings")?;
        if self.hub_capacity == 0 {
            anyhow::bail!("hub_capacity must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::from_path(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.listen_addr.port(), 8000);
        assert_eq!(config.connection, ConnectionSettings::default());
        assert_eq!(config.hub_capacity, DEFAULT_SUBSCRIBER_CAPACITY);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "connection": {{ "host": "10.0.0.7", "retry_attempts": 5 }},
                "calibration": {{ "filter": 0.25 }},
                "users": {{ "ada": "admin", "olga": "operator" }}
            }}"#
        )
        .unwrap();

        let config = AppConfig::from_path(file.path()).unwrap();
        assert_eq!(config.connection.host, "10.0.0.7");
        assert_eq!(config.connection.retry_attempts, 5);
        assert_eq!(config.connection.port, 2345);
        assert_eq!(config.calibration.filter_coefficient, 0.25);
        assert_eq!(config.calibration.gain, 1.0);
        assert_eq!(config.users.get("ada"), Some(&Role::Admin));
        config.validate().unwrap();
    }

    #[test]
    fn invalid_file_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = AppConfig::from_path(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn environment_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            (LISTEN_ENV, "0.0.0.0:9000"),
            (HOST_ENV, " instrument.local "),
            (PORT_ENV, "4000"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.connection.host, "instrument.local");
        assert_eq!(config.connection.port, 4000);

        let mut config = AppConfig::default();
        let err = config
            .apply_overrides(|key| (key == PORT_ENV).then(|| "99999".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(PORT_ENV));
    }

    #[test]
    fn zero_values_fail_validation() {
        let mut config = AppConfig::default();
        config.connection.timeout_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.hub_capacity = 0;
        assert!(config.validate().is_err());
    }
}
