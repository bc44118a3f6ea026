//! Configuration management with cross-platform storage
//!
//! Handles:
//! - Server endpoints and the shared agent secret
//! - Reporting cadence and retry policy
//! - Auto-update, power policy and maintenance schedules
//! - TOML file under the OS config directory

use anyhow::Result;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server: ServerConfig,
    pub reporting: ReportingConfig,
    pub execution: ExecutionConfig,
    pub update: UpdateConfig,
    pub power: PowerConfig,
    pub maintenance: MaintenanceConfig,
    pub agent: AgentInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub base_url: String,
    pub update_base_url: String,
    pub secret: String,
    /// Lab servers run on self-signed certificates.
    pub accept_invalid_certs: bool,
    pub http_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportingConfig {
    pub telemetry_interval_secs: u64,
    pub network_probe_interval_secs: u64,
    pub probe_target: String,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub registration_retry_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub script_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    pub enabled: bool,
    pub check_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    pub auto_shutdown: bool,
    /// Local wall-clock time after which an idle machine is shut down, "HH:MM".
    pub curfew: String,
    pub idle_tolerance_secs: u64,
    pub shutdown_grace_secs: u32,
    pub check_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    pub restore_point_cooldown_hours: u64,
    pub check_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentInfo {
    pub hostname: String,
    /// Fixed localhost port used as the single-instance lock.
    pub single_instance_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://127.0.0.1:3001/api".to_string(),
            update_base_url: "https://127.0.0.1:3001/updates".to_string(),
            secret: "fleetmon-dev-secret".to_string(),
            accept_invalid_certs: true,
            http_timeout_secs: 30,
        }
    }
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            telemetry_interval_secs: 20,
            network_probe_interval_secs: 30,
            probe_target: "8.8.8.8".to_string(),
            max_retries: 3,
            retry_delay_secs: 10,
            registration_retry_secs: 30,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            script_timeout_secs: 300,
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: 60,
        }
    }
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            auto_shutdown: true,
            curfew: "19:15".to_string(),
            idle_tolerance_secs: 300,
            shutdown_grace_secs: 60,
            check_interval_secs: 60,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            restore_point_cooldown_hours: 168,
            check_interval_secs: 21_600,
        }
    }
}

impl Default for AgentInfo {
    fn default() -> Self {
        Self {
            hostname: hostname::get().unwrap_or_default().to_string_lossy().to_string(),
            single_instance_port: 47_621,
        }
    }
}

impl AgentConfig {
    /// Load config from an explicit path or the OS-specific location.
    ///
    /// A missing file is not an error. The agent runs on defaults so a
    /// freshly imaged machine reports without any manual setup.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_file_path()?,
        };

        if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path).await?;
            let config: AgentConfig = toml::from_str(&content)?;
            info!("Loaded configuration from {}", config_path.display());
            Ok(config)
        } else {
            info!("No configuration file at {}, using defaults", config_path.display());
            Ok(Self::default())
        }
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        path.push("fleetmon-agent");
        path.push("config.toml");
        Ok(path)
    }
}

impl ServerConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

impl ReportingConfig {
    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_interval_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.network_probe_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn registration_retry(&self) -> Duration {
        Duration::from_secs(self.registration_retry_secs)
    }
}

impl ExecutionConfig {
    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_secs)
    }
}

impl UpdateConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

impl PowerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Parse the configured curfew, `None` if it is not valid "HH:MM".
    pub fn curfew_time(&self) -> Option<NaiveTime> {
        NaiveTime::parse_from_str(&self.curfew, "%H:%M").ok()
    }
}

impl MaintenanceConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.restore_point_cooldown_hours * 3600)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.reporting.telemetry_interval_secs, 20);
        assert_eq!(config.reporting.max_retries, 3);
        assert_eq!(config.reporting.retry_delay_secs, 10);
        assert_eq!(config.power.curfew, "19:15");
        assert_eq!(config.maintenance.restore_point_cooldown_hours, 168);
        assert!(config.server.base_url.starts_with("https://"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: AgentConfig = toml::from_str(
            r#"
            [server]
            base_url = "https://10.1.2.3:3001/api"

            [power]
            curfew = "21:00"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.base_url, "https://10.1.2.3:3001/api");
        assert_eq!(config.server.http_timeout_secs, 30);
        assert_eq!(config.power.curfew, "21:00");
        assert_eq!(config.power.idle_tolerance_secs, 300);
        assert_eq!(config.reporting.telemetry_interval_secs, 20);
    }

    #[test]
    fn test_curfew_parsing() {
        let mut power = PowerConfig::default();
        assert_eq!(
            power.curfew_time(),
            Some(NaiveTime::from_hms_opt(19, 15, 0).unwrap())
        );

        power.curfew = "25:99".to_string();
        assert_eq!(power.curfew_time(), None);

        power.curfew = "garbage".to_string();
        assert_eq!(power.curfew_time(), None);
    }

    #[test]
    fn test_config_file_path() {
        let path = AgentConfig::config_file_path().unwrap();
        assert!(path.to_string_lossy().contains("fleetmon-agent"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }
}
