//! Tool settings with OS-specific storage
//!
//! Handles:
//! - Command timeouts (probes, helpers, registry pull, fixes)
//! - Resource pressure thresholds
//! - Consent policy
//! - Backup and Docker config locations

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::consent::ConsentPolicy;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub timeouts: TimeoutSettings,
    pub thresholds: ThresholdSettings,
    pub registry: RegistrySettings,
    pub consent: ConsentSettings,
    pub paths: PathSettings,
    pub repair: RepairSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub command_ms: u64,
    pub helper_ms: u64,
    pub registry_ms: u64,
    pub fix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdSettings {
    pub memory_percent: f32,
    pub disk_free_percent: f32,
    pub docker_storage_percent: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub probe: bool,
    pub image: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsentSettings {
    pub policy: ConsentPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub docker_config: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairSettings {
    pub dry_run: bool,
    pub stop_on_failure: bool,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            command_ms: 10_000,
            helper_ms: 5_000,
            registry_ms: 60_000,
            fix_ms: 300_000,
        }
    }
}

impl Default for ThresholdSettings {
    fn default() -> Self {
        Self {
            memory_percent: 90.0,
            disk_free_percent: 10.0,
            docker_storage_percent: 85.0,
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            probe: true,
            image: "hello-world:latest".to_string(),
        }
    }
}

impl TimeoutSettings {
    pub fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }

    pub fn helper(&self) -> Duration {
        Duration::from_millis(self.helper_ms)
    }

    pub fn registry(&self) -> Duration {
        Duration::from_millis(self.registry_ms)
    }

    pub fn fix(&self) -> Duration {
        Duration::from_millis(self.fix_ms)
    }
}

impl Settings {
    /// Load settings from `CREDFIX_CONFIG` or the OS-specific location
    pub async fn load() -> Result<Self> {
        let path = Self::settings_file_path()?;

        if path.exists() {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            Self::parse(&content)
                .with_context(|| format!("Invalid settings file {}", path.display()))
        } else {
            // First run - defaults
            Ok(Self::default())
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Save settings to the OS-specific location
    pub async fn save(&self) -> Result<()> {
        let path = Self::settings_file_path()?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(&path, content).await?;
        Ok(())
    }

    pub fn settings_file_path() -> Result<PathBuf> {
        if let Ok(custom) = std::env::var("CREDFIX_CONFIG") {
            return Ok(PathBuf::from(custom));
        }

        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("docker-credential-fix");
        path.push("config.toml");
        Ok(path)
    }

    pub fn backup_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.paths.backup_dir {
            return Ok(dir.clone());
        }

        let mut path = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        path.push("docker-credential-fix");
        path.push("backups");
        Ok(path)
    }

    /// Docker client config file: override, then `$DOCKER_CONFIG`, then `~/.docker`
    pub fn docker_config_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.paths.docker_config {
            return Ok(path.clone());
        }
        if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
            if !dir.trim().is_empty() {
                return Ok(PathBuf::from(dir).join("config.json"));
            }
        }

        let home = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
        Ok(home.join(".docker").join("config.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repair::RiskLevel;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.thresholds.memory_percent, 90.0);
        assert_eq!(settings.thresholds.disk_free_percent, 10.0);
        assert_eq!(settings.thresholds.docker_storage_percent, 85.0);
        assert_eq!(settings.consent.policy, ConsentPolicy::Interactive);
        assert!(!settings.repair.stop_on_failure);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = Settings::parse(
            r#"
            [timeouts]
            helper_ms = 1500

            [consent]
            policy = { auto_approve = { below = "high" } }
            "#,
        )
        .unwrap();
        assert_eq!(settings.timeouts.helper(), Duration::from_millis(1500));
        assert_eq!(settings.timeouts.command_ms, 10_000);
        assert_eq!(settings.consent.policy, ConsentPolicy::AutoApprove { below: RiskLevel::High });
    }

    #[test]
    fn test_docker_config_override_wins() {
        let mut settings = Settings::default();
        settings.paths.docker_config = Some(PathBuf::from("/tmp/custom/config.json"));
        assert_eq!(settings.docker_config_path().unwrap(), PathBuf::from("/tmp/custom/config.json"));
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let settings = Settings::default();
        let text = toml::to_string_pretty(&settings).unwrap();
        assert_eq!(Settings::parse(&text).unwrap(), settings);
    }
}
