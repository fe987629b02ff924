use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DashboardConfig {
    /// ex: "127.0.0.1:8080"
    pub bind: String,
    /// Finished scans kept in memory; the oldest are dropped first
    pub history: usize,
    /// Progress events buffered per SSE subscriber
    pub event_buffer: usize,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".into(),
            history: 50,
            event_buffer: 256,
        }
    }
}

pub fn parse_config(txt: &str) -> DashboardConfig {
    if txt.trim().is_empty() {
        return DashboardConfig::default();
    }
    serde_yaml::from_str(txt).unwrap_or_else(|e| {
        warn!("Invalid dashboard config, using defaults: {e}");
        DashboardConfig::default()
    })
}

pub async fn load_config() -> DashboardConfig {
    let path = std::env::var("CREDFIX_DASHBOARD_CONFIG").unwrap_or_else(|_| "dashboard.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt)
    } else {
        info!("No {path}, using default dashboard config");
        DashboardConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg = parse_config("bind: 0.0.0.0:9000\n");
        assert_eq!(cfg.bind, "0.0.0.0:9000");
        assert_eq!(cfg.history, 50);
    }

    #[test]
    fn test_invalid_yaml_falls_back() {
        assert_eq!(parse_config("history: [oops"), DashboardConfig::default());
        assert_eq!(parse_config("   "), DashboardConfig::default());
    }
}
