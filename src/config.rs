//! Configuration loading for the sample changer
//!
//! Read once at startup; the inventory layout it describes is never re-read
//! while the daemon runs.

use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use crate::{ChangerError, Result};

/// Drop spots per tray well
pub const MAX_DROPS_PER_WELL: u32 = 4;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChangerConfig {
    pub changer: VariantConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Physical layout of the storage, one entry per changer embodiment
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum VariantConfig {
    Robot { pucks: u32, pins_per_puck: u32 },
    Tray { rows: u32, columns: u32, drops: u32 },
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MonitorConfig {
    pub poll_interval_ms: Option<u64>,
    pub refresh_interval_ms: Option<u64>,
    pub restart_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TimeoutConfig {
    pub path_start_secs: Option<u64>,
    pub position_finish_secs: Option<u64>,
    pub tool_finish_secs: Option<u64>,
    pub maintenance_finish_secs: Option<u64>,
    pub phase_change_secs: Option<u64>,
    /// Upper bound on a single driver status call
    pub status_timeout_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExchangeConfig {
    pub safe_position: Option<String>,
    pub safe_position_path: Option<String>,
    pub required_tool: Option<String>,
    pub tool_change_path: Option<String>,
    /// Goniometer phase required before the arm reaches in
    pub transfer_phase: Option<String>,
    pub mount_flow: Option<String>,
    pub unmount_flow: Option<String>,
    pub flow_poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StoreConfig {
    pub location_key: Option<String>,
    pub flow_state_prefix: Option<String>,
    /// JSON file backing the key-value store; in-memory when absent
    pub path: Option<String>,
}

impl ChangerConfig {
    pub fn load_from_path(config_path: &str) -> Result<Self> {
        let contents = fs::read_to_string(config_path)
            .map_err(|e| ChangerError::Config(format!("Failed to read {}: {}", config_path, e)))?;
        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self> {
        let config: ChangerConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject layouts that cannot be addressed
    pub fn validate(&self) -> Result<()> {
        match self.changer {
            VariantConfig::Robot { pucks, pins_per_puck } => {
                if pucks == 0 || pins_per_puck == 0 {
                    return Err(ChangerError::Config(
                        "robot layout needs at least one puck and one pin".to_string(),
                    ));
                }
            }
            VariantConfig::Tray { rows, columns, drops } => {
                if rows == 0 || columns == 0 || drops == 0 {
                    return Err(ChangerError::Config(
                        "tray layout needs at least one row, column and drop".to_string(),
                    ));
                }
                if rows > 26 {
                    return Err(ChangerError::Config(format!(
                        "tray rows are lettered, {} rows exceeds A-Z",
                        rows
                    )));
                }
                if columns > 99 {
                    return Err(ChangerError::Config(format!(
                        "{} tray columns does not fit the well address format",
                        columns
                    )));
                }
                if drops > MAX_DROPS_PER_WELL {
                    return Err(ChangerError::Config(format!(
                        "tray wells hold spots 1-{}, got {} drops",
                        MAX_DROPS_PER_WELL, drops
                    )));
                }
            }
        }
        Ok(())
    }
}

impl MonitorConfig {
    /// Reconciliation period with default fallback
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(1000))
    }

    /// Container refresh period with default fallback
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.unwrap_or(5000))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms.unwrap_or(1000))
    }
}

impl TimeoutConfig {
    pub fn path_start(&self) -> Duration {
        Duration::from_secs(self.path_start_secs.unwrap_or(15))
    }

    pub fn position_finish(&self) -> Duration {
        Duration::from_secs(self.position_finish_secs.unwrap_or(120))
    }

    pub fn tool_finish(&self) -> Duration {
        Duration::from_secs(self.tool_finish_secs.unwrap_or(240))
    }

    pub fn maintenance_finish(&self) -> Duration {
        Duration::from_secs(self.maintenance_finish_secs.unwrap_or(250))
    }

    pub fn phase_change(&self) -> Duration {
        Duration::from_secs(self.phase_change_secs.unwrap_or(60))
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout_secs.unwrap_or(5))
    }

    /// Sleep between status polls while waiting on a path
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(200).clamp(100, 500))
    }
}

impl ExchangeConfig {
    pub fn safe_position(&self) -> String {
        self.safe_position.clone().unwrap_or_else(|| "SOAK".to_string())
    }

    pub fn safe_position_path(&self) -> String {
        self.safe_position_path.clone().unwrap_or_else(|| "soak".to_string())
    }

    pub fn required_tool(&self) -> String {
        self.required_tool.clone().unwrap_or_else(|| "DoubleGripper".to_string())
    }

    pub fn tool_change_path(&self) -> String {
        self.tool_change_path.clone().unwrap_or_else(|| "changetool".to_string())
    }

    pub fn transfer_phase(&self) -> String {
        self.transfer_phase.clone().unwrap_or_else(|| "Transfer".to_string())
    }

    pub fn mount_flow(&self) -> String {
        self.mount_flow.clone().unwrap_or_else(|| "mount-pin/mount_pin".to_string())
    }

    pub fn unmount_flow(&self) -> String {
        self.unmount_flow.clone().unwrap_or_else(|| "unmount-pin/unmount_pin".to_string())
    }

    pub fn flow_poll_interval(&self) -> Duration {
        Duration::from_millis(self.flow_poll_interval_ms.unwrap_or(3000))
    }
}

impl StoreConfig {
    pub fn location_key(&self) -> String {
        self.location_key.clone().unwrap_or_else(|| "current_drop_location".to_string())
    }

    pub fn flow_state_prefix(&self) -> String {
        self.flow_state_prefix.clone().unwrap_or_else(|| "mxcube_scan_state".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_robot_config_defaults() {
        let config = ChangerConfig::load_from_str(
            "changer:\n  variant: robot\n  pucks: 29\n  pins_per_puck: 16\n",
        )
        .unwrap();

        assert_eq!(
            config.changer,
            VariantConfig::Robot { pucks: 29, pins_per_puck: 16 }
        );
        assert_eq!(config.monitor.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.timeouts.path_start(), Duration::from_secs(15));
        assert_eq!(config.timeouts.position_finish(), Duration::from_secs(120));
        assert_eq!(config.timeouts.tool_finish(), Duration::from_secs(240));
        assert_eq!(config.timeouts.phase_change(), Duration::from_secs(60));
        assert_eq!(config.timeouts.status_timeout(), Duration::from_secs(5));
        assert_eq!(config.exchange.transfer_phase(), "Transfer");
        assert_eq!(config.exchange.safe_position(), "SOAK");
        assert_eq!(config.store.location_key(), "current_drop_location");
    }

    #[test]
    fn test_tray_config_overrides() {
        let yaml = r#"
changer:
  variant: tray
  rows: 8
  columns: 12
  drops: 3
timeouts:
  path_start_secs: 5
  poll_interval_ms: 50
exchange:
  unmount_flow: unmount-tray/unmount_tray
"#;
        let config = ChangerConfig::load_from_str(yaml).unwrap();
        assert_eq!(
            config.changer,
            VariantConfig::Tray { rows: 8, columns: 12, drops: 3 }
        );
        assert_eq!(config.timeouts.path_start(), Duration::from_secs(5));
        // Clamped to the cooperative sleep window
        assert_eq!(config.timeouts.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.exchange.unmount_flow(), "unmount-tray/unmount_tray");
    }

    #[test]
    fn test_invalid_layout_rejected() {
        let result = ChangerConfig::load_from_str(
            "changer:\n  variant: tray\n  rows: 27\n  columns: 12\n  drops: 1\n",
        );
        assert!(matches!(result, Err(ChangerError::Config(_))));

        let result = ChangerConfig::load_from_str(
            "changer:\n  variant: robot\n  pucks: 0\n  pins_per_puck: 16\n",
        );
        assert!(matches!(result, Err(ChangerError::Config(_))));

        let result = ChangerConfig::load_from_str(
            "changer:\n  variant: tray\n  rows: 8\n  columns: 12\n  drops: 5\n",
        );
        assert!(matches!(result, Err(ChangerError::Config(_))));
    }
}
