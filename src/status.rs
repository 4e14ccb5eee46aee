//! Raw device status snapshots and the unified high-level state

use serde::{Deserialize, Serialize};
use std::fmt;
use crate::address::SlotAddress;

/// Immutable per-poll snapshot of the robot actuator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotStatus {
    pub powered: bool,
    pub remote_mode: bool,
    pub fault_or_stopped: bool,
    /// Controller error code / message, if any is latched
    pub error: Option<String>,
    /// Named position, e.g. `SOAK` or `HOME`
    pub position: String,
    /// Active trajectory name; empty when idle
    pub path: String,
    pub tool: String,
    /// Pin currently on the goniometer
    pub mounted: Option<SlotAddress>,
    /// Tray currently on the goniometer, by robot plate id
    pub mounted_plate: Option<u32>,
    /// Trajectories that have returned to idle since the controller started
    #[serde(default)]
    pub completed_paths: u64,
}

impl RobotStatus {
    pub fn is_enabled(&self) -> bool {
        self.powered && self.remote_mode
    }

    pub fn is_idle(&self) -> bool {
        self.path.is_empty()
    }
}

impl Default for RobotStatus {
    fn default() -> Self {
        Self {
            powered: false,
            remote_mode: false,
            fault_or_stopped: false,
            error: None,
            position: "UNKNOWN".to_string(),
            path: String::new(),
            tool: String::new(),
            mounted: None,
            mounted_plate: None,
            completed_paths: 0,
        }
    }
}

/// Translation stage / goniometer state used by the tray variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageState {
    Ready,
    Moving,
    Fault,
    Alarm,
    Unknown,
}

impl StageState {
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "ready" => StageState::Ready,
            "moving" | "running" | "busy" => StageState::Moving,
            "fault" => StageState::Fault,
            "alarm" => StageState::Alarm,
            _ => StageState::Unknown,
        }
    }
}

/// Snapshot of the tray stage: motion state plus goniometer phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStatus {
    pub state: StageState,
    pub phase: String,
}

impl StageStatus {
    pub fn in_transfer_phase(&self) -> bool {
        self.phase.eq_ignore_ascii_case("transfer")
    }
}

/// Unified state of the sample changer, re-evaluated on every poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HighLevelState {
    #[default]
    Unknown,
    Disabled,
    Fault,
    Alarm,
    Ready,
    Loading,
    Unloading,
    Selecting,
    Scanning,
    Moving,
    Loaded,
    Charging,
}

impl HighLevelState {
    pub fn name(&self) -> &'static str {
        match self {
            HighLevelState::Unknown => "UNKNOWN",
            HighLevelState::Disabled => "DISABLED",
            HighLevelState::Fault => "FAULT",
            HighLevelState::Alarm => "ALARM",
            HighLevelState::Ready => "READY",
            HighLevelState::Loading => "LOADING",
            HighLevelState::Unloading => "UNLOADING",
            HighLevelState::Selecting => "SELECTING",
            HighLevelState::Scanning => "SCANNING",
            HighLevelState::Moving => "MOVING",
            HighLevelState::Loaded => "LOADED",
            HighLevelState::Charging => "CHARGING",
        }
    }

    /// States in which the mechanism is transferring a sample
    pub fn is_transferring(&self) -> bool {
        matches!(
            self,
            HighLevelState::Loading
                | HighLevelState::Unloading
                | HighLevelState::Selecting
                | HighLevelState::Charging
        )
    }
}

impl fmt::Display for HighLevelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
