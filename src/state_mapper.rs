//! Mapping of raw device status onto [`HighLevelState`]
//!
//! The mappers are pure: the same snapshot always yields the same state.
//! Several raw conditions can hold at once, so the rules are evaluated in
//! priority order and the first match wins. Edge detection lives in
//! [`StateTracker`], which only reports a transition when the computed state
//! differs from the last one it emitted.

use crate::status::{HighLevelState, RobotStatus, StageState, StageStatus};

/// Robot trajectory names with a dedicated high-level state; any other
/// non-empty path maps to `Moving`
pub const PATH_STATES: &[(&str, HighLevelState)] = &[
    ("put", HighLevelState::Loading),
    ("getput", HighLevelState::Loading),
    ("putht", HighLevelState::Loading),
    ("getputht", HighLevelState::Loading),
    ("get", HighLevelState::Unloading),
    ("getht", HighLevelState::Unloading),
    ("pick", HighLevelState::Selecting),
    ("datamatrix", HighLevelState::Scanning),
];

/// State implied by an active, non-empty path
pub fn path_state(path: &str) -> HighLevelState {
    PATH_STATES
        .iter()
        .find(|(name, _)| *name == path)
        .map(|(_, state)| *state)
        .unwrap_or(HighLevelState::Moving)
}

/// Map a robot actuator snapshot
pub fn map_robot_status(status: &RobotStatus) -> HighLevelState {
    if !status.is_enabled() {
        HighLevelState::Disabled
    } else if status.fault_or_stopped {
        HighLevelState::Fault
    } else if status.error.is_some() {
        HighLevelState::Alarm
    } else if !status.path.is_empty() {
        path_state(&status.path)
    } else if status.mounted.is_some() {
        HighLevelState::Loaded
    } else if status.is_enabled() && status.is_idle() {
        HighLevelState::Ready
    } else {
        HighLevelState::Unknown
    }
}

/// Map a tray stage snapshot; `has_loaded` is whether a well is at the beam
pub fn map_stage_status(status: &StageStatus, has_loaded: bool) -> HighLevelState {
    match status.state {
        StageState::Ready if status.in_transfer_phase() => HighLevelState::Charging,
        StageState::Ready if has_loaded => HighLevelState::Loaded,
        StageState::Ready => HighLevelState::Ready,
        StageState::Moving => HighLevelState::Moving,
        StageState::Fault => HighLevelState::Fault,
        StageState::Alarm => HighLevelState::Alarm,
        StageState::Unknown => HighLevelState::Unknown,
    }
}

/// A change of high-level state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: HighLevelState,
    pub to: HighLevelState,
}

/// Edge detector over the level-triggered poll
#[derive(Debug, Default)]
pub struct StateTracker {
    last: HighLevelState,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> HighLevelState {
        self.last
    }

    /// Record a freshly computed state, returning the transition if it changed
    pub fn update(&mut self, next: HighLevelState) -> Option<StateTransition> {
        if next == self.last {
            return None;
        }
        let transition = StateTransition { from: self.last, to: next };
        self.last = next;
        Some(transition)
    }
}
