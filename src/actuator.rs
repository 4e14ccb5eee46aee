//! Device seams for the two changer embodiments
//!
//! The sample changer never talks to hardware directly; it goes through these
//! traits so the same orchestration drives a real controller client, the
//! simulator in [`crate::sim`], or a test double. Status is always polled,
//! never pushed. Trajectory triggers return as soon as the controller has
//! accepted the command; completion is observed through `status()`.

use async_trait::async_trait;
use crate::address::SlotAddress;
use crate::inventory::ContainerInfo;
use crate::status::{RobotStatus, StageStatus};

/// Robot arm controller
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn status(&self) -> anyhow::Result<RobotStatus>;

    /// Pucks currently sitting in the dewar
    async fn loaded_pucks(&self) -> anyhow::Result<Vec<ContainerInfo>>;

    /// Trays currently in the tray hotel
    async fn loaded_trays(&self) -> anyhow::Result<Vec<ContainerInfo>>;

    /// Start the trajectory to a named position (`SOAK`, `HOME`, ...)
    async fn move_to_position(&self, position: &str) -> anyhow::Result<()>;

    /// Start the tool change trajectory
    async fn change_tool(&self, tool: &str) -> anyhow::Result<()>;

    /// Start an auxiliary trajectory by name (`dry`, `returnpin`, ...)
    async fn run_path(&self, path: &str) -> anyhow::Result<()>;

    async fn mount(&self, address: &SlotAddress) -> anyhow::Result<()>;

    async fn unmount(&self) -> anyhow::Result<()>;

    /// Clear latched faults and errors
    async fn reset(&self) -> anyhow::Result<()>;

    /// Stop the running trajectory
    async fn abort(&self) -> anyhow::Result<()>;
}

/// Goniometer, including the translation stages that bring tray wells
/// under the beam
#[async_trait]
pub trait Stage: Send + Sync {
    async fn status(&self) -> anyhow::Result<StageStatus>;

    /// Start the move that centres `well` on the beam
    async fn move_to_well(&self, well: &SlotAddress) -> anyhow::Result<()>;

    /// Start switching to `phase` (`Transfer`, `DataCollection`, ...)
    async fn change_phase(&self, phase: &str) -> anyhow::Result<()>;

    async fn abort(&self) -> anyhow::Result<()>;
}
