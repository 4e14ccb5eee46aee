//! Simulated hardware
//!
//! In-process stand-ins for the robot controller, the tray stages and the
//! external flow runner. Trajectories run on spawned tasks and take a fixed
//! (configurable) time, so they behave like the real controller: the trigger
//! returns immediately and progress is only visible through `status()`.
//! Used by `scd --simulate` and throughout the test suite.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};
use crate::actuator::{Actuator, Stage};
use crate::address::SlotAddress;
use crate::flow::{flow_state_key, FlowLauncher, FlowState};
use crate::inventory::ContainerInfo;
use crate::status::{RobotStatus, StageState, StageStatus};
use crate::store::KeyValueStore;

const DEFAULT_PATH_DURATION: Duration = Duration::from_secs(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Misbehaviour injected into a named trajectory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrajectoryFault {
    /// Command accepted but the path never becomes active
    NeverStarts,
    /// Path becomes active and stays active
    NeverFinishes,
    /// Path runs to completion without reaching its target
    WrongOutcome,
}

struct SimRobot {
    status: RobotStatus,
    pucks: Vec<ContainerInfo>,
    trays: Vec<ContainerInfo>,
    faults: HashMap<String, TrajectoryFault>,
    commands: Vec<String>,
    path_duration: Duration,
    failing_polls: u32,
    /// Status polls never return once set
    unresponsive: bool,
    hang_after_command: bool,
    /// Bumped on abort so in-flight trajectories drop their outcome
    generation: u64,
}

/// Simulated robot controller
pub struct SimActuator {
    robot: Arc<Mutex<SimRobot>>,
}

impl SimActuator {
    /// Powered, in remote mode, parked at HOME with the double gripper
    pub fn new() -> Self {
        let status = RobotStatus {
            powered: true,
            remote_mode: true,
            position: "HOME".to_string(),
            tool: "DoubleGripper".to_string(),
            ..RobotStatus::default()
        };
        Self {
            robot: Arc::new(Mutex::new(SimRobot {
                status,
                pucks: Vec::new(),
                trays: Vec::new(),
                faults: HashMap::new(),
                commands: Vec::new(),
                path_duration: DEFAULT_PATH_DURATION,
                failing_polls: 0,
                unresponsive: false,
                hang_after_command: false,
                generation: 0,
            })),
        }
    }

    /// Current snapshot without going through the async seam
    pub fn status_now(&self) -> RobotStatus {
        lock(&self.robot).status.clone()
    }

    /// Every command accepted so far, e.g. `position:SOAK`, `mount:3:7`
    pub fn commands(&self) -> Vec<String> {
        lock(&self.robot).commands.clone()
    }

    pub fn clear_commands(&self) {
        lock(&self.robot).commands.clear();
    }

    pub fn set_position(&self, position: &str) {
        lock(&self.robot).status.position = position.to_string();
    }

    pub fn set_tool(&self, tool: &str) {
        lock(&self.robot).status.tool = tool.to_string();
    }

    pub fn set_mounted(&self, mounted: Option<SlotAddress>) {
        lock(&self.robot).status.mounted = mounted;
    }

    pub fn set_mounted_plate(&self, plate: Option<u32>) {
        lock(&self.robot).status.mounted_plate = plate;
    }

    pub fn set_powered(&self, powered: bool) {
        lock(&self.robot).status.powered = powered;
    }

    pub fn set_remote_mode(&self, remote: bool) {
        lock(&self.robot).status.remote_mode = remote;
    }

    pub fn set_error(&self, error: Option<&str>) {
        lock(&self.robot).status.error = error.map(str::to_string);
    }

    pub fn set_fault(&self, fault: bool) {
        lock(&self.robot).status.fault_or_stopped = fault;
    }

    /// Force the active path, as if a trajectory were started out of band
    pub fn set_path(&self, path: &str) {
        lock(&self.robot).status.path = path.to_string();
    }

    pub fn set_pucks(&self, pucks: Vec<ContainerInfo>) {
        lock(&self.robot).pucks = pucks;
    }

    pub fn set_trays(&self, trays: Vec<ContainerInfo>) {
        lock(&self.robot).trays = trays;
    }

    pub fn set_path_duration(&self, duration: Duration) {
        lock(&self.robot).path_duration = duration;
    }

    pub fn inject_fault(&self, path: &str, fault: TrajectoryFault) {
        lock(&self.robot).faults.insert(path.to_string(), fault);
    }

    pub fn clear_faults(&self) {
        lock(&self.robot).faults.clear();
    }

    /// Make the next `count` status polls fail
    pub fn fail_next_polls(&self, count: u32) {
        lock(&self.robot).failing_polls = count;
    }

    /// Status polls hang forever while set
    pub fn set_unresponsive(&self, unresponsive: bool) {
        lock(&self.robot).unresponsive = unresponsive;
    }

    /// Accept the next trajectory command, then stop answering status polls
    pub fn hang_after_next_command(&self) {
        lock(&self.robot).hang_after_command = true;
    }

    fn start_trajectory<F>(&self, command: String, path: &str, outcome: F)
    where
        F: FnOnce(&mut RobotStatus) + Send + 'static,
    {
        let mut robot = lock(&self.robot);
        robot.commands.push(command);
        if robot.hang_after_command {
            robot.hang_after_command = false;
            robot.unresponsive = true;
        }
        let fault = robot.faults.get(path).copied();
        if fault == Some(TrajectoryFault::NeverStarts) {
            debug!("Simulated path '{}' will never start", path);
            return;
        }
        let duration = robot.path_duration;
        if duration.is_zero() && fault != Some(TrajectoryFault::NeverFinishes) {
            // Finishes before anyone can poll it
            if fault != Some(TrajectoryFault::WrongOutcome) {
                outcome(&mut robot.status);
            }
            robot.status.completed_paths += 1;
            return;
        }
        robot.status.path = path.to_string();
        if fault == Some(TrajectoryFault::NeverFinishes) {
            return;
        }

        let generation = robot.generation;
        let shared = Arc::clone(&self.robot);
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let mut robot = lock(&shared);
            if robot.generation != generation {
                return;
            }
            if fault != Some(TrajectoryFault::WrongOutcome) {
                outcome(&mut robot.status);
            }
            robot.status.path.clear();
            robot.status.completed_paths += 1;
        });
    }
}

impl Default for SimActuator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Actuator for SimActuator {
    async fn status(&self) -> anyhow::Result<RobotStatus> {
        let unresponsive = lock(&self.robot).unresponsive;
        if unresponsive {
            std::future::pending::<()>().await;
        }
        let mut robot = lock(&self.robot);
        if robot.failing_polls > 0 {
            robot.failing_polls -= 1;
            anyhow::bail!("Simulated controller did not answer");
        }
        Ok(robot.status.clone())
    }

    async fn loaded_pucks(&self) -> anyhow::Result<Vec<ContainerInfo>> {
        Ok(lock(&self.robot).pucks.clone())
    }

    async fn loaded_trays(&self) -> anyhow::Result<Vec<ContainerInfo>> {
        Ok(lock(&self.robot).trays.clone())
    }

    async fn move_to_position(&self, position: &str) -> anyhow::Result<()> {
        let target = position.to_string();
        self.start_trajectory(
            format!("position:{}", position),
            &position.to_ascii_lowercase(),
            move |status| status.position = target,
        );
        Ok(())
    }

    async fn change_tool(&self, tool: &str) -> anyhow::Result<()> {
        let target = tool.to_string();
        self.start_trajectory(format!("tool:{}", tool), "changetool", move |status| {
            status.tool = target
        });
        Ok(())
    }

    async fn run_path(&self, path: &str) -> anyhow::Result<()> {
        self.start_trajectory(format!("path:{}", path), path, |_| {});
        Ok(())
    }

    async fn mount(&self, address: &SlotAddress) -> anyhow::Result<()> {
        let target = *address;
        let path = if self.status_now().mounted.is_some() { "getput" } else { "put" };
        self.start_trajectory(format!("mount:{}", address), path, move |status| {
            status.mounted = Some(target)
        });
        Ok(())
    }

    async fn unmount(&self) -> anyhow::Result<()> {
        self.start_trajectory("unmount".to_string(), "get", |status| status.mounted = None);
        Ok(())
    }

    async fn reset(&self) -> anyhow::Result<()> {
        let mut robot = lock(&self.robot);
        robot.commands.push("reset".to_string());
        robot.status.error = None;
        robot.status.fault_or_stopped = false;
        Ok(())
    }

    async fn abort(&self) -> anyhow::Result<()> {
        let mut robot = lock(&self.robot);
        robot.commands.push("abort".to_string());
        robot.generation += 1;
        robot.status.path.clear();
        Ok(())
    }
}

struct SimStageState {
    status: StageStatus,
    well: Option<SlotAddress>,
    commands: Vec<String>,
    move_duration: Duration,
    stalled: bool,
}

/// Simulated tray translation stages
pub struct SimStage {
    stage: Arc<Mutex<SimStageState>>,
}

impl SimStage {
    /// Ready, in the data-collection phase
    pub fn new() -> Self {
        Self {
            stage: Arc::new(Mutex::new(SimStageState {
                status: StageStatus {
                    state: StageState::Ready,
                    phase: "DataCollection".to_string(),
                },
                well: None,
                commands: Vec::new(),
                move_duration: DEFAULT_PATH_DURATION,
                stalled: false,
            })),
        }
    }

    pub fn set_state(&self, state: StageState) {
        lock(&self.stage).status.state = state;
    }

    pub fn set_phase(&self, phase: &str) {
        lock(&self.stage).status.phase = phase.to_string();
    }

    /// Moves start but never settle back to Ready
    pub fn set_stalled(&self, stalled: bool) {
        lock(&self.stage).stalled = stalled;
    }

    pub fn well(&self) -> Option<SlotAddress> {
        lock(&self.stage).well
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.stage).commands.clone()
    }
}

impl Default for SimStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for SimStage {
    async fn status(&self) -> anyhow::Result<StageStatus> {
        Ok(lock(&self.stage).status.clone())
    }

    async fn move_to_well(&self, well: &SlotAddress) -> anyhow::Result<()> {
        let mut stage = lock(&self.stage);
        stage.commands.push(format!("move:{}", well));
        stage.status.state = StageState::Moving;
        if stage.stalled {
            return Ok(());
        }

        let target = *well;
        let duration = stage.move_duration;
        let shared = Arc::clone(&self.stage);
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let mut stage = lock(&shared);
            stage.well = Some(target);
            stage.status.state = StageState::Ready;
        });
        Ok(())
    }

    async fn change_phase(&self, phase: &str) -> anyhow::Result<()> {
        let mut stage = lock(&self.stage);
        stage.commands.push(format!("phase:{}", phase));
        stage.status.state = StageState::Moving;
        if stage.stalled {
            return Ok(());
        }

        let target = phase.to_string();
        let duration = stage.move_duration;
        let shared = Arc::clone(&self.stage);
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let mut stage = lock(&shared);
            stage.status.phase = target;
            stage.status.state = StageState::Ready;
        });
        Ok(())
    }

    async fn abort(&self) -> anyhow::Result<()> {
        let mut stage = lock(&self.stage);
        stage.commands.push("abort".to_string());
        stage.status.state = StageState::Ready;
        Ok(())
    }
}

/// Simulated external flow runner.
///
/// Mount flows drive [`SimActuator::mount`], unmount flows drive
/// [`SimActuator::unmount`]; once the arm is idle again the flow writes its
/// terminal state into the store, exactly as a deployed flow would.
pub struct SimFlowLauncher {
    actuator: Option<Arc<SimActuator>>,
    store: Arc<dyn KeyValueStore>,
    state_prefix: String,
    mount_flow: String,
    unmount_flow: String,
    outcome: Mutex<FlowState>,
    submitted: Mutex<Vec<String>>,
    runs: Mutex<u64>,
}

impl SimFlowLauncher {
    pub fn new(
        actuator: Option<Arc<SimActuator>>,
        store: Arc<dyn KeyValueStore>,
        state_prefix: impl Into<String>,
        mount_flow: impl Into<String>,
        unmount_flow: impl Into<String>,
    ) -> Self {
        Self {
            actuator,
            store,
            state_prefix: state_prefix.into(),
            mount_flow: mount_flow.into(),
            unmount_flow: unmount_flow.into(),
            outcome: Mutex::new(FlowState::Completed),
            submitted: Mutex::new(Vec::new()),
            runs: Mutex::new(0),
        }
    }

    /// Terminal state reported by subsequent runs
    pub fn set_outcome(&self, outcome: FlowState) {
        *lock(&self.outcome) = outcome;
    }

    /// Names of the flows submitted so far, in order
    pub fn submitted(&self) -> Vec<String> {
        lock(&self.submitted).clone()
    }

    pub fn count(&self, name: &str) -> usize {
        lock(&self.submitted).iter().filter(|n| *n == name).count()
    }
}

async fn wait_for_idle(actuator: &SimActuator) {
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        match actuator.status().await {
            Ok(status) if status.is_idle() => return,
            Ok(_) => {}
            Err(e) => debug!("Simulated flow poll failed: {}", e),
        }
    }
}

#[async_trait]
impl FlowLauncher for SimFlowLauncher {
    async fn submit(&self, name: &str, parameters: serde_json::Value) -> anyhow::Result<String> {
        let sample_id = parameters["sample_id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Flow payload has no sample_id"))?
            .to_string();
        let address: Option<SlotAddress> = parameters["address"]
            .as_str()
            .and_then(|a| a.parse().ok());

        let is_mount = name == self.mount_flow;
        if !is_mount && name != self.unmount_flow {
            anyhow::bail!("Unknown flow '{}'", name);
        }
        lock(&self.submitted).push(name.to_string());
        let run_id = {
            let mut runs = lock(&self.runs);
            *runs += 1;
            format!("sim-{}", *runs)
        };

        let outcome = *lock(&self.outcome);
        let key = flow_state_key(&self.state_prefix, &sample_id);
        let store = Arc::clone(&self.store);
        let actuator = self.actuator.clone();
        tokio::spawn(async move {
            if let Some(actuator) = actuator {
                if outcome != FlowState::Failed {
                    let started = match (is_mount, address) {
                        (true, Some(addr)) if addr.is_pin() => actuator.mount(&addr).await,
                        (true, _) => Ok(()),
                        (false, _) => actuator.unmount().await,
                    };
                    if let Err(e) = started {
                        warn!("Simulated flow could not start trajectory: {}", e);
                    }
                    wait_for_idle(&actuator).await;
                }
            } else {
                tokio::time::sleep(DEFAULT_PATH_DURATION).await;
            }
            if let Err(e) = store.set(&key, outcome.as_str()).await {
                warn!("Simulated flow could not report state: {}", e);
            }
        });
        Ok(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test(start_paused = true)]
    async fn test_trajectory_timeline() {
        let actuator = SimActuator::new();
        actuator.move_to_position("SOAK").await.unwrap();
        assert_eq!(actuator.status_now().path, "soak");

        tokio::time::sleep(DEFAULT_PATH_DURATION + Duration::from_millis(10)).await;
        let status = actuator.status().await.unwrap();
        assert!(status.is_idle());
        assert_eq!(status.position, "SOAK");
        assert_eq!(status.completed_paths, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_drops_outcome() {
        let actuator = SimActuator::new();
        actuator.mount(&SlotAddress::pin(3, 7)).await.unwrap();
        assert_eq!(actuator.status_now().path, "put");
        actuator.abort().await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        let status = actuator.status_now();
        assert!(status.is_idle());
        assert_eq!(status.mounted, None);
        assert_eq!(status.completed_paths, 0);
    }

    #[tokio::test]
    async fn test_failing_polls() {
        let actuator = SimActuator::new();
        actuator.fail_next_polls(2);
        assert!(actuator.status().await.is_err());
        assert!(actuator.status().await.is_err());
        assert!(actuator.status().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_move() {
        let stage = SimStage::new();
        stage.move_to_well(&SlotAddress::crystal(1, 7, 2, 0)).await.unwrap();
        assert_eq!(stage.status().await.unwrap().state, StageState::Moving);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(stage.status().await.unwrap().state, StageState::Ready);
        assert_eq!(stage.well(), Some(SlotAddress::crystal(1, 7, 2, 0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_phase_change() {
        let stage = SimStage::new();
        stage.change_phase("Transfer").await.unwrap();
        let status = stage.status().await.unwrap();
        assert_eq!(status.state, StageState::Moving);
        assert_eq!(status.phase, "DataCollection");

        tokio::time::sleep(Duration::from_secs(3)).await;
        let status = stage.status().await.unwrap();
        assert_eq!(status.state, StageState::Ready);
        assert!(status.in_transfer_phase());
        assert_eq!(stage.commands(), vec!["phase:Transfer"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_controller() {
        let actuator = SimActuator::new();
        actuator.hang_after_next_command();
        assert!(actuator.status().await.is_ok());

        actuator.run_path("dry").await.unwrap();
        let poll = tokio::time::timeout(Duration::from_secs(60), actuator.status()).await;
        assert!(poll.is_err());

        actuator.set_unresponsive(false);
        assert!(actuator.status().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flow_mounts_pin() {
        let actuator = Arc::new(SimActuator::new());
        let store = Arc::new(MemoryStore::new());
        let launcher = SimFlowLauncher::new(Some(actuator.clone()), store.clone(), "scan", "mount", "unmount");

        launcher
            .submit("mount", serde_json::json!({"address": "3:7", "sample_id": "matr3_7"}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(actuator.status_now().mounted, Some(SlotAddress::pin(3, 7)));
        assert_eq!(store.get("scan:matr3_7").await.unwrap().as_deref(), Some("completed"));
        assert_eq!(launcher.count("mount"), 1);
        assert!(launcher.submit("other", serde_json::json!({"sample_id": "x"})).await.is_err());
    }
}
