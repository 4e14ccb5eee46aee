//! Robot-arm changer
//!
//! Pins are exchanged between pucks in the dewar and the goniometer by an
//! external mount/unmount flow. Before every exchange the arm is parked at
//! the safe position with the double gripper mounted, and the goniometer is
//! put into its transfer phase.

use async_trait::async_trait;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};
use crate::actuator::{Actuator, Stage};
use crate::address::SlotAddress;
use crate::config::{ExchangeConfig, TimeoutConfig};
use crate::exchange::{ExchangeContext, ExchangePhase, InFlight, SampleChanger};
use crate::flow::{FlowRequest, FlowRunner};
use crate::inventory::SharedInventory;
use crate::sequencer::{Precondition, PreconditionSequencer};
use crate::state_mapper::map_robot_status;
use crate::status::{HighLevelState, RobotStatus};
use crate::{ChangerError, Result};

/// Operator-level maintenance actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceCommand {
    Home,
    Soak,
    Dry,
    ReturnPrefetch,
    Reset,
    Abort,
}

impl FromStr for MaintenanceCommand {
    type Err = ChangerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "home" => Ok(MaintenanceCommand::Home),
            "soak" => Ok(MaintenanceCommand::Soak),
            "dry" => Ok(MaintenanceCommand::Dry),
            "return-prefetch" | "return_prefetch" => Ok(MaintenanceCommand::ReturnPrefetch),
            "reset" => Ok(MaintenanceCommand::Reset),
            "abort" => Ok(MaintenanceCommand::Abort),
            other => Err(ChangerError::SampleChanger(format!(
                "Unknown maintenance command '{}'",
                other
            ))),
        }
    }
}

impl MaintenanceCommand {
    pub fn name(&self) -> &'static str {
        match self {
            MaintenanceCommand::Home => "home",
            MaintenanceCommand::Soak => "soak",
            MaintenanceCommand::Dry => "dry",
            MaintenanceCommand::ReturnPrefetch => "return-prefetch",
            MaintenanceCommand::Reset => "reset",
            MaintenanceCommand::Abort => "abort",
        }
    }
}

/// Event topic for maintenance outcomes
pub const MAINTENANCE_TOPIC: &str = "maintenance";

const HOME_POSITION: &str = "HOME";
const HOME_PATH: &str = "home";
const DRY_PATH: &str = "dry";
const RETURN_PREFETCH_PATH: &str = "returnpin";

pub struct RobotChanger {
    actuator: Arc<dyn Actuator>,
    sequencer: PreconditionSequencer,
    flows: FlowRunner,
    exchange: ExchangeConfig,
    timeouts: TimeoutConfig,
    ctx: ExchangeContext,
}

impl RobotChanger {
    /// `goniometer` adds the transfer-phase step to every exchange
    pub fn new(
        actuator: Arc<dyn Actuator>,
        goniometer: Option<Arc<dyn Stage>>,
        flows: FlowRunner,
        exchange: ExchangeConfig,
        timeouts: TimeoutConfig,
        ctx: ExchangeContext,
    ) -> Self {
        let mut sequencer = PreconditionSequencer::new(Arc::clone(&actuator), timeouts.clone());
        if let Some(goniometer) = goniometer {
            sequencer = sequencer.with_goniometer(goniometer);
        }
        Self {
            sequencer,
            actuator,
            flows,
            exchange,
            timeouts,
            ctx,
        }
    }

    async fn status(&self) -> Result<RobotStatus> {
        self.actuator.status().await.map_err(ChangerError::actuator)
    }

    pub async fn is_powered(&self) -> Result<bool> {
        Ok(self.status().await?.powered)
    }

    /// Powered and under remote control
    pub async fn is_enabled(&self) -> Result<bool> {
        Ok(self.status().await?.is_enabled())
    }

    pub async fn is_mounted_sample(&self, address: &str) -> Result<bool> {
        let address = self.ctx.inventory.read().await.parse_address(address)?;
        Ok(self.mounted().await == Some(address))
    }

    /// Clear latched faults on the controller
    pub async fn reset(&self) -> Result<()> {
        info!("Resetting robot controller");
        self.actuator.reset().await.map_err(ChangerError::actuator)
    }

    /// Reject when the arm is already running a trajectory
    async fn assert_idle(&self, operation: &str) -> Result<RobotStatus> {
        let status = self.status().await?;
        let state = map_robot_status(&status);
        if !status.is_idle() || state.is_transferring() {
            warn!("Rejecting {}: robot is {} on path '{}'", operation, state, status.path);
            return Err(ChangerError::Busy(format!(
                "robot is {} on path '{}'",
                state, status.path
            )));
        }
        Ok(status)
    }

    async fn run_preconditions(&self, flight: &InFlight<'_>) -> Result<()> {
        let preconditions = Precondition::for_exchange(&self.exchange, self.sequencer.has_goniometer());
        self.sequencer
            .ensure_all(&preconditions, |step| flight.advance(ExchangePhase::for_precondition(step)))
            .await
    }

    /// Run `command` and publish its outcome on the maintenance topic
    pub async fn maintenance(&self, command: MaintenanceCommand) -> Result<()> {
        info!("Maintenance command: {:?}", command);
        let result = self.run_maintenance(command).await;
        let outcome = match &result {
            Ok(()) => serde_json::json!({ "command": command.name(), "success": true }),
            Err(e) => serde_json::json!({
                "command": command.name(),
                "success": false,
                "error": e.to_string(),
            }),
        };
        if let Err(e) = self.ctx.events.publish_custom(MAINTENANCE_TOPIC, &outcome).await {
            warn!("Failed to publish maintenance event: {}", e);
        }
        result
    }

    async fn run_maintenance(&self, command: MaintenanceCommand) -> Result<()> {
        match command {
            MaintenanceCommand::Abort => return self.abort().await,
            MaintenanceCommand::Reset => {
                let _flight = self.ctx.control.begin("reset")?;
                return self.reset().await;
            }
            _ => {}
        }

        let _flight = self.ctx.control.begin("run maintenance")?;
        self.assert_idle("maintenance").await?;
        let result = match command {
            MaintenanceCommand::Home => self
                .sequencer
                .ensure(&Precondition::Position {
                    target: HOME_POSITION.to_string(),
                    path: HOME_PATH.to_string(),
                })
                .await
                .map(|_| ()),
            MaintenanceCommand::Soak => self
                .sequencer
                .ensure(&Precondition::Position {
                    target: self.exchange.safe_position(),
                    path: self.exchange.safe_position_path(),
                })
                .await
                .map(|_| ()),
            MaintenanceCommand::Dry => {
                self.sequencer
                    .run_path(DRY_PATH, self.timeouts.maintenance_finish())
                    .await
            }
            MaintenanceCommand::ReturnPrefetch => {
                self.sequencer
                    .run_path(RETURN_PREFETCH_PATH, self.timeouts.position_finish())
                    .await
            }
            MaintenanceCommand::Reset | MaintenanceCommand::Abort => Ok(()),
        };
        if let Err(e) = &result {
            error!("Maintenance command {:?} failed: {}", command, e);
        }
        result
    }

    fn flow_parameters(address: &SlotAddress, sample_id: &str) -> serde_json::Value {
        let (container, position) = match *address {
            SlotAddress::Pin { puck, pin } => (puck, pin),
            SlotAddress::Crystal { row, column, .. } => (row, column),
        };
        serde_json::json!({
            "address": address.to_string(),
            "sample_id": sample_id,
            "container": container,
            "position": position,
        })
    }
}

#[async_trait]
impl SampleChanger for RobotChanger {
    async fn load(&self, address: &str) -> Result<()> {
        let (target, sample_id) = {
            let inventory = self.ctx.inventory.read().await;
            let slot = inventory.resolve_str(address)?;
            (slot.address, slot.sample_id())
        };

        let flight = self.ctx.control.begin("load")?;
        self.assert_idle("load").await?;
        let _window = self.ctx.open_window(Some(target)).await;
        info!("Loading {} ({})", target, sample_id);

        if let Err(e) = self.run_preconditions(&flight).await {
            error!("Load of {} aborted: {}", target, e);
            return Err(e);
        }

        flight.advance(ExchangePhase::Exchanging)?;
        let request = FlowRequest {
            name: self.exchange.mount_flow(),
            sample_id: sample_id.clone(),
            parameters: Self::flow_parameters(&target, &sample_id),
        };
        if let Err(e) = self.flows.run(&request).await {
            error!("Mount flow for {} failed: {}", target, e);
            return Err(e);
        }

        self.ctx.commit_load(&target, &target.to_string(), false).await
    }

    async fn unload(&self) -> Result<()> {
        let flight = self.ctx.control.begin("unload")?;
        let status = self.assert_idle("unload").await?;

        let (mounted, sample_id) = {
            let inventory = self.ctx.inventory.read().await;
            let mounted = status
                .mounted
                .or_else(|| inventory.loaded_address())
                .ok_or_else(|| ChangerError::SampleChanger("No sample mounted".to_string()))?;
            let sample_id = inventory
                .resolve(&mounted)
                .map(|slot| slot.sample_id())
                .unwrap_or_else(|_| mounted.to_string());
            (mounted, sample_id)
        };
        let _window = self.ctx.open_window(Some(mounted)).await;
        info!("Unloading {} ({})", mounted, sample_id);

        if let Err(e) = self.run_preconditions(&flight).await {
            error!("Unload of {} aborted: {}", mounted, e);
            return Err(e);
        }

        flight.advance(ExchangePhase::Exchanging)?;
        let request = FlowRequest {
            name: self.exchange.unmount_flow(),
            sample_id: sample_id.clone(),
            parameters: Self::flow_parameters(&mounted, &sample_id),
        };
        if let Err(e) = self.flows.run(&request).await {
            error!("Unmount flow for {} failed: {}", mounted, e);
            return Err(e);
        }

        self.ctx.commit_unload().await
    }

    fn state(&self) -> HighLevelState {
        self.ctx.monitor.state()
    }

    fn inventory(&self) -> SharedInventory {
        Arc::clone(&self.ctx.inventory)
    }

    fn phase(&self) -> ExchangePhase {
        self.ctx.control.phase()
    }

    async fn abort(&self) -> Result<()> {
        warn!("Abort requested (phase {})", self.ctx.control.phase());
        self.ctx.control.request_abort();
        self.actuator.abort().await.map_err(ChangerError::actuator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MonitorConfig, StoreConfig};
    use crate::error::PathStage;
    use crate::events::{EventPublisher, LoadedEvent, NoOpEvents, StateEvent};
    use crate::flow::FlowState;
    use crate::inventory::Inventory;
    use crate::monitor::{RobotReconciler, RobotStateMonitor};
    use crate::sim::{SimActuator, SimFlowLauncher, SimStage, TrajectoryFault};
    use crate::store::{KeyValueStore, MemoryStore};
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::RwLock;
    use tokio::time::Instant;

    #[derive(Default)]
    struct RecordingEvents {
        custom: Mutex<Vec<(String, serde_json::Value)>>,
    }

    #[async_trait]
    impl EventPublisher for RecordingEvents {
        async fn publish_state(&self, _event: &StateEvent) -> anyhow::Result<()> {
            Ok(())
        }

        async fn publish_loaded(&self, _event: &LoadedEvent) -> anyhow::Result<()> {
            Ok(())
        }

        async fn publish_custom(&self, topic: &str, data: &serde_json::Value) -> anyhow::Result<()> {
            self.custom.lock().unwrap().push((topic.to_string(), data.clone()));
            Ok(())
        }
    }

    struct Rig {
        changer: Arc<RobotChanger>,
        actuator: Arc<SimActuator>,
        goniometer: Arc<SimStage>,
        launcher: Arc<SimFlowLauncher>,
        store: Arc<MemoryStore>,
        monitor: Arc<RobotStateMonitor>,
        events: Arc<RecordingEvents>,
    }

    fn rig() -> Rig {
        let exchange = ExchangeConfig::default();
        let store_config = StoreConfig::default();
        let actuator = Arc::new(SimActuator::new());
        let goniometer = Arc::new(SimStage::new());
        let events = Arc::new(RecordingEvents::default());
        let store = Arc::new(MemoryStore::new());
        let launcher = Arc::new(SimFlowLauncher::new(
            Some(actuator.clone()),
            store.clone(),
            store_config.flow_state_prefix(),
            exchange.mount_flow(),
            exchange.unmount_flow(),
        ));
        let inventory = Arc::new(RwLock::new(Inventory::robot(3, 10)));
        let monitor = Arc::new(RobotStateMonitor::new(
            Arc::new(RobotReconciler::new(actuator.clone())),
            inventory.clone(),
            Arc::new(NoOpEvents),
            MonitorConfig::default(),
            Arc::new(AtomicBool::new(false)),
        ));
        let flows = FlowRunner::new(
            launcher.clone(),
            store.clone(),
            store_config.flow_state_prefix(),
            Duration::from_secs(1),
        );
        let ctx = ExchangeContext::new(
            inventory,
            store.clone(),
            monitor.clone(),
            events.clone(),
            store_config.location_key(),
        );
        let changer = Arc::new(RobotChanger::new(
            actuator.clone(),
            Some(goniometer.clone()),
            flows,
            exchange,
            TimeoutConfig::default(),
            ctx,
        ));
        Rig { changer, actuator, goniometer, launcher, store, monitor, events }
    }

    async fn loaded_flags(changer: &RobotChanger) -> Vec<SlotAddress> {
        let inventory = changer.inventory();
        let inventory = inventory.read().await;
        inventory.all_slots().iter().filter(|s| s.loaded).map(|s| s.address).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_pin_three_seven() {
        let rig = rig();
        rig.actuator.set_tool("SingleGripper");

        rig.changer.load("3:7").await.unwrap();

        assert_eq!(
            rig.actuator.commands(),
            vec!["position:SOAK", "tool:DoubleGripper", "mount:3:7"]
        );
        assert_eq!(rig.goniometer.commands(), vec!["phase:Transfer"]);
        assert_eq!(loaded_flags(&rig.changer).await, vec![SlotAddress::pin(3, 7)]);
        assert_eq!(
            rig.store.get("current_drop_location").await.unwrap().as_deref(),
            Some("3:7")
        );

        rig.monitor.reconcile_once().await.unwrap();
        assert_eq!(rig.changer.state(), HighLevelState::Loaded);
        let inventory = rig.changer.inventory();
        assert!(inventory.read().await.resolve_str("3:7").unwrap().loaded);
        assert_eq!(rig.changer.phase(), ExchangePhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_replaces_previous() {
        let rig = rig();
        rig.changer.load("1:1").await.unwrap();
        rig.changer.load("2:4").await.unwrap();

        assert_eq!(loaded_flags(&rig.changer).await, vec![SlotAddress::pin(2, 4)]);
        let inventory = rig.changer.inventory();
        assert!(inventory.read().await.resolve_str("1:1").unwrap().has_been_loaded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_load_rejected() {
        let rig = rig();
        rig.changer.load("1:1").await.unwrap();
        rig.actuator.set_position("HOME");

        let first = {
            let changer = Arc::clone(&rig.changer);
            tokio::spawn(async move { changer.load("3:7").await })
        };
        // Let the first load reach its position wait
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rig.changer.phase() != ExchangePhase::Idle);

        let second = rig.changer.load("2:2").await;
        assert!(matches!(second, Err(ChangerError::Busy(_))));
        assert_eq!(loaded_flags(&rig.changer).await, vec![SlotAddress::pin(1, 1)]);

        first.await.unwrap().unwrap();
        assert_eq!(loaded_flags(&rig.changer).await, vec![SlotAddress::pin(3, 7)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_rejected_while_path_active() {
        let rig = rig();
        rig.actuator.set_path("datamatrix");
        let result = rig.changer.load("3:7").await;
        assert!(matches!(result, Err(ChangerError::Busy(_))));
        assert!(rig.actuator.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_change_timeout_leaves_inventory() {
        let rig = rig();
        rig.changer.load("1:1").await.unwrap();
        rig.monitor.reconcile_once().await.unwrap();
        rig.actuator.set_tool("SingleGripper");
        rig.actuator.inject_fault("changetool", TrajectoryFault::NeverFinishes);
        rig.actuator.clear_commands();

        let started = Instant::now();
        let err = rig.changer.load("3:7").await.unwrap_err();
        assert!(matches!(
            err,
            ChangerError::PathTimeout { stage: PathStage::Finish, ref path, .. } if path == "changetool"
        ));
        assert!(started.elapsed() >= Duration::from_secs(240));

        assert_eq!(loaded_flags(&rig.changer).await, vec![SlotAddress::pin(1, 1)]);
        assert!(!rig.actuator.commands().iter().any(|c| c.starts_with("mount")));
        assert_eq!(rig.launcher.count(&ExchangeConfig::default().mount_flow()), 1);
        assert_eq!(rig.changer.phase(), ExchangePhase::Idle);

        // The stuck path is reported as motion, not as a changer fault
        assert_eq!(rig.monitor.reconcile_once().await.unwrap(), HighLevelState::Moving);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_flow_failure_propagates() {
        let rig = rig();
        rig.launcher.set_outcome(FlowState::Failed);
        let err = rig.changer.load("3:7").await.unwrap_err();
        assert!(matches!(err, ChangerError::Flow(_)));
        assert!(loaded_flags(&rig.changer).await.is_empty());
        assert_eq!(rig.store.get("current_drop_location").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unload_clears_location() {
        let rig = rig();
        rig.changer.load("3:7").await.unwrap();
        rig.changer.unload().await.unwrap();

        assert!(loaded_flags(&rig.changer).await.is_empty());
        assert_eq!(rig.store.get("current_drop_location").await.unwrap(), None);
        assert_eq!(rig.actuator.status_now().mounted, None);
        assert!(matches!(rig.changer.unload().await, Err(ChangerError::SampleChanger(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chained_load_unmounts_once_first() {
        let rig = rig();
        rig.changer.load("1:1").await.unwrap();
        rig.actuator.clear_commands();

        rig.changer.chained_load(Some("1:1"), "3:7").await.unwrap();

        let exchanges: Vec<String> = rig
            .actuator
            .commands()
            .into_iter()
            .filter(|c| c == "unmount" || c.starts_with("mount"))
            .collect();
        assert_eq!(exchanges, vec!["unmount", "mount:3:7"]);
        assert_eq!(loaded_flags(&rig.changer).await, vec![SlotAddress::pin(3, 7)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chained_load_same_sample_is_noop() {
        let rig = rig();
        rig.changer.load("3:7").await.unwrap();
        let submitted = rig.launcher.submitted().len();
        rig.actuator.clear_commands();

        rig.changer.chained_load(None, "3:7").await.unwrap();
        assert!(rig.actuator.commands().is_empty());
        assert_eq!(rig.launcher.submitted().len(), submitted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_before_exchange() {
        let rig = rig();
        rig.actuator.set_tool("SingleGripper");

        let load = {
            let changer = Arc::clone(&rig.changer);
            tokio::spawn(async move { changer.load("3:7").await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        rig.changer.abort().await.unwrap();

        let result = load.await.unwrap();
        assert!(result.is_err());
        assert!(rig.launcher.submitted().is_empty());
        assert!(loaded_flags(&rig.changer).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_commands() {
        let rig = rig();
        rig.changer.maintenance(MaintenanceCommand::Soak).await.unwrap();
        assert_eq!(rig.actuator.status_now().position, "SOAK");

        rig.changer.maintenance(MaintenanceCommand::Dry).await.unwrap();
        rig.changer.maintenance(MaintenanceCommand::Home).await.unwrap();
        assert_eq!(rig.actuator.status_now().position, "HOME");

        rig.actuator.set_error(Some("E12"));
        rig.changer.maintenance(MaintenanceCommand::Reset).await.unwrap();
        assert_eq!(rig.actuator.status_now().error, None);

        assert_eq!(
            rig.actuator.commands(),
            vec!["position:SOAK", "path:dry", "position:HOME", "reset"]
        );
        assert_eq!(
            "return-prefetch".parse::<MaintenanceCommand>().unwrap(),
            MaintenanceCommand::ReturnPrefetch
        );
        assert!("polish".parse::<MaintenanceCommand>().is_err());
    }

    #[tokio::test]
    async fn test_power_and_mount_queries() {
        let rig = rig();
        assert!(rig.changer.is_enabled().await.unwrap());
        rig.actuator.set_remote_mode(false);
        assert!(rig.changer.is_powered().await.unwrap());
        assert!(!rig.changer.is_enabled().await.unwrap());

        assert!(!rig.changer.is_mounted_sample("3:7").await.unwrap());
        assert!(rig.changer.is_mounted_sample("B7:2").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_goniometer_already_in_transfer() {
        let rig = rig();
        rig.goniometer.set_phase("Transfer");

        rig.changer.load("3:7").await.unwrap();
        rig.changer.unload().await.unwrap();
        assert!(rig.goniometer.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_goniometer_phase_failure_stops_load() {
        let rig = rig();
        rig.goniometer.set_stalled(true);

        let err = rig.changer.load("3:7").await.unwrap_err();
        assert!(matches!(err, ChangerError::Phase { ref expected, .. } if expected == "Transfer"));
        assert!(rig.launcher.submitted().is_empty());
        assert!(loaded_flags(&rig.changer).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_outcomes_published() {
        let rig = rig();
        rig.changer.maintenance(MaintenanceCommand::Soak).await.unwrap();
        rig.actuator.inject_fault("home", TrajectoryFault::NeverStarts);
        assert!(rig.changer.maintenance(MaintenanceCommand::Home).await.is_err());

        let custom = rig.events.custom.lock().unwrap().clone();
        assert_eq!(custom.len(), 2);
        assert_eq!(custom[0].0, MAINTENANCE_TOPIC);
        assert_eq!(custom[0].1["command"], "soak");
        assert_eq!(custom[0].1["success"], true);
        assert_eq!(custom[1].1["command"], "home");
        assert_eq!(custom[1].1["success"], false);
        assert!(custom[1].1["error"].as_str().unwrap().contains("home"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_finishing_between_polls() {
        let rig = rig();
        rig.actuator.set_path_duration(Duration::ZERO);

        rig.changer.maintenance(MaintenanceCommand::Dry).await.unwrap();
        assert_eq!(rig.actuator.commands(), vec!["path:dry"]);
        assert_eq!(rig.actuator.status_now().completed_paths, 1);
    }
}
