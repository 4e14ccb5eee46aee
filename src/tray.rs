//! Tray changer
//!
//! Wells are brought under the beam by translation stages rather than by
//! mounting pins. What is under the beam is persisted as the drop-level well
//! location so a restarted daemon knows where the stages were left. Taking the
//! tray off goes through the external unmount flow.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use crate::actuator::{Actuator, Stage};
use crate::config::{ExchangeConfig, TimeoutConfig, VariantConfig};
use crate::error::PathStage;
use crate::exchange::{ExchangeContext, ExchangePhase, InFlight, SampleChanger};
use crate::flow::{FlowRequest, FlowRunner};
use crate::inventory::SharedInventory;
use crate::sequencer::{bounded, poll_until};
use crate::status::{HighLevelState, StageState, StageStatus};
use crate::{ChangerError, Result};

pub const NO_BARCODE: &str = "No barcode found";

const BARCODE_ATTEMPTS: u32 = 3;
const BARCODE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Geometry and identity of the tray on the goniometer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlateInfo {
    pub rows: u32,
    pub columns: u32,
    pub drops: u32,
    pub barcode: String,
}

pub struct TrayChanger {
    stage: Arc<dyn Stage>,
    actuator: Arc<dyn Actuator>,
    flows: FlowRunner,
    exchange: ExchangeConfig,
    timeouts: TimeoutConfig,
    ctx: ExchangeContext,
}

impl TrayChanger {
    pub fn new(
        stage: Arc<dyn Stage>,
        actuator: Arc<dyn Actuator>,
        flows: FlowRunner,
        exchange: ExchangeConfig,
        timeouts: TimeoutConfig,
        ctx: ExchangeContext,
    ) -> Self {
        Self {
            stage,
            actuator,
            flows,
            exchange,
            timeouts,
            ctx,
        }
    }

    async fn stage_status(&self) -> Result<StageStatus> {
        bounded(self.timeouts.status_timeout(), "stage", self.stage.status()).await
    }

    /// Reject while the goniometer is in transfer phase or the stages are busy
    async fn assert_not_charging(&self, operation: &str) -> Result<()> {
        let status = self.stage_status().await?;
        if status.in_transfer_phase() || status.state != StageState::Ready {
            warn!(
                "Rejecting {}: stage is {:?} in phase {}",
                operation, status.state, status.phase
            );
            return Err(ChangerError::Busy(format!(
                "stage is {:?} in phase {}",
                status.state, status.phase
            )));
        }
        Ok(())
    }

    /// Wait for the stages to settle; anything but Ready once settled is an error
    async fn wait_stage_ready(&self, label: &str, stage: PathStage, timeout: Duration) -> Result<()> {
        let settled = poll_until(timeout, self.timeouts.poll_interval(), || async {
            let status = self.stage_status().await?;
            Ok::<_, ChangerError>(!matches!(status.state, StageState::Moving | StageState::Unknown))
        })
        .await;
        if !settled {
            return Err(ChangerError::PathTimeout {
                path: label.to_string(),
                stage,
                timeout,
            });
        }

        let status = self.stage_status().await?;
        match status.state {
            StageState::Ready => Ok(()),
            other => Err(ChangerError::SampleChanger(format!(
                "stage reported {:?} during {}",
                other, label
            ))),
        }
    }

    async fn wait_preconditions(&self, flight: &InFlight<'_>) -> Result<()> {
        flight.advance(ExchangePhase::SequencingPosition)?;
        self.wait_stage_ready("stage ready", PathStage::Start, self.timeouts.path_start())
            .await
    }

    /// Layout plus the barcode of the mounted tray
    pub async fn plate_info(&self) -> Result<PlateInfo> {
        let layout = self.ctx.inventory.read().await.layout().clone();
        let (rows, columns, drops) = match layout {
            VariantConfig::Tray { rows, columns, drops } => (rows, columns, drops),
            VariantConfig::Robot { .. } => {
                return Err(ChangerError::Config("plate info needs a tray layout".to_string()))
            }
        };
        Ok(PlateInfo {
            rows,
            columns,
            drops,
            barcode: self.read_plate_barcode().await,
        })
    }

    async fn read_plate_barcode(&self) -> String {
        for attempt in 1..=BARCODE_ATTEMPTS {
            match self.lookup_plate_barcode().await {
                Ok(Some(barcode)) => return barcode,
                Ok(None) => debug!("No plate barcode on attempt {}", attempt),
                Err(e) => warn!("Plate barcode lookup failed on attempt {}: {}", attempt, e),
            }
            if attempt < BARCODE_ATTEMPTS {
                tokio::time::sleep(BARCODE_RETRY_DELAY).await;
            }
        }
        NO_BARCODE.to_string()
    }

    async fn lookup_plate_barcode(&self) -> anyhow::Result<Option<String>> {
        let status = self.actuator.status().await?;
        let Some(plate) = status.mounted_plate else {
            return Ok(None);
        };
        let trays = self.actuator.loaded_trays().await?;
        Ok(trays
            .into_iter()
            .find(|tray| tray.id == plate)
            .map(|tray| tray.barcode.replace('-', "")))
    }
}

#[async_trait]
impl SampleChanger for TrayChanger {
    async fn load(&self, address: &str) -> Result<()> {
        let target = self.ctx.inventory.read().await.resolve_str(address)?.address;
        if self.mounted().await == Some(target) {
            info!("Well {} already under the beam", target.well_location());
            return Ok(());
        }

        let flight = self.ctx.control.begin("load")?;
        self.assert_not_charging("load").await?;
        let _window = self.ctx.open_window(Some(target)).await;
        info!("Moving tray to well {}", target.well_location());

        if let Err(e) = self.wait_preconditions(&flight).await {
            error!("Load of {} aborted: {}", target, e);
            return Err(e);
        }

        flight.advance(ExchangePhase::Exchanging)?;
        self.stage.move_to_well(&target).await.map_err(ChangerError::actuator)?;
        if let Err(e) = self
            .wait_stage_ready("move to well", PathStage::Finish, self.timeouts.position_finish())
            .await
        {
            error!("Move to {} failed: {}", target, e);
            return Err(e);
        }

        self.ctx.commit_load(&target, &target.well_location(), true).await
    }

    async fn unload(&self) -> Result<()> {
        let flight = self.ctx.control.begin("unload")?;
        self.assert_not_charging("unload").await?;

        let mounted = match self.mounted().await {
            Some(address) => address,
            None => {
                let persisted = self
                    .ctx
                    .store
                    .get(&self.ctx.location_key)
                    .await
                    .map_err(ChangerError::store)?;
                match persisted {
                    Some(location) => self.ctx.inventory.read().await.parse_address(&location)?,
                    None => return Err(ChangerError::SampleChanger("No tray well loaded".to_string())),
                }
            }
        };
        let sample_id = self
            .ctx
            .inventory
            .read()
            .await
            .resolve(&mounted)
            .map(|slot| slot.sample_id())
            .unwrap_or_else(|_| mounted.to_string());
        let _window = self.ctx.open_window(None).await;
        info!("Unloading tray from well {}", mounted.well_location());

        if let Err(e) = self.wait_preconditions(&flight).await {
            error!("Unload of {} aborted: {}", mounted, e);
            return Err(e);
        }

        flight.advance(ExchangePhase::Exchanging)?;
        let request = FlowRequest {
            name: self.exchange.unmount_flow(),
            sample_id: sample_id.clone(),
            parameters: serde_json::json!({
                "address": mounted.to_string(),
                "well": mounted.well_location(),
                "sample_id": sample_id,
            }),
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
        self.stage.abort().await.map_err(ChangerError::actuator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::SlotAddress;
    use crate::config::{MonitorConfig, StoreConfig};
    use crate::events::NoOpEvents;
    use crate::inventory::{ContainerInfo, Inventory};
    use crate::monitor::{RobotStateMonitor, TrayReconciler};
    use crate::sim::{SimActuator, SimFlowLauncher, SimStage};
    use crate::store::{KeyValueStore, MemoryStore};
    use std::sync::atomic::AtomicBool;
    use tokio::sync::RwLock;
    use tokio::time::Instant;

    const LOCATION: &str = "current_drop_location";

    struct Rig {
        changer: Arc<TrayChanger>,
        stage: Arc<SimStage>,
        actuator: Arc<SimActuator>,
        launcher: Arc<SimFlowLauncher>,
        store: Arc<MemoryStore>,
        monitor: Arc<RobotStateMonitor>,
    }

    fn rig() -> Rig {
        let exchange = ExchangeConfig::default();
        let store_config = StoreConfig::default();
        let stage = Arc::new(SimStage::new());
        let actuator = Arc::new(SimActuator::new());
        let store = Arc::new(MemoryStore::new());
        let launcher = Arc::new(SimFlowLauncher::new(
            None,
            store.clone(),
            store_config.flow_state_prefix(),
            exchange.mount_flow(),
            exchange.unmount_flow(),
        ));
        let inventory = Arc::new(RwLock::new(Inventory::tray(8, 12, 3)));
        let monitor = Arc::new(RobotStateMonitor::new(
            Arc::new(TrayReconciler::new(stage.clone(), store.clone(), LOCATION)),
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
        let ctx = ExchangeContext::new(inventory, store.clone(), monitor.clone(), Arc::new(NoOpEvents), LOCATION);
        let changer = Arc::new(TrayChanger::new(
            stage.clone(),
            actuator.clone(),
            flows,
            exchange,
            TimeoutConfig::default(),
            ctx,
        ));
        Rig { changer, stage, actuator, launcher, store, monitor }
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_persists_well() {
        let rig = rig();
        assert_eq!(rig.store.get(LOCATION).await.unwrap(), None);

        rig.changer.load("B7:2").await.unwrap();

        assert_eq!(rig.store.get(LOCATION).await.unwrap().as_deref(), Some("B7:2"));
        assert_eq!(rig.stage.commands(), vec!["move:B7:2-0"]);
        assert_eq!(rig.changer.mounted().await, Some(SlotAddress::crystal(1, 7, 2, 0)));

        rig.monitor.reconcile_once().await.unwrap();
        assert_eq!(rig.changer.state(), HighLevelState::Loaded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_well_forgets_history() {
        let rig = rig();
        rig.changer.load("B7:2").await.unwrap();
        rig.changer.load("C3:1").await.unwrap();

        let inventory = rig.changer.inventory();
        let inventory = inventory.read().await;
        let previous = inventory.resolve_str("B7:2").unwrap();
        assert!(!previous.loaded);
        assert!(!previous.has_been_loaded);
        assert!(inventory.resolve_str("C3:1").unwrap().loaded);
        assert_eq!(rig.store.get(LOCATION).await.unwrap().as_deref(), Some("C3:1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_well_is_noop() {
        let rig = rig();
        rig.changer.load("B7:2").await.unwrap();
        rig.changer.load("b7:2").await.unwrap();
        assert_eq!(rig.stage.commands().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_while_charging() {
        let rig = rig();
        rig.stage.set_phase("Transfer");
        assert!(matches!(rig.changer.load("B7:2").await, Err(ChangerError::Busy(_))));

        rig.stage.set_phase("DataCollection");
        rig.stage.set_state(StageState::Moving);
        assert!(matches!(rig.changer.load("B7:2").await, Err(ChangerError::Busy(_))));
        assert!(rig.stage.commands().is_empty());
        assert_eq!(rig.store.get(LOCATION).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_move_times_out() {
        let rig = rig();
        rig.stage.set_stalled(true);

        let started = Instant::now();
        let err = rig.changer.load("B7:2").await.unwrap_err();
        assert!(matches!(err, ChangerError::PathTimeout { stage: PathStage::Finish, .. }));
        assert!(started.elapsed() >= Duration::from_secs(120));
        assert_eq!(rig.store.get(LOCATION).await.unwrap(), None);
        assert!(rig.changer.mounted().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_wells_rejected() {
        let rig = rig();
        assert!(matches!(rig.changer.load("B7").await, Err(ChangerError::AddressFormat(_))));
        assert!(matches!(rig.changer.load("3:7").await, Err(ChangerError::AddressFormat(_))));
        assert!(matches!(rig.changer.load("B7:4").await, Err(ChangerError::UnknownSlot(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unload_erases_location() {
        let rig = rig();
        rig.changer.load("B7:2").await.unwrap();
        rig.changer.unload().await.unwrap();

        assert_eq!(rig.store.get(LOCATION).await.unwrap(), None);
        assert!(rig.changer.mounted().await.is_none());
        assert_eq!(rig.launcher.submitted(), vec![ExchangeConfig::default().unmount_flow()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resyncs_from_location() {
        let rig = rig();
        rig.store.set(LOCATION, "C3:1").await.unwrap();

        rig.monitor.reconcile_once().await.unwrap();
        assert_eq!(rig.changer.mounted().await, Some(SlotAddress::crystal(2, 3, 1, 0)));

        rig.changer.load("C3:1").await.unwrap();
        assert!(rig.stage.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_chained_load_moves_through_unload() {
        let rig = rig();
        rig.changer.load("B7:2").await.unwrap();
        rig.changer.chained_load(Some("B7:2"), "C3:1").await.unwrap();

        assert_eq!(rig.launcher.submitted().len(), 1);
        assert_eq!(rig.stage.commands(), vec!["move:B7:2-0", "move:C3:1-0"]);
        assert_eq!(rig.store.get(LOCATION).await.unwrap().as_deref(), Some("C3:1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_plate_info() {
        let rig = rig();
        rig.actuator.set_trays(vec![ContainerInfo { id: 4, barcode: "ASP-3018".to_string() }]);
        rig.actuator.set_mounted_plate(Some(4));

        let info = rig.changer.plate_info().await.unwrap();
        assert_eq!((info.rows, info.columns, info.drops), (8, 12, 3));
        assert_eq!(info.barcode, "ASP3018");
    }

    #[tokio::test(start_paused = true)]
    async fn test_plate_info_without_barcode() {
        let rig = rig();
        let started = Instant::now();
        let info = rig.changer.plate_info().await.unwrap();
        assert_eq!(info.barcode, NO_BARCODE);
        assert!(started.elapsed() >= Duration::from_secs(1));
    }
}
