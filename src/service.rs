//! Sample changer service
//!
//! Wires configuration, hardware, store and event sink into a running changer:
//! builds the inventory, picks the variant, starts the monitor loops.

use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use crate::actuator::{Actuator, Stage};
use crate::config::{ChangerConfig, StoreConfig, VariantConfig};
use crate::events::{EventPublisher, NoOpEvents};
use crate::exchange::{ExchangeContext, SampleChanger};
use crate::flow::{FlowLauncher, FlowRunner};
use crate::inventory::{ContainerInfo, Inventory};
use crate::monitor::{Reconciler, RobotReconciler, RobotStateMonitor, TrayReconciler};
use crate::robot::RobotChanger;
use crate::sim::{SimActuator, SimFlowLauncher, SimStage};
use crate::store::{JsonFileStore, KeyValueStore, MemoryStore};
use crate::tray::TrayChanger;
use crate::{ChangerError, Result};

/// Device drivers the service runs against
#[derive(Clone)]
pub struct Hardware {
    pub actuator: Arc<dyn Actuator>,
    /// Goniometer. The tray variant needs it to move wells; the robot
    /// variant puts it into the transfer phase when one is present.
    pub stage: Option<Arc<dyn Stage>>,
    pub flows: Arc<dyn FlowLauncher>,
}

impl Hardware {
    /// In-process simulation of every device, matching the configured variant
    pub fn simulated(config: &ChangerConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let actuator = Arc::new(SimActuator::new());
        let (stage, flow_actuator): (Option<Arc<dyn Stage>>, _) = match config.changer {
            VariantConfig::Robot { pucks, .. } => {
                actuator.set_pucks(
                    (1..=pucks)
                        .step_by(2)
                        .map(|id| ContainerInfo { id, barcode: format!("SIM-{:04}", id) })
                        .collect(),
                );
                let goniometer: Arc<dyn Stage> = Arc::new(SimStage::new());
                (Some(goniometer), Some(Arc::clone(&actuator)))
            }
            VariantConfig::Tray { .. } => {
                actuator.set_trays(vec![ContainerInfo { id: 1, barcode: "SIM-PLATE-1".to_string() }]);
                actuator.set_mounted_plate(Some(1));
                let stage: Arc<dyn Stage> = Arc::new(SimStage::new());
                (Some(stage), None)
            }
        };
        let flows = Arc::new(SimFlowLauncher::new(
            flow_actuator,
            store,
            config.store.flow_state_prefix(),
            config.exchange.mount_flow(),
            config.exchange.unmount_flow(),
        ));
        Self {
            actuator,
            stage,
            flows,
        }
    }
}

/// Open the configured store: a JSON file when a path is set, memory otherwise
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn KeyValueStore>> {
    match &config.path {
        Some(path) => {
            let store = JsonFileStore::open(path).await.map_err(ChangerError::store)?;
            info!("Using store file {}", path);
            Ok(Arc::new(store))
        }
        None => {
            warn!("No store path configured; the active location will not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// The configured changer variant
#[derive(Clone)]
pub enum Changer {
    Robot(Arc<RobotChanger>),
    Tray(Arc<TrayChanger>),
}

impl Changer {
    pub fn as_sample_changer(&self) -> Arc<dyn SampleChanger> {
        match self {
            Changer::Robot(robot) => Arc::clone(robot) as Arc<dyn SampleChanger>,
            Changer::Tray(tray) => Arc::clone(tray) as Arc<dyn SampleChanger>,
        }
    }
}

pub struct ChangerService {
    changer: Changer,
    monitor: Arc<RobotStateMonitor>,
    background_tasks: Vec<JoinHandle<()>>,
    shutdown_signal: Arc<AtomicBool>,
}

impl ChangerService {
    /// Load the configuration file and run against simulated hardware
    pub async fn simulated_from_path(config_path: &str) -> Result<Self> {
        let config = ChangerConfig::load_from_path(config_path)?;
        let store = open_store(&config.store).await?;
        let hardware = Hardware::simulated(&config, Arc::clone(&store));
        Self::new(config, hardware, store, Arc::new(NoOpEvents)).await
    }

    pub async fn new(
        config: ChangerConfig,
        hardware: Hardware,
        store: Arc<dyn KeyValueStore>,
        events: Arc<dyn EventPublisher>,
    ) -> Result<Self> {
        info!("Initializing sample changer service ({:?})", config.changer);
        let shutdown_signal = Arc::new(AtomicBool::new(false));
        let inventory = Arc::new(RwLock::new(Inventory::from_config(&config.changer)));

        let reconciler: Arc<dyn Reconciler> = match &config.changer {
            VariantConfig::Robot { .. } => Arc::new(RobotReconciler::new(Arc::clone(&hardware.actuator))),
            VariantConfig::Tray { .. } => {
                let stage = hardware.stage.clone().ok_or_else(|| {
                    ChangerError::Config("tray variant needs a stage driver".to_string())
                })?;
                Arc::new(TrayReconciler::new(stage, Arc::clone(&store), config.store.location_key()))
            }
        };
        let monitor = Arc::new(RobotStateMonitor::new(
            reconciler,
            Arc::clone(&inventory),
            Arc::clone(&events),
            config.monitor.clone(),
            Arc::clone(&shutdown_signal),
        ));

        // Seed the inventory before accepting requests
        if let Err(e) = monitor.refresh_once().await {
            warn!("Initial container refresh failed: {}", e);
        }
        if let Err(e) = monitor.reconcile_once().await {
            warn!("Initial reconciliation failed: {}", e);
        }

        let flows = FlowRunner::new(
            Arc::clone(&hardware.flows),
            Arc::clone(&store),
            config.store.flow_state_prefix(),
            config.exchange.flow_poll_interval(),
        );
        let ctx = ExchangeContext::new(
            inventory,
            Arc::clone(&store),
            Arc::clone(&monitor),
            events,
            config.store.location_key(),
        );

        let changer = match &config.changer {
            VariantConfig::Robot { .. } => Changer::Robot(Arc::new(RobotChanger::new(
                Arc::clone(&hardware.actuator),
                hardware.stage.clone(),
                flows,
                config.exchange.clone(),
                config.timeouts.clone(),
                ctx,
            ))),
            VariantConfig::Tray { .. } => {
                let stage = hardware.stage.clone().ok_or_else(|| {
                    ChangerError::Config("tray variant needs a stage driver".to_string())
                })?;
                Changer::Tray(Arc::new(TrayChanger::new(
                    stage,
                    Arc::clone(&hardware.actuator),
                    flows,
                    config.exchange.clone(),
                    config.timeouts.clone(),
                    ctx,
                )))
            }
        };

        let background_tasks = monitor.start();
        info!("Sample changer service initialized, state {}", monitor.state());

        Ok(Self {
            changer,
            monitor,
            background_tasks,
            shutdown_signal,
        })
    }

    pub fn changer(&self) -> &Changer {
        &self.changer
    }

    pub fn sample_changer(&self) -> Arc<dyn SampleChanger> {
        self.changer.as_sample_changer()
    }

    pub fn monitor(&self) -> &Arc<RobotStateMonitor> {
        &self.monitor
    }

    /// Stop the background loops after their current tick
    pub fn shutdown(&self) {
        info!("Shutting down sample changer service");
        self.shutdown_signal.store(true, Ordering::Relaxed);
    }

    /// Signal shutdown and wait for the monitor loops to finish
    pub async fn stop(mut self) {
        self.shutdown();
        let tasks = std::mem::take(&mut self.background_tasks);
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("Sample changer service stopped");
    }
}

impl Drop for ChangerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
