//! Background state reconciliation
//!
//! Two supervised loops keep the inventory in step with the hardware:
//!
//! - the fast loop takes a status snapshot every `poll_interval`, overlays
//!   occupancy, identity and the loaded flag onto the inventory and feeds the
//!   snapshot through the state mapper, publishing only on transitions
//! - the slow loop refreshes container-level metadata (which pucks are in the
//!   dewar) every `refresh_interval`
//!
//! A failing tick is logged and the next tick retries. A panicking loop is
//! restarted by its supervisor after `restart_delay`.
//!
//! While an exchange window is open the orchestrator owns the loaded flags;
//! the fast loop still publishes state but leaves the flags alone until the
//! window closes, then re-derives them from the hardware.

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use crate::actuator::{Actuator, Stage};
use crate::address::SlotAddress;
use crate::config::MonitorConfig;
use crate::events::{EventPublisher, LoadedEvent, StateEvent};
use crate::inventory::{ContainerInfo, Inventory, SharedInventory};
use crate::state_mapper::{map_robot_status, map_stage_status, StateTracker};
use crate::status::HighLevelState;
use crate::store::KeyValueStore;
use crate::{ChangerError, Result};

#[derive(Debug, Default)]
struct WindowState {
    open: bool,
    /// Bumped every time a window opens
    generation: u64,
    claimed: Vec<SlotAddress>,
}

/// Window state at one instant, compared across a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowMark {
    open: bool,
    generation: u64,
}

impl WindowMark {
    /// No window was open at either mark and none opened in between
    pub fn quiet_since(&self, earlier: &WindowMark) -> bool {
        !earlier.open && !self.open && earlier.generation == self.generation
    }
}

/// Slots claimed by the exchange currently in flight
#[derive(Debug, Clone, Default)]
pub struct ExchangeWindow {
    state: Arc<Mutex<WindowState>>,
}

impl ExchangeWindow {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `addresses` until the returned guard is dropped. The window is
    /// open even when nothing is claimed.
    pub fn open(&self, addresses: Vec<SlotAddress>) -> WindowGuard {
        debug!("Opening exchange window over {:?}", addresses);
        let mut state = self.lock();
        state.open = true;
        state.generation += 1;
        state.claimed = addresses;
        WindowGuard { window: self.clone() }
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    pub fn claimed(&self) -> Vec<SlotAddress> {
        self.lock().claimed.clone()
    }

    pub fn mark(&self) -> WindowMark {
        let state = self.lock();
        WindowMark {
            open: state.open,
            generation: state.generation,
        }
    }
}

/// Closes the exchange window on drop
pub struct WindowGuard {
    window: ExchangeWindow,
}

impl Drop for WindowGuard {
    fn drop(&mut self) {
        let mut state = self.window.lock();
        state.open = false;
        state.claimed.clear();
    }
}

/// What one fast tick observed on the hardware
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub state: HighLevelState,
    /// Slot the hardware reports at the measurement position
    pub mounted: Option<SlotAddress>,
    /// Cached container presence to overlay, when the variant tracks it
    pub containers: Option<Vec<ContainerInfo>>,
    /// Clear has-been-loaded history when the loaded slot changes
    pub forget_history: bool,
}

/// Variant-specific half of the monitor
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn observe(&self) -> anyhow::Result<Observation>;

    /// Slow-loop bookkeeping
    async fn refresh(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Robot arm: status snapshot plus cached puck presence
pub struct RobotReconciler {
    actuator: Arc<dyn Actuator>,
    pucks: RwLock<Option<Vec<ContainerInfo>>>,
}

impl RobotReconciler {
    pub fn new(actuator: Arc<dyn Actuator>) -> Self {
        Self {
            actuator,
            pucks: RwLock::new(None),
        }
    }
}

#[async_trait]
impl Reconciler for RobotReconciler {
    async fn observe(&self) -> anyhow::Result<Observation> {
        let status = self.actuator.status().await?;
        Ok(Observation {
            state: map_robot_status(&status),
            mounted: status.mounted,
            containers: self.pucks.read().await.clone(),
            forget_history: false,
        })
    }

    async fn refresh(&self) -> anyhow::Result<()> {
        let pucks = self.actuator.loaded_pucks().await?;
        debug!("Dewar holds {} pucks", pucks.len());
        *self.pucks.write().await = Some(pucks);
        Ok(())
    }
}

/// Tray stages: the persisted location is the source of truth for what is
/// under the beam
pub struct TrayReconciler {
    stage: Arc<dyn Stage>,
    store: Arc<dyn KeyValueStore>,
    location_key: String,
}

impl TrayReconciler {
    pub fn new(stage: Arc<dyn Stage>, store: Arc<dyn KeyValueStore>, location_key: impl Into<String>) -> Self {
        Self {
            stage,
            store,
            location_key: location_key.into(),
        }
    }
}

#[async_trait]
impl Reconciler for TrayReconciler {
    async fn observe(&self) -> anyhow::Result<Observation> {
        let status = self.stage.status().await?;
        let mounted = match self.store.get(&self.location_key).await? {
            Some(location) => Some(SlotAddress::parse_well(&location)?),
            None => None,
        };
        Ok(Observation {
            state: map_stage_status(&status, mounted.is_some()),
            mounted,
            containers: None,
            forget_history: true,
        })
    }
}

/// Loaded-slot change applied by a tick
type LoadedChange = (Option<SlotAddress>, Option<SlotAddress>, Option<String>);

pub struct RobotStateMonitor {
    reconciler: Arc<dyn Reconciler>,
    inventory: SharedInventory,
    window: ExchangeWindow,
    events: Arc<dyn EventPublisher>,
    config: MonitorConfig,
    tracker: tokio::sync::Mutex<StateTracker>,
    state_tx: watch::Sender<HighLevelState>,
    shutdown: Arc<AtomicBool>,
    ticks: AtomicU64,
}

impl RobotStateMonitor {
    pub fn new(
        reconciler: Arc<dyn Reconciler>,
        inventory: SharedInventory,
        events: Arc<dyn EventPublisher>,
        config: MonitorConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let (state_tx, _) = watch::channel(HighLevelState::Unknown);
        Self {
            reconciler,
            inventory,
            window: ExchangeWindow::new(),
            events,
            config,
            tracker: tokio::sync::Mutex::new(StateTracker::new()),
            state_tx,
            shutdown,
            ticks: AtomicU64::new(0),
        }
    }

    /// Last emitted high-level state
    pub fn state(&self) -> HighLevelState {
        *self.state_tx.borrow()
    }

    /// Receiver that wakes on every state transition
    pub fn subscribe(&self) -> watch::Receiver<HighLevelState> {
        self.state_tx.subscribe()
    }

    pub fn window(&self) -> &ExchangeWindow {
        &self.window
    }

    pub fn inventory(&self) -> &SharedInventory {
        &self.inventory
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// One fast-loop tick
    pub async fn reconcile_once(&self) -> Result<HighLevelState> {
        let before = self.window.mark();
        let observation = self.reconciler.observe().await.map_err(ChangerError::actuator)?;

        let change = {
            let mut inventory = self.inventory.write().await;
            // A snapshot taken while an exchange was in flight may predate its commit
            let write_loaded = self.window.mark().quiet_since(&before);
            apply_observation(&mut inventory, &observation, write_loaded)?
        };

        if let Some((previous, current, sample_id)) = change {
            info!("Loaded sample changed: {:?} -> {:?}", previous, current);
            let event = LoadedEvent::new(previous, current, sample_id);
            if let Err(e) = self.events.publish_loaded(&event).await {
                warn!("Failed to publish loaded event: {}", e);
            }
        }

        self.update_state(observation.state).await;
        Ok(observation.state)
    }

    /// One slow-loop tick
    pub async fn refresh_once(&self) -> Result<()> {
        self.reconciler.refresh().await.map_err(ChangerError::actuator)
    }

    async fn update_state(&self, next: HighLevelState) {
        let transition = self.tracker.lock().await.update(next);
        if let Some(transition) = transition {
            info!("Sample changer state: {} -> {}", transition.from, transition.to);
            self.state_tx.send_replace(transition.to);
            if let Err(e) = self.events.publish_state(&StateEvent::from(transition)).await {
                warn!("Failed to publish state event: {}", e);
            }
        }
    }

    /// Spawn both loops under supervisors
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        info!(
            "Starting state monitor (poll {:?}, refresh {:?})",
            self.config.poll_interval(),
            self.config.refresh_interval()
        );
        let reconcile = Arc::clone(self);
        let refresh = Arc::clone(self);
        vec![
            supervise(
                "reconcile",
                Arc::clone(&self.shutdown),
                self.config.restart_delay(),
                move || Arc::clone(&reconcile).run_reconcile_loop(),
            ),
            supervise(
                "refresh",
                Arc::clone(&self.shutdown),
                self.config.restart_delay(),
                move || Arc::clone(&refresh).run_refresh_loop(),
            ),
        ]
    }

    async fn run_reconcile_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while !self.shutdown.load(Ordering::Relaxed) {
            interval.tick().await;
            let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
            if let Err(e) = self.reconcile_once().await {
                warn!(loop_name = "reconcile", tick, error = %e, "Reconciliation tick failed");
            }
        }
        info!("Reconciliation loop shutting down");
    }

    async fn run_refresh_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.refresh_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick: u64 = 0;
        while !self.shutdown.load(Ordering::Relaxed) {
            interval.tick().await;
            tick += 1;
            if let Err(e) = self.refresh_once().await {
                warn!(loop_name = "refresh", tick, error = %e, "Container refresh failed");
            }
        }
        info!("Refresh loop shutting down");
    }
}

fn apply_observation(
    inventory: &mut Inventory,
    observation: &Observation,
    write_loaded: bool,
) -> Result<Option<LoadedChange>> {
    if let Some(containers) = &observation.containers {
        inventory.apply_puck_presence(containers)?;
    }
    if !write_loaded {
        return Ok(None);
    }

    let previous = inventory.loaded_address();
    if previous == observation.mounted {
        return Ok(None);
    }
    if let Some(mounted) = &observation.mounted {
        // Reject unknown addresses before touching any flag
        inventory.resolve(mounted)?;
    }
    if observation.forget_history {
        inventory.reset_loaded_history();
    }
    inventory.sync_loaded(observation.mounted.as_ref())?;
    let sample_id = inventory.loaded_slot().map(|slot| slot.sample_id());
    Ok(Some((previous, observation.mounted, sample_id)))
}

/// Run `make_loop()` on its own task, restarting it after `restart_delay`
/// whenever it panics. A loop that returns normally ends supervision.
pub fn supervise<F, Fut>(
    name: &'static str,
    shutdown: Arc<AtomicBool>,
    restart_delay: Duration,
    make_loop: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut restarts: u32 = 0;
        loop {
            match tokio::spawn(make_loop()).await {
                Ok(()) => break,
                Err(e) if e.is_panic() => {
                    restarts += 1;
                    error!(
                        loop_name = name,
                        restarts,
                        error = %e,
                        "Loop panicked, restarting in {:?}",
                        restart_delay
                    );
                }
                Err(e) => {
                    warn!(loop_name = name, error = %e, "Loop cancelled");
                    break;
                }
            }
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            tokio::time::sleep(restart_delay).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoOpEvents;
    use crate::sim::{SimActuator, SimStage};
    use crate::status::StageState;
    use crate::store::MemoryStore;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Notify;

    fn robot_monitor(actuator: &Arc<SimActuator>) -> Arc<RobotStateMonitor> {
        let inventory = Arc::new(RwLock::new(Inventory::robot(3, 10)));
        Arc::new(RobotStateMonitor::new(
            Arc::new(RobotReconciler::new(actuator.clone())),
            inventory,
            Arc::new(NoOpEvents),
            MonitorConfig::default(),
            Arc::new(AtomicBool::new(false)),
        ))
    }

    #[tokio::test]
    async fn test_tick_maps_and_marks_loaded() {
        let actuator = Arc::new(SimActuator::new());
        let monitor = robot_monitor(&actuator);
        assert_eq!(monitor.state(), HighLevelState::Unknown);

        assert_eq!(monitor.reconcile_once().await.unwrap(), HighLevelState::Ready);
        assert_eq!(monitor.state(), HighLevelState::Ready);

        actuator.set_mounted(Some(SlotAddress::pin(3, 7)));
        assert_eq!(monitor.reconcile_once().await.unwrap(), HighLevelState::Loaded);
        let inventory = monitor.inventory().read().await;
        assert!(inventory.resolve_str("3:7").unwrap().loaded);
        assert!(inventory.resolve_str("3:7").unwrap().has_been_loaded);
    }

    #[tokio::test]
    async fn test_failed_poll_keeps_state() {
        let actuator = Arc::new(SimActuator::new());
        let monitor = robot_monitor(&actuator);
        monitor.reconcile_once().await.unwrap();

        actuator.fail_next_polls(1);
        assert!(monitor.reconcile_once().await.is_err());
        assert_eq!(monitor.state(), HighLevelState::Ready);
        assert_eq!(monitor.reconcile_once().await.unwrap(), HighLevelState::Ready);
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions_only() {
        let actuator = Arc::new(SimActuator::new());
        let monitor = robot_monitor(&actuator);
        let mut rx = monitor.subscribe();

        monitor.reconcile_once().await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), HighLevelState::Ready);

        monitor.reconcile_once().await.unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_window_defers_loaded_flags() {
        let actuator = Arc::new(SimActuator::new());
        let monitor = robot_monitor(&actuator);
        actuator.set_mounted(Some(SlotAddress::pin(1, 2)));

        {
            let _guard = monitor.window().open(vec![SlotAddress::pin(1, 2)]);
            assert_eq!(monitor.reconcile_once().await.unwrap(), HighLevelState::Loaded);
            assert!(monitor.inventory().read().await.loaded_slot().is_none());
        }
        assert!(!monitor.window().is_open());

        monitor.reconcile_once().await.unwrap();
        assert_eq!(
            monitor.inventory().read().await.loaded_address(),
            Some(SlotAddress::pin(1, 2))
        );
    }

    /// Holds each observation until released; always reports nothing mounted
    #[derive(Default)]
    struct GatedReconciler {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Reconciler for GatedReconciler {
        async fn observe(&self) -> anyhow::Result<Observation> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(Observation {
                state: HighLevelState::Ready,
                mounted: None,
                containers: None,
                forget_history: false,
            })
        }
    }

    #[tokio::test]
    async fn test_commit_during_poll_survives_stale_snapshot() {
        let reconciler = Arc::new(GatedReconciler::default());
        let monitor = Arc::new(RobotStateMonitor::new(
            reconciler.clone(),
            Arc::new(RwLock::new(Inventory::robot(3, 10))),
            Arc::new(NoOpEvents),
            MonitorConfig::default(),
            Arc::new(AtomicBool::new(false)),
        ));

        let tick = {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move { monitor.reconcile_once().await })
        };
        reconciler.entered.notified().await;

        // An exchange opens, commits and closes while the snapshot is in flight
        {
            let _guard = monitor.window().open(vec![SlotAddress::pin(3, 7)]);
            monitor
                .inventory()
                .write()
                .await
                .mark_loaded(&SlotAddress::pin(3, 7))
                .unwrap();
        }
        reconciler.release.notify_one();

        assert_eq!(tick.await.unwrap().unwrap(), HighLevelState::Ready);
        assert_eq!(
            monitor.inventory().read().await.loaded_address(),
            Some(SlotAddress::pin(3, 7))
        );
    }

    #[tokio::test]
    async fn test_empty_window_still_defers() {
        let actuator = Arc::new(SimActuator::new());
        let monitor = robot_monitor(&actuator);
        actuator.set_mounted(Some(SlotAddress::pin(1, 2)));

        let guard = monitor.window().open(Vec::new());
        assert!(monitor.window().is_open());
        monitor.reconcile_once().await.unwrap();
        assert!(monitor.inventory().read().await.loaded_slot().is_none());

        drop(guard);
        assert!(!monitor.window().is_open());
        monitor.reconcile_once().await.unwrap();
        assert_eq!(
            monitor.inventory().read().await.loaded_address(),
            Some(SlotAddress::pin(1, 2))
        );
    }

    #[tokio::test]
    async fn test_refresh_overlays_pucks() {
        let actuator = Arc::new(SimActuator::new());
        actuator.set_pucks(vec![ContainerInfo { id: 2, barcode: "ASP-3018".to_string() }]);
        let monitor = robot_monitor(&actuator);

        monitor.refresh_once().await.unwrap();
        monitor.reconcile_once().await.unwrap();

        let inventory = monitor.inventory().read().await;
        assert!(inventory.containers()[1].present);
        assert_eq!(
            inventory.resolve_str("2:5").unwrap().identity.as_deref(),
            Some("ASP-3018-5")
        );
        assert!(!inventory.resolve_str("1:5").unwrap().present);
    }

    #[tokio::test]
    async fn test_unknown_mounted_address_leaves_inventory() {
        let actuator = Arc::new(SimActuator::new());
        let monitor = robot_monitor(&actuator);
        actuator.set_mounted(Some(SlotAddress::pin(2, 2)));
        monitor.reconcile_once().await.unwrap();

        actuator.set_mounted(Some(SlotAddress::pin(9, 9)));
        assert!(monitor.reconcile_once().await.is_err());
        assert_eq!(
            monitor.inventory().read().await.loaded_address(),
            Some(SlotAddress::pin(2, 2))
        );
    }

    #[tokio::test]
    async fn test_tray_location_drives_loaded() {
        let stage = Arc::new(SimStage::new());
        let store = Arc::new(MemoryStore::new());
        let inventory = Arc::new(RwLock::new(Inventory::tray(8, 12, 3)));
        let monitor = RobotStateMonitor::new(
            Arc::new(TrayReconciler::new(stage.clone(), store.clone(), "current_drop_location")),
            inventory,
            Arc::new(NoOpEvents),
            MonitorConfig::default(),
            Arc::new(AtomicBool::new(false)),
        );

        assert_eq!(monitor.reconcile_once().await.unwrap(), HighLevelState::Ready);

        store.set("current_drop_location", "B7:2").await.unwrap();
        assert_eq!(monitor.reconcile_once().await.unwrap(), HighLevelState::Loaded);
        assert_eq!(
            monitor.inventory().read().await.loaded_address(),
            Some(SlotAddress::crystal(1, 7, 2, 0))
        );

        stage.set_phase("Transfer");
        assert_eq!(monitor.reconcile_once().await.unwrap(), HighLevelState::Charging);

        stage.set_phase("DataCollection");
        stage.set_state(StageState::Fault);
        assert_eq!(monitor.reconcile_once().await.unwrap(), HighLevelState::Fault);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loops_tick_and_stop() {
        let actuator = Arc::new(SimActuator::new());
        let monitor = robot_monitor(&actuator);
        let handles = monitor.start();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(monitor.ticks() >= 3);
        assert_eq!(monitor.state(), HighLevelState::Ready);

        monitor.shutdown.store(true, Ordering::Relaxed);
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_restarts_after_panic() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);

        let handle = supervise("flaky", shutdown, Duration::from_millis(100), move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    panic!("simulated loop crash");
                }
            }
        });

        handle.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
