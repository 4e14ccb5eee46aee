//! Exchange orchestration shared by both changer variants
//!
//! [`SampleChanger`] is the one interface callers see. The robot and tray
//! implementations differ in how they satisfy preconditions and perform the
//! exchange itself; everything else (single-flight admission, abort,
//! phase tracking, committing the result to the inventory and the persisted
//! location) lives here.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};
use crate::address::SlotAddress;
use crate::events::{EventPublisher, LoadedEvent};
use crate::inventory::SharedInventory;
use crate::monitor::{RobotStateMonitor, WindowGuard};
use crate::sequencer::Precondition;
use crate::status::HighLevelState;
use crate::store::KeyValueStore;
use crate::{ChangerError, Result};

/// Orchestrator progress, distinct from the hardware-derived state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangePhase {
    #[default]
    Idle,
    SequencingPosition,
    SequencingTool,
    SequencingGoniometer,
    Exchanging,
}

impl ExchangePhase {
    pub fn for_precondition(precondition: &Precondition) -> Self {
        match precondition {
            Precondition::Position { .. } => ExchangePhase::SequencingPosition,
            Precondition::Tool { .. } => ExchangePhase::SequencingTool,
            Precondition::GoniometerPhase { .. } => ExchangePhase::SequencingGoniometer,
        }
    }
}

impl fmt::Display for ExchangePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangePhase::Idle => write!(f, "idle"),
            ExchangePhase::SequencingPosition => write!(f, "sequencing(position)"),
            ExchangePhase::SequencingTool => write!(f, "sequencing(tool)"),
            ExchangePhase::SequencingGoniometer => write!(f, "sequencing(goniometer)"),
            ExchangePhase::Exchanging => write!(f, "exchanging"),
        }
    }
}

/// One orchestration call: what to take off, what to put on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeRequest {
    pub old: Option<SlotAddress>,
    pub new: SlotAddress,
}

/// Steps a chained load resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainedPlan {
    /// The requested sample is already mounted
    Nothing,
    Load,
    UnloadThenLoad,
}

impl ExchangeRequest {
    /// Decide against what is actually mounted; `old` is advisory only
    pub fn plan(&self, mounted: Option<SlotAddress>) -> ChainedPlan {
        if let (Some(old), Some(mounted)) = (self.old, mounted) {
            if old != mounted {
                warn!("Chained load expected {} mounted but found {}", old, mounted);
            }
        }
        match mounted {
            Some(current) if current == self.new => ChainedPlan::Nothing,
            Some(_) => ChainedPlan::UnloadThenLoad,
            None => ChainedPlan::Load,
        }
    }
}

/// Single-flight admission, abort flag and phase of the orchestrator
#[derive(Debug, Default)]
pub struct ExchangeControl {
    in_flight: AtomicBool,
    abort_requested: AtomicBool,
    phase: Mutex<ExchangePhase>,
}

impl ExchangeControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one exchange; a second concurrent caller is rejected, not queued
    pub fn begin(&self, operation: &str) -> Result<InFlight<'_>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Rejecting {}: another exchange is in flight", operation);
            return Err(ChangerError::Busy(format!(
                "cannot {} while another exchange is in flight",
                operation
            )));
        }
        self.abort_requested.store(false, Ordering::Release);
        Ok(InFlight { control: self })
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> ExchangePhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: ExchangePhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }

    /// Stop the in-flight exchange before its next step
    pub fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::Release);
    }
}

/// Held for the duration of one exchange; returns the orchestrator to Idle
pub struct InFlight<'a> {
    control: &'a ExchangeControl,
}

impl InFlight<'_> {
    /// Move to the next phase unless an abort was requested
    pub fn advance(&self, phase: ExchangePhase) -> Result<()> {
        if self.control.abort_requested.load(Ordering::Acquire) {
            warn!("Exchange aborted before {}", phase);
            return Err(ChangerError::Aborted);
        }
        self.control.set_phase(phase);
        Ok(())
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.control.set_phase(ExchangePhase::Idle);
        self.control.in_flight.store(false, Ordering::Release);
    }
}

/// Collaborators both variants need to run and commit an exchange
pub struct ExchangeContext {
    pub inventory: SharedInventory,
    pub store: Arc<dyn KeyValueStore>,
    pub monitor: Arc<RobotStateMonitor>,
    pub events: Arc<dyn EventPublisher>,
    pub location_key: String,
    pub control: ExchangeControl,
}

impl ExchangeContext {
    pub fn new(
        inventory: SharedInventory,
        store: Arc<dyn KeyValueStore>,
        monitor: Arc<RobotStateMonitor>,
        events: Arc<dyn EventPublisher>,
        location_key: impl Into<String>,
    ) -> Self {
        Self {
            inventory,
            store,
            monitor,
            events,
            location_key: location_key.into(),
            control: ExchangeControl::new(),
        }
    }

    /// Claim the slots this exchange writes, keeping the monitor off them
    pub async fn open_window(&self, target: Option<SlotAddress>) -> WindowGuard {
        let mut claimed: Vec<SlotAddress> = self.inventory.read().await.loaded_address().into_iter().collect();
        if let Some(target) = target {
            if !claimed.contains(&target) {
                claimed.push(target);
            }
        }
        self.monitor.window().open(claimed)
    }

    /// Record a completed mount: loaded flag, persisted location, event
    pub async fn commit_load(&self, address: &SlotAddress, location: &str, forget_history: bool) -> Result<()> {
        let (previous, sample_id) = {
            let mut inventory = self.inventory.write().await;
            inventory.resolve(address)?;
            if forget_history {
                inventory.reset_loaded_history();
            }
            let previous = inventory.mark_loaded(address)?;
            let sample_id = inventory.resolve(address)?.sample_id();
            (previous, sample_id)
        };

        self.store
            .set(&self.location_key, location)
            .await
            .map_err(ChangerError::store)?;
        info!("Loaded {} ({})", address, sample_id);

        let event = LoadedEvent::new(previous, Some(*address), Some(sample_id));
        if let Err(e) = self.events.publish_loaded(&event).await {
            warn!("Failed to publish loaded event: {}", e);
        }
        Ok(())
    }

    /// Record a completed unmount: every loaded flag cleared, location erased
    pub async fn commit_unload(&self) -> Result<()> {
        let previous = self.inventory.write().await.clear_loaded();
        self.store
            .delete(&self.location_key)
            .await
            .map_err(ChangerError::store)?;
        info!("Unloaded {:?}", previous);

        let event = LoadedEvent::new(previous, None, None);
        if let Err(e) = self.events.publish_loaded(&event).await {
            warn!("Failed to publish loaded event: {}", e);
        }
        Ok(())
    }
}

/// A sample changer, robot arm or tray stage
#[async_trait]
pub trait SampleChanger: Send + Sync {
    /// Mount the sample at `address`
    async fn load(&self, address: &str) -> Result<()>;

    /// Unmount whatever is mounted
    async fn unload(&self) -> Result<()>;

    /// Slot currently at the measurement position, as the inventory sees it
    async fn mounted(&self) -> Option<SlotAddress> {
        self.inventory().read().await.loaded_address()
    }

    /// Swap samples. Unload and load stay two explicit exchanges since the
    /// mechanism cannot hold two samples at once.
    async fn chained_load(&self, old: Option<&str>, new: &str) -> Result<()> {
        let request = {
            let inventory = self.inventory();
            let inventory = inventory.read().await;
            let old = old.map(|o| inventory.parse_address(o)).transpose()?;
            let new = inventory.parse_address(new)?;
            inventory.resolve(&new)?;
            ExchangeRequest { old, new }
        };

        match request.plan(self.mounted().await) {
            ChainedPlan::Nothing => {
                info!("{} already mounted, nothing to do", request.new);
                Ok(())
            }
            ChainedPlan::Load => self.load(new).await,
            ChainedPlan::UnloadThenLoad => {
                self.unload().await?;
                self.load(new).await
            }
        }
    }

    /// Last high-level state published by the monitor
    fn state(&self) -> HighLevelState;

    fn inventory(&self) -> SharedInventory;

    fn phase(&self) -> ExchangePhase;

    /// Prevent further steps of the in-flight exchange and stop the hardware
    async fn abort(&self) -> Result<()>;
}
