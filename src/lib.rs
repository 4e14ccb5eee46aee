//! SCD - sample changer control library
//!
//! Moves crystal samples between storage and the measurement position and
//! keeps an addressable inventory in step with continuously polled hardware.
//! Two embodiments are supported: a robot arm exchanging pins between pucks
//! and the goniometer, and a tray changer positioning wells under the beam.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use scd::{ChangerService, SampleChanger};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = ChangerService::simulated_from_path("config/default_config.yaml").await?;
//!     let changer = service.sample_changer();
//!
//!     changer.load("3:7").await?;
//!     println!("State: {}", changer.state());
//!
//!     changer.unload().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Inventory**: addressable storage tree, Puck -> Pin or Row -> Cell -> Drop -> Crystal
//! - **state_mapper**: pure mapping of raw status to [`HighLevelState`]
//! - **RobotStateMonitor**: supervised polling loops reconciling hardware and inventory
//! - **PreconditionSequencer**: timeout-guarded position and tool preconditions
//! - **SampleChanger**: load / unload / chained load, implemented by
//!   [`RobotChanger`] and [`TrayChanger`]
//! - **ChangerService**: wiring of configuration, drivers, store and events

pub mod actuator;
pub mod address;
pub mod config;
pub mod error;
pub mod events;
pub mod exchange;
pub mod flow;
pub mod inventory;
pub mod monitor;
pub mod robot;
pub mod sequencer;
pub mod service;
pub mod sim;
pub mod state_mapper;
pub mod status;
pub mod store;
pub mod tray;

// High-level exports for easy usage
pub use service::{ChangerService, Changer, Hardware};
pub use exchange::{SampleChanger, ExchangePhase};
pub use robot::{RobotChanger, MaintenanceCommand};
pub use tray::{TrayChanger, PlateInfo};
pub use config::ChangerConfig;
pub use error::{Result, ChangerError};
pub use status::{HighLevelState, RobotStatus, StageStatus};
pub use address::SlotAddress;

// Core component exports for advanced usage
pub use actuator::{Actuator, Stage};
pub use inventory::{Inventory, SharedInventory, Slot};
pub use monitor::{RobotStateMonitor, Reconciler};
pub use sequencer::{PreconditionSequencer, Precondition};
pub use flow::{FlowLauncher, FlowRunner, FlowState};
pub use store::{KeyValueStore, MemoryStore, JsonFileStore};
pub use events::{EventPublisher, NoOpEvents, ConsoleEvents};
