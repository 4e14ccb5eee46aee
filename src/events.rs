//! Event publishing abstraction
//!
//! State transitions and loaded-sample changes are pushed through a trait so
//! the changer can be wired to any transport; the daemon itself only ships a
//! discard sink and a console sink.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::address::SlotAddress;
use crate::state_mapper::StateTransition;
use crate::status::HighLevelState;

/// High-level state change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEvent {
    pub from: HighLevelState,
    pub to: HighLevelState,
    pub timestamp: DateTime<Utc>,
}

impl From<StateTransition> for StateEvent {
    fn from(transition: StateTransition) -> Self {
        Self {
            from: transition.from,
            to: transition.to,
            timestamp: Utc::now(),
        }
    }
}

/// Change of the mounted sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadedEvent {
    pub previous: Option<SlotAddress>,
    pub current: Option<SlotAddress>,
    pub sample_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LoadedEvent {
    pub fn new(previous: Option<SlotAddress>, current: Option<SlotAddress>, sample_id: Option<String>) -> Self {
        Self {
            previous,
            current,
            sample_id,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_state(&self, event: &StateEvent) -> anyhow::Result<()>;

    async fn publish_loaded(&self, event: &LoadedEvent) -> anyhow::Result<()>;

    async fn publish_custom(&self, topic: &str, data: &serde_json::Value) -> anyhow::Result<()> {
        let _ = (topic, data);
        Ok(())
    }
}

/// Discards every event
#[derive(Debug, Clone)]
pub struct NoOpEvents;

#[async_trait]
impl EventPublisher for NoOpEvents {
    async fn publish_state(&self, _event: &StateEvent) -> anyhow::Result<()> {
        Ok(())
    }

    async fn publish_loaded(&self, _event: &LoadedEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Prints events to stdout as JSON
#[derive(Debug, Clone)]
pub struct ConsoleEvents {
    pub pretty_print: bool,
}

impl ConsoleEvents {
    pub fn new() -> Self {
        Self { pretty_print: false }
    }

    pub fn pretty() -> Self {
        Self { pretty_print: true }
    }

    fn render<T: Serialize>(&self, data: &T) -> anyhow::Result<String> {
        Ok(if self.pretty_print {
            serde_json::to_string_pretty(data)?
        } else {
            serde_json::to_string(data)?
        })
    }
}

impl Default for ConsoleEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for ConsoleEvents {
    async fn publish_state(&self, event: &StateEvent) -> anyhow::Result<()> {
        println!("[STATE] {}", self.render(event)?);
        Ok(())
    }

    async fn publish_loaded(&self, event: &LoadedEvent) -> anyhow::Result<()> {
        println!("[LOADED] {}", self.render(event)?);
        Ok(())
    }

    async fn publish_custom(&self, topic: &str, data: &serde_json::Value) -> anyhow::Result<()> {
        println!("[{}] {}", topic, self.render(data)?);
        Ok(())
    }
}
