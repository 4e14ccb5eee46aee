//! External mount/unmount flow execution
//!
//! Flows are deployed outside this process and submitted by name with a JSON
//! payload. Their progress is reported through a state key in the shared
//! store, `<prefix>:<sample_id>`, which the runner polls at a fixed interval
//! until it reaches a terminal value. There is no upper bound on how long a
//! flow may run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use crate::store::KeyValueStore;
use crate::{ChangerError, Result};

/// Launches deployed flows
#[async_trait]
pub trait FlowLauncher: Send + Sync {
    /// Submit the flow `name`; returns the run id
    async fn submit(&self, name: &str, parameters: serde_json::Value) -> anyhow::Result<String>;
}

/// Values a flow writes to its state key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Running,
    Failed,
    ReadyToUnmount,
    Completed,
}

impl FlowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::Running => "running",
            FlowState::Failed => "failed",
            FlowState::ReadyToUnmount => "ready_to_unmount",
            FlowState::Completed => "completed",
        }
    }

    pub fn from_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "running" => Some(FlowState::Running),
            "failed" => Some(FlowState::Failed),
            "ready_to_unmount" => Some(FlowState::ReadyToUnmount),
            "completed" => Some(FlowState::Completed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, FlowState::Running)
    }
}

/// One flow invocation
#[derive(Debug, Clone, Serialize)]
pub struct FlowRequest {
    pub name: String,
    pub sample_id: String,
    pub parameters: serde_json::Value,
}

/// Key under which a sample's flow state is reported
pub fn flow_state_key(prefix: &str, sample_id: &str) -> String {
    format!("{}:{}", prefix, sample_id)
}

/// Submits flows and blocks until they report a terminal state
#[derive(Clone)]
pub struct FlowRunner {
    launcher: Arc<dyn FlowLauncher>,
    store: Arc<dyn KeyValueStore>,
    state_prefix: String,
    poll_interval: Duration,
}

impl FlowRunner {
    pub fn new(
        launcher: Arc<dyn FlowLauncher>,
        store: Arc<dyn KeyValueStore>,
        state_prefix: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            launcher,
            store,
            state_prefix: state_prefix.into(),
            poll_interval,
        }
    }

    pub fn state_key(&self, sample_id: &str) -> String {
        flow_state_key(&self.state_prefix, sample_id)
    }

    /// Run a flow to completion. `ReadyToUnmount` counts as success.
    pub async fn run(&self, request: &FlowRequest) -> Result<FlowState> {
        let key = self.state_key(&request.sample_id);
        self.store
            .set(&key, FlowState::Running.as_str())
            .await
            .map_err(ChangerError::store)?;

        let run_id = self
            .launcher
            .submit(&request.name, request.parameters.clone())
            .await
            .map_err(ChangerError::flow)?;
        info!("Submitted flow {} (run {}) for sample {}", request.name, run_id, request.sample_id);

        loop {
            let value = self.store.get(&key).await.map_err(ChangerError::store)?;
            match value.as_deref().and_then(FlowState::from_value) {
                Some(FlowState::Failed) => {
                    error!("Flow {} (run {}) failed for sample {}", request.name, run_id, request.sample_id);
                    return Err(ChangerError::Flow(format!(
                        "flow {} failed for sample {}",
                        request.name, request.sample_id
                    )));
                }
                Some(state) if state.is_terminal() => {
                    info!("Flow {} (run {}) finished: {}", request.name, run_id, state.as_str());
                    return Ok(state);
                }
                Some(_) => {}
                None => debug!("Flow state key {} holds {:?}", key, value),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
