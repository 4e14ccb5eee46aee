//! Error types for sample changer operations

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChangerError>;

/// Which half of a trajectory wait ran out of time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStage {
    /// The commanded path never became active
    Start,
    /// The path became active but never returned to idle
    Finish,
}

impl std::fmt::Display for PathStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathStage::Start => write!(f, "start"),
            PathStage::Finish => write!(f, "finish"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ChangerError {
    #[error("Invalid address '{0}'")]
    AddressFormat(String),

    #[error("No slot at address '{0}'")]
    UnknownSlot(String),

    #[error("Path '{path}' did not {stage} within {timeout:?}")]
    PathTimeout {
        path: String,
        stage: PathStage,
        timeout: Duration,
    },

    #[error("Actuator could not reach {expected} position (current: {actual})")]
    Position { expected: String, actual: String },

    #[error("Actuator could not mount tool {expected} (current: {actual})")]
    Tool { expected: String, actual: String },

    #[error("Goniometer could not reach phase {expected} (current: {actual})")]
    Phase { expected: String, actual: String },

    #[error("Sample changer busy: {0}")]
    Busy(String),

    #[error("Exchange aborted before completion")]
    Aborted,

    #[error("Sample changer error: {0}")]
    SampleChanger(String),

    #[error("Actuator error: {0}")]
    Actuator(String),

    #[error("Flow error: {0}")]
    Flow(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tokio task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChangerError {
    /// True for the precondition failures that leave the inventory untouched
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            ChangerError::PathTimeout { .. }
                | ChangerError::Position { .. }
                | ChangerError::Tool { .. }
                | ChangerError::Phase { .. }
        )
    }

    pub(crate) fn actuator(err: anyhow::Error) -> Self {
        ChangerError::Actuator(format!("{:#}", err))
    }

    pub(crate) fn store(err: anyhow::Error) -> Self {
        ChangerError::Store(format!("{:#}", err))
    }

    pub(crate) fn flow(err: anyhow::Error) -> Self {
        ChangerError::Flow(format!("{:#}", err))
    }
}
