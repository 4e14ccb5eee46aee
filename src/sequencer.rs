//! Precondition sequencing with bounded trajectory waits
//!
//! Before an exchange the arm has to be parked at the safe position and
//! carrying the right tool, and the goniometer has to be in its transfer
//! phase. Each precondition is driven the same way:
//!
//! 1. already satisfied: nothing to do
//! 2. issue the non-blocking trigger
//! 3. wait up to the start window for the expected path to become active
//! 4. wait up to the finish window for the path to return to idle
//! 5. re-check the target and fail if the arm still is not there
//!
//! Position always goes before tool: a tool change is only safe from the
//! parked position. The goniometer phase change comes last, once the arm is
//! parked and equipped.
//!
//! Every driver call is bounded, so a controller that stops answering ends
//! the wait with an error instead of hanging the exchange.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use crate::actuator::{Actuator, Stage};
use crate::config::{ExchangeConfig, TimeoutConfig};
use crate::error::PathStage;
use crate::status::{RobotStatus, StageState, StageStatus};
use crate::{ChangerError, Result};

/// Poll `check` every `interval` until it yields true or `timeout` elapses.
///
/// Check errors are logged and retried. A check still pending at the
/// deadline is dropped. Returns whether the condition was met.
pub async fn poll_until<F, Fut>(timeout: Duration, interval: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, check()).await {
            Ok(Ok(true)) => return true,
            Ok(Ok(false)) => {}
            Ok(Err(e)) => warn!("Status poll failed while waiting: {}", e),
            Err(_) => {
                warn!("Status poll still pending after {:?}", timeout);
                return false;
            }
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

/// Await one driver call, failing with an actuator error after `timeout`
pub async fn bounded<T, Fut>(timeout: Duration, device: &str, call: Fut) -> Result<T>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(ChangerError::actuator),
        Err(_) => Err(ChangerError::Actuator(format!(
            "{} did not answer within {:?}",
            device, timeout
        ))),
    }
}

/// A physical state required before an exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Arm parked at `target`, reached through trajectory `path`
    Position { target: String, path: String },
    /// Tool `target` mounted, changed through trajectory `path`
    Tool { target: String, path: String },
    /// Goniometer switched to phase `target`
    GoniometerPhase { target: String },
}

impl Precondition {
    /// The standard exchange preconditions: position, tool, then the
    /// goniometer phase when a goniometer is driven
    pub fn for_exchange(config: &ExchangeConfig, with_goniometer: bool) -> Vec<Precondition> {
        let mut preconditions = vec![
            Precondition::Position {
                target: config.safe_position(),
                path: config.safe_position_path(),
            },
            Precondition::Tool {
                target: config.required_tool(),
                path: config.tool_change_path(),
            },
        ];
        if with_goniometer {
            preconditions.push(Precondition::GoniometerPhase {
                target: config.transfer_phase(),
            });
        }
        preconditions
    }

    /// Whether the arm snapshot already meets an arm precondition.
    /// The goniometer phase is never read from the arm.
    pub fn is_satisfied(&self, status: &RobotStatus) -> bool {
        match self {
            Precondition::Position { target, .. } => status.position.eq_ignore_ascii_case(target),
            Precondition::Tool { target, .. } => status.tool.eq_ignore_ascii_case(target),
            Precondition::GoniometerPhase { .. } => false,
        }
    }

    /// Trajectory name, or the phase name for the goniometer
    pub fn path(&self) -> &str {
        match self {
            Precondition::Position { path, .. } | Precondition::Tool { path, .. } => path,
            Precondition::GoniometerPhase { target } => target,
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Precondition::Position { target, .. }
            | Precondition::Tool { target, .. }
            | Precondition::GoniometerPhase { target } => target,
        }
    }

    fn finish_timeout(&self, timeouts: &TimeoutConfig) -> Duration {
        match self {
            Precondition::Position { .. } => timeouts.position_finish(),
            Precondition::Tool { .. } => timeouts.tool_finish(),
            Precondition::GoniometerPhase { .. } => timeouts.phase_change(),
        }
    }

    fn unmet_error(&self, status: &RobotStatus) -> ChangerError {
        match self {
            Precondition::Position { target, .. } => ChangerError::Position {
                expected: target.clone(),
                actual: status.position.clone(),
            },
            Precondition::Tool { target, .. } => ChangerError::Tool {
                expected: target.clone(),
                actual: status.tool.clone(),
            },
            Precondition::GoniometerPhase { target } => ChangerError::Phase {
                expected: target.clone(),
                actual: "unknown".to_string(),
            },
        }
    }
}

/// How a precondition was met
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreconditionOutcome {
    AlreadySatisfied,
    Completed,
}

/// Drives the actuator (and goniometer) into required states under timeout guards
#[derive(Clone)]
pub struct PreconditionSequencer {
    actuator: Arc<dyn Actuator>,
    goniometer: Option<Arc<dyn Stage>>,
    timeouts: TimeoutConfig,
}

impl PreconditionSequencer {
    pub fn new(actuator: Arc<dyn Actuator>, timeouts: TimeoutConfig) -> Self {
        Self {
            actuator,
            goniometer: None,
            timeouts,
        }
    }

    /// Also drive the goniometer phase before exchanges
    pub fn with_goniometer(mut self, goniometer: Arc<dyn Stage>) -> Self {
        self.goniometer = Some(goniometer);
        self
    }

    pub fn has_goniometer(&self) -> bool {
        self.goniometer.is_some()
    }

    async fn status(&self) -> Result<RobotStatus> {
        bounded(self.timeouts.status_timeout(), "robot controller", self.actuator.status()).await
    }

    async fn goniometer_status(&self, goniometer: &Arc<dyn Stage>) -> Result<StageStatus> {
        bounded(self.timeouts.status_timeout(), "goniometer", goniometer.status()).await
    }

    /// Bring a single precondition about
    pub async fn ensure(&self, precondition: &Precondition) -> Result<PreconditionOutcome> {
        if let Precondition::GoniometerPhase { target } = precondition {
            return self.ensure_phase(target).await;
        }

        let status = self.status().await?;
        if precondition.is_satisfied(&status) {
            debug!("Precondition {:?} already holds", precondition);
            return Ok(PreconditionOutcome::AlreadySatisfied);
        }

        info!(
            "Driving actuator to {} via path '{}'",
            precondition.target(),
            precondition.path()
        );
        let trigger = async {
            match precondition {
                Precondition::Position { target, .. } => self.actuator.move_to_position(target).await,
                Precondition::Tool { target, .. } => self.actuator.change_tool(target).await,
                Precondition::GoniometerPhase { .. } => Ok(()),
            }
        };
        bounded(self.timeouts.status_timeout(), "robot controller", trigger).await?;

        // A trajectory that completes between two polls is never seen active;
        // reaching the target while idle counts as a start.
        self.wait_for_path_start(precondition.path(), |status| {
            precondition.is_satisfied(status) && status.is_idle()
        })
        .await?;
        self.wait_for_idle(precondition.path(), precondition.finish_timeout(&self.timeouts))
            .await?;

        let status = self.status().await?;
        if !precondition.is_satisfied(&status) {
            let err = precondition.unmet_error(&status);
            warn!("{}", err);
            return Err(err);
        }
        info!("Actuator reached {}", precondition.target());
        Ok(PreconditionOutcome::Completed)
    }

    async fn ensure_phase(&self, target: &str) -> Result<PreconditionOutcome> {
        let goniometer = self.goniometer.as_ref().ok_or_else(|| {
            ChangerError::Config(format!("no goniometer driver to switch to phase {}", target))
        })?;
        let status = self.goniometer_status(goniometer).await?;
        if status.phase.eq_ignore_ascii_case(target) {
            debug!("Goniometer already in phase {}", target);
            return Ok(PreconditionOutcome::AlreadySatisfied);
        }

        info!("Switching goniometer from phase {} to {}", status.phase, target);
        bounded(
            self.timeouts.status_timeout(),
            "goniometer",
            goniometer.change_phase(target),
        )
        .await?;

        let timeout = self.timeouts.phase_change();
        let reached = poll_until(timeout, self.timeouts.poll_interval(), || async {
            let status = self.goniometer_status(goniometer).await?;
            Ok::<_, ChangerError>(
                status.state == StageState::Ready && status.phase.eq_ignore_ascii_case(target),
            )
        })
        .await;
        if !reached {
            let actual = match self.goniometer_status(goniometer).await {
                Ok(status) => status.phase,
                Err(_) => "unknown".to_string(),
            };
            let err = ChangerError::Phase {
                expected: target.to_string(),
                actual,
            };
            warn!("{} after {:?}", err, timeout);
            return Err(err);
        }
        info!("Goniometer in phase {}", target);
        Ok(PreconditionOutcome::Completed)
    }

    /// Ensure each precondition in order, calling `on_step` before each one.
    /// The first failure aborts the remaining steps.
    pub async fn ensure_all<F>(&self, preconditions: &[Precondition], mut on_step: F) -> Result<()>
    where
        F: FnMut(&Precondition) -> Result<()>,
    {
        for precondition in preconditions {
            on_step(precondition)?;
            self.ensure(precondition).await?;
        }
        Ok(())
    }

    /// Run an auxiliary trajectory (no target state) to completion
    pub async fn run_path(&self, path: &str, finish_timeout: Duration) -> Result<()> {
        let before = self.status().await?.completed_paths;
        bounded(
            self.timeouts.status_timeout(),
            "robot controller",
            self.actuator.run_path(path),
        )
        .await?;
        // Back to idle with one more finished trajectory: it ran between polls
        self.wait_for_path_start(path, |status| {
            status.is_idle() && status.completed_paths > before
        })
        .await?;
        self.wait_for_idle(path, finish_timeout).await
    }

    /// Wait for `path` to become the active path. `already_done` lets callers
    /// accept a trajectory that finished before it was observed.
    async fn wait_for_path_start<F>(&self, path: &str, already_done: F) -> Result<()>
    where
        F: Fn(&RobotStatus) -> bool,
    {
        let timeout = self.timeouts.path_start();
        let started = poll_until(timeout, self.timeouts.poll_interval(), || async {
            let status = self.status().await?;
            Ok::<_, ChangerError>(status.path == path || already_done(&status))
        })
        .await;

        if !started {
            return Err(ChangerError::PathTimeout {
                path: path.to_string(),
                stage: PathStage::Start,
                timeout,
            });
        }
        Ok(())
    }

    async fn wait_for_idle(&self, path: &str, timeout: Duration) -> Result<()> {
        let finished = poll_until(timeout, self.timeouts.poll_interval(), || async {
            Ok::<_, ChangerError>(self.status().await?.is_idle())
        })
        .await;

        if !finished {
            return Err(ChangerError::PathTimeout {
                path: path.to_string(),
                stage: PathStage::Finish,
                timeout,
            });
        }
        Ok(())
    }
}
