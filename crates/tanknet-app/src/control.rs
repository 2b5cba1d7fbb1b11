//! The command surface handed to REST, CLI, or test drivers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tanknet_core::{ControlCommand, ParamError, SimParams, SimulationSnapshot, TankNetConfig};
use thiserror::Error;

use crate::command::CommandSender;
use crate::runtime::SnapshotHub;

/// Configuration echo returned to external clients for UI initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigView {
    /// Step of the snapshot current when the echo was taken.
    pub step: u64,
    pub config: TankNetConfig,
}

/// Errors surfaced by the control domain.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    InvalidParameter(#[from] ParamError),
    #[error("command queue is full; retry later")]
    CommandQueueFull,
    #[error("command queue has been closed")]
    CommandQueueClosed,
}

/// Shared handle used by every control surface to reach the running world.
///
/// Reads never block the stepper; commands are queued and applied between
/// ticks. Kill and spawn requests on stale identities are reported by the
/// stepper as no-ops, never as errors.
#[derive(Clone)]
pub struct ControlHandle {
    commands: CommandSender,
    hub: Arc<SnapshotHub>,
}

impl ControlHandle {
    pub(crate) fn new(commands: CommandSender, hub: Arc<SnapshotHub>) -> Self {
        Self { commands, hub }
    }

    /// The latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<SimulationSnapshot> {
        self.hub.latest()
    }

    /// Echo the current configuration (visual constants included).
    #[must_use]
    pub fn config_view(&self) -> ConfigView {
        ConfigView {
            step: self.hub.latest().step,
            config: (*self.hub.config()).clone(),
        }
    }

    fn enqueue(&self, command: ControlCommand) -> Result<(), ControlError> {
        use crossbeam_channel::TrySendError;
        match self.commands.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ControlError::CommandQueueFull),
            Err(TrySendError::Disconnected(_)) => Err(ControlError::CommandQueueClosed),
        }
    }

    /// Start the tick loop; a retry while already running is a no-op.
    pub fn start(&self) -> Result<(), ControlError> {
        self.enqueue(ControlCommand::Start)
    }

    /// Stop the tick loop at the next boundary; entities and step survive.
    pub fn stop(&self) -> Result<(), ControlError> {
        self.enqueue(ControlCommand::Stop)
    }

    /// Regenerate terrain, HQ, targets, and population from the current
    /// parameters.
    pub fn reset(&self) -> Result<(), ControlError> {
        self.enqueue(ControlCommand::Reset)
    }

    /// Validate and apply new parameters. Invalid input is rejected here,
    /// before anything is queued, so the prior state is untouched.
    pub fn set_params(&self, params: SimParams) -> Result<(), ControlError> {
        params.validate()?;
        self.enqueue(ControlCommand::SetParams(params))
    }

    /// Mark a tank destroyed. A second application on the same identity is
    /// a no-op at the stepper, not an error.
    pub fn kill_tank(&self, idx: u32) -> Result<(), ControlError> {
        self.enqueue(ControlCommand::KillTank { idx })
    }

    /// Reinforce the field with a new tank at the given position.
    pub fn spawn_tank(&self, x: f32, y: f32) -> Result<(), ControlError> {
        self.enqueue(ControlCommand::SpawnTank { x, y })
    }
}
