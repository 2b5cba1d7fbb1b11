//! Bounded command bus feeding the stepper thread.

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};
use tanknet_core::{ControlCommand, WorldState};
use tracing::{debug, warn};

pub type CommandSender = Sender<ControlCommand>;
pub type CommandReceiver = Receiver<ControlCommand>;

/// Create the bounded bus; producers fail fast when the queue is full
/// rather than blocking the caller on the stepper.
pub fn create_command_bus(capacity: usize) -> (CommandSender, CommandReceiver) {
    bounded(capacity)
}

/// Apply one command to the world and trace its outcome.
pub(crate) fn apply_and_trace(world: &mut WorldState, command: ControlCommand) {
    let outcome = world.apply_command(command.clone());
    if outcome.is_no_op() {
        warn!(?command, ?outcome, "control command was a no-op");
    } else {
        debug!(?command, ?outcome, "applied control command");
    }
}

/// Drain every queued command in arrival order, returning how many were
/// applied. Called by the stepper strictly between ticks.
pub fn drain_pending_commands(receiver: &CommandReceiver, world: &mut WorldState) -> usize {
    let mut applied = 0;
    loop {
        match receiver.try_recv() {
            Ok(command) => {
                apply_and_trace(world, command);
                applied += 1;
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
    }
    applied
}
