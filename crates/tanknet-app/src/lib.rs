//! Shared application plumbing for TankNet control surfaces.
//!
//! The runtime owns the single stepper thread; presentation layers talk to
//! it exclusively through [`ControlHandle`]: commands go in over a bounded
//! bus and are applied between ticks, state comes out as atomically
//! replaced immutable snapshots.

pub mod command;
pub mod control;
pub mod runtime;

pub use command::{CommandReceiver, CommandSender, create_command_bus, drain_pending_commands};
pub use control::{ConfigView, ControlError, ControlHandle};
pub use runtime::{ControlRuntime, RuntimeError, SnapshotHub};
