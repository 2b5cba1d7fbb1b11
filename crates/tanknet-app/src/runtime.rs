//! The simulation controller: one stepper thread, publish-by-replace
//! snapshots, commands applied atomically between ticks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tanknet_core::{SimulationSnapshot, TankNetConfig, WorldState, WorldStateError};
use thiserror::Error;
use tracing::{info, warn};

use crate::command::{CommandReceiver, apply_and_trace, create_command_bus, drain_pending_commands};
use crate::control::ControlHandle;

const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Errors raised while bringing the runtime up.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    World(#[from] WorldStateError),
    #[error("failed to spawn stepper thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Atomically replaced publication slots for the latest snapshot and the
/// current configuration echo. Readers only ever clone an `Arc`, so they
/// never observe a torn state and never stall the stepper.
pub struct SnapshotHub {
    snapshot: RwLock<Arc<SimulationSnapshot>>,
    config: RwLock<Arc<TankNetConfig>>,
}

impl SnapshotHub {
    fn new(world: &WorldState) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(world.snapshot())),
            config: RwLock::new(Arc::new(world.config().clone())),
        }
    }

    /// The most recently published snapshot.
    #[must_use]
    pub fn latest(&self) -> Arc<SimulationSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// The configuration behind the most recent publication.
    #[must_use]
    pub fn config(&self) -> Arc<TankNetConfig> {
        Arc::clone(&self.config.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn publish(&self, snapshot: Arc<SimulationSnapshot>) {
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
    }

    fn publish_config(&self, config: Arc<TankNetConfig>) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
    }
}

/// Owns the stepper thread for one simulation instance.
///
/// Constructed at process start and torn down at shutdown; `reset` flows
/// through the command bus and reinitializes the owned world, never the
/// controller itself.
pub struct ControlRuntime {
    handle: ControlHandle,
    shutdown: Arc<AtomicBool>,
    stepper: Option<JoinHandle<()>>,
}

impl ControlRuntime {
    /// Materialize the world and spawn the stepper.
    pub fn start(config: TankNetConfig) -> Result<Self, RuntimeError> {
        let world = WorldState::new(config)?;
        let tick_interval = Duration::from_millis(world.config().tick_interval_ms);
        let hub = Arc::new(SnapshotHub::new(&world));
        let (sender, receiver) = create_command_bus(COMMAND_QUEUE_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));

        let stepper = {
            let hub = Arc::clone(&hub);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("tanknet-stepper".into())
                .spawn(move || stepper_loop(world, receiver, hub, shutdown, tick_interval))?
        };

        Ok(Self {
            handle: ControlHandle::new(sender, hub),
            shutdown,
            stepper: Some(stepper),
        })
    }

    /// The cloneable handle shared with every control surface.
    #[must_use]
    pub fn handle(&self) -> &ControlHandle {
        &self.handle
    }

    /// Stop the stepper and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop_stepper();
    }

    fn stop_stepper(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(stepper) = self.stepper.take() {
            if stepper.join().is_err() {
                warn!("stepper thread exited with a panic");
            }
        }
    }
}

impl Drop for ControlRuntime {
    fn drop(&mut self) {
        self.stop_stepper();
    }
}

fn stepper_loop(
    mut world: WorldState,
    receiver: CommandReceiver,
    hub: Arc<SnapshotHub>,
    shutdown: Arc<AtomicBool>,
    tick_interval: Duration,
) {
    info!(interval_ms = tick_interval.as_millis() as u64, "stepper started");
    while !shutdown.load(Ordering::Relaxed) {
        let tick_start = Instant::now();

        // Commands only land here, between ticks, so a snapshot can never
        // reflect a partially applied command.
        let applied = drain_pending_commands(&receiver, &mut world);
        if applied > 0 {
            publish_all(&hub, &world);
        }

        if world.running() {
            let events = world.step();
            if events.healed_links > 0 {
                warn!(
                    tick = events.tick.0,
                    healed = events.healed_links,
                    "discarded links referencing dead tanks"
                );
            }
            hub.publish(Arc::new(world.snapshot()));
            if let Some(remaining) = tick_interval.checked_sub(tick_start.elapsed()) {
                thread::sleep(remaining);
            }
        } else {
            // Parked: wait at most one tick for the next command.
            match receiver.recv_timeout(tick_interval) {
                Ok(command) => {
                    apply_and_trace(&mut world, command);
                    drain_pending_commands(&receiver, &mut world);
                    publish_all(&hub, &world);
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    thread::sleep(tick_interval);
                }
            }
        }
    }
    info!("stepper stopped");
}

fn publish_all(hub: &SnapshotHub, world: &WorldState) {
    hub.publish(Arc::new(world.snapshot()));
    hub.publish_config(Arc::new(world.config().clone()));
}
