use std::sync::{MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use concourse_core::{
    AgentPose, ControlCommand, PhaseCensus, TickSummary, WorldState,
};

use crate::SharedWorld;
use crate::command::CommandSubmit;

/// Snapshot of configuration state returned to external clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub tick: u64,
    pub config: Value,
}

/// Live run status surfaced to stat counters and UI widgets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimStatus {
    pub tick: u64,
    pub paused: bool,
    pub speed_multiplier: f32,
    pub agent_count: usize,
    pub population_target: usize,
    pub layout: String,
    pub census: PhaseCensus,
}

/// Errors produced by the control surface.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The simulation thread panicked while holding the world lock.
    #[error("world mutex poisoned")]
    Lock,
    #[error("serialization failure: {0}")]
    Serialization(String),
    /// The bounded command queue rejected the submission.
    #[error("command queue rejected the command")]
    QueueRejected,
}

impl ControlError {
    fn serialization(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<PoisonError<MutexGuard<'_, WorldState>>> for ControlError {
    fn from(_: PoisonError<MutexGuard<'_, WorldState>>) -> Self {
        ControlError::Lock
    }
}

/// Read-mostly handle shared with UI surfaces: snapshots come straight
/// from the world behind its mutex, mutations go through the command bus.
pub struct ControlHandle {
    world: SharedWorld,
    submit: CommandSubmit,
}

impl ControlHandle {
    #[must_use]
    pub fn new(world: SharedWorld, submit: CommandSubmit) -> Self {
        Self { world, submit }
    }

    fn lock_world(&self) -> Result<MutexGuard<'_, WorldState>, ControlError> {
        Ok(self.world.lock()?)
    }

    /// Queue a command for the simulation thread.
    pub fn submit(&self, command: ControlCommand) -> Result<(), ControlError> {
        if (self.submit)(command) {
            Ok(())
        } else {
            Err(ControlError::QueueRejected)
        }
    }

    /// Current run status.
    pub fn status(&self) -> Result<SimStatus, ControlError> {
        let world = self.lock_world()?;
        Ok(SimStatus {
            tick: world.tick_count().0,
            paused: world.is_paused(),
            speed_multiplier: world.speed_multiplier(),
            agent_count: world.agent_count(),
            population_target: world.population_target(),
            layout: world.layout().to_string(),
            census: world.census(),
        })
    }

    /// Behavioural configuration as a JSON document.
    pub fn config_snapshot(&self) -> Result<ConfigSnapshot, ControlError> {
        let world = self.lock_world()?;
        let config = serde_json::to_value(world.config()).map_err(ControlError::serialization)?;
        Ok(ConfigSnapshot {
            tick: world.tick_count().0,
            config,
        })
    }

    /// Most recent recorded tick summary, if any.
    pub fn latest_summary(&self) -> Result<Option<TickSummary>, ControlError> {
        let world = self.lock_world()?;
        Ok(world.history().last().cloned())
    }

    /// Pose snapshots for the rendering layer.
    pub fn poses(&self) -> Result<Vec<AgentPose>, ControlError> {
        let world = self.lock_world()?;
        Ok(world.poses())
    }
}
