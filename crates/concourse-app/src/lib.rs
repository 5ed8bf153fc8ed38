//! Shared application plumbing for Concourse control surfaces.

use std::sync::{Arc, Mutex};

use concourse_core::WorldState;

pub type SharedWorld = Arc<Mutex<WorldState>>;

pub mod command;
pub mod control;

pub use command::{
    CommandDrain, CommandReceiver, CommandSender, CommandSubmit, create_command_bus,
    drain_pending_commands, make_command_drain, make_command_submit,
};
pub use control::{ConfigSnapshot, ControlError, ControlHandle, SimStatus};
