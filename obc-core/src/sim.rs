//! Host models of the OBC's peripherals.
//!
//! Every model is a cloneable handle over shared state so a test can keep
//! injecting faults after the engine took ownership of its copy.

use core::fmt;

mod avr;
mod board;
mod can;
mod flash;

pub use avr::{SimAvr, SimResetPin};
pub use board::{SimBoard, SimRadio, SimTasks, SimWatchdog, TaskCall};
pub use can::{SimCanBus, SimCanError, SimController, SsmBehaviour};
pub use flash::SimFlash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimSpiError {
    /// Device is not answering.
    NoResponse,
    /// Transaction did not match the command set.
    Framing,
}

impl fmt::Display for SimSpiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimSpiError::NoResponse => write!(f, "device did not respond"),
            SimSpiError::Framing => write!(f, "malformed transaction"),
        }
    }
}

impl core::error::Error for SimSpiError {}
