//! Seams to the hardware and the scheduler.
//!
//! The core never touches registers or the executor directly. A board
//! support crate implements these traits for the flight hardware; `sim`
//! implements them for host tests.

use core::fmt;

use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiDevice;

use crate::can::{MailboxId, MailboxRegisters};
use crate::ids::{Subsystem, TaskId};

/// Register-level access to one CAN controller.
pub trait CanController {
    type Error: embedded_can::Error;

    /// Load a mailbox's registers. Does not start a transfer.
    fn configure(&mut self, mailbox: MailboxId, regs: &MailboxRegisters) -> Result<(), Self::Error>;

    /// Start the transfer configured in a mailbox.
    fn arm(&mut self, mailbox: MailboxId) -> Result<(), Self::Error>;

    /// Volatile read of a mailbox, used from interrupt context.
    fn registers(&mut self, mailbox: MailboxId) -> MailboxRegisters;

    fn write_registers(&mut self, mailbox: MailboxId, regs: &MailboxRegisters);

    /// Clear the mailbox's pending interrupt. May clobber its registers.
    fn acknowledge(&mut self, mailbox: MailboxId);
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    NotRunning,
    Refused,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::NotRunning => write!(f, "task is not running"),
            TaskError::Refused => write!(f, "scheduler refused the request"),
        }
    }
}

/// Task lifecycle control offered by the scheduler.
///
/// Restarting a task drops its future, which releases every lock guard it
/// held.
pub trait TaskControl {
    fn restart(&mut self, task: TaskId) -> Result<(), TaskError>;
    fn suspend(&mut self, task: TaskId) -> Result<(), TaskError>;
    fn resume(&mut self, task: TaskId) -> Result<(), TaskError>;
    fn delete(&mut self, task: TaskId) -> Result<(), TaskError>;
}

pub trait Watchdog {
    fn feed(&mut self);
}

/// Hardware types of one board.
pub trait Board {
    type Can: CanController;
    type Flash: SpiDevice;
    type Isp: SpiDevice;
    type Reset: OutputPin;
    type Tasks: TaskControl;
    type Watchdog: Watchdog;
}

/// ISP bus and reset line of one subsystem micro-controller.
pub struct SsmLink<S, P> {
    pub isp: S,
    pub reset: P,
}

/// Hardware the FDIR engine owns outright.
pub struct Hardware<B: Board> {
    pub tasks: B::Tasks,
    pub watchdog: B::Watchdog,
    pub ssm: [SsmLink<B::Isp, B::Reset>; Subsystem::COUNT],
}

impl<B: Board> Hardware<B> {
    pub fn ssm(&mut self, subsystem: Subsystem) -> &mut SsmLink<B::Isp, B::Reset> {
        &mut self.ssm[subsystem.index()]
    }
}
