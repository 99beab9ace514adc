//! CAN command transport between the OBC and the subsystem micro-controllers.
//!
//! Interrupts capture mailbox contents into a queue; [`CanTransport::run`]
//! classifies them in task context and hands replies to whoever is waiting.

pub mod command;
pub mod mailbox;
mod transport;

pub use command::{CanFrame, Header, LogicalCommand, MessageType, OBC_NODE_ID, SmallType};
pub use mailbox::{
    Controller, MAILBOX_COUNT, MailboxId, MailboxMode, MailboxRegisters, MailboxSnapshot,
    MailboxState,
};
pub use transport::*;
