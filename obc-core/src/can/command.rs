//! Logical commands and their 8-byte CAN frame form.
//!
//! Payload bytes 0..4 carry the low word, bytes 4..8 the high word, both
//! little-endian. The high word packs:
//!
//! ```text
//! 31..28 sender  27..24 destination  23..16 message type  15..8 small type  7..0 parameter
//! ```

use embedded_can::{Frame, Id, StandardId};

use super::mailbox::MailboxId;
use crate::ids::Subsystem;

pub const OBC_NODE_ID: u8 = 0x1;
pub const FRAME_LEN: usize = 8;

const COMMAND_ID_BASE: u16 = 0x100;
const HOUSEKEEPING_ID_BASE: u16 = 0x700;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Data = 0x0,
    Housekeeping = 0x1,
    Command = 0x2,
    Fault = 0x3,
    Time = 0x4,
    Bulk = 0x5,
}

impl MessageType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x0 => MessageType::Data,
            0x1 => MessageType::Housekeeping,
            0x2 => MessageType::Command,
            0x3 => MessageType::Fault,
            0x4 => MessageType::Time,
            0x5 => MessageType::Bulk,
            _ => return None,
        })
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmallType {
    ReqData = 0x01,
    RespData = 0x02,
    Nack = 0x03,
    Ack = 0x04,
    ReqHousekeeping = 0x05,
    HkParam = 0x06,
    HkDone = 0x07,
    SetVariable = 0x08,
    SoftReset = 0x09,
    Pause = 0x0A,
    Resume = 0x0B,
    EnterLowPower = 0x0C,
    ExitLowPower = 0x0D,
    ComsTakeover = 0x0E,
    ComsRelease = 0x0F,
    SsmFault = 0x10,
}

impl SmallType {
    const ALL: [SmallType; 16] = [
        SmallType::ReqData,
        SmallType::RespData,
        SmallType::Nack,
        SmallType::Ack,
        SmallType::ReqHousekeeping,
        SmallType::HkParam,
        SmallType::HkDone,
        SmallType::SetVariable,
        SmallType::SoftReset,
        SmallType::Pause,
        SmallType::Resume,
        SmallType::EnterLowPower,
        SmallType::ExitLowPower,
        SmallType::ComsTakeover,
        SmallType::ComsRelease,
        SmallType::SsmFault,
    ];

    pub fn from_raw(raw: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| *t as u8 == raw)
    }
}

/// Unpacked high word.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub sender: u8,
    pub destination: u8,
    pub message_type: u8,
    pub small_type: u8,
    pub param: u8,
}

impl Header {
    /// Header of a message the OBC sends to a subsystem.
    pub const fn to(
        subsystem: Subsystem,
        message_type: MessageType,
        small_type: SmallType,
        param: u8,
    ) -> Self {
        Self {
            sender: OBC_NODE_ID,
            destination: subsystem.node_id(),
            message_type: message_type as u8,
            small_type: small_type as u8,
            param,
        }
    }

    /// Header of a message a subsystem sends to the OBC.
    pub const fn from(
        subsystem: Subsystem,
        message_type: MessageType,
        small_type: SmallType,
        param: u8,
    ) -> Self {
        Self {
            sender: subsystem.node_id(),
            destination: OBC_NODE_ID,
            message_type: message_type as u8,
            small_type: small_type as u8,
            param,
        }
    }

    pub const fn pack(&self) -> u32 {
        ((self.sender as u32 & 0xF) << 28)
            | ((self.destination as u32 & 0xF) << 24)
            | ((self.message_type as u32) << 16)
            | ((self.small_type as u32) << 8)
            | self.param as u32
    }

    pub const fn unpack(raw: u32) -> Self {
        Self {
            sender: (raw >> 28) as u8 & 0xF,
            destination: (raw >> 24) as u8 & 0xF,
            message_type: (raw >> 16) as u8,
            small_type: (raw >> 8) as u8,
            param: raw as u8,
        }
    }

    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_raw(self.message_type)
    }

    pub fn small(&self) -> Option<SmallType> {
        SmallType::from_raw(self.small_type)
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalCommand {
    pub low: u32,
    pub high: u32,
    pub mailbox: MailboxId,
    pub priority: u8,
}

impl LogicalCommand {
    pub const fn new(low: u32, header: Header, mailbox: MailboxId, priority: u8) -> Self {
        Self {
            low,
            high: header.pack(),
            mailbox,
            priority,
        }
    }

    pub const fn header(&self) -> Header {
        Header::unpack(self.high)
    }

    pub fn to_frame(&self) -> CanFrame {
        let header = self.header();
        CanFrame::with_payload(command_frame_id(header.destination, self.mailbox), self.payload())
    }

    pub fn payload(&self) -> [u8; FRAME_LEN] {
        let mut data = [0u8; FRAME_LEN];
        data[..4].copy_from_slice(&self.low.to_le_bytes());
        data[4..].copy_from_slice(&self.high.to_le_bytes());
        data
    }

    /// Decode a received data frame. Short or remote frames carry no command.
    pub fn from_frame(frame: &CanFrame, mailbox: MailboxId, priority: u8) -> Option<Self> {
        if frame.is_remote_frame() || frame.dlc() != FRAME_LEN {
            return None;
        }
        let data = frame.data();
        Some(Self {
            low: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            high: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            mailbox,
            priority,
        })
    }
}

/// `0x100 | destination << 4 | mailbox`
pub fn command_frame_id(destination: u8, mailbox: MailboxId) -> StandardId {
    let raw = COMMAND_ID_BASE | ((destination as u16 & 0xF) << 4) | (mailbox.0 as u16 & 0xF);
    StandardId::new(raw).unwrap_or(StandardId::ZERO)
}

/// Frame id a node answers housekeeping remote frames on.
pub fn housekeeping_node_id(node: u8) -> StandardId {
    StandardId::new(HOUSEKEEPING_ID_BASE | (node as u16 & 0xF)).unwrap_or(StandardId::ZERO)
}

pub fn housekeeping_frame_id(subsystem: Subsystem) -> StandardId {
    housekeeping_node_id(subsystem.node_id())
}

pub fn subsystem_for_housekeeping_id(id: StandardId) -> Option<Subsystem> {
    let raw = id.as_raw();
    if raw & !0xF != HOUSEKEEPING_ID_BASE {
        return None;
    }
    Subsystem::from_node_id((raw & 0xF) as u8)
}

/// Classic CAN frame with a standard identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: StandardId,
    remote: bool,
    dlc: u8,
    data: [u8; FRAME_LEN],
}

impl CanFrame {
    pub fn with_payload(id: StandardId, payload: [u8; FRAME_LEN]) -> Self {
        Self {
            id,
            remote: false,
            dlc: FRAME_LEN as u8,
            data: payload,
        }
    }

    pub fn remote_request(id: StandardId, dlc: u8) -> Self {
        Self {
            id,
            remote: true,
            dlc: dlc.min(FRAME_LEN as u8),
            data: [0; FRAME_LEN],
        }
    }

    pub fn standard_id(&self) -> StandardId {
        self.id
    }
}

impl Frame for CanFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        let Id::Standard(id) = id.into() else {
            return None;
        };
        if data.len() > FRAME_LEN {
            return None;
        }
        let mut payload = [0u8; FRAME_LEN];
        payload[..data.len()].copy_from_slice(data);
        Some(Self {
            id,
            remote: false,
            dlc: data.len() as u8,
            data: payload,
        })
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        let Id::Standard(id) = id.into() else {
            return None;
        };
        if dlc > FRAME_LEN {
            return None;
        }
        Some(Self::remote_request(id, dlc as u8))
    }

    fn is_extended(&self) -> bool {
        false
    }

    fn is_remote_frame(&self) -> bool {
        self.remote
    }

    fn id(&self) -> Id {
        Id::Standard(self.id)
    }

    fn dlc(&self) -> usize {
        self.dlc as usize
    }

    fn data(&self) -> &[u8] {
        if self.remote { &[] } else { &self.data[..self.dlc as usize] }
    }
}
