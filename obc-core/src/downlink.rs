//! Reports queued for the ground and the framed radio sender that ships them.

use embassy_sync::channel::Channel;
use embassy_time::Instant;
use embedded_io_async::Write;
use heapless::Vec;

use crate::config::DOWNLINK_QUEUE_DEPTH;
use crate::diagnostics::DiagnosticsRecord;
use crate::fdir::ground::VariableRef;
use crate::spimem::MemorySpace;
use crate::sync::ObcMutex;

const FULL_HEADER_LEN: usize = 8;
const HEADER_LEN: u8 = 5;
const MAX_LEN: usize = 256;

const DESTINATION_GROUND: u8 = 0x11;

pub const DUMP_MAX_LEN: usize = 128;
pub const REPORT_MAX_LEN: usize = 160;

pub type DownlinkQueue = Channel<ObcMutex, Report, DOWNLINK_QUEUE_DEPTH>;

/// Operating events the ground must learn about.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventKind {
    SafeModeEntered = 0x01,
    SafeModeExited = 0x02,
    MemoryFallbackEntered = 0x03,
    MemoryFallbackExited = 0x04,
    LowPowerEntered = 0x05,
    LowPowerExited = 0x06,
    ComsTakeoverEntered = 0x07,
    ComsTakeoverExited = 0x08,
    TaskRestarted = 0x09,
    TaskDeleted = 0x0A,
    SsmReset = 0x0B,
    SsmReprogrammed = 0x0C,
    ChipRetired = 0x0D,
    LockRecovered = 0x0E,
    SubsystemPaused = 0x0F,
    SubsystemResumed = 0x10,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventReport {
    pub kind: EventKind,
    /// Error code that caused the event, zero for ground-commanded events.
    pub reason: u8,
    pub detail: u32,
    pub timestamp_ms: u64,
}

impl EventReport {
    pub fn now(kind: EventKind, reason: u8, detail: u32) -> Self {
        Self {
            kind,
            reason,
            detail,
            timestamp_ms: Instant::now().as_millis(),
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    Event(EventReport),
    Diagnostics(DiagnosticsRecord),
    MemoryDump {
        space: MemorySpace,
        address: u32,
        data: Vec<u8, DUMP_MAX_LEN>,
    },
    Checksum {
        space: MemorySpace,
        address: u32,
        len: u32,
        value: u64,
    },
    Variable {
        variable: VariableRef,
        value: u32,
    },
    CommandAck {
        opcode: u8,
        status: i8,
    },
}

impl Report {
    const TAG_EVENT: u8 = 0x01;
    const TAG_DIAGNOSTICS: u8 = 0x02;
    const TAG_DUMP: u8 = 0x03;
    const TAG_CHECKSUM: u8 = 0x04;
    const TAG_VARIABLE: u8 = 0x05;
    const TAG_ACK: u8 = 0x06;

    /// Serialise as a tag byte followed by little-endian fields.
    pub fn encode(&self) -> Result<Vec<u8, REPORT_MAX_LEN>, ()> {
        let mut out = Vec::new();
        match self {
            Report::Event(event) => {
                out.push(Self::TAG_EVENT).map_err(drop)?;
                out.push(event.kind as u8).map_err(drop)?;
                out.push(event.reason).map_err(drop)?;
                out.extend_from_slice(&event.detail.to_le_bytes()).map_err(drop)?;
                out.extend_from_slice(&event.timestamp_ms.to_le_bytes()).map_err(drop)?;
            }
            Report::Diagnostics(record) => {
                out.push(Self::TAG_DIAGNOSTICS).map_err(drop)?;
                out.extend_from_slice(&record.encode()).map_err(drop)?;
            }
            Report::MemoryDump { space, address, data } => {
                out.push(Self::TAG_DUMP).map_err(drop)?;
                out.push(*space as u8).map_err(drop)?;
                out.extend_from_slice(&address.to_le_bytes()).map_err(drop)?;
                out.push(data.len() as u8).map_err(drop)?;
                out.extend_from_slice(data).map_err(drop)?;
            }
            Report::Checksum { space, address, len, value } => {
                out.push(Self::TAG_CHECKSUM).map_err(drop)?;
                out.push(*space as u8).map_err(drop)?;
                out.extend_from_slice(&address.to_le_bytes()).map_err(drop)?;
                out.extend_from_slice(&len.to_le_bytes()).map_err(drop)?;
                out.extend_from_slice(&value.to_le_bytes()).map_err(drop)?;
            }
            Report::Variable { variable, value } => {
                out.push(Self::TAG_VARIABLE).map_err(drop)?;
                let (target, id) = variable.raw();
                out.push(target).map_err(drop)?;
                out.push(id).map_err(drop)?;
                out.extend_from_slice(&value.to_le_bytes()).map_err(drop)?;
            }
            Report::CommandAck { opcode, status } => {
                out.push(Self::TAG_ACK).map_err(drop)?;
                out.push(*opcode).map_err(drop)?;
                out.push(*status as u8).map_err(drop)?;
            }
        }
        Ok(out)
    }
}

/// Queue a report without waiting. A full queue is logged and the report
/// is lost; returns whether it was queued.
pub fn post(queue: &DownlinkQueue, report: Report) -> bool {
    match queue.try_send(report) {
        Ok(()) => true,
        Err(_) => {
            error!("downlink: queue full, report dropped");
            false
        }
    }
}

pub struct DownlinkSender<W: Write> {
    radio: W,
    hwid: u16,
    seq_num: u16,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug)]
pub enum SenderError<RadioError> {
    MessageTooLongError,
    EncodeError,
    WriteError(RadioError),
}

impl<W: Write> DownlinkSender<W> {
    pub fn new(radio: W, hwid: u16) -> Self {
        Self {
            radio,
            hwid,
            seq_num: 0,
        }
    }

    pub fn get_header(&mut self, msg_len: u8) -> [u8; FULL_HEADER_LEN] {
        let header = [
            0x22,
            0x69,                 // start bytes
            msg_len + HEADER_LEN, // packet length (+5 for remaining header)
            self.hwid as u8,
            (self.hwid >> 8) as u8, // Hardware ID
            self.seq_num as u8,
            (self.seq_num >> 8) as u8, // SeqNum
            DESTINATION_GROUND,
        ];
        self.seq_num = self.seq_num.wrapping_add(1);
        header
    }

    pub async fn send(&mut self, msg: &[u8]) -> Result<(), SenderError<W::Error>> {
        if msg.len() > MAX_LEN - FULL_HEADER_LEN {
            return Err(SenderError::MessageTooLongError);
        }

        let mut packet: Vec<u8, MAX_LEN> = Vec::new();
        packet
            .extend_from_slice(&self.get_header(msg.len() as u8))
            .map_err(|_| SenderError::MessageTooLongError)?;
        packet
            .extend_from_slice(msg)
            .map_err(|_| SenderError::MessageTooLongError)?;

        self.radio
            .write_all(&packet)
            .await
            .map_err(SenderError::WriteError)?;
        self.radio.flush().await.map_err(SenderError::WriteError)?;
        Ok(())
    }

    pub async fn send_report(&mut self, report: &Report) -> Result<(), SenderError<W::Error>> {
        let bytes = report.encode().map_err(|_| SenderError::EncodeError)?;
        self.send(&bytes).await
    }
}

/// take queued reports and ship them over the radio
pub async fn downlink_thread<W: Write>(queue: &DownlinkQueue, sender: &mut DownlinkSender<W>) -> ! {
    loop {
        let report = queue.receive().await;
        if let Err(e) = sender.send_report(&report).await {
            error!("could not send report: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimRadio;
    use embassy_futures::block_on;

    #[test]
    fn frames_carry_header_and_sequence() {
        let radio = SimRadio::new();
        let mut sender = DownlinkSender::new(radio.clone(), 0x2DEC);
        let report = Report::CommandAck { opcode: 0x10, status: -2 };

        block_on(sender.send_report(&report)).unwrap();
        block_on(sender.send_report(&report)).unwrap();

        let frames = radio.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], [0x22, 0x69, 8, 0xEC, 0x2D, 0, 0, 0x11, 0x06, 0x10, 0xFE]);
        assert_eq!(frames[1][5], 1);
    }

    #[test]
    fn oversized_message_is_refused() {
        let mut sender = DownlinkSender::new(SimRadio::new(), 1);
        let res = block_on(sender.send(&[0u8; MAX_LEN]));
        assert!(matches!(res, Err(SenderError::MessageTooLongError)));
    }

    #[test]
    fn event_encoding() {
        let report = Report::Event(EventReport {
            kind: EventKind::SafeModeEntered,
            reason: 0x01,
            detail: 2,
            timestamp_ms: 3,
        });
        let bytes = report.encode().unwrap();
        assert_eq!(&bytes[..7], &[0x01, 0x01, 0x01, 2, 0, 0, 0]);
        assert_eq!(bytes.len(), 15);
    }
}
