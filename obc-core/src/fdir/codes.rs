//! Error codes carried in fault records and the strategy each one selects.

/// Every failure class a task can report.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    // -- subsystem micro-controllers; aux = subsystem
    SsmParamFailed = 0x01,
    HkRequestFailed = 0x02,
    SsmCommandFailed = 0x03,
    SsmReprogramFailed = 0x04,

    // -- packet router queues; the reporting task owns the queue
    TaskToRouterFifoRead = 0x10,
    TaskToRouterFifoWrite = 0x11,
    RouterToTaskFifoRead = 0x12,
    RouterToTaskFifoWrite = 0x13,

    // -- SPI memory; aux = chip
    SpimemWriteFailed = 0x20,
    SpimemReadFailed = 0x21,
    SpimemEraseFailed = 0x22,
    SpimemSelfTestFailed = 0x23,
    SpimemWashUnresolved = 0x24,
    ChecksumMismatch = 0x25,

    // -- locks and scheduling
    CanMutexWedged = 0x30,
    SpimemMutexWedged = 0x31,
    /// aux = stalled task
    TaskStalled = 0x32,

    // -- environment
    BatteryLow = 0x40,
    ComsLinkLost = 0x41,

    InternalConsistency = 0x50,
}

impl ErrorCode {
    const ALL: [ErrorCode; 20] = [
        ErrorCode::SsmParamFailed,
        ErrorCode::HkRequestFailed,
        ErrorCode::SsmCommandFailed,
        ErrorCode::SsmReprogramFailed,
        ErrorCode::TaskToRouterFifoRead,
        ErrorCode::TaskToRouterFifoWrite,
        ErrorCode::RouterToTaskFifoRead,
        ErrorCode::RouterToTaskFifoWrite,
        ErrorCode::SpimemWriteFailed,
        ErrorCode::SpimemReadFailed,
        ErrorCode::SpimemEraseFailed,
        ErrorCode::SpimemSelfTestFailed,
        ErrorCode::SpimemWashUnresolved,
        ErrorCode::ChecksumMismatch,
        ErrorCode::CanMutexWedged,
        ErrorCode::SpimemMutexWedged,
        ErrorCode::TaskStalled,
        ErrorCode::BatteryLow,
        ErrorCode::ComsLinkLost,
        ErrorCode::InternalConsistency,
    ];

    pub fn from_raw(raw: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| *c as u8 == raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_codes_are_unique_and_decode() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_raw(code as u8), Some(code));
        }
        assert_eq!(ErrorCode::from_raw(0x00), None);
        assert_eq!(ErrorCode::from_raw(0xEE), None);
    }
}
