//! Fault reporting from tasks to the FDIR engine.
//!
//! Low-severity reports are fire-and-forget. A high-severity report parks
//! the reporting task until FDIR resolves it or the resolution ceiling
//! elapses. Each task can have at most one high report outstanding.

use core::fmt;
use core::sync::atomic::Ordering;

use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, with_timeout};
use heapless::Vec;
use portable_atomic::AtomicBool;

use crate::config::{FAULT_PAYLOAD_LEN, HIGH_QUEUE_DEPTH, LOW_QUEUE_DEPTH};
use crate::fdir::ErrorCode;
use crate::ids::TaskId;
use crate::sync::{ObcMutex, TrackedGuard};

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    High,
    Low,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultRecord {
    pub severity: Severity,
    pub task: TaskId,
    /// Raw code, kept raw so unknown codes still reach FDIR.
    pub code: u8,
    pub aux: u8,
    pub payload: Vec<u8, FAULT_PAYLOAD_LEN>,
}

impl FaultRecord {
    pub fn new(severity: Severity, task: TaskId, code: ErrorCode, aux: u8) -> Self {
        Self::raw(severity, task, code as u8, aux)
    }

    pub fn raw(severity: Severity, task: TaskId, code: u8, aux: u8) -> Self {
        Self {
            severity,
            task,
            code,
            aux,
            payload: Vec::new(),
        }
    }

    pub fn high(task: TaskId, code: ErrorCode, aux: u8) -> Self {
        Self::new(Severity::High, task, code, aux)
    }

    pub fn low(task: TaskId, code: ErrorCode, aux: u8) -> Self {
        Self::new(Severity::Low, task, code, aux)
    }

    /// Attach payload bytes; anything past the payload limit is cut off.
    pub fn with_payload(mut self, bytes: &[u8]) -> Self {
        let len = bytes.len().min(FAULT_PAYLOAD_LEN);
        self.payload.clear();
        // cannot fail, length is clamped above
        let _ = self.payload.extend_from_slice(&bytes[..len]);
        self
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_raw(self.code)
    }

    /// Little-endian u32 at `offset` of the payload.
    pub fn payload_u32(&self, offset: usize) -> Option<u32> {
        let bytes = self.payload.get(offset..offset + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn payload_u64(&self, offset: usize) -> Option<u64> {
        let low = self.payload_u32(offset)? as u64;
        let high = self.payload_u32(offset + 4)? as u64;
        Some(high << 32 | low)
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportError {
    ChannelFull,
    /// The task already has a high-severity report outstanding.
    AlreadyPending,
    ResolutionTimeout,
    /// The lock handed over before blocking could not be taken back.
    ReacquireFailed,
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportError::ChannelFull => write!(f, "error queue full"),
            ReportError::AlreadyPending => write!(f, "high report already pending"),
            ReportError::ResolutionTimeout => write!(f, "not resolved in time"),
            ReportError::ReacquireFailed => write!(f, "could not reacquire lock"),
        }
    }
}

/// Outcome of [`ErrorChannel::report_high_releasing`].
pub struct ReleasedReport<'m, T> {
    pub outcome: Result<(), ReportError>,
    guard: Option<TrackedGuard<'m, T>>,
}

impl<'m, T> ReleasedReport<'m, T> {
    /// The reacquired guard, or `ReacquireFailed`.
    pub fn into_guard(self) -> Result<TrackedGuard<'m, T>, ReportError> {
        self.guard.ok_or(ReportError::ReacquireFailed)
    }
}

pub struct ErrorChannel {
    high: Channel<ObcMutex, FaultRecord, HIGH_QUEUE_DEPTH>,
    low: Channel<ObcMutex, FaultRecord, LOW_QUEUE_DEPTH>,
    awaiting: [AtomicBool; TaskId::COUNT],
    resolved: [Signal<ObcMutex, ()>; TaskId::COUNT],
    resolution_timeout: Duration,
}

impl ErrorChannel {
    pub const fn new(resolution_timeout: Duration) -> Self {
        Self {
            high: Channel::new(),
            low: Channel::new(),
            awaiting: [const { AtomicBool::new(false) }; TaskId::COUNT],
            resolved: [const { Signal::new() }; TaskId::COUNT],
            resolution_timeout,
        }
    }

    pub fn report_low(&self, record: FaultRecord) -> Result<(), ReportError> {
        debug!("fault: low {:?} code {} from {:?}", record.severity, record.code, record.task);
        self.low.try_send(record).map_err(|_| ReportError::ChannelFull)
    }

    /// Queue a high-severity record and wait until FDIR resolves it.
    pub async fn report_high(&self, record: FaultRecord) -> Result<(), ReportError> {
        let task = record.task;
        let i = task.index();
        if self.awaiting[i].swap(true, Ordering::AcqRel) {
            return Err(ReportError::AlreadyPending);
        }
        self.resolved[i].reset();
        info!("fault: high code {} from {:?}", record.code, task);
        if self.high.try_send(record).is_err() {
            self.awaiting[i].store(false, Ordering::Release);
            return Err(ReportError::ChannelFull);
        }

        match with_timeout(self.resolution_timeout, self.resolved[i].wait()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!("fault: {:?} gave up waiting for resolution", task);
                self.awaiting[i].store(false, Ordering::Release);
                Err(ReportError::ResolutionTimeout)
            }
        }
    }

    /// Like [`ErrorChannel::report_high`] for a caller holding a lock: the
    /// guard is released while blocked and reacquired within `reacquire`.
    pub async fn report_high_releasing<'m, T>(
        &self,
        record: FaultRecord,
        guard: TrackedGuard<'m, T>,
        reacquire: Duration,
    ) -> ReleasedReport<'m, T> {
        let lock = guard.mutex();
        let task = guard.task();
        drop(guard);

        let outcome = self.report_high(record).await;
        let guard = match lock.lock_timeout(task, reacquire).await {
            Ok(guard) => Some(guard),
            Err(e) => {
                error!("fault: {:?} could not reacquire its lock: {:?}", task, e);
                None
            }
        };
        ReleasedReport { outcome, guard }
    }

    // -- FDIR side

    pub fn try_take_high(&self) -> Option<FaultRecord> {
        self.high.try_receive().ok()
    }

    pub fn try_take_low(&self) -> Option<FaultRecord> {
        self.low.try_receive().ok()
    }

    /// Clear the task's awaiting flag and wake it.
    pub fn resolve(&self, task: TaskId) {
        let i = task.index();
        if self.awaiting[i].swap(false, Ordering::AcqRel) {
            self.resolved[i].signal(());
        }
    }

    pub fn is_awaiting(&self, task: TaskId) -> bool {
        self.awaiting[task.index()].load(Ordering::Acquire)
    }

    pub fn high_len(&self) -> usize {
        self.high.len()
    }

    pub fn low_len(&self) -> usize {
        self.low.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::TrackedMutex;
    use embassy_futures::block_on;
    use embassy_futures::join::join;
    use embassy_futures::yield_now;

    #[test]
    fn low_report_succeeds_with_full_high_queue() {
        let channel = ErrorChannel::new(Duration::from_millis(1));
        for task in &TaskId::ALL[..HIGH_QUEUE_DEPTH] {
            // times out, but the record stays queued
            let record = FaultRecord::high(*task, ErrorCode::SsmParamFailed, 0);
            let res = block_on(channel.report_high(record));
            assert_eq!(res, Err(ReportError::ResolutionTimeout));
        }
        assert_eq!(channel.high_len(), HIGH_QUEUE_DEPTH);

        let record = FaultRecord::high(TaskId::Memory, ErrorCode::SpimemReadFailed, 0);
        let res = block_on(channel.report_high(record));
        assert_eq!(res, Err(ReportError::ChannelFull));
        assert!(!channel.is_awaiting(TaskId::Memory));

        let record = FaultRecord::low(TaskId::Memory, ErrorCode::SpimemReadFailed, 0);
        assert_eq!(channel.report_low(record), Ok(()));
        assert_eq!(channel.try_take_low().map(|r| r.task), Some(TaskId::Memory));
    }

    #[test]
    fn low_queue_overflow_is_reported() {
        let channel = ErrorChannel::new(Duration::from_millis(1));
        for _ in 0..LOW_QUEUE_DEPTH {
            channel.report_low(FaultRecord::low(TaskId::Time, ErrorCode::BatteryLow, 0)).unwrap();
        }
        assert_eq!(
            channel.report_low(FaultRecord::low(TaskId::Time, ErrorCode::BatteryLow, 0)),
            Err(ReportError::ChannelFull)
        );
    }

    #[test]
    fn high_report_blocks_until_resolved() {
        let channel = ErrorChannel::new(Duration::from_secs(5));
        let record =
            FaultRecord::high(TaskId::Eps, ErrorCode::SsmParamFailed, 1).with_payload(&[7]);

        let reporter = channel.report_high(record.clone());
        let fdir = async {
            loop {
                if let Some(taken) = channel.try_take_high() {
                    assert_eq!(taken, record);
                    // a second report from the same task is refused meanwhile
                    let second = FaultRecord::high(TaskId::Eps, ErrorCode::SsmParamFailed, 1);
                    let again = channel.report_high(second).await;
                    assert_eq!(again, Err(ReportError::AlreadyPending));
                    channel.resolve(TaskId::Eps);
                    break;
                }
                yield_now().await;
            }
        };
        let (res, ()) = block_on(join(reporter, fdir));
        assert_eq!(res, Ok(()));
        assert!(!channel.is_awaiting(TaskId::Eps));
    }

    #[test]
    fn releasing_report_hands_the_lock_back() {
        let channel = ErrorChannel::new(Duration::from_secs(5));
        let lock = TrackedMutex::new(0u8);

        let reporter = async {
            let guard = lock.lock(TaskId::Memory).await;
            let record = FaultRecord::high(TaskId::Memory, ErrorCode::SpimemWriteFailed, 2);
            let timeout = Duration::from_millis(50);
            let report = channel.report_high_releasing(record, guard, timeout).await;
            assert_eq!(report.outcome, Ok(()));
            let guard = report.into_guard().unwrap();
            assert_eq!(*guard, 1);
        };
        let fdir = async {
            loop {
                if channel.try_take_high().is_some() {
                    // the reporter's lock is free while it waits
                    *lock.try_lock(TaskId::Fdir).unwrap() += 1;
                    channel.resolve(TaskId::Memory);
                    break;
                }
                yield_now().await;
            }
        };
        block_on(join(reporter, fdir));
        assert_eq!(lock.holder(), None);
    }

    #[test]
    fn reacquire_failure_is_distinct() {
        let channel = ErrorChannel::new(Duration::from_secs(5));
        let lock = TrackedMutex::new(());

        let reporter = async {
            let guard = lock.lock(TaskId::Memory).await;
            let record = FaultRecord::high(TaskId::Memory, ErrorCode::SpimemWriteFailed, 0);
            channel
                .report_high_releasing(record, guard, Duration::from_millis(5))
                .await
                .into_guard()
                .err()
        };
        let fdir = async {
            loop {
                if channel.try_take_high().is_some() {
                    let held = lock.try_lock(TaskId::Router).unwrap();
                    channel.resolve(TaskId::Memory);
                    embassy_time::Timer::after_millis(20).await;
                    drop(held);
                    break;
                }
                yield_now().await;
            }
        };
        let (err, ()) = block_on(join(reporter, fdir));
        assert_eq!(err, Some(ReportError::ReacquireFailed));
    }

    #[test]
    fn payload_is_truncated() {
        let record = FaultRecord::low(TaskId::Router, ErrorCode::ChecksumMismatch, 0);
        let record = record.with_payload(&[1u8; 200]);
        assert_eq!(record.payload.len(), FAULT_PAYLOAD_LEN);
        let record = record.with_payload(&[1, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(record.payload_u32(0), Some(1));
        assert_eq!(record.payload_u64(0), Some(2 << 32 | 1));
        assert_eq!(record.payload_u32(6), None);
    }
}
