//! Failure detection, isolation and recovery.
//!
//! Tasks report faults through the [`ErrorChannel`]; the engine takes them
//! one at a time, picks the recovery for the error code and escalates until
//! the fault is gone or the OBC is in safe mode. It is the only writer of the
//! operating mode and the only task allowed to restart others.

pub mod codes;
pub mod fumble;
pub mod ground;
pub mod isp;

use core::fmt;

use embassy_futures::yield_now;
use embassy_sync::mutex::MutexGuard;
use embassy_time::{Duration, Instant, Timer, with_timeout};
use embedded_hal::digital::OutputPin;
use heapless::Vec;

pub use codes::ErrorCode;
use fumble::FumbleCounters;
use ground::GroundQueue;
use isp::IspError;

use crate::board::{Board, Hardware, TaskControl, TaskError, Watchdog};
use crate::can::{CanTransport, SmallType, TransportError};
use crate::checksum::fletcher64_over_store;
use crate::config::FdirConfig;
use crate::diagnostics::{DiagnosticsCollector, SharedCollector};
use crate::downlink::{self, DownlinkQueue, EventKind, EventReport, Report};
use crate::error_channel::{ErrorChannel, FaultRecord, Severity};
use crate::ids::{Subsystem, TaskId};
use crate::mode::{ModeCell, ModeFlags};
use crate::router::{Direction, RouterFifos};
use crate::spimem::{CHIP_COUNT, LogStore, PAGE_SIZE, Region, StorageError, ssm_image_base};
use crate::sync::{LockError, ObcMutex, TrackedGuard, TrackedMutex};

/// Event reason for actions the ground asked for.
pub const REASON_GROUND: u8 = 0x00;

const LOCK_RELEASE_POLL: Duration = Duration::from_millis(1);

/// Mission minute followed by the uptime in milliseconds, both little endian.
pub const TIME_RECORD_LEN: usize = 12;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdirError {
    Storage(StorageError),
    Transport(TransportError),
    Isp(IspError),
    Task(TaskError),
    Lock(LockError),
    CollectorBusy,
    ReadOnly,
    InvalidArgument,
    NotPermitted,
}

impl FdirError {
    /// Signed status sent back in command acknowledgements.
    pub const fn code(&self) -> i8 {
        match self {
            FdirError::Storage(e) => e.code(),
            FdirError::Transport(_) => -10,
            FdirError::Isp(_) => -11,
            FdirError::Task(_) => -12,
            FdirError::Lock(_) => -13,
            FdirError::CollectorBusy => -14,
            FdirError::ReadOnly => -15,
            FdirError::InvalidArgument => -16,
            FdirError::NotPermitted => -17,
        }
    }
}

impl fmt::Display for FdirError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FdirError::Storage(e) => write!(f, "storage: {e}"),
            FdirError::Transport(e) => write!(f, "transport: {e}"),
            FdirError::Isp(e) => write!(f, "isp: {e}"),
            FdirError::Task(e) => write!(f, "task control: {e}"),
            FdirError::Lock(e) => write!(f, "lock: {e}"),
            FdirError::CollectorBusy => write!(f, "diagnostics collector busy"),
            FdirError::ReadOnly => write!(f, "variable is read only"),
            FdirError::InvalidArgument => write!(f, "invalid argument"),
            FdirError::NotPermitted => write!(f, "not permitted"),
        }
    }
}

impl From<StorageError> for FdirError {
    fn from(e: StorageError) -> Self {
        FdirError::Storage(e)
    }
}

impl From<TransportError> for FdirError {
    fn from(e: TransportError) -> Self {
        FdirError::Transport(e)
    }
}

impl From<IspError> for FdirError {
    fn from(e: IspError) -> Self {
        FdirError::Isp(e)
    }
}

impl From<TaskError> for FdirError {
    fn from(e: TaskError) -> Self {
        FdirError::Task(e)
    }
}

impl From<LockError> for FdirError {
    fn from(e: LockError) -> Self {
        FdirError::Lock(e)
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdirState {
    Normal,
    Resolving(u8),
    SafeMode,
}

/// How one fault record ended.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The first check passed; nothing was changed.
    Resolved,
    /// The failure was counted but stayed below its escalation threshold.
    Counted,
    /// A recovery action fixed it.
    Recovered,
    /// The OBC is in safe mode.
    SafeMode,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handled {
    pub severity: Severity,
    pub task: TaskId,
    pub code: u8,
    pub outcome: Outcome,
}

/// What one [`FdirEngine::step`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepSummary {
    pub handled: Vec<Handled, 3>,
    pub commands: usize,
}

/// What the engine confirms a subsystem answers again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Check {
    Param(u8),
    Housekeeping,
    Command { small_type: SmallType, param: u8, value: u32 },
}

/// Shared structures the engine works on.
pub struct FdirLinks<'a, B: Board> {
    pub errors: &'a ErrorChannel,
    pub can: &'a CanTransport<B::Can>,
    pub store: &'a TrackedMutex<LogStore<B::Flash>>,
    pub mode: &'a ModeCell,
    pub downlink: &'a DownlinkQueue,
    pub ground: &'a GroundQueue,
    pub fifos: &'a RouterFifos,
    pub collector: &'a SharedCollector,
}

pub struct FdirEngine<'a, B: Board> {
    errors: &'a ErrorChannel,
    can: &'a CanTransport<B::Can>,
    store: &'a TrackedMutex<LogStore<B::Flash>>,
    mode: &'a ModeCell,
    downlink: &'a DownlinkQueue,
    ground: &'a GroundQueue,
    fifos: &'a RouterFifos,
    collector: &'a SharedCollector,
    hw: Hardware<B>,
    cfg: FdirConfig,
    fumbles: FumbleCounters,
    state: FdirState,
    mission_minutes: u32,
    last_minute: Instant,
}

impl<'a, B: Board> FdirEngine<'a, B> {
    pub fn new(links: FdirLinks<'a, B>, hw: Hardware<B>, cfg: FdirConfig) -> Self {
        Self {
            errors: links.errors,
            can: links.can,
            store: links.store,
            mode: links.mode,
            downlink: links.downlink,
            ground: links.ground,
            fifos: links.fifos,
            collector: links.collector,
            hw,
            cfg,
            fumbles: FumbleCounters::new(),
            state: FdirState::Normal,
            mission_minutes: 0,
            last_minute: Instant::now(),
        }
    }

    pub fn state(&self) -> FdirState {
        self.state
    }

    pub fn config(&self) -> &FdirConfig {
        &self.cfg
    }

    pub fn fumbles(&self) -> &FumbleCounters {
        &self.fumbles
    }

    pub fn hardware(&mut self) -> &mut Hardware<B> {
        &mut self.hw
    }

    pub fn mission_minutes(&self) -> u32 {
        self.mission_minutes
    }

    /// Main loop of the FDIR task.
    pub async fn run(&mut self) -> ! {
        info!("fdir: running");
        loop {
            self.step().await;
            Timer::after(self.cfg.tick).await;
        }
    }

    /// One iteration: one High record, one Low record, one subsystem fault,
    /// every queued ground command, then the safe-mode duties.
    pub async fn step(&mut self) -> StepSummary {
        self.hw.watchdog.feed();
        let mut summary = StepSummary::default();

        if let Some(record) = self.errors.try_take_high() {
            let handled = self.handle(record).await;
            self.errors.resolve(handled.task);
            let _ = summary.handled.push(handled);
            self.hw.watchdog.feed();
        }
        if let Some(record) = self.errors.try_take_low() {
            let handled = self.handle(record).await;
            let _ = summary.handled.push(handled);
            self.hw.watchdog.feed();
        }
        if let Some(fault) = self.can.try_take_fault() {
            warn!("fdir: {:?} raised fault {}", fault.subsystem, fault.code);
            let (task, aux) = (fault.subsystem.task(), fault.subsystem as u8);
            let record = FaultRecord::raw(Severity::Low, task, fault.code, aux)
                .with_payload(&fault.value.to_le_bytes());
            let handled = self.handle(record).await;
            let _ = summary.handled.push(handled);
            self.hw.watchdog.feed();
        }

        while let Ok(cmd) = self.ground.try_receive() {
            let opcode = cmd.opcode();
            let status = match self.exec_command(cmd).await {
                Ok(()) => 0,
                Err(e) => {
                    warn!("fdir: ground command {} failed: {:?}", opcode, e);
                    e.code()
                }
            };
            downlink::post(self.downlink, Report::CommandAck { opcode, status });
            summary.commands += 1;
            self.hw.watchdog.feed();
        }

        self.tick_clock().await;
        if self.mode.snapshot().is_safe() {
            self.safe_mode_diagnostics().await;
        }
        self.hw.watchdog.feed();
        summary
    }

    async fn handle(&mut self, record: FaultRecord) -> Handled {
        if self.state != FdirState::SafeMode {
            self.state = FdirState::Resolving(record.code);
        }
        debug!("fdir: handling code {} from {:?}", record.code, record.task);

        let outcome = match record.error_code() {
            Some(code) => self.dispatch(code, &record).await,
            None => {
                warn!("fdir: unknown error code {} from {:?}", record.code, record.task);
                self.fail_safe(record.code, record.task as u32)
            }
        };

        self.state = if self.mode.snapshot().is_safe() {
            FdirState::SafeMode
        } else {
            FdirState::Normal
        };
        Handled {
            severity: record.severity,
            task: record.task,
            code: record.code,
            outcome,
        }
    }

    async fn dispatch(&mut self, code: ErrorCode, record: &FaultRecord) -> Outcome {
        let reason = code as u8;
        match code {
            ErrorCode::SsmParamFailed => match Subsystem::from_raw(record.aux) {
                Some(sub) => {
                    let param = record.payload.first().copied().unwrap_or(0);
                    self.ssm_ladder(code, sub, Check::Param(param)).await
                }
                None => self.fail_safe(reason, record.aux as u32),
            },
            ErrorCode::HkRequestFailed => match Subsystem::from_raw(record.aux) {
                Some(sub) => self.ssm_ladder(code, sub, Check::Housekeeping).await,
                None => self.fail_safe(reason, record.aux as u32),
            },
            ErrorCode::SsmCommandFailed => match Subsystem::from_raw(record.aux) {
                Some(sub) => {
                    // payload: small type, param, value; anything else only checks liveness
                    let check = match (
                        record.payload.first().copied().and_then(SmallType::from_raw),
                        record.payload.get(1),
                        record.payload_u32(2),
                    ) {
                        (Some(small_type), Some(param), Some(value)) => Check::Command {
                            small_type,
                            param: *param,
                            value,
                        },
                        _ => Check::Housekeeping,
                    };
                    self.ssm_ladder(code, sub, check).await
                }
                None => self.fail_safe(reason, record.aux as u32),
            },
            ErrorCode::SsmReprogramFailed => self.fail_safe(reason, record.aux as u32),
            ErrorCode::TaskToRouterFifoRead | ErrorCode::TaskToRouterFifoWrite => {
                self.fifo_recovery(code, record.task, Direction::TaskToRouter)
            }
            ErrorCode::RouterToTaskFifoRead | ErrorCode::RouterToTaskFifoWrite => {
                self.fifo_recovery(code, record.task, Direction::RouterToTask)
            }
            ErrorCode::SpimemWriteFailed
            | ErrorCode::SpimemReadFailed
            | ErrorCode::SpimemEraseFailed
            | ErrorCode::SpimemSelfTestFailed => self.chip_health(code, record.aux as usize).await,
            ErrorCode::SpimemWashUnresolved => match record.payload_u32(0) {
                Some(page) => self.rewash(code, page).await,
                None => self.fail_safe(reason, 0),
            },
            ErrorCode::ChecksumMismatch => {
                match (record.payload_u32(0), record.payload_u32(4), record.payload_u64(8)) {
                    (Some(base), Some(len), Some(expected)) => {
                        self.verify_range(code, base, len, expected).await
                    }
                    _ => self.fail_safe(reason, 0),
                }
            }
            ErrorCode::CanMutexWedged => {
                let can = self.can;
                self.recover_lock(code, can.lock()).await
            }
            ErrorCode::SpimemMutexWedged => {
                let store = self.store;
                self.recover_lock(code, store).await
            }
            ErrorCode::TaskStalled => match TaskId::from_raw(record.aux) {
                Some(task) => self.stalled_task(code, task),
                None => self.fail_safe(reason, record.aux as u32),
            },
            ErrorCode::BatteryLow => {
                // the mode is set even if a subsystem missed its command
                if let Err(e) = self.enter_low_power(reason).await {
                    warn!("fdir: low power entry incomplete: {:?}", e);
                }
                Outcome::Recovered
            }
            ErrorCode::ComsLinkLost => {
                if let Err(e) = self.enter_coms_takeover(reason).await {
                    warn!("fdir: coms takeover incomplete: {:?}", e);
                }
                Outcome::Recovered
            }
            ErrorCode::InternalConsistency => self.fail_safe(reason, record.task as u32),
        }
    }

    fn fail_safe(&mut self, reason: u8, detail: u32) -> Outcome {
        self.enter_safe_mode(reason, detail);
        Outcome::SafeMode
    }

    // -- subsystem escalation ladder

    async fn check(
        &self,
        subsystem: Subsystem,
        check: Check,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        match check {
            Check::Param(param) => self
                .can
                .request_sensor_data(TaskId::Fdir, subsystem, param, timeout)
                .await
                .map(drop),
            Check::Housekeeping => self
                .can
                .request_housekeeping(TaskId::Fdir, subsystem, timeout)
                .await
                .map(drop),
            Check::Command { small_type, param, value } => {
                self.can
                    .command_ssm(TaskId::Fdir, subsystem, small_type, param, value, timeout)
                    .await
            }
        }
    }

    /// Retry with growing timeouts, then reset, then reprogram, then give up
    /// into safe mode. A check passing at any rung ends the ladder.
    async fn ssm_ladder(&mut self, code: ErrorCode, subsystem: Subsystem, check: Check) -> Outcome {
        if self.mode.snapshot().is_safe() {
            debug!("fdir: in safe mode, not escalating {:?}", subsystem);
            return Outcome::SafeMode;
        }
        let reason = code as u8;

        let mut attempt = 0u8;
        loop {
            let timeout = self.cfg.ssm_timeout(attempt);
            match self.check(subsystem, check, timeout).await {
                Ok(()) => {
                    self.fumbles.ssm(subsystem).reset();
                    return if attempt == 0 { Outcome::Resolved } else { Outcome::Recovered };
                }
                Err(e) => debug!("fdir: check {} of {:?} failed: {:?}", attempt, subsystem, e),
            }
            self.hw.watchdog.feed();
            attempt += 1;
            if self.fumbles.ssm(subsystem).record_failure(self.cfg.ssm_retries).is_some() {
                break;
            }
        }
        let last_timeout = self.cfg.ssm_timeout(attempt.saturating_sub(1));

        warn!("fdir: {:?} unresponsive, resetting", subsystem);
        match self.reset_ssm(subsystem, reason).await {
            Ok(()) => {
                Timer::after(self.cfg.ssm_boot_delay).await;
                if self.check(subsystem, check, last_timeout).await.is_ok() {
                    self.fumbles.ssm(subsystem).reset();
                    return Outcome::Recovered;
                }
            }
            Err(e) => error!("fdir: reset of {:?} failed: {:?}", subsystem, e),
        }
        self.hw.watchdog.feed();

        warn!("fdir: {:?} still unresponsive, reprogramming", subsystem);
        match self.reprogram_ssm(subsystem, reason).await {
            Ok(_) => {
                Timer::after(self.cfg.ssm_boot_delay).await;
                if self.check(subsystem, check, last_timeout).await.is_ok() {
                    self.fumbles.ssm(subsystem).reset();
                    return Outcome::Recovered;
                }
            }
            Err(e) => error!("fdir: reprogramming {:?} failed: {:?}", subsystem, e),
        }

        self.fail_safe(reason, subsystem as u32)
    }

    /// Pulse a subsystem's reset line.
    pub async fn reset_ssm(&mut self, subsystem: Subsystem, reason: u8) -> Result<(), FdirError> {
        let pulse = self.cfg.reset_pulse;
        let link = self.hw.ssm(subsystem);
        link.reset.set_low().map_err(|_| IspError::ResetLine)?;
        Timer::after(pulse).await;
        link.reset.set_high().map_err(|_| IspError::ResetLine)?;
        self.event(EventKind::SsmReset, reason, subsystem as u32);
        Ok(())
    }

    /// Rewrite a subsystem's flash with the image kept in the log store.
    pub async fn reprogram_ssm(
        &mut self,
        subsystem: Subsystem,
        reason: u8,
    ) -> Result<u32, FdirError> {
        let store = self.store;
        let lock_timeout = self.cfg.lock_timeout;
        let link = self.hw.ssm(subsystem);
        let len = isp::reprogram(
            &mut link.isp,
            &mut link.reset,
            store,
            ssm_image_base(subsystem),
            TaskId::Fdir,
            lock_timeout,
        )
        .await?;
        info!("fdir: reprogrammed {:?} with {} bytes", subsystem, len);
        self.event(EventKind::SsmReprogrammed, reason, subsystem as u32);
        Ok(len)
    }

    // -- queues and tasks

    fn fifo_recovery(&mut self, code: ErrorCode, task: TaskId, direction: Direction) -> Outcome {
        let preserved = self.fifos.recreate(task, direction);
        debug!("fdir: recreated queue of {:?}, {} packets kept", task, preserved);
        match self.fumbles.fifo(task, direction).record_failure(self.cfg.fifo_threshold) {
            None => Outcome::Recovered,
            Some(1) => match self.restart_task(task, code as u8) {
                Ok(()) => Outcome::Recovered,
                Err(e) => {
                    error!("fdir: could not restart {:?}: {:?}", task, e);
                    self.fail_safe(code as u8, task as u32)
                }
            },
            Some(_) => self.fail_safe(code as u8, task as u32),
        }
    }

    fn stalled_task(&mut self, code: ErrorCode, task: TaskId) -> Outcome {
        if self.fumbles.stall(task).record_failure(self.cfg.stall_threshold).is_some() {
            return self.fail_safe(code as u8, task as u32);
        }
        match self.restart_task(task, code as u8) {
            Ok(()) => Outcome::Recovered,
            Err(e) => {
                error!("fdir: could not restart {:?}: {:?}", task, e);
                self.fail_safe(code as u8, task as u32)
            }
        }
    }

    pub fn restart_task(&mut self, task: TaskId, reason: u8) -> Result<(), FdirError> {
        if task == TaskId::Fdir {
            return Err(FdirError::NotPermitted);
        }
        self.hw.tasks.restart(task)?;
        // the old instance is gone, nobody is waiting on its report any more
        self.errors.resolve(task);
        self.fumbles.reset_task(task);
        self.event(EventKind::TaskRestarted, reason, task as u32);
        Ok(())
    }

    pub fn delete_task(&mut self, task: TaskId, reason: u8) -> Result<(), FdirError> {
        if task.survives_safe_mode() {
            return Err(FdirError::NotPermitted);
        }
        self.hw.tasks.delete(task)?;
        self.errors.resolve(task);
        self.event(EventKind::TaskDeleted, reason, task as u32);
        Ok(())
    }

    // -- locks

    /// Restart whoever holds a wedged lock; its dropped future releases the
    /// guard. Anything short of a free lock afterwards ends in safe mode.
    async fn recover_lock<T>(&mut self, code: ErrorCode, lock: &TrackedMutex<T>) -> Outcome {
        let reason = code as u8;
        let Some(holder) = lock.holder() else {
            return match lock.recover() {
                Ok(()) => Outcome::Resolved,
                Err(e) => {
                    error!("fdir: lock held without a holder: {:?}", e);
                    self.fail_safe(reason, 0)
                }
            };
        };
        if holder == TaskId::Fdir {
            error!("fdir: lock wedged by fdir itself");
            return self.fail_safe(reason, holder as u32);
        }

        warn!("fdir: lock wedged by {:?}, restarting it", holder);
        if let Err(e) = self.restart_task(holder, reason) {
            error!("fdir: could not restart {:?}: {:?}", holder, e);
            return self.fail_safe(reason, holder as u32);
        }

        let released = with_timeout(self.cfg.lock_timeout, async {
            while lock.is_locked() {
                yield_now().await;
                Timer::after(LOCK_RELEASE_POLL).await;
            }
        })
        .await;
        if released.is_err() {
            debug!("fdir: lock still held after restart of {:?}", holder);
        }
        match lock.recover() {
            Ok(()) => {
                self.event(EventKind::LockRecovered, reason, holder as u32);
                Outcome::Recovered
            }
            Err(e) => {
                error!("fdir: lock recovery failed: {:?}", e);
                self.fail_safe(reason, holder as u32)
            }
        }
    }

    // -- storage

    async fn store_guard(&self) -> Result<TrackedGuard<'a, LogStore<B::Flash>>, FdirError> {
        let store: &'a TrackedMutex<LogStore<B::Flash>> = self.store;
        Ok(store.lock_timeout(TaskId::Fdir, self.cfg.lock_timeout).await?)
    }

    async fn collector_guard(
        &self,
    ) -> Result<MutexGuard<'a, ObcMutex, DiagnosticsCollector>, FdirError> {
        let collector: &'a SharedCollector = self.collector;
        with_timeout(self.cfg.lock_timeout, collector.lock())
            .await
            .map_err(|_| FdirError::CollectorBusy)
    }

    /// Self test a chip that failed an access.
    async fn chip_health(&mut self, code: ErrorCode, chip: usize) -> Outcome {
        if chip >= CHIP_COUNT {
            return self.fail_safe(code as u8, chip as u32);
        }
        let test = match self.store_guard().await {
            Ok(mut store) => {
                if !store.is_healthy(chip) {
                    debug!("fdir: chip {} already retired", chip);
                    return Outcome::Resolved;
                }
                store.self_test(chip)
            }
            Err(e) => {
                error!("fdir: store unavailable for self test: {:?}", e);
                let store = self.store;
                return self.recover_lock(ErrorCode::SpimemMutexWedged, store).await;
            }
        };
        match test {
            Ok(()) => {
                self.fumbles.chip(chip).reset();
                Outcome::Resolved
            }
            Err(e) => {
                warn!("fdir: chip {} failed self test: {:?}", chip, e);
                self.count_chip_failure(code, chip).await
            }
        }
    }

    async fn count_chip_failure(&mut self, code: ErrorCode, chip: usize) -> Outcome {
        if self.fumbles.chip(chip).record_failure(self.cfg.spi_chip_threshold).is_none() {
            return Outcome::Counted;
        }
        self.retire_chip(code, chip).await
    }

    async fn retire_chip(&mut self, code: ErrorCode, chip: usize) -> Outcome {
        let remaining = match self.store_guard().await {
            Ok(mut store) => store.mark_unhealthy(chip),
            Err(e) => {
                error!("fdir: store unavailable to retire chip {}: {:?}", chip, e);
                return self.fail_safe(code as u8, chip as u32);
            }
        };
        self.fumbles.chip(chip).reset();
        error!("fdir: retired chip {}, {} left", chip, remaining);
        self.event(EventKind::ChipRetired, code as u8, chip as u32);
        if remaining == 0 {
            self.enter_internal_memory_fallback(code as u8).await;
        }
        Outcome::Recovered
    }

    /// Vote a page again; a page that stays unresolved counts against the
    /// chip reads are served from.
    async fn rewash(&mut self, code: ErrorCode, page: u32) -> Outcome {
        let (result, primary) = match self.store_guard().await {
            Ok(mut store) => (store.wash_page(page), store.primary()),
            Err(_) => {
                let store = self.store;
                return self.recover_lock(ErrorCode::SpimemMutexWedged, store).await;
            }
        };
        let suspect = match result {
            Ok(Some(vote)) if vote.unresolved == 0 => return Outcome::Recovered,
            Ok(None) => return Outcome::Resolved,
            Ok(Some(vote)) => {
                warn!("fdir: page {} keeps {} unresolved bytes", page, vote.unresolved);
                primary
            }
            Err(e) => e.chip().map(usize::from).or(primary),
        };
        match suspect {
            Some(chip) => self.count_chip_failure(code, chip).await,
            None => Outcome::Resolved,
        }
    }

    async fn verify_range(
        &mut self,
        code: ErrorCode,
        base: u32,
        len: u32,
        expected: u64,
    ) -> Outcome {
        let first = base / PAGE_SIZE as u32;
        let end = base.saturating_add(len).div_ceil(PAGE_SIZE as u32);
        let (result, primary) = match self.store_guard().await {
            Ok(mut store) => {
                if let Err(e) = store.wash(first..end) {
                    warn!("fdir: wash before verify failed: {:?}", e);
                }
                (fletcher64_over_store(&mut *store, base, len), store.primary())
            }
            Err(_) => {
                let store = self.store;
                return self.recover_lock(ErrorCode::SpimemMutexWedged, store).await;
            }
        };
        let suspect = match result {
            Ok(actual) if actual == expected => return Outcome::Recovered,
            Ok(actual) => {
                warn!("fdir: checksum {} != {} after wash", actual, expected);
                primary
            }
            Err(e) => e.chip().map(usize::from).or(primary),
        };
        match suspect {
            Some(chip) => self.count_chip_failure(code, chip).await,
            None => Outcome::Resolved,
        }
    }

    // -- modes

    /// Post an event to the ground and, when the store is free, log it.
    fn event(&self, kind: EventKind, reason: u8, detail: u32) {
        let report = Report::Event(EventReport::now(kind, reason, detail));
        if let Ok(mut store) = self.store.try_lock(TaskId::Fdir) {
            if let Ok(bytes) = report.encode() {
                if let Err(e) = store.append(Region::Event, &bytes) {
                    debug!("fdir: event not logged: {:?}", e);
                }
            }
        }
        downlink::post(self.downlink, report);
    }

    /// Idempotent; a second entry posts no second event.
    pub fn enter_safe_mode(&mut self, reason: u8, detail: u32) {
        if self.mode.snapshot().is_safe() {
            debug!("fdir: already in safe mode");
            return;
        }
        self.event(EventKind::SafeModeEntered, reason, detail);
        self.mode.set(ModeFlags::SAFE, true);
        self.state = FdirState::SafeMode;
        error!("fdir: safe mode, reason {} detail {}", reason, detail);

        for task in TaskId::ALL {
            if task.survives_safe_mode() {
                continue;
            }
            if let Err(e) = self.hw.tasks.suspend(task) {
                debug!("fdir: could not suspend {:?}: {:?}", task, e);
            }
        }
    }

    pub fn exit_safe_mode(&mut self) {
        if !self.mode.snapshot().is_safe() {
            return;
        }
        self.event(EventKind::SafeModeExited, REASON_GROUND, 0);
        self.mode.set(ModeFlags::SAFE, false);
        self.state = FdirState::Normal;
        info!("fdir: leaving safe mode");

        let snapshot = self.mode.snapshot();
        for task in TaskId::ALL {
            let paused = Subsystem::ALL
                .into_iter()
                .any(|s| s.task() == task && snapshot.is_paused(s));
            if task.survives_safe_mode() || paused {
                continue;
            }
            if let Err(e) = self.hw.tasks.resume(task) {
                debug!("fdir: could not resume {:?}: {:?}", task, e);
            }
        }
    }

    pub async fn enter_internal_memory_fallback(&mut self, reason: u8) {
        if self.mode.snapshot().is_memory_fallback() {
            return;
        }
        self.event(EventKind::MemoryFallbackEntered, reason, 0);
        self.mode.set(ModeFlags::INTERNAL_MEMORY_FALLBACK, true);
        match self.store_guard().await {
            Ok(mut store) => store.enter_internal_fallback(),
            Err(e) => error!("fdir: could not switch store to internal memory: {:?}", e),
        }
    }

    /// Back onto the SPI array. Every chip is self tested first and the ones
    /// that pass rejoin the mirror set.
    pub async fn exit_internal_memory_fallback(&mut self) -> Result<(), FdirError> {
        if !self.mode.snapshot().is_memory_fallback() {
            return Ok(());
        }
        let mut store = self.store_guard().await?;
        let mut healthy = 0;
        for chip in 0..CHIP_COUNT {
            if store.self_test(chip).is_ok() {
                store.mark_healthy(chip);
                self.fumbles.chip(chip).reset();
                healthy += 1;
            }
        }
        if healthy == 0 {
            return Err(FdirError::Storage(StorageError::AllChipsExhausted));
        }
        drop(store);

        self.event(EventKind::MemoryFallbackExited, REASON_GROUND, healthy);
        self.store_guard().await?.exit_internal_fallback()?;
        self.mode.set(ModeFlags::INTERNAL_MEMORY_FALLBACK, false);
        Ok(())
    }

    /// Suspend a subsystem's task and tell its controller to pause.
    pub async fn pause_subsystem(
        &mut self,
        subsystem: Subsystem,
        reason: u8,
    ) -> Result<(), FdirError> {
        if self.mode.snapshot().is_paused(subsystem) {
            return Ok(());
        }
        self.mode.set(ModeFlags::paused(subsystem), true);
        if let Err(e) = self.hw.tasks.suspend(subsystem.task()) {
            debug!("fdir: could not suspend {:?}: {:?}", subsystem.task(), e);
        }
        self.event(EventKind::SubsystemPaused, reason, subsystem as u32);
        self.mode_command(subsystem, SmallType::Pause).await?;
        Ok(())
    }

    pub async fn resume_subsystem(
        &mut self,
        subsystem: Subsystem,
        reason: u8,
    ) -> Result<(), FdirError> {
        if !self.mode.snapshot().is_paused(subsystem) {
            return Ok(());
        }
        self.mode.set(ModeFlags::paused(subsystem), false);
        if !self.mode.snapshot().is_safe() {
            if let Err(e) = self.hw.tasks.resume(subsystem.task()) {
                debug!("fdir: could not resume {:?}: {:?}", subsystem.task(), e);
            }
        }
        self.event(EventKind::SubsystemResumed, reason, subsystem as u32);
        self.mode_command(subsystem, SmallType::Resume).await?;
        Ok(())
    }

    /// Low power: EPS sheds load and the payload is paused.
    pub async fn enter_low_power(&mut self, reason: u8) -> Result<(), FdirError> {
        if self.mode.snapshot().is_low_power() {
            return Ok(());
        }
        self.mode.set(ModeFlags::LOW_POWER, true);
        self.event(EventKind::LowPowerEntered, reason, 0);
        let eps = self.mode_command(Subsystem::Eps, SmallType::EnterLowPower).await;
        let paused = self.pause_subsystem(Subsystem::Payload, reason).await;
        eps?;
        paused
    }

    pub async fn exit_low_power(&mut self) -> Result<(), FdirError> {
        if !self.mode.snapshot().is_low_power() {
            return Ok(());
        }
        self.mode.set(ModeFlags::LOW_POWER, false);
        self.event(EventKind::LowPowerExited, REASON_GROUND, 0);
        let eps = self.mode_command(Subsystem::Eps, SmallType::ExitLowPower).await;
        let resumed = self.resume_subsystem(Subsystem::Payload, REASON_GROUND).await;
        eps?;
        resumed
    }

    /// The OBC takes over the downlink from COMS.
    pub async fn enter_coms_takeover(&mut self, reason: u8) -> Result<(), FdirError> {
        if self.mode.snapshot().is_coms_takeover() {
            return Ok(());
        }
        self.mode.set(ModeFlags::COMS_TAKEOVER, true);
        self.event(EventKind::ComsTakeoverEntered, reason, 0);
        self.mode_command(Subsystem::Coms, SmallType::ComsTakeover).await?;
        Ok(())
    }

    pub async fn exit_coms_takeover(&mut self) -> Result<(), FdirError> {
        if !self.mode.snapshot().is_coms_takeover() {
            return Ok(());
        }
        self.mode.set(ModeFlags::COMS_TAKEOVER, false);
        self.event(EventKind::ComsTakeoverExited, REASON_GROUND, 0);
        self.mode_command(Subsystem::Coms, SmallType::ComsRelease).await?;
        Ok(())
    }

    async fn mode_command(
        &self,
        subsystem: Subsystem,
        small_type: SmallType,
    ) -> Result<(), TransportError> {
        let timeout = self.cfg.param_timeout;
        self.can.command_ssm(TaskId::Fdir, subsystem, small_type, 0, 0, timeout).await
    }

    // -- periodic duties

    /// Mission clock. In safe mode the time task is suspended and the
    /// engine logs the minute tick itself. Every tick flushes the log cursors.
    async fn tick_clock(&mut self) {
        if Instant::now().duration_since(self.last_minute) < self.cfg.minute {
            return;
        }
        self.last_minute += self.cfg.minute;
        self.mission_minutes += 1;

        let mut store = match self.store_guard().await {
            Ok(store) => store,
            Err(e) => {
                warn!("fdir: minute {} without the store: {:?}", self.mission_minutes, e);
                return;
            }
        };
        if self.mode.snapshot().is_safe() {
            let mut record = [0u8; TIME_RECORD_LEN];
            record[..4].copy_from_slice(&self.mission_minutes.to_le_bytes());
            record[4..].copy_from_slice(&Instant::now().as_millis().to_le_bytes());
            if let Err(e) = store.append(Region::Time, &record) {
                warn!("fdir: time record not stored: {:?}", e);
            }
        }
        if let Err(e) = store.flush_cursors() {
            debug!("fdir: cursors not flushed: {:?}", e);
        }
    }

    async fn safe_mode_diagnostics(&mut self) {
        let plan = match self.collector_guard().await {
            Ok(mut collector) => collector.start_run(),
            Err(e) => {
                warn!("fdir: safe mode diagnostics skipped: {:?}", e);
                return;
            }
        };
        plan.run(self.can, self.store, self.errors, self.downlink, Region::Diagnostics)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses_are_negative_and_distinct() {
        let errors = [
            FdirError::Transport(TransportError::Timeout),
            FdirError::Isp(IspError::NoSync),
            FdirError::Task(TaskError::Refused),
            FdirError::Lock(LockError::Timeout { holder: None }),
            FdirError::CollectorBusy,
            FdirError::ReadOnly,
            FdirError::InvalidArgument,
            FdirError::NotPermitted,
        ];
        for (i, a) in errors.iter().enumerate() {
            assert!(a.code() < 0);
            for b in &errors[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
        let storage = StorageError::InvalidSize;
        assert_eq!(FdirError::Storage(storage).code(), storage.code());
    }
}
