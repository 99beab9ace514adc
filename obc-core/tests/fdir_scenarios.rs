//! End-to-end FDIR scenarios against the simulated board.

use core::cell::RefCell;
use core::future::Future;
use core::marker::PhantomData;

use embassy_futures::block_on;
use embassy_futures::join::join;
use embassy_futures::select::{Either3, select3};
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Instant, Timer};

use obc_core::board::{Board, Hardware, SsmLink, TaskControl, TaskError};
use obc_core::can::{CanTransport, Controller, Controllers, SmallType};
use obc_core::checksum::fletcher64;
use obc_core::config::FdirConfig;
use obc_core::diagnostics::{DiagnosticsCollector, ParamRef, ReportDefinition, SharedCollector};
use obc_core::downlink::{DownlinkQueue, EventKind, EventReport, Report};
use obc_core::error_channel::{ErrorChannel, FaultRecord, Severity};
use obc_core::fdir::ground::{GroundCommand, GroundQueue, ObcVariable, VariableRef};
use obc_core::fdir::{
    ErrorCode, FdirEngine, FdirLinks, FdirState, Outcome, REASON_GROUND, TIME_RECORD_LEN,
};
use obc_core::ids::{Subsystem, TaskId};
use obc_core::mode::ModeCell;
use obc_core::router::RouterFifos;
use obc_core::sim::{
    SimAvr, SimBoard, SimCanBus, SimController, SimFlash, SimResetPin, SimTasks, SimWatchdog,
    SsmBehaviour, TaskCall,
};
use obc_core::spimem::{CURSOR_LEN, LogStore, MemorySpace, PAGE_SIZE, Region, ssm_image_base};
use obc_core::sync::{TrackedGuard, TrackedMutex};

const IMAGE_LEN: usize = 256;

struct Rig {
    bus: SimCanBus,
    avrs: [SimAvr; Subsystem::COUNT],
    chips: [SimFlash; 3],
    tasks: SimTasks,
    watchdog: SimWatchdog,
    can: CanTransport<SimController>,
    store: TrackedMutex<LogStore<SimFlash>>,
    errors: ErrorChannel,
    mode: ModeCell,
    downlink: DownlinkQueue,
    ground: GroundQueue,
    fifos: RouterFifos,
    collector: SharedCollector,
    cfg: FdirConfig,
}

fn image(subsystem: Subsystem) -> Vec<u8> {
    (0..IMAGE_LEN).map(|i| (i as u8).wrapping_add(subsystem as u8 * 31)).collect()
}

impl Rig {
    fn new() -> Self {
        Self::with_config(FdirConfig::default())
    }

    fn with_config(cfg: FdirConfig) -> Self {
        let bus = SimCanBus::new();
        let avrs = [SimAvr::new(), SimAvr::new(), SimAvr::new()];
        for sub in Subsystem::ALL {
            bus.attach_target(sub, avrs[sub.index()].clone());
        }

        let chips = [SimFlash::new(), SimFlash::new(), SimFlash::new()];
        for chip in &chips {
            for sub in Subsystem::ALL {
                chip.load(ssm_image_base(sub), &(IMAGE_LEN as u32).to_le_bytes());
                chip.load(ssm_image_base(sub) + 4, &image(sub));
            }
        }
        let mut store = LogStore::new(chips.clone());
        store.init().unwrap();

        Self {
            can: CanTransport::new(
                bus.controller(Controller::Primary),
                bus.controller(Controller::Secondary),
                cfg.lock_timeout,
            ),
            bus,
            avrs,
            chips,
            tasks: SimTasks::new(),
            watchdog: SimWatchdog::new(),
            store: TrackedMutex::new(store),
            errors: ErrorChannel::new(Duration::from_secs(2)),
            mode: ModeCell::new(),
            downlink: Channel::new(),
            ground: Channel::new(),
            fifos: RouterFifos::new(),
            collector: Mutex::new(DiagnosticsCollector::new(TaskId::Housekeeping, &cfg)),
            cfg,
        }
    }

    fn links<B: Board<Can = SimController, Flash = SimFlash>>(&self) -> FdirLinks<'_, B> {
        FdirLinks {
            errors: &self.errors,
            can: &self.can,
            store: &self.store,
            mode: &self.mode,
            downlink: &self.downlink,
            ground: &self.ground,
            fifos: &self.fifos,
            collector: &self.collector,
        }
    }

    fn hardware<B: Board<Isp = SimAvr, Reset = SimResetPin, Watchdog = SimWatchdog>>(
        &self,
        tasks: B::Tasks,
    ) -> Hardware<B> {
        Hardware {
            tasks,
            watchdog: self.watchdog.clone(),
            ssm: Subsystem::ALL.map(|sub| SsmLink {
                isp: self.avrs[sub.index()].clone(),
                reset: self.avrs[sub.index()].reset_pin(),
            }),
        }
    }

    fn engine(&self) -> FdirEngine<'_, SimBoard> {
        FdirEngine::new(self.links(), self.hardware(self.tasks.clone()), self.cfg)
    }

    /// Run `body` with the CAN classifier and interrupt source alive.
    fn run<T>(&self, body: impl Future<Output = T>) -> T {
        block_on(async {
            self.can.init(TaskId::Fdir).await.unwrap();
            match select3(self.can.run(), self.bus.pump(self.can.isr()), body).await {
                Either3::First(never) => never,
                Either3::Second(never) => never,
                Either3::Third(out) => out,
            }
        })
    }

    fn report(&self, record: FaultRecord) {
        self.errors.report_low(record).unwrap();
    }

    fn drain(&self) -> Vec<Report> {
        let mut reports = Vec::new();
        while let Ok(report) = self.downlink.try_receive() {
            reports.push(report);
        }
        reports
    }
}

fn events(reports: &[Report]) -> Vec<EventReport> {
    reports
        .iter()
        .filter_map(|r| match r {
            Report::Event(e) => Some(*e),
            _ => None,
        })
        .collect()
}

fn kinds(reports: &[Report]) -> Vec<EventKind> {
    events(reports).iter().map(|e| e.kind).collect()
}

fn acks(reports: &[Report]) -> Vec<(u8, i8)> {
    reports
        .iter()
        .filter_map(|r| match r {
            Report::CommandAck { opcode, status } => Some((*opcode, *status)),
            _ => None,
        })
        .collect()
}

fn param_failed(sub: Subsystem, param: u8) -> FaultRecord {
    FaultRecord::low(sub.task(), ErrorCode::SsmParamFailed, sub as u8).with_payload(&[param])
}

fn command_failed(sub: Subsystem, small_type: SmallType, param: u8, value: u32) -> FaultRecord {
    let mut payload = vec![small_type as u8, param];
    payload.extend_from_slice(&value.to_le_bytes());
    FaultRecord::low(sub.task(), ErrorCode::SsmCommandFailed, sub as u8).with_payload(&payload)
}

/// Mirrored test data outside every log region.
const WASH_ADDR: u32 = 0xC_4000;

fn mirror(rig: &Rig, bytes: &[u8]) {
    for chip in &rig.chips {
        chip.load(WASH_ADDR, bytes);
    }
}

fn wash_unresolved(page: u32) -> FaultRecord {
    let record = FaultRecord::low(TaskId::Memory, ErrorCode::SpimemWashUnresolved, 0);
    record.with_payload(&page.to_le_bytes())
}

fn checksum_mismatch(base: u32, len: u32, expected: u64) -> FaultRecord {
    let mut payload = Vec::new();
    payload.extend_from_slice(&base.to_le_bytes());
    payload.extend_from_slice(&len.to_le_bytes());
    payload.extend_from_slice(&expected.to_le_bytes());
    FaultRecord::low(TaskId::Memory, ErrorCode::ChecksumMismatch, 0).with_payload(&payload)
}

#[test]
fn silent_eps_escalates_once_into_safe_mode() {
    let rig = Rig::new();
    rig.bus.set_behaviour(Subsystem::Eps, SsmBehaviour::Silent);
    // keep the safe-mode collection runs off the EPS
    let coms_only = ReportDefinition::from_params(&[ParamRef::new(Subsystem::Coms, 0)]).unwrap();
    rig.collector.try_lock().unwrap().set_alternate(coms_only);
    let mut engine = rig.engine();

    rig.report(param_failed(Subsystem::Eps, 3));
    let summary = rig.run(engine.step());
    assert_eq!(summary.handled[0].outcome, Outcome::SafeMode);
    assert_eq!(engine.state(), FdirState::SafeMode);
    assert!(rig.mode.snapshot().is_safe());

    // three retries, then one check after the reset and one after reprogramming
    assert_eq!(rig.bus.sent_to(Subsystem::Eps, SmallType::ReqData), 5);
    let eps = &rig.avrs[Subsystem::Eps.index()];
    assert_eq!(eps.images_programmed(), 1);
    assert_eq!(eps.flash(0, IMAGE_LEN), image(Subsystem::Eps));

    let reports = rig.drain();
    assert_eq!(
        kinds(&reports),
        [EventKind::SsmReset, EventKind::SsmReprogrammed, EventKind::SafeModeEntered]
    );
    let entered = events(&reports)[2];
    assert_eq!(entered.reason, ErrorCode::SsmParamFailed as u8);
    assert_eq!(entered.detail, Subsystem::Eps as u32);

    for task in TaskId::ALL {
        let suspended = rig.tasks.count(TaskCall::Suspend(task));
        assert_eq!(suspended, usize::from(!task.survives_safe_mode()), "{task:?}");
    }

    // further faults do not enter safe mode a second time
    rig.report(param_failed(Subsystem::Eps, 3));
    let summary = rig.run(engine.step());
    assert_eq!(summary.handled[0].outcome, Outcome::SafeMode);
    assert!(!kinds(&rig.drain()).contains(&EventKind::SafeModeEntered));
    assert_eq!(eps.images_programmed(), 1);
}

#[test]
fn reset_revives_a_hung_subsystem() {
    let rig = Rig::new();
    rig.bus.set_behaviour(Subsystem::Coms, SsmBehaviour::SilentUntilReset);
    let mut engine = rig.engine();

    rig.report(FaultRecord::low(TaskId::Coms, ErrorCode::HkRequestFailed, Subsystem::Coms as u8));
    let summary = rig.run(engine.step());
    assert_eq!(summary.handled[0].outcome, Outcome::Recovered);
    assert_eq!(engine.state(), FdirState::Normal);
    assert_eq!(kinds(&rig.drain()), [EventKind::SsmReset]);
    assert_eq!(rig.avrs[Subsystem::Coms.index()].images_programmed(), 0);
}

#[test]
fn reprogramming_revives_a_corrupted_subsystem() {
    let rig = Rig::new();
    rig.bus.set_behaviour(Subsystem::Payload, SsmBehaviour::SilentUntilReprogram);
    let mut engine = rig.engine();

    rig.report(param_failed(Subsystem::Payload, 0));
    let summary = rig.run(engine.step());
    assert_eq!(summary.handled[0].outcome, Outcome::Recovered);
    assert!(!rig.mode.snapshot().is_safe());
    assert_eq!(kinds(&rig.drain()), [EventKind::SsmReset, EventKind::SsmReprogrammed]);
    assert_eq!(rig.avrs[Subsystem::Payload.index()].images_programmed(), 1);
}

#[test]
fn ssm_retries_wait_longer_each_attempt() {
    let cfg = FdirConfig {
        ssm_timeout_base: Duration::from_millis(10),
        ssm_timeout_step: Duration::from_millis(40),
        ..FdirConfig::default()
    };
    let rig = Rig::with_config(cfg);
    rig.bus.set_behaviour(Subsystem::Eps, SsmBehaviour::SilentUntilReset);
    let mut engine = rig.engine();

    rig.report(FaultRecord::low(TaskId::Eps, ErrorCode::HkRequestFailed, Subsystem::Eps as u8));
    let started = Instant::now();
    let summary = rig.run(engine.step());
    assert_eq!(summary.handled[0].outcome, Outcome::Recovered);

    let reset = events(&rig.drain())[0];
    assert_eq!(reset.kind, EventKind::SsmReset);
    // 10 + 50 + 90 ms of retries and the reset pulse; a fixed timeout would give 30 or 270
    let waited = reset.timestamp_ms - started.as_millis();
    assert!((150..240).contains(&waited), "reset after {waited} ms");
}

#[test]
fn failed_command_is_retried_as_the_check() {
    let rig = Rig::new();
    let mut engine = rig.engine();

    rig.report(command_failed(Subsystem::Eps, SmallType::SetVariable, 5, 77));
    let summary = rig.run(engine.step());
    assert_eq!(summary.handled[0].outcome, Outcome::Resolved);
    assert_eq!(rig.bus.sent_to(Subsystem::Eps, SmallType::SetVariable), 1);
    assert_eq!(rig.bus.variable(Subsystem::Eps, 5), 77);
    assert!(rig.drain().is_empty());
}

#[test]
fn command_refused_after_reprogramming_enters_safe_mode() {
    let rig = Rig::new();
    rig.bus.set_behaviour(Subsystem::Coms, SsmBehaviour::Nack);
    let mut engine = rig.engine();

    rig.report(command_failed(Subsystem::Coms, SmallType::SetVariable, 1, 3));
    let summary = rig.run(engine.step());
    assert_eq!(summary.handled[0].outcome, Outcome::SafeMode);
    assert_eq!(rig.bus.sent_to(Subsystem::Coms, SmallType::SetVariable), 5);
    assert_eq!(rig.avrs[Subsystem::Coms.index()].images_programmed(), 1);

    let reports = rig.drain();
    assert_eq!(
        kinds(&reports),
        [EventKind::SsmReset, EventKind::SsmReprogrammed, EventKind::SafeModeEntered]
    );
    assert_eq!(events(&reports)[2].reason, ErrorCode::SsmCommandFailed as u8);
}

#[test]
fn malformed_command_fault_falls_back_to_housekeeping() {
    let rig = Rig::new();
    let mut engine = rig.engine();

    let aux = Subsystem::Payload as u8;
    let record = FaultRecord::low(TaskId::Payload, ErrorCode::SsmCommandFailed, aux);
    rig.report(record.with_payload(&[0xFF]));
    let summary = rig.run(engine.step());
    assert_eq!(summary.handled[0].outcome, Outcome::Resolved);
    // housekeeping goes out as a remote frame, never as a logical command
    assert!(rig.bus.sent().is_empty());
}

#[test]
fn healthy_subsystem_faults_change_nothing() {
    let rig = Rig::new();
    let mut engine = rig.engine();

    for _ in 0..3 {
        rig.report(param_failed(Subsystem::Eps, 2));
        let summary = rig.run(engine.step());
        assert_eq!(summary.handled[0].outcome, Outcome::Resolved);
    }
    assert_eq!(rig.bus.sent_to(Subsystem::Eps, SmallType::ReqData), 3);
    assert!(rig.drain().is_empty());
    assert!(rig.tasks.calls().is_empty());
    assert_eq!(rig.mode.snapshot().flags().bits(), 0);
    assert_eq!(rig.avrs[Subsystem::Eps.index()].reset_pulses(), 0);
    assert!(rig.watchdog.feeds() >= 6);
}

#[test]
fn fifo_failures_restart_then_enter_safe_mode() {
    let rig = Rig::new();
    let mut engine = rig.engine();
    let fault = || FaultRecord::low(TaskId::Payload, ErrorCode::RouterToTaskFifoWrite, 0);

    let mut outcomes = Vec::new();
    for _ in 0..10 {
        rig.report(fault());
        outcomes.push(rig.run(engine.step()).handled[0].outcome);
    }
    assert_eq!(outcomes[..9], [Outcome::Recovered; 9]);
    assert_eq!(outcomes[9], Outcome::SafeMode);
    assert_eq!(rig.tasks.count(TaskCall::Restart(TaskId::Payload)), 1);

    let entered = events(&rig.drain())
        .into_iter()
        .filter(|e| e.kind == EventKind::SafeModeEntered)
        .collect::<Vec<_>>();
    assert_eq!(entered.len(), 1);
    assert_eq!(entered[0].reason, ErrorCode::RouterToTaskFifoWrite as u8);
}

#[test]
fn failing_chip_is_retired_after_threshold() {
    let rig = Rig::new();
    rig.chips[1].set_offline(true);
    let mut engine = rig.engine();

    for i in 0..10 {
        rig.report(FaultRecord::low(TaskId::Memory, ErrorCode::SpimemWriteFailed, 1));
        let outcome = rig.run(engine.step()).handled[0].outcome;
        let expected = if i < 9 { Outcome::Counted } else { Outcome::Recovered };
        assert_eq!(outcome, expected, "report {i}");
    }
    let store = rig.store.try_lock(TaskId::Fdir).unwrap();
    assert_eq!(store.healthy_chips(), [true, false, true]);
    assert!(!store.is_fallback());
    drop(store);

    let retired = events(&rig.drain());
    assert_eq!(retired.len(), 1);
    assert_eq!((retired[0].kind, retired[0].detail), (EventKind::ChipRetired, 1));

    // a retired chip is not tested again
    rig.report(FaultRecord::low(TaskId::Memory, ErrorCode::SpimemWriteFailed, 1));
    assert_eq!(rig.run(engine.step()).handled[0].outcome, Outcome::Resolved);
}

#[test]
fn passing_self_test_clears_the_count() {
    let rig = Rig::new();
    let mut engine = rig.engine();
    rig.report(FaultRecord::low(TaskId::Memory, ErrorCode::SpimemReadFailed, 0));
    assert_eq!(rig.run(engine.step()).handled[0].outcome, Outcome::Resolved);
    assert!(rig.store.try_lock(TaskId::Fdir).unwrap().is_healthy(0));
}

#[test]
fn losing_every_chip_falls_back_until_ground_restores_them() {
    let cfg = FdirConfig {
        spi_chip_threshold: 1,
        ..FdirConfig::default()
    };
    let rig = Rig::with_config(cfg);
    for chip in &rig.chips {
        chip.set_offline(true);
    }
    let mut engine = rig.engine();

    for chip in 0..3u8 {
        rig.report(FaultRecord::low(TaskId::Memory, ErrorCode::SpimemSelfTestFailed, chip));
        rig.run(engine.step());
    }
    assert!(rig.mode.snapshot().is_memory_fallback());
    assert!(rig.store.try_lock(TaskId::Fdir).unwrap().is_fallback());
    assert!(kinds(&rig.drain()).contains(&EventKind::MemoryFallbackEntered));

    // still dead: the command is refused and nothing changes
    rig.ground.try_send(GroundCommand::ExitMemoryFallback).unwrap();
    rig.run(engine.step());
    assert_eq!(acks(&rig.drain()), [(0x07, -7)]);
    assert!(rig.mode.snapshot().is_memory_fallback());

    for chip in &rig.chips {
        chip.set_offline(false);
    }
    rig.ground.try_send(GroundCommand::ExitMemoryFallback).unwrap();
    rig.run(engine.step());
    let reports = rig.drain();
    assert_eq!(acks(&reports), [(0x07, 0)]);
    assert!(kinds(&reports).contains(&EventKind::MemoryFallbackExited));
    assert!(!rig.mode.snapshot().is_memory_fallback());
    let store = rig.store.try_lock(TaskId::Fdir).unwrap();
    assert!(!store.is_fallback());
    assert_eq!(store.healthy_count(), 3);
}

#[test]
fn stalled_task_is_restarted_until_the_threshold() {
    let rig = Rig::new();
    let mut engine = rig.engine();
    let stall = || FaultRecord::low(TaskId::Watchdog, ErrorCode::TaskStalled, TaskId::Time as u8);

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        rig.report(stall());
        outcomes.push(rig.run(engine.step()).handled[0].outcome);
    }
    assert_eq!(outcomes, [Outcome::Recovered, Outcome::Recovered, Outcome::SafeMode]);
    assert_eq!(rig.tasks.count(TaskCall::Restart(TaskId::Time)), 2);
}

#[test]
fn unknown_codes_are_handled_fail_safe() {
    let rig = Rig::new();
    let mut engine = rig.engine();
    rig.report(FaultRecord::raw(Severity::Low, TaskId::Scheduling, 0xEE, 0));
    let summary = rig.run(engine.step());
    assert_eq!(summary.handled[0].outcome, Outcome::SafeMode);
    assert_eq!(events(&rig.drain())[0].reason, 0xEE);
}

#[test]
fn high_reports_block_until_resolved() {
    let rig = Rig::new();
    let mut engine = rig.engine();
    let record = FaultRecord::high(TaskId::Eps, ErrorCode::HkRequestFailed, Subsystem::Eps as u8);

    let (reported, summary) = rig.run(join(rig.errors.report_high(record), engine.step()));
    assert_eq!(reported, Ok(()));
    assert_eq!(summary.handled[0].outcome, Outcome::Resolved);
    assert!(!rig.errors.is_awaiting(TaskId::Eps));
}

#[test]
fn battery_low_sheds_payload() {
    let rig = Rig::new();
    let mut engine = rig.engine();
    rig.report(FaultRecord::low(TaskId::Eps, ErrorCode::BatteryLow, 0));
    rig.run(engine.step());

    let mode = rig.mode.snapshot();
    assert!(mode.is_low_power());
    assert!(mode.is_paused(Subsystem::Payload));
    assert!(rig.bus.is_low_power(Subsystem::Eps));
    assert!(rig.bus.is_paused(Subsystem::Payload));
    assert_eq!(rig.tasks.count(TaskCall::Suspend(TaskId::Payload)), 1);
}

#[test]
fn subsystem_fault_frames_reach_the_engine() {
    let rig = Rig::new();
    let mut engine = rig.engine();
    let summary = rig.run(async {
        rig.bus.inject_fault(Subsystem::Coms, ErrorCode::ComsLinkLost as u8, 0);
        Timer::after_millis(5).await;
        engine.step().await
    });
    assert_eq!(summary.handled[0].task, TaskId::Coms);
    assert!(rig.mode.snapshot().is_coms_takeover());
    assert_eq!(rig.bus.sent_to(Subsystem::Coms, SmallType::ComsTakeover), 1);
}

#[test]
fn ground_commands_are_acknowledged() {
    let rig = Rig::new();
    let mut engine = rig.engine();

    let commands = [
        GroundCommand::PauseSubsystem { subsystem: Subsystem::Payload },
        GroundCommand::ReadVariable {
            variable: VariableRef::Subsystem(Subsystem::Eps, 4),
        },
        GroundCommand::WriteVariable {
            variable: VariableRef::Obc(ObcVariable::DiagnosticsInterval),
            value: 0,
        },
        GroundCommand::WriteVariable {
            variable: VariableRef::Obc(ObcVariable::MissionMinutes),
            value: 9,
        },
    ];
    for cmd in commands {
        rig.ground.try_send(cmd).unwrap();
    }
    let summary = rig.run(engine.step());
    assert_eq!(summary.commands, 4);
    assert!(rig.ground.is_empty());

    let reports = rig.drain();
    assert_eq!(acks(&reports), [(0x08, 0), (0x0E, 0), (0x0F, -16), (0x0F, -15)]);
    assert!(reports.contains(&Report::Variable {
        variable: VariableRef::Subsystem(Subsystem::Eps, 4),
        value: 1004,
    }));
    assert!(rig.bus.is_paused(Subsystem::Payload));
    assert!(rig.mode.snapshot().is_paused(Subsystem::Payload));
}

#[test]
fn fdir_refuses_to_restart_itself() {
    let rig = Rig::new();
    let mut engine = rig.engine();
    rig.ground.try_send(GroundCommand::RestartTask { task: TaskId::Fdir }).unwrap();
    rig.ground.try_send(GroundCommand::DeleteTask { task: TaskId::Watchdog }).unwrap();
    rig.ground.try_send(GroundCommand::DeleteTask { task: TaskId::Scheduling }).unwrap();
    rig.run(engine.step());

    assert_eq!(acks(&rig.drain()), [(0x0C, -17), (0x0D, -17), (0x0D, 0)]);
    assert_eq!(rig.tasks.calls(), [TaskCall::Delete(TaskId::Scheduling)]);
}

#[test]
fn memory_load_dump_and_checksum() {
    let rig = Rig::new();
    let mut engine = rig.engine();
    let data: heapless::Vec<u8, 128> = (0..100u8).collect();
    let address = 0x6_1000;

    rig.ground
        .try_send(GroundCommand::MemoryLoad {
            space: MemorySpace::Spi,
            address,
            data: data.clone(),
        })
        .unwrap();
    rig.ground
        .try_send(GroundCommand::MemoryChecksum {
            space: MemorySpace::Spi,
            address,
            len: 100,
        })
        .unwrap();
    rig.ground
        .try_send(GroundCommand::MemoryDump {
            space: MemorySpace::Spi,
            address,
            len: 100,
        })
        .unwrap();
    rig.run(engine.step());

    let reports = rig.drain();
    assert_eq!(acks(&reports), [(0x10, 0), (0x12, 0), (0x11, 0)]);
    assert!(reports.contains(&Report::Checksum {
        space: MemorySpace::Spi,
        address,
        len: 100,
        value: fletcher64(&data),
    }));
    assert!(reports.contains(&Report::MemoryDump {
        space: MemorySpace::Spi,
        address,
        data: data.iter().copied().collect(),
    }));
    for chip in &rig.chips {
        assert_eq!(chip.peek(address, 100), &data[..]);
    }
}

#[test]
fn ground_safe_mode_round_trip_keeps_paused_subsystems_suspended() {
    let rig = Rig::new();
    let mut engine = rig.engine();

    rig.ground.try_send(GroundCommand::PauseSubsystem { subsystem: Subsystem::Eps }).unwrap();
    rig.ground.try_send(GroundCommand::EnterSafeMode).unwrap();
    rig.run(engine.step());
    assert!(rig.mode.snapshot().is_safe());

    rig.ground.try_send(GroundCommand::ExitSafeMode).unwrap();
    rig.run(engine.step());
    assert!(!rig.mode.snapshot().is_safe());
    assert_eq!(engine.state(), FdirState::Normal);

    let reports = rig.drain();
    let entered = events(&reports)
        .into_iter()
        .find(|e| e.kind == EventKind::SafeModeEntered)
        .unwrap();
    assert_eq!(entered.reason, REASON_GROUND);
    assert!(kinds(&reports).contains(&EventKind::SafeModeExited));

    assert_eq!(rig.tasks.count(TaskCall::Resume(TaskId::Eps)), 0);
    assert_eq!(rig.tasks.count(TaskCall::Resume(TaskId::Payload)), 1);
    assert_eq!(rig.tasks.count(TaskCall::Resume(TaskId::Watchdog)), 0);
}

/// Scheduler whose restart drops the lock guard the restarted task held.
struct HookTasks<'h, 'g, T> {
    inner: SimTasks,
    held: &'h RefCell<Option<TrackedGuard<'g, T>>>,
}

impl<T> TaskControl for HookTasks<'_, '_, T> {
    fn restart(&mut self, task: TaskId) -> Result<(), TaskError> {
        let mut held = self.held.borrow_mut();
        if held.as_ref().is_some_and(|g| g.task() == task) {
            *held = None;
        }
        self.inner.restart(task)
    }

    fn suspend(&mut self, task: TaskId) -> Result<(), TaskError> {
        self.inner.suspend(task)
    }

    fn resume(&mut self, task: TaskId) -> Result<(), TaskError> {
        self.inner.resume(task)
    }

    fn delete(&mut self, task: TaskId) -> Result<(), TaskError> {
        self.inner.delete(task)
    }
}

struct LockBoard<'h, 'g, T>(PhantomData<(&'h (), &'g (), T)>);

impl<'h, 'g: 'h, T: 'g> Board for LockBoard<'h, 'g, T> {
    type Can = SimController;
    type Flash = SimFlash;
    type Isp = SimAvr;
    type Reset = SimResetPin;
    type Tasks = HookTasks<'h, 'g, T>;
    type Watchdog = SimWatchdog;
}

#[test]
fn wedged_store_lock_is_recovered_by_restarting_its_holder() {
    let rig = Rig::new();
    let held = RefCell::new(Some(rig.store.try_lock(TaskId::Memory).unwrap()));
    let tasks = HookTasks {
        inner: rig.tasks.clone(),
        held: &held,
    };
    let mut engine: FdirEngine<'_, LockBoard<'_, '_, LogStore<SimFlash>>> =
        FdirEngine::new(rig.links(), rig.hardware(tasks), rig.cfg);

    rig.report(FaultRecord::low(TaskId::Housekeeping, ErrorCode::SpimemMutexWedged, 0));
    let summary = rig.run(engine.step());
    assert_eq!(summary.handled[0].outcome, Outcome::Recovered);
    assert!(held.borrow().is_none());
    assert_eq!(rig.store.holder(), None);
    assert_eq!(rig.store.recoveries(), 1);
    assert_eq!(rig.tasks.count(TaskCall::Restart(TaskId::Memory)), 1);
    assert_eq!(
        kinds(&rig.drain()),
        [EventKind::TaskRestarted, EventKind::LockRecovered]
    );
}

#[test]
fn lock_that_stays_wedged_ends_in_safe_mode() {
    let rig = Rig::new();
    let _stuck = rig.store.try_lock(TaskId::Scheduling).unwrap();
    let mut engine = rig.engine();

    rig.report(FaultRecord::low(TaskId::Housekeeping, ErrorCode::SpimemMutexWedged, 0));
    let summary = rig.run(engine.step());
    assert_eq!(summary.handled[0].outcome, Outcome::SafeMode);
    assert_eq!(rig.tasks.count(TaskCall::Restart(TaskId::Scheduling)), 1);
}

#[test]
fn wedged_can_lock_is_recovered_by_restarting_its_holder() {
    let rig = Rig::new();
    let held = RefCell::new(None);
    let tasks = HookTasks {
        inner: rig.tasks.clone(),
        held: &held,
    };
    let mut engine: FdirEngine<'_, LockBoard<'_, '_, Controllers<SimController>>> =
        FdirEngine::new(rig.links(), rig.hardware(tasks), rig.cfg);

    rig.report(FaultRecord::low(TaskId::Payload, ErrorCode::CanMutexWedged, 0));
    let summary = rig.run(async {
        *held.borrow_mut() = Some(rig.can.lock().try_lock(TaskId::Coms).unwrap());
        engine.step().await
    });
    assert_eq!(summary.handled[0].outcome, Outcome::Recovered);
    assert!(held.borrow().is_none());
    assert_eq!(rig.can.lock().holder(), None);
    assert_eq!(rig.can.lock().recoveries(), 1);
    assert_eq!(rig.tasks.count(TaskCall::Restart(TaskId::Coms)), 1);

    let reports = rig.drain();
    assert_eq!(kinds(&reports), [EventKind::TaskRestarted, EventKind::LockRecovered]);
    assert_eq!(events(&reports)[1].reason, ErrorCode::CanMutexWedged as u8);

    // the bus works again
    let timeout = rig.cfg.param_timeout;
    let request = rig.can.request_sensor_data(TaskId::Fdir, Subsystem::Eps, 2, timeout);
    let value = rig.run(request);
    assert_eq!(value, Ok(1002));
}

#[test]
fn rewash_repairs_an_outvoted_copy() {
    let rig = Rig::new();
    let data = [0x5A; 64];
    mirror(&rig, &data);
    rig.chips[1].corrupt(WASH_ADDR + 10, 0xA5);
    let mut engine = rig.engine();

    rig.report(wash_unresolved(WASH_ADDR / PAGE_SIZE as u32));
    assert_eq!(rig.run(engine.step()).handled[0].outcome, Outcome::Recovered);
    assert_eq!(rig.chips[1].peek(WASH_ADDR, data.len()), data);
    assert!(rig.drain().is_empty());
}

#[test]
fn page_without_a_majority_counts_against_the_primary_chip() {
    let cfg = FdirConfig {
        spi_chip_threshold: 2,
        ..FdirConfig::default()
    };
    let rig = Rig::with_config(cfg);
    mirror(&rig, &[0x5A; 64]);
    for (chip, value) in rig.chips.iter().zip([1, 2, 3]) {
        chip.corrupt(WASH_ADDR + 7, value);
    }
    let mut engine = rig.engine();
    let page = WASH_ADDR / PAGE_SIZE as u32;

    rig.report(wash_unresolved(page));
    assert_eq!(rig.run(engine.step()).handled[0].outcome, Outcome::Counted);
    rig.report(wash_unresolved(page));
    assert_eq!(rig.run(engine.step()).handled[0].outcome, Outcome::Recovered);

    assert_eq!(rig.store.try_lock(TaskId::Fdir).unwrap().healthy_chips(), [false, true, true]);
    let retired = events(&rig.drain());
    assert_eq!(retired.len(), 1);
    assert_eq!(
        (retired[0].kind, retired[0].reason, retired[0].detail),
        (EventKind::ChipRetired, ErrorCode::SpimemWashUnresolved as u8, 0)
    );
}

#[test]
fn checksum_mismatch_is_washed_and_verified() {
    let rig = Rig::new();
    let data: Vec<u8> = (0..200u8).collect();
    mirror(&rig, &data);
    // reads are served from chip 0
    rig.chips[0].corrupt(WASH_ADDR + 150, 0);
    let mut engine = rig.engine();

    rig.report(checksum_mismatch(WASH_ADDR, data.len() as u32, fletcher64(&data)));
    assert_eq!(rig.run(engine.step()).handled[0].outcome, Outcome::Recovered);
    assert_eq!(rig.chips[0].peek(WASH_ADDR, data.len()), data);

    // a sum the data never had stays wrong after the wash
    rig.report(checksum_mismatch(WASH_ADDR, data.len() as u32, fletcher64(&data) ^ 1));
    assert_eq!(rig.run(engine.step()).handled[0].outcome, Outcome::Counted);
    assert!(rig.drain().is_empty());
}

#[test]
fn safe_mode_logs_each_mission_minute() {
    let cfg = FdirConfig {
        minute: Duration::from_millis(30),
        ..FdirConfig::default()
    };
    let rig = Rig::with_config(cfg);
    let mut engine = rig.engine();
    let time_cursor = || rig.store.try_lock(TaskId::Fdir).unwrap().cursor(Region::Time).unwrap();

    rig.run(async {
        // outside safe mode the time task keeps the log
        Timer::after(cfg.minute).await;
        engine.step().await;
        assert_eq!(time_cursor(), CURSOR_LEN);

        rig.ground.try_send(GroundCommand::EnterSafeMode).unwrap();
        engine.step().await;
        let before = time_cursor();
        Timer::after(cfg.minute).await;
        engine.step().await;
        assert_eq!(time_cursor(), before + TIME_RECORD_LEN as u32);
    });

    rig.drain();
    rig.ground
        .try_send(GroundCommand::ReadVariable {
            variable: VariableRef::Obc(ObcVariable::MissionMinutes),
        })
        .unwrap();
    rig.run(engine.step());
    let minutes = rig.drain().into_iter().find_map(|r| match r {
        Report::Variable { value, .. } => Some(value),
        _ => None,
    });
    assert!(minutes >= Some(2), "{minutes:?}");
}

#[test]
fn environment_faults_switch_modes_once() {
    let rig = Rig::new();
    let mut engine = rig.engine();

    rig.report(FaultRecord::low(TaskId::Eps, ErrorCode::BatteryLow, 0));
    assert_eq!(rig.run(engine.step()).handled[0].outcome, Outcome::Recovered);
    assert_eq!(kinds(&rig.drain()), [EventKind::LowPowerEntered, EventKind::SubsystemPaused]);

    rig.report(FaultRecord::low(TaskId::Coms, ErrorCode::ComsLinkLost, 0));
    assert_eq!(rig.run(engine.step()).handled[0].outcome, Outcome::Recovered);
    assert_eq!(kinds(&rig.drain()), [EventKind::ComsTakeoverEntered]);

    rig.report(FaultRecord::low(TaskId::Eps, ErrorCode::BatteryLow, 0));
    assert_eq!(rig.run(engine.step()).handled[0].outcome, Outcome::Recovered);
    assert!(rig.drain().is_empty());
    assert_eq!(rig.bus.sent_to(Subsystem::Eps, SmallType::EnterLowPower), 1);
}

#[test]
fn unrecoverable_codes_go_straight_to_safe_mode() {
    let cases = [
        (ErrorCode::SsmReprogramFailed, Subsystem::Payload as u8, Subsystem::Payload as u32),
        (ErrorCode::InternalConsistency, 0, TaskId::Scheduling as u32),
    ];
    for (code, aux, detail) in cases {
        let rig = Rig::new();
        let mut engine = rig.engine();
        rig.report(FaultRecord::low(TaskId::Scheduling, code, aux));
        assert_eq!(rig.run(engine.step()).handled[0].outcome, Outcome::SafeMode, "{code:?}");

        let reports = rig.drain();
        assert_eq!(kinds(&reports), [EventKind::SafeModeEntered], "{code:?}");
        let entered = events(&reports)[0];
        assert_eq!((entered.reason, entered.detail), (code as u8, detail));
        assert!(rig.tasks.calls().iter().all(|c| matches!(c, TaskCall::Suspend(_))));
    }
}
