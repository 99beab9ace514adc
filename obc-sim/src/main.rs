//! Host simulation of the OBC: the flight core wired to simulated hardware,
//! driven through a short fault scenario.

use embassy_futures::block_on;
use embassy_futures::select::{select, select4};
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Timer};
use log::{error, info, warn};
use static_cell::StaticCell;

use obc_core::board::{Hardware, SsmLink};
use obc_core::can::{CanTransport, Controller};
use obc_core::config::FdirConfig;
use obc_core::diagnostics::{self, DiagnosticsCollector, SharedCollector};
use obc_core::downlink::{self, DownlinkQueue, DownlinkSender};
use obc_core::error_channel::{ErrorChannel, FaultRecord};
use obc_core::fdir::ground::{GroundCommand, GroundQueue, ObcVariable, VariableRef};
use obc_core::fdir::{ErrorCode, FdirEngine, FdirLinks};
use obc_core::ids::{Subsystem, TaskId};
use obc_core::mode::ModeCell;
use obc_core::router::RouterFifos;
use obc_core::sim::{
    SimAvr, SimBoard, SimCanBus, SimController, SimFlash, SimRadio, SimTasks, SimWatchdog,
    SsmBehaviour,
};
use obc_core::spimem::{LogStore, ssm_image_base};
use obc_core::sync::TrackedMutex;

// General setup stuff
const STARTUP_DELAY: Duration = Duration::from_millis(500);
const OPENLST_HWID: u16 = 0x2DEC;
const SSM_IMAGE_LEN: usize = 2048;

// Shared state
static ERRORS: ErrorChannel = ErrorChannel::new(obc_core::config::RESOLUTION_TIMEOUT);
static MODE: ModeCell = ModeCell::new();
static DOWNLINK: DownlinkQueue = Channel::new();
static GROUND: GroundQueue = Channel::new();
static FIFOS: RouterFifos = RouterFifos::new();

static CAN: StaticCell<CanTransport<SimController>> = StaticCell::new();
static STORE: StaticCell<TrackedMutex<LogStore<SimFlash>>> = StaticCell::new();
static COLLECTOR: StaticCell<SharedCollector> = StaticCell::new();

fn sim_config() -> FdirConfig {
    FdirConfig {
        // compressed mission time
        minute: Duration::from_secs(1),
        diagnostics_interval: Duration::from_secs(5),
        ..FdirConfig::default()
    }
}

/// Flash array with a firmware image for every subsystem in its slot.
fn flash_array() -> [SimFlash; 3] {
    let chips = [SimFlash::new(), SimFlash::new(), SimFlash::new()];
    for sub in Subsystem::ALL {
        let image: Vec<u8> = (0..SSM_IMAGE_LEN).map(|i| (i as u8) ^ (sub as u8)).collect();
        for chip in &chips {
            chip.load(ssm_image_base(sub), &(SSM_IMAGE_LEN as u32).to_le_bytes());
            chip.load(ssm_image_base(sub) + 4, &image);
        }
    }
    chips
}

fn report(record: FaultRecord) {
    if let Err(e) = ERRORS.report_low(record) {
        warn!("scenario: report dropped: {:?}", e);
    }
}

async fn command(cmd: GroundCommand) {
    info!("scenario: ground sends {:?}", cmd);
    GROUND.send(cmd).await;
}

/// Scripted fault scenario.
async fn scenario(bus: &SimCanBus, chips: &[SimFlash; 3]) {
    Timer::after(STARTUP_DELAY).await;

    info!("scenario: nominal operations");
    command(GroundCommand::SetDiagnosticsInterval { seconds: 2 }).await;
    command(GroundCommand::ReadVariable {
        variable: VariableRef::Subsystem(Subsystem::Eps, 2),
    })
    .await;
    Timer::after_secs(3).await;

    info!("scenario: EPS hangs until reset");
    bus.set_behaviour(Subsystem::Eps, SsmBehaviour::SilentUntilReset);
    report(FaultRecord::low(TaskId::Eps, ErrorCode::HkRequestFailed, Subsystem::Eps as u8));
    Timer::after_secs(1).await;

    info!("scenario: SPI chip 2 dies");
    chips[2].set_offline(true);
    for _ in 0..sim_config().spi_chip_threshold {
        report(FaultRecord::low(TaskId::Memory, ErrorCode::SpimemWriteFailed, 2));
        Timer::after_millis(50).await;
    }

    info!("scenario: COMS reports link loss");
    bus.inject_fault(Subsystem::Coms, ErrorCode::ComsLinkLost as u8, 0);
    Timer::after_secs(1).await;
    command(GroundCommand::ExitComsTakeover).await;

    info!("scenario: payload goes silent");
    bus.set_behaviour(Subsystem::Payload, SsmBehaviour::Silent);
    let aux = Subsystem::Payload as u8;
    let silent = FaultRecord::low(TaskId::Payload, ErrorCode::SsmParamFailed, aux);
    report(silent.with_payload(&[0]));
    Timer::after_secs(4).await;
    if !MODE.snapshot().is_safe() {
        error!("scenario: expected safe mode");
    }

    info!("scenario: payload repaired, leaving safe mode");
    bus.set_behaviour(Subsystem::Payload, SsmBehaviour::Healthy);
    command(GroundCommand::ExitSafeMode).await;
    command(GroundCommand::ReadVariable {
        variable: VariableRef::Obc(ObcVariable::MissionMinutes),
    })
    .await;
    Timer::after_secs(1).await;
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    const FW_VERSION: &str = env!("FW_VERSION");
    const FW_HASH: &str = env!("FW_HASH");
    info!("Launching: FW version={} hash={}", FW_VERSION, FW_HASH);

    let cfg = sim_config();

    // -- simulated hardware
    let bus = SimCanBus::new();
    let avrs = [SimAvr::new(), SimAvr::new(), SimAvr::new()];
    for sub in Subsystem::ALL {
        bus.attach_target(sub, avrs[sub.index()].clone());
    }
    let chips = flash_array();
    let tasks = SimTasks::new();
    let watchdog = SimWatchdog::new();
    let radio = SimRadio::new();

    // -- shared resources
    let mut log_store = LogStore::new(chips.clone());
    if let Err(e) = log_store.init() {
        warn!("log store init incomplete: {:?}", e);
    }
    let store: &'static _ = STORE.init(TrackedMutex::new(log_store));
    let can: &'static CanTransport<SimController> = CAN.init(CanTransport::new(
        bus.controller(Controller::Primary),
        bus.controller(Controller::Secondary),
        cfg.lock_timeout,
    ));
    let collector: &'static SharedCollector =
        COLLECTOR.init(Mutex::new(DiagnosticsCollector::new(TaskId::Housekeeping, &cfg)));

    let hardware: Hardware<SimBoard> = Hardware {
        tasks: tasks.clone(),
        watchdog: watchdog.clone(),
        ssm: Subsystem::ALL.map(|sub| SsmLink {
            isp: avrs[sub.index()].clone(),
            reset: avrs[sub.index()].reset_pin(),
        }),
    };
    let links = FdirLinks {
        errors: &ERRORS,
        can,
        store,
        mode: &MODE,
        downlink: &DOWNLINK,
        ground: &GROUND,
        fifos: &FIFOS,
        collector,
    };
    let mut engine = FdirEngine::new(links, hardware, cfg);
    let mut sender = DownlinkSender::new(radio.clone(), OPENLST_HWID);

    block_on(async {
        if let Err(e) = can.init(TaskId::Fdir).await {
            error!("can init failed: {:?}", e);
            return;
        }
        let runners = select4(
            can.run(),
            bus.pump(can.isr()),
            engine.run(),
            diagnostics::housekeeping_thread(collector, can, store, &ERRORS, &DOWNLINK, &MODE),
        );
        let _ = select(
            select(runners, downlink::downlink_thread(&DOWNLINK, &mut sender)),
            scenario(&bus, &chips),
        )
        .await;
    });

    let mode = MODE.snapshot();
    info!("scenario finished: mode {:?}", mode.flags());
    info!(
        "{} radio frames, {} watchdog feeds, {} task calls, {} CAN frames dropped",
        radio.frames().len(),
        watchdog.feeds(),
        tasks.calls().len(),
        can.dropped()
    );
    for sub in Subsystem::ALL {
        let avr = &avrs[sub.index()];
        info!(
            "{:?}: {} resets, {} images programmed",
            sub,
            avr.reset_pulses(),
            avr.images_programmed()
        );
    }
}
