//! Diagnostics and housekeeping collection.
//!
//! A run walks the active report definition subsystem by subsystem: one bulk
//! request first, then individual sensor requests for whatever the bulk answer
//! lacked. The record is appended to the log store and a copy goes to the
//! downlink.

use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Instant, Timer};
use embedded_hal::spi::SpiDevice;
use heapless::Vec;

use crate::board::CanController;
use crate::can::CanTransport;
use crate::config::FdirConfig;
use crate::downlink::{self, DownlinkQueue, Report};
use crate::error_channel::{ErrorChannel, FaultRecord};
use crate::fdir::ErrorCode;
use crate::ids::{Subsystem, TaskId};
use crate::mode::ModeCell;
use crate::spimem::{LogStore, Region};
use crate::sync::{ObcMutex, TrackedMutex};

pub const MAX_DEFINITION_PARAMS: usize = 16;
const PARAM_ENCODED_LEN: usize = 7;
const HOUSEKEEPING_POLL: Duration = Duration::from_secs(1);
pub const RECORD_MAX_LEN: usize = 9 + MAX_DEFINITION_PARAMS * PARAM_ENCODED_LEN;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamRef {
    pub subsystem: Subsystem,
    pub param: u8,
}

impl ParamRef {
    pub const fn new(subsystem: Subsystem, param: u8) -> Self {
        Self { subsystem, param }
    }
}

/// Parameters one diagnostics report contains.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReportDefinition {
    params: Vec<ParamRef, MAX_DEFINITION_PARAMS>,
}

impl ReportDefinition {
    pub const fn new() -> Self {
        Self { params: Vec::new() }
    }

    /// Built-in definition used until ground uploads another one.
    pub fn default_set() -> Self {
        let mut def = Self::new();
        let per_subsystem = [(Subsystem::Coms, 4u8), (Subsystem::Eps, 6), (Subsystem::Payload, 4)];
        for (subsystem, count) in per_subsystem {
            for param in 0..count {
                let _ = def.push(ParamRef::new(subsystem, param));
            }
        }
        def
    }

    pub fn from_params(params: &[ParamRef]) -> Option<Self> {
        Some(Self {
            params: Vec::from_slice(params).ok()?,
        })
    }

    pub fn push(&mut self, param: ParamRef) -> Result<(), ParamRef> {
        self.params.push(param)
    }

    pub fn params(&self) -> &[ParamRef] {
        &self.params
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamValue {
    pub param: ParamRef,
    pub value: Option<u32>,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiagnosticsRecord {
    pub timestamp_ms: u64,
    pub values: Vec<ParamValue, MAX_DEFINITION_PARAMS>,
}

impl DiagnosticsRecord {
    /// `timestamp u64 | count u8 | count * (subsystem u8, param u8, present u8, value u32)`
    pub fn encode(&self) -> Vec<u8, RECORD_MAX_LEN> {
        let mut out: Vec<u8, RECORD_MAX_LEN> = Vec::new();
        // capacity covers the largest record, pushes cannot fail
        let _ = out.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        let _ = out.push(self.values.len() as u8);
        for v in &self.values {
            let _ = out.push(v.param.subsystem as u8);
            let _ = out.push(v.param.param);
            let _ = out.push(v.value.is_some() as u8);
            let _ = out.extend_from_slice(&v.value.unwrap_or(0).to_le_bytes());
        }
        out
    }

    pub fn missing(&self) -> impl Iterator<Item = ParamRef> + '_ {
        self.values.iter().filter(|v| v.value.is_none()).map(|v| v.param)
    }

    pub fn value(&self, param: ParamRef) -> Option<u32> {
        self.values.iter().find(|v| v.param == param).and_then(|v| v.value)
    }
}

pub struct DiagnosticsCollector {
    task: TaskId,
    default: ReportDefinition,
    alternate: Option<ReportDefinition>,
    interval: Duration,
    last_run: Option<Instant>,
    reporting: bool,
    bulk_window: Duration,
    param_timeout: Duration,
    param_retries: u8,
    lock_timeout: Duration,
}

impl DiagnosticsCollector {
    pub fn new(task: TaskId, cfg: &FdirConfig) -> Self {
        Self {
            task,
            default: ReportDefinition::default_set(),
            alternate: None,
            interval: cfg.diagnostics_interval,
            last_run: None,
            reporting: true,
            bulk_window: cfg.bulk_window,
            param_timeout: cfg.param_timeout,
            param_retries: cfg.param_retries,
            lock_timeout: cfg.lock_timeout,
        }
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn definition(&self) -> &ReportDefinition {
        self.alternate.as_ref().unwrap_or(&self.default)
    }

    pub fn set_alternate(&mut self, definition: ReportDefinition) {
        self.alternate = Some(definition);
    }

    pub fn clear_alternate(&mut self) {
        self.alternate = None;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn reporting(&self) -> bool {
        self.reporting
    }

    pub fn set_reporting(&mut self, enabled: bool) {
        self.reporting = enabled;
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.last_run.is_none_or(|last| now >= last + self.interval)
    }

    /// Copy of everything one run needs.
    pub fn plan(&self) -> CollectionPlan {
        CollectionPlan {
            task: self.task,
            definition: self.definition().clone(),
            reporting: self.reporting,
            bulk_window: self.bulk_window,
            param_timeout: self.param_timeout,
            param_retries: self.param_retries,
            lock_timeout: self.lock_timeout,
        }
    }

    /// Mark a run as started now and hand out its plan.
    pub fn start_run(&mut self) -> CollectionPlan {
        self.last_run = Some(Instant::now());
        self.plan()
    }

    /// Gather every parameter of the active definition.
    pub async fn collect<C: CanController>(&self, can: &CanTransport<C>) -> DiagnosticsRecord {
        self.plan().collect(can).await
    }

    pub async fn run_once<C: CanController, F: SpiDevice>(
        &mut self,
        can: &CanTransport<C>,
        store: &TrackedMutex<LogStore<F>>,
        errors: &ErrorChannel,
        downlink_queue: &DownlinkQueue,
        region: Region,
    ) -> DiagnosticsRecord {
        self.start_run().run(can, store, errors, downlink_queue, region).await
    }
}

/// One diagnostics run, detached from the shared collector.
#[derive(Debug, Clone)]
pub struct CollectionPlan {
    task: TaskId,
    definition: ReportDefinition,
    reporting: bool,
    bulk_window: Duration,
    param_timeout: Duration,
    param_retries: u8,
    lock_timeout: Duration,
}

impl CollectionPlan {
    pub async fn collect<C: CanController>(&self, can: &CanTransport<C>) -> DiagnosticsRecord {
        let mut record = DiagnosticsRecord {
            timestamp_ms: Instant::now().as_millis(),
            values: Vec::new(),
        };

        for subsystem in Subsystem::ALL {
            let params = self.definition.params();
            let mut wanted = params.iter().filter(|p| p.subsystem == subsystem).peekable();
            if wanted.peek().is_none() {
                continue;
            }
            let bulk = match can.request_bulk(self.task, subsystem, self.bulk_window).await {
                Ok(bulk) => bulk,
                Err(e) => {
                    warn!("diagnostics: bulk request to {:?} failed: {:?}", subsystem, e);
                    Vec::new()
                }
            };

            for param in wanted {
                let mut value = bulk.iter().find(|b| b.param == param.param).map(|b| b.value);
                for _ in 0..self.param_retries {
                    if value.is_some() {
                        break;
                    }
                    match can
                        .request_sensor_data(self.task, subsystem, param.param, self.param_timeout)
                        .await
                    {
                        Ok(v) => value = Some(v),
                        Err(e) => {
                            debug!("diagnostics: param {} of {:?}: {:?}", param.param, subsystem, e)
                        }
                    }
                }
                let _ = record.values.push(ParamValue { param: *param, value });
            }
        }
        record
    }

    /// Collect, persist to `region`, forward to the downlink and report
    /// parameters that never answered.
    pub async fn run<C: CanController, F: SpiDevice>(
        &self,
        can: &CanTransport<C>,
        store: &TrackedMutex<LogStore<F>>,
        errors: &ErrorChannel,
        downlink_queue: &DownlinkQueue,
        region: Region,
    ) -> DiagnosticsRecord {
        let record = self.collect(can).await;

        match store.lock_timeout(self.task, self.lock_timeout).await {
            Ok(mut store) => {
                if let Err(e) = store.append(region, &record.encode()) {
                    error!("diagnostics: could not store record: {:?}", e);
                    let chip = e.chip().unwrap_or(0);
                    let fault = FaultRecord::low(self.task, ErrorCode::SpimemWriteFailed, chip);
                    let _ = errors.report_low(fault);
                }
            }
            Err(e) => {
                error!("diagnostics: store lock unavailable: {:?}", e);
                let fault = FaultRecord::low(self.task, ErrorCode::SpimemMutexWedged, 0);
                let _ = errors.report_low(fault);
            }
        }

        if self.reporting {
            downlink::post(downlink_queue, Report::Diagnostics(record.clone()));
        }

        for missing in record.missing() {
            let aux = missing.subsystem as u8;
            let fault = FaultRecord::low(self.task, ErrorCode::SsmParamFailed, aux)
                .with_payload(&[missing.param]);
            if errors.report_low(fault).is_err() {
                warn!("diagnostics: queue full, missing param {} not reported", missing.param);
            }
        }
        record
    }
}

/// Collector shared between the housekeeping task and FDIR, which runs it
/// in safe mode and reconfigures it on ground command.
pub type SharedCollector = Mutex<ObcMutex, DiagnosticsCollector>;

/// Periodic housekeeping into the HK region. Idles while the OBC is in safe
/// mode, where FDIR runs the collector itself.
pub async fn housekeeping_thread<C: CanController, F: SpiDevice>(
    collector: &SharedCollector,
    can: &CanTransport<C>,
    store: &TrackedMutex<LogStore<F>>,
    errors: &ErrorChannel,
    downlink_queue: &DownlinkQueue,
    mode: &ModeCell,
) -> ! {
    loop {
        let snapshot = mode.snapshot();
        if !snapshot.is_safe() {
            if let Some(plan) = due_run(collector).await {
                let record = plan.run(can, store, errors, downlink_queue, Region::Hk).await;
                let missing = record.missing().count() as u32;
                let flags = snapshot.flags().bits();
                if let Err(e) = can.publish_housekeeping(plan.task, flags, missing).await {
                    warn!("housekeeping: could not publish: {:?}", e);
                }
            }
        }
        Timer::after(HOUSEKEEPING_POLL).await;
    }
}

/// The next run's plan when one is due; the collector is released on return.
async fn due_run(collector: &SharedCollector) -> Option<CollectionPlan> {
    let mut collector = collector.lock().await;
    collector.is_due(Instant::now()).then(|| collector.start_run())
}

#[cfg(test)]
mod tests {
    use core::future::Future;

    use embassy_futures::block_on;
    use embassy_futures::select::{Either, Either3, select, select3};
    use embassy_sync::channel::Channel;

    use super::*;
    use crate::can::Controller;
    use crate::error_channel::Severity;
    use crate::sim::{SimCanBus, SimController, SimFlash, SsmBehaviour};
    use crate::spimem::CURSOR_LEN;

    struct Rig {
        bus: SimCanBus,
        can: CanTransport<SimController>,
        store: TrackedMutex<LogStore<SimFlash>>,
        errors: ErrorChannel,
        downlink: DownlinkQueue,
        cfg: FdirConfig,
    }

    impl Rig {
        fn new() -> Self {
            let bus = SimCanBus::new();
            let cfg = FdirConfig::default();
            let can = CanTransport::new(
                bus.controller(Controller::Primary),
                bus.controller(Controller::Secondary),
                cfg.lock_timeout,
            );
            let mut store = LogStore::new([SimFlash::new(), SimFlash::new(), SimFlash::new()]);
            store.init().unwrap();
            Self {
                bus,
                can,
                store: TrackedMutex::new(store),
                errors: ErrorChannel::new(Duration::from_secs(1)),
                downlink: Channel::new(),
                cfg,
            }
        }

        fn run<T>(&self, body: impl Future<Output = T>) -> T {
            block_on(async {
                self.can.init(TaskId::Housekeeping).await.unwrap();
                match select3(self.can.run(), self.bus.pump(self.can.isr()), body).await {
                    Either3::First(never) => never,
                    Either3::Second(never) => never,
                    Either3::Third(out) => out,
                }
            })
        }
    }

    #[test]
    fn default_definition_covers_every_subsystem() {
        let def = ReportDefinition::default_set();
        for subsystem in Subsystem::ALL {
            assert!(def.params().iter().any(|p| p.subsystem == subsystem));
        }
        assert!(def.params().len() <= MAX_DEFINITION_PARAMS);
    }

    #[test]
    fn parameters_missing_from_bulk_are_requested_directly() {
        let rig = Rig::new();
        rig.bus.drop_from_bulk(Subsystem::Eps, 2);
        let collector = DiagnosticsCollector::new(TaskId::Housekeeping, &rig.cfg);

        let record = rig.run(collector.collect(&rig.can));
        assert_eq!(record.values.len(), ReportDefinition::default_set().params().len());
        assert_eq!(record.value(ParamRef::new(Subsystem::Eps, 2)), Some(1002));
        assert_eq!(record.missing().count(), 0);
        assert_eq!(rig.bus.data_requests(Subsystem::Eps), 1);
        assert_eq!(rig.bus.data_requests(Subsystem::Coms), 0);
    }

    #[test]
    fn run_stores_forwards_and_reports_missing_parameters() {
        let rig = Rig::new();
        rig.bus.set_sensor(Subsystem::Payload, 1, None);
        let mut collector = DiagnosticsCollector::new(TaskId::Housekeeping, &rig.cfg);

        let (can, store, errors) = (&rig.can, &rig.store, &rig.errors);
        let run = collector.run_once(can, store, errors, &rig.downlink, Region::Diagnostics);
        let record = rig.run(run);
        let missing: std::vec::Vec<_> = record.missing().collect();
        assert_eq!(missing, [ParamRef::new(Subsystem::Payload, 1)]);
        assert_eq!(rig.bus.data_requests(Subsystem::Payload), rig.cfg.param_retries as u32);

        let expected_cursor = CURSOR_LEN + record.encode().len() as u32;
        let cursor = rig.store.try_lock(TaskId::Fdir).unwrap().cursor(Region::Diagnostics);
        assert_eq!(cursor, Ok(expected_cursor));
        assert_eq!(rig.downlink.try_receive(), Ok(Report::Diagnostics(record)));

        let fault = rig.errors.try_take_low().unwrap();
        assert_eq!(fault.severity, Severity::Low);
        assert_eq!(fault.error_code(), Some(ErrorCode::SsmParamFailed));
        assert_eq!(fault.aux, Subsystem::Payload as u8);
        assert_eq!(&fault.payload[..], &[1]);
        assert!(!collector.is_due(Instant::now()));
    }

    #[test]
    fn silent_subsystem_yields_empty_values_without_blocking() {
        let rig = Rig::new();
        rig.bus.set_behaviour(Subsystem::Coms, SsmBehaviour::Silent);
        let mut collector = DiagnosticsCollector::new(TaskId::Housekeeping, &rig.cfg);
        collector.set_reporting(false);
        let coms_only = ReportDefinition::from_params(&[ParamRef::new(Subsystem::Coms, 0)]);
        collector.set_alternate(coms_only.unwrap());

        let run = collector.run_once(&rig.can, &rig.store, &rig.errors, &rig.downlink, Region::Hk);
        let record = rig.run(run);
        assert_eq!(record.values.len(), 1);
        assert_eq!(record.value(ParamRef::new(Subsystem::Coms, 0)), None);
        assert!(rig.downlink.try_receive().is_err());
        assert_eq!(rig.errors.low_len(), 1);

        collector.clear_alternate();
        assert_eq!(collector.definition(), &ReportDefinition::default_set());
    }

    #[test]
    fn collector_stays_free_while_housekeeping_collects() {
        let rig = Rig::new();
        rig.bus.set_behaviour(Subsystem::Coms, SsmBehaviour::Silent);
        let mut collector = DiagnosticsCollector::new(TaskId::Housekeeping, &rig.cfg);
        let coms_only = ReportDefinition::from_params(&[ParamRef::new(Subsystem::Coms, 0)]);
        collector.set_alternate(coms_only.unwrap());
        let shared: SharedCollector = Mutex::new(collector);
        let mode = ModeCell::new();

        let hk_cursor = || rig.store.try_lock(TaskId::Fdir).unwrap().cursor(Region::Hk).unwrap();
        let check = async {
            // the silent bulk window keeps the run on the bus
            Timer::after_millis(10).await;
            let mut collector = shared.try_lock().expect("collector held during collection");
            assert!(!collector.is_due(Instant::now()));
            collector.set_interval(Duration::from_secs(60));
            drop(collector);
            assert_eq!(hk_cursor(), CURSOR_LEN);

            Timer::after_millis(200).await;
            assert!(hk_cursor() > CURSOR_LEN);
        };
        let (can, store, errors) = (&rig.can, &rig.store, &rig.errors);
        let hk = housekeeping_thread(&shared, can, store, errors, &rig.downlink, &mode);
        rig.run(async {
            match select(hk, check).await {
                Either::First(never) => never,
                Either::Second(()) => {}
            }
        });
        assert_eq!(rig.errors.low_len(), 1);
    }

    #[test]
    fn interval_controls_when_a_run_is_due() {
        let cfg = FdirConfig::default();
        let mut collector = DiagnosticsCollector::new(TaskId::Housekeeping, &cfg);
        let now = Instant::now();
        assert!(collector.is_due(now));

        collector.last_run = Some(now);
        collector.set_interval(Duration::from_secs(10));
        assert!(!collector.is_due(now + Duration::from_secs(9)));
        assert!(collector.is_due(now + Duration::from_secs(10)));
    }

    #[test]
    fn record_encoding_marks_missing_values() {
        let mut record = DiagnosticsRecord {
            timestamp_ms: 0x0102,
            values: Vec::new(),
        };
        record
            .values
            .push(ParamValue {
                param: ParamRef::new(Subsystem::Eps, 4),
                value: Some(0xAABB),
            })
            .unwrap();
        record
            .values
            .push(ParamValue {
                param: ParamRef::new(Subsystem::Coms, 1),
                value: None,
            })
            .unwrap();
        assert_eq!(
            &record.encode()[..],
            &[2, 1, 0, 0, 0, 0, 0, 0, 2, 1, 4, 1, 0xBB, 0xAA, 0, 0, 0, 1, 0, 0, 0, 0, 0]
        );
    }
}
