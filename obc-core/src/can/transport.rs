use core::cell::RefCell;
use core::fmt;
use core::sync::atomic::Ordering;

use embassy_sync::blocking_mutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Instant, with_timeout};
use embedded_can::{ErrorKind, StandardId};
use heapless::Vec;
use portable_atomic::AtomicU32;

use super::command::{
    Header, LogicalCommand, MessageType, OBC_NODE_ID, SmallType, housekeeping_frame_id,
    housekeeping_node_id, subsystem_for_housekeeping_id,
};
use super::mailbox::{
    Controller, MAILBOX_COUNT, MailboxId, MailboxMode, MailboxRegisters, MailboxSnapshot,
    MailboxState,
};
use crate::board::CanController;
use crate::config::{BULK_QUEUE_DEPTH, REPLY_QUEUE_DEPTH, RX_QUEUE_DEPTH};
use crate::ids::{Subsystem, TaskId};
use crate::sync::{ObcMutex, TrackedMutex};

// -- frame priorities, lower wins arbitration
pub const PRIORITY_COMMAND: u8 = 1;
pub const PRIORITY_DATA: u8 = 2;
pub const PRIORITY_HOUSEKEEPING: u8 = 3;

const STANDARD_ID_MASK: u16 = 0x7FF;
const HOUSEKEEPING_QUEUE_DEPTH: usize = 2;
const FAULT_QUEUE_DEPTH: usize = 4;

type HousekeepingQueue = Channel<ObcMutex, HousekeepingFrame, HOUSEKEEPING_QUEUE_DEPTH>;

pub const BULK_MAX_PARAMS: usize = BULK_QUEUE_DEPTH;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusFault {
    NoAcknowledge,
    Overrun,
    Protocol,
    Other,
}

impl From<ErrorKind> for BusFault {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Acknowledge => BusFault::NoAcknowledge,
            ErrorKind::Overrun => BusFault::Overrun,
            ErrorKind::Bit | ErrorKind::Stuff | ErrorKind::Crc | ErrorKind::Form => {
                BusFault::Protocol
            }
            _ => BusFault::Other,
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// No reply within the caller's timeout.
    Timeout,
    /// The subsystem answered with a negative acknowledgement.
    Nack,
    /// The transport lock could not be taken in time.
    Busy,
    Bus(BusFault),
    UnexpectedReply,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "no reply in time"),
            TransportError::Nack => write!(f, "negative acknowledgement"),
            TransportError::Busy => write!(f, "transport lock busy"),
            TransportError::Bus(fault) => write!(f, "bus error: {fault:?}"),
            TransportError::UnexpectedReply => write!(f, "unexpected reply"),
        }
    }
}

fn bus_error<E: embedded_can::Error>(e: E) -> TransportError {
    TransportError::Bus(e.kind().into())
}

/// Raw mailbox content captured by the interrupt handler.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxEvent {
    pub controller: Controller,
    pub mailbox: MailboxId,
    pub frame_id: u16,
    pub command: LogicalCommand,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub small_type: u8,
    pub param: u8,
    pub value: u32,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HousekeepingFrame {
    pub subsystem: Subsystem,
    pub low: u32,
    pub high: u32,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkParam {
    pub param: u8,
    pub value: u32,
}

/// Fault a subsystem raised on its own.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SsmFault {
    pub subsystem: Subsystem,
    pub code: u8,
    pub value: u32,
}

/// Bulk inbox entry; `None` marks the end of a bulk answer.
type BulkEntry = Option<BulkParam>;

pub const fn subsystem_mailbox(subsystem: Subsystem) -> MailboxId {
    match subsystem {
        Subsystem::Coms => MailboxId::COMS,
        Subsystem::Eps => MailboxId::EPS,
        Subsystem::Payload => MailboxId::PAY,
    }
}

pub struct Controllers<C> {
    pub primary: C,
    pub secondary: C,
}

impl<C> Controllers<C> {
    pub fn get(&mut self, controller: Controller) -> &mut C {
        match controller {
            Controller::Primary => &mut self.primary,
            Controller::Secondary => &mut self.secondary,
        }
    }
}

type StateTable = blocking_mutex::Mutex<ObcMutex, RefCell<[[MailboxState; MAILBOX_COUNT]; 2]>>;
type EventQueue = Channel<ObcMutex, RxEvent, RX_QUEUE_DEPTH>;

fn set_state(states: &StateTable, controller: Controller, mailbox: MailboxId, state: MailboxState) {
    states.lock(|s| s.borrow_mut()[controller.index()][mailbox.index()] = state);
}

/// Interrupt-side half of the transport.
///
/// Only touches the mailbox being serviced, the state table and the event
/// queue; never the transport lock.
pub struct CanIsr<'a> {
    events: &'a EventQueue,
    states: &'a StateTable,
    dropped: &'a AtomicU32,
}

impl CanIsr<'_> {
    /// Service one mailbox interrupt. Returns whether an event was queued.
    pub fn on_interrupt<H: CanController>(
        &self,
        hw: &mut H,
        controller: Controller,
        mailbox: MailboxId,
    ) -> bool {
        let regs = hw.registers(mailbox);
        let snapshot = MailboxSnapshot::save(&regs);
        hw.acknowledge(mailbox);
        let mut restored = hw.registers(mailbox);
        snapshot.restore(&mut restored);
        hw.write_registers(mailbox, &restored);

        match regs.mode {
            MailboxMode::Transmit => {
                set_state(self.states, controller, mailbox, MailboxState::Complete);
                return false;
            }
            MailboxMode::Consumer => {
                set_state(self.states, controller, mailbox, MailboxState::Complete)
            }
            MailboxMode::Receive => {}
            MailboxMode::Disabled | MailboxMode::Producer => return false,
        }

        let event = RxEvent {
            controller,
            mailbox,
            frame_id: regs.id,
            command: LogicalCommand {
                low: regs.data_low,
                high: regs.data_high,
                mailbox,
                priority: regs.priority,
            },
        };
        if self.events.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }
}

/// Command/response transport over the two CAN controllers.
pub struct CanTransport<C: CanController> {
    controllers: TrackedMutex<Controllers<C>>,
    states: StateTable,
    events: EventQueue,
    replies: [Channel<ObcMutex, Reply, REPLY_QUEUE_DEPTH>; Subsystem::COUNT],
    housekeeping: [HousekeepingQueue; Subsystem::COUNT],
    bulk: [Channel<ObcMutex, BulkEntry, BULK_QUEUE_DEPTH>; Subsystem::COUNT],
    faults: Channel<ObcMutex, SsmFault, FAULT_QUEUE_DEPTH>,
    dropped: AtomicU32,
    lock_timeout: Duration,
}

impl<C: CanController> CanTransport<C> {
    pub fn new(primary: C, secondary: C, lock_timeout: Duration) -> Self {
        Self {
            controllers: TrackedMutex::new(Controllers { primary, secondary }),
            states: blocking_mutex::Mutex::new(RefCell::new(
                [[MailboxState::Idle; MAILBOX_COUNT]; 2],
            )),
            events: Channel::new(),
            replies: [const { Channel::new() }; Subsystem::COUNT],
            housekeeping: [const { Channel::new() }; Subsystem::COUNT],
            bulk: [const { Channel::new() }; Subsystem::COUNT],
            faults: Channel::new(),
            dropped: AtomicU32::new(0),
            lock_timeout,
        }
    }

    /// The lock arbitrating every mailbox register access.
    pub fn lock(&self) -> &TrackedMutex<Controllers<C>> {
        &self.controllers
    }

    pub fn isr(&self) -> CanIsr<'_> {
        CanIsr {
            events: &self.events,
            states: &self.states,
            dropped: &self.dropped,
        }
    }

    pub fn mailbox_state(&self, controller: Controller, mailbox: MailboxId) -> MailboxState {
        self.states.lock(|s| s.borrow()[controller.index()][mailbox.index()])
    }

    /// Frames lost because a queue was full.
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn start(
        &self,
        hw: &mut C,
        controller: Controller,
        mailbox: MailboxId,
        regs: &MailboxRegisters,
    ) -> Result<(), TransportError> {
        set_state(&self.states, controller, mailbox, MailboxState::Configuring);
        let armed = hw.configure(mailbox, regs).and_then(|_| {
            set_state(&self.states, controller, mailbox, MailboxState::Armed);
            hw.arm(mailbox)
        });
        armed.map_err(|e| {
            set_state(&self.states, controller, mailbox, MailboxState::Idle);
            bus_error(e)
        })
    }

    /// Arm the receive mailboxes the subsystems answer into.
    pub async fn init(&self, task: TaskId) -> Result<(), TransportError> {
        let mut ctrls = self
            .controllers
            .lock_timeout(task, self.lock_timeout)
            .await
            .map_err(|_| TransportError::Busy)?;
        let mailboxes = Subsystem::ALL.map(subsystem_mailbox);
        for mailbox in mailboxes.into_iter().chain([MailboxId::FAULT]) {
            let regs = MailboxRegisters {
                mode: MailboxMode::Receive,
                id: super::command::command_frame_id(OBC_NODE_ID, mailbox).as_raw(),
                id_mask: STANDARD_ID_MASK,
                ..Default::default()
            };
            self.start(&mut ctrls.primary, Controller::Primary, mailbox, &regs)?;
        }
        info!("can: receive mailboxes armed");
        Ok(())
    }

    async fn transmit(&self, task: TaskId, cmd: &LogicalCommand) -> Result<(), TransportError> {
        let header = cmd.header();
        let regs = MailboxRegisters {
            mode: MailboxMode::Transmit,
            id: super::command::command_frame_id(header.destination, cmd.mailbox).as_raw(),
            id_mask: STANDARD_ID_MASK,
            priority: cmd.priority,
            data_low: cmd.low,
            data_high: cmd.high,
            dlc: 8,
            remote: false,
        };
        let mut ctrls = self
            .controllers
            .lock_timeout(task, self.lock_timeout)
            .await
            .map_err(|_| TransportError::Busy)?;
        self.start(&mut ctrls.primary, Controller::Primary, MailboxId::COMMAND, &regs)
    }

    /// Queue a command frame; does not wait for the transfer to finish.
    pub async fn send_command(
        &self,
        task: TaskId,
        low: u32,
        high: u32,
        mailbox: MailboxId,
        priority: u8,
    ) -> Result<(), TransportError> {
        self.transmit(task, &LogicalCommand { low, high, mailbox, priority }).await
    }

    async fn await_reply(
        &self,
        subsystem: Subsystem,
        param: u8,
        timeout: Duration,
    ) -> Result<Reply, TransportError> {
        let replies = &self.replies[subsystem.index()];
        let matching = async {
            loop {
                let reply = replies.receive().await;
                if reply.param == param {
                    break reply;
                }
                debug!("can: dropping stale reply for param {}", reply.param);
            }
        };
        with_timeout(timeout, matching).await.map_err(|_| {
            let timed_out = MailboxState::TimedOut;
            set_state(&self.states, Controller::Primary, MailboxId::COMMAND, timed_out);
            TransportError::Timeout
        })
    }

    /// Ask a subsystem for one sensor value and wait for the answer.
    pub async fn request_sensor_data(
        &self,
        task: TaskId,
        subsystem: Subsystem,
        sensor: u8,
        timeout: Duration,
    ) -> Result<u32, TransportError> {
        self.replies[subsystem.index()].clear();
        let header = Header::to(subsystem, MessageType::Data, SmallType::ReqData, sensor);
        let cmd = LogicalCommand::new(0, header, subsystem_mailbox(subsystem), PRIORITY_DATA);
        self.transmit(task, &cmd).await?;

        let reply = self.await_reply(subsystem, sensor, timeout).await?;
        match SmallType::from_raw(reply.small_type) {
            Some(SmallType::RespData) => Ok(reply.value),
            Some(SmallType::Nack) => Err(TransportError::Nack),
            _ => Err(TransportError::UnexpectedReply),
        }
    }

    /// Send a command to a subsystem and wait for its acknowledgement.
    pub async fn command_ssm(
        &self,
        task: TaskId,
        subsystem: Subsystem,
        small_type: SmallType,
        param: u8,
        value: u32,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.replies[subsystem.index()].clear();
        let header = Header::to(subsystem, MessageType::Command, small_type, param);
        let mailbox = subsystem_mailbox(subsystem);
        let cmd = LogicalCommand::new(value, header, mailbox, PRIORITY_COMMAND);
        self.transmit(task, &cmd).await?;

        let reply = self.await_reply(subsystem, param, timeout).await?;
        match SmallType::from_raw(reply.small_type) {
            Some(SmallType::Ack) => Ok(()),
            Some(SmallType::Nack) => Err(TransportError::Nack),
            _ => Err(TransportError::UnexpectedReply),
        }
    }

    pub async fn set_variable(
        &self,
        task: TaskId,
        subsystem: Subsystem,
        variable: u8,
        value: u32,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.command_ssm(task, subsystem, SmallType::SetVariable, variable, value, timeout)
            .await
    }

    /// Pull a subsystem's canned housekeeping frame with a remote request.
    ///
    /// The secondary controller waits in a consumer mailbox on the
    /// subsystem's housekeeping id while the primary sends the remote frame.
    pub async fn request_housekeeping(
        &self,
        task: TaskId,
        subsystem: Subsystem,
        timeout: Duration,
    ) -> Result<HousekeepingFrame, TransportError> {
        let inbox = &self.housekeeping[subsystem.index()];
        inbox.clear();
        let id = housekeeping_frame_id(subsystem).as_raw();
        {
            let mut ctrls = self
                .controllers
                .lock_timeout(task, self.lock_timeout)
                .await
                .map_err(|_| TransportError::Busy)?;
            let consumer = MailboxRegisters {
                mode: MailboxMode::Consumer,
                id,
                id_mask: STANDARD_ID_MASK,
                priority: PRIORITY_HOUSEKEEPING,
                dlc: 8,
                ..Default::default()
            };
            let (secondary, mailbox) = (Controller::Secondary, MailboxId::HK_CONSUMER);
            self.start(&mut ctrls.secondary, secondary, mailbox, &consumer)?;
            let request = MailboxRegisters {
                mode: MailboxMode::Transmit,
                id,
                id_mask: STANDARD_ID_MASK,
                priority: PRIORITY_HOUSEKEEPING,
                dlc: 8,
                remote: true,
                ..Default::default()
            };
            self.start(&mut ctrls.primary, Controller::Primary, MailboxId::COMMAND, &request)?;
        }
        with_timeout(timeout, inbox.receive()).await.map_err(|_| {
            let timed_out = MailboxState::TimedOut;
            set_state(&self.states, Controller::Secondary, MailboxId::HK_CONSUMER, timed_out);
            TransportError::Timeout
        })
    }

    /// Load the OBC's own housekeeping into the producer mailbox so other
    /// nodes can pull it with a remote frame.
    pub async fn publish_housekeeping(
        &self,
        task: TaskId,
        low: u32,
        high: u32,
    ) -> Result<(), TransportError> {
        let mut ctrls = self
            .controllers
            .lock_timeout(task, self.lock_timeout)
            .await
            .map_err(|_| TransportError::Busy)?;
        let regs = MailboxRegisters {
            mode: MailboxMode::Producer,
            id: housekeeping_node_id(OBC_NODE_ID).as_raw(),
            id_mask: STANDARD_ID_MASK,
            priority: PRIORITY_HOUSEKEEPING,
            data_low: low,
            data_high: high,
            dlc: 8,
            remote: false,
        };
        self.start(&mut ctrls.primary, Controller::Primary, MailboxId::HK_PRODUCER, &regs)
    }

    /// Ask a subsystem to stream its parameters and collect whatever arrives
    /// within `window`.
    pub async fn request_bulk(
        &self,
        task: TaskId,
        subsystem: Subsystem,
        window: Duration,
    ) -> Result<Vec<BulkParam, BULK_MAX_PARAMS>, TransportError> {
        let inbox = &self.bulk[subsystem.index()];
        inbox.clear();
        let header = Header::to(subsystem, MessageType::Command, SmallType::ReqHousekeeping, 0);
        let mailbox = subsystem_mailbox(subsystem);
        let cmd = LogicalCommand::new(0, header, mailbox, PRIORITY_HOUSEKEEPING);
        self.transmit(task, &cmd).await?;

        let deadline = Instant::now() + window;
        let mut params = Vec::new();
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match with_timeout(deadline - now, inbox.receive()).await {
                Ok(Some(param)) => {
                    if params.push(param).is_err() {
                        warn!("can: bulk answer from {:?} truncated", subsystem);
                        break;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        Ok(params)
    }

    /// Next fault message a subsystem raised on its own.
    pub fn try_take_fault(&self) -> Option<SsmFault> {
        self.faults.try_receive().ok()
    }

    /// Route one received frame to the queue its consumer waits on.
    pub fn classify(&self, event: RxEvent) {
        let low = event.command.low;
        let high = event.command.high;

        let delivered = if event.mailbox == MailboxId::HK_CONSUMER {
            match StandardId::new(event.frame_id).and_then(subsystem_for_housekeeping_id) {
                Some(subsystem) => self.housekeeping[subsystem.index()]
                    .try_send(HousekeepingFrame { subsystem, low, high })
                    .is_ok(),
                None => false,
            }
        } else {
            let header = event.command.header();
            match Subsystem::from_node_id(header.sender) {
                None => false,
                Some(subsystem) => {
                    let i = subsystem.index();
                    match header.kind() {
                        Some(MessageType::Data) | Some(MessageType::Command) => self.replies[i]
                            .try_send(Reply {
                                small_type: header.small_type,
                                param: header.param,
                                value: low,
                            })
                            .is_ok(),
                        Some(MessageType::Bulk) => {
                            let entry = match header.small() {
                                Some(SmallType::HkDone) => None,
                                _ => Some(BulkParam { param: header.param, value: low }),
                            };
                            self.bulk[i].try_send(entry).is_ok()
                        }
                        Some(MessageType::Housekeeping) => self.housekeeping[i]
                            .try_send(HousekeepingFrame { subsystem, low, high })
                            .is_ok(),
                        Some(MessageType::Fault) => self
                            .faults
                            .try_send(SsmFault {
                                subsystem,
                                code: header.param,
                                value: low,
                            })
                            .is_ok(),
                        Some(MessageType::Time) | None => {
                            debug!("can: ignoring message type {}", header.message_type);
                            true
                        }
                    }
                }
            }
        };

        if !delivered {
            warn!("can: dropped frame from mailbox {}", event.mailbox.0);
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Classification runner; drains the interrupt queue forever.
    pub async fn run(&self) -> ! {
        loop {
            let event = self.events.receive().await;
            self.classify(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use core::future::Future;

    use embassy_futures::block_on;
    use embassy_futures::select::{Either3, select3};
    use embassy_time::Timer;

    use super::*;
    use crate::sim::{SimCanBus, SimController, SsmBehaviour};

    const TIMEOUT: Duration = Duration::from_millis(50);

    fn transport(bus: &SimCanBus) -> CanTransport<SimController> {
        CanTransport::new(
            bus.controller(Controller::Primary),
            bus.controller(Controller::Secondary),
            Duration::from_millis(20),
        )
    }

    /// Run `body` with the classifier and the simulated interrupt source alive.
    async fn drive<T>(
        bus: &SimCanBus,
        can: &CanTransport<SimController>,
        body: impl Future<Output = T>,
    ) -> T {
        match select3(can.run(), bus.pump(can.isr()), body).await {
            Either3::First(never) => never,
            Either3::Second(never) => never,
            Either3::Third(out) => out,
        }
    }

    #[test]
    fn sensor_request_returns_the_value() {
        let bus = SimCanBus::new();
        let can = transport(&bus);
        let value = block_on(drive(&bus, &can, async {
            can.init(TaskId::Eps).await.unwrap();
            can.request_sensor_data(TaskId::Eps, Subsystem::Eps, 3, TIMEOUT).await
        }));
        assert_eq!(value, Ok(1003));
        assert_eq!(bus.data_requests(Subsystem::Eps), 1);
        let state = can.mailbox_state(Controller::Primary, MailboxId::COMMAND);
        assert_eq!(state, MailboxState::Complete);
    }

    #[test]
    fn replies_need_armed_receive_mailboxes() {
        let bus = SimCanBus::new();
        let can = transport(&bus);
        let request = can.request_sensor_data(TaskId::Eps, Subsystem::Eps, 3, TIMEOUT);
        let value = block_on(drive(&bus, &can, request));
        assert_eq!(value, Err(TransportError::Timeout));
        let state = can.mailbox_state(Controller::Primary, MailboxId::COMMAND);
        assert_eq!(state, MailboxState::TimedOut);
    }

    #[test]
    fn silent_and_refusing_subsystems() {
        let bus = SimCanBus::new();
        let can = transport(&bus);
        bus.set_behaviour(Subsystem::Coms, SsmBehaviour::Silent);
        bus.set_behaviour(Subsystem::Payload, SsmBehaviour::Nack);
        let (silent, refused) = block_on(drive(&bus, &can, async {
            can.init(TaskId::Fdir).await.unwrap();
            (
                can.request_sensor_data(TaskId::Fdir, Subsystem::Coms, 0, TIMEOUT).await,
                can.command_ssm(TaskId::Fdir, Subsystem::Payload, SmallType::Pause, 0, 0, TIMEOUT)
                    .await,
            )
        }));
        assert_eq!(silent, Err(TransportError::Timeout));
        assert_eq!(refused, Err(TransportError::Nack));
        assert!(!bus.is_paused(Subsystem::Payload));
    }

    #[test]
    fn commands_are_acknowledged() {
        let bus = SimCanBus::new();
        let can = transport(&bus);
        let res = block_on(drive(&bus, &can, async {
            can.init(TaskId::Fdir).await?;
            can.command_ssm(TaskId::Fdir, Subsystem::Payload, SmallType::Pause, 0, 0, TIMEOUT)
                .await?;
            can.set_variable(TaskId::Fdir, Subsystem::Eps, 12, 0xCAFE, TIMEOUT).await
        }));
        assert_eq!(res, Ok(()));
        assert!(bus.is_paused(Subsystem::Payload));
        assert_eq!(bus.variable(Subsystem::Eps, 12), 0xCAFE);
        assert_eq!(bus.sent_to(Subsystem::Payload, SmallType::Pause), 1);
    }

    #[test]
    fn own_housekeeping_is_published_on_the_obc_id() {
        let bus = SimCanBus::new();
        let can = transport(&bus);
        block_on(can.publish_housekeeping(TaskId::Housekeeping, 7, 2)).unwrap();

        let mut ctrls = can.controllers.try_lock(TaskId::Fdir).unwrap();
        let regs = ctrls.primary.registers(MailboxId::HK_PRODUCER);
        assert_eq!(regs.id, housekeeping_node_id(OBC_NODE_ID).as_raw());
        assert_eq!(regs.id & !0xF, 0x700);
        assert_eq!(regs.mode, MailboxMode::Producer);
        assert_eq!((regs.data_low, regs.data_high), (7, 2));
        assert_eq!(StandardId::new(regs.id).and_then(subsystem_for_housekeeping_id), None);
    }

    #[test]
    fn housekeeping_arrives_on_the_secondary_controller() {
        let bus = SimCanBus::new();
        let can = transport(&bus);
        bus.set_housekeeping(Subsystem::Coms, 0xAA55, 0x1234);
        let request = can.request_housekeeping(TaskId::Housekeeping, Subsystem::Coms, TIMEOUT);
        let frame = block_on(drive(&bus, &can, request));
        assert_eq!(
            frame,
            Ok(HousekeepingFrame {
                subsystem: Subsystem::Coms,
                low: 0xAA55,
                high: 0x1234,
            })
        );
    }

    #[test]
    fn bulk_collects_until_done() {
        let bus = SimCanBus::new();
        let can = transport(&bus);
        bus.drop_from_bulk(Subsystem::Eps, 5);
        bus.set_sensor(Subsystem::Eps, 9, None);
        let params = block_on(drive(&bus, &can, async {
            can.init(TaskId::Housekeeping).await.unwrap();
            can.request_bulk(TaskId::Housekeeping, Subsystem::Eps, TIMEOUT).await
        }))
        .unwrap();
        assert_eq!(params.len(), 14);
        assert!(params.iter().all(|p| p.param != 5 && p.param != 9));
        assert!(params.contains(&BulkParam { param: 2, value: 1002 }));
    }

    #[test]
    fn unsolicited_faults_are_queued() {
        let bus = SimCanBus::new();
        let can = transport(&bus);
        let fault = block_on(drive(&bus, &can, async {
            can.init(TaskId::Fdir).await.unwrap();
            bus.inject_fault(Subsystem::Payload, 0x21, 7);
            Timer::after_millis(5).await;
            can.try_take_fault()
        }));
        assert_eq!(
            fault,
            Some(SsmFault {
                subsystem: Subsystem::Payload,
                code: 0x21,
                value: 7,
            })
        );
        assert_eq!(can.try_take_fault(), None);
    }

    #[test]
    fn bus_errors_leave_the_mailbox_idle() {
        let bus = SimCanBus::new();
        let can = transport(&bus);
        bus.set_bus_off(true);
        let header = Header::to(Subsystem::Eps, MessageType::Command, SmallType::SoftReset, 0);
        let packed = header.pack();
        let send = can.send_command(TaskId::Eps, 0, packed, MailboxId::EPS, PRIORITY_COMMAND);
        let res = block_on(send);
        assert_eq!(res, Err(TransportError::Bus(BusFault::NoAcknowledge)));
        assert_eq!(can.mailbox_state(Controller::Primary, MailboxId::COMMAND), MailboxState::Idle);
    }

    #[test]
    fn held_lock_reports_busy() {
        let bus = SimCanBus::new();
        let can = transport(&bus);
        let _held = can.lock().try_lock(TaskId::Payload).unwrap();
        let res = block_on(can.request_sensor_data(TaskId::Eps, Subsystem::Eps, 0, TIMEOUT));
        assert_eq!(res, Err(TransportError::Busy));
        assert_eq!(can.lock().holder(), Some(TaskId::Payload));
    }
}
