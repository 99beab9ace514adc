//! Two-controller CAN bus with three scripted subsystems on it.
//!
//! Arming a transmit mailbox makes the addressed subsystem answer by queueing
//! deliveries; [`SimCanBus::pump`] plays them into the mailboxes and raises
//! the interrupt, the way the controller would.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use embassy_futures::yield_now;
use embassy_time::Timer;
use embedded_can::{ErrorKind, StandardId};

use crate::board::CanController;
use crate::can::command::{command_frame_id, housekeeping_frame_id, subsystem_for_housekeeping_id};
use crate::can::{
    CanIsr, Controller, Header, LogicalCommand, MAILBOX_COUNT, MailboxId, MailboxMode,
    MailboxRegisters, MessageType, OBC_NODE_ID, SmallType, subsystem_mailbox,
};
use crate::ids::Subsystem;

use super::SimAvr;

const SENSOR_COUNT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimCanError {
    BusOff,
}

impl embedded_can::Error for SimCanError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Acknowledge
    }
}

/// How a subsystem reacts to traffic addressed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SsmBehaviour {
    #[default]
    Healthy,
    /// Never answers.
    Silent,
    /// Answers every request with a negative acknowledgement.
    Nack,
    /// Silent until its reset line has been pulsed.
    SilentUntilReset,
    /// Silent until a new image has been programmed.
    SilentUntilReprogram,
}

struct Delivery {
    controller: Controller,
    mailbox: MailboxId,
    /// `None` for a transmit-complete interrupt.
    frame: Option<(u16, u32, u32)>,
}

struct SsmModel {
    behaviour: SsmBehaviour,
    target: Option<SimAvr>,
    sensors: [Option<u32>; SENSOR_COUNT],
    bulk_drops: [bool; SENSOR_COUNT],
    variables: [u32; 256],
    housekeeping: (u32, u32),
    data_requests: u32,
    paused: bool,
    low_power: bool,
}

impl SsmModel {
    fn new() -> Self {
        let mut sensors = [None; SENSOR_COUNT];
        for (i, s) in sensors.iter_mut().enumerate() {
            *s = Some(1000 + i as u32);
        }
        Self {
            behaviour: SsmBehaviour::Healthy,
            target: None,
            sensors,
            bulk_drops: [false; SENSOR_COUNT],
            variables: [0; 256],
            housekeeping: (0, 0),
            data_requests: 0,
            paused: false,
            low_power: false,
        }
    }

    fn silent(&self) -> bool {
        let pulses = self.target.as_ref().map_or(0, SimAvr::reset_pulses);
        let images = self.target.as_ref().map_or(0, SimAvr::images_programmed);
        match self.behaviour {
            SsmBehaviour::Healthy | SsmBehaviour::Nack => false,
            SsmBehaviour::Silent => true,
            SsmBehaviour::SilentUntilReset => pulses == 0,
            SsmBehaviour::SilentUntilReprogram => images == 0,
        }
    }
}

struct BusState {
    registers: [[MailboxRegisters; MAILBOX_COUNT]; 2],
    deliveries: VecDeque<Delivery>,
    ssm: [SsmModel; Subsystem::COUNT],
    sent: Vec<LogicalCommand>,
    bus_off: bool,
}

/// Shared bus; hand out one [`SimController`] per controller.
#[derive(Clone)]
pub struct SimCanBus {
    state: Arc<Mutex<BusState>>,
}

impl Default for SimCanBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCanBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                registers: [[MailboxRegisters::default(); MAILBOX_COUNT]; 2],
                deliveries: VecDeque::new(),
                ssm: [SsmModel::new(), SsmModel::new(), SsmModel::new()],
                sent: Vec::new(),
                bus_off: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn controller(&self, controller: Controller) -> SimController {
        SimController {
            bus: self.clone(),
            controller,
        }
    }

    pub fn set_behaviour(&self, subsystem: Subsystem, behaviour: SsmBehaviour) {
        self.lock().ssm[subsystem.index()].behaviour = behaviour;
    }

    /// Wire a subsystem's answers to the state of its micro-controller.
    pub fn attach_target(&self, subsystem: Subsystem, target: SimAvr) {
        self.lock().ssm[subsystem.index()].target = Some(target);
    }

    pub fn set_sensor(&self, subsystem: Subsystem, sensor: u8, value: Option<u32>) {
        if let Some(slot) = self.lock().ssm[subsystem.index()].sensors.get_mut(sensor as usize) {
            *slot = value;
        }
    }

    /// Leave a parameter out of bulk answers; direct requests still work.
    pub fn drop_from_bulk(&self, subsystem: Subsystem, sensor: u8) {
        if let Some(slot) = self.lock().ssm[subsystem.index()].bulk_drops.get_mut(sensor as usize) {
            *slot = true;
        }
    }

    pub fn set_housekeeping(&self, subsystem: Subsystem, low: u32, high: u32) {
        self.lock().ssm[subsystem.index()].housekeeping = (low, high);
    }

    pub fn set_bus_off(&self, off: bool) {
        self.lock().bus_off = off;
    }

    pub fn data_requests(&self, subsystem: Subsystem) -> u32 {
        self.lock().ssm[subsystem.index()].data_requests
    }

    pub fn variable(&self, subsystem: Subsystem, variable: u8) -> u32 {
        self.lock().ssm[subsystem.index()].variables[variable as usize]
    }

    pub fn is_paused(&self, subsystem: Subsystem) -> bool {
        self.lock().ssm[subsystem.index()].paused
    }

    pub fn is_low_power(&self, subsystem: Subsystem) -> bool {
        self.lock().ssm[subsystem.index()].low_power
    }

    /// Every command frame the OBC transmitted, oldest first.
    pub fn sent(&self) -> Vec<LogicalCommand> {
        self.lock().sent.clone()
    }

    /// Commands of one small type sent to `subsystem`.
    pub fn sent_to(&self, subsystem: Subsystem, small_type: SmallType) -> usize {
        self.lock()
            .sent
            .iter()
            .filter(|c| {
                let header = c.header();
                header.destination == subsystem.node_id() && header.small_type == small_type as u8
            })
            .count()
    }

    /// A subsystem raises a fault on its own.
    pub fn inject_fault(&self, subsystem: Subsystem, code: u8, value: u32) {
        let header = Header::from(subsystem, MessageType::Fault, SmallType::SsmFault, code);
        let id = command_frame_id(OBC_NODE_ID, MailboxId::FAULT).as_raw();
        self.lock().deliveries.push_back(Delivery {
            controller: Controller::Primary,
            mailbox: MailboxId::FAULT,
            frame: Some((id, value, header.pack())),
        });
    }

    pub fn pending_deliveries(&self) -> usize {
        self.lock().deliveries.len()
    }

    fn transmitted(st: &mut BusState, controller: Controller, mailbox: MailboxId) {
        let regs = st.registers[controller.index()][mailbox.index()];
        st.deliveries.push_back(Delivery {
            controller,
            mailbox,
            frame: None,
        });

        if regs.remote {
            let id = StandardId::new(regs.id);
            let Some(subsystem) = id.and_then(subsystem_for_housekeeping_id) else {
                return;
            };
            let ssm = &st.ssm[subsystem.index()];
            if ssm.silent() {
                return;
            }
            let (low, high) = ssm.housekeeping;
            st.deliveries.push_back(Delivery {
                controller: Controller::Secondary,
                mailbox: MailboxId::HK_CONSUMER,
                frame: Some((housekeeping_frame_id(subsystem).as_raw(), low, high)),
            });
            return;
        }

        let cmd = LogicalCommand {
            low: regs.data_low,
            high: regs.data_high,
            mailbox: MailboxId((regs.id & 0xF) as u8),
            priority: regs.priority,
        };
        st.sent.push(cmd);
        let header = cmd.header();
        let Some(subsystem) = Subsystem::from_node_id(header.destination) else {
            return;
        };
        let ssm = &mut st.ssm[subsystem.index()];
        if ssm.silent() {
            return;
        }
        let nack = ssm.behaviour == SsmBehaviour::Nack;

        let mut answers: Vec<(MessageType, SmallType, u8, u32)> = Vec::new();
        match (header.kind(), header.small()) {
            (Some(MessageType::Data), Some(SmallType::ReqData)) => {
                ssm.data_requests += 1;
                match ssm.sensors.get(header.param as usize).copied().flatten() {
                    Some(value) if !nack => {
                        answers.push((MessageType::Data, SmallType::RespData, header.param, value))
                    }
                    _ => answers.push((MessageType::Data, SmallType::Nack, header.param, 0)),
                }
            }
            (Some(MessageType::Command), Some(SmallType::ReqHousekeeping)) if !nack => {
                for (i, value) in ssm.sensors.iter().enumerate() {
                    if let Some(value) = value {
                        if !ssm.bulk_drops[i] {
                            answers.push((MessageType::Bulk, SmallType::HkParam, i as u8, *value));
                        }
                    }
                }
                answers.push((MessageType::Bulk, SmallType::HkDone, 0, 0));
            }
            (Some(MessageType::Command), Some(small)) => {
                if nack {
                    answers.push((MessageType::Command, SmallType::Nack, header.param, 0));
                } else {
                    match small {
                        SmallType::SetVariable => ssm.variables[header.param as usize] = cmd.low,
                        SmallType::Pause => ssm.paused = true,
                        SmallType::Resume => ssm.paused = false,
                        SmallType::EnterLowPower => ssm.low_power = true,
                        SmallType::ExitLowPower => ssm.low_power = false,
                        _ => {}
                    }
                    answers.push((MessageType::Command, SmallType::Ack, header.param, 0));
                }
            }
            _ => {}
        }

        let mailbox = subsystem_mailbox(subsystem);
        let id = command_frame_id(OBC_NODE_ID, mailbox).as_raw();
        for (kind, small, param, value) in answers {
            let reply = Header::from(subsystem, kind, small, param);
            st.deliveries.push_back(Delivery {
                controller: Controller::Primary,
                mailbox,
                frame: Some((id, value, reply.pack())),
            });
        }
    }

    /// Play one queued delivery into its mailbox. Returns false when idle.
    pub fn deliver_one(&self, isr: &CanIsr<'_>) -> bool {
        let delivery = {
            let mut st = self.lock();
            let Some(delivery) = st.deliveries.pop_front() else {
                return false;
            };
            if let Some((id, low, high)) = delivery.frame {
                let regs = &mut st.registers[delivery.controller.index()][delivery.mailbox.index()];
                let accepts = match regs.mode {
                    MailboxMode::Receive => true,
                    MailboxMode::Consumer => regs.id == id,
                    _ => false,
                };
                if !accepts {
                    // nobody listening, the frame is lost on the bus
                    return true;
                }
                regs.id = id;
                regs.data_low = low;
                regs.data_high = high;
                regs.dlc = 8;
            }
            delivery
        };
        let mut hw = self.controller(delivery.controller);
        isr.on_interrupt(&mut hw, delivery.controller, delivery.mailbox);
        true
    }

    /// Interrupt source for the simulation; runs forever.
    pub async fn pump(&self, isr: CanIsr<'_>) -> ! {
        loop {
            if self.deliver_one(&isr) {
                yield_now().await;
            } else {
                Timer::after_micros(100).await;
            }
        }
    }
}

/// One controller's view of the shared bus.
pub struct SimController {
    bus: SimCanBus,
    controller: Controller,
}

impl CanController for SimController {
    type Error = SimCanError;

    fn configure(
        &mut self,
        mailbox: MailboxId,
        regs: &MailboxRegisters,
    ) -> Result<(), Self::Error> {
        let mut st = self.bus.lock();
        if st.bus_off {
            return Err(SimCanError::BusOff);
        }
        st.registers[self.controller.index()][mailbox.index()] = *regs;
        Ok(())
    }

    fn arm(&mut self, mailbox: MailboxId) -> Result<(), Self::Error> {
        let mut st = self.bus.lock();
        if st.bus_off {
            return Err(SimCanError::BusOff);
        }
        if st.registers[self.controller.index()][mailbox.index()].mode == MailboxMode::Transmit {
            SimCanBus::transmitted(&mut st, self.controller, mailbox);
        }
        Ok(())
    }

    fn registers(&mut self, mailbox: MailboxId) -> MailboxRegisters {
        self.bus.lock().registers[self.controller.index()][mailbox.index()]
    }

    fn write_registers(&mut self, mailbox: MailboxId, regs: &MailboxRegisters) {
        self.bus.lock().registers[self.controller.index()][mailbox.index()] = *regs;
    }

    fn acknowledge(&mut self, mailbox: MailboxId) {
        // clearing the interrupt resets the mailbox on this controller
        let mut bus = self.bus.lock();
        bus.registers[self.controller.index()][mailbox.index()] = MailboxRegisters::default();
    }
}
