//! Telecommands the ground sends to the FDIR engine, and their execution.
//!
//! Wire form: an opcode byte followed by little-endian fields.

use core::fmt;

use embassy_sync::channel::Channel;
use embassy_time::Duration;
use heapless::Vec;

use super::{FdirEngine, FdirError, REASON_GROUND};
use crate::board::Board;
use crate::can::OBC_NODE_ID;
use crate::checksum::fletcher64_over_space;
use crate::config::GROUND_QUEUE_DEPTH;
use crate::diagnostics::{ParamRef, ReportDefinition};
use crate::downlink::{self, DUMP_MAX_LEN, Report};
use crate::ids::{Subsystem, TaskId};
use crate::spimem::MemorySpace;
use crate::sync::ObcMutex;

pub const LOAD_MAX_LEN: usize = 128;
pub const DUMP_LIMIT: u16 = 4096;
pub const COMMAND_MAX_LEN: usize = 160;

pub type GroundQueue = Channel<ObcMutex, GroundCommand, GROUND_QUEUE_DEPTH>;

/// Variables of the OBC itself the ground can read, some of them write.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObcVariable {
    ModeFlags = 0x01,
    /// Seconds.
    DiagnosticsInterval = 0x02,
    ParameterReporting = 0x03,
    MissionMinutes = 0x04,
    HealthyChips = 0x05,
    CanFramesDropped = 0x06,
    LockRecoveries = 0x07,
}

impl ObcVariable {
    pub fn from_raw(raw: u8) -> Option<Self> {
        [
            ObcVariable::ModeFlags,
            ObcVariable::DiagnosticsInterval,
            ObcVariable::ParameterReporting,
            ObcVariable::MissionMinutes,
            ObcVariable::HealthyChips,
            ObcVariable::CanFramesDropped,
            ObcVariable::LockRecoveries,
        ]
        .into_iter()
        .find(|v| *v as u8 == raw)
    }

    pub const fn is_writable(self) -> bool {
        matches!(self, ObcVariable::DiagnosticsInterval | ObcVariable::ParameterReporting)
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableRef {
    Obc(ObcVariable),
    Subsystem(Subsystem, u8),
}

impl VariableRef {
    /// `(node id, variable id)` as carried on the wire.
    pub fn raw(&self) -> (u8, u8) {
        match self {
            VariableRef::Obc(v) => (OBC_NODE_ID, *v as u8),
            VariableRef::Subsystem(sub, id) => (sub.node_id(), *id),
        }
    }

    pub fn from_raw(node: u8, id: u8) -> Option<Self> {
        if node == OBC_NODE_ID {
            return ObcVariable::from_raw(id).map(VariableRef::Obc);
        }
        Subsystem::from_node_id(node).map(|sub| VariableRef::Subsystem(sub, id))
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroundCommand {
    EnterSafeMode,
    ExitSafeMode,
    EnterLowPower,
    ExitLowPower,
    EnterComsTakeover,
    ExitComsTakeover,
    ExitMemoryFallback,
    PauseSubsystem { subsystem: Subsystem },
    ResumeSubsystem { subsystem: Subsystem },
    ResetSsm { subsystem: Subsystem },
    ReprogramSsm { subsystem: Subsystem },
    RestartTask { task: TaskId },
    DeleteTask { task: TaskId },
    ReadVariable { variable: VariableRef },
    WriteVariable { variable: VariableRef, value: u32 },
    MemoryLoad { space: MemorySpace, address: u32, data: Vec<u8, LOAD_MAX_LEN> },
    MemoryDump { space: MemorySpace, address: u32, len: u16 },
    MemoryChecksum { space: MemorySpace, address: u32, len: u32 },
    NewDiagnosticsDefinition { definition: ReportDefinition },
    ClearDiagnosticsDefinition,
    SetParameterReporting { enabled: bool },
    SetDiagnosticsInterval { seconds: u32 },
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandDecodeError {
    Empty,
    UnknownOpcode(u8),
    Truncated,
    InvalidField,
}

impl fmt::Display for CommandDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandDecodeError::Empty => write!(f, "empty command"),
            CommandDecodeError::UnknownOpcode(op) => write!(f, "unknown opcode {op:#04x}"),
            CommandDecodeError::Truncated => write!(f, "command truncated"),
            CommandDecodeError::InvalidField => write!(f, "invalid field value"),
        }
    }
}

struct Reader<'b> {
    bytes: &'b [u8],
}

impl<'b> Reader<'b> {
    fn take(&mut self, n: usize) -> Result<&'b [u8], CommandDecodeError> {
        if self.bytes.len() < n {
            return Err(CommandDecodeError::Truncated);
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, CommandDecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CommandDecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CommandDecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn subsystem(&mut self) -> Result<Subsystem, CommandDecodeError> {
        Subsystem::from_raw(self.u8()?).ok_or(CommandDecodeError::InvalidField)
    }

    fn task(&mut self) -> Result<TaskId, CommandDecodeError> {
        TaskId::from_raw(self.u8()?).ok_or(CommandDecodeError::InvalidField)
    }

    fn space(&mut self) -> Result<MemorySpace, CommandDecodeError> {
        MemorySpace::from_raw(self.u8()?).ok_or(CommandDecodeError::InvalidField)
    }

    fn variable(&mut self) -> Result<VariableRef, CommandDecodeError> {
        let node = self.u8()?;
        let id = self.u8()?;
        VariableRef::from_raw(node, id).ok_or(CommandDecodeError::InvalidField)
    }
}

impl GroundCommand {
    pub const ENTER_SAFE_MODE: u8 = 0x01;
    pub const EXIT_SAFE_MODE: u8 = 0x02;
    pub const ENTER_LOW_POWER: u8 = 0x03;
    pub const EXIT_LOW_POWER: u8 = 0x04;
    pub const ENTER_COMS_TAKEOVER: u8 = 0x05;
    pub const EXIT_COMS_TAKEOVER: u8 = 0x06;
    pub const EXIT_MEMORY_FALLBACK: u8 = 0x07;
    pub const PAUSE_SUBSYSTEM: u8 = 0x08;
    pub const RESUME_SUBSYSTEM: u8 = 0x09;
    pub const RESET_SSM: u8 = 0x0A;
    pub const REPROGRAM_SSM: u8 = 0x0B;
    pub const RESTART_TASK: u8 = 0x0C;
    pub const DELETE_TASK: u8 = 0x0D;
    pub const READ_VARIABLE: u8 = 0x0E;
    pub const WRITE_VARIABLE: u8 = 0x0F;
    pub const MEMORY_LOAD: u8 = 0x10;
    pub const MEMORY_DUMP: u8 = 0x11;
    pub const MEMORY_CHECKSUM: u8 = 0x12;
    pub const NEW_DIAGNOSTICS_DEFINITION: u8 = 0x13;
    pub const CLEAR_DIAGNOSTICS_DEFINITION: u8 = 0x14;
    pub const SET_PARAMETER_REPORTING: u8 = 0x15;
    pub const SET_DIAGNOSTICS_INTERVAL: u8 = 0x16;

    pub fn opcode(&self) -> u8 {
        match self {
            GroundCommand::EnterSafeMode => Self::ENTER_SAFE_MODE,
            GroundCommand::ExitSafeMode => Self::EXIT_SAFE_MODE,
            GroundCommand::EnterLowPower => Self::ENTER_LOW_POWER,
            GroundCommand::ExitLowPower => Self::EXIT_LOW_POWER,
            GroundCommand::EnterComsTakeover => Self::ENTER_COMS_TAKEOVER,
            GroundCommand::ExitComsTakeover => Self::EXIT_COMS_TAKEOVER,
            GroundCommand::ExitMemoryFallback => Self::EXIT_MEMORY_FALLBACK,
            GroundCommand::PauseSubsystem { .. } => Self::PAUSE_SUBSYSTEM,
            GroundCommand::ResumeSubsystem { .. } => Self::RESUME_SUBSYSTEM,
            GroundCommand::ResetSsm { .. } => Self::RESET_SSM,
            GroundCommand::ReprogramSsm { .. } => Self::REPROGRAM_SSM,
            GroundCommand::RestartTask { .. } => Self::RESTART_TASK,
            GroundCommand::DeleteTask { .. } => Self::DELETE_TASK,
            GroundCommand::ReadVariable { .. } => Self::READ_VARIABLE,
            GroundCommand::WriteVariable { .. } => Self::WRITE_VARIABLE,
            GroundCommand::MemoryLoad { .. } => Self::MEMORY_LOAD,
            GroundCommand::MemoryDump { .. } => Self::MEMORY_DUMP,
            GroundCommand::MemoryChecksum { .. } => Self::MEMORY_CHECKSUM,
            GroundCommand::NewDiagnosticsDefinition { .. } => Self::NEW_DIAGNOSTICS_DEFINITION,
            GroundCommand::ClearDiagnosticsDefinition => Self::CLEAR_DIAGNOSTICS_DEFINITION,
            GroundCommand::SetParameterReporting { .. } => Self::SET_PARAMETER_REPORTING,
            GroundCommand::SetDiagnosticsInterval { .. } => Self::SET_DIAGNOSTICS_INTERVAL,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CommandDecodeError> {
        let (&opcode, rest) = bytes.split_first().ok_or(CommandDecodeError::Empty)?;
        let mut r = Reader { bytes: rest };
        let cmd = match opcode {
            Self::ENTER_SAFE_MODE => GroundCommand::EnterSafeMode,
            Self::EXIT_SAFE_MODE => GroundCommand::ExitSafeMode,
            Self::ENTER_LOW_POWER => GroundCommand::EnterLowPower,
            Self::EXIT_LOW_POWER => GroundCommand::ExitLowPower,
            Self::ENTER_COMS_TAKEOVER => GroundCommand::EnterComsTakeover,
            Self::EXIT_COMS_TAKEOVER => GroundCommand::ExitComsTakeover,
            Self::EXIT_MEMORY_FALLBACK => GroundCommand::ExitMemoryFallback,
            Self::PAUSE_SUBSYSTEM => GroundCommand::PauseSubsystem { subsystem: r.subsystem()? },
            Self::RESUME_SUBSYSTEM => GroundCommand::ResumeSubsystem { subsystem: r.subsystem()? },
            Self::RESET_SSM => GroundCommand::ResetSsm { subsystem: r.subsystem()? },
            Self::REPROGRAM_SSM => GroundCommand::ReprogramSsm { subsystem: r.subsystem()? },
            Self::RESTART_TASK => GroundCommand::RestartTask { task: r.task()? },
            Self::DELETE_TASK => GroundCommand::DeleteTask { task: r.task()? },
            Self::READ_VARIABLE => GroundCommand::ReadVariable { variable: r.variable()? },
            Self::WRITE_VARIABLE => GroundCommand::WriteVariable {
                variable: r.variable()?,
                value: r.u32()?,
            },
            Self::MEMORY_LOAD => {
                let space = r.space()?;
                let address = r.u32()?;
                let len = r.u8()? as usize;
                let data = Vec::from_slice(r.take(len)?)
                    .map_err(|_| CommandDecodeError::InvalidField)?;
                GroundCommand::MemoryLoad { space, address, data }
            }
            Self::MEMORY_DUMP => {
                let space = r.space()?;
                let address = r.u32()?;
                let len = r.u16()?;
                if len > DUMP_LIMIT {
                    return Err(CommandDecodeError::InvalidField);
                }
                GroundCommand::MemoryDump { space, address, len }
            }
            Self::MEMORY_CHECKSUM => GroundCommand::MemoryChecksum {
                space: r.space()?,
                address: r.u32()?,
                len: r.u32()?,
            },
            Self::NEW_DIAGNOSTICS_DEFINITION => {
                let count = r.u8()?;
                let mut definition = ReportDefinition::new();
                for _ in 0..count {
                    let param = ParamRef::new(r.subsystem()?, r.u8()?);
                    definition.push(param).map_err(|_| CommandDecodeError::InvalidField)?;
                }
                if definition.is_empty() {
                    return Err(CommandDecodeError::InvalidField);
                }
                GroundCommand::NewDiagnosticsDefinition { definition }
            }
            Self::CLEAR_DIAGNOSTICS_DEFINITION => GroundCommand::ClearDiagnosticsDefinition,
            Self::SET_PARAMETER_REPORTING => GroundCommand::SetParameterReporting {
                enabled: r.u8()? != 0,
            },
            Self::SET_DIAGNOSTICS_INTERVAL => GroundCommand::SetDiagnosticsInterval {
                seconds: r.u32()?,
            },
            other => return Err(CommandDecodeError::UnknownOpcode(other)),
        };
        Ok(cmd)
    }

    pub fn encode(&self) -> Result<Vec<u8, COMMAND_MAX_LEN>, ()> {
        let mut out: Vec<u8, COMMAND_MAX_LEN> = Vec::new();
        out.push(self.opcode()).map_err(drop)?;
        match self {
            GroundCommand::PauseSubsystem { subsystem }
            | GroundCommand::ResumeSubsystem { subsystem }
            | GroundCommand::ResetSsm { subsystem }
            | GroundCommand::ReprogramSsm { subsystem } => {
                out.push(*subsystem as u8).map_err(drop)?
            }
            GroundCommand::RestartTask { task } | GroundCommand::DeleteTask { task } => {
                out.push(*task as u8).map_err(drop)?
            }
            GroundCommand::ReadVariable { variable } => {
                let (node, id) = variable.raw();
                out.extend_from_slice(&[node, id]).map_err(drop)?;
            }
            GroundCommand::WriteVariable { variable, value } => {
                let (node, id) = variable.raw();
                out.extend_from_slice(&[node, id]).map_err(drop)?;
                out.extend_from_slice(&value.to_le_bytes()).map_err(drop)?;
            }
            GroundCommand::MemoryLoad { space, address, data } => {
                out.push(*space as u8).map_err(drop)?;
                out.extend_from_slice(&address.to_le_bytes()).map_err(drop)?;
                out.push(data.len() as u8).map_err(drop)?;
                out.extend_from_slice(data).map_err(drop)?;
            }
            GroundCommand::MemoryDump { space, address, len } => {
                out.push(*space as u8).map_err(drop)?;
                out.extend_from_slice(&address.to_le_bytes()).map_err(drop)?;
                out.extend_from_slice(&len.to_le_bytes()).map_err(drop)?;
            }
            GroundCommand::MemoryChecksum { space, address, len } => {
                out.push(*space as u8).map_err(drop)?;
                out.extend_from_slice(&address.to_le_bytes()).map_err(drop)?;
                out.extend_from_slice(&len.to_le_bytes()).map_err(drop)?;
            }
            GroundCommand::NewDiagnosticsDefinition { definition } => {
                out.push(definition.params().len() as u8).map_err(drop)?;
                for p in definition.params() {
                    out.extend_from_slice(&[p.subsystem as u8, p.param]).map_err(drop)?;
                }
            }
            GroundCommand::SetParameterReporting { enabled } => {
                out.push(*enabled as u8).map_err(drop)?
            }
            GroundCommand::SetDiagnosticsInterval { seconds } => {
                out.extend_from_slice(&seconds.to_le_bytes()).map_err(drop)?
            }
            GroundCommand::EnterSafeMode
            | GroundCommand::ExitSafeMode
            | GroundCommand::EnterLowPower
            | GroundCommand::ExitLowPower
            | GroundCommand::EnterComsTakeover
            | GroundCommand::ExitComsTakeover
            | GroundCommand::ExitMemoryFallback
            | GroundCommand::ClearDiagnosticsDefinition => {}
        }
        Ok(out)
    }
}

impl<B: Board> FdirEngine<'_, B> {
    /// Run one ground command. Anything it reports back goes to the
    /// downlink; the caller acknowledges with the returned status.
    pub(super) async fn exec_command(&mut self, cmd: GroundCommand) -> Result<(), FdirError> {
        info!("fdir: ground command {}", cmd.opcode());
        match cmd {
            GroundCommand::EnterSafeMode => {
                self.enter_safe_mode(REASON_GROUND, 0);
                Ok(())
            }
            GroundCommand::ExitSafeMode => {
                self.exit_safe_mode();
                Ok(())
            }
            GroundCommand::EnterLowPower => self.enter_low_power(REASON_GROUND).await,
            GroundCommand::ExitLowPower => self.exit_low_power().await,
            GroundCommand::EnterComsTakeover => self.enter_coms_takeover(REASON_GROUND).await,
            GroundCommand::ExitComsTakeover => self.exit_coms_takeover().await,
            GroundCommand::ExitMemoryFallback => self.exit_internal_memory_fallback().await,
            GroundCommand::PauseSubsystem { subsystem } => {
                self.pause_subsystem(subsystem, REASON_GROUND).await
            }
            GroundCommand::ResumeSubsystem { subsystem } => {
                self.resume_subsystem(subsystem, REASON_GROUND).await
            }
            GroundCommand::ResetSsm { subsystem } => self.reset_ssm(subsystem, REASON_GROUND).await,
            GroundCommand::ReprogramSsm { subsystem } => {
                self.reprogram_ssm(subsystem, REASON_GROUND).await.map(drop)
            }
            GroundCommand::RestartTask { task } => self.restart_task(task, REASON_GROUND),
            GroundCommand::DeleteTask { task } => self.delete_task(task, REASON_GROUND),
            GroundCommand::ReadVariable { variable } => {
                let value = match variable {
                    VariableRef::Obc(v) => self.obc_variable(v).await?,
                    VariableRef::Subsystem(sub, id) => self
                        .can
                        .request_sensor_data(TaskId::Fdir, sub, id, self.cfg.param_timeout)
                        .await
                        .map_err(FdirError::Transport)?,
                };
                downlink::post(self.downlink, Report::Variable { variable, value });
                Ok(())
            }
            GroundCommand::WriteVariable { variable, value } => match variable {
                VariableRef::Obc(v) => self.set_obc_variable(v, value).await,
                VariableRef::Subsystem(sub, id) => self
                    .can
                    .set_variable(TaskId::Fdir, sub, id, value, self.cfg.param_timeout)
                    .await
                    .map_err(FdirError::Transport),
            },
            GroundCommand::MemoryLoad { space, address, data } => {
                self.store_guard().await?.write_space(space, address, &data)?;
                Ok(())
            }
            GroundCommand::MemoryDump { space, address, len } => {
                let mut done = 0u32;
                while done < len as u32 {
                    let chunk = (len as u32 - done).min(DUMP_MAX_LEN as u32) as usize;
                    let mut data: Vec<u8, DUMP_MAX_LEN> = Vec::new();
                    data.resize(chunk, 0).map_err(|_| FdirError::InvalidArgument)?;
                    let at = address.checked_add(done).ok_or(FdirError::InvalidArgument)?;
                    self.store_guard().await?.read_space(space, at, &mut data)?;
                    downlink::post(self.downlink, Report::MemoryDump { space, address: at, data });
                    done += chunk as u32;
                }
                Ok(())
            }
            GroundCommand::MemoryChecksum { space, address, len } => {
                let value = {
                    let mut store = self.store_guard().await?;
                    fletcher64_over_space(&mut *store, space, address, len)?
                };
                downlink::post(self.downlink, Report::Checksum { space, address, len, value });
                Ok(())
            }
            GroundCommand::NewDiagnosticsDefinition { definition } => {
                self.collector_guard().await?.set_alternate(definition);
                Ok(())
            }
            GroundCommand::ClearDiagnosticsDefinition => {
                self.collector_guard().await?.clear_alternate();
                Ok(())
            }
            GroundCommand::SetParameterReporting { enabled } => {
                self.collector_guard().await?.set_reporting(enabled);
                Ok(())
            }
            GroundCommand::SetDiagnosticsInterval { seconds } => {
                self.set_obc_variable(ObcVariable::DiagnosticsInterval, seconds).await
            }
        }
    }

    async fn obc_variable(&mut self, variable: ObcVariable) -> Result<u32, FdirError> {
        let value = match variable {
            ObcVariable::ModeFlags => self.mode.snapshot().flags().bits(),
            ObcVariable::DiagnosticsInterval => {
                self.collector_guard().await?.interval().as_secs() as u32
            }
            ObcVariable::ParameterReporting => self.collector_guard().await?.reporting() as u32,
            ObcVariable::MissionMinutes => self.mission_minutes,
            ObcVariable::HealthyChips => self
                .store_guard()
                .await?
                .healthy_chips()
                .iter()
                .enumerate()
                .fold(0, |mask, (i, healthy)| mask | ((*healthy as u32) << i)),
            ObcVariable::CanFramesDropped => self.can.dropped(),
            ObcVariable::LockRecoveries => self.can.lock().recoveries() + self.store.recoveries(),
        };
        Ok(value)
    }

    async fn set_obc_variable(
        &mut self,
        variable: ObcVariable,
        value: u32,
    ) -> Result<(), FdirError> {
        match variable {
            ObcVariable::DiagnosticsInterval => {
                if value == 0 {
                    return Err(FdirError::InvalidArgument);
                }
                self.collector_guard().await?.set_interval(Duration::from_secs(value as u64));
                Ok(())
            }
            ObcVariable::ParameterReporting => {
                self.collector_guard().await?.set_reporting(value != 0);
                Ok(())
            }
            ObcVariable::ModeFlags
            | ObcVariable::MissionMinutes
            | ObcVariable::HealthyChips
            | ObcVariable::CanFramesDropped
            | ObcVariable::LockRecoveries => Err(FdirError::ReadOnly),
        }
    }
}
