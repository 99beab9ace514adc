use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use embedded_io_async::{ErrorType, Write};

use crate::board::{Board, TaskControl, TaskError, Watchdog};
use crate::ids::TaskId;

use super::{SimAvr, SimController, SimFlash, SimResetPin};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCall {
    Restart(TaskId),
    Suspend(TaskId),
    Resume(TaskId),
    Delete(TaskId),
}

#[derive(Default)]
struct TaskLog {
    calls: Vec<TaskCall>,
    deleted: [bool; TaskId::COUNT],
}

/// Scheduler stand-in that records every lifecycle request.
#[derive(Clone, Default)]
pub struct SimTasks {
    log: Arc<Mutex<TaskLog>>,
}

impl SimTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TaskLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn calls(&self) -> Vec<TaskCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, call: TaskCall) -> usize {
        self.lock().calls.iter().filter(|c| **c == call).count()
    }

    fn record(&mut self, call: TaskCall, task: TaskId) -> Result<(), TaskError> {
        let mut log = self.lock();
        if log.deleted[task.index()] {
            return Err(TaskError::NotRunning);
        }
        log.calls.push(call);
        if let TaskCall::Delete(_) = call {
            log.deleted[task.index()] = true;
        }
        Ok(())
    }
}

impl TaskControl for SimTasks {
    fn restart(&mut self, task: TaskId) -> Result<(), TaskError> {
        self.record(TaskCall::Restart(task), task)
    }

    fn suspend(&mut self, task: TaskId) -> Result<(), TaskError> {
        self.record(TaskCall::Suspend(task), task)
    }

    fn resume(&mut self, task: TaskId) -> Result<(), TaskError> {
        self.record(TaskCall::Resume(task), task)
    }

    fn delete(&mut self, task: TaskId) -> Result<(), TaskError> {
        self.record(TaskCall::Delete(task), task)
    }
}

#[derive(Clone, Default)]
pub struct SimWatchdog {
    feeds: Arc<AtomicU32>,
}

impl SimWatchdog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feeds(&self) -> u32 {
        self.feeds.load(Ordering::Relaxed)
    }
}

impl Watchdog for SimWatchdog {
    fn feed(&mut self) {
        self.feeds.fetch_add(1, Ordering::Relaxed);
    }
}

/// Radio UART; every flush closes one frame.
#[derive(Clone, Default)]
pub struct SimRadio {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    pending: Arc<Mutex<Vec<u8>>>,
}

impl SimRadio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl ErrorType for SimRadio {
    type Error = core::convert::Infallible;
}

impl Write for SimRadio {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).extend_from_slice(buf);
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        let frame = core::mem::take(&mut *self.pending.lock().unwrap_or_else(|p| p.into_inner()));
        if !frame.is_empty() {
            self.frames.lock().unwrap_or_else(|p| p.into_inner()).push(frame);
        }
        Ok(())
    }
}

/// Board made of the simulation models.
pub struct SimBoard;

impl Board for SimBoard {
    type Can = SimController;
    type Flash = SimFlash;
    type Isp = SimAvr;
    type Reset = SimResetPin;
    type Tasks = SimTasks;
    type Watchdog = SimWatchdog;
}
