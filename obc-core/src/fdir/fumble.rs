//! Consecutive-failure counters that gate escalation.

use crate::ids::{Subsystem, TaskId};
use crate::router::Direction;
use crate::spimem::CHIP_COUNT;

/// Saturating count of consecutive failures of one operation class.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fumble {
    count: u8,
    escalations: u8,
}

impl Fumble {
    pub const fn new() -> Self {
        Self { count: 0, escalations: 0 }
    }

    pub fn count(&self) -> u8 {
        self.count
    }

    /// Times the threshold has been crossed since the last reset.
    pub fn escalations(&self) -> u8 {
        self.escalations
    }

    /// Count one failure. When the count reaches `threshold` it restarts from
    /// zero and the new escalation tier (1, 2, ...) is returned.
    pub fn record_failure(&mut self, threshold: u8) -> Option<u8> {
        self.count = self.count.saturating_add(1);
        if self.count < threshold {
            return None;
        }
        self.count = 0;
        self.escalations = self.escalations.saturating_add(1);
        Some(self.escalations)
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Every counter the engine keeps, indexed by task and resource.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FumbleCounters {
    fifo: [[Fumble; 2]; TaskId::COUNT],
    ssm: [Fumble; Subsystem::COUNT],
    chip: [Fumble; CHIP_COUNT],
    stall: [Fumble; TaskId::COUNT],
}

impl FumbleCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fifo(&mut self, task: TaskId, direction: Direction) -> &mut Fumble {
        &mut self.fifo[task.index()][direction.index()]
    }

    pub fn ssm(&mut self, subsystem: Subsystem) -> &mut Fumble {
        &mut self.ssm[subsystem.index()]
    }

    pub fn chip(&mut self, chip: usize) -> &mut Fumble {
        &mut self.chip[chip.min(CHIP_COUNT - 1)]
    }

    pub fn stall(&mut self, task: TaskId) -> &mut Fumble {
        &mut self.stall[task.index()]
    }

    /// A restarted task starts with clean queue counters. The escalation
    /// tier survives so the next round of failures goes further.
    pub fn reset_task(&mut self, task: TaskId) {
        for f in self.fifo[task.index()].iter_mut() {
            f.count = 0;
        }
    }
}
