//! Task and subsystem identities shared by every layer.

/// Scheduler tasks known to the core.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskId {
    Housekeeping = 0,
    Time = 1,
    Coms = 2,
    Eps = 3,
    Payload = 4,
    Router = 5,
    Scheduling = 6,
    Memory = 7,
    Watchdog = 8,
    Fdir = 9,
}

impl TaskId {
    pub const COUNT: usize = 10;
    pub const ALL: [TaskId; Self::COUNT] = [
        TaskId::Housekeeping,
        TaskId::Time,
        TaskId::Coms,
        TaskId::Eps,
        TaskId::Payload,
        TaskId::Router,
        TaskId::Scheduling,
        TaskId::Memory,
        TaskId::Watchdog,
        TaskId::Fdir,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_raw(raw: u8) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    /// Tasks that keep running while the OBC sits in safe mode.
    pub const fn survives_safe_mode(self) -> bool {
        matches!(self, TaskId::Fdir | TaskId::Watchdog)
    }
}

/// Subsystem micro-controllers reachable over CAN.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Subsystem {
    Coms = 0,
    Eps = 1,
    Payload = 2,
}

impl Subsystem {
    pub const COUNT: usize = 3;
    pub const ALL: [Subsystem; Self::COUNT] = [Subsystem::Coms, Subsystem::Eps, Subsystem::Payload];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_raw(raw: u8) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    /// CAN node id used in the sender/destination nibbles.
    pub const fn node_id(self) -> u8 {
        match self {
            Subsystem::Coms => 0x2,
            Subsystem::Eps => 0x3,
            Subsystem::Payload => 0x4,
        }
    }

    pub fn from_node_id(node: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.node_id() == node)
    }

    /// Task that talks to this subsystem.
    pub const fn task(self) -> TaskId {
        match self {
            Subsystem::Coms => TaskId::Coms,
            Subsystem::Eps => TaskId::Eps,
            Subsystem::Payload => TaskId::Payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_ids_round_trip() {
        for task in TaskId::ALL {
            assert_eq!(TaskId::from_raw(task as u8), Some(task));
        }
        assert_eq!(TaskId::from_raw(TaskId::COUNT as u8), None);
        for sub in Subsystem::ALL {
            assert_eq!(Subsystem::from_node_id(sub.node_id()), Some(sub));
        }
        assert_eq!(Subsystem::from_node_id(0x1), None);
    }
}
