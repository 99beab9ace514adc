//! Mailbox identities, register images and their save/restore snapshot.

/// Index of one of the eight mailboxes of a controller.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MailboxId(pub u8);

impl MailboxId {
    pub const COMMAND: MailboxId = MailboxId(0);
    pub const COMS: MailboxId = MailboxId(1);
    pub const EPS: MailboxId = MailboxId(2);
    pub const PAY: MailboxId = MailboxId(3);
    pub const HK_CONSUMER: MailboxId = MailboxId(4);
    pub const HK_PRODUCER: MailboxId = MailboxId(5);
    pub const FAULT: MailboxId = MailboxId(6);
    pub const SPARE: MailboxId = MailboxId(7);

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

pub const MAILBOX_COUNT: usize = 8;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Controller {
    Primary = 0,
    Secondary = 1,
}

impl Controller {
    pub const fn index(self) -> usize {
        self as usize
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MailboxMode {
    #[default]
    Disabled,
    Receive,
    Transmit,
    /// Sends a remote frame and receives the answer in place.
    Consumer,
    /// Answers remote frames on its id with the loaded payload.
    Producer,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MailboxState {
    #[default]
    Idle,
    Configuring,
    Armed,
    Complete,
    TimedOut,
}

/// Image of one mailbox's registers.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MailboxRegisters {
    pub mode: MailboxMode,
    pub id: u16,
    pub id_mask: u16,
    pub priority: u8,
    pub data_low: u32,
    pub data_high: u32,
    pub dlc: u8,
    pub remote: bool,
}

/// Saved configuration of one mailbox, taken before the interrupt handler
/// touches it and written back afterwards.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxSnapshot {
    saved: MailboxRegisters,
}

impl MailboxSnapshot {
    pub fn save(regs: &MailboxRegisters) -> Self {
        Self { saved: *regs }
    }

    pub fn restore(&self, regs: &mut MailboxRegisters) {
        regs.mode = self.saved.mode;
        regs.id = self.saved.id;
        regs.id_mask = self.saved.id_mask;
        regs.priority = self.saved.priority;
        regs.data_low = self.saved.data_low;
        regs.data_high = self.saved.data_high;
        regs.dlc = self.saved.dlc;
        regs.remote = self.saved.remote;
    }

    pub fn registers(&self) -> &MailboxRegisters {
        &self.saved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_reproduces_saved_fields() {
        let original = MailboxRegisters {
            mode: MailboxMode::Consumer,
            id: 0x703,
            id_mask: 0x7FF,
            priority: 3,
            data_low: 0x1122_3344,
            data_high: 0x5566_7788,
            dlc: 8,
            remote: false,
        };
        let snapshot = MailboxSnapshot::save(&original);

        let mut mutated = original;
        mutated.mode = MailboxMode::Disabled;
        mutated.id = 0;
        mutated.data_low = 0;
        mutated.data_high = 0xFFFF_FFFF;
        mutated.dlc = 0;
        mutated.remote = true;

        snapshot.restore(&mut mutated);
        assert_eq!(mutated, original);
    }
}
