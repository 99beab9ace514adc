//! System-wide operating mode flags.
//!
//! The word is written by the FDIR engine only; every other task takes a
//! [`ModeSnapshot`] and decides from that.

use core::sync::atomic::Ordering;

use portable_atomic::AtomicU32;

use crate::ids::Subsystem;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ModeFlags: u32 {
        const SAFE = 1 << 0;
        const LOW_POWER = 1 << 1;
        const COMS_TAKEOVER = 1 << 2;
        const INTERNAL_MEMORY_FALLBACK = 1 << 3;
        const PAUSED_COMS = 1 << 8;
        const PAUSED_EPS = 1 << 9;
        const PAUSED_PAY = 1 << 10;
    }
}

impl ModeFlags {
    pub const fn paused(subsystem: Subsystem) -> Self {
        match subsystem {
            Subsystem::Coms => ModeFlags::PAUSED_COMS,
            Subsystem::Eps => ModeFlags::PAUSED_EPS,
            Subsystem::Payload => ModeFlags::PAUSED_PAY,
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeSnapshot {
    bits: u32,
    /// Bumped on every change, so readers can tell two snapshots apart.
    pub version: u32,
}

impl ModeSnapshot {
    pub fn flags(&self) -> ModeFlags {
        ModeFlags::from_bits_truncate(self.bits)
    }

    pub fn is_safe(&self) -> bool {
        self.flags().contains(ModeFlags::SAFE)
    }

    pub fn is_low_power(&self) -> bool {
        self.flags().contains(ModeFlags::LOW_POWER)
    }

    pub fn is_coms_takeover(&self) -> bool {
        self.flags().contains(ModeFlags::COMS_TAKEOVER)
    }

    pub fn is_memory_fallback(&self) -> bool {
        self.flags().contains(ModeFlags::INTERNAL_MEMORY_FALLBACK)
    }

    pub fn is_paused(&self, subsystem: Subsystem) -> bool {
        self.flags().contains(ModeFlags::paused(subsystem))
    }
}

pub struct ModeCell {
    word: AtomicU32,
    version: AtomicU32,
}

impl Default for ModeCell {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeCell {
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
            version: AtomicU32::new(0),
        }
    }

    pub fn snapshot(&self) -> ModeSnapshot {
        ModeSnapshot {
            bits: self.word.load(Ordering::Acquire),
            version: self.version.load(Ordering::Acquire),
        }
    }

    /// Set or clear flags. Returns whether anything changed.
    pub(crate) fn set(&self, flags: ModeFlags, on: bool) -> bool {
        let previous = if on {
            self.word.fetch_or(flags.bits(), Ordering::AcqRel)
        } else {
            self.word.fetch_and(!flags.bits(), Ordering::AcqRel)
        };
        let changed = if on {
            previous & flags.bits() != flags.bits()
        } else {
            previous & flags.bits() != 0
        };
        if changed {
            self.version.fetch_add(1, Ordering::AcqRel);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_moves_only_on_change() {
        let mode = ModeCell::new();
        let before = mode.snapshot();
        assert!(!before.is_safe());

        assert!(mode.set(ModeFlags::SAFE, true));
        assert!(!mode.set(ModeFlags::SAFE, true));
        let during = mode.snapshot();
        assert!(during.is_safe());
        assert_eq!(during.version, before.version + 1);

        assert!(mode.set(ModeFlags::paused(Subsystem::Payload), true));
        assert!(mode.snapshot().is_paused(Subsystem::Payload));
        assert!(!mode.snapshot().is_paused(Subsystem::Eps));

        assert!(mode.set(ModeFlags::SAFE, false));
        assert!(!mode.set(ModeFlags::SAFE, false));
        assert_eq!(mode.snapshot().version, before.version + 3);
    }
}
