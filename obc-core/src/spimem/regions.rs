//! Region maps for the SPI array and the internal fallback memory.

use crate::ids::Subsystem;

use super::{CHIP_CAPACITY, SECTOR_SIZE};

/// Every region starts with its little-endian write cursor.
pub const CURSOR_LEN: u32 = 4;

/// Named log regions.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Region {
    Hk = 0,
    Event = 1,
    Schedule = 2,
    Tm = 3,
    Tc = 4,
    Science = 5,
    Diagnostics = 6,
    Time = 7,
}

impl Region {
    pub const COUNT: usize = 8;
    pub const ALL: [Region; Self::COUNT] = [
        Region::Hk,
        Region::Event,
        Region::Schedule,
        Region::Tm,
        Region::Tc,
        Region::Science,
        Region::Diagnostics,
        Region::Time,
    ];
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSpan {
    pub base: u32,
    pub len: u32,
}

impl RegionSpan {
    pub const fn end(&self) -> u32 {
        self.base + self.len
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Layout {
    spans: [RegionSpan; Region::COUNT],
}

impl Layout {
    pub const fn span(&self, region: Region) -> RegionSpan {
        self.spans[region as usize]
    }
}

const fn span(base: u32, len: u32) -> RegionSpan {
    RegionSpan { base, len }
}

/// Region map of the redundant SPI array. Sector aligned so a region never
/// shares a sector with its neighbour.
pub static SPI_LAYOUT: Layout = Layout {
    spans: [
        span(0x0_0000, 0x1_0000),
        span(0x1_0000, 0x1_0000),
        span(0x2_0000, 0x1_0000),
        span(0x3_0000, 0x2_0000),
        span(0x5_0000, 0x1_0000),
        span(0x6_0000, 0x4_0000),
        span(0xA_0000, 0x2_0000),
        span(0xC_0000, 0x1000),
    ],
};

/// Size of the internal memory used once every SPI chip is retired.
pub const INTERNAL_CAPACITY: u32 = 0x4000;

pub static INTERNAL_LAYOUT: Layout = Layout {
    spans: [
        span(0x0000, 0x800),
        span(0x0800, 0x800),
        span(0x1000, 0x400),
        span(0x1400, 0x800),
        span(0x1C00, 0x400),
        span(0x2000, 0x1000),
        span(0x3000, 0xC00),
        span(0x3C00, 0x400),
    ],
};

// -- SSM firmware images: little-endian length followed by the image bytes
pub const SSM_IMAGE_BASE: u32 = 0xD_0000;
pub const SSM_IMAGE_SLOT: u32 = 0x8000 + SECTOR_SIZE as u32;

pub const fn ssm_image_base(subsystem: Subsystem) -> u32 {
    SSM_IMAGE_BASE + SSM_IMAGE_SLOT * subsystem as u32
}

/// Sector reserved for chip self tests.
pub const SELF_TEST_BASE: u32 = CHIP_CAPACITY - SECTOR_SIZE as u32;

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_disjoint(layout: &Layout, capacity: u32) {
        let mut previous_end = 0;
        for region in Region::ALL {
            let span = layout.span(region);
            assert!(span.base >= previous_end, "{region:?} overlaps");
            assert!(span.len > CURSOR_LEN);
            previous_end = span.end();
        }
        assert!(previous_end <= capacity);
    }

    #[test]
    fn layouts_are_ordered_and_disjoint() {
        assert_disjoint(&SPI_LAYOUT, SSM_IMAGE_BASE);
        assert_disjoint(&INTERNAL_LAYOUT, INTERNAL_CAPACITY);
    }

    #[test]
    fn images_stay_clear_of_the_self_test_sector() {
        assert!(ssm_image_base(Subsystem::Payload) + SSM_IMAGE_SLOT <= SELF_TEST_BASE);
        for region in Region::ALL {
            assert_eq!(SPI_LAYOUT.span(region).base % SECTOR_SIZE as u32, 0);
        }
    }
}
