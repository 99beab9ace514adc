//! One bit per page: set once a page has been programmed since its last erase.

use super::{PAGE_COUNT, PAGES_PER_SECTOR};

const WORDS: usize = PAGE_COUNT / 32;

#[derive(Debug, Clone)]
pub struct DirtyMap {
    bits: [u32; WORDS],
}

impl Default for DirtyMap {
    fn default() -> Self {
        Self::new()
    }
}

impl DirtyMap {
    pub const fn new() -> Self {
        Self { bits: [0; WORDS] }
    }

    pub fn is_dirty(&self, page: u32) -> bool {
        let page = page as usize;
        page < PAGE_COUNT && self.bits[page / 32] & (1 << (page % 32)) != 0
    }

    pub fn mark(&mut self, page: u32) {
        let page = page as usize;
        if page < PAGE_COUNT {
            self.bits[page / 32] |= 1 << (page % 32);
        }
    }

    pub fn clear_sector(&mut self, sector: u32) {
        let first = sector as usize * PAGES_PER_SECTOR;
        for page in first..(first + PAGES_PER_SECTOR).min(PAGE_COUNT) {
            self.bits[page / 32] &= !(1 << (page % 32));
        }
    }

    /// Forget everything, as after a chip erase.
    pub fn clear(&mut self) {
        self.bits = [0; WORDS];
    }

    pub fn count(&self) -> u32 {
        self.bits.iter().map(|w| w.count_ones()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_clear_only_touches_its_pages() {
        let mut map = DirtyMap::new();
        map.mark(0);
        map.mark(PAGES_PER_SECTOR as u32 - 1);
        map.mark(PAGES_PER_SECTOR as u32);
        assert_eq!(map.count(), 3);

        map.clear_sector(0);
        assert!(!map.is_dirty(0));
        assert!(!map.is_dirty(PAGES_PER_SECTOR as u32 - 1));
        assert!(map.is_dirty(PAGES_PER_SECTOR as u32));
        assert!(!map.is_dirty(PAGE_COUNT as u32));
    }
}
