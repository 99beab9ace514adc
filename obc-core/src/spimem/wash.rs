//! Majority vote across the three mirrored copies of a page.

use super::{CHIP_COUNT, PAGE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Vote {
    /// Copies that were corrected and need to be written back.
    pub rewrite: [bool; CHIP_COUNT],
    /// Bytes where all three copies disagree.
    pub unresolved: u32,
}

/// Vote byte by byte and correct the outvoted copies in place.
///
/// Bytes without a majority are left as each chip holds them.
pub fn vote_page(pages: &mut [[u8; PAGE_SIZE]; CHIP_COUNT]) -> Vote {
    let mut vote = Vote::default();
    for i in 0..PAGE_SIZE {
        let (a, b, c) = (pages[0][i], pages[1][i], pages[2][i]);
        let (majority, odd) = if a == b && b == c {
            continue;
        } else if a == b {
            (a, 2)
        } else if a == c {
            (a, 1)
        } else if b == c {
            (b, 0)
        } else {
            vote.unresolved += 1;
            continue;
        };
        pages[odd][i] = majority;
        vote.rewrite[odd] = true;
    }
    vote
}

/// Aggregated outcome of washing a range of pages.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WashReport {
    pub pages: u32,
    pub pages_corrected: u32,
    pub chip_rewrites: [u32; CHIP_COUNT],
    pub unresolved_bytes: u32,
    pub first_unresolved_page: Option<u32>,
    /// Set when fewer than three healthy copies exist and nothing was voted.
    pub skipped: bool,
}

impl WashReport {
    pub fn absorb(&mut self, page: u32, vote: &Vote) {
        self.pages += 1;
        if vote.rewrite.iter().any(|r| *r) {
            self.pages_corrected += 1;
        }
        for (count, rewritten) in self.chip_rewrites.iter_mut().zip(vote.rewrite) {
            *count += rewritten as u32;
        }
        if vote.unresolved > 0 {
            self.unresolved_bytes += vote.unresolved;
            self.first_unresolved_page.get_or_insert(page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_outlier_is_corrected() {
        let mut pages = [[0x11u8; PAGE_SIZE]; CHIP_COUNT];
        pages[1][7] = 0x10;
        pages[2][200] = 0xFF;

        let vote = vote_page(&mut pages);
        assert_eq!(vote.rewrite, [false, true, true]);
        assert_eq!(vote.unresolved, 0);
        assert!(pages.iter().all(|p| p.iter().all(|b| *b == 0x11)));
    }

    #[test]
    fn three_way_disagreement_is_left_alone() {
        let mut pages = [[0u8; PAGE_SIZE]; CHIP_COUNT];
        pages[0][3] = 1;
        pages[1][3] = 2;
        pages[2][3] = 3;

        let vote = vote_page(&mut pages);
        assert_eq!(vote.rewrite, [false; CHIP_COUNT]);
        assert_eq!(vote.unresolved, 1);
        assert_eq!((pages[0][3], pages[1][3], pages[2][3]), (1, 2, 3));
    }

    #[test]
    fn agreeing_copies_need_nothing() {
        let mut pages = [[0xA5u8; PAGE_SIZE]; CHIP_COUNT];
        assert_eq!(vote_page(&mut pages), Vote::default());
    }
}
