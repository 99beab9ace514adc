//! Persistent log store on three mirrored SPI flash chips.
//!
//! Every write goes to all healthy chips, reads come from the first healthy
//! one. A per-chip dirty map guarantees a programmed page is erased before it
//! is programmed again. Once every chip is retired the store re-lays itself
//! onto a small internal memory.

pub mod chip;
mod dirty;
pub mod regions;
pub mod wash;

use core::fmt;
use core::ops::Range;

use embedded_hal::spi::SpiDevice;

use crate::checksum::fletcher64;

pub use chip::{FlashError, SpiFlash};
pub use dirty::DirtyMap;
pub use regions::{
    CURSOR_LEN, INTERNAL_CAPACITY, INTERNAL_LAYOUT, Layout, Region, RegionSpan, SELF_TEST_BASE,
    SPI_LAYOUT, ssm_image_base,
};
pub use wash::{Vote, WashReport};

pub const CHIP_COUNT: usize = 3;
pub const PAGE_SIZE: usize = 256;
pub const SECTOR_SIZE: usize = 4096;
pub const PAGES_PER_SECTOR: usize = SECTOR_SIZE / PAGE_SIZE;
pub const CHIP_CAPACITY: u32 = 0x10_0000;
pub const PAGE_COUNT: usize = CHIP_CAPACITY as usize / PAGE_SIZE;
pub const SECTOR_COUNT: u32 = CHIP_CAPACITY / SECTOR_SIZE as u32;

const ERASED: u8 = 0xFF;

/// Appends to a region between two cursor writes. After a restart the region
/// resumes from the last cursor that reached flash.
pub const CURSOR_PERSIST_INTERVAL: u8 = 16;

/// In-memory copy of a region cursor, per backend.
#[derive(Debug, Clone, Copy, Default)]
struct CachedCursor {
    value: Option<u32>,
    unsaved: u8,
}

/// Address space selected by ground memory commands.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemorySpace {
    Spi = 0,
    Internal = 1,
}

impl MemorySpace {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(MemorySpace::Spi),
            1 => Some(MemorySpace::Internal),
            _ => None,
        }
    }

    pub const fn capacity(self) -> u32 {
        match self {
            MemorySpace::Spi => CHIP_CAPACITY,
            MemorySpace::Internal => INTERNAL_CAPACITY,
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    InvalidSize,
    InvalidAddress,
    ChipBusy { chip: u8 },
    Transport { chip: u8 },
    EraseFailed { chip: u8 },
    VerifyFailed { chip: u8 },
    AllChipsExhausted,
    RecordTooLarge,
}

impl StorageError {
    /// Signed status as carried in fault payloads and ground acknowledgements.
    pub const fn code(&self) -> i8 {
        match self {
            StorageError::InvalidSize => -1,
            StorageError::InvalidAddress => -2,
            StorageError::ChipBusy { .. } => -3,
            StorageError::Transport { .. } => -4,
            StorageError::EraseFailed { .. } => -5,
            StorageError::VerifyFailed { .. } => -6,
            StorageError::AllChipsExhausted => -7,
            StorageError::RecordTooLarge => -8,
        }
    }

    /// Chip the error is attributed to, if any.
    pub const fn chip(&self) -> Option<u8> {
        match self {
            StorageError::ChipBusy { chip }
            | StorageError::Transport { chip }
            | StorageError::EraseFailed { chip }
            | StorageError::VerifyFailed { chip } => Some(*chip),
            _ => None,
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::InvalidSize => write!(f, "write larger than one page"),
            StorageError::InvalidAddress => write!(f, "address outside the device"),
            StorageError::ChipBusy { chip } => write!(f, "chip {chip} stuck busy"),
            StorageError::Transport { chip } => write!(f, "chip {chip} did not respond"),
            StorageError::EraseFailed { chip } => write!(f, "erase failed on chip {chip}"),
            StorageError::VerifyFailed { chip } => write!(f, "read back mismatch on chip {chip}"),
            StorageError::AllChipsExhausted => write!(f, "no healthy chip left"),
            StorageError::RecordTooLarge => write!(f, "record larger than its region"),
        }
    }
}

fn access_error<E>(chip: usize, err: FlashError<E>) -> StorageError {
    let chip = chip as u8;
    match err {
        FlashError::Spi(_) => StorageError::Transport { chip },
        FlashError::Busy => StorageError::ChipBusy { chip },
        FlashError::OutOfRange => StorageError::InvalidAddress,
    }
}

fn erase_error<E>(chip: usize, err: FlashError<E>) -> StorageError {
    match err {
        FlashError::OutOfRange => StorageError::InvalidAddress,
        _ => StorageError::EraseFailed { chip: chip as u8 },
    }
}

pub struct LogStore<S: SpiDevice> {
    chips: [SpiFlash<S>; CHIP_COUNT],
    healthy: [bool; CHIP_COUNT],
    dirty: [DirtyMap; CHIP_COUNT],
    internal: [u8; INTERNAL_CAPACITY as usize],
    fallback: bool,
    sector: [u8; SECTOR_SIZE],
    /// Indexed by backend (SPI, internal), then region.
    cursors: [[CachedCursor; Region::COUNT]; 2],
}

impl<S: SpiDevice> LogStore<S> {
    pub fn new(chips: [S; CHIP_COUNT]) -> Self {
        Self {
            chips: chips.map(SpiFlash::new),
            healthy: [true; CHIP_COUNT],
            dirty: [const { DirtyMap::new() }; CHIP_COUNT],
            internal: [ERASED; INTERNAL_CAPACITY as usize],
            fallback: false,
            sector: [ERASED; SECTOR_SIZE],
            cursors: [[CachedCursor { value: None, unsaved: 0 }; Region::COUNT]; 2],
        }
    }

    /// Unprotect every chip and rebuild the dirty maps from the array contents.
    ///
    /// Chips that fail are reported but left healthy; deciding to retire them
    /// is FDIR's call.
    pub fn init(&mut self) -> Result<(), StorageError> {
        self.cursors[MemorySpace::Spi as usize] = [CachedCursor::default(); Region::COUNT];
        let mut first_error = None;
        for chip in 0..CHIP_COUNT {
            if let Err(e) = self.init_chip(chip) {
                warn!("spimem: chip {} failed init: {:?}", chip, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn init_chip(&mut self, chip: usize) -> Result<(), StorageError> {
        self.chips[chip].unprotect().map_err(|e| access_error(chip, e))?;
        self.dirty[chip].clear();
        let mut page = [0u8; PAGE_SIZE];
        for index in 0..PAGE_COUNT as u32 {
            self.chips[chip]
                .read(index * PAGE_SIZE as u32, &mut page)
                .map_err(|e| access_error(chip, e))?;
            if page.iter().any(|b| *b != ERASED) {
                self.dirty[chip].mark(index);
            }
        }
        Ok(())
    }

    // -- health and backend selection

    pub fn healthy_chips(&self) -> [bool; CHIP_COUNT] {
        self.healthy
    }

    pub fn is_healthy(&self, chip: usize) -> bool {
        self.healthy.get(chip).copied().unwrap_or(false)
    }

    pub fn healthy_count(&self) -> usize {
        self.healthy.iter().filter(|h| **h).count()
    }

    /// First healthy chip; reads are served from it.
    pub fn primary(&self) -> Option<usize> {
        self.healthy.iter().position(|h| *h)
    }

    /// Retire a chip. Returns the number of chips still healthy.
    pub fn mark_unhealthy(&mut self, chip: usize) -> usize {
        if let Some(h) = self.healthy.get_mut(chip) {
            *h = false;
        }
        self.healthy_count()
    }

    /// Put a chip back into the mirror set after it passed a self test.
    pub fn mark_healthy(&mut self, chip: usize) {
        if let Some(h) = self.healthy.get_mut(chip) {
            *h = true;
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    pub fn active_space(&self) -> MemorySpace {
        if self.fallback { MemorySpace::Internal } else { MemorySpace::Spi }
    }

    pub fn layout(&self) -> &'static Layout {
        if self.fallback { &INTERNAL_LAYOUT } else { &SPI_LAYOUT }
    }

    pub fn span(&self, region: Region) -> RegionSpan {
        self.layout().span(region)
    }

    pub fn enter_internal_fallback(&mut self) {
        self.fallback = true;
    }

    pub fn exit_internal_fallback(&mut self) -> Result<(), StorageError> {
        if self.healthy_count() == 0 {
            return Err(StorageError::AllChipsExhausted);
        }
        self.fallback = false;
        Ok(())
    }

    // -- byte access

    /// Write at most one page worth of bytes at `region_base + offset` in the
    /// active backend. Returns the number of bytes written, which is less
    /// than requested only when the end of the device is reached.
    pub fn write(
        &mut self,
        region_base: u32,
        offset: u32,
        bytes: &[u8],
    ) -> Result<usize, StorageError> {
        let space = self.active_space();
        self.write_space(space, region_base.saturating_add(offset), bytes)
    }

    pub fn write_space(
        &mut self,
        space: MemorySpace,
        addr: u32,
        bytes: &[u8],
    ) -> Result<usize, StorageError> {
        if bytes.len() > PAGE_SIZE {
            return Err(StorageError::InvalidSize);
        }
        let capacity = space.capacity();
        if addr >= capacity {
            return Err(StorageError::InvalidAddress);
        }
        let len = bytes.len().min((capacity - addr) as usize);
        let data = &bytes[..len];

        match space {
            MemorySpace::Internal => {
                self.internal[addr as usize..addr as usize + len].copy_from_slice(data);
                Ok(len)
            }
            MemorySpace::Spi => {
                if self.healthy_count() == 0 {
                    return Err(StorageError::AllChipsExhausted);
                }
                let first_len = len.min(PAGE_SIZE - addr as usize % PAGE_SIZE);
                let mut result = Ok(len);
                for chip in 0..CHIP_COUNT {
                    if !self.healthy[chip] {
                        continue;
                    }
                    let mut outcome = self.write_chip(chip, addr, &data[..first_len]);
                    if outcome.is_ok() && len > first_len {
                        let rest = addr + first_len as u32;
                        outcome = self.write_chip(chip, rest, &data[first_len..]);
                    }
                    // keep mirroring to the remaining chips, report the first failure
                    if let (Err(e), Ok(_)) = (outcome, &result) {
                        result = Err(e);
                    }
                }
                result
            }
        }
    }

    /// `data` must not cross a page boundary.
    fn write_chip(&mut self, chip: usize, addr: u32, data: &[u8]) -> Result<(), StorageError> {
        let page = addr / PAGE_SIZE as u32;
        if self.dirty[chip].is_dirty(page) {
            return self.rewrite_in_sector(chip, addr, data);
        }
        self.chips[chip]
            .program_page(addr, data)
            .map_err(|e| access_error(chip, e))?;
        self.dirty[chip].mark(page);
        Ok(())
    }

    /// Read the enclosing sector, patch it, erase and program it back.
    fn rewrite_in_sector(
        &mut self,
        chip: usize,
        addr: u32,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let sector_base = addr - addr % SECTOR_SIZE as u32;
        self.chips[chip]
            .read(sector_base, &mut self.sector)
            .map_err(|e| access_error(chip, e))?;
        let at = (addr - sector_base) as usize;
        self.sector[at..at + data.len()].copy_from_slice(data);

        self.chips[chip]
            .erase_sector(sector_base)
            .map_err(|e| erase_error(chip, e))?;
        self.dirty[chip].clear_sector(sector_base / SECTOR_SIZE as u32);

        for (i, page) in self.sector.chunks(PAGE_SIZE).enumerate() {
            if page.iter().all(|b| *b == ERASED) {
                continue;
            }
            let page_addr = sector_base + (i * PAGE_SIZE) as u32;
            self.chips[chip]
                .program_page(page_addr, page)
                .map_err(|e| access_error(chip, e))?;
            self.dirty[chip].mark(page_addr / PAGE_SIZE as u32);
        }
        Ok(())
    }

    pub fn read(
        &mut self,
        region_base: u32,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), StorageError> {
        let space = self.active_space();
        self.read_space(space, region_base.saturating_add(offset), buf)
    }

    pub fn read_space(
        &mut self,
        space: MemorySpace,
        addr: u32,
        buf: &mut [u8],
    ) -> Result<(), StorageError> {
        let capacity = space.capacity();
        if addr > capacity || buf.len() > (capacity - addr) as usize {
            return Err(StorageError::InvalidAddress);
        }
        match space {
            MemorySpace::Internal => {
                buf.copy_from_slice(&self.internal[addr as usize..addr as usize + buf.len()]);
                Ok(())
            }
            MemorySpace::Spi => {
                let chip = self.primary().ok_or(StorageError::AllChipsExhausted)?;
                self.read_chip(chip, addr, buf)
            }
        }
    }

    /// Read from one specific chip regardless of its health.
    pub fn read_chip(
        &mut self,
        chip: usize,
        addr: u32,
        buf: &mut [u8],
    ) -> Result<(), StorageError> {
        let flash = self.chips.get_mut(chip).ok_or(StorageError::InvalidAddress)?;
        flash.read(addr, buf).map_err(|e| access_error(chip, e))
    }

    pub fn erase_sector(&mut self, chip: usize, sector: u32) -> Result<(), StorageError> {
        if chip >= CHIP_COUNT || sector >= SECTOR_COUNT {
            return Err(StorageError::InvalidAddress);
        }
        self.chips[chip]
            .erase_sector(sector * SECTOR_SIZE as u32)
            .map_err(|e| erase_error(chip, e))?;
        self.dirty[chip].clear_sector(sector);
        Ok(())
    }

    pub fn is_dirty(&self, chip: usize, page: u32) -> bool {
        self.dirty.get(chip).is_some_and(|d| d.is_dirty(page))
    }

    // -- health checks

    /// Write a known pattern to the reserved test sector and compare the
    /// checksum of what comes back.
    pub fn self_test(&mut self, chip: usize) -> Result<(), StorageError> {
        if chip >= CHIP_COUNT {
            return Err(StorageError::InvalidAddress);
        }
        let pattern: [u8; PAGE_SIZE] = core::array::from_fn(|i| (i as u8) ^ 0x5A);
        self.erase_sector(chip, SELF_TEST_BASE / SECTOR_SIZE as u32)?;
        self.chips[chip]
            .program_page(SELF_TEST_BASE, &pattern)
            .map_err(|e| access_error(chip, e))?;
        self.dirty[chip].mark(SELF_TEST_BASE / PAGE_SIZE as u32);

        let mut back = [0u8; PAGE_SIZE];
        self.read_chip(chip, SELF_TEST_BASE, &mut back)?;
        if fletcher64(&back) != fletcher64(&pattern) {
            return Err(StorageError::VerifyFailed { chip: chip as u8 });
        }
        Ok(())
    }

    /// Majority-vote one page across the three chips and rewrite the copies
    /// that were outvoted. `None` when fewer than three healthy copies exist.
    pub fn wash_page(&mut self, page: u32) -> Result<Option<Vote>, StorageError> {
        if page as usize >= PAGE_COUNT {
            return Err(StorageError::InvalidAddress);
        }
        if self.fallback || self.healthy_count() < CHIP_COUNT {
            return Ok(None);
        }
        let addr = page * PAGE_SIZE as u32;
        let mut pages = [[0u8; PAGE_SIZE]; CHIP_COUNT];
        for (chip, copy) in pages.iter_mut().enumerate() {
            self.read_chip(chip, addr, copy)?;
        }
        let vote = wash::vote_page(&mut pages);
        for (chip, copy) in pages.iter().enumerate() {
            if vote.rewrite[chip] {
                self.rewrite_in_sector(chip, addr, copy)?;
            }
        }
        Ok(Some(vote))
    }

    pub fn wash(&mut self, pages: Range<u32>) -> Result<WashReport, StorageError> {
        let mut report = WashReport::default();
        for page in pages {
            match self.wash_page(page)? {
                Some(vote) => report.absorb(page, &vote),
                None => {
                    report.skipped = true;
                    break;
                }
            }
        }
        if report.unresolved_bytes > 0 {
            warn!("spimem: wash left {} unresolved bytes", report.unresolved_bytes);
        }
        Ok(report)
    }

    // -- regions

    /// Current write cursor of a region; anything out of range reads as the
    /// first byte after the cursor.
    pub fn cursor(&mut self, region: Region) -> Result<u32, StorageError> {
        let slot = self.active_space() as usize;
        if let Some(cursor) = self.cursors[slot][region as usize].value {
            return Ok(cursor);
        }
        let span = self.span(region);
        let mut raw = [0u8; CURSOR_LEN as usize];
        self.read(span.base, 0, &mut raw)?;
        let cursor = u32::from_le_bytes(raw);
        let cursor = if cursor < CURSOR_LEN || cursor >= span.len { CURSOR_LEN } else { cursor };
        self.cursors[slot][region as usize] = CachedCursor {
            value: Some(cursor),
            unsaved: 0,
        };
        Ok(cursor)
    }

    /// Append a record to a region, wrapping to the start when it would not
    /// fit. Returns the region offset the record landed at.
    ///
    /// The cursor reaches flash every [`CURSOR_PERSIST_INTERVAL`] appends and
    /// on every wrap.
    pub fn append(&mut self, region: Region, record: &[u8]) -> Result<u32, StorageError> {
        let span = self.span(region);
        let len = record.len() as u32;
        if record.is_empty() || len > span.len - CURSOR_LEN {
            return Err(StorageError::RecordTooLarge);
        }
        let mut at = self.cursor(region)?;
        let wrapped = at + len > span.len;
        if wrapped {
            at = CURSOR_LEN;
        }

        for (i, chunk) in record.chunks(PAGE_SIZE).enumerate() {
            self.write(span.base, at + (i * PAGE_SIZE) as u32, chunk)?;
        }

        let mut next = at + len;
        if next >= span.len {
            next = CURSOR_LEN;
        }
        let slot = self.active_space() as usize;
        let cached = &mut self.cursors[slot][region as usize];
        cached.value = Some(next);
        cached.unsaved = cached.unsaved.saturating_add(1);
        if wrapped || next == CURSOR_LEN || cached.unsaved >= CURSOR_PERSIST_INTERVAL {
            self.persist_cursor(region)?;
        }
        Ok(at)
    }

    /// Write every cursor with unsaved appends of the active backend.
    pub fn flush_cursors(&mut self) -> Result<(), StorageError> {
        let slot = self.active_space() as usize;
        let mut result = Ok(());
        for region in Region::ALL {
            if self.cursors[slot][region as usize].unsaved == 0 {
                continue;
            }
            if let Err(e) = self.persist_cursor(region) {
                result = result.and(Err(e));
            }
        }
        result
    }

    fn persist_cursor(&mut self, region: Region) -> Result<(), StorageError> {
        let slot = self.active_space() as usize;
        let Some(cursor) = self.cursors[slot][region as usize].value else {
            return Ok(());
        };
        let span = self.span(region);
        self.write(span.base, 0, &cursor.to_le_bytes())?;
        self.cursors[slot][region as usize].unsaved = 0;
        Ok(())
    }
}
