//! Single SPI NOR flash chip driver.

use embedded_hal::spi::{Operation, SpiDevice};

use super::{CHIP_CAPACITY, PAGE_SIZE};

// -- command set
pub const WREN: u8 = 0x06;
pub const WRDI: u8 = 0x04;
pub const WSR: u8 = 0x01;
pub const RSR: u8 = 0x05;
pub const RD: u8 = 0x03;
pub const PP: u8 = 0x02;
pub const SE: u8 = 0x20;
pub const CE: u8 = 0xC7;

// -- status register
pub const STATUS_BUSY: u8 = 0x01;
pub const STATUS_WEL: u8 = 0x02;
pub const STATUS_BLOCK_PROTECT: u8 = 0x3C;

/// Status polls before a chip is declared stuck.
const BUSY_POLL_LIMIT: u32 = 20_000;
/// Chip erase takes orders of magnitude longer than a page program.
const CHIP_ERASE_POLL_LIMIT: u32 = 2_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError<E> {
    Spi(E),
    Busy,
    OutOfRange,
}

pub struct SpiFlash<S: SpiDevice> {
    spi: S,
}

fn address_bytes(op: u8, addr: u32) -> [u8; 4] {
    [op, (addr >> 16) as u8, (addr >> 8) as u8, addr as u8]
}

impl<S: SpiDevice> SpiFlash<S> {
    pub fn new(spi: S) -> Self {
        Self { spi }
    }

    pub fn release(self) -> S {
        self.spi
    }

    fn command(&mut self, op: u8) -> Result<(), FlashError<S::Error>> {
        self.spi.write(&[op]).map_err(FlashError::Spi)
    }

    pub fn read_status(&mut self) -> Result<u8, FlashError<S::Error>> {
        let mut status = [0u8];
        self.spi
            .transaction(&mut [Operation::Write(&[RSR]), Operation::Read(&mut status)])
            .map_err(FlashError::Spi)?;
        Ok(status[0])
    }

    pub fn write_status(&mut self, value: u8) -> Result<(), FlashError<S::Error>> {
        self.wait_ready(BUSY_POLL_LIMIT)?;
        self.command(WREN)?;
        self.spi.write(&[WSR, value]).map_err(FlashError::Spi)?;
        self.wait_ready(BUSY_POLL_LIMIT)
    }

    /// Clear the block protection bits so the whole array is writable.
    pub fn unprotect(&mut self) -> Result<(), FlashError<S::Error>> {
        let status = self.read_status()?;
        if status & STATUS_BLOCK_PROTECT != 0 {
            self.write_status(status & !STATUS_BLOCK_PROTECT)?;
        }
        Ok(())
    }

    pub fn write_disable(&mut self) -> Result<(), FlashError<S::Error>> {
        self.command(WRDI)
    }

    fn wait_ready(&mut self, limit: u32) -> Result<(), FlashError<S::Error>> {
        for _ in 0..limit {
            if self.read_status()? & STATUS_BUSY == 0 {
                return Ok(());
            }
        }
        Err(FlashError::Busy)
    }

    pub fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError<S::Error>> {
        if addr > CHIP_CAPACITY || buf.len() > (CHIP_CAPACITY - addr) as usize {
            return Err(FlashError::OutOfRange);
        }
        self.wait_ready(BUSY_POLL_LIMIT)?;
        self.spi
            .transaction(&mut [Operation::Write(&address_bytes(RD, addr)), Operation::Read(buf)])
            .map_err(FlashError::Spi)
    }

    /// Program bytes that must all fall inside one page.
    pub fn program_page(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError<S::Error>> {
        let page_offset = addr as usize % PAGE_SIZE;
        if data.is_empty() || page_offset + data.len() > PAGE_SIZE || addr >= CHIP_CAPACITY {
            return Err(FlashError::OutOfRange);
        }
        self.wait_ready(BUSY_POLL_LIMIT)?;
        self.command(WREN)?;
        self.spi
            .transaction(&mut [Operation::Write(&address_bytes(PP, addr)), Operation::Write(data)])
            .map_err(FlashError::Spi)?;
        self.wait_ready(BUSY_POLL_LIMIT)
    }

    pub fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError<S::Error>> {
        if addr >= CHIP_CAPACITY {
            return Err(FlashError::OutOfRange);
        }
        self.wait_ready(BUSY_POLL_LIMIT)?;
        self.command(WREN)?;
        self.spi.write(&address_bytes(SE, addr)).map_err(FlashError::Spi)?;
        self.wait_ready(BUSY_POLL_LIMIT)
    }

    pub fn erase_chip(&mut self) -> Result<(), FlashError<S::Error>> {
        self.wait_ready(BUSY_POLL_LIMIT)?;
        self.command(WREN)?;
        self.command(CE)?;
        self.wait_ready(CHIP_ERASE_POLL_LIMIT)
    }
}
