//! In-system programming of the subsystem AVRs over their ISP bus.
//!
//! Every ISP instruction is a 4-byte exchange; the target echoes the second
//! byte of `PROGRAM_ENABLE` in the third response byte once it is in sync.

use core::fmt;

use embassy_time::{Duration, Timer};
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiDevice;

use crate::ids::TaskId;
use crate::spimem::{LogStore, MemorySpace, StorageError};
use crate::sync::TrackedMutex;

// -- instruction set
pub const PROGRAM_ENABLE: [u8; 4] = [0xAC, 0x53, 0x00, 0x00];
pub const CHIP_ERASE: [u8; 4] = [0xAC, 0x80, 0x00, 0x00];
pub const READ_SIGNATURE: u8 = 0x30;
pub const LOAD_PAGE_LOW: u8 = 0x40;
pub const LOAD_PAGE_HIGH: u8 = 0x48;
pub const WRITE_PAGE: u8 = 0x4C;
pub const READ_PROG_LOW: u8 = 0x20;
pub const READ_PROG_HIGH: u8 = 0x28;
pub const POLL_READY: u8 = 0xF0;

/// ATmega32M1
pub const EXPECTED_SIGNATURE: [u8; 3] = [0x1E, 0x95, 0x84];
pub const ISP_PAGE_SIZE: usize = 128;
pub const ISP_FLASH_SIZE: u32 = 32 * 1024;
/// Image header in the log store: little-endian byte count.
pub const IMAGE_HEADER_LEN: u32 = 4;

const SYNC_ATTEMPTS: u8 = 3;
const READY_POLLS: u32 = 1_000;
const RESET_SETTLE: Duration = Duration::from_millis(20);
const READY_POLL_DELAY: Duration = Duration::from_micros(100);

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IspError {
    Bus,
    ResetLine,
    NoSync,
    SignatureMismatch([u8; 3]),
    NotReady,
    VerifyFailed { address: u32 },
    InvalidImage,
    StoreBusy,
    Storage(StorageError),
}

impl fmt::Display for IspError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IspError::Bus => write!(f, "isp bus error"),
            IspError::ResetLine => write!(f, "could not drive reset line"),
            IspError::NoSync => write!(f, "target did not enter programming mode"),
            IspError::SignatureMismatch(sig) => write!(f, "unexpected signature {sig:02x?}"),
            IspError::NotReady => write!(f, "target stayed busy"),
            IspError::VerifyFailed { address } => write!(f, "verify failed at {address:#06x}"),
            IspError::InvalidImage => write!(f, "no valid image in store"),
            IspError::StoreBusy => write!(f, "log store lock unavailable"),
            IspError::Storage(e) => write!(f, "image read failed: {e}"),
        }
    }
}

pub struct IspProgrammer<'a, S, P> {
    spi: &'a mut S,
    reset: &'a mut P,
}

impl<'a, S: SpiDevice, P: OutputPin> IspProgrammer<'a, S, P> {
    pub fn new(spi: &'a mut S, reset: &'a mut P) -> Self {
        Self { spi, reset }
    }

    fn transfer(&mut self, cmd: [u8; 4]) -> Result<[u8; 4], IspError> {
        let mut buf = cmd;
        self.spi.transfer_in_place(&mut buf).map_err(|_| IspError::Bus)?;
        Ok(buf)
    }

    /// Hold the target in reset and bring it into programming mode.
    pub async fn enter(&mut self) -> Result<(), IspError> {
        for attempt in 0..SYNC_ATTEMPTS {
            // pulse reset between attempts to resynchronise
            self.reset.set_high().map_err(|_| IspError::ResetLine)?;
            Timer::after(RESET_SETTLE).await;
            self.reset.set_low().map_err(|_| IspError::ResetLine)?;
            Timer::after(RESET_SETTLE).await;

            let resp = self.transfer(PROGRAM_ENABLE)?;
            if resp[2] == PROGRAM_ENABLE[1] {
                return Ok(());
            }
            debug!("isp: no sync on attempt {}", attempt);
        }
        Err(IspError::NoSync)
    }

    /// Release reset so the target boots.
    pub fn leave(&mut self) -> Result<(), IspError> {
        self.reset.set_high().map_err(|_| IspError::ResetLine)
    }

    pub fn read_signature(&mut self) -> Result<[u8; 3], IspError> {
        let mut signature = [0u8; 3];
        for (i, byte) in signature.iter_mut().enumerate() {
            *byte = self.transfer([READ_SIGNATURE, 0x00, i as u8, 0x00])?[3];
        }
        Ok(signature)
    }

    async fn wait_ready(&mut self) -> Result<(), IspError> {
        for _ in 0..READY_POLLS {
            if self.transfer([POLL_READY, 0x00, 0x00, 0x00])?[3] & 0x01 == 0 {
                return Ok(());
            }
            Timer::after(READY_POLL_DELAY).await;
        }
        Err(IspError::NotReady)
    }

    pub async fn chip_erase(&mut self) -> Result<(), IspError> {
        self.transfer(CHIP_ERASE)?;
        self.wait_ready().await
    }

    /// Load one page into the target's buffer and commit it at `byte_addr`.
    pub async fn write_page(&mut self, byte_addr: u32, data: &[u8]) -> Result<(), IspError> {
        for (word, pair) in data.chunks(2).enumerate() {
            self.transfer([LOAD_PAGE_LOW, 0x00, word as u8, pair[0]])?;
            if let Some(high) = pair.get(1) {
                self.transfer([LOAD_PAGE_HIGH, 0x00, word as u8, *high])?;
            }
        }
        let word_addr = byte_addr / 2;
        self.transfer([WRITE_PAGE, (word_addr >> 8) as u8, word_addr as u8, 0x00])?;
        self.wait_ready().await
    }

    pub fn read_byte(&mut self, byte_addr: u32) -> Result<u8, IspError> {
        let word_addr = byte_addr / 2;
        let op = if byte_addr & 1 == 0 { READ_PROG_LOW } else { READ_PROG_HIGH };
        Ok(self.transfer([op, (word_addr >> 8) as u8, word_addr as u8, 0x00])?[3])
    }

    async fn program_image<F: SpiDevice>(
        &mut self,
        store: &TrackedMutex<LogStore<F>>,
        image_base: u32,
        len: u32,
        task: TaskId,
        lock_timeout: Duration,
    ) -> Result<(), IspError> {
        self.enter().await?;
        let signature = self.read_signature()?;
        if signature != EXPECTED_SIGNATURE {
            return Err(IspError::SignatureMismatch(signature));
        }
        self.chip_erase().await?;

        let mut page = [0u8; ISP_PAGE_SIZE];
        let mut offset = 0u32;
        while offset < len {
            let chunk = (len - offset).min(ISP_PAGE_SIZE as u32) as usize;
            store
                .lock_timeout(task, lock_timeout)
                .await
                .map_err(|_| IspError::StoreBusy)?
                .read_space(
                    MemorySpace::Spi,
                    image_base + IMAGE_HEADER_LEN + offset,
                    &mut page[..chunk],
                )
                .map_err(IspError::Storage)?;

            self.write_page(offset, &page[..chunk]).await?;
            for (i, expected) in page[..chunk].iter().enumerate() {
                let address = offset + i as u32;
                if self.read_byte(address)? != *expected {
                    return Err(IspError::VerifyFailed { address });
                }
            }
            offset += chunk as u32;
        }
        Ok(())
    }
}

/// Reprogram a target from the image stored at `image_base` in the SPI
/// array. Reset is released whatever the outcome. Returns the image length.
pub async fn reprogram<S: SpiDevice, P: OutputPin, F: SpiDevice>(
    spi: &mut S,
    reset: &mut P,
    store: &TrackedMutex<LogStore<F>>,
    image_base: u32,
    task: TaskId,
    lock_timeout: Duration,
) -> Result<u32, IspError> {
    let mut header = [0u8; IMAGE_HEADER_LEN as usize];
    store
        .lock_timeout(task, lock_timeout)
        .await
        .map_err(|_| IspError::StoreBusy)?
        .read_space(MemorySpace::Spi, image_base, &mut header)
        .map_err(IspError::Storage)?;
    let len = u32::from_le_bytes(header);
    if len == 0 || len > ISP_FLASH_SIZE {
        return Err(IspError::InvalidImage);
    }

    let mut isp = IspProgrammer::new(spi, reset);
    let result = isp.program_image(store, image_base, len, task, lock_timeout).await;
    let released = isp.leave();
    result.and(released).map(|()| len)
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;

    use super::*;
    use crate::ids::Subsystem;
    use crate::sim::{SimAvr, SimFlash};
    use crate::spimem::ssm_image_base;

    const LOCK_TIMEOUT: Duration = Duration::from_millis(50);

    fn store_with_image(base: u32, image: &[u8]) -> TrackedMutex<LogStore<SimFlash>> {
        let chips = [SimFlash::new(), SimFlash::new(), SimFlash::new()];
        for chip in &chips {
            chip.load(base, &(image.len() as u32).to_le_bytes());
            chip.load(base + IMAGE_HEADER_LEN, image);
        }
        let mut store = LogStore::new(chips);
        store.init().unwrap();
        TrackedMutex::new(store)
    }

    #[test]
    fn reprograms_from_the_stored_image() {
        let base = ssm_image_base(Subsystem::Eps);
        let image: Vec<u8> = (0..300u32).map(|i| (i * 7) as u8).collect();
        let store = store_with_image(base, &image);
        let avr = SimAvr::new();

        let len = block_on(reprogram(
            &mut avr.clone(),
            &mut avr.reset_pin(),
            &store,
            base,
            TaskId::Fdir,
            LOCK_TIMEOUT,
        ));
        assert_eq!(len, Ok(300));
        assert_eq!(avr.flash(0, 300), image);
        assert_eq!(avr.images_programmed(), 1);
        assert!(!store.is_locked());
    }

    #[test]
    fn empty_or_erased_slots_are_not_programmed() {
        let store = store_with_image(ssm_image_base(Subsystem::Coms), &[]);
        let avr = SimAvr::new();
        for sub in [Subsystem::Coms, Subsystem::Payload] {
            let res = block_on(reprogram(
                &mut avr.clone(),
                &mut avr.reset_pin(),
                &store,
                ssm_image_base(sub),
                TaskId::Fdir,
                LOCK_TIMEOUT,
            ));
            assert_eq!(res, Err(IspError::InvalidImage));
        }
        assert_eq!(avr.reset_pulses(), 0);
    }

    #[test]
    fn wrong_target_is_released_untouched() {
        let base = ssm_image_base(Subsystem::Payload);
        let store = store_with_image(base, &[1, 2, 3, 4]);
        let avr = SimAvr::new();
        avr.set_signature([0x1E, 0x95, 0x0F]);

        let res = block_on(reprogram(
            &mut avr.clone(),
            &mut avr.reset_pin(),
            &store,
            base,
            TaskId::Fdir,
            LOCK_TIMEOUT,
        ));
        assert_eq!(res, Err(IspError::SignatureMismatch([0x1E, 0x95, 0x0F])));
        assert_eq!(avr.images_programmed(), 0);
        assert_eq!(avr.reset_pulses(), 1);
    }

    #[test]
    fn dead_target_never_syncs() {
        let base = ssm_image_base(Subsystem::Coms);
        let store = store_with_image(base, &[0xAA; 16]);
        let avr = SimAvr::new();
        avr.set_offline(true);

        let res = block_on(reprogram(
            &mut avr.clone(),
            &mut avr.reset_pin(),
            &store,
            base,
            TaskId::Fdir,
            LOCK_TIMEOUT,
        ));
        assert_eq!(res, Err(IspError::NoSync));
        assert_eq!(avr.images_programmed(), 0);
    }
}
