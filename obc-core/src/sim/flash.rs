//! SPI NOR flash model that decodes the command set on the wire.

use std::sync::{Arc, Mutex, MutexGuard};

use embedded_hal::spi::{self, ErrorType, Operation, SpiDevice};

use crate::spimem::chip::{CE, PP, RD, RSR, SE, STATUS_BUSY, STATUS_WEL, WRDI, WREN, WSR};
use crate::spimem::{CHIP_CAPACITY, PAGE_SIZE, SECTOR_SIZE};

use super::SimSpiError;

struct FlashState {
    array: Vec<u8>,
    status: u8,
    write_enabled: bool,
    offline: bool,
    stuck_busy: bool,
    write_protected: bool,
    page_programs: u32,
    sector_erases: u32,
}

/// Cloneable handle to one simulated chip. Clones share the array, so a test
/// keeps a handle for fault injection after the store took ownership.
#[derive(Clone)]
pub struct SimFlash {
    state: Arc<Mutex<FlashState>>,
}

impl Default for SimFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl SimFlash {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FlashState {
                array: vec![0xFF; CHIP_CAPACITY as usize],
                status: 0,
                write_enabled: false,
                offline: false,
                stuck_busy: false,
                write_protected: false,
                page_programs: 0,
                sector_erases: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FlashState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Chip stops answering on the bus.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Status register reports busy forever.
    pub fn set_stuck_busy(&self, busy: bool) {
        self.lock().stuck_busy = busy;
    }

    /// Page programs are accepted on the bus but never reach the array.
    pub fn set_write_protected(&self, protected: bool) {
        self.lock().write_protected = protected;
    }

    /// Flip a byte behind the driver's back.
    pub fn corrupt(&self, addr: u32, value: u8) {
        self.lock().array[addr as usize] = value;
    }

    pub fn peek(&self, addr: u32, len: usize) -> Vec<u8> {
        self.lock().array[addr as usize..addr as usize + len].to_vec()
    }

    /// Place bytes directly into the array, as a ground upload would have.
    pub fn load(&self, addr: u32, bytes: &[u8]) {
        self.lock().array[addr as usize..addr as usize + bytes.len()].copy_from_slice(bytes);
    }

    pub fn page_programs(&self) -> u32 {
        self.lock().page_programs
    }

    pub fn sector_erases(&self) -> u32 {
        self.lock().sector_erases
    }
}

fn address(cmd: &[u8]) -> Result<usize, SimSpiError> {
    if cmd.len() < 4 {
        return Err(SimSpiError::Framing);
    }
    let addr = (cmd[1] as usize) << 16 | (cmd[2] as usize) << 8 | cmd[3] as usize;
    Ok(addr % CHIP_CAPACITY as usize)
}

impl ErrorType for SimFlash {
    type Error = SimSpiError;
}

impl SpiDevice for SimFlash {
    fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), Self::Error> {
        let mut st = self.lock();
        if st.offline {
            return Err(SimSpiError::NoResponse);
        }
        let (first, rest) = operations.split_first_mut().ok_or(SimSpiError::Framing)?;
        let cmd: &[u8] = match first {
            Operation::Write(cmd) if !cmd.is_empty() => *cmd,
            _ => return Err(SimSpiError::Framing),
        };

        match cmd[0] {
            WREN => st.write_enabled = true,
            WRDI => st.write_enabled = false,
            RSR => {
                let status = st.status
                    | if st.write_enabled { STATUS_WEL } else { 0 }
                    | if st.stuck_busy { STATUS_BUSY } else { 0 };
                if let Some(Operation::Read(buf)) = rest.first_mut() {
                    buf.fill(status);
                }
            }
            WSR => {
                if st.write_enabled {
                    st.status = cmd.get(1).copied().unwrap_or(0) & !(STATUS_BUSY | STATUS_WEL);
                }
                st.write_enabled = false;
            }
            RD => {
                let mut addr = address(cmd)?;
                for op in rest.iter_mut() {
                    if let Operation::Read(buf) = op {
                        for byte in buf.iter_mut() {
                            *byte = st.array[addr];
                            addr = (addr + 1) % CHIP_CAPACITY as usize;
                        }
                    }
                }
            }
            PP => {
                let addr = address(cmd)?;
                let page_base = addr - addr % PAGE_SIZE;
                if st.write_enabled && !st.write_protected {
                    let mut column = addr % PAGE_SIZE;
                    let inline = &cmd[4..];
                    let mut program = |st: &mut FlashState, data: &[u8]| {
                        for b in data {
                            // programming only clears bits, wrapping inside the page
                            st.array[page_base + column] &= *b;
                            column = (column + 1) % PAGE_SIZE;
                        }
                    };
                    program(&mut *st, inline);
                    for op in rest.iter() {
                        if let Operation::Write(data) = op {
                            program(&mut *st, data);
                        }
                    }
                }
                if st.write_enabled {
                    st.page_programs += 1;
                }
                st.write_enabled = false;
            }
            SE => {
                let addr = address(cmd)?;
                if st.write_enabled {
                    let base = addr - addr % SECTOR_SIZE;
                    st.array[base..base + SECTOR_SIZE].fill(0xFF);
                    st.sector_erases += 1;
                }
                st.write_enabled = false;
            }
            CE => {
                if st.write_enabled {
                    st.array.fill(0xFF);
                }
                st.write_enabled = false;
            }
            _ => return Err(SimSpiError::Framing),
        }
        Ok(())
    }
}

impl spi::Error for SimSpiError {
    fn kind(&self) -> spi::ErrorKind {
        spi::ErrorKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spimem::SpiFlash;

    #[test]
    fn program_needs_write_enable_and_only_clears_bits() {
        let chip = SimFlash::new();
        let mut spi = chip.clone();
        spi.write(&[PP, 0, 0, 0, 0x0F]).unwrap();
        assert_eq!(chip.peek(0, 1), [0xFF]);

        let mut flash = SpiFlash::new(chip.clone());
        flash.program_page(0, &[0xF0]).unwrap();
        flash.program_page(0, &[0x3C]).unwrap();
        assert_eq!(chip.peek(0, 1), [0x30]);
        flash.erase_sector(0).unwrap();
        assert_eq!(chip.peek(0, 1), [0xFF]);
    }

    #[test]
    fn program_wraps_within_the_page() {
        let chip = SimFlash::new();
        let mut spi = chip.clone();
        spi.write(&[WREN]).unwrap();
        spi.write(&[PP, 0x00, 0x01, 0xFF, 0x11, 0x22]).unwrap();
        assert_eq!(chip.peek(0x1FF, 1), [0x11]);
        assert_eq!(chip.peek(0x100, 1), [0x22]);
        assert_eq!(chip.peek(0x200, 1), [0xFF]);
    }
}
