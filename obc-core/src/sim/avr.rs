//! ATmega32M1 serial programming interface model.

use std::sync::{Arc, Mutex, MutexGuard};

use embedded_hal::digital::{self, OutputPin};
use embedded_hal::spi::{ErrorType, Operation, SpiDevice};

use crate::fdir::isp::{
    CHIP_ERASE, EXPECTED_SIGNATURE, ISP_FLASH_SIZE, ISP_PAGE_SIZE, LOAD_PAGE_HIGH, LOAD_PAGE_LOW,
    POLL_READY, PROGRAM_ENABLE, READ_PROG_HIGH, READ_PROG_LOW, READ_SIGNATURE, WRITE_PAGE,
};

use super::SimSpiError;

struct AvrState {
    flash: Vec<u8>,
    page_buffer: [u8; ISP_PAGE_SIZE],
    in_reset: bool,
    programming: bool,
    offline: bool,
    signature: [u8; 3],
    reset_pulses: u32,
    images: u32,
    pages_written: u32,
}

/// One subsystem micro-controller as seen from its ISP bus.
#[derive(Clone)]
pub struct SimAvr {
    state: Arc<Mutex<AvrState>>,
}

impl Default for SimAvr {
    fn default() -> Self {
        Self::new()
    }
}

impl SimAvr {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(AvrState {
                flash: vec![0xFF; ISP_FLASH_SIZE as usize],
                page_buffer: [0xFF; ISP_PAGE_SIZE],
                in_reset: false,
                programming: false,
                offline: false,
                signature: EXPECTED_SIGNATURE,
                reset_pulses: 0,
                images: 0,
                pages_written: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AvrState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The reset line wired to this target.
    pub fn reset_pin(&self) -> SimResetPin {
        SimResetPin { target: self.clone() }
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn set_signature(&self, signature: [u8; 3]) {
        self.lock().signature = signature;
    }

    /// Completed reset pulses (low then high).
    pub fn reset_pulses(&self) -> u32 {
        self.lock().reset_pulses
    }

    /// Programming sessions that wrote at least one page.
    pub fn images_programmed(&self) -> u32 {
        self.lock().images
    }

    pub fn flash(&self, addr: usize, len: usize) -> Vec<u8> {
        self.lock().flash[addr..addr + len].to_vec()
    }

    fn exchange(st: &mut AvrState, cmd: [u8; 4]) -> [u8; 4] {
        let mut resp = [0, cmd[0], cmd[1], 0];
        if !st.in_reset {
            return [0; 4];
        }
        if !st.programming {
            if cmd[..2] == PROGRAM_ENABLE[..2] {
                st.programming = true;
                resp[2] = PROGRAM_ENABLE[1];
            }
            return resp;
        }
        let word = (cmd[1] as usize) << 8 | cmd[2] as usize;
        match cmd[0] {
            op if [op, cmd[1]] == [PROGRAM_ENABLE[0], PROGRAM_ENABLE[1]] => {
                resp[2] = PROGRAM_ENABLE[1]
            }
            op if [op, cmd[1]] == [CHIP_ERASE[0], CHIP_ERASE[1]] => st.flash.fill(0xFF),
            READ_SIGNATURE => resp[3] = st.signature.get(cmd[2] as usize).copied().unwrap_or(0),
            LOAD_PAGE_LOW | LOAD_PAGE_HIGH => {
                let high = (cmd[0] == LOAD_PAGE_HIGH) as usize;
                let i = (cmd[2] as usize * 2 + high) % ISP_PAGE_SIZE;
                st.page_buffer[i] = cmd[3];
            }
            WRITE_PAGE => {
                let base = (word * 2) % ISP_FLASH_SIZE as usize;
                let base = base - base % ISP_PAGE_SIZE;
                let page = st.page_buffer;
                st.flash[base..base + ISP_PAGE_SIZE].copy_from_slice(&page);
                st.page_buffer = [0xFF; ISP_PAGE_SIZE];
                st.pages_written += 1;
            }
            READ_PROG_LOW | READ_PROG_HIGH => {
                let high = (cmd[0] == READ_PROG_HIGH) as usize;
                resp[3] = st.flash[(word * 2 + high) % ISP_FLASH_SIZE as usize];
            }
            POLL_READY => resp[3] = 0,
            _ => {}
        }
        resp
    }
}

impl ErrorType for SimAvr {
    type Error = SimSpiError;
}

impl SpiDevice for SimAvr {
    fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), Self::Error> {
        let mut st = self.lock();
        for op in operations.iter_mut() {
            match op {
                // a dead target leaves MISO low
                Operation::TransferInPlace(buf) if st.offline => buf.fill(0),
                Operation::TransferInPlace(buf) if buf.len() == 4 => {
                    let cmd = [buf[0], buf[1], buf[2], buf[3]];
                    buf.copy_from_slice(&Self::exchange(&mut st, cmd));
                }
                Operation::DelayNs(_) => {}
                _ => return Err(SimSpiError::Framing),
            }
        }
        Ok(())
    }
}

/// Active-low reset line of a [`SimAvr`].
#[derive(Clone)]
pub struct SimResetPin {
    target: SimAvr,
}

impl digital::ErrorType for SimResetPin {
    type Error = core::convert::Infallible;
}

impl OutputPin for SimResetPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.target.lock().in_reset = true;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        let mut st = self.target.lock();
        if st.in_reset {
            st.reset_pulses += 1;
            if st.pages_written > 0 {
                st.images += 1;
            }
        }
        st.in_reset = false;
        st.programming = false;
        st.pages_written = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(avr: &mut SimAvr, cmd: [u8; 4]) -> [u8; 4] {
        let mut buf = cmd;
        avr.transfer_in_place(&mut buf).unwrap();
        buf
    }

    #[test]
    fn ignores_commands_outside_reset() {
        let mut avr = SimAvr::new();
        assert_eq!(exchange(&mut avr, PROGRAM_ENABLE), [0; 4]);
    }

    #[test]
    fn programs_a_page_in_reset() {
        let mut avr = SimAvr::new();
        let mut reset = avr.reset_pin();
        reset.set_low().unwrap();
        assert_eq!(exchange(&mut avr, PROGRAM_ENABLE)[2], 0x53);
        assert_eq!(exchange(&mut avr, [READ_SIGNATURE, 0, 1, 0])[3], 0x95);

        exchange(&mut avr, [LOAD_PAGE_LOW, 0, 0, 0xAA]);
        exchange(&mut avr, [LOAD_PAGE_HIGH, 0, 0, 0xBB]);
        exchange(&mut avr, [WRITE_PAGE, 0, 64, 0]);
        assert_eq!(exchange(&mut avr, [READ_PROG_HIGH, 0, 64, 0])[3], 0xBB);
        reset.set_high().unwrap();

        assert_eq!(avr.flash(128, 2), [0xAA, 0xBB]);
        assert_eq!(avr.reset_pulses(), 1);
        assert_eq!(avr.images_programmed(), 1);
    }
}
