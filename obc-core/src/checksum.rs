//! Fletcher checksums used for memory verification and ground checksum requests.

use embedded_hal::spi::SpiDevice;

use crate::spimem::{LogStore, MemorySpace, PAGE_SIZE, StorageError};

const MOD16: u16 = 255;
const MOD32: u32 = 65_535;
const MOD64: u64 = 0xFFFF_FFFF;

/// Fletcher-16 over bytes.
pub fn fletcher16(data: &[u8]) -> u16 {
    let (mut sum1, mut sum2) = (0u16, 0u16);
    for &byte in data {
        sum1 = (sum1 + byte as u16) % MOD16;
        sum2 = (sum2 + sum1) % MOD16;
    }
    (sum2 << 8) | sum1
}

/// Fletcher-32 over little-endian 16 bit words, odd tail zero padded.
pub fn fletcher32(data: &[u8]) -> u32 {
    let (mut sum1, mut sum2) = (0u32, 0u32);
    for word in data.chunks(2) {
        let mut raw = [0u8; 2];
        raw[..word.len()].copy_from_slice(word);
        sum1 = (sum1 + u16::from_le_bytes(raw) as u32) % MOD32;
        sum2 = (sum2 + sum1) % MOD32;
    }
    (sum2 << 16) | sum1
}

/// Fletcher-64 over a single buffer.
pub fn fletcher64(data: &[u8]) -> u64 {
    let mut sum = Fletcher64::new();
    sum.update(data);
    sum.finish()
}

/// Incremental Fletcher-64 state.
///
/// Feeding a buffer in arbitrary pieces gives the same result as
/// [`fletcher64`] over the concatenation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fletcher64 {
    sum1: u64,
    sum2: u64,
    pending: [u8; 4],
    pending_len: usize,
}

impl Fletcher64 {
    pub const fn new() -> Self {
        Self {
            sum1: 0,
            sum2: 0,
            pending: [0; 4],
            pending_len: 0,
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        if self.pending_len > 0 {
            let take = (4 - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];
            if self.pending_len < 4 {
                return;
            }
            self.add_word(u32::from_le_bytes(self.pending));
            self.pending_len = 0;
        }

        let mut words = data.chunks_exact(4);
        for word in &mut words {
            self.add_word(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
        }
        let tail = words.remainder();
        self.pending[..tail.len()].copy_from_slice(tail);
        self.pending_len = tail.len();
    }

    pub fn finish(mut self) -> u64 {
        if self.pending_len > 0 {
            self.pending[self.pending_len..].fill(0);
            self.add_word(u32::from_le_bytes(self.pending));
        }
        (self.sum2 << 32) | self.sum1
    }

    fn add_word(&mut self, word: u32) {
        self.sum1 = (self.sum1 + word as u64) % MOD64;
        self.sum2 = (self.sum2 + self.sum1) % MOD64;
    }
}

/// Fletcher-64 of `len` bytes starting at `base` in the active backend.
pub fn fletcher64_over_store<S: SpiDevice>(
    store: &mut LogStore<S>,
    base: u32,
    len: u32,
) -> Result<u64, StorageError> {
    let space = store.active_space();
    fletcher64_over_space(store, space, base, len)
}

/// Fletcher-64 of a range in an explicit memory space, read page by page.
pub fn fletcher64_over_space<S: SpiDevice>(
    store: &mut LogStore<S>,
    space: MemorySpace,
    base: u32,
    len: u32,
) -> Result<u64, StorageError> {
    let mut sum = Fletcher64::new();
    let mut page = [0u8; PAGE_SIZE];
    let mut done = 0u32;
    while done < len {
        let chunk = (len - done).min(PAGE_SIZE as u32) as usize;
        let addr = base.checked_add(done).ok_or(StorageError::InvalidAddress)?;
        store.read_space(space, addr, &mut page[..chunk])?;
        sum.update(&page[..chunk]);
        done += chunk as u32;
    }
    Ok(sum.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_zero() {
        assert_eq!(fletcher16(&[]), 0);
        assert_eq!(fletcher32(&[]), 0);
        assert_eq!(fletcher64(&[]), 0);
    }

    #[test]
    fn known_vectors() {
        assert_eq!(fletcher16(b"abcde"), 0xC8F0);
        assert_eq!(fletcher16(b"abcdef"), 0x2057);
        assert_eq!(fletcher16(b"abcdefgh"), 0x0627);

        assert_eq!(fletcher32(b"abcde"), 0xF04F_C729);
        assert_eq!(fletcher32(b"abcdef"), 0x5650_2D2A);
        assert_eq!(fletcher32(b"abcdefgh"), 0xEBE1_9591);

        assert_eq!(fletcher64(b"abcde"), 0xC8C6_C527_6463_62C6);
        assert_eq!(fletcher64(b"abcdef"), 0xC8C7_2B27_6463_C8C6);
        assert_eq!(fletcher64(b"abcdefgh"), 0x312E_2B28_CCCA_C8C6);
    }

    #[test]
    fn incremental_matches_one_shot() {
        let data: [u8; 37] = core::array::from_fn(|i| (i as u8).wrapping_mul(31).wrapping_add(7));
        let expected = fletcher64(&data);
        for split in [1, 3, 4, 5, 17, 36] {
            let mut sum = Fletcher64::new();
            let (a, b) = data.split_at(split);
            for piece in a.chunks(3) {
                sum.update(piece);
            }
            sum.update(b);
            assert_eq!(sum.finish(), expected, "split at {split}");
        }
    }

    #[test]
    fn deterministic() {
        let data = [0xA5u8; 300];
        assert_eq!(fletcher64(&data), fletcher64(&data));
        assert_ne!(fletcher64(&data[..299]), fletcher64(&data));
    }
}
