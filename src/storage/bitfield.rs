//! Fixed-length bitsets in wire order
//!
//! Bit 0 is the most significant bit of byte 0, matching the peer wire
//! protocol's bitfield message.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::TorrentError;

/// A fixed-length bitset
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Bitfield {
    len: usize,
    bits: Vec<u8>,
}

impl Bitfield {
    /// Create an all-clear bitset of `len` bits
    pub fn new(len: usize) -> Self {
        Self {
            len,
            bits: vec![0u8; Self::byte_len(len)],
        }
    }

    /// Number of bytes needed to hold `len` bits
    pub fn byte_len(len: usize) -> usize {
        (len + 7) / 8
    }

    /// Build from wire bytes
    ///
    /// The byte count must be exactly `ceil(len / 8)` and every spare bit
    /// past `len` must be zero.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self> {
        let expected = Self::byte_len(len);
        if bytes.len() != expected {
            return Err(TorrentError::validation_error_with_field(
                format!("bitfield has {} bytes, expected {}", bytes.len(), expected),
                "bitfield"
            ).into());
        }

        let spare = expected * 8 - len;
        if spare > 0 {
            let mask = (1u8 << spare) - 1;
            if bytes[expected - 1] & mask != 0 {
                return Err(TorrentError::validation_error_with_field(
                    "spare bits past the end of the bitfield are set",
                    "bitfield"
                ).into());
            }
        }

        Ok(Self {
            len,
            bits: bytes.to_vec(),
        })
    }

    /// Re-check a bitset that came from an untrusted source (e.g. a state file)
    pub fn validated(self) -> Result<Self> {
        Self::from_bytes(&self.bits, self.len)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Test bit `index`; out-of-range bits read as clear
    pub fn get(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.bits[index / 8] & (0x80 >> (index % 8)) != 0
    }

    pub fn set(&mut self, index: usize) {
        if index < self.len {
            self.bits[index / 8] |= 0x80 >> (index % 8);
        }
    }

    pub fn clear(&mut self, index: usize) {
        if index < self.len {
            self.bits[index / 8] &= !(0x80 >> (index % 8));
        }
    }

    pub fn clear_all(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = 0);
    }

    /// Set every bit in `range`
    pub fn set_range(&mut self, range: std::ops::Range<usize>) {
        for index in range {
            self.set(index);
        }
    }

    /// Clear every bit in `range`
    pub fn clear_range(&mut self, range: std::ops::Range<usize>) {
        for index in range {
            self.clear(index);
        }
    }

    pub fn count_ones(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Whether every bit is set
    pub fn all(&self) -> bool {
        self.count_ones() == self.len
    }

    /// Iterate over the indices of set bits
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| self.get(i))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msb_first_ordering() {
        let mut bits = Bitfield::new(10);
        bits.set(0);
        bits.set(9);
        assert_eq!(bits.as_bytes(), &[0b1000_0000, 0b0100_0000]);
        assert!(bits.get(9));
        assert!(!bits.get(10));
        assert_eq!(bits.count_ones(), 2);
        assert_eq!(bits.iter_ones().collect::<Vec<_>>(), vec![0, 9]);
    }

    #[test]
    fn test_from_bytes_rejects_wrong_length() {
        assert!(Bitfield::from_bytes(&[0xff], 10).is_err());
        assert!(Bitfield::from_bytes(&[0xff, 0xc0, 0x00], 10).is_err());
        assert!(Bitfield::from_bytes(&[0xff, 0xc0], 10).is_ok());
    }

    #[test]
    fn test_from_bytes_rejects_spare_bits() {
        assert!(Bitfield::from_bytes(&[0xff, 0xe0], 10).is_err());
        assert!(Bitfield::from_bytes(&[0xff, 0x01], 10).is_err());
        assert!(Bitfield::from_bytes(&[0xff], 8).unwrap().all());
    }

    #[test]
    fn test_ranges() {
        let mut bits = Bitfield::new(12);
        bits.set_range(2..6);
        assert_eq!(bits.count_ones(), 4);
        bits.clear_range(3..5);
        assert_eq!(bits.iter_ones().collect::<Vec<_>>(), vec![2, 5]);
        bits.clear_all();
        assert_eq!(bits.count_ones(), 0);
    }
}
