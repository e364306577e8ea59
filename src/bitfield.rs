//! A fixed size bit vector tracking piece availability.
//!
//! It is a compact bool vector of most significant bits to least significant
//! bits, that is, where the first highest bit represents the first piece, the
//! second highest element the second piece, and so on (e.g. `0b1100_0001`
//! would mean that we have pieces 0, 1, and 7). A truthy boolean value of a
//! piece's position in this vector means that the peer has the piece, while a
//! falsy value means it doesn't have the piece.
//!
//! The raw bytes sent over the wire may describe more bits than the torrent
//! has pieces if the piece count is not a multiple of 8; such spare bits must
//! be zero and [`Bitfield::replace`] rejects payloads where they are not.

use bitvec::prelude::{BitVec, Msb0};

use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitfield {
    bits: BitVec<u8, Msb0>,
}

impl Bitfield {
    /// Creates an all-zero bitfield of the given number of bits.
    pub fn new(len: usize) -> Self {
        let mut bits = BitVec::with_capacity(len);
        bits.resize(len, false);
        Self { bits }
    }

    /// Creates a bitfield from raw wire bytes, validating the byte count and
    /// the spare bits of the last byte.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self> {
        let mut bitfield = Self::new(len);
        bitfield.replace(bytes)?;
        Ok(bitfield)
    }

    /// The number of defined bits.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Replaces the contents with the given raw bytes.
    ///
    /// The byte count must be exactly the number of bytes backing the
    /// bitfield and any bits past the defined length must be zero.
    pub fn replace(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != (self.len() + 7) / 8 {
            return Err(Error::InvalidBitfield("wrong byte count"));
        }
        let spare = self.len() % 8;
        if spare != 0 && bytes[bytes.len() - 1] & (0xff >> spare) != 0 {
            return Err(Error::InvalidBitfield("nonzero spare bits"));
        }

        let len = self.len();
        let mut bits = BitVec::from_slice(bytes);
        bits.truncate(len);
        self.bits = bits;
        Ok(())
    }

    /// The raw bytes as they would appear on the wire. Spare bits of the last
    /// byte are always zero.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bits = self.bits.clone();
        bits.set_uninitialized(false);
        bits.into_vec()
    }

    pub fn set(&mut self, index: usize) -> Result<()> {
        let mut bit = self
            .bits
            .get_mut(index)
            .ok_or(Error::InvalidPieceIndex(index))?;
        *bit = true;
        Ok(())
    }

    pub fn clear(&mut self, index: usize) -> Result<()> {
        let mut bit = self
            .bits
            .get_mut(index)
            .ok_or(Error::InvalidPieceIndex(index))?;
        *bit = false;
        Ok(())
    }

    pub fn get(&self, index: usize) -> Result<bool> {
        self.bits
            .get(index)
            .map(|bit| *bit)
            .ok_or(Error::InvalidPieceIndex(index))
    }

    /// Returns true if no bit is set.
    pub fn none(&self) -> bool {
        self.bits.not_any()
    }

    /// Returns true if every defined bit is set.
    pub fn all(&self) -> bool {
        self.bits.all()
    }

    pub fn count_ones(&self) -> usize {
        self.bits.count_ones()
    }

    /// Returns the bits set in `self` but not in `other` (self AND NOT
    /// other). Both bitfields must be of the same length.
    pub fn difference(&self, other: &Self) -> Self {
        debug_assert_eq!(self.len(), other.len());
        let mut bits = self.bits.clone();
        for (mut bit, theirs) in bits.iter_mut().zip(other.bits.iter()) {
            *bit = *bit && !*theirs;
        }
        Self { bits }
    }

    /// Returns true if `self` has any bit set that `other` doesn't have.
    pub fn has_any_missing_from(&self, other: &Self) -> bool {
        debug_assert_eq!(self.len(), other.len());
        self.bits
            .iter()
            .zip(other.bits.iter())
            .any(|(ours, theirs)| *ours && !*theirs)
    }

    /// Iterates over all defined bits in index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, bool)> + '_ {
        self.bits.iter().by_vals().enumerate()
    }
}
