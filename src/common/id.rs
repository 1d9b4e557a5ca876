//! Kademlia node Id or a lookup target
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The size of node IDs in bits.
pub const ID_BITS: u8 = ID_SIZE as u8 * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash, Serialize, Deserialize)]
/// Kademlia node Id or a lookup target
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp.copy_from_slice(bytes);

        Ok(Id(tmp))
    }

    /// XOR distance between this Id and another Id.
    ///
    /// Distance to self is zero, and `a.distance(b) == b.distance(a)`.
    pub fn distance(&self, other: &Id) -> Distance {
        let mut xor = [0_u8; ID_SIZE];

        for (i, byte) in xor.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Distance(xor)
    }

    /// Compare `a` and `b` by their distance to `self` as a target.
    pub fn cmp_distance(&self, a: &Id, b: &Id) -> Ordering {
        self.distance(a).cmp(&self.distance(b))
    }

    /// Return whichever of `a` and `b` is closer to `self` as a target.
    ///
    /// Distances only tie when `a == b`, in which case `a` is returned.
    pub fn closer<'a>(&self, a: &'a Id, b: &'a Id) -> &'a Id {
        match self.cmp_distance(a, b) {
            Ordering::Greater => b,
            _ => a,
        }
    }

    /// The id at `distance` from this one.
    pub fn at_distance(&self, distance: &Distance) -> Id {
        Id(self.distance(&Id(distance.0)).0)
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        if s.len() != ID_SIZE * 2 || !s.is_ascii() {
            return Err(Error::InvalidIdEncoding(s.to_string()));
        }

        let mut bytes = [0_u8; ID_SIZE];

        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidIdEncoding(s.to_string()))?;
        }

        Ok(Id(bytes))
    }
}

impl TryFrom<&[u8]> for Id {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Id> {
        Id::from_bytes(bytes)
    }
}

/// XOR of two [Id]s, ordered as a 160 bit unsigned integer.
#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
pub struct Distance(pub [u8; ID_SIZE]);

impl Distance {
    pub const ZERO: Distance = Distance([0; ID_SIZE]);

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Index (0..160) of the most significant set bit.
    ///
    /// Fails with [Error::InvalidDistance] for a zero distance, which only
    /// happens when comparing an id with itself.
    pub fn bucket_index(&self) -> Result<u8> {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                let byte_index = (ID_SIZE - 1 - i) as u8;
                let bit = 7 - byte.leading_zeros() as u8;

                return Ok(byte_index * 8 + bit);
            }
        }

        Err(Error::InvalidDistance)
    }

    /// Whether bit `index` is set, counting from the least significant bit.
    pub fn bit(&self, index: u8) -> bool {
        let (byte, mask) = bit_position(index);

        self.0[byte] & mask != 0
    }

    pub(crate) fn set_bit(&mut self, index: u8) {
        let (byte, mask) = bit_position(index);

        self.0[byte] |= mask;
    }

    /// Zero every bit at or above `index`.
    pub(crate) fn truncate_bits(&mut self, index: u8) {
        for i in index..ID_BITS {
            let (byte, mask) = bit_position(i);
            self.0[byte] &= !mask;
        }
    }

    /// Bitwise or, the upper bound of Kademlia's triangle inequality.
    pub fn or(&self, other: &Distance) -> Distance {
        let mut out = [0_u8; ID_SIZE];

        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] | other.0[i];
        }

        Distance(out)
    }
}

fn bit_position(index: u8) -> (usize, u8) {
    debug_assert!(index < ID_BITS);

    (ID_SIZE - 1 - (index / 8) as usize, 1 << (index % 8))
}

impl Debug for Distance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Distance(")?;
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}
