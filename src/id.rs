use std::cmp::Ordering;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitXor, Not, Shl, Shr};

use rand::Rng as _;

/// Width of a peer identifier in bytes.
pub const PEER_ID_LEN: usize = 16;
/// Width of a one-time broadcast tag in bytes.
pub const BROADCAST_TAG_LEN: usize = 32;

/// A node's address in the XOR distance space.
pub type PeerId = Uid<PEER_ID_LEN>;
/// One-time identifier deduplicating broadcast floods.
pub type BroadcastTag = Uid<BROADCAST_TAG_LEN>;

/// Fixed-width unsigned integer stored as raw bytes.
///
/// Byte 0 is least significant; comparison and shifts treat the whole
/// sequence as one unsigned integer with byte `N - 1` most significant.
/// Identifier widths routinely exceed native integer sizes, so all
/// arithmetic is done byte-wise.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Uid<const N: usize>(pub [u8; N]);

impl<const N: usize> Uid<N> {
    pub const fn zero() -> Self {
        Self([0u8; N])
    }

    pub const fn one() -> Self {
        let mut bytes = [0u8; N];
        bytes[0] = 1;
        Self(bytes)
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; N];
        rand::rng().fill(&mut bytes);
        Self(bytes)
    }

    /// Lossy conversion: copies up to `N` bytes and zero-pads the rest.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut id = [0u8; N];
        let len = bytes.len().min(N);
        id[..len].copy_from_slice(&bytes[..len]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Index of the highest set bit, `-1` for zero.
    pub fn highest_bit(&self) -> i32 {
        for i in (0..N).rev() {
            if self.0[i] != 0 {
                return (i * 8) as i32 + 7 - self.0[i].leading_zeros() as i32;
            }
        }
        -1
    }

    /// Parses a hex prefix into the most significant bytes, e.g. the
    /// `@ab12` addressing shorthand. Non-hex characters end the prefix.
    pub fn from_hex_prefix(s: &str) -> Self {
        let mut id = [0u8; N];
        for (i, c) in s.chars().enumerate() {
            let Some(value) = c.to_digit(16) else {
                break;
            };
            if i / 2 >= N {
                break;
            }
            let byte = N - 1 - i / 2;
            id[byte] |= (value as u8) << if i % 2 == 0 { 4 } else { 0 };
        }
        Self(id)
    }
}

impl<const N: usize> Default for Uid<N> {
    fn default() -> Self {
        Self::zero()
    }
}

impl<const N: usize> Ord for Uid<N> {
    fn cmp(&self, other: &Self) -> Ordering {
        for i in (0..N).rev() {
            match self.0[i].cmp(&other.0[i]) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl<const N: usize> PartialOrd for Uid<N> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<const N: usize> BitXor for Uid<N> {
    type Output = Self;

    fn bitxor(self, rhs: Self) -> Self {
        let mut out = [0u8; N];
        for i in 0..N {
            out[i] = self.0[i] ^ rhs.0[i];
        }
        Self(out)
    }
}

impl<const N: usize> BitAnd for Uid<N> {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        let mut out = [0u8; N];
        for i in 0..N {
            out[i] = self.0[i] & rhs.0[i];
        }
        Self(out)
    }
}

impl<const N: usize> BitOr for Uid<N> {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        let mut out = [0u8; N];
        for i in 0..N {
            out[i] = self.0[i] | rhs.0[i];
        }
        Self(out)
    }
}

impl<const N: usize> Not for Uid<N> {
    type Output = Self;

    fn not(self) -> Self {
        let mut out = [0u8; N];
        for i in 0..N {
            out[i] = !self.0[i];
        }
        Self(out)
    }
}

impl<const N: usize> Shl<u32> for Uid<N> {
    type Output = Self;

    fn shl(self, shift: u32) -> Self {
        let byte_shift = (shift / 8) as usize;
        let bit_shift = shift % 8;
        let mut out = [0u8; N];
        for i in 0..N {
            if i < byte_shift {
                continue;
            }
            let src = i - byte_shift;
            if bit_shift == 0 {
                out[i] = self.0[src];
            } else {
                out[i] = self.0[src] << bit_shift;
                if src > 0 {
                    out[i] |= self.0[src - 1] >> (8 - bit_shift);
                }
            }
        }
        Self(out)
    }
}

impl<const N: usize> Shr<u32> for Uid<N> {
    type Output = Self;

    fn shr(self, shift: u32) -> Self {
        let byte_shift = (shift / 8) as usize;
        let bit_shift = shift % 8;
        let mut out = [0u8; N];
        for i in 0..N {
            let src = i + byte_shift;
            if src >= N {
                break;
            }
            if bit_shift == 0 {
                out[i] = self.0[src];
            } else {
                out[i] = self.0[src] >> bit_shift;
                if src + 1 < N {
                    out[i] |= self.0[src + 1] << (8 - bit_shift);
                }
            }
        }
        Self(out)
    }
}

impl<const N: usize> fmt::Display for Uid<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().rev() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl<const N: usize> fmt::Debug for Uid<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({:02x}{:02x}..)", self.0[N - 1], self.0[N - 2])
    }
}
