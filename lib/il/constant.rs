//! A `Constant` holds a single value.
//!
//! Constant values up to 64-bits are supported.

use crate::il::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A constant bit-vector value.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Constant {
    value: u64,
    bits: usize,
}

impl Constant {
    /// Create a new `Constant` with the given value and bitness.
    ///
    /// Bits of `value` above `bits` are discarded.
    pub fn new(value: u64, bits: usize) -> Constant {
        Constant {
            value: Constant::mask(value, bits),
            bits,
        }
    }

    fn mask(value: u64, bits: usize) -> u64 {
        if bits >= 64 {
            value
        } else {
            value & ((1u64 << bits) - 1)
        }
    }

    /// Get the value of this `Constant`.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Get the value of this `Constant`, sign-extended to 64 bits.
    pub fn value_i64(&self) -> i64 {
        if self.bits == 0 || self.bits >= 64 {
            return self.value as i64;
        }
        if self.value & (1 << (self.bits - 1)) != 0 {
            (self.value | (u64::MAX << self.bits)) as i64
        } else {
            self.value as i64
        }
    }

    /// Get the number of bits for this `Constant`.
    pub fn bits(&self) -> usize {
        self.bits
    }

    /// Returns true if this constant is non-zero.
    pub fn is_true(&self) -> bool {
        self.value != 0
    }

    /// Returns true if this constant is zero.
    pub fn is_zero(&self) -> bool {
        self.value == 0
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:X}:{}", self.value, self.bits)
    }
}

impl From<Constant> for Expression {
    fn from(constant: Constant) -> Expression {
        Expression::constant(constant)
    }
}
