//! Fee rate: tarns paid per kilobyte of serialized transaction.
//!
//! The primary market-clearing signal for inclusion priority. Stored as
//! an integer per-kB scalar so rates order exactly and survive
//! serialization without float drift.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fee per 1000 bytes of serialized transaction, in tarns.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct FeeRate(u64);

impl FeeRate {
    /// Zero fee rate; also the "no answer / no floor" marker.
    pub const ZERO: Self = Self(0);

    /// Construct from a raw tarns-per-kilobyte value.
    pub fn from_per_kb(per_kb: u64) -> Self {
        Self(per_kb)
    }

    /// Fee rate of a transaction paying `fee` tarns at `size` serialized bytes.
    ///
    /// Uses a u128 intermediate to prevent overflow for large fees.
    /// A zero size yields the zero rate.
    pub fn from_fee_and_size(fee: u64, size: usize) -> Self {
        if size == 0 {
            return Self::ZERO;
        }
        let per_kb = (fee as u128) * 1000 / (size as u128);
        Self(per_kb.min(u64::MAX as u128) as u64)
    }

    /// The fee this rate implies for a transaction of `size` bytes.
    pub fn fee_for_size(&self, size: usize) -> u64 {
        ((self.0 as u128) * (size as u128) / 1000).min(u64::MAX as u128) as u64
    }

    /// Raw tarns-per-kilobyte value.
    pub fn per_kb(&self) -> u64 {
        self.0
    }

    /// Whether this is the zero rate.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} tarns/kB", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_fee_and_size_basic() {
        // 1000 tarns over 250 bytes = 4000 tarns/kB
        assert_eq!(FeeRate::from_fee_and_size(1000, 250).per_kb(), 4000);
    }

    #[test]
    fn from_fee_and_size_rounds_down() {
        assert_eq!(FeeRate::from_fee_and_size(999, 1000).per_kb(), 999);
        assert_eq!(FeeRate::from_fee_and_size(1, 3000).per_kb(), 0);
    }

    #[test]
    fn zero_size_is_zero_rate() {
        assert_eq!(FeeRate::from_fee_and_size(1000, 0), FeeRate::ZERO);
    }

    #[test]
    fn large_fee_does_not_overflow() {
        let rate = FeeRate::from_fee_and_size(u64::MAX, 1);
        assert_eq!(rate.per_kb(), u64::MAX);
    }

    #[test]
    fn fee_for_size_inverts() {
        let rate = FeeRate::from_per_kb(4000);
        assert_eq!(rate.fee_for_size(250), 1000);
        assert_eq!(rate.fee_for_size(1000), 4000);
    }

    #[test]
    fn ordering_follows_per_kb() {
        assert!(FeeRate::from_per_kb(1) > FeeRate::ZERO);
        assert!(FeeRate::from_per_kb(999) < FeeRate::from_per_kb(1000));
    }

    #[test]
    fn display_mentions_unit() {
        assert_eq!(format!("{}", FeeRate::from_per_kb(42)), "42 tarns/kB");
    }
}
