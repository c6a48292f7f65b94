//! Inclusive stripe ranges.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An inclusive `[first, last]` range of stripe numbers.
///
/// `first == u64::MAX` marks an unset region. Queue ordering compares raw
/// bounds, so the sentinel is kept instead of an `Option`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StripeRegion {
    /// First stripe in the range.
    pub first: u64,
    /// Last stripe in the range.
    pub last: u64,
}

impl StripeRegion {
    /// Sentinel for an unset region.
    pub const INVALID: StripeRegion = StripeRegion {
        first: u64::MAX,
        last: u64::MAX,
    };

    /// Builds a region from inclusive bounds.
    pub fn new(first: u64, last: u64) -> Self {
        Self { first, last }
    }

    /// Builds a region from a start stripe and a stripe count.
    pub fn from_count(first: u64, count: u64) -> Self {
        Self {
            first,
            last: first.saturating_add(count.saturating_sub(1)),
        }
    }

    /// Returns true unless this is the unset sentinel.
    pub fn is_valid(&self) -> bool {
        self.first != u64::MAX
    }

    /// Number of stripes covered, zero for the sentinel.
    pub fn len(&self) -> u64 {
        if !self.is_valid() || self.last < self.first {
            return 0;
        }
        self.last - self.first + 1
    }

    /// Returns true when the region covers no stripes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true when the ranges share at least one stripe.
    ///
    /// An unset receiver never overlaps. An unset argument never overlaps
    /// either because its sentinel bounds sit above every real stripe.
    pub fn overlaps(&self, other: &StripeRegion) -> bool {
        if !self.is_valid() {
            return false;
        }
        if self.first > other.last {
            return false;
        }
        if other.first > self.last {
            return false;
        }
        true
    }

    /// Returns true when `stripe` lies within the range.
    pub fn contains(&self, stripe: u64) -> bool {
        self.is_valid() && stripe >= self.first && stripe <= self.last
    }

    /// Widens the range to cover `other`. An unset range becomes `other`.
    pub fn widen_to(&mut self, other: &StripeRegion) {
        if !self.is_valid() {
            *self = *other;
            return;
        }
        if other.first < self.first {
            self.first = other.first;
        }
        if other.last > self.last {
            self.last = other.last;
        }
    }
}

impl Default for StripeRegion {
    fn default() -> Self {
        StripeRegion::INVALID
    }
}

impl fmt::Debug for StripeRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "[{:#x}..={:#x}]", self.first, self.last)
        } else {
            write!(f, "[invalid]")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap_basic() {
        let a = StripeRegion::new(100, 110);
        assert!(a.overlaps(&StripeRegion::new(105, 115)));
        assert!(a.overlaps(&StripeRegion::new(110, 110)));
        assert!(!a.overlaps(&StripeRegion::new(111, 120)));
        assert!(!a.overlaps(&StripeRegion::new(0, 99)));
    }

    #[test]
    fn test_invalid_never_overlaps() {
        let a = StripeRegion::new(0, 10);
        assert!(!StripeRegion::INVALID.overlaps(&a));
        assert!(!a.overlaps(&StripeRegion::INVALID));
    }

    #[test]
    fn test_widen_from_invalid() {
        let mut r = StripeRegion::INVALID;
        r.widen_to(&StripeRegion::new(5, 6));
        assert_eq!(r, StripeRegion::new(5, 6));
        r.widen_to(&StripeRegion::new(2, 3));
        assert_eq!(r, StripeRegion::new(2, 6));
        r.widen_to(&StripeRegion::new(4, 9));
        assert_eq!(r, StripeRegion::new(2, 9));
    }

    #[test]
    fn test_from_count_and_len() {
        let r = StripeRegion::from_count(10, 4);
        assert_eq!(r, StripeRegion::new(10, 13));
        assert_eq!(r.len(), 4);
        assert_eq!(StripeRegion::INVALID.len(), 0);
        assert!(StripeRegion::INVALID.is_empty());
    }

    #[test]
    fn test_contains() {
        let r = StripeRegion::new(3, 5);
        assert!(r.contains(3));
        assert!(r.contains(5));
        assert!(!r.contains(6));
        assert!(!StripeRegion::INVALID.contains(u64::MAX));
    }
}
