//! 64-bit ring position.

use crate::token::traits::Token;

/// Position on the ring, as produced by a [`Partitioner`](crate::Partitioner).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct RingToken(pub u64);

impl Token for RingToken {
    fn zero() -> Self {
        RingToken(0)
    }

    fn max() -> Self {
        RingToken(u64::MAX)
    }

    fn is_zero(&self) -> bool {
        self.0 == 0
    }

    fn is_max(&self) -> bool {
        self.0 == u64::MAX
    }

    fn distance_to(&self, other: &Self) -> Self {
        RingToken(other.0.wrapping_sub(self.0))
    }
}

impl RingToken {
    /// True if `self` lies on the clockwise arc `(start, end]`.
    ///
    /// When `start == end` the arc is the whole ring.
    pub fn within(&self, start: RingToken, end: RingToken) -> bool {
        if start == end {
            return true;
        }
        let offset = start.distance_to(self).0;
        offset != 0 && offset <= start.distance_to(&end).0
    }
}
