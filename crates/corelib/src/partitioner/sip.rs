//! SipHash-1-3 partitioner implementation.

use std::hash::Hasher;

use siphasher::sip::SipHasher13;

use crate::partitioner::traits::Partitioner;
use crate::token::RingToken;

/// SipHash-1-3 partitioner with fixed zero keys.
///
/// Fixed keys keep the hash stable across processes and restarts, which the
/// ring depends on.
#[derive(Clone, Debug)]
pub struct Sip13Partitioner;

impl Partitioner for Sip13Partitioner {
    type TokenType = RingToken;

    fn partition(&self, key: &[u8]) -> Self::TokenType {
        let mut hasher = SipHasher13::new();
        hasher.write(key);
        RingToken(hasher.finish())
    }

    fn name(&self) -> &'static str {
        "Sip13Partitioner"
    }
}
