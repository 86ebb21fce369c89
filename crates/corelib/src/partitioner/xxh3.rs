//! XXH3 partitioner implementation.

use xxhash_rust::xxh3::xxh3_64;

use crate::partitioner::traits::Partitioner;
use crate::token::RingToken;

/// XXH3 (64-bit) partitioner.
#[derive(Clone, Debug)]
pub struct Xxh3Partitioner;

impl Partitioner for Xxh3Partitioner {
    type TokenType = RingToken;

    fn partition(&self, key: &[u8]) -> Self::TokenType {
        RingToken(xxh3_64(key))
    }

    fn name(&self) -> &'static str {
        "Xxh3Partitioner"
    }
}
