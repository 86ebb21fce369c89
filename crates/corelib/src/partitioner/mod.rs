//! Partitioner abstraction for consistent hashing.
//!
//! Partitioners are responsible for converting keys (and virtual node labels)
//! into tokens that can be placed on the hash ring.

pub mod sip;
pub mod traits;
pub mod xxh3;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::token::RingToken;

pub use sip::Sip13Partitioner;
pub use traits::Partitioner;
pub use xxh3::Xxh3Partitioner;

/// Shared, type-erased partitioner producing ring tokens.
pub type SharedPartitioner = Arc<dyn Partitioner<TokenType = RingToken>>;

/// Key hash selectable from configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SipHash-1-3 with zero keys.
    #[default]
    Sip13,
    /// XXH3 64-bit.
    Xxh3,
}

impl HashAlgorithm {
    /// Instantiate the partitioner for this algorithm.
    pub fn partitioner(self) -> SharedPartitioner {
        match self {
            HashAlgorithm::Sip13 => Arc::new(Sip13Partitioner),
            HashAlgorithm::Xxh3 => Arc::new(Xxh3Partitioner),
        }
    }
}
