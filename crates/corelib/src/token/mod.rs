//! Token abstraction module for consistent hashing.
//!
//! Tokens represent positions on the hash ring and must be comparable,
//! hashable, and thread-safe.

pub mod ring_token;
pub mod traits;

pub use ring_token::RingToken;
pub use traits::Token;
