//! Consistent hash ring implementation.
//!
//! The ring manages token positions and provides efficient lookup
//! operations for finding nodes responsible for keys. A ring is never mutated
//! once published; topology changes build a new ring.

pub mod ring;
pub mod sequence;

pub use ring::{HashRing, RingBuilder, DEFAULT_VNODES};
pub use sequence::Sequence;

/// Alias for the main ring type (used by lib.rs).
pub type Ring = HashRing;
