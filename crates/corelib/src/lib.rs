//! Core library for the cache client's key routing.
//!
//! This crate provides the pure data structures the connection engine routes
//! with. Nothing in here performs I/O:
//! - Ring tokens and partitioners (key hashing)
//! - Node identity and virtual nodes
//! - The immutable, copy-on-update hash ring
//! - Node locators, including the two-ring locator used during live migration

pub mod error;
pub mod locator;
pub mod node;
pub mod partitioner;
pub mod ring;
pub mod token;
pub mod topology;
pub mod vnode;

pub use error::{Error, Result};
pub use locator::{KetamaLocator, NodeLocator};
pub use node::{Node, NodeId};
pub use partitioner::{HashAlgorithm, Partitioner};
pub use ring::{HashRing, Ring, RingBuilder, Sequence};
pub use token::{RingToken, Token};
pub use topology::{MigrationKind, MigrationLocator, MigrationTopology};
pub use vnode::VirtualNode;
