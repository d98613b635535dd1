//! Branch mesh core library
//!
//! Identity handling, allocator-free tunnel addressing, and the topology
//! types that gossip exchanges between branches.
//!
//! # Modules
//!
//! - [`identity`]: 32-byte node identity and its text forms
//! - [`address`]: global and link-local address derivation
//! - [`topology`]: snapshot types and the link capability trait
//! - [`error`]: Error types

pub mod address;
pub mod error;
pub mod identity;
pub mod topology;

#[cfg(test)]
mod test_vectors;

pub use address::{global_address, link_local_pair, mesh_network, AddressError, LinkLocalPair};
pub use error::{Error, Result};
pub use identity::{Identity, IdentityError, IDENTITY_LEN, IDENTITY_TEXT_LEN};
pub use topology::*;
