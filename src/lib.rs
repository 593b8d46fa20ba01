//! Blobber core: verifiable content storage for a decentralized storage node.
//!
//! Two subsystems make up the core. The content store keeps file bytes in a
//! sharded, content-addressed layout with a staged temp → precommit → final
//! write lifecycle and Merkle proof material co-located with the bytes. The
//! reference tree models one allocation's directory hierarchy as a hash tree
//! and is mutated through a closed set of change operations, batched and
//! committed per connection against a persistent metadata store.

pub mod change;
pub mod config;
pub mod connection;
pub mod error;
pub mod hasher;
pub mod logging;
pub mod meta;
pub mod store;
pub mod tree;
pub mod types;

pub use error::{BlobberError, Result};
