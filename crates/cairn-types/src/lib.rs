//! Foundation types for Cairn.
//!
//! This crate provides the identity and addressing types shared by every other
//! Cairn crate. Nothing here performs I/O.
//!
//! # Key Types
//!
//! - [`IoHash`] -- Content hash (BLAKE3) identifying a node
//! - [`NodeHasher`] -- Domain-separated hashing of node payloads and references
//! - [`BlobLocator`] -- Opaque backend address, optionally with a fragment
//! - [`LocatorFragment`] -- Parsed fragment selecting an export inside a bundle
//! - [`RefName`] -- Validated name of a ref or alias

pub mod error;
pub mod hash;
pub mod locator;
pub mod refs;

pub use error::TypeError;
pub use hash::{IoHash, NodeHasher};
pub use locator::{BlobLocator, LocatorFragment};
pub use refs::{AliasEntry, RefName, RefTarget};
