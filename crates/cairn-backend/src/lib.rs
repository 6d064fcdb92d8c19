//! Backend contract for Cairn.
//!
//! The bundle engine is built on top of a generic key-value blob store that
//! also keeps named refs and ranked aliases. This crate defines that contract
//! as the async [`StorageBackend`] trait and ships an in-memory
//! implementation.
//!
//! # Storage Backends
//!
//! - [`InMemoryBackend`] -- `HashMap`-based backend for tests and embedding;
//!   counts reads and can inject write failures
//!
//! # Design Rules
//!
//! 1. Blobs are immutable once written.
//! 2. A blob write is atomic: the blob is either fully visible or absent.
//! 3. Backends address whole blobs; locator fragments are resolved above.
//! 4. Errors are propagated unchanged; retries belong to the backend itself.

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{BackendError, BackendResult};
pub use memory::InMemoryBackend;
pub use traits::{BlobStream, StorageBackend};
