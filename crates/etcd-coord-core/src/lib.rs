//! Coordination primitives on top of a revisioned key-value store such as etcd.
//!
//! - [`Lease`] keeps a key alive for as long as its owner keeps renewing it.
//! - [`WatchSession`] feeds a [`WatchHandler`] a snapshot of a key range followed by every
//!   change to it, resynchronizing from a fresh snapshot when the store compacts its history.

mod error;
mod lease;
pub mod memory;
pub mod store;
mod watcher;

pub use error::{Error, Result};
pub use lease::Lease;
pub use memory::MemoryStore;
pub use store::{KeyRange, KeyValue, LeaseId, Revision, Snapshot, Store, StoreError};
pub use watcher::{WatchEvent, WatchHandler, WatchSession};
