// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed views over the application-provided key-value store.
//!
//! The core owns the key space: all keys are namespaced and versioned
//! (`v1/...`), all values are CBOR. Writes go straight through to the
//! underlying store, nothing is cached or deferred; consistency relies on
//! write ordering within one operation, not on transactions.
pub(crate) mod facade;
#[cfg(feature = "memory")]
mod memory;

#[cfg(feature = "memory")]
pub use memory::MemoryStorage;
