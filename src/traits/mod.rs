// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces between the core and its collaborators: the per-version
//! backends, the application-provided storage and the application callbacks
//! for everything that touches the network.
mod backend;
mod callbacks;
mod storage;

pub use backend::{Backend, BackendError};
pub use callbacks::{Transport, TransportError, TrustCallback};
pub use storage::{Storage, StorageError};
