// SPDX-License-Identifier: MIT OR Apache-2.0

//! Utilities to test the session manager without a real XMPP stack: a
//! complete deterministic backend, an in-memory stand-in for the PEP nodes
//! and a table-driven trust callback.
pub mod backend;
pub mod transport;
pub mod trust;

pub use backend::ChainBackend;
pub use transport::{TestPep, TestTransport};
pub use trust::TestTrustCallback;
