// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::crypto::identity::IdentityKey;
use crate::traits::TrustCallback;
use crate::trust::{TrustError, TrustLevel};

/// Table-driven trust translation. Starts with the obvious mappings for
/// `"trusted"`, `"distrusted"` and `"undecided"`; anything else is unknown
/// until added via [`set`](TestTrustCallback::set).
#[derive(Clone, Default)]
pub struct TestTrustCallback {
    levels: Arc<Mutex<BTreeMap<String, TrustLevel>>>,
}

impl TestTrustCallback {
    pub fn new() -> Self {
        let callback = Self::default();
        callback.set("trusted", TrustLevel::Trusted);
        callback.set("distrusted", TrustLevel::Distrusted);
        callback.set("undecided", TrustLevel::Undecided);
        callback
    }

    pub fn set(&self, custom_level: &str, level: TrustLevel) {
        self.levels
            .lock()
            .expect("trust table lock is not poisoned")
            .insert(custom_level.to_string(), level);
    }
}

#[async_trait]
impl TrustCallback for TestTrustCallback {
    async fn evaluate(
        &self,
        _bare_jid: &str,
        _identity_key: &IdentityKey,
        custom_level: &str,
    ) -> Result<TrustLevel, TrustError> {
        self.levels
            .lock()
            .expect("trust table lock is not poisoned")
            .get(custom_level)
            .copied()
            .ok_or_else(|| TrustError::UnknownTrustLevel(custom_level.to_string()))
    }
}
