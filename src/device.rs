// SPDX-License-Identifier: MIT OR Apache-2.0

//! Device records and the pure merge rules of the device-list registry.
//!
//! A device is identified by its bare JID and a 31-bit device id, unique
//! across backends for the same physical device. A device is *active* for a
//! namespace while it appears in that backend's advertised device list;
//! records of devices that disappeared from every list are kept around as
//! inactive, sessions and keys are never deleted automatically.
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::crypto::identity::IdentityKey;

/// 32-bit unsigned device id. Generated ids are drawn from the positive
/// 31-bit range for compatibility with signed transports.
pub type DeviceId = u32;

pub const DEVICE_ID_MIN: DeviceId = 1;

pub const DEVICE_ID_MAX: DeviceId = 2u32.pow(31) - 1;

/// Information about a single device as exposed to the application.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInformation {
    pub bare_jid: String,
    pub device_id: DeviceId,
    /// Namespaces of all backends this device was ever seen on.
    pub namespaces: BTreeSet<String>,
    /// Per-namespace activity, keyed by namespace.
    pub active: BTreeMap<String, bool>,
    pub label: Option<String>,
    pub identity_key: IdentityKey,
    /// The application-defined trust level attached to the identity key.
    pub trust_level: String,
}

impl DeviceInformation {
    /// Whether the device is currently listed by the backend of the given namespace.
    pub fn is_active(&self, namespace: &str) -> bool {
        self.active.get(namespace).copied().unwrap_or(false)
    }

    /// The namespaces this device is active on, ordered by the given
    /// priority list. Encryption walks these in order and settles on the
    /// first one whose remote bundle is available.
    pub fn supported_namespaces(&self, priority: &[String]) -> Vec<String> {
        priority
            .iter()
            .filter(|namespace| self.is_active(namespace))
            .cloned()
            .collect()
    }
}

/// Persisted per-device record. The identity key may still be unknown for
/// devices whose bundle was never seen.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DeviceRecord {
    pub namespaces: BTreeSet<String>,
    pub active: BTreeMap<String, bool>,
    pub label: Option<String>,
    pub identity_key: Option<IdentityKey>,
}

impl DeviceRecord {
    /// Record for a device freshly observed on one backend's list.
    pub fn first_seen(namespace: &str, label: Option<String>) -> Self {
        Self {
            namespaces: BTreeSet::from([namespace.to_string()]),
            active: BTreeMap::from([(namespace.to_string(), true)]),
            label,
            identity_key: None,
        }
    }

    /// Applies one backend's device-list observation: present devices become
    /// active for that namespace, absent ones inactive.
    ///
    /// A `None` label means "this backend does not support labels" and never
    /// clears a previously stored label.
    ///
    /// Returns whether the record changed.
    pub fn observe(&mut self, namespace: &str, present: bool, label: Option<&str>) -> bool {
        let mut changed = false;

        if present {
            changed |= self.namespaces.insert(namespace.to_string());

            if self.active.get(namespace) != Some(&true) {
                self.active.insert(namespace.to_string(), true);
                changed = true;
            }

            if let Some(label) = label {
                if self.label.as_deref() != Some(label) {
                    self.label = Some(label.to_string());
                    changed = true;
                }
            }
        } else if self.namespaces.contains(namespace) && self.active.get(namespace) == Some(&true) {
            self.active.insert(namespace.to_string(), false);
            changed = true;
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::DeviceRecord;

    #[test]
    fn observe_merges_namespaces() {
        let mut record = DeviceRecord::first_seen("ns:one", None);
        assert!(record.observe("ns:two", true, None));

        assert!(record.namespaces.contains("ns:one"));
        assert!(record.namespaces.contains("ns:two"));
        assert_eq!(record.active.get("ns:one"), Some(&true));
        assert_eq!(record.active.get("ns:two"), Some(&true));
    }

    #[test]
    fn absence_marks_inactive_but_keeps_record() {
        let mut record = DeviceRecord::first_seen("ns:one", Some("laptop".to_string()));
        assert!(record.observe("ns:one", false, None));

        assert_eq!(record.active.get("ns:one"), Some(&false));
        assert!(record.namespaces.contains("ns:one"));
        assert_eq!(record.label.as_deref(), Some("laptop"));

        // Re-appearing marks it active again.
        assert!(record.observe("ns:one", true, None));
        assert_eq!(record.active.get("ns:one"), Some(&true));
    }

    #[test]
    fn missing_label_does_not_clear_stored_label() {
        let mut record = DeviceRecord::first_seen("ns:one", Some("laptop".to_string()));
        record.observe("ns:one", true, None);
        assert_eq!(record.label.as_deref(), Some("laptop"));

        record.observe("ns:one", true, Some("desk"));
        assert_eq!(record.label.as_deref(), Some("desk"));
    }

    #[test]
    fn observe_reports_no_change_when_stable() {
        let mut record = DeviceRecord::first_seen("ns:one", None);
        assert!(!record.observe("ns:one", true, None));

        // Absence on a namespace that never listed the device changes nothing.
        assert!(!record.observe("ns:two", false, None));
    }
}
