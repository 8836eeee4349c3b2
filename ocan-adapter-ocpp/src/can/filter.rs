//! Allow-list admission of outbound CAN identifiers

use std::collections::HashSet;

use ocan_core::{format_id, CanId};
use parking_lot::RwLock;
use tracing::info;

use super::codec::FrameCodec;

/// Snapshot of the admission policy
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdmissionPolicy {
    pub enabled: bool,
    pub allowed: HashSet<CanId>,
}

impl AdmissionPolicy {
    /// Filtering on, allowing every identifier the codec knows
    pub fn known() -> Self {
        Self {
            enabled: true,
            allowed: FrameCodec::known_ids().collect(),
        }
    }

    pub fn allowing(ids: impl IntoIterator<Item = CanId>) -> Self {
        Self {
            enabled: true,
            allowed: ids.into_iter().collect(),
        }
    }

    pub fn allows(&self, id: CanId) -> bool {
        !self.enabled || self.allowed.contains(&id)
    }
}

/// Shared, mutable admission gate
#[derive(Debug, Default)]
pub struct AdmissionFilter {
    policy: RwLock<AdmissionPolicy>,
}

impl AdmissionFilter {
    pub fn new(policy: AdmissionPolicy) -> Self {
        Self {
            policy: RwLock::new(policy),
        }
    }

    pub fn allows(&self, id: CanId) -> bool {
        self.policy.read().allows(id)
    }

    /// Turn filtering on; `None` allows every known identifier
    pub fn enable(&self, ids: Option<HashSet<CanId>>) {
        let policy = match ids {
            Some(ids) => AdmissionPolicy::allowing(ids),
            None => AdmissionPolicy::known(),
        };

        let mut allowed: Vec<_> = policy.allowed.iter().copied().collect();
        allowed.sort_unstable();
        info!(
            "Admission filter enabled: [{}]",
            allowed.into_iter().map(format_id).collect::<Vec<_>>().join(", ")
        );

        *self.policy.write() = policy;
    }

    pub fn disable(&self) {
        self.policy.write().enabled = false;
        info!("Admission filter disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.policy.read().enabled
    }

    pub fn snapshot(&self) -> AdmissionPolicy {
        self.policy.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocan_core::ids;

    #[test]
    fn test_disabled_allows_everything() {
        let filter = AdmissionFilter::default();
        assert!(!filter.is_enabled());
        assert!(filter.allows(ids::MALICIOUS));
        assert!(filter.allows(0x7FF));
    }

    #[test]
    fn test_enable_defaults_to_known_ids() {
        let filter = AdmissionFilter::default();
        filter.enable(None);

        for id in ids::KNOWN {
            assert!(filter.allows(id));
        }
        assert!(!filter.allows(ids::MALICIOUS));
    }

    #[test]
    fn test_enable_with_explicit_list() {
        let filter = AdmissionFilter::default();
        filter.enable(Some([0x200, 0x300].into_iter().collect()));

        assert!(filter.allows(0x200));
        assert!(filter.allows(0x300));
        assert!(!filter.allows(0x201));
        assert!(!filter.allows(ids::MALICIOUS));
    }

    #[test]
    fn test_disable_reopens() {
        let filter = AdmissionFilter::new(AdmissionPolicy::allowing([0x200]));
        assert!(!filter.allows(0x210));
        filter.disable();
        assert!(filter.allows(0x210));
        assert!(!filter.snapshot().enabled);
    }
}
