//! Bound registry — §4.I.
//!
//! Tracks which NPU affinity classes ("bound classes") a device currently
//! has hardware registrations for. A device accepts at most three distinct
//! classes concurrently.

use std::collections::BTreeMap;

use parking_lot::RwLock;

/// The seven legal NPU affinity classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BoundClass {
    Normal,
    Only0,
    Only1,
    Only2,
    Pair01,
    Pair12,
    Pair02,
}

/// Maximum number of distinct bound classes a single device may hold at once.
pub const MAX_DISTINCT_BOUND_CLASSES: usize = 3;

/// Per-device refcounted bound-class registry, guarded by a reader/writer
/// lock: `can_accept_bound` and read-only queries take the shared side,
/// `add_bound`/`delete_bound` take the exclusive side.
#[derive(Default)]
pub struct BoundRegistry {
    counts: RwLock<BTreeMap<BoundClass, u32>>,
}

/// Hardware side-effect a registry transition must perform. The registry
/// itself only tracks refcounts; the caller (`DeviceCore`) is responsible
/// for issuing the matching `SCHED_ADD`/`SCHED_DELETE` ioctl exactly when
/// this is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundTransition {
    /// First reference: issue `SCHED_ADD` to the device.
    FirstReference,
    /// Refcount incremented past one: no hardware action needed.
    AlreadyRegistered,
    /// Last reference released: issue `SCHED_DELETE` to the device.
    LastReference,
    /// Refcount decremented but others remain: no hardware action needed.
    StillRegistered,
}

impl BoundRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `class` is already registered, or fewer than
    /// `MAX_DISTINCT_BOUND_CLASSES` distinct classes are currently held.
    pub fn can_accept_bound(&self, class: BoundClass) -> bool {
        let counts = self.counts.read();
        counts.contains_key(&class) || counts.len() < MAX_DISTINCT_BOUND_CLASSES
    }

    /// Number of distinct bound classes currently registered.
    pub fn distinct_count(&self) -> usize {
        self.counts.read().len()
    }

    pub fn count_of(&self, class: BoundClass) -> u32 {
        self.counts.read().get(&class).copied().unwrap_or(0)
    }

    /// Register one more reference to `class`. Returns `None` if the class
    /// cannot be accepted (caller must check `can_accept_bound` first, or
    /// treat `None` as a rejection).
    pub fn add_bound(&self, class: BoundClass) -> Option<BoundTransition> {
        let mut counts = self.counts.write();
        if let Some(n) = counts.get_mut(&class) {
            *n += 1;
            return Some(BoundTransition::AlreadyRegistered);
        }
        if counts.len() >= MAX_DISTINCT_BOUND_CLASSES {
            return None;
        }
        counts.insert(class, 1);
        Some(BoundTransition::FirstReference)
    }

    /// Release one reference to `class`. Returns `None` if the class was
    /// not registered at all (caller bug; logged by the caller, not here).
    pub fn delete_bound(&self, class: BoundClass) -> Option<BoundTransition> {
        let mut counts = self.counts.write();
        match counts.get_mut(&class) {
            None => None,
            Some(1) => {
                counts.remove(&class);
                Some(BoundTransition::LastReference)
            }
            Some(n) => {
                *n -= 1;
                Some(BoundTransition::StillRegistered)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reference_transitions_then_last_reference() {
        let reg = BoundRegistry::new();
        assert_eq!(reg.add_bound(BoundClass::Only0), Some(BoundTransition::FirstReference));
        assert_eq!(reg.add_bound(BoundClass::Only0), Some(BoundTransition::AlreadyRegistered));
        assert_eq!(reg.delete_bound(BoundClass::Only0), Some(BoundTransition::StillRegistered));
        assert_eq!(reg.delete_bound(BoundClass::Only0), Some(BoundTransition::LastReference));
        assert_eq!(reg.count_of(BoundClass::Only0), 0);
    }

    #[test]
    fn caps_at_three_distinct_classes() {
        let reg = BoundRegistry::new();
        assert!(reg.add_bound(BoundClass::Only0).is_some());
        assert!(reg.add_bound(BoundClass::Only1).is_some());
        assert!(reg.add_bound(BoundClass::Only2).is_some());
        assert!(!reg.can_accept_bound(BoundClass::Pair01));
        assert_eq!(reg.add_bound(BoundClass::Pair01), None);

        // same class is always fine even when at cap
        assert!(reg.can_accept_bound(BoundClass::Only0));
        assert!(reg.add_bound(BoundClass::Only0).is_some());

        // freeing one opens a slot
        reg.delete_bound(BoundClass::Only0);
        reg.delete_bound(BoundClass::Only0);
        assert!(reg.can_accept_bound(BoundClass::Pair01));
        assert!(reg.add_bound(BoundClass::Pair01).is_some());
    }

    #[test]
    fn round_trip_returns_to_prior_state() {
        let reg = BoundRegistry::new();
        for _ in 0..5 {
            reg.add_bound(BoundClass::Pair12);
        }
        for _ in 0..5 {
            reg.delete_bound(BoundClass::Pair12);
        }
        assert_eq!(reg.count_of(BoundClass::Pair12), 0);
        assert_eq!(reg.distinct_count(), 0);
    }
}
