//! Identifier allocators.
//!
//! All allocators are pure state objects: they warn on exhaustion and return
//! a sentinel instead of failing, so one exhausted pool never aborts a pass.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;

/// Datapath tunnel keys are 24 bits, 0 reserved.
pub(crate) const MAX_DP_KEY: u32 = (1 << 24) - 1;

/// Port tunnel keys are 15 bits, scoped to a datapath, 0 reserved.
pub(crate) const MAX_PORT_KEY: u32 = (1 << 15) - 1;

/// Multicast group keys occupy the range above the port keys.
pub(crate) const MIN_MULTICAST_KEY: u32 = 1 << 15;
pub(crate) const MAX_MULTICAST_KEY: u32 = (1 << 16) - 1;

/// The first five multicast keys are reserved for the fixed groups; learnt
/// IP multicast groups are keyed from the remainder.
pub(crate) const MIN_IP_MULTICAST_KEY: u32 = MIN_MULTICAST_KEY + 5;
pub(crate) const MAX_IP_MULTICAST_KEY: u32 = MAX_MULTICAST_KEY;

/// A pool of integer keys with stable reuse semantics.
///
/// Allocation returns the smallest unused key strictly above the hint,
/// wrapping at the top of the range, so keys released long ago are reused
/// last and keys of persisting entities never move.
#[derive(Debug, Clone)]
pub(crate) struct KeySpace {
    used: BTreeSet<u32>,
    min: u32,
    max: u32,
    hint: u32,
}

impl KeySpace {
    pub(crate) fn new(min: u32, max: u32) -> Self {
        debug_assert!(0 < min && min <= max);

        Self {
            used: BTreeSet::new(),
            min,
            max,
            hint: min - 1,
        }
    }

    pub(crate) fn with_hint(min: u32, max: u32, hint: u32) -> Self {
        Self {
            hint: hint.clamp(min - 1, max),
            ..Self::new(min, max)
        }
    }

    pub(crate) fn hint(&self) -> u32 {
        self.hint
    }

    /// Marks a key as in use. Returns `false` if it already was.
    pub(crate) fn mark(&mut self, key: u32) -> bool {
        self.used.insert(key)
    }

    pub(crate) fn contains(&self, key: u32) -> bool {
        self.used.contains(&key)
    }

    /// Allocates the next free key, or `None` if the pool is exhausted.
    pub(crate) fn allocate(&mut self) -> Option<u32> {
        let key = first_free(&self.used, self.hint.saturating_add(1)..=self.max)
            .or_else(|| first_free(&self.used, self.min..=self.hint))?;

        self.used.insert(key);
        self.hint = key;

        Some(key)
    }
}

/// The smallest integer in `range` absent from `used`.
fn first_free(used: &BTreeSet<u32>, range: RangeInclusive<u32>) -> Option<u32> {
    let (start, end) = (*range.start(), *range.end());

    if start > end {
        return None;
    }

    let mut candidate = start;

    for &key in used.range(range) {
        if key > candidate {
            break;
        }

        candidate = key.checked_add(1)?;
    }

    (candidate <= end).then_some(candidate)
}

/// Egress-shaping queue identifiers, scoped to a chassis.
pub(crate) const QDISC_MIN_QUEUE_ID: u32 = 0;
pub(crate) const QDISC_MAX_QUEUE_ID: u32 = 0xff;

#[derive(Debug, Default)]
pub(crate) struct QueueIds {
    used: BTreeSet<u32>,
}

impl QueueIds {
    pub(crate) fn mark(&mut self, id: u32) {
        self.used.insert(id);
    }

    /// Linearly scans for the first free id above `QDISC_MIN_QUEUE_ID`.
    pub(crate) fn allocate(&mut self) -> Option<u32> {
        let id = first_free(&self.used, QDISC_MIN_QUEUE_ID + 1..=QDISC_MAX_QUEUE_ID)?;

        self.used.insert(id);

        Some(id)
    }
}

/// VLAN tags for nested container ports, scoped to a parent port.
///
/// Tag 0 is invalid and never handed out.
#[derive(Debug, Default)]
pub(crate) struct Tags {
    used: BTreeSet<u32>,
}

impl Tags {
    pub(crate) fn mark(&mut self, tag: u16) {
        self.used.insert(u32::from(tag));
    }

    pub(crate) fn allocate(&mut self) -> Option<u16> {
        let tag = first_free(&self.used, 1..=4095)?;

        self.used.insert(tag);

        Some(tag as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn allocates_above_hint() {
        let mut keys = KeySpace::with_hint(1, 10, 4);

        assert_eq!(keys.allocate(), Some(5));
        assert_eq!(keys.allocate(), Some(6));
    }

    #[test]
    fn skips_used_keys() {
        let mut keys = KeySpace::new(1, 10);
        keys.mark(1);
        keys.mark(2);
        keys.mark(4);

        assert_eq!(keys.allocate(), Some(3));
        assert_eq!(keys.allocate(), Some(5));
    }

    #[test]
    fn wraps_at_the_top_of_the_range() {
        let mut keys = KeySpace::with_hint(1, 4, 3);
        keys.mark(4);

        assert_eq!(keys.allocate(), Some(1));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut keys = KeySpace::new(1, 3);

        for _ in 0..3 {
            assert!(keys.allocate().is_some());
        }

        assert_eq!(keys.allocate(), None);
    }

    #[test]
    fn queue_ids_start_above_the_minimum() {
        let mut queues = QueueIds::default();

        assert_eq!(queues.allocate(), Some(QDISC_MIN_QUEUE_ID + 1));
    }

    #[test]
    fn queue_ids_exhaust() {
        let mut queues = QueueIds::default();

        for _ in QDISC_MIN_QUEUE_ID + 1..=QDISC_MAX_QUEUE_ID {
            assert!(queues.allocate().is_some());
        }

        assert_eq!(queues.allocate(), None);
    }

    #[test]
    fn tag_zero_is_never_allocated() {
        let mut tags = Tags::default();

        assert_eq!(tags.allocate(), Some(1));
    }

    proptest! {
        #[test]
        fn allocated_keys_are_unique_and_in_range(
            marks in prop::collection::btree_set(1u32..=64, 0..32),
            hint in 0u32..=64,
            n in 1usize..=64,
        ) {
            let mut keys = KeySpace::with_hint(1, 64, hint);
            for &m in &marks {
                keys.mark(m);
            }

            let mut seen = marks;
            for _ in 0..n {
                match keys.allocate() {
                    Some(key) => {
                        prop_assert!((1..=64).contains(&key));
                        prop_assert!(seen.insert(key), "key {key} handed out twice");
                    }
                    None => prop_assert_eq!(seen.len(), 64),
                }
            }
        }
    }
}
