use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

pub const DATAPATH_KEY_MIN: u32 = 1;
pub const DATAPATH_KEY_MAX: u32 = (1 << 24) - 1;
pub const PORT_KEY_MIN: u32 = 1;
pub const PORT_KEY_MAX: u32 = (1 << 15) - 1;

// Multicast keys share the port tunnel-key namespace on the wire; the
// dynamic range sits below the five well-known groups.
pub const MCAST_KEY_MIN: u32 = 32768;
pub const MCAST_KEY_MAX: u32 = 65528;
pub const MCAST_STATIC_KEY: u32 = 65531;
pub const MCAST_MROUTER_STATIC_KEY: u32 = 65532;
pub const MCAST_MROUTER_FLOOD_KEY: u32 = 65533;
pub const MCAST_UNKNOWN_KEY: u32 = 65534;
pub const MCAST_FLOOD_KEY: u32 = 65535;

pub const QUEUE_ID_MIN: u32 = 2;
pub const QUEUE_ID_MAX: u32 = 0xf000;

/// Wrap-around id allocator with an in-use set and a hint cursor.
/// Allocation scans forward from just past the hint so keys are stable
/// and reuse of freshly-freed ids is avoided.
#[derive(Debug, Clone, PartialEq)]
pub struct KeySpace {
    min: u32,
    max: u32,
    hint: u32,
    in_use: BTreeSet<u32>,
}

impl KeySpace {
    pub fn new(min: u32, max: u32) -> Self {
        assert!(min >= 1 && min <= max);
        KeySpace {
            min,
            max,
            hint: min - 1,
            in_use: BTreeSet::new(),
        }
    }

    /// Mark an id as taken, returning false if it already was
    pub fn claim(&mut self, id: u32) -> bool {
        self.in_use.insert(id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.in_use.contains(&id)
    }

    pub fn release(&mut self, id: u32) {
        self.in_use.remove(&id);
    }

    pub fn set_hint(&mut self, hint: u32) {
        self.hint = hint;
    }

    pub fn hint(&self) -> u32 {
        self.hint
    }

    /// Next free id after the hint, wrapping at max; None when the range
    /// is exhausted
    pub fn allocate(&mut self) -> Option<u32> {
        let span = (self.max - self.min + 1) as u64;
        let mut candidate = if self.hint >= self.max || self.hint < self.min {
            self.min
        } else {
            self.hint + 1
        };
        for _ in 0..span {
            if !self.in_use.contains(&candidate) {
                self.in_use.insert(candidate);
                self.hint = candidate;
                return Some(candidate);
            }
            candidate = if candidate >= self.max {
                self.min
            } else {
                candidate + 1
            };
        }
        None
    }
}

/// Per-chassis qdisc queue-id allocation, keyed by the chassis row UUID
#[derive(Debug, Default)]
pub struct QueueIdMap(BTreeMap<Uuid, KeySpace>);

impl QueueIdMap {
    pub fn claim(&mut self, chassis: Uuid, queue_id: u32) -> bool {
        self.space(chassis).claim(queue_id)
    }

    pub fn allocate(&mut self, chassis: Uuid) -> Option<u32> {
        self.space(chassis).allocate()
    }

    fn space(&mut self, chassis: Uuid) -> &mut KeySpace {
        self.0
            .entry(chassis)
            .or_insert_with(|| KeySpace::new(QUEUE_ID_MIN, QUEUE_ID_MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_past_hint() {
        let mut keys = KeySpace::new(1, 10);
        assert_eq!(keys.allocate(), Some(1));
        assert_eq!(keys.allocate(), Some(2));
        keys.claim(3);
        assert_eq!(keys.allocate(), Some(4));
    }

    #[test]
    fn test_wraparound() {
        let mut keys = KeySpace::new(1, 3);
        keys.set_hint(2);
        assert_eq!(keys.allocate(), Some(3));
        assert_eq!(keys.allocate(), Some(1));
        assert_eq!(keys.allocate(), Some(2));
        assert_eq!(keys.allocate(), None);
    }

    #[test]
    fn test_exhaustion_with_claims() {
        let mut keys = KeySpace::new(5, 6);
        assert!(keys.claim(5));
        assert!(!keys.claim(5));
        assert!(keys.claim(6));
        assert_eq!(keys.allocate(), None);
        keys.release(5);
        assert_eq!(keys.allocate(), Some(5));
    }

    #[test]
    fn test_queue_ids_per_chassis() {
        let mut queues = QueueIdMap::default();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        assert_eq!(queues.allocate(c1), Some(QUEUE_ID_MIN));
        assert_eq!(queues.allocate(c1), Some(QUEUE_ID_MIN + 1));
        assert_eq!(queues.allocate(c2), Some(QUEUE_ID_MIN));
    }
}
