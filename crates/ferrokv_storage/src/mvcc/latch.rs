//! Per-key-hash latches serializing mutations on the same keys.
//!
//! A batch hashes every key to a slot, sorts and deduplicates the slots, and
//! locks them in ascending order. Every batch uses the same global order, so
//! two batches sharing slots can never wait on each other in a cycle.
//! The guard releases all slots on drop.

use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use xxhash_rust::xxh3::xxh3_64;

pub struct Latches {
    slots: Vec<Mutex<()>>,
    mask: usize,
}

pub struct LatchGuard<'a> {
    _held: Vec<MutexGuard<'a, ()>>,
    slots: Vec<usize>,
}

impl<'a> LatchGuard<'a> {
    pub fn slots(&self) -> &[usize] {
        &self.slots
    }
}

impl Latches {
    /// `size` is rounded up to a power of two.
    pub fn new(size: usize) -> Self {
        let size = size.max(1).next_power_of_two();
        Self {
            slots: (0..size).map(|_| Mutex::new(())).collect(),
            mask: size - 1,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot_of(&self, key: &[u8]) -> usize {
        (xxh3_64(key) as usize) & self.mask
    }

    /// Sorted, deduplicated slots covering `keys`.
    pub fn gen_slots<'k, I>(&self, keys: I) -> Vec<usize>
    where
        I: IntoIterator<Item = &'k [u8]>,
    {
        let mut slots: Vec<usize> = keys.into_iter().map(|k| self.slot_of(k)).collect();
        slots.sort_unstable();
        slots.dedup();
        slots
    }

    /// Block until every slot for `keys` is held.
    pub fn acquire<'k, I>(&self, keys: I) -> LatchGuard<'_>
    where
        I: IntoIterator<Item = &'k [u8]>,
    {
        let slots = self.gen_slots(keys);
        let mut held = Vec::with_capacity(slots.len());
        let mut waited = None;
        for &slot in &slots {
            match self.slots[slot].try_lock() {
                Some(g) => held.push(g),
                None => {
                    waited.get_or_insert_with(Instant::now);
                    held.push(self.slots[slot].lock());
                }
            }
        }
        if let Some(start) = waited {
            ferrokv_observability::record_latch_wait(start.elapsed().as_micros() as u64);
        }
        LatchGuard { _held: held, slots }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    #[test]
    fn test_size_rounds_to_power_of_two() {
        assert_eq!(Latches::new(1000).len(), 1024);
        assert_eq!(Latches::new(0).len(), 1);
    }

    #[test]
    fn test_gen_slots_sorted_and_deduplicated() {
        let latches = Latches::new(16);
        let keys = [&b"a"[..], b"b", b"a", b"c", b"b"];
        let slots = latches.gen_slots(keys.iter().copied());
        let mut expected = slots.clone();
        expected.sort_unstable();
        expected.dedup();
        assert_eq!(slots, expected);
        assert!(slots.len() <= 3);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let latches = Latches::new(8);
        {
            let g = latches.acquire([&b"k"[..]]);
            assert_eq!(g.slots().len(), 1);
            assert!(latches.slots[g.slots()[0]].try_lock().is_none());
        }
        let slot = latches.slot_of(b"k");
        assert!(latches.slots[slot].try_lock().is_some());
    }

    #[test]
    fn test_same_key_is_mutually_exclusive() {
        let latches = Arc::new(Latches::new(64));
        let inside = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let latches = latches.clone();
                let inside = inside.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..50 {
                        let _g = latches.acquire([&b"hot"[..], &b"other"[..]]);
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        std::thread::sleep(Duration::from_micros(10));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_opposite_key_orders_do_not_deadlock() {
        let latches = Arc::new(Latches::new(1024));
        let a = {
            let latches = latches.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let _g = latches.acquire([&b"x"[..], &b"y"[..]]);
                }
            })
        };
        let b = {
            let latches = latches.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let _g = latches.acquire([&b"y"[..], &b"x"[..]]);
                }
            })
        };
        a.join().unwrap();
        b.join().unwrap();
    }
}
