//! Mutual exclusion per channel id.
//!
//! Cranking an objective must not interleave with another crank touching
//! the same channels, but unrelated channels may progress in parallel. A
//! guard covers a whole set of channels, acquired atomically, so two
//! cranks with overlapping sets can never deadlock.

use crate::types::Hash;
use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct LockTable {
    held: Mutex<BTreeSet<Hash>>,
    released: Condvar,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until none of `ids` is held by someone else, then holds all of
    /// them until the guard is dropped.
    pub fn acquire(&self, ids: &[Hash]) -> ChannelsGuard<'_> {
        let wanted: BTreeSet<Hash> = ids.iter().copied().collect();
        let mut held = self.lock_held();
        while wanted.iter().any(|id| held.contains(id)) {
            held = match self.released.wait(held) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        held.extend(wanted.iter().copied());
        ChannelsGuard {
            table: self,
            ids: wanted,
        }
    }

    fn lock_held(&self) -> MutexGuard<'_, BTreeSet<Hash>> {
        // The set stays consistent even if a holder panicked.
        match self.held.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Debug)]
pub struct ChannelsGuard<'a> {
    table: &'a LockTable,
    ids: BTreeSet<Hash>,
}

impl Drop for ChannelsGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.table.lock_held();
        for id in &self.ids {
            held.remove(id);
        }
        drop(held);
        self.table.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use std::thread;

    #[test]
    fn disjoint_sets_do_not_block() {
        let table = LockTable::new();
        let _a = table.acquire(&[Hash([1; 32])]);
        let _b = table.acquire(&[Hash([2; 32]), Hash([3; 32])]);
    }

    #[test]
    fn overlapping_sets_are_serialized() {
        let table = Arc::new(LockTable::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let table = table.clone();
                let inside = inside.clone();
                thread::spawn(move || {
                    // Every set contains channel 0, in varying order.
                    let ids = if i % 2 == 0 {
                        vec![Hash([0; 32]), Hash([i as u8 + 1; 32])]
                    } else {
                        vec![Hash([i as u8 + 1; 32]), Hash([0; 32])]
                    };
                    for _ in 0..50 {
                        let _guard = table.acquire(&ids);
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
