//! Keyed mutex pool
//!
//! `lock(key)` blocks until no other holder has `key`; the guard releases it
//! on drop. Entries are reference counted and removed when the last waiter
//! for a key is gone, so the pool only holds keys that are in use.

use std::collections::HashMap;

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct Slot {
    held: bool,
    /// Holder plus waiters
    refs: usize,
}

#[derive(Default)]
pub struct KeyedMutexPool {
    slots: Mutex<HashMap<String, Slot>>,
    released: Condvar,
}

impl KeyedMutexPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, key: &str) -> KeyGuard<'_> {
        let mut slots = self.slots.lock();
        slots.entry(key.to_string()).or_default().refs += 1;
        loop {
            match slots.get_mut(key) {
                Some(slot) if !slot.held => {
                    slot.held = true;
                    break;
                }
                _ => self.released.wait(&mut slots),
            }
        }
        KeyGuard {
            pool: self,
            key: key.to_string(),
        }
    }

    fn unlock(&self, key: &str) {
        let mut slots = self.slots.lock();
        let now_unused = match slots.get_mut(key) {
            Some(slot) => {
                slot.held = false;
                slot.refs -= 1;
                slot.refs == 0
            }
            None => false,
        };
        if now_unused {
            slots.remove(key);
        }
        self.released.notify_all();
    }

    /// Number of keys currently held or waited on
    pub fn active_keys(&self) -> usize {
        self.slots.lock().len()
    }
}

pub struct KeyGuard<'a> {
    pool: &'a KeyedMutexPool,
    key: String,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.pool.unlock(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_entries_are_collected() {
        let pool = KeyedMutexPool::new();
        {
            let _a = pool.lock("a");
            let _b = pool.lock("b");
            assert_eq!(pool.active_keys(), 2);
        }
        assert_eq!(pool.active_keys(), 0);
    }

    #[test]
    fn test_same_key_is_serialized() {
        let pool = Arc::new(KeyedMutexPool::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let inside = inside.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let _g = pool.lock("h");
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.active_keys(), 0);
    }

    #[test]
    fn test_distinct_keys_do_not_block() {
        let pool = KeyedMutexPool::new();
        let _a = pool.lock("a");
        let _b = pool.lock("b");
    }
}
