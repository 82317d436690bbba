//! Two-sided stash-and-match table.
//!
//! Two event streams each carry one half of a correlation; either half may
//! arrive first. Whichever side arrives first is stashed under its
//! correlation key; when the other side shows up, both halves are consumed
//! and handed back as a pair. Re-offering a side before its partner arrives
//! replaces the stashed half (duplicated protocol events refresh, never
//! duplicate).

use std::collections::HashMap;
use std::hash::Hash;

pub struct Rendezvous<K, L, R> {
    left: HashMap<K, L>,
    right: HashMap<K, R>,
}

impl<K, L, R> Rendezvous<K, L, R>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            left: HashMap::new(),
            right: HashMap::new(),
        }
    }

    /// Offer the left half. Returns the completed pair when the right half
    /// was already stashed, consuming it.
    pub fn offer_left(&mut self, key: K, value: L) -> Option<(L, R)> {
        match self.right.remove(&key) {
            Some(right) => Some((value, right)),
            None => {
                self.left.insert(key, value);
                None
            }
        }
    }

    /// Mirror of [`offer_left`](Self::offer_left).
    pub fn offer_right(&mut self, key: K, value: R) -> Option<(L, R)> {
        match self.left.remove(&key) {
            Some(left) => Some((left, value)),
            None => {
                self.right.insert(key, value);
                None
            }
        }
    }

    pub fn peek_left(&self, key: &K) -> Option<&L> {
        self.left.get(key)
    }

    pub fn take_left(&mut self, key: &K) -> Option<L> {
        self.left.remove(key)
    }

    pub fn take_right(&mut self, key: &K) -> Option<R> {
        self.right.remove(key)
    }

    /// Drop both halves for a key, if stashed.
    pub fn forget(&mut self, key: &K) {
        self.left.remove(key);
        self.right.remove(key);
    }

    pub fn pending(&self) -> usize {
        self.left.len() + self.right.len()
    }
}

impl<K, L, R> Default for Rendezvous<K, L, R>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn left_then_right_completes() {
        let mut table: Rendezvous<u32, &str, &str> = Rendezvous::new();
        assert!(table.offer_left(1, "will-be-sent").is_none());
        let (l, r) = table.offer_right(1, "paused").expect("pair");
        assert_eq!((l, r), ("will-be-sent", "paused"));
        assert_eq!(table.pending(), 0);
    }

    #[test]
    fn right_then_left_completes() {
        let mut table: Rendezvous<u32, &str, &str> = Rendezvous::new();
        assert!(table.offer_right(7, "paused").is_none());
        let (l, r) = table.offer_left(7, "will-be-sent").expect("pair");
        assert_eq!((l, r), ("will-be-sent", "paused"));
    }

    #[test]
    fn reoffer_replaces_stash() {
        let mut table: Rendezvous<u32, u32, &str> = Rendezvous::new();
        assert!(table.offer_left(1, 10).is_none());
        assert!(table.offer_left(1, 11).is_none());
        let (l, _) = table.offer_right(1, "x").expect("pair");
        assert_eq!(l, 11);
    }

    #[test]
    fn forget_drops_both_sides() {
        let mut table: Rendezvous<u32, &str, &str> = Rendezvous::new();
        table.offer_left(1, "a");
        table.offer_right(2, "b");
        table.forget(&1);
        table.forget(&2);
        assert_eq!(table.pending(), 0);
        assert!(table.offer_right(1, "late").is_none());
    }

    #[test]
    fn keys_do_not_interfere() {
        let mut table: Rendezvous<u32, &str, &str> = Rendezvous::new();
        table.offer_left(1, "a");
        assert!(table.offer_right(2, "b").is_none());
        assert!(table.offer_right(1, "c").is_some());
        assert!(table.offer_left(2, "d").is_some());
    }
}
