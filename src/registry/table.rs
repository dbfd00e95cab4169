//! Subscription table: at most one live listener per subscriber URL.
//!
//! All mutations happen under one lock that is never held across a remote
//! call.  Teardown paths close a listener before dropping it from the map so a
//! late watch callback cannot fire for an entry that no longer exists.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::url::ServiceUrl;

/// What the table needs from a stored listener.
pub trait Listener: Send + Sync {
    fn is_closed(&self) -> bool;
    fn close(&self);
}

pub struct SubscriptionTable<L: Listener> {
    entries: Mutex<HashMap<ServiceUrl, Arc<L>>>,
}

impl<L: Listener> Default for SubscriptionTable<L> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<L: Listener> SubscriptionTable<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live listener for `url`, or build one with `factory`.
    ///
    /// A closed entry is evicted and replaced.  The flag is `true` when the
    /// listener was created by this call; only that caller should start it.
    pub fn get_or_create<E>(
        &self,
        url: &ServiceUrl,
        factory: impl FnOnce() -> Result<Arc<L>, E>,
    ) -> Result<(Arc<L>, bool), E> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(url) {
            if !existing.is_closed() {
                return Ok((Arc::clone(existing), false));
            }
            entries.remove(url);
        }
        let listener = factory()?;
        entries.insert(url.clone(), Arc::clone(&listener));
        Ok((listener, true))
    }

    pub fn get(&self, url: &ServiceUrl) -> Option<Arc<L>> {
        self.entries.lock().get(url).cloned()
    }

    /// Swap every entry for a fresh listener built by `factory`.
    ///
    /// The whole swap happens under the table lock, so the table never goes
    /// empty.  Each old listener is closed before `factory` sees it, which
    /// makes its state final when the replacement is built from it.  Returns
    /// `(url, old, new)` for each entry; the caller starts the new listeners.
    pub fn recover_all(
        &self,
        mut factory: impl FnMut(&ServiceUrl, &Arc<L>) -> Arc<L>,
    ) -> Vec<(ServiceUrl, Arc<L>, Arc<L>)> {
        let mut entries = self.entries.lock();
        let snapshot: Vec<(ServiceUrl, Arc<L>)> = entries.drain().collect();

        let mut recovered = Vec::with_capacity(snapshot.len());
        let mut fresh = HashMap::with_capacity(snapshot.len());
        for (url, old) in snapshot {
            old.close();
            let new = factory(&url, &old);
            fresh.insert(url.clone(), Arc::clone(&new));
            recovered.push((url, old, new));
        }
        *entries = fresh;
        recovered
    }

    /// Close and remove the entry for `url`.
    pub fn remove(&self, url: &ServiceUrl) -> Option<Arc<L>> {
        let mut entries = self.entries.lock();
        let listener = entries.get(url).cloned()?;
        listener.close();
        entries.remove(url);
        Some(listener)
    }

    /// Close and remove every entry.
    pub fn close_all(&self) -> usize {
        let mut entries = self.entries.lock();
        for listener in entries.values() {
            listener.close();
        }
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn urls(&self) -> Vec<ServiceUrl> {
        self.entries.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct FakeListener {
        closed: AtomicBool,
    }

    impl Listener for FakeListener {
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn url(service: &str) -> ServiceUrl {
        ServiceUrl::parse(&format!("consumer://10.0.0.9/{service}")).unwrap()
    }

    fn make() -> Result<Arc<FakeListener>, ()> {
        Ok(Arc::new(FakeListener::default()))
    }

    #[test]
    fn returns_existing_live_listener() {
        let table = SubscriptionTable::new();
        let (first, created) = table.get_or_create(&url("a"), make).unwrap();
        assert!(created);
        let (second, created) = table.get_or_create(&url("a"), make).unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn closed_entry_is_replaced() {
        let table = SubscriptionTable::new();
        let (first, _) = table.get_or_create(&url("a"), make).unwrap();
        first.close();
        let (second, created) = table.get_or_create(&url("a"), make).unwrap();
        assert!(created);
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn factory_errors_leave_table_untouched() {
        let table: SubscriptionTable<FakeListener> = SubscriptionTable::new();
        let result = table.get_or_create(&url("a"), || Err("broken"));
        assert_eq!(result.err(), Some("broken"));
        assert!(table.is_empty());
    }

    #[test]
    fn concurrent_callers_share_one_listener() {
        let table = Arc::new(SubscriptionTable::new());
        let built = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let built = Arc::clone(&built);
                std::thread::spawn(move || {
                    table
                        .get_or_create(&url("a"), || {
                            built.fetch_add(1, Ordering::SeqCst);
                            make()
                        })
                        .unwrap()
                        .0
                })
            })
            .collect();
        let listeners: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(listeners.iter().all(|l| Arc::ptr_eq(l, &listeners[0])));
    }

    #[test]
    fn recover_closes_old_before_building_replacement() {
        let table = SubscriptionTable::new();
        let (old_a, _) = table.get_or_create(&url("a"), make).unwrap();
        let (old_b, _) = table.get_or_create(&url("b"), make).unwrap();

        let recovered = table.recover_all(|_, old| {
            assert!(old.is_closed());
            // Swapped under one lock: the entry is never missing.
            assert!(table.entries.try_lock().is_none());
            Arc::new(FakeListener::default())
        });
        assert_eq!(recovered.len(), 2);
        assert!(old_a.is_closed());
        assert!(old_b.is_closed());

        for (u, _, new) in &recovered {
            let current = table.get(u).unwrap();
            assert!(Arc::ptr_eq(&current, new));
            assert!(!current.is_closed());
        }
    }

    #[test]
    fn remove_and_close_all_close_listeners() {
        let table = SubscriptionTable::new();
        let (a, _) = table.get_or_create(&url("a"), make).unwrap();
        let (b, _) = table.get_or_create(&url("b"), make).unwrap();

        assert!(table.remove(&url("a")).is_some());
        assert!(a.is_closed());
        assert!(table.remove(&url("a")).is_none());

        assert_eq!(table.close_all(), 1);
        assert!(b.is_closed());
        assert!(table.is_empty());
    }
}
