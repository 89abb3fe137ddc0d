//! Keyed collection windows.
//!
//! A handler opens a [`Window`] under a key (a database name, or a name
//! plus creation epoch), the dispatch loop delivers matching replies into
//! it, and the handler waits until a predicate over the collected items
//! holds or the timeout passes. Dropping the window unregisters it, so an
//! abandoned wait leaves nothing behind.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};

struct WindowSlot<T> {
    items: Vec<T>,
    notify: watch::Sender<u64>,
}

struct BarrierState<K, T> {
    next_id: u64,
    windows: HashMap<K, HashMap<u64, WindowSlot<T>>>,
}

/// Registry of open windows, shared between waiters and the dispatcher.
pub struct Barriers<K, T> {
    state: Arc<Mutex<BarrierState<K, T>>>,
}

impl<K, T> Clone for Barriers<K, T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<K, T> Default for Barriers<K, T> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(BarrierState {
                next_id: 0,
                windows: HashMap::new(),
            })),
        }
    }
}

impl<K, T> Barriers<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a window under `key`. Several windows may share a key; each
    /// receives every item delivered to it.
    pub fn open(&self, key: K) -> Window<K, T> {
        let (notify, rx) = watch::channel(0);
        let mut state = self.state.lock().expect("barrier lock");
        let id = state.next_id;
        state.next_id += 1;
        state.windows.entry(key.clone()).or_default().insert(
            id,
            WindowSlot {
                items: Vec::new(),
                notify,
            },
        );
        Window {
            key,
            id,
            state: Arc::clone(&self.state),
            rx,
        }
    }

    pub fn is_open(&self, key: &K) -> bool {
        self.state
            .lock()
            .expect("barrier lock")
            .windows
            .get(key)
            .is_some_and(|slots| !slots.is_empty())
    }

    /// Hand `item` to every window open under `key`. Returns false when
    /// nothing was waiting.
    pub fn deliver(&self, key: &K, item: T) -> bool {
        let mut state = self.state.lock().expect("barrier lock");
        match state.windows.get_mut(key) {
            Some(slots) if !slots.is_empty() => {
                push_all(slots, &item);
                true
            }
            _ => false,
        }
    }

    /// Hand `item` to every window whose key satisfies `matches`.
    pub fn deliver_where(&self, matches: impl Fn(&K) -> bool, item: T) -> usize {
        let mut state = self.state.lock().expect("barrier lock");
        let mut reached = 0;
        for (key, slots) in state.windows.iter_mut() {
            if matches(key) {
                reached += slots.len();
                push_all(slots, &item);
            }
        }
        reached
    }
}

fn push_all<T: Clone>(slots: &mut HashMap<u64, WindowSlot<T>>, item: &T) {
    for slot in slots.values_mut() {
        slot.items.push(item.clone());
        slot.notify.send_modify(|n| *n += 1);
    }
}

/// Result of a bounded wait.
#[derive(Debug, Clone, PartialEq)]
pub struct Collected<T> {
    pub items: Vec<T>,
    /// Whether the predicate held before the deadline.
    pub complete: bool,
}

/// A registered window. Unregisters itself on drop.
pub struct Window<K: Eq + Hash, T> {
    key: K,
    id: u64,
    state: Arc<Mutex<BarrierState<K, T>>>,
    rx: watch::Receiver<u64>,
}

impl<K, T> Window<K, T>
where
    K: Eq + Hash,
    T: Clone,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Items delivered so far.
    pub fn snapshot(&self) -> Vec<T> {
        self.state
            .lock()
            .expect("barrier lock")
            .windows
            .get(&self.key)
            .and_then(|slots| slots.get(&self.id))
            .map(|slot| slot.items.clone())
            .unwrap_or_default()
    }

    /// Wait until `done` holds over the collected items, or `timeout`
    /// elapses. Items delivered before the call count.
    pub async fn collect_until<F>(&mut self, timeout: Duration, mut done: F) -> Collected<T>
    where
        F: FnMut(&[T]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            self.rx.borrow_and_update();
            let items = self.snapshot();
            if done(&items) {
                return Collected {
                    items,
                    complete: true,
                };
            }

            tokio::select! {
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        return Collected { items, complete: false };
                    }
                }
                _ = sleep_until(deadline) => {
                    let items = self.snapshot();
                    let complete = done(&items);
                    return Collected { items, complete };
                }
            }
        }
    }

    /// Collect whatever arrives until `timeout`.
    pub async fn collect_for(&mut self, timeout: Duration) -> Vec<T> {
        self.collect_until(timeout, |_| false).await.items
    }
}

impl<K: Eq + Hash, T> Drop for Window<K, T> {
    fn drop(&mut self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if let Some(slots) = state.windows.get_mut(&self.key) {
            slots.remove(&self.id);
            if slots.is_empty() {
                state.windows.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_when_predicate_holds() {
        let barriers: Barriers<String, u32> = Barriers::new();
        let mut window = barriers.open("orders".to_string());

        let feeder = barriers.clone();
        tokio::spawn(async move {
            for n in 1..=3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                feeder.deliver(&"orders".to_string(), n);
            }
        });

        let got = window
            .collect_until(Duration::from_secs(2), |items| items.len() >= 3)
            .await;
        assert!(got.complete);
        assert_eq!(got.items, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn times_out_with_partial_items() {
        let barriers: Barriers<&'static str, u32> = Barriers::new();
        let mut window = barriers.open("orders");
        barriers.deliver(&"orders", 1);

        let got = window
            .collect_until(Duration::from_millis(30), |items| items.len() >= 2)
            .await;
        assert!(!got.complete);
        assert_eq!(got.items, vec![1]);
    }

    #[tokio::test]
    async fn drop_unregisters_window() {
        let barriers: Barriers<&'static str, u32> = Barriers::new();
        let window = barriers.open("orders");
        assert!(barriers.is_open(&"orders"));
        drop(window);
        assert!(!barriers.is_open(&"orders"));
        assert!(!barriers.deliver(&"orders", 1));
    }

    #[tokio::test]
    async fn windows_sharing_a_key_each_see_items() {
        let barriers: Barriers<&'static str, u32> = Barriers::new();
        let first = barriers.open("orders");
        let second = barriers.open("orders");
        assert!(barriers.deliver(&"orders", 9));
        assert_eq!(first.snapshot(), vec![9]);
        assert_eq!(second.snapshot(), vec![9]);

        drop(first);
        assert!(barriers.is_open(&"orders"));
    }

    #[tokio::test]
    async fn deliver_where_matches_key_prefix() {
        let barriers: Barriers<(String, u64), u32> = Barriers::new();
        let a = barriers.open(("orders".to_string(), 1));
        let b = barriers.open(("orders".to_string(), 2));
        let c = barriers.open(("users".to_string(), 1));

        let reached = barriers.deliver_where(|(db, _)| db == "orders", 5);
        assert_eq!(reached, 2);
        assert_eq!(a.snapshot(), vec![5]);
        assert_eq!(b.snapshot(), vec![5]);
        assert!(c.snapshot().is_empty());
    }
}
