//! # Event Emitters
//!
//! [`MessageChannel`] is the listener surface shared by the host router, its
//! per-connection scopes and the guest port. [`Emitter`] is the one concrete
//! table behind all of them.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use duopack::Value;

/// Identifies a registered listener so it can be removed again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Listener<E> = Arc<dyn Fn(&E, &[Value]) + Send + Sync>;

/// Subscribe/unsubscribe/emit over named channels.
pub trait MessageChannel {
    type Event;

    /// Calls `listener` for every message on `channel`.
    fn on(&self, channel: &str, listener: Listener<Self::Event>) -> ListenerId;

    /// Calls `listener` for the next message on `channel` only.
    fn once(&self, channel: &str, listener: Listener<Self::Event>) -> ListenerId;

    /// Removes a listener. Returns whether it was still registered.
    fn off(&self, channel: &str, id: ListenerId) -> bool;

    /// Delivers a message to the current listeners of `channel` and returns
    /// how many were called.
    fn emit(&self, channel: &str, event: &Self::Event, args: &[Value]) -> usize;
}

struct Entry<E> {
    id: ListenerId,
    once: bool,
    listener: Listener<E>,
}

pub struct Emitter<E> {
    next_id: AtomicU64,
    channels: Mutex<HashMap<String, Vec<Entry<E>>>>,
}

impl<E> Default for Emitter<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            channels: Mutex::new(HashMap::new()),
        }
    }
}

impl<E> Emitter<E> {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, channel: &str, listener: Listener<E>, once: bool) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut channels) = self.channels.lock() {
            channels
                .entry(channel.to_string())
                .or_default()
                .push(Entry { id, once, listener });
        }
        id
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .map(|c| c.get(channel).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Removes every listener on every channel.
    pub fn clear(&self) {
        if let Ok(mut channels) = self.channels.lock() {
            channels.clear();
        }
    }
}

impl<E> MessageChannel for Emitter<E> {
    type Event = E;

    fn on(&self, channel: &str, listener: Listener<E>) -> ListenerId {
        self.add(channel, listener, false)
    }

    fn once(&self, channel: &str, listener: Listener<E>) -> ListenerId {
        self.add(channel, listener, true)
    }

    fn off(&self, channel: &str, id: ListenerId) -> bool {
        let Ok(mut channels) = self.channels.lock() else {
            return false;
        };
        let Some(entries) = channels.get_mut(channel) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            channels.remove(channel);
        }
        removed
    }

    fn emit(&self, channel: &str, event: &E, args: &[Value]) -> usize {
        // Snapshot under the lock, call outside it so listeners may
        // subscribe or unsubscribe.
        let listeners: Vec<Listener<E>> = {
            let Ok(mut channels) = self.channels.lock() else {
                return 0;
            };
            let Some(entries) = channels.get_mut(channel) else {
                return 0;
            };
            let snapshot = entries.iter().map(|e| Arc::clone(&e.listener)).collect();
            entries.retain(|e| !e.once);
            if entries.is_empty() {
                channels.remove(channel);
            }
            snapshot
        };

        for listener in &listeners {
            listener(event, args);
        }
        listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, Listener<()>) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, Arc::new(move |_: &(), _: &[Value]| {
            inner.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn test_once_fires_once() {
        let emitter = Emitter::<()>::new();
        let (count, listener) = counter();
        emitter.once("ready", listener);

        assert_eq!(emitter.emit("ready", &(), &[]), 1);
        assert_eq!(emitter.emit("ready", &(), &[]), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_removes_only_that_listener() {
        let emitter = Emitter::<()>::new();
        let (a_count, a) = counter();
        let (b_count, b) = counter();
        let a_id = emitter.on("tick", a);
        emitter.on("tick", b);

        assert!(emitter.off("tick", a_id));
        assert!(!emitter.off("tick", a_id));
        emitter.emit("tick", &(), &[]);

        assert_eq!(a_count.load(Ordering::SeqCst), 0);
        assert_eq!(b_count.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count("tick"), 1);
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let emitter = Arc::new(Emitter::<()>::new());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let weak = Arc::downgrade(&emitter);
        let inner_slot = Arc::clone(&slot);
        let id = emitter.on(
            "tick",
            Arc::new(move |_: &(), _: &[Value]| {
                if let (Some(emitter), Some(id)) = (weak.upgrade(), *inner_slot.lock().unwrap()) {
                    emitter.off("tick", id);
                }
            }),
        );
        *slot.lock().unwrap() = Some(id);

        assert_eq!(emitter.emit("tick", &(), &[]), 1);
        assert_eq!(emitter.emit("tick", &(), &[]), 0);
    }
}
