//! Minimal signal/slot plumbing.
//!
//! The host exposes its notifications (raw backend messages, async call
//! completions) as signals. Slots are plain closures; emitting snapshots the
//! current slot list and releases the lock before calling out, so a slot may
//! connect or disconnect (itself included) while it runs.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError, Weak,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotId(u64);

type Slot<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct SignalInner<T: ?Sized> {
    next_slot: AtomicU64,
    slots: Mutex<Vec<(SlotId, Slot<T>)>>,
}

impl<T: ?Sized> SignalInner<T> {
    fn slots(&self) -> MutexGuard<'_, Vec<(SlotId, Slot<T>)>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn disconnect(&self, id: SlotId) -> bool {
        let mut slots = self.slots();
        match slots.iter().position(|(slot_id, _)| *slot_id == id) {
            Some(pos) => {
                slots.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// A cloneable handle to a broadcast point. Clones share the same slots.
pub struct Signal<T: ?Sized> {
    inner: Arc<SignalInner<T>>,
}

impl<T: ?Sized> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ?Sized + 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized + 'static> Signal<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                next_slot: AtomicU64::new(1),
                slots: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn connect<F>(&self, slot: F) -> SlotId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SlotId(self.inner.next_slot.fetch_add(1, Ordering::Relaxed));
        self.inner.slots().push((id, Arc::new(slot)));
        id
    }

    /// Like [`Signal::connect`], but the slot is removed when the returned
    /// [`Connection`] is dropped.
    pub fn connect_scoped<F>(&self, slot: F) -> Connection<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.connect(slot);
        Connection {
            signal: Arc::downgrade(&self.inner),
            id: Some(id),
        }
    }

    /// Returns false if the slot was already gone.
    pub fn disconnect(&self, id: SlotId) -> bool {
        self.inner.disconnect(id)
    }

    pub fn emit(&self, value: &T) {
        let slots: Vec<Slot<T>> = self
            .inner
            .slots()
            .iter()
            .map(|(_, slot)| Arc::clone(slot))
            .collect();
        for slot in slots {
            slot(value);
        }
    }

    pub fn slot_count(&self) -> usize {
        self.inner.slots().len()
    }
}

/// Subscribes `callback` for a single delivery.
///
/// The registered wrapper disconnects itself before forwarding, and the
/// callback is moved out on first use, so it runs at most once even if an
/// emission that snapshotted the slot list earlier is still in flight.
pub fn connect_once<T, F>(signal: &Signal<T>, callback: F) -> SlotId
where
    T: ?Sized + 'static,
    F: FnOnce(&T) + Send + 'static,
{
    let own_id: Arc<Mutex<Option<SlotId>>> = Arc::new(Mutex::new(None));
    let callback = Mutex::new(Some(callback));
    let weak: Weak<SignalInner<T>> = Arc::downgrade(&signal.inner);
    let wrapper_id = Arc::clone(&own_id);

    let id = signal.connect(move |value: &T| {
        let id = *wrapper_id.lock().unwrap_or_else(PoisonError::into_inner);
        if let (Some(id), Some(inner)) = (id, weak.upgrade()) {
            inner.disconnect(id);
        }
        let callback = callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback(value);
        }
    });
    *own_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
    id
}

/// RAII handle for a connected slot.
#[must_use = "dropping a Connection disconnects its slot"]
pub struct Connection<T: ?Sized> {
    signal: Weak<SignalInner<T>>,
    id: Option<SlotId>,
}

impl<T: ?Sized> Connection<T> {
    pub fn disconnect(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let (Some(id), Some(inner)) = (self.id.take(), self.signal.upgrade()) {
            inner.disconnect(id);
        }
    }
}

impl<T: ?Sized> Drop for Connection<T> {
    fn drop(&mut self) {
        self.release();
    }
}
