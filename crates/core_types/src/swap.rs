//! Two-handle "color" routing: readers pin one slot while the other takes
//! writes; a swap flips the roles and spins until the ex-reader slot has no
//! pinned readers left, at which point it is safe to flush.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct ColorPair<T> {
    slots: [T; 2],
    active: AtomicUsize,
    inflight: [AtomicUsize; 2],
}

impl<T> ColorPair<T> {
    pub fn new(black: T, white: T) -> Self {
        Self {
            slots: [black, white],
            active: AtomicUsize::new(0),
            inflight: [AtomicUsize::new(0), AtomicUsize::new(0)],
        }
    }

    /// Pins the current read slot. The pin must be short-lived; a swap spins
    /// until every pin on the ex-reader slot is dropped.
    pub fn read(&self) -> ReadGuard<'_, T> {
        loop {
            let idx = self.active.load(Ordering::Acquire);
            self.inflight[idx].fetch_add(1, Ordering::AcqRel);
            if self.active.load(Ordering::Acquire) == idx {
                return ReadGuard {
                    slot: &self.slots[idx],
                    pins: &self.inflight[idx],
                };
            }
            // Raced with a swap; release the stale pin and retry.
            self.inflight[idx].fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// The slot currently taking writes.
    pub fn write(&self) -> &T {
        &self.slots[1 - self.active.load(Ordering::Acquire)]
    }

    /// Flips the roles, waits for in-flight readers of the old read slot to
    /// drain, then hands that slot back for flushing.
    pub fn swap(&self) -> &T {
        let old = self.active.load(Ordering::Acquire);
        self.active.store(1 - old, Ordering::Release);
        while self.inflight[old].load(Ordering::Acquire) != 0 {
            std::hint::spin_loop();
        }
        &self.slots[old]
    }
}

pub struct ReadGuard<'a, T> {
    slot: &'a T,
    pins: &'a AtomicUsize,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.slot
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.pins.fetch_sub(1, Ordering::AcqRel);
    }
}
