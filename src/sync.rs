use std::fmt;

use parking_lot::{Mutex, MutexGuard};

use crate::ring::Ring;

/// A ring that can be driven from several threads, one at a time.
pub struct SharedRing<T> {
    ring: Mutex<Ring<T>>,
}

impl<T> SharedRing<T> {
    pub fn new(ring: Ring<T>) -> Self {
        Self {
            ring: Mutex::new(ring),
        }
    }
    /// Lock the ring, retrieving a temporary guard with exclusive access to it. Blocking in
    /// [`Ring::wait`] while holding the guard blocks every other user as well.
    pub fn lock(&self) -> MutexGuard<'_, Ring<T>> {
        self.ring.lock()
    }
    pub fn try_lock(&self) -> Option<MutexGuard<'_, Ring<T>>> {
        self.ring.try_lock()
    }
    pub fn into_inner(self) -> Ring<T> {
        self.ring.into_inner()
    }
}

impl<T> From<Ring<T>> for SharedRing<T> {
    fn from(ring: Ring<T>) -> Self {
        Self::new(ring)
    }
}

impl<T> fmt::Debug for SharedRing<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ring.try_lock() {
            Some(ring) => f.debug_tuple("SharedRing").field(&*ring).finish(),
            None => f.debug_tuple("SharedRing").field(&"<locked>").finish(),
        }
    }
}
