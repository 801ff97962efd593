//! The job slot allocator.
//!
//! Every operation staged on a ring occupies one slot of a [`JobHeap`] from the moment it is
//! staged until its completion has been observed. The slot's [`JobId`] is what travels through
//! the kernel as the entry's user data, and is how a completion finds its way back to the
//! caller's payload.
//!
//! Identifiers are reused, so each slot also carries a generation that is bumped whenever the
//! slot is released. A `JobId` names one specific occupation of a slot; looking up a slot with an
//! id from an earlier occupation is a bug in the caller and panics instead of silently returning
//! someone else's payload.

use std::fmt;

use crossbeam_queue::ArrayQueue;

/// Identifier of one occupied slot, packed into the 64-bit user data of an `io_uring` entry as
/// `generation << 32 | index`.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct JobId {
    index: u32,
    generation: u32,
}

impl JobId {
    pub fn index(self) -> u32 {
        self.index
    }
    pub fn generation(self) -> u32 {
        self.generation
    }
    pub fn to_user_data(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }
    pub fn from_user_data(user_data: u64) -> Self {
        Self {
            index: user_data as u32,
            generation: (user_data >> 32) as u32,
        }
    }
}
impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({}@{})", self.index, self.generation)
    }
}

/// Returned by [`JobHeap::allocate`] when every slot is taken. Carries the entry back so the
/// caller keeps ownership of it.
#[derive(Debug)]
pub struct HeapFull<T>(pub T);

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    entry: Option<T>,
}

/// Bounded map from [`JobId`]s to entries.
pub struct JobHeap<T> {
    slots: Vec<Slot<T>>,

    // Indices of unoccupied slots. Handed out first-in first-out, so a released index goes to the
    // back of the line and is reused as late as possible.
    free: ArrayQueue<u32>,

    len: usize,
}

impl<T> JobHeap<T> {
    /// Create a heap with room for `capacity` simultaneous entries.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or does not fit in a 32-bit index.
    pub fn with_capacity(capacity: usize) -> Self {
        assert_ne!(capacity, 0, "a job heap needs at least one slot");
        assert!(
            capacity < u32::max_value() as usize,
            "job heap capacity {} is too large",
            capacity
        );

        let free = ArrayQueue::new(capacity);
        let mut slots = Vec::with_capacity(capacity);

        for index in 0..capacity as u32 {
            slots.push(Slot {
                generation: 0,
                entry: None,
            });
            free.push(index)
                .expect("free list cannot overflow while being filled to capacity");
        }

        Self {
            slots,
            free,
            len: 0,
        }
    }
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Store `entry` in a free slot.
    pub fn allocate(&mut self, entry: T) -> Result<JobId, HeapFull<T>> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => return Err(HeapFull(entry)),
        };
        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.entry.is_none(), "free list handed out an occupied slot");

        slot.entry = Some(entry);
        self.len += 1;

        Ok(JobId {
            index,
            generation: slot.generation,
        })
    }

    /// Whether `id` names the current occupation of its slot.
    pub fn contains(&self, id: JobId) -> bool {
        self.slots
            .get(id.index as usize)
            .map_or(false, |slot| {
                slot.generation == id.generation && slot.entry.is_some()
            })
    }

    fn slot(&self, id: JobId) -> &Slot<T> {
        match self.slots.get(id.index as usize) {
            Some(slot) if slot.generation == id.generation && slot.entry.is_some() => slot,
            Some(slot) => panic!(
                "stale {:?}: slot is at generation {} and {}",
                id,
                slot.generation,
                if slot.entry.is_some() { "occupied" } else { "free" }
            ),
            None => panic!("{:?} is out of range for a heap of {} slots", id, self.slots.len()),
        }
    }

    /// Look up an entry without releasing it.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not currently allocated.
    pub fn peek(&self, id: JobId) -> &T {
        self.slot(id)
            .entry
            .as_ref()
            .expect("slot was checked to be occupied")
    }
    /// Mutable variant of [`peek`](Self::peek).
    pub fn peek_mut(&mut self, id: JobId) -> &mut T {
        self.slot(id);
        self.slots[id.index as usize]
            .entry
            .as_mut()
            .expect("slot was checked to be occupied")
    }

    /// Remove and return the entry of `id`, making the slot available again under a new
    /// generation.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not currently allocated.
    pub fn release(&mut self, id: JobId) -> T {
        self.slot(id);

        let slot = &mut self.slots[id.index as usize];
        let entry = slot.entry.take().expect("slot was checked to be occupied");
        slot.generation = slot.generation.wrapping_add(1);
        self.len -= 1;

        self.free
            .push(id.index)
            .expect("free list overflowed: a slot was released twice");

        entry
    }

    /// Give up on every entry without running its destructor. Used when the memory owned by the
    /// entries may still be referenced by the kernel.
    pub(crate) fn leak_entries(&mut self) {
        for slot in &mut self.slots {
            if let Some(entry) = slot.entry.take() {
                std::mem::forget(entry);
            }
        }
        self.len = 0;
    }
}

impl<T> fmt::Debug for JobHeap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHeap")
            .field("capacity", &self.capacity())
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;

    #[test]
    fn fills_up_and_hands_the_entry_back() {
        let mut heap = JobHeap::with_capacity(4);
        let ids: Vec<_> = (0..4).map(|i| heap.allocate(i).unwrap()).collect();

        assert!(heap.is_full());
        match heap.allocate(99) {
            Err(HeapFull(entry)) => assert_eq!(entry, 99),
            Ok(id) => panic!("allocated {:?} past capacity", id),
        }

        let unique: HashSet<_> = ids.iter().map(|id| id.index()).collect();
        assert_eq!(unique.len(), 4);

        for (i, id) in ids.into_iter().enumerate() {
            assert_eq!(heap.release(id), i);
        }
        assert!(heap.is_empty());
    }

    #[test]
    fn peek_does_not_release() {
        let mut heap = JobHeap::with_capacity(2);
        let id = heap.allocate("payload").unwrap();

        assert_eq!(*heap.peek(id), "payload");
        *heap.peek_mut(id) = "changed";
        assert_eq!(heap.len(), 1);
        assert_eq!(heap.release(id), "changed");
    }

    #[test]
    fn released_index_is_reused_last() {
        let mut heap = JobHeap::with_capacity(3);
        let first = heap.allocate(()).unwrap();
        heap.release(first);

        let second = heap.allocate(()).unwrap();
        assert_ne!(second.index(), first.index());

        let third = heap.allocate(()).unwrap();
        let fourth = heap.allocate(()).unwrap();
        assert_eq!(fourth.index(), first.index());
        assert_ne!(fourth, first);
        assert_eq!(fourth.generation(), first.generation() + 1);

        assert!(!heap.contains(first));
        assert!(heap.contains(second) && heap.contains(third) && heap.contains(fourth));
    }

    #[test]
    fn user_data_round_trip_keeps_the_generation() {
        let mut heap = JobHeap::with_capacity(1);
        for _ in 0..5 {
            let id = heap.allocate(()).unwrap();
            assert_eq!(JobId::from_user_data(id.to_user_data()), id);
            heap.release(id);
        }
        let id = heap.allocate(()).unwrap();
        assert_eq!(id.generation(), 5);
        assert_eq!(id.to_user_data(), 5 << 32);
    }

    #[test]
    fn random_traffic_returns_every_payload_once() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let mut heap = JobHeap::with_capacity(16);
        let mut live: Vec<(JobId, u32)> = Vec::new();

        for payload in 0..2000u32 {
            if !live.is_empty() && (heap.is_full() || rng.gen_bool(0.4)) {
                let (id, expected) = live.swap_remove(rng.gen_range(0, live.len()));
                assert_eq!(heap.release(id), expected);
            } else {
                let id = heap.allocate(payload).unwrap();
                assert!(live.iter().all(|&(other, _)| other.index() != id.index()));
                live.push((id, payload));
            }
            assert_eq!(heap.len(), live.len());
        }
    }

    #[test]
    #[should_panic(expected = "stale")]
    fn releasing_twice_panics() {
        let mut heap = JobHeap::with_capacity(2);
        let id = heap.allocate(1).unwrap();
        heap.release(id);
        heap.release(id);
    }

    #[test]
    #[should_panic(expected = "stale")]
    fn stale_id_does_not_match_new_occupant() {
        let mut heap = JobHeap::with_capacity(1);
        let old = heap.allocate(1).unwrap();
        heap.release(old);
        let _new = heap.allocate(2).unwrap();
        heap.peek(old);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn foreign_id_panics() {
        let heap: JobHeap<()> = JobHeap::with_capacity(1);
        heap.peek(JobId::from_user_data(7));
    }
}
