//! Offset bookkeeping for a single fixed buffer.
//!
//! A [`RegionPool`] partitions the byte range `0..len` of one externally owned buffer into
//! [`Chunk`]s. The pool never touches the memory itself; it only guarantees that no two live
//! chunks overlap, and that every byte is either free or owned by exactly one chunk. This is what
//! an `io_uring` fixed buffer needs: the kernel addresses the buffer by offset, and the pool
//! decides which offsets an operation may use.
//!
//! Allocation is first-fit over an offset-ordered map of ranges. Freed ranges are coalesced with
//! their free neighbours immediately, so a pool whose chunks have all been released always
//! consists of a single free range again.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::{fmt, mem, ops};

use thiserror::Error;

static LAST_POOL_ID: AtomicU64 = AtomicU64::new(0);

/// Identifies the pool a chunk was carved from. Every pool gets a fresh id, so a chunk of a
/// replaced buffer can never be mistaken for a chunk of its successor.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PoolId(u64);

impl PoolId {
    fn next() -> Self {
        Self(LAST_POOL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

// One entry of the occupation map. The key is the offset of the range.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Occupation {
    size: u32,
    used: bool,
}
impl Occupation {
    const fn free(size: u32) -> Self {
        Self { size, used: false }
    }
    const fn used(size: u32) -> Self {
        Self { size, used: true }
    }
}

/// Failure to carve a chunk out of the pool.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum AllocError {
    /// No free range can hold the request, either because the pool is exhausted or because the
    /// remaining space is too fragmented.
    #[error("no free region of {len} bytes with alignment {align}")]
    NoSpace { len: u32, align: u32 },
}

/// A region of the pool, owned by whoever holds it until it is handed back with
/// [`RegionPool::free`].
///
/// Chunks are deliberately neither `Clone` nor `Copy`: the only way to return one is to move it
/// back into its pool.
#[must_use = "a chunk that is dropped instead of freed stays allocated until its pool is discarded"]
pub struct Chunk {
    offset: u32,
    len: u32,
    pool: PoolId,
}

impl Chunk {
    /// Offset of the chunk from the start of the buffer.
    pub fn offset(&self) -> u32 {
        self.offset
    }
    /// Length of the chunk, in bytes.
    pub fn len(&self) -> u32 {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    /// The byte range covered by the chunk.
    pub fn range(&self) -> ops::Range<u32> {
        self.offset..self.offset + self.len
    }
    /// The pool this chunk was allocated from.
    pub fn pool(&self) -> PoolId {
        self.pool
    }
}
impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("range", &self.range())
            .field("pool", &self.pool)
            .finish()
    }
}
impl Drop for Chunk {
    fn drop(&mut self) {
        log::debug!(
            "Dropping chunk {:?} without freeing it, the region stays allocated",
            self.range()
        );
    }
}

/// First-fit allocator over the offsets of one buffer.
pub struct RegionPool {
    id: PoolId,
    len: u32,
    in_use: u32,
    live_chunks: usize,

    // Covers 0..len without gaps or overlaps. Adjacent free ranges never exist side by side,
    // since they are merged on release.
    occ_map: BTreeMap<u32, Occupation>,
}

impl fmt::Debug for RegionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionPool")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("in_use", &self.in_use)
            .field("live_chunks", &self.live_chunks)
            .finish()
    }
}

fn align_up(offset: u32, alignment: u32) -> Option<u32> {
    assert_ne!(alignment, 0);
    assert!(alignment.is_power_of_two());

    if alignment == 1 {
        return Some(offset);
    }
    offset
        .checked_add(alignment - 1)
        .map(|off| off & !(alignment - 1))
}

impl RegionPool {
    /// Create a pool managing `len` bytes, all of them free.
    pub fn new(len: u32) -> Self {
        let mut occ_map = BTreeMap::new();
        if len > 0 {
            occ_map.insert(0, Occupation::free(len));
        }
        Self {
            id: PoolId::next(),
            len,
            in_use: 0,
            live_chunks: 0,
            occ_map,
        }
    }
    pub fn id(&self) -> PoolId {
        self.id
    }
    /// Total number of bytes managed by the pool.
    pub fn len(&self) -> u32 {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    /// Number of bytes currently handed out as chunks.
    pub fn in_use(&self) -> u32 {
        self.in_use
    }
    /// Number of bytes not handed out. Fragmentation may prevent a single chunk of this size
    /// from being allocated; see [`largest_free`](Self::largest_free).
    pub fn available(&self) -> u32 {
        self.len - self.in_use
    }
    /// Number of chunks that have been allocated and not yet freed.
    pub fn live_chunks(&self) -> usize {
        self.live_chunks
    }
    /// Whether every chunk has been returned.
    pub fn is_idle(&self) -> bool {
        self.live_chunks == 0
    }
    /// Size of the largest contiguous free range.
    pub fn largest_free(&self) -> u32 {
        self.occ_map
            .values()
            .filter(|occ| !occ.used)
            .map(|occ| occ.size)
            .max()
            .unwrap_or(0)
    }
    /// Whether `chunk` was allocated from this pool.
    pub fn owns(&self, chunk: &Chunk) -> bool {
        chunk.pool == self.id
    }

    /// Allocate `len` bytes with no alignment requirement.
    pub fn alloc(&mut self, len: u32) -> Result<Chunk, AllocError> {
        self.alloc_aligned(len, 1)
    }
    /// Allocate `len` bytes starting at an offset that is a multiple of `alignment`, which must
    /// be a power of two.
    ///
    /// # Panics
    ///
    /// Panics if `len` is zero or if `alignment` is not a power of two.
    pub fn alloc_aligned(&mut self, len: u32, alignment: u32) -> Result<Chunk, AllocError> {
        assert_ne!(len, 0, "cannot allocate an empty chunk");
        assert!(
            alignment.is_power_of_two(),
            "chunk alignment {} is not a power of two",
            alignment
        );

        let offset = self
            .acquire(len, alignment)
            .ok_or(AllocError::NoSpace { len, align: alignment })?;

        self.in_use += len;
        self.live_chunks += 1;

        log::trace!("Allocated chunk {}..{} from {:?}", offset, offset + len, self.id);

        Ok(Chunk {
            offset,
            len,
            pool: self.id,
        })
    }
    fn acquire(&mut self, len: u32, alignment: u32) -> Option<u32> {
        let (offset, size, aligned) = self
            .occ_map
            .iter()
            .filter(|(_, occ)| !occ.used)
            .find_map(|(&offset, occ)| {
                let aligned = align_up(offset, alignment)?;
                let advancement = aligned - offset;
                if occ.size >= advancement && occ.size - advancement >= len {
                    Some((offset, occ.size, aligned))
                } else {
                    None
                }
            })?;

        let removed = self
            .occ_map
            .remove(&offset)
            .expect("expected the range found by the search to still be present");
        debug_assert_eq!(removed, Occupation::free(size));

        let advancement = aligned - offset;
        if advancement > 0 {
            // Space skipped for alignment stays free in front of the new chunk.
            self.occ_map.insert(offset, Occupation::free(advancement));
        }
        self.occ_map.insert(aligned, Occupation::used(len));

        let rest = size - advancement - len;
        if rest > 0 {
            self.occ_map.insert(aligned + len, Occupation::free(rest));
        }
        Some(aligned)
    }

    /// Return a chunk to the pool, merging it with adjacent free ranges.
    ///
    /// # Panics
    ///
    /// Panics if the chunk belongs to another pool, or if its range is not currently allocated
    /// (a double free).
    pub fn free(&mut self, chunk: Chunk) {
        assert_eq!(
            chunk.pool, self.id,
            "freeing {:?} into a pool it was not allocated from",
            chunk
        );
        match self.occ_map.get(&chunk.offset) {
            Some(occ) if occ.used && occ.size == chunk.len => (),
            other => panic!(
                "freeing {:?} which is not allocated (double free?), found {:?}",
                chunk, other
            ),
        }
        self.occ_map.remove(&chunk.offset);

        let mut start = chunk.offset;
        let mut size = chunk.len;

        while self.remove_free_range_below(&mut start, &mut size) {}
        while self.remove_free_range_above(&mut start, &mut size) {}

        self.occ_map.insert(start, Occupation::free(size));

        self.in_use -= chunk.len;
        self.live_chunks -= 1;

        log::trace!("Freed chunk {:?}", chunk.range());

        // The chunk is accounted for; skip its leak notice.
        mem::forget(chunk);
    }
    fn remove_free_range_below(&mut self, start: &mut u32, size: &mut u32) -> bool {
        let (lower_offset, lower) = match self.occ_map.range(..*start).next_back() {
            Some((&offset, &occ)) => (offset, occ),
            None => return false,
        };
        if lower.used || lower_offset + lower.size != *start {
            return false;
        }
        self.occ_map.remove(&lower_offset);
        *start = lower_offset;
        *size += lower.size;
        true
    }
    fn remove_free_range_above(&mut self, start: &mut u32, size: &mut u32) -> bool {
        let end = *start + *size;
        match self.occ_map.get(&end) {
            Some(higher) if !higher.used => {
                let higher_size = higher.size;
                self.occ_map.remove(&end);
                *size += higher_size;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_disjoint(chunks: &[Chunk]) {
        for (i, a) in chunks.iter().enumerate() {
            for b in &chunks[i + 1..] {
                assert!(
                    a.range().end <= b.range().start || b.range().end <= a.range().start,
                    "{:?} overlaps {:?}",
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn two_chunks_then_full_reclaim() {
        let mut pool = RegionPool::new(4096);

        let a = pool.alloc(1024).unwrap();
        let b = pool.alloc(1024).unwrap();
        assert!(a.range().end <= b.range().start || b.range().end <= a.range().start);
        assert_eq!(pool.in_use(), 2048);

        pool.free(a);
        pool.free(b);
        assert!(pool.is_idle());

        let whole = pool.alloc(4096).unwrap();
        assert_eq!(whole.range(), 0..4096);
        pool.free(whole);
    }

    #[test]
    fn exhaustion() {
        let mut pool = RegionPool::new(4096);
        let mut chunks = Vec::new();

        loop {
            match pool.alloc(512) {
                Ok(chunk) => chunks.push(chunk),
                Err(error) => {
                    assert_eq!(error, AllocError::NoSpace { len: 512, align: 1 });
                    break;
                }
            }
        }
        assert_eq!(chunks.len(), 8);
        assert_eq!(pool.available(), 0);
        assert_disjoint(&chunks);

        for chunk in chunks {
            pool.free(chunk);
        }
        assert_eq!(pool.largest_free(), 4096);
    }

    #[test]
    fn fragmentation_is_undone_by_coalescing() {
        let mut pool = RegionPool::new(3072);
        let a = pool.alloc(1024).unwrap();
        let b = pool.alloc(1024).unwrap();
        let c = pool.alloc(1024).unwrap();

        pool.free(a);
        pool.free(c);
        assert_eq!(pool.available(), 2048);
        assert_eq!(pool.largest_free(), 1024);
        assert!(pool.alloc(2048).is_err());

        pool.free(b);
        assert_eq!(pool.largest_free(), 3072);
    }

    #[test]
    fn alignment() {
        let mut pool = RegionPool::new(4096);

        let small = pool.alloc(64).unwrap();
        let aligned = pool.alloc_aligned(128, 128).unwrap();
        let half_page = pool.alloc_aligned(2048, 2048).unwrap();

        assert_eq!(aligned.offset() % 128, 0);
        assert_eq!(half_page.offset() % 2048, 0);
        assert_disjoint(&[small, aligned, half_page]);
    }

    #[test]
    fn random_alloc_free_never_overlaps() {
        use rand::Rng;

        const SIZE: u32 = 65536;

        let mut rng = rand::thread_rng();
        let mut pool = RegionPool::new(SIZE);
        let mut live: Vec<Chunk> = Vec::new();

        for _ in 0..2000 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let len = rng.gen_range(1, 4096);
                let align = 1u32 << rng.gen_range(0u32, 6);
                if let Ok(chunk) = pool.alloc_aligned(len, align) {
                    assert_eq!(chunk.offset() % align, 0);
                    live.push(chunk);
                }
            } else {
                let index = rng.gen_range(0, live.len());
                pool.free(live.swap_remove(index));
            }
            let live_bytes: u32 = live.iter().map(Chunk::len).sum();
            assert_eq!(pool.in_use(), live_bytes);
            assert!(live_bytes <= SIZE);
            assert_disjoint(&live);
        }

        for chunk in live {
            pool.free(chunk);
        }
        assert_eq!(pool.largest_free(), SIZE);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut pool = RegionPool::new(1024);
        let chunk = pool.alloc(128).unwrap();
        let forged = Chunk {
            offset: chunk.offset,
            len: chunk.len,
            pool: chunk.pool,
        };
        pool.free(chunk);
        pool.free(forged);
    }

    #[test]
    #[should_panic(expected = "not allocated from")]
    fn foreign_chunk_panics() {
        let mut first = RegionPool::new(1024);
        let mut second = RegionPool::new(1024);
        let chunk = first.alloc(128).unwrap();
        second.free(chunk);
    }

    #[test]
    fn empty_pool_has_no_space() {
        let mut pool = RegionPool::new(0);
        assert!(pool.alloc(1).is_err());
        assert_eq!(pool.largest_free(), 0);
    }
}
