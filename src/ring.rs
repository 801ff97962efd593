//! The ring itself: staging, submission, completion and the fixed buffer.
//!
//! A [`Ring`] owns one kernel `io_uring` and a [`JobHeap`] sized to its queue depth. Every
//! operation call (see the [`ops`](crate::ops) module) takes a slot from the heap for the caller's
//! payload and stages a submission entry whose `user_data` is the slot's [`JobId`]. Nothing reaches
//! the kernel until [`Ring::submit`] (or [`Ring::wait`], which submits first). Completions are
//! matched back to their slot through the same tag, and the slot is only released once its
//! completion has been handed to the caller.

use std::collections::VecDeque;
use std::ffi::CString;
use std::net::SocketAddr;
use std::time::Duration;
use std::{cmp, fmt, io, mem};

use io_uring::{cqueue, opcode, squeue, types, IoUring};

use iou_region_pool::{AllocError, Chunk, RegionPool};

use crate::error::{self, Errno, Error, Result};
use crate::heap::{HeapFull, JobHeap, JobId};
use crate::net::{PeerAddr, RawSockAddr};
use crate::ops::FixedRegion;
use crate::probe::{Op, Probe};
use crate::statx::{Metadata, StatxBuf};

/// The largest queue depth a ring can be created with.
pub const MAX_QUEUE_DEPTH: u32 = 16384;

/// `user_data` of the entry [`Ring::wait`] pushes on kernels without `IORING_FEAT_EXT_ARG`. It
/// never collides with a [`JobId`], whose generation would have to wrap around all 32 bits at
/// the highest possible index first.
const WAIT_TIMEOUT_TAG: u64 = u64::MAX;

/// Storage the kernel may dereference while an operation is in flight. Kept in the operation's
/// slot, so it lives exactly as long as the operation does. Most of it is only ever held.
#[allow(dead_code)]
pub(crate) enum Retained {
    Nothing,
    Timespec(Box<types::Timespec>),
    OpenAt {
        path: CString,
        how: Box<types::OpenHow>,
    },
    Path(CString),
    Iovecs(Box<[libc::iovec]>),
    Statx {
        path: CString,
        buf: StatxBuf,
    },
    SockAddr(Box<RawSockAddr>),
    Peer(PeerAddr),
}

struct Slot<T> {
    payload: T,
    op: Op,
    retained: Retained,
}

/// Where a ring is in its lifecycle.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RingState {
    Open,
    Closing,
    Closed,
}

/// A handle to a staged or in-flight operation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Job {
    id: JobId,
}

impl Job {
    pub fn id(&self) -> JobId {
        self.id
    }
    /// The `user_data` tag the kernel sees for this operation.
    pub fn tag(&self) -> u64 {
        self.id.to_user_data()
    }
}

/// Returned instead of a [`Job`] when every slot of the ring is taken. Carries the payload back
/// so the caller can retry after draining completions.
#[derive(Debug, Eq, PartialEq)]
pub struct RingFull<T>(pub T);

impl<T> RingFull<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}
impl<T> fmt::Display for RingFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "the ring is full")
    }
}
impl<T: fmt::Debug> std::error::Error for RingFull<T> {}

#[derive(Debug)]
enum Output {
    Nothing,
    Statx(StatxBuf),
    Peer(PeerAddr),
}

/// A finished operation: the kernel's result code and the payload it was staged with.
#[derive(Debug)]
pub struct Completion<T> {
    result: i32,
    payload: T,
    op: Op,
    output: Output,
}

impl<T> Completion<T> {
    /// The raw result. Negative values are negated error numbers.
    pub fn result(&self) -> i32 {
        self.result
    }
    pub fn op(&self) -> Op {
        self.op
    }
    pub fn payload(&self) -> &T {
        &self.payload
    }
    pub fn payload_mut(&mut self) -> &mut T {
        &mut self.payload
    }
    pub fn into_payload(self) -> T {
        self.payload
    }
    pub fn into_parts(self) -> (i32, T) {
        (self.result, self.payload)
    }
    pub fn decode(&self) -> Result<u32, Errno> {
        error::decode(self.result)
    }
    /// The file status of a successful statx operation; `None` for any other completion.
    pub fn metadata(&self) -> Option<Metadata> {
        match self.output {
            Output::Statx(ref buf) if self.result >= 0 => Some(buf.metadata()),
            _ => None,
        }
    }
    /// The peer of a successful accept operation, if it is an IPv4 or IPv6 address.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self.output {
            Output::Peer(ref peer) if self.result >= 0 => peer.to_socket_addr(),
            _ => None,
        }
    }
}

/// A snapshot of what a ring is holding.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Stats {
    /// Entries staged but not yet moved to the kernel.
    pub unsubmitted: usize,
    /// Occupied slots, whether staged, submitted or completed but not yet collected.
    pub active_ops: usize,
    /// Size of the current fixed buffer pool, zero if there is none.
    pub pool_size: u32,
    pub pool_in_use: u32,
    pub live_chunks: usize,
    /// Pools of replaced fixed buffers that still have chunks allocated.
    pub stale_pools: usize,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} unsubmitted, {} active, pool {}/{} bytes in {} chunks, {} stale pools",
            self.unsubmitted,
            self.active_ops,
            self.pool_in_use,
            self.pool_size,
            self.live_chunks,
            self.stale_pools
        )
    }
}

/// A builder that configures a ring.
#[derive(Debug)]
pub struct RingBuilder {
    queue_depth: u32,
    polling_timeout: Option<Duration>,
    fixed_buffer: Option<Box<[u8]>>,
}

impl RingBuilder {
    /// Start configuring a ring with room for `queue_depth` active operations.
    pub fn new(queue_depth: u32) -> Self {
        Self {
            queue_depth,
            polling_timeout: None,
            fixed_buffer: None,
        }
    }
    ///
    /// Let a kernel thread poll the submission queue, going idle after `idle` without work.
    /// Creating such a ring usually requires elevated privileges. The idle time has millisecond
    /// resolution.
    ///
    pub fn with_polling_timeout(mut self, idle: Duration) -> Self {
        self.polling_timeout = Some(idle);
        self
    }
    /// Attach a fixed buffer right away, as [`Ring::set_fixed_buffer`] would.
    pub fn with_fixed_buffer(mut self, buffer: Box<[u8]>) -> Self {
        self.fixed_buffer = Some(buffer);
        self
    }
    ///
    /// Create the kernel rings.
    ///
    /// The submission queue gets one entry more than the queue depth, which the ring keeps for
    /// the timeout of [`Ring::wait`] on kernels that cannot pass it to `io_uring_enter` directly.
    ///
    pub fn build<T>(self) -> Result<Ring<T>> {
        if self.queue_depth == 0 || self.queue_depth > MAX_QUEUE_DEPTH {
            return Err(Error::InvalidQueueDepth {
                depth: self.queue_depth,
                max: MAX_QUEUE_DEPTH,
            });
        }

        let mut builder = IoUring::<squeue::Entry, cqueue::Entry>::builder();
        if let Some(idle) = self.polling_timeout {
            let idle_ms = cmp::min(idle.as_millis(), u128::from(u32::MAX)) as u32;
            builder.setup_sqpoll(idle_ms);
        }
        let uring = builder.build(self.queue_depth + 1)?;
        let ext_arg = uring.params().is_feature_ext_arg();

        log::debug!(
            "Created io_uring with {} SQ and {} CQ entries (depth {}, polling: {:?}, ext_arg: {})",
            uring.params().sq_entries(),
            uring.params().cq_entries(),
            self.queue_depth,
            self.polling_timeout,
            ext_arg,
        );

        let mut ring = Ring {
            uring: Some(uring),
            state: RingState::Open,
            queue_depth: self.queue_depth,
            polling: self.polling_timeout.is_some(),
            heap: JobHeap::with_capacity(self.queue_depth as usize),
            pending: VecDeque::with_capacity(self.queue_depth as usize),
            fixed: None,
            stale_pools: Vec::new(),
            ext_arg,
            wait_timespec: Box::new(types::Timespec::new()),
        };
        if let Some(buffer) = self.fixed_buffer {
            ring.set_fixed_buffer(buffer)?;
        }
        Ok(ring)
    }
}

struct FixedBuffer {
    memory: Box<[u8]>,
    pool: RegionPool,
}

/// An `io_uring` instance, with a bounded set of operations carrying payloads of type `T`.
///
/// A ring is driven by a single owner; wrap it in a [`SharedRing`](crate::SharedRing) to share it
/// between threads.
pub struct Ring<T> {
    uring: Option<IoUring>,
    state: RingState,
    queue_depth: u32,
    polling: bool,
    heap: JobHeap<Slot<T>>,
    pending: VecDeque<squeue::Entry>,
    fixed: Option<FixedBuffer>,
    stale_pools: Vec<RegionPool>,
    ext_arg: bool,
    wait_timespec: Box<types::Timespec>,
}

// SAFETY: the raw pointers inside staged entries and retained iovec arrays point either into
// storage the ring owns itself, or into caller memory whose validity the caller guaranteed when
// staging the operation through an unsafe call. None of it is tied to the creating thread.
unsafe impl<T: Send> Send for Ring<T> {}

impl<T> Ring<T> {
    /// Create a ring with the default configuration, optionally with kernel submission polling.
    pub fn create(queue_depth: u32, polling_timeout: Option<Duration>) -> Result<Self> {
        let builder = RingBuilder::new(queue_depth);
        match polling_timeout {
            Some(idle) => builder.with_polling_timeout(idle),
            None => builder,
        }
        .build()
    }

    pub fn state(&self) -> RingState {
        self.state
    }
    pub fn queue_depth(&self) -> u32 {
        self.queue_depth
    }
    pub fn is_polling(&self) -> bool {
        self.polling
    }
    /// Number of operations holding a slot: staged, submitted, or completed but not yet returned
    /// by [`wait`](Self::wait) or [`peek`](Self::peek).
    pub fn active_ops(&self) -> usize {
        self.heap.len()
    }
    /// Number of entries staged since the last submission.
    pub fn unsubmitted(&self) -> usize {
        self.pending.len()
    }

    fn assert_open(&self) {
        assert_eq!(
            self.state,
            RingState::Open,
            "ring used after exit was requested"
        );
    }
    fn uring(&self) -> &IoUring {
        self.uring
            .as_ref()
            .expect("an open ring always has its io_uring")
    }
    fn uring_mut(&mut self) -> &mut IoUring {
        self.uring
            .as_mut()
            .expect("an open ring always has its io_uring")
    }

    ///
    /// Take a slot for `payload` and stage `entry` under its tag.
    ///
    /// The entry may point into `retained`; the storage behind those pointers is heap allocated
    /// and does not move when `retained` is moved into the slot.
    ///
    pub(crate) fn stage(
        &mut self,
        op: Op,
        payload: T,
        retained: Retained,
        entry: squeue::Entry,
    ) -> Result<Job, RingFull<T>> {
        self.assert_open();

        let id = match self.heap.allocate(Slot {
            payload,
            op,
            retained,
        }) {
            Ok(id) => id,
            Err(HeapFull(slot)) => {
                log::debug!(
                    "Refusing {:?}, all {} slots are taken",
                    op,
                    self.heap.capacity()
                );
                return Err(RingFull(slot.payload));
            }
        };
        log::trace!("Staged {:?} as {:?}", op, id);
        self.pending.push_back(entry.user_data(id.to_user_data()));
        Ok(Job { id })
    }

    ///
    /// Move all staged entries to the kernel and tell it about them.
    ///
    /// Returns how many entries were moved. With kernel polling the submission queue may still
    /// be full of entries the kernel thread has not consumed yet; whatever does not fit stays
    /// staged for the next call.
    ///
    /// # Panics
    /// This function will panic if the ring is no longer open.
    ///
    pub fn submit(&mut self) -> Result<usize> {
        self.assert_open();
        if self.pending.is_empty() {
            return Ok(0);
        }

        let uring = self
            .uring
            .as_mut()
            .expect("an open ring always has its io_uring");
        let mut moved = 0;
        {
            let mut submission = uring.submission();
            while let Some(entry) = self.pending.front() {
                // SAFETY: a staged entry only points into its slot's retained storage, or into
                // caller memory promised to outlive the operation.
                if unsafe { submission.push(entry) }.is_err() {
                    break;
                }
                self.pending.pop_front();
                moved += 1;
            }
        }
        let consumed = uring.submit()?;

        log::debug!(
            "Submitted {} entries ({} consumed by the kernel, {} still staged)",
            moved,
            consumed,
            self.pending.len()
        );
        Ok(moved)
    }

    ///
    /// Submit whatever is staged, then block until a completion is available.
    ///
    /// Returns `Ok(None)` if `timeout` elapsed, the wait was interrupted by a signal, or no
    /// operation is active at all (so that nothing could ever complete).
    ///
    /// # Panics
    /// This function will panic if the ring is no longer open, or if the kernel reports a
    /// completion for a slot that is not occupied.
    ///
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<Completion<T>>> {
        self.submit()?;

        if let Some(completion) = self.reap() {
            return Ok(Some(completion));
        }
        if self.heap.len() == self.pending.len() {
            log::debug!("Nothing is in flight, not waiting");
            return Ok(None);
        }

        let entered = match timeout {
            Some(timeout) => self.enter_with_timeout(timeout),
            None => self.uring_mut().submit_and_wait(1),
        };
        match entered {
            Ok(_) => (),
            Err(error)
                if error.raw_os_error() == Some(libc::EINTR)
                    || error.raw_os_error() == Some(libc::ETIME) =>
            {
                log::debug!("Wait ended early: {}", error);
            }
            Err(error) => return Err(error.into()),
        }

        Ok(self.reap())
    }

    fn enter_with_timeout(&mut self, timeout: Duration) -> io::Result<usize> {
        let timespec = types::Timespec::new()
            .sec(timeout.as_secs())
            .nsec(timeout.subsec_nanos());

        if self.ext_arg {
            let args = types::SubmitArgs::new().timespec(&timespec);
            return self.uring().submitter().submit_with_args(1, &args);
        }

        *self.wait_timespec = timespec;
        let entry = opcode::Timeout::new(&*self.wait_timespec)
            .count(1)
            .build()
            .user_data(WAIT_TIMEOUT_TAG);
        let uring = self
            .uring
            .as_mut()
            .expect("an open ring always has its io_uring");

        // SAFETY: the timespec is owned by the ring and only rewritten by the next wait, by which
        // time the kernel has copied it while preparing this entry.
        if unsafe { uring.submission().push(&entry) }.is_err() {
            log::warn!("No room for the wait timeout, returning without waiting");
            return Ok(0);
        }
        uring.submit_and_wait(1)
    }

    ///
    /// Take a completion if one is ready, without submitting or blocking.
    ///
    /// # Panics
    /// This function will panic if the ring is no longer open.
    ///
    #[doc(alias = "get_cqe_nonblocking")]
    pub fn peek(&mut self) -> Option<Completion<T>> {
        self.assert_open();
        self.reap()
    }

    fn reap(&mut self) -> Option<Completion<T>> {
        loop {
            let cqe = self.uring_mut().completion().next()?;
            if cqe.user_data() == WAIT_TIMEOUT_TAG {
                log::trace!("Discarding wait timeout completion ({})", cqe.result());
                continue;
            }
            return Some(self.complete(cqe));
        }
    }

    fn complete(&mut self, cqe: cqueue::Entry) -> Completion<T> {
        let id = JobId::from_user_data(cqe.user_data());
        let Slot {
            payload,
            op,
            retained,
        } = self.heap.release(id);

        let mut result = cqe.result();
        // A timeout that simply expired is a success.
        if op == Op::Timeout && result == -libc::ETIME {
            result = 0;
        }
        log::debug!("Completed {:?} {:?} with {}", op, id, result);

        let output = match retained {
            Retained::Statx { buf, .. } => Output::Statx(buf),
            Retained::Peer(peer) => Output::Peer(peer),
            _ => Output::Nothing,
        };
        Completion {
            result,
            payload,
            op,
            output,
        }
    }

    ///
    /// Ask the kernel to cancel `job`. The cancellation is an operation of its own, with its own
    /// `payload` and slot. It completes with 0 if the target was cancelled, and with `-ENOENT`
    /// if the target had already finished; the target completes independently either way.
    ///
    /// # Panics
    /// This function will panic if `job` has already been returned by a completion.
    ///
    pub fn cancel(&mut self, job: Job, payload: T) -> Result<Job, RingFull<T>> {
        self.assert_open();
        let target = self.heap.peek(job.id).op;
        log::debug!("Cancelling {:?} ({:?})", job.id, target);

        let entry = opcode::AsyncCancel::new(job.tag()).build();
        self.stage(Op::AsyncCancel, payload, Retained::Nothing, entry)
    }

    /// Query the kernel for the operations it supports.
    pub fn probe(&self) -> Result<Probe> {
        self.assert_open();
        let mut probe = io_uring::Probe::new();
        self.uring().submitter().register_probe(&mut probe)?;
        Ok(Probe::new(probe))
    }

    pub fn stats(&self) -> Stats {
        let (pool_size, pool_in_use, live_chunks) = match self.fixed {
            Some(ref fixed) => (
                fixed.pool.len(),
                fixed.pool.in_use(),
                fixed.pool.live_chunks(),
            ),
            None => (0, 0, 0),
        };
        Stats {
            unsubmitted: self.pending.len(),
            active_ops: self.heap.len(),
            pool_size,
            pool_in_use,
            live_chunks,
            stale_pools: self.stale_pools.len(),
        }
    }

    ///
    /// Tear down the kernel rings and unregister the fixed buffer.
    ///
    /// # Panics
    /// This function will panic if the ring is not open, or if any operation is still active.
    /// Drain every completion before exiting.
    ///
    pub fn exit(&mut self) {
        self.assert_open();
        assert_eq!(
            self.heap.len(),
            0,
            "cannot exit a ring with operations still active"
        );
        self.state = RingState::Closing;

        if self.fixed.take().is_some() {
            if let Err(error) = self.uring().submitter().unregister_buffers() {
                log::warn!("Failed to unregister the fixed buffer on exit: {}", error);
            }
        }
        self.stale_pools.clear();
        self.uring = None;

        self.state = RingState::Closed;
        log::debug!("Ring closed");
    }

    ///
    /// Register `buffer` as the ring's fixed buffer, returning the one it replaces.
    ///
    /// Chunks allocated from the previous buffer remain valid to free, but can no longer be used
    /// for I/O. If pinning the new buffer fails, the previous one stays attached.
    ///
    /// # Panics
    /// This function will panic if the ring is not open or any operation is active.
    ///
    pub fn set_fixed_buffer(&mut self, buffer: Box<[u8]>) -> Result<Option<Box<[u8]>>> {
        self.assert_open();
        assert_eq!(
            self.heap.len(),
            0,
            "cannot change the fixed buffer while operations are active"
        );
        if buffer.len() > u32::MAX as usize {
            return Err(Error::BufferTooLarge(buffer.len()));
        }

        if self.fixed.is_some() {
            self.uring().submitter().unregister_buffers()?;
        }
        if let Err(source) = self.register(&buffer) {
            if let Some(ref previous) = self.fixed {
                if let Err(error) = self.register(&previous.memory) {
                    let dropped = self.detach_fixed().map_or(0, |memory| memory.len());
                    log::warn!(
                        "Dropping the previous fixed buffer of {} bytes, since registering it again failed: {}",
                        dropped,
                        error
                    );
                }
            }
            return Err(match source.raw_os_error() {
                Some(libc::ENOMEM) | Some(libc::EAGAIN) => Error::ResourceExhausted {
                    len: buffer.len(),
                    source,
                },
                _ => source.into(),
            });
        }

        log::debug!("Registered a fixed buffer of {} bytes", buffer.len());
        let pool = RegionPool::new(buffer.len() as u32);
        let previous = self.detach_fixed();
        self.fixed = Some(FixedBuffer {
            memory: buffer,
            pool,
        });
        Ok(previous)
    }

    /// Unregister and return the fixed buffer, if any.
    ///
    /// # Panics
    /// This function will panic if the ring is not open or any operation is active.
    pub fn take_fixed_buffer(&mut self) -> Result<Option<Box<[u8]>>> {
        self.assert_open();
        assert_eq!(
            self.heap.len(),
            0,
            "cannot change the fixed buffer while operations are active"
        );
        if self.fixed.is_none() {
            return Ok(None);
        }
        self.uring().submitter().unregister_buffers()?;
        log::debug!("Unregistered the fixed buffer");
        Ok(self.detach_fixed())
    }

    fn register(&self, memory: &[u8]) -> io::Result<()> {
        let iovec = libc::iovec {
            iov_base: memory.as_ptr() as *mut libc::c_void,
            iov_len: memory.len(),
        };
        // SAFETY: the memory is owned by the ring from here until it is unregistered.
        unsafe { self.uring().submitter().register_buffers(&[iovec]) }
    }

    /// Forget the current fixed buffer, keeping its pool around while chunks remain.
    fn detach_fixed(&mut self) -> Option<Box<[u8]>> {
        let FixedBuffer { memory, pool } = self.fixed.take()?;
        if !pool.is_idle() {
            log::debug!(
                "Keeping the pool of the replaced buffer until its {} chunks are freed",
                pool.live_chunks()
            );
            self.stale_pools.push(pool);
        }
        Some(memory)
    }

    /// The attached fixed buffer.
    pub fn fixed_buffer(&self) -> Option<&[u8]> {
        self.fixed.as_ref().map(|fixed| &*fixed.memory)
    }
    pub fn fixed_buffer_mut(&mut self) -> Option<&mut [u8]> {
        self.fixed.as_mut().map(|fixed| &mut *fixed.memory)
    }

    ///
    /// Allocate `len` bytes of the fixed buffer. Fails with no space if there is no fixed buffer.
    ///
    /// # Panics
    /// This function will panic if the ring is no longer open, or if `len` is zero.
    ///
    pub fn alloc_chunk(&mut self, len: u32) -> Result<Chunk, AllocError> {
        self.alloc_chunk_aligned(len, 1)
    }
    /// As [`alloc_chunk`](Self::alloc_chunk), with the chunk's offset a multiple of `align`.
    ///
    /// # Panics
    /// As for `alloc_chunk`, and if `align` is not a power of two.
    pub fn alloc_chunk_aligned(&mut self, len: u32, align: u32) -> Result<Chunk, AllocError> {
        self.assert_open();
        assert_ne!(len, 0, "cannot allocate an empty chunk");
        assert!(
            align.is_power_of_two(),
            "chunk alignment {} is not a power of two",
            align
        );
        match self.fixed {
            Some(ref mut fixed) => fixed.pool.alloc_aligned(len, align),
            None => Err(AllocError::NoSpace { len, align }),
        }
    }

    ///
    /// Return a chunk to the pool it came from, which may be the pool of a replaced buffer.
    ///
    /// # Panics
    /// This function will panic if the chunk was not allocated from this ring.
    ///
    pub fn free_chunk(&mut self, chunk: Chunk) {
        if let Some(ref mut fixed) = self.fixed {
            if fixed.pool.owns(&chunk) {
                fixed.pool.free(chunk);
                return;
            }
        }
        let index = self
            .stale_pools
            .iter()
            .position(|pool| pool.owns(&chunk))
            .unwrap_or_else(|| panic!("{:?} was not allocated from this ring", chunk));
        self.stale_pools[index].free(chunk);
        if self.stale_pools[index].is_idle() {
            log::debug!("Dropping a drained stale pool");
            self.stale_pools.swap_remove(index);
        }
    }

    fn current_fixed(&self, chunk: &Chunk) -> &FixedBuffer {
        match self.fixed {
            Some(ref fixed) if fixed.pool.owns(chunk) => fixed,
            _ => panic!("{:?} does not belong to the attached fixed buffer", chunk),
        }
    }

    /// The bytes of a chunk of the attached buffer.
    ///
    /// # Panics
    /// This function will panic if the chunk belongs to a replaced buffer or another ring.
    pub fn chunk(&self, chunk: &Chunk) -> &[u8] {
        let range = chunk.range();
        &self.current_fixed(chunk).memory[range.start as usize..range.end as usize]
    }
    pub fn chunk_mut(&mut self, chunk: &Chunk) -> &mut [u8] {
        let range = chunk.range();
        match self.fixed {
            Some(ref mut fixed) if fixed.pool.owns(chunk) => {
                &mut fixed.memory[range.start as usize..range.end as usize]
            }
            _ => panic!("{:?} does not belong to the attached fixed buffer", chunk),
        }
    }

    /// Resolve a region of the attached buffer to a pointer and a length for fixed I/O.
    pub(crate) fn fixed_region(&mut self, region: FixedRegion<'_>) -> (*mut u8, u32) {
        let fixed = match self.fixed {
            Some(ref mut fixed) => fixed,
            None => panic!("fixed buffer I/O on a ring without a fixed buffer"),
        };
        let range = region.either(
            |chunk| {
                assert!(
                    fixed.pool.owns(chunk),
                    "{:?} does not belong to the attached fixed buffer",
                    chunk
                );
                chunk.range()
            },
            |range| range,
        );
        assert!(
            range.start <= range.end && range.end <= fixed.pool.len(),
            "region {:?} is outside the fixed buffer of {} bytes",
            range,
            fixed.pool.len()
        );
        // SAFETY: the range was just checked to lie within the buffer.
        let ptr = unsafe { fixed.memory.as_mut_ptr().add(range.start as usize) };
        (ptr, range.end - range.start)
    }
}

impl<T> fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("state", &self.state)
            .field("queue_depth", &self.queue_depth)
            .field("polling", &self.polling)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        if self.state != RingState::Open {
            return;
        }
        if self.heap.is_empty() {
            self.exit();
            return;
        }

        log::warn!(
            "Leaking the fixed buffer and the storage of {} operations, since the ring was dropped while they were still active",
            self.heap.len()
        );
        if let Some(fixed) = self.fixed.take() {
            mem::forget(fixed.memory);
        }
        self.heap.leak_entries();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Instant;

    use crate::ops::Clock;

    #[test]
    fn wait_timeout_without_ext_arg() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut ring = match Ring::create(2, None) {
            Ok(ring) => ring,
            Err(error) => {
                log::warn!("Skipping, io_uring is unavailable: {}", error);
                return;
            }
        };
        // Take the path of kernels that cannot pass a timeout to io_uring_enter.
        ring.ext_arg = false;

        let job = ring
            .timeout(Clock::Boottime, 60_000_000_000, false, "timeout")
            .expect("ring has room");
        for _ in 0..5 {
            let started = Instant::now();
            match ring.wait(Some(Duration::from_millis(20))).expect("wait failed") {
                None => assert!(started.elapsed() >= Duration::from_millis(15)),
                Some(completion) => {
                    assert_eq!(completion.result(), -libc::EINVAL);
                    log::warn!("Skipping, the kernel does not know the boot clock for timeouts");
                    return;
                }
            }
            assert_eq!(ring.active_ops(), 1);
        }

        ring.cancel(job, "cancel").expect("ring has room");
        let mut payloads = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while ring.active_ops() > 0 {
            assert!(Instant::now() < deadline, "operations did not complete in time");
            if let Some(completion) = ring
                .wait(Some(Duration::from_millis(500)))
                .expect("wait failed")
            {
                payloads.push((completion.result(), completion.into_payload()));
            }
        }
        payloads.sort_unstable();
        assert_eq!(payloads, vec![(-libc::ECANCELED, "timeout"), (0, "cancel")]);
        ring.exit();
    }
}
