//! A bounded, payload-carrying interface to Linux `io_uring`.
//!
//! A [`Ring`] stages operations, each with a caller-chosen payload, and hands every payload back
//! exactly once together with the kernel's result. The number of operations that can be active
//! at once is fixed when the ring is created; when it is reached, staging returns [`RingFull`]
//! with the payload instead of blocking or growing.
//!
//! ```no_run
//! use iou_ring::Ring;
//!
//! # fn main() -> Result<(), iou_ring::Error> {
//! let mut ring = Ring::create(4, None)?;
//!
//! for name in ["a", "b", "c"].iter() {
//!     ring.noop(*name).expect("the ring has room for three");
//! }
//! ring.submit()?;
//!
//! while let Some(completion) = ring.wait(None)? {
//!     println!("{} finished with {}", completion.payload(), completion.result());
//! }
//! ring.exit();
//! # Ok(())
//! # }
//! ```
//!
//! Operations that give the kernel access to caller memory are `unsafe`. Arguments the kernel
//! merely reads while setting up an operation (paths, timespecs, socket addresses) are copied
//! into the ring and kept until the operation completes.

pub mod heap;

#[cfg(target_os = "linux")]
pub mod error;
#[cfg(target_os = "linux")]
pub mod flags;
#[cfg(target_os = "linux")]
pub mod net;
#[cfg(target_os = "linux")]
pub mod ops;
#[cfg(target_os = "linux")]
pub mod probe;
#[cfg(target_os = "linux")]
pub mod ring;
#[cfg(target_os = "linux")]
pub mod statx;
#[cfg(target_os = "linux")]
pub mod sync;

pub use heap::{JobHeap, JobId};
pub use iou_region_pool::{AllocError, Chunk, PoolId};

#[cfg(target_os = "linux")]
pub use self::{
    error::{Errno, Error, Result},
    flags::{FlagSet, OpenFlags, PollMask, ResolveFlags, StatxFlags, StatxMask},
    net::PeerAddr,
    ops::{Access, Clock, FixedRegion, Unlink, MAX_IOVECS},
    probe::{Op, Probe},
    ring::{Completion, Job, Ring, RingBuilder, RingFull, RingState, Stats, MAX_QUEUE_DEPTH},
    statx::{DeviceId, FileKind, Metadata, StatxBuf, Timestamp},
    sync::SharedRing,
};
