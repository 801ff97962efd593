//! The operations a ring can stage.
//!
//! Each call takes a slot for its payload and stages one submission entry, returning the
//! [`Job`] or handing the payload back in [`RingFull`] when all slots are taken. Nothing is sent
//! to the kernel before [`Ring::submit`].
//!
//! Arguments the kernel reads asynchronously (paths, timespecs, `open_how`, iovec arrays, socket
//! addresses) are copied into the slot. Buffers the kernel reads from or writes into are the
//! caller's, which is why the calls that take them are `unsafe`.

use std::ffi::CStr;
use std::io::{IoSlice, IoSliceMut};
use std::net::SocketAddr;
use std::ops::Range;
use std::os::unix::io::RawFd;
use std::cmp;

use either::Either;
use io_uring::{opcode, types};

use iou_region_pool::Chunk;

use crate::flags::{OpenFlags, PollMask, ResolveFlags, StatxFlags, StatxMask};
use crate::net::{PeerAddr, RawSockAddr};
use crate::probe::Op;
use crate::ring::{Job, Retained, Ring, RingFull};
use crate::statx::StatxBuf;

/// The most buffers a single vectored read or write accepts (`IOV_MAX`).
pub const MAX_IOVECS: usize = 1024;

/// Part of the fixed buffer: an allocated chunk, or a raw `offset..end` byte range.
pub type FixedRegion<'a> = Either<&'a Chunk, Range<u32>>;

/// The clock a timeout is measured against.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Clock {
    /// Time since boot, including suspend.
    Boottime,
    /// Wall-clock time.
    Realtime,
}

/// The access mode of an opened file.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    fn bits(self) -> u64 {
        let mode = match self {
            Access::ReadOnly => libc::O_RDONLY,
            Access::WriteOnly => libc::O_WRONLY,
            Access::ReadWrite => libc::O_RDWR,
        };
        mode as u64
    }
}

/// Whether an unlink removes a file or an empty directory.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Unlink {
    File,
    Directory,
}

fn base_fd(base: Option<RawFd>) -> types::Fd {
    types::Fd(base.unwrap_or(libc::AT_FDCWD))
}

// -1 tells the kernel to use and advance the file position.
fn position(offset: Option<u64>) -> u64 {
    offset.unwrap_or(u64::MAX)
}

fn splice_offset(offset: Option<u64>) -> i64 {
    offset.map_or(-1, |offset| offset as i64)
}

fn buf_len(len: usize) -> u32 {
    cmp::min(len, u32::MAX as usize) as u32
}

impl<T> Ring<T> {
    /// An operation that does nothing and completes with 0.
    pub fn noop(&mut self, payload: T) -> Result<Job, RingFull<T>> {
        let entry = opcode::Nop::new().build();
        self.stage(Op::Nop, payload, Retained::Nothing, entry)
    }

    ///
    /// Complete after `nanos` nanoseconds have passed on `clock`, or, when `absolute` is set,
    /// once `clock` reads `nanos`.
    ///
    /// The completion's result is 0 when the timer fired and `-ECANCELED` when it was cancelled.
    ///
    pub fn timeout(
        &mut self,
        clock: Clock,
        nanos: u64,
        absolute: bool,
        payload: T,
    ) -> Result<Job, RingFull<T>> {
        let timespec = Box::new(
            types::Timespec::new()
                .sec(nanos / 1_000_000_000)
                .nsec((nanos % 1_000_000_000) as u32),
        );
        let mut flags = match clock {
            Clock::Boottime => types::TimeoutFlags::BOOTTIME,
            Clock::Realtime => types::TimeoutFlags::REALTIME,
        };
        if absolute {
            flags |= types::TimeoutFlags::ABS;
        }

        let entry = opcode::Timeout::new(&*timespec).flags(flags).build();
        self.stage(Op::Timeout, payload, Retained::Timespec(timespec), entry)
    }

    ///
    /// Open `path`, relative to `base` or to the working directory.
    ///
    /// The completion's result is the new descriptor. `perm` only matters when the file is
    /// created.
    ///
    #[allow(clippy::too_many_arguments)]
    pub fn openat2(
        &mut self,
        base: Option<RawFd>,
        path: &CStr,
        access: Access,
        flags: OpenFlags,
        perm: u32,
        resolve: ResolveFlags,
        payload: T,
    ) -> Result<Job, RingFull<T>> {
        let path = path.to_owned();
        let how = Box::new(
            types::OpenHow::new()
                .flags(access.bits() | flags.bits())
                .mode(u64::from(perm))
                .resolve(resolve.bits()),
        );

        let entry = opcode::OpenAt2::new(base_fd(base), path.as_ptr(), &*how).build();
        self.stage(Op::OpenAt2, payload, Retained::OpenAt { path, how }, entry)
    }

    pub fn unlink(
        &mut self,
        base: Option<RawFd>,
        path: &CStr,
        kind: Unlink,
        payload: T,
    ) -> Result<Job, RingFull<T>> {
        let path = path.to_owned();
        let flags = match kind {
            Unlink::File => 0,
            Unlink::Directory => libc::AT_REMOVEDIR,
        };

        let entry = opcode::UnlinkAt::new(base_fd(base), path.as_ptr())
            .flags(flags)
            .build();
        self.stage(Op::UnlinkAt, payload, Retained::Path(path), entry)
    }

    /// Wait until `fd` reports one of the events in `mask`. The result holds the events that
    /// occurred, see [`PollMask::from_bits_truncate`].
    pub fn poll_add(&mut self, fd: RawFd, mask: PollMask, payload: T) -> Result<Job, RingFull<T>> {
        let entry = opcode::PollAdd::new(types::Fd(fd), mask.bits()).build();
        self.stage(Op::PollAdd, payload, Retained::Nothing, entry)
    }

    ///
    /// Read into `buf` at `offset`, or at the current file position if `offset` is `None`.
    /// Sockets and pipes take `Some(0)`.
    ///
    /// # Safety
    /// The kernel writes into `buf` asynchronously. The caller must keep the memory alive, and
    /// not access it, until the completion of this operation has been returned.
    ///
    pub unsafe fn read(
        &mut self,
        fd: RawFd,
        buf: &mut [u8],
        offset: Option<u64>,
        payload: T,
    ) -> Result<Job, RingFull<T>> {
        let entry = opcode::Read::new(types::Fd(fd), buf.as_mut_ptr(), buf_len(buf.len()))
            .offset(position(offset))
            .build();
        self.stage(Op::Read, payload, Retained::Nothing, entry)
    }

    ///
    /// Write `buf` at `offset`, or at the current file position if `offset` is `None`.
    ///
    /// # Safety
    /// The kernel reads `buf` asynchronously. The caller must keep the memory alive, and not
    /// modify it, until the completion of this operation has been returned.
    ///
    pub unsafe fn write(
        &mut self,
        fd: RawFd,
        buf: &[u8],
        offset: Option<u64>,
        payload: T,
    ) -> Result<Job, RingFull<T>> {
        let entry = opcode::Write::new(types::Fd(fd), buf.as_ptr(), buf_len(buf.len()))
            .offset(position(offset))
            .build();
        self.stage(Op::Write, payload, Retained::Nothing, entry)
    }

    ///
    /// Scatter a read over `bufs`.
    ///
    /// # Panics
    /// This function will panic if more than [`MAX_IOVECS`] buffers are given.
    ///
    /// # Safety
    /// As for [`read`](Self::read), for every buffer in `bufs`. The array itself is copied.
    ///
    pub unsafe fn readv(
        &mut self,
        fd: RawFd,
        bufs: &mut [IoSliceMut<'_>],
        offset: Option<u64>,
        payload: T,
    ) -> Result<Job, RingFull<T>> {
        assert!(
            bufs.len() <= MAX_IOVECS,
            "{} buffers exceed the vectored I/O limit of {}",
            bufs.len(),
            MAX_IOVECS
        );
        let iovecs: Box<[libc::iovec]> = bufs
            .iter_mut()
            .map(|buf| libc::iovec {
                iov_base: buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: buf.len(),
            })
            .collect();

        let entry = opcode::Readv::new(types::Fd(fd), iovecs.as_ptr(), iovecs.len() as u32)
            .offset(position(offset))
            .build();
        self.stage(Op::Readv, payload, Retained::Iovecs(iovecs), entry)
    }

    ///
    /// Gather a write from `bufs`.
    ///
    /// # Panics
    /// This function will panic if more than [`MAX_IOVECS`] buffers are given.
    ///
    /// # Safety
    /// As for [`write`](Self::write), for every buffer in `bufs`. The array itself is copied.
    ///
    pub unsafe fn writev(
        &mut self,
        fd: RawFd,
        bufs: &[IoSlice<'_>],
        offset: Option<u64>,
        payload: T,
    ) -> Result<Job, RingFull<T>> {
        assert!(
            bufs.len() <= MAX_IOVECS,
            "{} buffers exceed the vectored I/O limit of {}",
            bufs.len(),
            MAX_IOVECS
        );
        let iovecs: Box<[libc::iovec]> = bufs
            .iter()
            .map(|buf| libc::iovec {
                iov_base: buf.as_ptr() as *mut libc::c_void,
                iov_len: buf.len(),
            })
            .collect();

        let entry = opcode::Writev::new(types::Fd(fd), iovecs.as_ptr(), iovecs.len() as u32)
            .offset(position(offset))
            .build();
        self.stage(Op::Writev, payload, Retained::Iovecs(iovecs), entry)
    }

    ///
    /// Read into a region of the fixed buffer, without the kernel having to map it first.
    ///
    /// # Panics
    /// This function will panic if there is no fixed buffer, if the chunk belongs to a replaced
    /// buffer, or if a raw range falls outside the buffer.
    ///
    /// # Safety
    /// The region must not be read, written, freed, or the fixed buffer replaced, until the
    /// completion of this operation has been returned.
    ///
    pub unsafe fn read_fixed(
        &mut self,
        fd: RawFd,
        region: FixedRegion<'_>,
        offset: Option<u64>,
        payload: T,
    ) -> Result<Job, RingFull<T>> {
        let (ptr, len) = self.fixed_region(region);
        let entry = opcode::ReadFixed::new(types::Fd(fd), ptr, len, 0)
            .offset(position(offset))
            .build();
        self.stage(Op::ReadFixed, payload, Retained::Nothing, entry)
    }

    ///
    /// Write a region of the fixed buffer.
    ///
    /// # Panics
    /// As for [`read_fixed`](Self::read_fixed).
    ///
    /// # Safety
    /// The region must not be written, freed, or the fixed buffer replaced, until the completion
    /// of this operation has been returned.
    ///
    pub unsafe fn write_fixed(
        &mut self,
        fd: RawFd,
        region: FixedRegion<'_>,
        offset: Option<u64>,
        payload: T,
    ) -> Result<Job, RingFull<T>> {
        let (ptr, len) = self.fixed_region(region);
        let entry = opcode::WriteFixed::new(types::Fd(fd), ptr as *const u8, len, 0)
            .offset(position(offset))
            .build();
        self.stage(Op::WriteFixed, payload, Retained::Nothing, entry)
    }

    /// Move up to `len` bytes from `fd_in` to `fd_out`, one of which must be a pipe. Offsets must
    /// be `None` for the pipe side.
    pub fn splice(
        &mut self,
        fd_in: RawFd,
        offset_in: Option<u64>,
        fd_out: RawFd,
        offset_out: Option<u64>,
        len: u32,
        payload: T,
    ) -> Result<Job, RingFull<T>> {
        let entry = opcode::Splice::new(
            types::Fd(fd_in),
            splice_offset(offset_in),
            types::Fd(fd_out),
            splice_offset(offset_out),
            len,
        )
        .build();
        self.stage(Op::Splice, payload, Retained::Nothing, entry)
    }

    ///
    /// Query the status of `path`. The carrier is kept by the ring and read back through
    /// [`Completion::metadata`](crate::Completion::metadata) once the operation succeeded.
    ///
    /// To query `base` itself, pass an empty path with [`StatxFlags::EMPTY_PATH`].
    ///
    #[allow(clippy::too_many_arguments)]
    pub fn statx(
        &mut self,
        base: Option<RawFd>,
        path: &CStr,
        flags: StatxFlags,
        mask: StatxMask,
        mut buf: StatxBuf,
        payload: T,
    ) -> Result<Job, RingFull<T>> {
        let path = path.to_owned();
        let entry = opcode::Statx::new(
            base_fd(base),
            path.as_ptr(),
            buf.as_mut_ptr() as *mut types::statx,
        )
        .flags(flags.bits())
        .mask(mask.bits())
        .build();
        self.stage(Op::Statx, payload, Retained::Statx { path, buf }, entry)
    }

    pub fn connect(
        &mut self,
        fd: RawFd,
        addr: SocketAddr,
        payload: T,
    ) -> Result<Job, RingFull<T>> {
        let addr = RawSockAddr::new(addr);
        let entry = opcode::Connect::new(types::Fd(fd), addr.as_ptr(), addr.len()).build();
        self.stage(Op::Connect, payload, Retained::SockAddr(addr), entry)
    }

    /// Accept a connection on the listening socket `fd`. The result is the new descriptor, which
    /// is close-on-exec; the peer is read with
    /// [`Completion::peer_addr`](crate::Completion::peer_addr).
    pub fn accept(
        &mut self,
        fd: RawFd,
        mut peer: PeerAddr,
        payload: T,
    ) -> Result<Job, RingFull<T>> {
        let (addr, len) = peer.as_mut_ptrs();
        let entry = opcode::Accept::new(types::Fd(fd), addr, len)
            .flags(libc::SOCK_CLOEXEC)
            .build();
        self.stage(Op::Accept, payload, Retained::Peer(peer), entry)
    }

    pub fn close(&mut self, fd: RawFd, payload: T) -> Result<Job, RingFull<T>> {
        let entry = opcode::Close::new(types::Fd(fd)).build();
        self.stage(Op::Close, payload, Retained::Nothing, entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_offsets_use_the_file_position() {
        assert_eq!(position(None) as i64, -1);
        assert_eq!(position(Some(4096)), 4096);
        assert_eq!(splice_offset(None), -1);
        assert_eq!(splice_offset(Some(7)), 7);
    }

    #[test]
    fn access_modes_match_libc() {
        assert_eq!(Access::ReadOnly.bits(), libc::O_RDONLY as u64);
        assert_eq!(Access::WriteOnly.bits(), libc::O_WRONLY as u64);
        assert_eq!(Access::ReadWrite.bits(), libc::O_RDWR as u64);
    }

    #[test]
    fn oversized_lengths_are_clamped() {
        assert_eq!(buf_len(10), 10);
        assert_eq!(buf_len(usize::MAX), u32::MAX);
    }
}
