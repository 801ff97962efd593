//! File status queries.
//!
//! A statx operation hands the kernel a record to fill in. That record is a [`StatxBuf`]: the
//! caller creates one, moves it into [`Ring::statx`](crate::Ring::statx), and the ring keeps it
//! until the operation completes. Only then does [`Completion::metadata`](crate::Completion)
//! turn it into a [`Metadata`], so the half-written record is never observable.

use std::mem::MaybeUninit;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use std::fmt;

use crate::flags::StatxMask;

/// Kernel-filled carrier for a statx result.
pub struct StatxBuf {
    inner: Box<MaybeUninit<libc::statx>>,
}

impl StatxBuf {
    pub fn new() -> Self {
        Self {
            inner: Box::new(MaybeUninit::zeroed()),
        }
    }
    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::statx {
        self.inner.as_mut_ptr()
    }
    /// Convert the record after the kernel reported success for the statx operation that owned
    /// this carrier.
    pub(crate) fn metadata(&self) -> Metadata {
        // SAFETY: the buffer is zero-initialised on creation, and all-zero is a valid statx.
        let raw = unsafe { self.inner.assume_init_ref() };
        Metadata::from_raw(raw)
    }
}
impl Default for StatxBuf {
    fn default() -> Self {
        Self::new()
    }
}
impl fmt::Debug for StatxBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatxBuf").finish()
    }
}

/// The type of a file, from the `S_IFMT` bits of its mode.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharacterDevice,
    Fifo,
    Socket,
    Unknown,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFREG => Self::Regular,
            libc::S_IFDIR => Self::Directory,
            libc::S_IFLNK => Self::Symlink,
            libc::S_IFBLK => Self::BlockDevice,
            libc::S_IFCHR => Self::CharacterDevice,
            libc::S_IFIFO => Self::Fifo,
            libc::S_IFSOCK => Self::Socket,
            _ => Self::Unknown,
        }
    }
}

/// Seconds and nanoseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: u32,
}

impl Timestamp {
    fn from_raw(raw: &libc::statx_timestamp) -> Self {
        Self {
            sec: raw.tv_sec,
            nsec: raw.tv_nsec,
        }
    }
    pub fn to_system_time(self) -> SystemTime {
        let nsec = Duration::from_nanos(u64::from(self.nsec));
        if self.sec >= 0 {
            UNIX_EPOCH + Duration::from_secs(self.sec as u64) + nsec
        } else {
            UNIX_EPOCH - Duration::from_secs(self.sec.unsigned_abs()) + nsec
        }
    }
}

/// Device number split into major and minor.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct DeviceId {
    pub major: u32,
    pub minor: u32,
}

/// The status of a file as reported by a completed statx operation.
///
/// Fields the kernel did not fill in are zero; [`mask`](Self::mask) says which ones are valid.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Metadata {
    mask: StatxMask,
    kind: FileKind,
    mode: u32,
    nlink: u32,
    uid: u32,
    gid: u32,
    ino: u64,
    size: u64,
    blocks: u64,
    blksize: u32,
    attributes: u64,
    dev: DeviceId,
    rdev: DeviceId,
    atime: Timestamp,
    mtime: Timestamp,
    ctime: Timestamp,
    btime: Option<Timestamp>,
}

impl Metadata {
    pub(crate) fn from_raw(raw: &libc::statx) -> Self {
        let mask = StatxMask::from_bits_truncate(raw.stx_mask);
        let mode = u32::from(raw.stx_mode);

        Self {
            mask,
            kind: FileKind::from_mode(mode),
            mode,
            nlink: raw.stx_nlink,
            uid: raw.stx_uid,
            gid: raw.stx_gid,
            ino: raw.stx_ino,
            size: raw.stx_size,
            blocks: raw.stx_blocks,
            blksize: raw.stx_blksize,
            attributes: raw.stx_attributes,
            dev: DeviceId {
                major: raw.stx_dev_major,
                minor: raw.stx_dev_minor,
            },
            rdev: DeviceId {
                major: raw.stx_rdev_major,
                minor: raw.stx_rdev_minor,
            },
            atime: Timestamp::from_raw(&raw.stx_atime),
            mtime: Timestamp::from_raw(&raw.stx_mtime),
            ctime: Timestamp::from_raw(&raw.stx_ctime),
            btime: if mask.contains(StatxMask::BTIME) {
                Some(Timestamp::from_raw(&raw.stx_btime))
            } else {
                None
            },
        }
    }

    /// The fields the kernel actually filled in.
    pub fn mask(&self) -> StatxMask {
        self.mask
    }
    pub fn kind(&self) -> FileKind {
        self.kind
    }
    pub fn is_file(&self) -> bool {
        self.kind == FileKind::Regular
    }
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
    /// Permission bits, including setuid, setgid and sticky.
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
    /// The raw mode, type bits included.
    pub fn mode(&self) -> u32 {
        self.mode
    }
    pub fn nlink(&self) -> u32 {
        self.nlink
    }
    pub fn uid(&self) -> u32 {
        self.uid
    }
    pub fn gid(&self) -> u32 {
        self.gid
    }
    pub fn ino(&self) -> u64 {
        self.ino
    }
    pub fn size(&self) -> u64 {
        self.size
    }
    /// Number of 512-byte blocks allocated.
    pub fn blocks(&self) -> u64 {
        self.blocks
    }
    /// Preferred I/O block size.
    pub fn blksize(&self) -> u32 {
        self.blksize
    }
    /// `STATX_ATTR_*` bits.
    pub fn attributes(&self) -> u64 {
        self.attributes
    }
    /// Device containing the file.
    pub fn dev(&self) -> DeviceId {
        self.dev
    }
    /// Device the file represents, for device special files.
    pub fn rdev(&self) -> DeviceId {
        self.rdev
    }
    pub fn accessed(&self) -> Timestamp {
        self.atime
    }
    pub fn modified(&self) -> Timestamp {
        self.mtime
    }
    /// Time of the last status change.
    pub fn changed(&self) -> Timestamp {
        self.ctime
    }
    /// Creation time, if the filesystem reports one.
    pub fn created(&self) -> Option<Timestamp> {
        self.btime
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_statx() -> libc::statx {
        // SAFETY: statx is plain old data.
        let mut raw: libc::statx = unsafe { std::mem::zeroed() };
        raw.stx_mask = (StatxMask::BASIC_STATS | StatxMask::BTIME).bits();
        raw.stx_mode = (libc::S_IFREG | 0o640) as u16;
        raw.stx_size = 4096;
        raw.stx_nlink = 1;
        raw.stx_uid = 1000;
        raw.stx_ino = 42;
        raw.stx_mtime.tv_sec = 1_600_000_000;
        raw.stx_mtime.tv_nsec = 5;
        raw.stx_btime.tv_sec = 1_500_000_000;
        raw.stx_dev_major = 8;
        raw.stx_dev_minor = 1;
        raw
    }

    #[test]
    fn converts_raw_record() {
        let metadata = Metadata::from_raw(&raw_statx());

        assert!(metadata.is_file());
        assert_eq!(metadata.permissions(), 0o640);
        assert_eq!(metadata.size(), 4096);
        assert_eq!(metadata.uid(), 1000);
        assert_eq!(metadata.ino(), 42);
        assert_eq!(metadata.dev(), DeviceId { major: 8, minor: 1 });
        assert_eq!(
            metadata.modified(),
            Timestamp {
                sec: 1_600_000_000,
                nsec: 5
            }
        );
        assert_eq!(metadata.created().map(|t| t.sec), Some(1_500_000_000));
    }

    #[test]
    fn missing_btime_is_none() {
        let mut raw = raw_statx();
        raw.stx_mask = StatxMask::BASIC_STATS.bits();
        assert_eq!(Metadata::from_raw(&raw).created(), None);
    }

    #[test]
    fn file_kinds() {
        assert_eq!(FileKind::from_mode(libc::S_IFDIR | 0o755), FileKind::Directory);
        assert_eq!(FileKind::from_mode(libc::S_IFLNK), FileKind::Symlink);
        assert_eq!(FileKind::from_mode(libc::S_IFIFO), FileKind::Fifo);
        assert_eq!(FileKind::from_mode(0), FileKind::Unknown);
    }

    #[test]
    fn timestamps_convert_to_system_time() {
        let ts = Timestamp { sec: 10, nsec: 500 };
        assert_eq!(
            ts.to_system_time(),
            UNIX_EPOCH + Duration::new(10, 500)
        );
    }
}
