//! Bitmask option domains.
//!
//! Each kind of option mask accepted by an operation is its own type, so that an open mask can
//! never be passed where a poll mask is expected even though both are plain integers underneath.
//! All of them implement [`FlagSet`], the common union/subset vocabulary.

use std::ops::BitOr;

/// Operations shared by every flag domain.
pub trait FlagSet: Copy + Eq + BitOr<Output = Self> {
    /// The set with no flag in it.
    fn none() -> Self;

    /// Every flag of either set.
    fn union(self, other: Self) -> Self {
        self | other
    }

    /// Whether every flag of `self` is also in `other`.
    fn is_subset(self, other: Self) -> bool;
}

macro_rules! impl_flag_set {
    ($($name:ident),+ $(,)?) => {$(
        impl FlagSet for $name {
            fn none() -> Self {
                Self::from_bits_truncate(0)
            }
            fn is_subset(self, other: Self) -> bool {
                other.contains(self)
            }
        }
    )+};
}

bitflags::bitflags! {
    /// Creation and status flags of `openat2(2)`, without the access mode (see
    /// [`Access`](crate::ops::Access)).
    pub struct OpenFlags: u64 {
        const APPEND = libc::O_APPEND as u64;
        const CLOEXEC = libc::O_CLOEXEC as u64;
        const CREAT = libc::O_CREAT as u64;
        const DIRECT = libc::O_DIRECT as u64;
        const DIRECTORY = libc::O_DIRECTORY as u64;
        const DSYNC = libc::O_DSYNC as u64;
        const EXCL = libc::O_EXCL as u64;
        const NOATIME = libc::O_NOATIME as u64;
        const NOCTTY = libc::O_NOCTTY as u64;
        const NOFOLLOW = libc::O_NOFOLLOW as u64;
        const NONBLOCK = libc::O_NONBLOCK as u64;
        const PATH = libc::O_PATH as u64;
        const SYNC = libc::O_SYNC as u64;
        const TMPFILE = libc::O_TMPFILE as u64;
        const TRUNC = libc::O_TRUNC as u64;
    }
}

bitflags::bitflags! {
    /// Path resolution restrictions of `openat2(2)` (`RESOLVE_*` from `linux/openat2.h`).
    pub struct ResolveFlags: u64 {
        /// Refuse to cross mount points.
        const NO_XDEV = 0x01;
        /// Refuse to follow magic links such as `/proc/self/fd/*`.
        const NO_MAGICLINKS = 0x02;
        /// Refuse to follow any symbolic link.
        const NO_SYMLINKS = 0x04;
        /// Refuse to resolve outside the base directory.
        const BENEATH = 0x08;
        /// Treat the base directory as the root during resolution.
        const IN_ROOT = 0x10;
        /// Only succeed if the lookup can be served from the dentry cache.
        const CACHED = 0x20;
    }
}

bitflags::bitflags! {
    /// Events waited for by a poll operation, and reported in its result.
    pub struct PollMask: u32 {
        const IN = libc::POLLIN as u32;
        const PRI = libc::POLLPRI as u32;
        const OUT = libc::POLLOUT as u32;
        const ERR = libc::POLLERR as u32;
        const HUP = libc::POLLHUP as u32;
        const NVAL = libc::POLLNVAL as u32;
        const RDNORM = libc::POLLRDNORM as u32;
        const RDBAND = libc::POLLRDBAND as u32;
        const WRNORM = libc::POLLWRNORM as u32;
        const WRBAND = libc::POLLWRBAND as u32;
        const RDHUP = libc::POLLRDHUP as u32;
    }
}

bitflags::bitflags! {
    /// Behaviour flags of `statx(2)`.
    pub struct StatxFlags: i32 {
        /// Operate on the base descriptor itself when the path is empty.
        const EMPTY_PATH = libc::AT_EMPTY_PATH;
        /// Do not trigger an automount of the final component.
        const NO_AUTOMOUNT = libc::AT_NO_AUTOMOUNT;
        /// Report on a final symbolic link instead of its target.
        const SYMLINK_NOFOLLOW = libc::AT_SYMLINK_NOFOLLOW;
        /// Force attribute synchronisation with a remote server.
        const FORCE_SYNC = 0x2000;
        /// Use whatever is cached, never synchronise.
        const DONT_SYNC = 0x4000;
    }
}

bitflags::bitflags! {
    /// Fields requested from (and reported back by) `statx(2)`.
    pub struct StatxMask: u32 {
        const TYPE = 0x0001;
        const MODE = 0x0002;
        const NLINK = 0x0004;
        const UID = 0x0008;
        const GID = 0x0010;
        const ATIME = 0x0020;
        const MTIME = 0x0040;
        const CTIME = 0x0080;
        const INO = 0x0100;
        const SIZE = 0x0200;
        const BLOCKS = 0x0400;
        /// Everything a plain `stat(2)` returns.
        const BASIC_STATS = 0x07ff;
        const BTIME = 0x0800;
    }
}

impl_flag_set!(OpenFlags, ResolveFlags, PollMask, StatxFlags, StatxMask);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_and_subset() {
        let rw = PollMask::IN.union(PollMask::OUT);
        assert!(PollMask::IN.is_subset(rw));
        assert!(PollMask::none().is_subset(rw));
        assert!(!rw.is_subset(PollMask::IN));
        assert!(rw.is_subset(rw));
    }

    #[test]
    fn basic_stats_covers_the_stat_fields() {
        let stat_fields = [
            StatxMask::TYPE,
            StatxMask::MODE,
            StatxMask::NLINK,
            StatxMask::UID,
            StatxMask::GID,
            StatxMask::ATIME,
            StatxMask::MTIME,
            StatxMask::CTIME,
            StatxMask::INO,
            StatxMask::SIZE,
            StatxMask::BLOCKS,
        ];
        let union = stat_fields
            .iter()
            .fold(StatxMask::none(), |acc, &field| acc.union(field));
        assert_eq!(union, StatxMask::BASIC_STATS);
        assert!(!StatxMask::BTIME.is_subset(StatxMask::BASIC_STATS));
    }

    #[test]
    fn open_flags_match_libc() {
        let flags = OpenFlags::CREAT | OpenFlags::TRUNC | OpenFlags::CLOEXEC;
        assert_eq!(
            flags.bits(),
            (libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC) as u64
        );
        assert!(OpenFlags::CREAT.is_subset(flags));
        assert!(!OpenFlags::EXCL.is_subset(flags));
    }
}
