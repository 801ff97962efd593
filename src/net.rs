//! Socket addresses for connect and accept.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::{fmt, mem, ptr};

/// A socket address in the kernel's representation. Boxed by the ring so its address stays put
/// while a connect operation is in flight.
pub(crate) struct RawSockAddr {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl RawSockAddr {
    pub(crate) fn new(addr: SocketAddr) -> Box<Self> {
        // SAFETY: sockaddr_storage is plain old data, zero is a valid bit pattern.
        let mut raw = Box::new(Self {
            storage: unsafe { mem::zeroed() },
            len: 0,
        });
        raw.len = write_sockaddr(addr, &mut raw.storage);
        raw
    }
    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const libc::sockaddr_storage as *const libc::sockaddr
    }
    pub(crate) fn len(&self) -> libc::socklen_t {
        self.len
    }
}

/// Carrier for the peer address of an accepted connection.
///
/// Created empty, moved into [`Ring::accept`](crate::Ring::accept), and returned through the
/// completion, where [`Completion::peer_addr`](crate::Completion::peer_addr) reads it.
pub struct PeerAddr {
    inner: Box<RawSockAddr>,
}

impl PeerAddr {
    pub fn new() -> Self {
        // SAFETY: as in RawSockAddr::new.
        Self {
            inner: Box::new(RawSockAddr {
                storage: unsafe { mem::zeroed() },
                len: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
            }),
        }
    }
    pub(crate) fn as_mut_ptrs(&mut self) -> (*mut libc::sockaddr, *mut libc::socklen_t) {
        (
            &mut self.inner.storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut self.inner.len,
        )
    }
    /// Read the address once the accept that owned this carrier has succeeded. Returns `None`
    /// for address families other than IPv4 and IPv6.
    pub(crate) fn to_socket_addr(&self) -> Option<SocketAddr> {
        read_sockaddr(&self.inner.storage, self.inner.len)
    }
}
impl Default for PeerAddr {
    fn default() -> Self {
        Self::new()
    }
}
impl fmt::Debug for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerAddr")
            .field("len", &self.inner.len)
            .finish()
    }
}

fn read_sockaddr(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET if len as usize >= mem::size_of::<libc::sockaddr_in>() => {
            // SAFETY: the family says the storage holds a sockaddr_in, and it is large enough.
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)),
                u16::from_be(sa.sin_port),
            )))
        }
        libc::AF_INET6 if len as usize >= mem::size_of::<libc::sockaddr_in6>() => {
            // SAFETY: as above, for sockaddr_in6.
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sa.sin6_addr.s6_addr),
                u16::from_be(sa.sin6_port),
                sa.sin6_flowinfo,
                sa.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

fn write_sockaddr(addr: SocketAddr, storage: &mut libc::sockaddr_storage) -> libc::socklen_t {
    // SAFETY: zeroing plain old data.
    unsafe {
        ptr::write_bytes(storage as *mut libc::sockaddr_storage, 0, 1);
    }
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in;
            // SAFETY: sockaddr_storage is large enough and suitably aligned for sockaddr_in.
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in6;
            // SAFETY: as above, for sockaddr_in6.
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_round_trip() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let raw = RawSockAddr::new(addr);
        assert_eq!(raw.len() as usize, mem::size_of::<libc::sockaddr_in>());
        assert_eq!(read_sockaddr(&raw.storage, raw.len()), Some(addr));
    }

    #[test]
    fn v6_round_trip() {
        let addr: SocketAddr = "[::1]:443".parse().unwrap();
        let raw = RawSockAddr::new(addr);
        assert_eq!(read_sockaddr(&raw.storage, raw.len()), Some(addr));
    }

    #[test]
    fn fresh_peer_addr_is_unknown() {
        let peer = PeerAddr::new();
        assert_eq!(peer.to_socket_addr(), None);
    }
}
