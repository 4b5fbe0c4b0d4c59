//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{Ipv6Addr, SocketAddrV6};
use std::os::raw::{c_int, c_void};
use std::os::unix::io::AsRawFd;

use socket2::{Domain, Protocol, Socket, Type};

// Useful type definition.
type Result<T> = std::io::Result<T>;

// Hop limit enforced on all link-local control traffic. Receivers reject
// anything lower as a spoofing attempt.
pub const CTRL_HOP_LIMIT: u8 = 255;

// Extension methods for IPv6 multicast control sockets.
pub trait SocketExt: Sized {
    // Creates a nonblocking UDP socket bound to the given port, configured
    // for link-local multicast control traffic on the given interface.
    fn new_mcast_v6(ifindex: u32, port: u16) -> Result<Self>;

    // Joins the given multicast group on the given interface.
    fn join_multicast_ifindex_v6(
        &self,
        addr: &Ipv6Addr,
        ifindex: u32,
    ) -> Result<()>;

    // Leaves the given multicast group on the given interface.
    fn leave_multicast_ifindex_v6(
        &self,
        addr: &Ipv6Addr,
        ifindex: u32,
    ) -> Result<()>;

    // Requests reception of the hop limit as ancillary data.
    fn set_ipv6_recv_hoplimit(&self, value: bool) -> Result<()>;

    // Sets the minimum accepted hop limit; the kernel drops anything
    // lower before it reaches userspace.
    fn set_ipv6_min_hopcount(&self, hopcount: u8) -> Result<()>;
}

// ===== impl Socket =====

impl SocketExt for Socket {
    fn new_mcast_v6(ifindex: u32, port: u16) -> Result<Socket> {
        let socket =
            Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        socket.set_only_v6(true)?;
        socket.set_multicast_if_v6(ifindex)?;
        socket.set_multicast_loop_v6(false)?;
        socket.set_multicast_hops_v6(CTRL_HOP_LIMIT.into())?;
        socket.set_unicast_hops_v6(CTRL_HOP_LIMIT.into())?;
        socket.set_ipv6_recv_hoplimit(true)?;
        let sockaddr =
            SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0);
        socket.bind(&sockaddr.into())?;
        Ok(socket)
    }

    fn join_multicast_ifindex_v6(
        &self,
        addr: &Ipv6Addr,
        ifindex: u32,
    ) -> Result<()> {
        let optval = libc::ipv6_mreq {
            ipv6mr_multiaddr: libc::in6_addr {
                s6_addr: addr.octets(),
            },
            ipv6mr_interface: ifindex,
        };

        setsockopt(
            self,
            libc::IPPROTO_IPV6,
            libc::IPV6_ADD_MEMBERSHIP,
            &optval as *const _ as *const c_void,
            std::mem::size_of::<libc::ipv6_mreq>() as libc::socklen_t,
        )
    }

    fn leave_multicast_ifindex_v6(
        &self,
        addr: &Ipv6Addr,
        ifindex: u32,
    ) -> Result<()> {
        let optval = libc::ipv6_mreq {
            ipv6mr_multiaddr: libc::in6_addr {
                s6_addr: addr.octets(),
            },
            ipv6mr_interface: ifindex,
        };

        setsockopt(
            self,
            libc::IPPROTO_IPV6,
            libc::IPV6_DROP_MEMBERSHIP,
            &optval as *const _ as *const c_void,
            std::mem::size_of::<libc::ipv6_mreq>() as libc::socklen_t,
        )
    }

    fn set_ipv6_recv_hoplimit(&self, value: bool) -> Result<()> {
        let optval = value as c_int;

        setsockopt(
            self,
            libc::IPPROTO_IPV6,
            libc::IPV6_RECVHOPLIMIT,
            &optval as *const _ as *const c_void,
            std::mem::size_of::<c_int>() as libc::socklen_t,
        )
    }

    fn set_ipv6_min_hopcount(&self, hopcount: u8) -> Result<()> {
        let optval = hopcount as c_int;

        setsockopt(
            self,
            libc::IPPROTO_IPV6,
            libc::IPV6_MINHOPCOUNT,
            &optval as *const _ as *const c_void,
            std::mem::size_of::<c_int>() as libc::socklen_t,
        )
    }
}

// ===== helper functions =====

fn setsockopt(
    socket: &impl AsRawFd,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: libc::socklen_t,
) -> Result<()> {
    let ret = unsafe {
        libc::setsockopt(socket.as_raw_fd(), level, optname, optval, optlen)
    };
    if ret == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
