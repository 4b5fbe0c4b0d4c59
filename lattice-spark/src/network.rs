//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::io::IoSliceMut;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use lattice_utils::socket::{SocketExt, CTRL_HOP_LIMIT};
use lattice_utils::task::Task;
use nix::sys::socket;
use nix::sys::socket::{ControlMessageOwned, SockaddrIn6};
use socket2::Socket;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc::Sender;
use tracing::{debug_span, Instrument};

use crate::error::IoError;
use crate::packet::{SparkMsg, MAX_PACKET_SIZE};

// One received discovery datagram, before validation.
#[derive(Debug)]
pub(crate) struct RxPacket {
    pub if_name: String,
    pub src: Ipv6Addr,
    pub hop_limit: Option<u8>,
    pub msg: Result<SparkMsg, crate::error::DecodeError>,
    pub rcvd_ts_us: u64,
}

// ===== global functions =====

// Microsecond wall-clock timestamp carried in hello messages.
pub(crate) fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or_default()
}

// Opens the per-interface multicast socket.
pub(crate) fn mcast_socket(
    ifindex: u32,
    group: &Ipv6Addr,
    port: u16,
) -> Result<AsyncFd<Socket>, IoError> {
    let socket = Socket::new_mcast_v6(ifindex, port)
        .map_err(IoError::SocketError)?;
    socket
        .join_multicast_ifindex_v6(group, ifindex)
        .map_err(IoError::MulticastJoinError)?;
    // The kernel drops anything below the control-plane hop limit
    // before it reaches us.
    socket
        .set_ipv6_min_hopcount(CTRL_HOP_LIMIT)
        .map_err(IoError::SocketError)?;
    AsyncFd::new(socket).map_err(IoError::SocketError)
}

// Receive loop for one interface.
pub(crate) fn rx_task(
    if_name: String,
    socket: Arc<AsyncFd<Socket>>,
    packet_rxp: Sender<RxPacket>,
) -> Task<()> {
    let span = debug_span!("network", interface = %if_name);
    Task::spawn_supervised(move || {
        let if_name = if_name.clone();
        let socket = socket.clone();
        let packet_rxp = packet_rxp.clone();
        async move {
            read_loop(if_name, socket, packet_rxp).await;
        }
        .instrument(span.clone())
    })
}

async fn read_loop(
    if_name: String,
    socket: Arc<AsyncFd<Socket>>,
    packet_rxp: Sender<RxPacket>,
) {
    let mut buf = [0; MAX_PACKET_SIZE];

    loop {
        let result = socket
            .async_io(tokio::io::Interest::READABLE, |socket| {
                let mut iov = [IoSliceMut::new(&mut buf)];
                let mut cmsgspace = nix::cmsg_space!(libc::c_int);
                match socket::recvmsg::<SockaddrIn6>(
                    socket.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsgspace),
                    socket::MsgFlags::empty(),
                ) {
                    Ok(msg) => {
                        let hop_limit =
                            msg.cmsgs().ok().and_then(|cmsgs| {
                                cmsgs.into_iter().find_map(|cmsg| {
                                    match cmsg {
                                        ControlMessageOwned::Ipv6HopLimit(
                                            hops,
                                        ) => Some(hops as u8),
                                        _ => None,
                                    }
                                })
                            });
                        let src = msg
                            .address
                            .as_ref()
                            .map(|addr| addr.ip())
                            .unwrap_or(Ipv6Addr::UNSPECIFIED);
                        Ok((msg.bytes, src, hop_limit))
                    }
                    Err(errno) => Err(errno.into()),
                }
            })
            .await;

        match result {
            Ok((bytes, src, hop_limit)) => {
                let msg = SparkMsg::decode(&buf[..bytes]);
                let packet = RxPacket {
                    if_name: if_name.clone(),
                    src,
                    hop_limit,
                    msg,
                    rcvd_ts_us: now_us(),
                };
                if packet_rxp.send(packet).await.is_err() {
                    return;
                }
            }
            Err(error)
                if error.kind() == std::io::ErrorKind::Interrupted =>
            {
                continue;
            }
            Err(error) => {
                IoError::RecvError(error).log();
            }
        }
    }
}

// Sends one discovery message to the multicast group on the interface.
pub(crate) async fn send_msg(
    socket: &AsyncFd<Socket>,
    group: Ipv6Addr,
    port: u16,
    ifindex: u32,
    msg: &SparkMsg,
) -> Result<(), IoError> {
    let buf = match msg.encode() {
        Ok(buf) => buf,
        Err(error) => {
            return Err(IoError::SendError(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                error,
            )));
        }
    };
    let dst = SocketAddrV6::new(group, port, 0, ifindex);
    let sockaddr = SockaddrIn6::from(dst);

    socket
        .async_io(tokio::io::Interest::WRITABLE, |socket| {
            socket::sendto(
                socket.as_raw_fd(),
                &buf,
                &sockaddr,
                socket::MsgFlags::empty(),
            )
            .map(|_| ())
            .map_err(|errno| errno.into())
        })
        .await
        .map_err(IoError::SendError)
}
