//! NETLINK_ROUTE socket with tokio epoll integration.
//!
//! Owns the kernel-control socket, subscribed to the route and rule
//! broadcast groups. All I/O is non-blocking; readiness is driven by
//! tokio's `AsyncFd` so a quiet socket never stalls the event loop.

#[cfg(target_os = "linux")]
mod linux {
    use crate::error::{Result, RtnlError};
    use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
    use std::os::fd::AsRawFd;
    use tokio::io::unix::AsyncFd;
    use tracing::{debug, warn};

    /// rtnetlink broadcast groups for route and rule notifications.
    const RTNLGRP_IPV4_ROUTE: u32 = 7;
    const RTNLGRP_IPV4_RULE: u32 = 8;
    const RTNLGRP_IPV6_ROUTE: u32 = 11;
    const RTNLGRP_IPV6_RULE: u32 = 19;

    /// Socket receive buffer size (1MB) for handling burst loads.
    const SOCKET_RECV_BUFFER_SIZE: usize = 1024 * 1024;

    fn group_bit(group: u32) -> u32 {
        1 << (group - 1)
    }

    /// Async NETLINK_ROUTE socket subscribed to route/rule broadcasts.
    pub struct AsyncRtnlSocket {
        inner: AsyncFd<Socket>,
    }

    impl AsyncRtnlSocket {
        /// Creates, binds and tunes the socket. Requires CAP_NET_ADMIN
        /// for configuration requests.
        pub fn new() -> Result<Self> {
            let mut socket = Socket::new(NETLINK_ROUTE).map_err(RtnlError::Io)?;

            let groups = group_bit(RTNLGRP_IPV4_ROUTE)
                | group_bit(RTNLGRP_IPV4_RULE)
                | group_bit(RTNLGRP_IPV6_ROUTE)
                | group_bit(RTNLGRP_IPV6_RULE);
            let addr = SocketAddr::new(0, groups);
            socket.bind(&addr).map_err(RtnlError::Io)?;
            debug!(groups, "rtnetlink socket bound to route/rule groups");

            tune_socket(&socket);

            socket.set_non_blocking(true).map_err(RtnlError::Io)?;
            let inner = AsyncFd::new(socket).map_err(RtnlError::Io)?;

            Ok(Self { inner })
        }

        /// Sends one serialized netlink message.
        pub async fn send(&self, buf: &[u8]) -> Result<usize> {
            loop {
                let mut guard = self.inner.writable().await.map_err(RtnlError::Io)?;
                match guard.try_io(|inner| inner.get_ref().send(buf, 0)) {
                    Ok(result) => return result.map_err(RtnlError::Io),
                    Err(_would_block) => continue,
                }
            }
        }

        /// Receives one datagram into `buf`, returning the number of
        /// bytes read.
        pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
            loop {
                let mut guard = self.inner.readable().await.map_err(RtnlError::Io)?;
                match guard.try_io(|inner| inner.get_ref().recv(&mut &mut buf[..], 0)) {
                    Ok(result) => return result.map_err(RtnlError::Io),
                    Err(_would_block) => continue,
                }
            }
        }
    }

    /// Tunes buffer sizes so notification bursts are not dropped.
    fn tune_socket(socket: &Socket) {
        let fd = socket.as_raw_fd();

        unsafe {
            let size = SOCKET_RECV_BUFFER_SIZE as libc::c_int;
            let ret = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &size as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            if ret < 0 {
                warn!("failed to set SO_RCVBUF, using default buffer size");
            } else {
                debug!(size = SOCKET_RECV_BUFFER_SIZE, "set socket receive buffer");
            }

            let enable: libc::c_int = 1;
            let ret = libc::setsockopt(
                fd,
                libc::SOL_NETLINK,
                libc::NETLINK_NO_ENOBUFS,
                &enable as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            if ret < 0 {
                warn!("failed to set NETLINK_NO_ENOBUFS");
            }
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::*;

/// Mock implementation for non-Linux platforms (development only).
#[cfg(not(target_os = "linux"))]
mod mock {
    use crate::error::Result;

    pub struct AsyncRtnlSocket;

    impl AsyncRtnlSocket {
        pub fn new() -> Result<Self> {
            Ok(Self)
        }

        pub async fn send(&self, buf: &[u8]) -> Result<usize> {
            Ok(buf.len())
        }

        pub async fn recv(&self, _buf: &mut [u8]) -> Result<usize> {
            // Sleep to prevent a busy loop in development environments.
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            Ok(0)
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use mock::*;
