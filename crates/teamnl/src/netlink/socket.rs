//! Low-level netlink socket operations.
//!
//! Sockets here are deliberately synchronous: the control plane blocks for
//! exactly one correlated reply, and the event plane is drained without
//! blocking. Readiness detection is the calling application's job, via the
//! raw fds this module exposes.

use std::os::unix::io::{AsRawFd, RawFd};

use bytes::BytesMut;
use netlink_sys::{Socket, SocketAddr, protocols};

use crate::error::Result;

/// Receive buffer size for a single datagram.
const RECV_BUF_SIZE: usize = 32768;

/// Netlink protocol families used by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Routing/device hook (link management, link notifications).
    Route,
    /// Generic netlink (the team control protocol).
    Generic,
}

impl Protocol {
    fn as_isize(self) -> isize {
        match self {
            Protocol::Route => protocols::NETLINK_ROUTE,
            Protocol::Generic => protocols::NETLINK_GENERIC,
        }
    }
}

/// Synchronous netlink socket.
pub struct NetlinkSocket {
    socket: Socket,
    /// Sequence number counter.
    seq: u32,
    /// Local port ID (assigned by kernel).
    pid: u32,
    /// Protocol this socket uses.
    protocol: Protocol,
}

impl NetlinkSocket {
    /// Create a new netlink socket for the given protocol.
    pub fn new(protocol: Protocol) -> Result<Self> {
        let mut socket = Socket::new(protocol.as_isize())?;

        // Bind to get a port ID
        let mut addr = SocketAddr::new(0, 0);
        socket.bind(&addr)?;
        socket.get_address(&mut addr)?;
        let pid = addr.port_number();

        Ok(Self {
            socket,
            seq: 1,
            pid,
            protocol,
        })
    }

    /// Get the next sequence number.
    pub fn next_seq(&mut self) -> u32 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    /// Get the local port ID.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Get the protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Subscribe to a multicast group.
    pub fn add_membership(&mut self, group: u32) -> Result<()> {
        self.socket.add_membership(group)?;
        Ok(())
    }

    /// Unsubscribe from a multicast group.
    pub fn drop_membership(&mut self, group: u32) -> Result<()> {
        self.socket.drop_membership(group)?;
        Ok(())
    }

    /// Send a message, blocking until it is queued.
    pub fn send(&self, msg: &[u8]) -> Result<()> {
        self.socket.send(msg, 0)?;
        Ok(())
    }

    /// Receive one datagram, blocking until it arrives.
    pub fn recv_msg(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(RECV_BUF_SIZE);
        self.socket.recv(&mut buf, 0)?;
        Ok(buf.to_vec())
    }

    /// Drain all currently buffered datagrams without blocking.
    ///
    /// Returns an empty vector when nothing is pending.
    pub fn recv_available(&self) -> Result<Vec<Vec<u8>>> {
        let mut datagrams = Vec::new();

        loop {
            let mut buf = BytesMut::with_capacity(RECV_BUF_SIZE);
            match self.socket.recv(&mut buf, libc::MSG_DONTWAIT) {
                Ok(_) => datagrams.push(buf.to_vec()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(datagrams)
    }
}

impl AsRawFd for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// Multicast group for NETLINK_ROUTE link notifications.
pub const RTNLGRP_LINK: u32 = 1;
