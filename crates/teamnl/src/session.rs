//! Socket session for one team device handle.
//!
//! A session bundles the four netlink sockets a handle needs: a blocking
//! generic netlink socket for control queries, a generic netlink socket
//! subscribed to the team `change_event` multicast group, a route netlink
//! connection for device management, and a route netlink socket subscribed
//! to link notifications. The two event sockets are never blocked on; their
//! raw fds are exposed so the application decides when to pump.

use std::os::unix::io::{AsRawFd, RawFd};

use tracing::debug;

use crate::codec::{TEAM_GENL_CHANGE_EVENT_MC_GRP_NAME, TEAM_GENL_NAME};
use crate::error::{Result, TeamError};
use crate::netlink::builder::MessageBuilder;
use crate::netlink::genl::{FamilyInfo, resolve_family};
use crate::netlink::message::{MessageIter, NlMsgError};
use crate::netlink::socket::{NetlinkSocket, Protocol, RTNLGRP_LINK};
use crate::rtnl::RtnlConnection;

pub struct TeamSession {
    /// Blocking control socket (queries and sets).
    control: NetlinkSocket,
    /// Non-blocking event socket, member of the change_event group.
    events: NetlinkSocket,
    /// Device management connection.
    rtnl: RtnlConnection,
    /// Non-blocking link notification socket, member of RTNLGRP_LINK.
    rtnl_events: NetlinkSocket,
    /// Resolved team family.
    family: FamilyInfo,
}

impl TeamSession {
    /// Open all sockets and resolve the team family.
    pub fn new() -> Result<Self> {
        let mut control = NetlinkSocket::new(Protocol::Generic)?;
        let family = resolve_family(&mut control, TEAM_GENL_NAME)?;
        debug!(family_id = family.id, "resolved team genl family");

        let mut events = NetlinkSocket::new(Protocol::Generic)?;
        let group = family
            .mcast_groups
            .get(TEAM_GENL_CHANGE_EVENT_MC_GRP_NAME)
            .copied()
            .ok_or(TeamError::DeviceDriverUnavailable)?;
        events.add_membership(group)?;

        let rtnl = RtnlConnection::new()?;
        let mut rtnl_events = NetlinkSocket::new(Protocol::Route)?;
        rtnl_events.add_membership(RTNLGRP_LINK)?;

        Ok(Self {
            control,
            events,
            rtnl,
            rtnl_events,
            family,
        })
    }

    /// The dynamically assigned team family id.
    pub fn family_id(&self) -> u16 {
        self.family.id
    }

    /// The device management connection.
    pub fn rtnl(&mut self) -> &mut RtnlConnection {
        &mut self.rtnl
    }

    /// Send a control request and collect the reply datagrams.
    ///
    /// Blocks until a terminal message arrives: an error or ack (which ends
    /// the exchange), a DONE, or a non-multipart reply. Error codes from the
    /// kernel are mapped into the error taxonomy; the returned datagrams
    /// still carry any reply payload that preceded the terminal message.
    pub fn request(&mut self, mut builder: MessageBuilder) -> Result<Vec<Vec<u8>>> {
        let seq = self.control.next_seq();
        builder.set_seq(seq);
        builder.set_pid(self.control.pid());
        self.control.send(&builder.finish())?;

        let mut datagrams = Vec::new();
        loop {
            let response = self.control.recv_msg()?;
            let mut done = false;

            for result in MessageIter::new(&response) {
                let (header, payload) = result?;
                if header.nlmsg_seq != seq {
                    continue;
                }
                if header.is_error() {
                    let err = NlMsgError::from_bytes(payload)?;
                    if !err.is_ack() {
                        return Err(TeamError::from_errno(err.error));
                    }
                    done = true;
                    break;
                }
                if header.is_done() {
                    done = true;
                    break;
                }
                if !header.is_multi() {
                    done = true;
                }
            }

            datagrams.push(response);
            if done {
                return Ok(datagrams);
            }
        }
    }

    /// Drain buffered team change notifications without blocking.
    pub fn drain_team_events(&mut self) -> Result<Vec<Vec<u8>>> {
        self.events.recv_available()
    }

    /// Drain buffered link notifications without blocking.
    pub fn drain_link_events(&mut self) -> Result<Vec<Vec<u8>>> {
        self.rtnl_events.recv_available()
    }

    /// Raw fd of the team event socket, for readiness polling.
    pub fn event_fd(&self) -> RawFd {
        self.events.as_raw_fd()
    }

    /// Raw fd of the link notification socket, for readiness polling.
    pub fn rtnl_event_fd(&self) -> RawFd {
        self.rtnl_events.as_raw_fd()
    }
}
