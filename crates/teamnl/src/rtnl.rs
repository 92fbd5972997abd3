//! Routing netlink operations for team devices.
//!
//! Device lifecycle (create, recreate, destroy), port enslavement, hardware
//! address access, and name/index translation all go through NETLINK_ROUTE.
//! The team control protocol itself never creates devices; it only talks to
//! ones that already exist.

use tracing::debug;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Result, TeamError};
use crate::netlink::attr::{AttrIter, get};
use crate::netlink::builder::MessageBuilder;
use crate::netlink::message::{
    MessageIter, NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REPLACE, NLM_F_REQUEST, NlMsgError,
    RTM_DELLINK, RTM_GETLINK, RTM_NEWLINK,
};
use crate::netlink::socket::{NetlinkSocket, Protocol};

/// Link attributes (subset used here).
pub const IFLA_ADDRESS: u16 = 1;
pub const IFLA_IFNAME: u16 = 3;
pub const IFLA_MASTER: u16 = 10;
pub const IFLA_LINKINFO: u16 = 18;

/// Nested inside IFLA_LINKINFO.
pub const IFLA_INFO_KIND: u16 = 1;

/// Kind string registered by the team driver.
pub const TEAM_LINK_KIND: &str = "team";

/// Interface info header (mirrors struct ifinfomsg).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IfInfoMsg {
    pub ifi_family: u8,
    pub ifi_pad: u8,
    pub ifi_type: u16,
    pub ifi_index: i32,
    pub ifi_flags: u32,
    pub ifi_change: u32,
}

impl IfInfoMsg {
    /// Size in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Create an empty header.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the interface index.
    pub fn with_index(mut self, index: i32) -> Self {
        self.ifi_index = index;
        self
    }

    /// Get the header as bytes.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }

    /// Parse from the start of a payload.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::read_from_prefix(data)
            .map(|(msg, _)| msg)
            .map_err(|_| TeamError::Decode(format!("truncated ifinfomsg: {} bytes", data.len())))
    }
}

/// Attributes of one link, as reported by RTM_GETLINK.
#[derive(Debug, Clone, Default)]
pub struct LinkAttrs {
    pub ifindex: u32,
    pub ifname: String,
    pub hwaddr: Vec<u8>,
}

/// Synchronous NETLINK_ROUTE connection for device management.
pub struct RtnlConnection {
    socket: NetlinkSocket,
}

impl RtnlConnection {
    /// Open a route netlink socket.
    pub fn new() -> Result<Self> {
        Ok(Self {
            socket: NetlinkSocket::new(Protocol::Route)?,
        })
    }

    /// Create a new team device with the given name.
    ///
    /// Fails with `KernelRejected(EEXIST)` when the name is taken.
    pub fn create_team(&mut self, name: &str) -> Result<()> {
        debug!(name, "creating team device");
        self.new_link_request(name, NLM_F_CREATE | NLM_F_EXCL)
    }

    /// Create a team device, replacing an existing link of the same name.
    pub fn recreate_team(&mut self, name: &str) -> Result<()> {
        debug!(name, "recreating team device");
        self.new_link_request(name, NLM_F_CREATE | NLM_F_REPLACE)
    }

    fn new_link_request(&mut self, name: &str, flags: u16) -> Result<()> {
        let mut builder = MessageBuilder::new(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK | flags);
        builder.append_bytes(IfInfoMsg::new().as_bytes());
        builder.append_attr_str(IFLA_IFNAME, name);
        let linkinfo = builder.nest_start(IFLA_LINKINFO);
        builder.append_attr_str(IFLA_INFO_KIND, TEAM_LINK_KIND);
        builder.nest_end(linkinfo);
        self.request_ack(builder)
    }

    /// Delete the device with the given index.
    pub fn delete_link(&mut self, ifindex: u32) -> Result<()> {
        debug!(ifindex, "deleting link");
        let mut builder = MessageBuilder::new(RTM_DELLINK, NLM_F_REQUEST | NLM_F_ACK);
        builder.append_bytes(IfInfoMsg::new().with_index(ifindex as i32).as_bytes());
        self.request_ack(builder)
    }

    /// Enslave a port under a team device.
    pub fn set_master(&mut self, port_ifindex: u32, master_ifindex: u32) -> Result<()> {
        debug!(port_ifindex, master_ifindex, "setting link master");
        let mut builder = MessageBuilder::new(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK);
        builder.append_bytes(IfInfoMsg::new().with_index(port_ifindex as i32).as_bytes());
        builder.append_attr_u32(IFLA_MASTER, master_ifindex);
        self.request_ack(builder)
    }

    /// Release a port from its team device.
    pub fn unset_master(&mut self, port_ifindex: u32) -> Result<()> {
        self.set_master(port_ifindex, 0)
    }

    /// Set the hardware address of a device.
    pub fn set_hwaddr(&mut self, ifindex: u32, addr: &[u8]) -> Result<()> {
        debug!(ifindex, "setting hardware address");
        let mut builder = MessageBuilder::new(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK);
        builder.append_bytes(IfInfoMsg::new().with_index(ifindex as i32).as_bytes());
        builder.append_attr(IFLA_ADDRESS, addr);
        self.request_ack(builder)
    }

    /// Look up the index of a device by name.
    pub fn link_index(&mut self, name: &str) -> Result<u32> {
        let mut builder = MessageBuilder::new(RTM_GETLINK, NLM_F_REQUEST);
        builder.append_bytes(IfInfoMsg::new().as_bytes());
        builder.append_attr_str(IFLA_IFNAME, name);

        let attrs = self.get_link(builder).map_err(|e| match e {
            TeamError::KernelRejected { errno, .. } if errno == libc::ENODEV => {
                TeamError::DeviceNotFound {
                    name: name.to_string(),
                }
            }
            other => other,
        })?;
        Ok(attrs.ifindex)
    }

    /// Look up the name of a device by index.
    pub fn link_name(&mut self, ifindex: u32) -> Result<String> {
        Ok(self.link_attrs(ifindex)?.ifname)
    }

    /// Fetch the attributes of a device by index.
    pub fn link_attrs(&mut self, ifindex: u32) -> Result<LinkAttrs> {
        let mut builder = MessageBuilder::new(RTM_GETLINK, NLM_F_REQUEST);
        builder.append_bytes(IfInfoMsg::new().with_index(ifindex as i32).as_bytes());
        self.get_link(builder)
    }

    /// Send an RTM_GETLINK request and parse the single link reply.
    fn get_link(&mut self, mut builder: MessageBuilder) -> Result<LinkAttrs> {
        let seq = self.socket.next_seq();
        builder.set_seq(seq);
        builder.set_pid(self.socket.pid());
        self.socket.send(&builder.finish())?;

        let response = self.socket.recv_msg()?;
        for result in MessageIter::new(&response) {
            let (header, payload) = result?;
            if header.nlmsg_seq != seq {
                continue;
            }
            if header.is_error() {
                let err = NlMsgError::from_bytes(payload)?;
                return Err(TeamError::from_errno(err.error));
            }
            if header.nlmsg_type != RTM_NEWLINK {
                continue;
            }
            return parse_link_attrs(payload);
        }
        Err(TeamError::Decode("no link in RTM_GETLINK reply".into()))
    }

    /// Send a request and wait for its ACK.
    fn request_ack(&mut self, mut builder: MessageBuilder) -> Result<()> {
        let seq = self.socket.next_seq();
        builder.set_seq(seq);
        builder.set_pid(self.socket.pid());
        self.socket.send(&builder.finish())?;

        let response = self.socket.recv_msg()?;
        for result in MessageIter::new(&response) {
            let (header, payload) = result?;
            if header.nlmsg_seq != seq {
                continue;
            }
            if header.is_error() {
                let err = NlMsgError::from_bytes(payload)?;
                if err.is_ack() {
                    return Ok(());
                }
                return Err(TeamError::from_errno(err.error));
            }
        }
        Err(TeamError::Decode("no ACK in reply".into()))
    }
}

/// Parse an RTM_NEWLINK payload into link attributes.
pub fn parse_link_attrs(payload: &[u8]) -> Result<LinkAttrs> {
    let ifinfo = IfInfoMsg::from_bytes(payload)?;
    let mut attrs = LinkAttrs {
        ifindex: ifinfo.ifi_index as u32,
        ..Default::default()
    };

    for (attr_type, data) in AttrIter::new(&payload[IfInfoMsg::SIZE..]) {
        match attr_type {
            IFLA_IFNAME => attrs.ifname = get::string(data)?.to_string(),
            IFLA_ADDRESS => attrs.hwaddr = get::bytes(data).to_vec(),
            _ => {}
        }
    }

    Ok(attrs)
}
