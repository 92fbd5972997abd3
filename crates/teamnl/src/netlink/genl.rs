//! Generic Netlink (GENL) support.
//!
//! The team control protocol is a generic netlink family: its message type
//! is assigned dynamically and must be resolved through the control family
//! (`CTRL_CMD_GETFAMILY`) before any request can be built.

use std::collections::HashMap;

use super::attr::{AttrIter, get};
use super::builder::MessageBuilder;
use super::message::{MessageIter, NLM_F_ACK, NLM_F_REQUEST, NlMsgError};
use super::socket::NetlinkSocket;
use crate::error::{Result, TeamError};

/// Control family id (fixed, not dynamically assigned).
pub const GENL_ID_CTRL: u16 = 0x10;

/// Control family commands.
pub const CTRL_CMD_GETFAMILY: u8 = 3;

/// Control family attributes.
pub const CTRL_ATTR_FAMILY_ID: u16 = 1;
pub const CTRL_ATTR_FAMILY_NAME: u16 = 2;
pub const CTRL_ATTR_VERSION: u16 = 3;
pub const CTRL_ATTR_MCAST_GROUPS: u16 = 7;

/// Control family multicast group attributes.
pub const CTRL_ATTR_MCAST_GRP_NAME: u16 = 1;
pub const CTRL_ATTR_MCAST_GRP_ID: u16 = 2;

/// Generic Netlink message header.
///
/// This header immediately follows the standard netlink header in GENL
/// messages.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GenlMsgHdr {
    /// Command identifier (family-specific).
    pub cmd: u8,
    /// Interface version.
    pub version: u8,
    /// Reserved for future use.
    pub reserved: u16,
}

/// Size of the GENL header in bytes.
pub const GENL_HDRLEN: usize = std::mem::size_of::<GenlMsgHdr>();

impl GenlMsgHdr {
    /// Create a new GENL header with the given command and version.
    #[inline]
    pub const fn new(cmd: u8, version: u8) -> Self {
        Self {
            cmd,
            version,
            reserved: 0,
        }
    }

    /// Parse a header from a byte slice.
    ///
    /// Returns `None` if the slice is too short.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < GENL_HDRLEN {
            return None;
        }
        Some(Self {
            cmd: data[0],
            version: data[1],
            reserved: u16::from_ne_bytes([data[2], data[3]]),
        })
    }

    /// Get the header as bytes.
    pub fn to_bytes(self) -> [u8; GENL_HDRLEN] {
        let r = self.reserved.to_ne_bytes();
        [self.cmd, self.version, r[0], r[1]]
    }
}

/// Information about a resolved Generic Netlink family.
#[derive(Debug, Clone)]
pub struct FamilyInfo {
    /// Dynamically assigned family id (used as nlmsg_type).
    pub id: u16,
    /// Family version.
    pub version: u8,
    /// Multicast groups: name -> group id.
    pub mcast_groups: HashMap<String, u32>,
}

/// Resolve a generic netlink family by name over the given socket.
///
/// Returns `DeviceDriverUnavailable` when the family is not registered,
/// which for the `"team"` family means the driver module is not loaded.
pub fn resolve_family(socket: &mut NetlinkSocket, name: &str) -> Result<FamilyInfo> {
    let mut builder = MessageBuilder::new(GENL_ID_CTRL, NLM_F_REQUEST | NLM_F_ACK);
    builder.append_bytes(&GenlMsgHdr::new(CTRL_CMD_GETFAMILY, 1).to_bytes());
    builder.append_attr_str(CTRL_ATTR_FAMILY_NAME, name);

    let seq = socket.next_seq();
    builder.set_seq(seq);
    builder.set_pid(socket.pid());

    socket.send(&builder.finish())?;
    let response = socket.recv_msg()?;

    for result in MessageIter::new(&response) {
        let (header, payload) = result?;

        if header.nlmsg_seq != seq {
            continue;
        }

        if header.is_error() {
            let err = NlMsgError::from_bytes(payload)?;
            if !err.is_ack() {
                if err.error == -libc::ENOENT {
                    return Err(TeamError::DeviceDriverUnavailable);
                }
                return Err(TeamError::from_errno(err.error));
            }
            continue;
        }

        if header.is_done() {
            continue;
        }

        if payload.len() < GENL_HDRLEN {
            return Err(TeamError::Decode("GENL header too short".into()));
        }

        return parse_family_attrs(&payload[GENL_HDRLEN..]);
    }

    Err(TeamError::DeviceDriverUnavailable)
}

/// Parse family attributes from a CTRL_CMD_GETFAMILY response.
fn parse_family_attrs(data: &[u8]) -> Result<FamilyInfo> {
    let mut id: Option<u16> = None;
    let mut version: u8 = 0;
    let mut mcast_groups = HashMap::new();

    for (attr_type, payload) in AttrIter::new(data) {
        match attr_type {
            CTRL_ATTR_FAMILY_ID => id = Some(get::u16_ne(payload)?),
            CTRL_ATTR_VERSION => version = get::u32_ne(payload)? as u8,
            CTRL_ATTR_MCAST_GROUPS => mcast_groups = parse_mcast_groups(payload)?,
            _ => {}
        }
    }

    let id = id.ok_or_else(|| TeamError::Decode("missing family id".into()))?;

    Ok(FamilyInfo {
        id,
        version,
        mcast_groups,
    })
}

/// Parse multicast groups from CTRL_ATTR_MCAST_GROUPS.
fn parse_mcast_groups(data: &[u8]) -> Result<HashMap<String, u32>> {
    let mut groups = HashMap::new();

    // The mcast_groups attribute contains one nested entry per group.
    for (_group_idx, group_payload) in AttrIter::new(data) {
        let mut name: Option<String> = None;
        let mut grp_id: Option<u32> = None;

        for (attr_type, payload) in AttrIter::new(group_payload) {
            match attr_type {
                CTRL_ATTR_MCAST_GRP_NAME => name = Some(get::string(payload)?.to_string()),
                CTRL_ATTR_MCAST_GRP_ID => grp_id = Some(get::u32_ne(payload)?),
                _ => {}
            }
        }

        if let (Some(name), Some(id)) = (name, grp_id) {
            groups.insert(name, id);
        }
    }

    Ok(groups)
}
