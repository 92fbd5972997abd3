//! Team control protocol codec.
//!
//! Encodes requests for and decodes notifications from the `"team"`
//! generic netlink family, plus the rtnetlink link notifications that feed
//! the link-info cache. Decoding is strict per record but forgiving per
//! message: one malformed record is skipped without suppressing its valid
//! neighbors, and one malformed message never aborts a pump cycle.

use tracing::debug;

use crate::error::{Result, TeamError};
use crate::ifinfo::IfinfoUpdate;
use crate::netlink::attr::{AttrIter, get};
use crate::netlink::builder::MessageBuilder;
use crate::netlink::genl::{GENL_HDRLEN, GenlMsgHdr};
use crate::netlink::message::{
    MessageIter, NLM_F_ACK, NLM_F_REQUEST, RTM_DELLINK, RTM_NEWLINK,
};
use crate::options::{OptionScope, OptionUpdate, OptionValue};
use crate::port::{Duplex, PortUpdate, Provenance};
use crate::rtnl::{IFLA_ADDRESS, IFLA_IFNAME, IfInfoMsg};

/// Generic netlink family name of the team driver.
pub const TEAM_GENL_NAME: &str = "team";
/// Protocol version spoken by this crate.
pub const TEAM_GENL_VERSION: u8 = 1;
/// Multicast group carrying change notifications.
pub const TEAM_GENL_CHANGE_EVENT_MC_GRP_NAME: &str = "change_event";

/// Team commands.
pub const TEAM_CMD_NOOP: u8 = 0;
pub const TEAM_CMD_OPTIONS_SET: u8 = 1;
pub const TEAM_CMD_OPTIONS_GET: u8 = 2;
pub const TEAM_CMD_PORT_LIST_GET: u8 = 3;

/// Top-level team attributes.
pub const TEAM_ATTR_TEAM_IFINDEX: u16 = 1;
pub const TEAM_ATTR_LIST_OPTION: u16 = 2;
pub const TEAM_ATTR_LIST_PORT: u16 = 3;

/// Nested list item attribute (same value for both lists).
pub const TEAM_ATTR_ITEM_OPTION: u16 = 1;
pub const TEAM_ATTR_ITEM_PORT: u16 = 1;

/// Per-option attributes.
pub const TEAM_ATTR_OPTION_NAME: u16 = 1;
pub const TEAM_ATTR_OPTION_CHANGED: u16 = 2;
pub const TEAM_ATTR_OPTION_TYPE: u16 = 3;
pub const TEAM_ATTR_OPTION_DATA: u16 = 4;
pub const TEAM_ATTR_OPTION_REMOVED: u16 = 5;
pub const TEAM_ATTR_OPTION_PORT_IFINDEX: u16 = 6;
pub const TEAM_ATTR_OPTION_ARRAY_INDEX: u16 = 7;

/// Per-port attributes.
pub const TEAM_ATTR_PORT_IFINDEX: u16 = 1;
pub const TEAM_ATTR_PORT_CHANGED: u16 = 2;
pub const TEAM_ATTR_PORT_LINKUP: u16 = 3;
pub const TEAM_ATTR_PORT_SPEED: u16 = 4;
pub const TEAM_ATTR_PORT_DUPLEX: u16 = 5;
pub const TEAM_ATTR_PORT_REMOVED: u16 = 6;

/// Option value types on the wire (netlink attribute type codes).
pub const NLA_U32: u8 = 3;
pub const NLA_STRING: u8 = 5;
pub const NLA_FLAG: u8 = 6;
pub const NLA_BINARY: u8 = 11;

/// Well-known option names.
pub const OPT_MODE: &str = "mode";
pub const OPT_ACTIVE_PORT: &str = "activeport";
pub const OPT_BPF_HASH_FUNC: &str = "bpf_hash_func";

/// One decoded team message.
#[derive(Debug, Clone)]
pub enum TeamEvent {
    /// A port list (snapshot from a query reply, delta from a
    /// notification).
    PortList(Vec<PortUpdate>, Provenance),
    /// An option list.
    OptionList(Vec<OptionUpdate>, Provenance),
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode every team-family message in one datagram.
///
/// Messages of other families and unparseable messages are skipped with a
/// debug log; they are never fatal to the caller's cycle.
pub fn decode_team_datagram(family_id: u16, data: &[u8], provenance: Provenance) -> Vec<TeamEvent> {
    let mut events = Vec::new();

    for result in MessageIter::new(data) {
        let (header, payload) = match result {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "skipping unparseable netlink message");
                break;
            }
        };

        if header.nlmsg_type != family_id {
            continue;
        }

        match decode_team_message(payload, provenance) {
            Ok(Some(event)) => events.push(event),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "skipping malformed team message"),
        }
    }

    events
}

/// Flatten every team message across the datagrams of one correlated
/// reply into per-kind update lists.
///
/// The kernel splits large port and option lists across several messages;
/// the whole reply is still one authoritative snapshot, so the parts must
/// be merged before reconciliation rather than applied one by one. `None`
/// means no message of that kind was present in the reply.
pub fn collect_team_updates(
    family_id: u16,
    datagrams: &[Vec<u8>],
) -> (Option<Vec<PortUpdate>>, Option<Vec<OptionUpdate>>) {
    let mut ports: Option<Vec<PortUpdate>> = None;
    let mut options: Option<Vec<OptionUpdate>> = None;

    for datagram in datagrams {
        for event in decode_team_datagram(family_id, datagram, Provenance::Snapshot) {
            match event {
                TeamEvent::PortList(updates, _) => {
                    ports.get_or_insert_with(Vec::new).extend(updates);
                }
                TeamEvent::OptionList(updates, _) => {
                    options.get_or_insert_with(Vec::new).extend(updates);
                }
            }
        }
    }

    (ports, options)
}

/// Decode a single team genl message payload (genl header + attributes).
pub fn decode_team_message(payload: &[u8], provenance: Provenance) -> Result<Option<TeamEvent>> {
    let genl_hdr = GenlMsgHdr::from_bytes(payload)
        .ok_or_else(|| TeamError::Decode("missing genl header".into()))?;
    let attrs = &payload[GENL_HDRLEN..];

    match genl_hdr.cmd {
        TEAM_CMD_PORT_LIST_GET => {
            let ports = decode_port_list(attrs)?;
            Ok(Some(TeamEvent::PortList(ports, provenance)))
        }
        TEAM_CMD_OPTIONS_GET | TEAM_CMD_OPTIONS_SET => {
            let options = decode_option_list(attrs)?;
            Ok(Some(TeamEvent::OptionList(options, provenance)))
        }
        other => {
            debug!(cmd = other, "ignoring unrecognized team command");
            Ok(None)
        }
    }
}

fn decode_port_list(attrs: &[u8]) -> Result<Vec<PortUpdate>> {
    let mut ports = Vec::new();

    for (attr_type, payload) in AttrIter::new(attrs) {
        if attr_type != TEAM_ATTR_LIST_PORT {
            continue;
        }
        for (item_type, item) in AttrIter::new(payload) {
            if item_type != TEAM_ATTR_ITEM_PORT {
                continue;
            }
            match decode_port_item(item) {
                Ok(port) => ports.push(port),
                Err(e) => debug!(error = %e, "skipping malformed port record"),
            }
        }
    }

    Ok(ports)
}

fn decode_port_item(item: &[u8]) -> Result<PortUpdate> {
    let mut ifindex: Option<u32> = None;
    let mut linkup = false;
    let mut speed = 0;
    let mut duplex = Duplex::Half;
    let mut removed = false;

    for (attr_type, payload) in AttrIter::new(item) {
        match attr_type {
            TEAM_ATTR_PORT_IFINDEX => ifindex = Some(get::u32_ne(payload)?),
            TEAM_ATTR_PORT_LINKUP => linkup = true,
            TEAM_ATTR_PORT_SPEED => speed = get::u32_ne(payload)?,
            TEAM_ATTR_PORT_DUPLEX => duplex = Duplex::from_wire(get::u8(payload)?),
            TEAM_ATTR_PORT_REMOVED => removed = true,
            TEAM_ATTR_PORT_CHANGED => {} // we diff ourselves
            _ => {}
        }
    }

    let ifindex = ifindex.ok_or_else(|| TeamError::Decode("port record missing ifindex".into()))?;

    Ok(PortUpdate {
        ifindex,
        speed,
        duplex,
        linkup,
        removed,
    })
}

fn decode_option_list(attrs: &[u8]) -> Result<Vec<OptionUpdate>> {
    let mut options = Vec::new();

    for (attr_type, payload) in AttrIter::new(attrs) {
        if attr_type != TEAM_ATTR_LIST_OPTION {
            continue;
        }
        for (item_type, item) in AttrIter::new(payload) {
            if item_type != TEAM_ATTR_ITEM_OPTION {
                continue;
            }
            match decode_option_item(item) {
                Ok(Some(option)) => options.push(option),
                Ok(None) => {}
                Err(e) => debug!(error = %e, "skipping malformed option record"),
            }
        }
    }

    Ok(options)
}

fn decode_option_item(item: &[u8]) -> Result<Option<OptionUpdate>> {
    let mut name: Option<String> = None;
    let mut opt_type: Option<u8> = None;
    let mut data: Option<&[u8]> = None;
    let mut data_present = false;
    let mut port_ifindex: Option<u32> = None;
    let mut removed = false;
    let mut array_indexed = false;

    for (attr_type, payload) in AttrIter::new(item) {
        match attr_type {
            TEAM_ATTR_OPTION_NAME => name = Some(get::string(payload)?.to_string()),
            TEAM_ATTR_OPTION_TYPE => opt_type = Some(get::u8(payload)?),
            TEAM_ATTR_OPTION_DATA => {
                data = Some(payload);
                data_present = true;
            }
            TEAM_ATTR_OPTION_PORT_IFINDEX => port_ifindex = Some(get::u32_ne(payload)?),
            TEAM_ATTR_OPTION_REMOVED => removed = true,
            TEAM_ATTR_OPTION_ARRAY_INDEX => array_indexed = true,
            TEAM_ATTR_OPTION_CHANGED => {} // we diff ourselves
            _ => {}
        }
    }

    if array_indexed {
        // Array options (per-port stats arrays) are not part of the cached
        // option model.
        debug!("ignoring array-indexed option record");
        return Ok(None);
    }

    let name = name.ok_or_else(|| TeamError::Decode("option record missing name".into()))?;
    let opt_type =
        opt_type.ok_or_else(|| TeamError::Decode("option record missing type".into()))?;

    let value = match opt_type {
        NLA_U32 => match data {
            Some(d) => OptionValue::U32(get::u32_ne(d)?),
            None if removed => OptionValue::U32(0),
            None => return Err(TeamError::Decode("u32 option without data".into())),
        },
        NLA_STRING => match data {
            Some(d) => OptionValue::Str(get::string(d)?.to_string()),
            None if removed => OptionValue::Str(String::new()),
            None => return Err(TeamError::Decode("string option without data".into())),
        },
        NLA_BINARY => match data {
            Some(d) => OptionValue::Bin(get::bytes(d).to_vec()),
            None if removed => OptionValue::Bin(Vec::new()),
            None => return Err(TeamError::Decode("binary option without data".into())),
        },
        // Bool is carried as flag presence.
        NLA_FLAG => OptionValue::Bool(data_present),
        other => {
            return Err(TeamError::Decode(format!(
                "unknown option type code {}",
                other
            )));
        }
    };

    let scope = match port_ifindex {
        Some(ifindex) => OptionScope::Port(ifindex),
        None => OptionScope::Global,
    };

    Ok(Some(OptionUpdate {
        name,
        scope,
        value,
        removed,
    }))
}

/// Decode every link message in one rtnetlink datagram into link-info
/// updates. Non-link messages are skipped.
pub fn decode_link_datagram(data: &[u8]) -> Vec<IfinfoUpdate> {
    let mut updates = Vec::new();

    for result in MessageIter::new(data) {
        let (header, payload) = match result {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "skipping unparseable rtnetlink message");
                break;
            }
        };

        let removed = match header.nlmsg_type {
            RTM_NEWLINK => false,
            RTM_DELLINK => true,
            _ => continue,
        };

        match decode_link_message(payload, removed) {
            Ok(update) => updates.push(update),
            Err(e) => debug!(error = %e, "skipping malformed link message"),
        }
    }

    updates
}

/// Decode one RTM_NEWLINK/RTM_DELLINK payload.
pub fn decode_link_message(payload: &[u8], removed: bool) -> Result<IfinfoUpdate> {
    let ifinfo = IfInfoMsg::from_bytes(payload)?;
    let attrs = &payload[IfInfoMsg::SIZE..];

    let mut hwaddr = Vec::new();
    let mut ifname = String::new();

    for (attr_type, data) in AttrIter::new(attrs) {
        match attr_type {
            IFLA_ADDRESS => hwaddr = get::bytes(data).to_vec(),
            IFLA_IFNAME => ifname = get::string(data)?.to_string(),
            _ => {}
        }
    }

    Ok(IfinfoUpdate {
        ifindex: ifinfo.ifi_index as u32,
        hwaddr,
        ifname,
        removed,
    })
}

// ============================================================================
// Encoding
// ============================================================================

/// Build a TEAM_CMD_PORT_LIST_GET query for the device.
pub fn port_list_request(family_id: u16, team_ifindex: u32) -> MessageBuilder {
    let mut builder = MessageBuilder::new(family_id, NLM_F_REQUEST);
    builder.append_bytes(&GenlMsgHdr::new(TEAM_CMD_PORT_LIST_GET, TEAM_GENL_VERSION).to_bytes());
    builder.append_attr_u32(TEAM_ATTR_TEAM_IFINDEX, team_ifindex);
    builder
}

/// Build a TEAM_CMD_OPTIONS_GET query for the device.
pub fn options_request(family_id: u16, team_ifindex: u32) -> MessageBuilder {
    let mut builder = MessageBuilder::new(family_id, NLM_F_REQUEST);
    builder.append_bytes(&GenlMsgHdr::new(TEAM_CMD_OPTIONS_GET, TEAM_GENL_VERSION).to_bytes());
    builder.append_attr_u32(TEAM_ATTR_TEAM_IFINDEX, team_ifindex);
    builder
}

/// Build a TEAM_CMD_OPTIONS_SET request for one option.
pub fn options_set_request(
    family_id: u16,
    team_ifindex: u32,
    name: &str,
    scope: OptionScope,
    value: &OptionValue,
) -> MessageBuilder {
    let mut builder = MessageBuilder::new(family_id, NLM_F_REQUEST | NLM_F_ACK);
    builder.append_bytes(&GenlMsgHdr::new(TEAM_CMD_OPTIONS_SET, TEAM_GENL_VERSION).to_bytes());
    builder.append_attr_u32(TEAM_ATTR_TEAM_IFINDEX, team_ifindex);

    let list = builder.nest_start(TEAM_ATTR_LIST_OPTION);
    let item = builder.nest_start(TEAM_ATTR_ITEM_OPTION);
    builder.append_attr_str(TEAM_ATTR_OPTION_NAME, name);
    if let OptionScope::Port(port_ifindex) = scope {
        builder.append_attr_u32(TEAM_ATTR_OPTION_PORT_IFINDEX, port_ifindex);
    }
    match value {
        OptionValue::U32(v) => {
            builder.append_attr_u8(TEAM_ATTR_OPTION_TYPE, NLA_U32);
            builder.append_attr_u32(TEAM_ATTR_OPTION_DATA, *v);
        }
        OptionValue::Str(v) => {
            builder.append_attr_u8(TEAM_ATTR_OPTION_TYPE, NLA_STRING);
            builder.append_attr_str(TEAM_ATTR_OPTION_DATA, v);
        }
        OptionValue::Bin(v) => {
            builder.append_attr_u8(TEAM_ATTR_OPTION_TYPE, NLA_BINARY);
            builder.append_attr(TEAM_ATTR_OPTION_DATA, v);
        }
        OptionValue::Bool(v) => {
            builder.append_attr_u8(TEAM_ATTR_OPTION_TYPE, NLA_FLAG);
            // Flag presence encodes true, absence false.
            if *v {
                builder.append_attr_empty(TEAM_ATTR_OPTION_DATA);
            }
        }
    }
    builder.nest_end(item);
    builder.nest_end(list);
    builder
}
