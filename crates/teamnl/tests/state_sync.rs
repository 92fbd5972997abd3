//! State synchronization tests: synthetic kernel datagrams pushed through
//! the codec, the entity caches, and the change-dispatch registry, without
//! a live kernel.

use std::cell::RefCell;
use std::rc::Rc;

use teamnl::change::{ChangeMask, ChangeRegistry};
use teamnl::codec::{
    self, NLA_STRING, NLA_U32, TEAM_ATTR_ITEM_OPTION, TEAM_ATTR_ITEM_PORT, TEAM_ATTR_LIST_OPTION,
    TEAM_ATTR_LIST_PORT, TEAM_ATTR_OPTION_DATA, TEAM_ATTR_OPTION_NAME, TEAM_ATTR_OPTION_REMOVED,
    TEAM_ATTR_OPTION_TYPE, TEAM_ATTR_PORT_IFINDEX, TEAM_ATTR_PORT_LINKUP, TEAM_ATTR_PORT_REMOVED,
    TEAM_ATTR_PORT_SPEED, TEAM_ATTR_TEAM_IFINDEX, TEAM_CMD_OPTIONS_GET, TEAM_CMD_PORT_LIST_GET,
    TEAM_GENL_VERSION, TeamEvent,
};
use teamnl::error::TeamError;
use teamnl::ifinfo::{IfinfoCache, IfinfoUpdate};
use teamnl::netlink::builder::MessageBuilder;
use teamnl::netlink::genl::GenlMsgHdr;
use teamnl::netlink::message::RTM_NEWLINK;
use teamnl::options::{OptionCache, OptionScope, OptionValue};
use teamnl::port::{PortCache, Provenance};
use teamnl::rtnl::{IFLA_ADDRESS, IFLA_IFNAME, IfInfoMsg};

const FAMILY: u16 = 27;
const TEAM_IFINDEX: u32 = 2;

/// The cache-and-dispatch half of a handle, pumped by hand.
#[derive(Default)]
struct Pump {
    ports: PortCache,
    ifinfos: IfinfoCache,
    options: OptionCache,
    registry: ChangeRegistry<()>,
    pending: ChangeMask,
}

impl Pump {
    /// Decode a datagram, apply it, and return the accumulated mask.
    fn apply_datagram(&mut self, data: &[u8], provenance: Provenance) -> ChangeMask {
        let mut mask = ChangeMask::NONE;
        for event in codec::decode_team_datagram(FAMILY, data, provenance) {
            match event {
                TeamEvent::PortList(updates, provenance) => {
                    if self.ports.apply(&updates, provenance) {
                        mask |= ChangeMask::PORT;
                    }
                }
                TeamEvent::OptionList(updates, provenance) => {
                    if self.options.apply(&updates, provenance) {
                        mask |= ChangeMask::OPTION;
                    }
                }
            }
        }
        mask
    }

    /// Apply one rtnetlink link datagram the way the pump does: records
    /// for interfaces outside the cached port set are ignored.
    fn apply_link_datagram(&mut self, data: &[u8]) -> ChangeMask {
        let relevant: Vec<_> = codec::decode_link_datagram(data)
            .into_iter()
            .filter(|u| self.ports.get(u.ifindex).is_some())
            .collect();
        if !relevant.is_empty() && self.ifinfos.apply(&relevant, Provenance::Delta) {
            ChangeMask::IFINFO
        } else {
            ChangeMask::NONE
        }
    }

    /// One full cycle: apply, cascade port removals into the other caches,
    /// dispatch, purge tombstones.
    fn cycle(&mut self, datagrams: &[(&[u8], Provenance)]) -> ChangeMask {
        let mut mask = std::mem::take(&mut self.pending);
        for (data, provenance) in datagrams {
            mask |= self.apply_datagram(data, *provenance);
        }

        let removed: Vec<u32> = self
            .ports
            .iter()
            .filter(|p| p.is_removed())
            .map(|p| p.ifindex())
            .collect();
        for ifindex in removed {
            if self.ifinfos.mark_removed(ifindex) {
                mask |= ChangeMask::IFINFO;
            }
            if self.options.mark_port_removed(ifindex) {
                mask |= ChangeMask::OPTION;
            }
        }

        self.registry.dispatch(&(), mask);
        self.ports.purge_removed();
        self.ifinfos.purge_removed();
        self.options.purge_removed();
        mask
    }
}

fn port_list(ports: &[(u32, u32, bool)]) -> Vec<u8> {
    let mut builder = MessageBuilder::new(FAMILY, 0);
    builder.append_bytes(&GenlMsgHdr::new(TEAM_CMD_PORT_LIST_GET, TEAM_GENL_VERSION).to_bytes());
    builder.append_attr_u32(TEAM_ATTR_TEAM_IFINDEX, TEAM_IFINDEX);
    let list = builder.nest_start(TEAM_ATTR_LIST_PORT);
    for &(ifindex, speed, linkup) in ports {
        let item = builder.nest_start(TEAM_ATTR_ITEM_PORT);
        builder.append_attr_u32(TEAM_ATTR_PORT_IFINDEX, ifindex);
        builder.append_attr_u32(TEAM_ATTR_PORT_SPEED, speed);
        if linkup {
            builder.append_attr_empty(TEAM_ATTR_PORT_LINKUP);
        }
        builder.nest_end(item);
    }
    builder.nest_end(list);
    builder.finish()
}

fn port_removal(ifindex: u32) -> Vec<u8> {
    let mut builder = MessageBuilder::new(FAMILY, 0);
    builder.append_bytes(&GenlMsgHdr::new(TEAM_CMD_PORT_LIST_GET, TEAM_GENL_VERSION).to_bytes());
    let list = builder.nest_start(TEAM_ATTR_LIST_PORT);
    let item = builder.nest_start(TEAM_ATTR_ITEM_PORT);
    builder.append_attr_u32(TEAM_ATTR_PORT_IFINDEX, ifindex);
    builder.append_attr_empty(TEAM_ATTR_PORT_REMOVED);
    builder.nest_end(item);
    builder.nest_end(list);
    builder.finish()
}

fn newlink(ifindex: u32, hwaddr: &[u8], ifname: &str) -> Vec<u8> {
    let mut builder = MessageBuilder::new(RTM_NEWLINK, 0);
    builder.append_bytes(IfInfoMsg::new().with_index(ifindex as i32).as_bytes());
    builder.append_attr(IFLA_ADDRESS, hwaddr);
    builder.append_attr_str(IFLA_IFNAME, ifname);
    builder.finish()
}

enum OptRecord<'a> {
    Str(&'a str, &'a str),
    U32(&'a str, u32),
    /// A record with a type but no name, as a damaged kernel message
    /// would carry.
    Broken,
    Removed(&'a str),
}

fn option_list(records: &[OptRecord<'_>]) -> Vec<u8> {
    let mut builder = MessageBuilder::new(FAMILY, 0);
    builder.append_bytes(&GenlMsgHdr::new(TEAM_CMD_OPTIONS_GET, TEAM_GENL_VERSION).to_bytes());
    builder.append_attr_u32(TEAM_ATTR_TEAM_IFINDEX, TEAM_IFINDEX);
    let list = builder.nest_start(TEAM_ATTR_LIST_OPTION);
    for record in records {
        let item = builder.nest_start(TEAM_ATTR_ITEM_OPTION);
        match record {
            OptRecord::Str(name, value) => {
                builder.append_attr_str(TEAM_ATTR_OPTION_NAME, name);
                builder.append_attr_u8(TEAM_ATTR_OPTION_TYPE, NLA_STRING);
                builder.append_attr_str(TEAM_ATTR_OPTION_DATA, value);
            }
            OptRecord::U32(name, value) => {
                builder.append_attr_str(TEAM_ATTR_OPTION_NAME, name);
                builder.append_attr_u8(TEAM_ATTR_OPTION_TYPE, NLA_U32);
                builder.append_attr_u32(TEAM_ATTR_OPTION_DATA, *value);
            }
            OptRecord::Broken => {
                builder.append_attr_u8(TEAM_ATTR_OPTION_TYPE, NLA_U32);
                builder.append_attr_u32(TEAM_ATTR_OPTION_DATA, 0);
            }
            OptRecord::Removed(name) => {
                builder.append_attr_str(TEAM_ATTR_OPTION_NAME, name);
                builder.append_attr_u8(TEAM_ATTR_OPTION_TYPE, NLA_U32);
                builder.append_attr_empty(TEAM_ATTR_OPTION_REMOVED);
            }
        }
        builder.nest_end(item);
    }
    builder.nest_end(list);
    builder.finish()
}

#[test]
fn snapshot_converges_to_kernel_key_set() {
    let mut pump = Pump::default();
    pump.cycle(&[(&port_list(&[(5, 1000, true), (7, 100, false)]), Provenance::Snapshot)]);
    assert_eq!(pump.ports.len(), 2);

    // A later snapshot without port 7 retires it.
    let mask = pump.cycle(&[(&port_list(&[(5, 1000, true)]), Provenance::Snapshot)]);
    assert!(mask.contains(ChangeMask::PORT));
    assert_eq!(pump.ports.len(), 1);
    assert!(pump.ports.get(7).is_none());
}

#[test]
fn split_dump_reply_merges_into_one_snapshot() {
    // Large lists come back split across messages; the parts together are
    // one authoritative snapshot, so the first part's keys must survive
    // the second part.
    let replies = vec![port_list(&[(5, 1000, true)]), port_list(&[(8, 100, false)])];
    let (ports, options) = codec::collect_team_updates(FAMILY, &replies);
    assert!(options.is_none());

    let mut cache = PortCache::default();
    assert!(cache.apply(&ports.unwrap(), Provenance::Snapshot));
    assert_eq!(cache.len(), 2);
    assert!(cache.get(5).is_some_and(|p| !p.is_removed()));
    assert!(cache.get(8).is_some_and(|p| !p.is_removed()));

    // A later split reply without port 8 retires exactly that port.
    let replies = vec![port_list(&[(5, 1000, true)]), port_list(&[])];
    let (ports, _) = codec::collect_team_updates(FAMILY, &replies);
    cache.apply(&ports.unwrap(), Provenance::Snapshot);
    assert!(cache.get(5).is_some_and(|p| !p.is_removed()));
    assert!(cache.get(8).is_some_and(|p| p.is_removed()));
}

#[test]
fn split_option_dump_merges_into_one_snapshot() {
    let replies = vec![
        option_list(&[OptRecord::Str("mode", "activebackup")]),
        option_list(&[OptRecord::U32("activeport", 5)]),
    ];
    let (_, options) = codec::collect_team_updates(FAMILY, &replies);

    let mut cache = OptionCache::default();
    assert!(cache.apply(&options.unwrap(), Provenance::Snapshot));
    assert_eq!(cache.len(), 2);
    assert!(
        cache
            .get("mode", OptionScope::Global)
            .is_some_and(|o| !o.is_removed())
    );
    assert!(
        cache
            .get("activeport", OptionScope::Global)
            .is_some_and(|o| !o.is_removed())
    );
}

#[test]
fn snapshot_idempotent_second_apply_is_silent() {
    let snapshot = port_list(&[(5, 1000, true), (7, 100, false)]);
    let mut pump = Pump::default();

    let first = pump.cycle(&[(&snapshot, Provenance::Snapshot)]);
    assert!(first.contains(ChangeMask::PORT));

    let second = pump.cycle(&[(&snapshot, Provenance::Snapshot)]);
    assert!(second.is_empty());
}

#[test]
fn option_type_stays_immutable() {
    let mut pump = Pump::default();
    pump.cycle(&[(
        &option_list(&[OptRecord::Str("mode", "roundrobin")]),
        Provenance::Snapshot,
    )]);

    let opt = pump.options.get("mode", OptionScope::Global).unwrap();
    assert!(matches!(
        opt.value_u32(),
        Err(TeamError::OptionTypeMismatch { .. })
    ));
    assert_eq!(opt.value_str().unwrap(), "roundrobin");
}

#[test]
fn handlers_see_only_subscribed_categories() {
    let mut pump = Pump::default();
    let seen = Rc::new(RefCell::new(Vec::new()));

    let s = seen.clone();
    pump.registry.register(
        ChangeMask::PORT,
        Box::new(move |_, m| s.borrow_mut().push(("ports", m))),
    );
    let s = seen.clone();
    pump.registry.register(
        ChangeMask::OPTION,
        Box::new(move |_, m| s.borrow_mut().push(("options", m))),
    );
    let s = seen.clone();
    pump.registry.register(
        ChangeMask::ANY,
        Box::new(move |_, m| s.borrow_mut().push(("all", m))),
    );

    // An option-only cycle.
    pump.cycle(&[(
        &option_list(&[OptRecord::Str("mode", "roundrobin")]),
        Provenance::Snapshot,
    )]);

    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], ("options", ChangeMask::OPTION));
    assert_eq!(seen[1], ("all", ChangeMask::OPTION));
}

#[test]
fn port_removal_retires_ifinfo_same_cycle() {
    let mut pump = Pump::default();
    pump.cycle(&[(&port_list(&[(5, 1000, true)]), Provenance::Snapshot)]);
    pump.ifinfos.apply(
        &[IfinfoUpdate {
            ifindex: 5,
            hwaddr: vec![2, 0, 0, 0, 0, 5],
            ifname: "eth0".into(),
            removed: false,
        }],
        Provenance::Delta,
    );

    let observed = Rc::new(RefCell::new(ChangeMask::NONE));
    let o = observed.clone();
    pump.registry
        .register(ChangeMask::ANY, Box::new(move |_, m| *o.borrow_mut() = m));

    let mask = pump.cycle(&[(&port_removal(5), Provenance::Delta)]);
    assert!(mask.contains(ChangeMask::PORT));
    assert!(mask.contains(ChangeMask::IFINFO));
    assert_eq!(*observed.borrow(), mask);

    // Both records are gone once the cycle finished.
    assert!(pump.ports.get(5).is_none());
    assert!(pump.ifinfos.get(5).is_none());
}

#[test]
fn new_port_link_info_converges_from_link_plane() {
    let mut pump = Pump::default();

    // A delta introduces a port that has never been seen. The pump holds
    // no link-info record for it yet; nothing is fetched synchronously.
    let mask = pump.cycle(&[(&port_list(&[(9, 1000, true)]), Provenance::Delta)]);
    assert_eq!(mask, ChangeMask::PORT);
    assert!(pump.ifinfos.get(9).is_none());

    // The kernel's own RTM_NEWLINK for the enslaved interface arrives on
    // the link notification plane and fills the record one cycle later.
    let mask = pump.apply_link_datagram(&newlink(9, &[2, 0, 0, 0, 0, 9], "eth9"));
    assert_eq!(mask, ChangeMask::IFINFO);
    let info = pump.ifinfos.get(9).unwrap();
    assert_eq!(info.ifname(), "eth9");
    assert_eq!(info.hwaddr(), &[2, 0, 0, 0, 0, 9][..]);

    // Records for interfaces outside the port set stay ignored.
    let mask = pump.apply_link_datagram(&newlink(33, &[2, 0, 0, 0, 0, 33], "wlan0"));
    assert!(mask.is_empty());
    assert!(pump.ifinfos.get(33).is_none());
}

#[test]
fn bind_snapshot_then_set_active_port() {
    let mut pump = Pump::default();

    // Bind: full snapshot of ports and options.
    let mask = pump.cycle(&[
        (
            &port_list(&[(5, 1000, true), (7, 1000, true)]),
            Provenance::Snapshot,
        ),
        (
            &option_list(&[
                OptRecord::Str("mode", "activebackup"),
                OptRecord::U32("activeport", 0),
            ]),
            Provenance::Snapshot,
        ),
    ]);
    assert!(mask.contains(ChangeMask::PORT));
    assert!(mask.contains(ChangeMask::OPTION));

    // A set request travels through the codec and comes back as a delta.
    let request = codec::options_set_request(
        FAMILY,
        TEAM_IFINDEX,
        "activeport",
        OptionScope::Global,
        &OptionValue::U32(5),
    )
    .finish();
    let echoed = pump.apply_datagram(&request, Provenance::Delta);
    pump.pending |= echoed;
    assert_eq!(pump.pending, ChangeMask::OPTION);

    // The pending bits are consumed by the next cycle even with nothing
    // new on the wire.
    let mask = pump.cycle(&[]);
    assert_eq!(mask, ChangeMask::OPTION);
    assert_eq!(
        pump.options
            .get("activeport", OptionScope::Global)
            .unwrap()
            .value_u32()
            .unwrap(),
        5
    );
}

#[test]
fn echoed_equal_value_raises_no_change() {
    let mut pump = Pump::default();
    pump.cycle(&[(
        &option_list(&[OptRecord::U32("activeport", 5)]),
        Provenance::Snapshot,
    )]);

    let fired = Rc::new(RefCell::new(0));
    let f = fired.clone();
    pump.registry
        .register(ChangeMask::ANY, Box::new(move |_, _| *f.borrow_mut() += 1));

    // The kernel confirms the value the cache already holds.
    let mask = pump.cycle(&[(
        &option_list(&[OptRecord::U32("activeport", 5)]),
        Provenance::Delta,
    )]);
    assert!(mask.is_empty());
    assert_eq!(*fired.borrow(), 0);
}

#[test]
fn malformed_record_does_not_suppress_neighbors() {
    let mut pump = Pump::default();
    let mask = pump.cycle(&[(
        &option_list(&[
            OptRecord::Str("mode", "roundrobin"),
            OptRecord::Broken,
            OptRecord::U32("notify_peers_count", 1),
        ]),
        Provenance::Snapshot,
    )]);

    assert!(mask.contains(ChangeMask::OPTION));
    assert_eq!(pump.options.len(), 2);
    assert!(pump.options.get("mode", OptionScope::Global).is_some());
    assert!(
        pump.options
            .get("notify_peers_count", OptionScope::Global)
            .is_some()
    );
}

#[test]
fn option_removal_tombstones_then_frees() {
    let mut pump = Pump::default();
    pump.cycle(&[(
        &option_list(&[OptRecord::U32("queue_id", 0)]),
        Provenance::Snapshot,
    )]);

    let tombstone_seen = Rc::new(RefCell::new(false));
    // The cache still holds the record while handlers run; capture what a
    // handler would observe by checking after apply but before the purge.
    let mask = pump.apply_datagram(
        &option_list(&[OptRecord::Removed("queue_id")]),
        Provenance::Delta,
    );
    assert_eq!(mask, ChangeMask::OPTION);
    let opt = pump.options.get("queue_id", OptionScope::Global).unwrap();
    assert!(opt.is_removed());
    *tombstone_seen.borrow_mut() = true;

    pump.options.purge_removed();
    assert!(pump.options.get("queue_id", OptionScope::Global).is_none());
    assert!(*tombstone_seen.borrow());
}
