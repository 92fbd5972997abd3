//! Link-info cache: hardware address and name per interface index.
//!
//! Records cover the team device itself and each of its ports, fed by
//! rtnetlink link notifications.

use crate::port::Provenance;

/// Cached link information for one interface index.
#[derive(Debug, Clone, Default)]
pub struct Ifinfo {
    ifindex: u32,
    hwaddr: Vec<u8>,
    ifname: String,
    hwaddr_changed: bool,
    hwaddr_len_changed: bool,
    ifname_changed: bool,
    removed: bool,
}

impl Ifinfo {
    /// Interface index (key).
    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    /// Hardware address bytes.
    pub fn hwaddr(&self) -> &[u8] {
        &self.hwaddr
    }

    /// Hardware address length.
    pub fn hwaddr_len(&self) -> usize {
        self.hwaddr.len()
    }

    /// Interface name.
    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    /// Whether the hardware address bytes changed in the most recent
    /// cycle that touched this record.
    pub fn is_hwaddr_changed(&self) -> bool {
        self.hwaddr_changed
    }

    /// Whether the hardware address length changed.
    pub fn is_hwaddr_len_changed(&self) -> bool {
        self.hwaddr_len_changed
    }

    /// Whether the interface name changed.
    pub fn is_ifname_changed(&self) -> bool {
        self.ifname_changed
    }

    /// Whether any tracked field changed.
    pub fn is_changed(&self) -> bool {
        self.hwaddr_changed || self.hwaddr_len_changed || self.ifname_changed
    }

    /// Whether this record was removed this cycle (tombstone).
    pub fn is_removed(&self) -> bool {
        self.removed
    }
}

/// Decoded fields of one link notification.
#[derive(Debug, Clone)]
pub struct IfinfoUpdate {
    pub ifindex: u32,
    pub hwaddr: Vec<u8>,
    pub ifname: String,
    /// Link deleted (RTM_DELLINK).
    pub removed: bool,
}

/// Insertion-ordered cache of link-info records.
#[derive(Debug, Default)]
pub struct IfinfoCache {
    records: Vec<Ifinfo>,
}

impl IfinfoCache {
    /// Look up a record by interface index.
    pub fn get(&self, ifindex: u32) -> Option<&Ifinfo> {
        self.records.iter().find(|i| i.ifindex == ifindex)
    }

    /// Iterate records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Ifinfo> {
        self.records.iter()
    }

    /// Number of cached records (tombstones included).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Ingest decoded link records. Returns true if any record was
    /// inserted, field-changed, or removed.
    pub fn apply(&mut self, updates: &[IfinfoUpdate], provenance: Provenance) -> bool {
        let mut any_changed = false;

        for update in updates {
            if update.removed {
                if let Some(rec) = self.records.iter_mut().find(|i| i.ifindex == update.ifindex)
                    && !rec.removed
                {
                    rec.removed = true;
                    any_changed = true;
                }
                continue;
            }

            match self.records.iter_mut().find(|i| i.ifindex == update.ifindex) {
                Some(rec) => {
                    rec.hwaddr_changed = false;
                    rec.hwaddr_len_changed = false;
                    rec.ifname_changed = false;
                    if rec.removed {
                        rec.removed = false;
                        any_changed = true;
                    }
                    if rec.hwaddr.len() != update.hwaddr.len() {
                        rec.hwaddr_len_changed = true;
                    }
                    if rec.hwaddr != update.hwaddr {
                        rec.hwaddr = update.hwaddr.clone();
                        rec.hwaddr_changed = true;
                    }
                    if rec.ifname != update.ifname {
                        rec.ifname = update.ifname.clone();
                        rec.ifname_changed = true;
                    }
                    any_changed |= rec.is_changed();
                }
                None => {
                    self.records.push(Ifinfo {
                        ifindex: update.ifindex,
                        hwaddr: update.hwaddr.clone(),
                        ifname: update.ifname.clone(),
                        hwaddr_changed: true,
                        hwaddr_len_changed: true,
                        ifname_changed: true,
                        removed: false,
                    });
                    any_changed = true;
                }
            }
        }

        if provenance == Provenance::Snapshot {
            for rec in &mut self.records {
                let present = updates
                    .iter()
                    .any(|u| !u.removed && u.ifindex == rec.ifindex);
                if !present && !rec.removed {
                    rec.removed = true;
                    any_changed = true;
                }
            }
        }

        any_changed
    }

    /// Tombstone the record for an interface whose owning port was removed.
    /// Returns true if a live record was marked.
    pub fn mark_removed(&mut self, ifindex: u32) -> bool {
        if let Some(rec) = self.records.iter_mut().find(|i| i.ifindex == ifindex)
            && !rec.removed
        {
            rec.removed = true;
            return true;
        }
        false
    }

    /// Drop tombstoned records after their dispatch cycle.
    pub fn purge_removed(&mut self) {
        self.records.retain(|i| !i.removed);
    }
}
