//! Port cache: physical interfaces enslaved to the team device.

/// Duplex mode of a port's link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Duplex {
    #[default]
    Half,
    Full,
}

impl Duplex {
    /// Decode from the wire representation (0 = half, nonzero = full).
    pub fn from_wire(value: u8) -> Self {
        if value == 0 { Duplex::Half } else { Duplex::Full }
    }
}

/// One port of the team device.
///
/// Fields update in place as kernel notifications arrive; `is_changed`
/// reflects the most recent cycle that touched this port, and a removed
/// port stays readable for one dispatch cycle before it is freed.
#[derive(Debug, Clone)]
pub struct Port {
    ifindex: u32,
    speed: u32,
    duplex: Duplex,
    linkup: bool,
    changed: bool,
    removed: bool,
}

impl Port {
    /// Interface index (stable identity key).
    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    /// Link speed in Mbps.
    pub fn speed(&self) -> u32 {
        self.speed
    }

    /// Duplex mode.
    pub fn duplex(&self) -> Duplex {
        self.duplex
    }

    /// Whether the link is up.
    pub fn is_link_up(&self) -> bool {
        self.linkup
    }

    /// Whether this port changed in the most recent cycle that touched it.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Whether this port was removed this cycle (tombstone; freed after
    /// dispatch).
    pub fn is_removed(&self) -> bool {
        self.removed
    }
}

/// Decoded fields of one port-list record.
#[derive(Debug, Clone, Copy)]
pub struct PortUpdate {
    pub ifindex: u32,
    pub speed: u32,
    pub duplex: Duplex,
    pub linkup: bool,
    /// Kernel-reported explicit removal (delta messages only).
    pub removed: bool,
}

/// Whether a decoded message carries authoritative full membership or only
/// changed entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Full list: anything cached but absent must be removed.
    Snapshot,
    /// Changed/added entries only; removals are explicit.
    Delta,
}

/// Insertion-ordered cache of ports, diffed against incoming records.
#[derive(Debug, Default)]
pub struct PortCache {
    ports: Vec<Port>,
}

impl PortCache {
    /// Look up a port by interface index.
    pub fn get(&self, ifindex: u32) -> Option<&Port> {
        self.ports.iter().find(|p| p.ifindex == ifindex)
    }

    /// Iterate ports in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter()
    }

    /// Number of cached ports (tombstones included).
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// Check whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Ingest one decoded port list, diffing each record against the
    /// cached state. Returns true if any port was inserted, changed, or
    /// removed.
    pub fn apply(&mut self, updates: &[PortUpdate], provenance: Provenance) -> bool {
        let mut any_changed = false;

        for update in updates {
            if update.removed {
                if let Some(port) = self.ports.iter_mut().find(|p| p.ifindex == update.ifindex)
                    && !port.removed
                {
                    port.removed = true;
                    port.changed = true;
                    any_changed = true;
                }
                continue;
            }

            match self.ports.iter_mut().find(|p| p.ifindex == update.ifindex) {
                Some(port) => {
                    port.changed = false;
                    if port.removed {
                        // Re-appeared before the tombstone was collected.
                        port.removed = false;
                        port.changed = true;
                    }
                    if port.speed != update.speed {
                        port.speed = update.speed;
                        port.changed = true;
                    }
                    if port.duplex != update.duplex {
                        port.duplex = update.duplex;
                        port.changed = true;
                    }
                    if port.linkup != update.linkup {
                        port.linkup = update.linkup;
                        port.changed = true;
                    }
                    any_changed |= port.changed;
                }
                None => {
                    self.ports.push(Port {
                        ifindex: update.ifindex,
                        speed: update.speed,
                        duplex: update.duplex,
                        linkup: update.linkup,
                        changed: true,
                        removed: false,
                    });
                    any_changed = true;
                }
            }
        }

        if provenance == Provenance::Snapshot {
            for port in &mut self.ports {
                let present = updates
                    .iter()
                    .any(|u| !u.removed && u.ifindex == port.ifindex);
                if !present && !port.removed {
                    port.removed = true;
                    port.changed = true;
                    any_changed = true;
                }
            }
        }

        any_changed
    }

    /// Drop tombstoned ports after their dispatch cycle. Returns the
    /// interface indexes that were freed, so the owning handle can retire
    /// the matching link-info records.
    pub fn purge_removed(&mut self) -> Vec<u32> {
        let freed: Vec<u32> = self
            .ports
            .iter()
            .filter(|p| p.removed)
            .map(|p| p.ifindex)
            .collect();
        self.ports.retain(|p| !p.removed);
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(ifindex: u32, speed: u32, linkup: bool) -> PortUpdate {
        PortUpdate {
            ifindex,
            speed,
            duplex: Duplex::Full,
            linkup,
            removed: false,
        }
    }

    #[test]
    fn test_snapshot_converges_to_key_set() {
        let mut cache = PortCache::default();
        assert!(cache.apply(&[update(3, 1000, true), update(5, 100, false)], Provenance::Snapshot));
        assert_eq!(cache.len(), 2);

        // Next snapshot drops 3 and adds 8.
        assert!(cache.apply(&[update(5, 100, false), update(8, 1000, true)], Provenance::Snapshot));
        assert!(cache.get(3).unwrap().is_removed());
        cache.purge_removed();

        let keys: Vec<u32> = cache.iter().map(|p| p.ifindex()).collect();
        assert_eq!(keys, vec![5, 8]);
    }

    #[test]
    fn test_snapshot_idempotent() {
        let mut cache = PortCache::default();
        let snapshot = [update(3, 1000, true)];
        assert!(cache.apply(&snapshot, Provenance::Snapshot));
        cache.purge_removed();
        // Identical snapshot again: zero changes.
        assert!(!cache.apply(&snapshot, Provenance::Snapshot));
        assert!(!cache.get(3).unwrap().is_changed());
    }

    #[test]
    fn test_field_diff_sets_changed() {
        let mut cache = PortCache::default();
        cache.apply(&[update(3, 1000, true)], Provenance::Delta);
        assert!(cache.get(3).unwrap().is_changed());

        assert!(cache.apply(&[update(3, 1000, false)], Provenance::Delta));
        let port = cache.get(3).unwrap();
        assert!(port.is_changed());
        assert!(!port.is_link_up());
    }

    #[test]
    fn test_delta_does_not_remove_absent() {
        let mut cache = PortCache::default();
        cache.apply(&[update(3, 1000, true), update(5, 100, true)], Provenance::Snapshot);
        // A delta mentioning only port 3 must not tombstone port 5.
        cache.apply(&[update(3, 10, true)], Provenance::Delta);
        assert!(!cache.get(5).unwrap().is_removed());
    }

    #[test]
    fn test_explicit_removal_tombstones_one_cycle() {
        let mut cache = PortCache::default();
        cache.apply(&[update(3, 1000, true)], Provenance::Snapshot);

        let removal = PortUpdate {
            removed: true,
            ..update(3, 1000, true)
        };
        assert!(cache.apply(&[removal], Provenance::Delta));

        // Still readable until purge.
        let port = cache.get(3).unwrap();
        assert!(port.is_removed());
        assert_eq!(port.speed(), 1000);

        assert_eq!(cache.purge_removed(), vec![3]);
        assert!(cache.get(3).is_none());
    }

    #[test]
    fn test_removal_of_unknown_port_ignored() {
        let mut cache = PortCache::default();
        let removal = PortUpdate {
            removed: true,
            ..update(9, 0, false)
        };
        assert!(!cache.apply(&[removal], Provenance::Delta));
    }
}
