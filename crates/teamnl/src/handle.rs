//! `TeamHandle`: the per-device context tying the transport session, the
//! entity caches, and the change-dispatch machinery together.
//!
//! A handle is allocated disconnected (`TeamHandle::new`), optionally used
//! to create a device, then bound to one with `init`. From then on the
//! application watches `event_fd`/`rtnl_event_fd` for readability and calls
//! `check_events` to pump: drain notifications, converge the caches, and
//! invoke change handlers exactly once per cycle.

use std::any::Any;
use std::mem;
use std::os::unix::io::RawFd;

use tracing::{Level, debug};

use crate::bpf::SockFprog;
use crate::change::{ChangeMask, ChangeRegistry, Eventfd, EventfdRegistry, HandlerId};
use crate::codec::{
    self, OPT_ACTIVE_PORT, OPT_BPF_HASH_FUNC, OPT_MODE, TeamEvent,
};
use crate::error::{Result, TeamError};
use crate::ifinfo::{Ifinfo, IfinfoCache, IfinfoUpdate};
use crate::options::{OptionCache, OptionScope, OptionValue, TeamOption};
use crate::port::{Port, PortCache, Provenance};
use crate::session::TeamSession;

/// Per-device handle. Owns the sockets and caches; not `Sync` (callbacks
/// are `FnMut` boxes, mutation happens on the owning thread only).
pub struct TeamHandle {
    session: TeamSession,
    /// Interface index of the controlled device; 0 while unbound.
    ifindex: u32,
    ports: PortCache,
    ifinfos: IfinfoCache,
    options: OptionCache,
    handlers: ChangeRegistry<TeamHandle>,
    eventfds: EventfdRegistry,
    /// Change bits accumulated outside the pump (request-side applies),
    /// consumed by the next cycle.
    pending: ChangeMask,
    /// Per-handle verbosity ceiling for this handle's own log points.
    log_level: Level,
    user_data: Option<Box<dyn Any>>,
}

impl TeamHandle {
    /// Open the netlink sockets and resolve the team family. The handle is
    /// not bound to a device yet; follow with `create`/`recreate` and
    /// `init`.
    pub fn new() -> Result<Self> {
        Ok(Self {
            session: TeamSession::new()?,
            ifindex: 0,
            ports: PortCache::default(),
            ifinfos: IfinfoCache::default(),
            options: OptionCache::default(),
            handlers: ChangeRegistry::default(),
            eventfds: EventfdRegistry::default(),
            pending: ChangeMask::NONE,
            log_level: Level::INFO,
            user_data: None,
        })
    }

    // ------------------------------------------------------------------
    // Device lifecycle
    // ------------------------------------------------------------------

    /// Create a new team device. Fails if the name is taken.
    pub fn create(&mut self, name: &str) -> Result<()> {
        self.session.rtnl().create_team(name)
    }

    /// Create a team device, replacing an existing link of the same name.
    pub fn recreate(&mut self, name: &str) -> Result<()> {
        self.session.rtnl().recreate_team(name)
    }

    /// Delete the bound device.
    pub fn destroy(&mut self) -> Result<()> {
        let ifindex = self.require_bound()?;
        self.session.rtnl().delete_link(ifindex)
    }

    /// Bind the handle to a device and load its initial state.
    ///
    /// Queries the full port and option lists, seeds link-info records for
    /// the device and its ports, and dispatches change handlers registered
    /// so far with everything observed.
    pub fn init(&mut self, ifindex: u32) -> Result<()> {
        self.ifindex = ifindex;
        self.refresh()
    }

    /// Re-query the authoritative kernel state and reconcile the caches,
    /// dispatching handlers with whatever actually changed.
    pub fn refresh(&mut self) -> Result<()> {
        self.require_bound()?;
        if self.log_enabled(Level::DEBUG) {
            debug!(ifindex = self.ifindex, "refreshing device state");
        }

        let family = self.session.family_id();
        let ifindex = self.ifindex;

        let mut cycle = mem::take(&mut self.pending);

        // A dump reply may arrive split across messages; merge every part
        // before reconciling, so the whole reply counts as one snapshot.
        let mut replies = self.session.request(codec::port_list_request(family, ifindex))?;
        replies.extend(self.session.request(codec::options_request(family, ifindex))?);
        let (ports, options) = codec::collect_team_updates(family, &replies);

        if let Some(updates) = ports {
            if self.ports.apply(&updates, Provenance::Snapshot) {
                cycle |= ChangeMask::PORT;
            }
            // Give every live port a link-info record. This is the
            // request-driven path, so blocking lookups are fine here.
            for update in &updates {
                if !update.removed && self.ifinfos.get(update.ifindex).is_none() {
                    cycle |= self.seed_ifinfo(update.ifindex);
                }
            }
        }
        if let Some(updates) = options
            && self.options.apply(&updates, Provenance::Snapshot)
        {
            cycle |= ChangeMask::OPTION;
        }

        // The device's own link-info record never arrives via the team
        // family; fetch it directly.
        cycle |= self.seed_ifinfo(ifindex);

        cycle |= self.cascade_port_removals();
        self.finish_cycle(cycle);
        Ok(())
    }

    /// Interface index of the bound device (0 while unbound).
    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    /// Name of the bound device.
    pub fn ifname(&mut self) -> Result<String> {
        let ifindex = self.require_bound()?;
        if let Some(info) = self.ifinfos.get(ifindex) {
            return Ok(info.ifname().to_string());
        }
        self.session.rtnl().link_name(ifindex)
    }

    fn require_bound(&self) -> Result<u32> {
        if self.ifindex == 0 {
            return Err(TeamError::NotFound("handle not bound to a device".into()));
        }
        Ok(self.ifindex)
    }

    // ------------------------------------------------------------------
    // Event pump
    // ------------------------------------------------------------------

    /// Drain every buffered notification on both event sockets, converge
    /// the caches, and dispatch change handlers once with the accumulated
    /// cycle mask. Never blocks. Returns the cycle mask.
    pub fn check_events(&mut self) -> Result<ChangeMask> {
        let family = self.session.family_id();
        let mut cycle = mem::take(&mut self.pending);

        for datagram in self.session.drain_team_events()? {
            for event in codec::decode_team_datagram(family, &datagram, Provenance::Delta) {
                cycle |= self.apply_team_event(event);
            }
        }
        for datagram in self.session.drain_link_events()? {
            let updates = codec::decode_link_datagram(&datagram);
            cycle |= self.apply_link_updates(&updates);
        }

        cycle |= self.cascade_port_removals();
        self.finish_cycle(cycle);
        Ok(cycle)
    }

    fn apply_team_event(&mut self, event: TeamEvent) -> ChangeMask {
        match event {
            // No rtnetlink lookups here: this runs inside the pump, which
            // must not block. A new port's link-info record arrives on the
            // link notification plane and converges one cycle later.
            TeamEvent::PortList(updates, provenance) => {
                if self.ports.apply(&updates, provenance) {
                    ChangeMask::PORT
                } else {
                    ChangeMask::NONE
                }
            }
            TeamEvent::OptionList(updates, provenance) => {
                if self.options.apply(&updates, provenance) {
                    ChangeMask::OPTION
                } else {
                    ChangeMask::NONE
                }
            }
        }
    }

    fn apply_link_updates(&mut self, updates: &[IfinfoUpdate]) -> ChangeMask {
        // Only the device itself and its ports are of interest.
        let relevant: Vec<IfinfoUpdate> = updates
            .iter()
            .filter(|u| u.ifindex == self.ifindex || self.ports.get(u.ifindex).is_some())
            .cloned()
            .collect();
        if relevant.is_empty() {
            return ChangeMask::NONE;
        }
        if self.ifinfos.apply(&relevant, Provenance::Delta) {
            ChangeMask::IFINFO
        } else {
            ChangeMask::NONE
        }
    }

    /// Fetch one link's attributes over rtnetlink and fold them into the
    /// link-info cache. Lookup failure is non-fatal (the link may already
    /// be gone).
    fn seed_ifinfo(&mut self, ifindex: u32) -> ChangeMask {
        match self.session.rtnl().link_attrs(ifindex) {
            Ok(attrs) => {
                let update = IfinfoUpdate {
                    ifindex: attrs.ifindex,
                    hwaddr: attrs.hwaddr,
                    ifname: attrs.ifname,
                    removed: false,
                };
                if self.ifinfos.apply(&[update], Provenance::Delta) {
                    ChangeMask::IFINFO
                } else {
                    ChangeMask::NONE
                }
            }
            Err(e) => {
                if self.log_enabled(Level::DEBUG) {
                    debug!(ifindex, error = %e, "link-info lookup failed");
                }
                ChangeMask::NONE
            }
        }
    }

    /// Tombstoned ports take their link-info records and per-port options
    /// with them, within the same dispatch cycle.
    fn cascade_port_removals(&mut self) -> ChangeMask {
        let removed: Vec<u32> = self
            .ports
            .iter()
            .filter(|p| p.is_removed())
            .map(|p| p.ifindex())
            .collect();

        let mut mask = ChangeMask::NONE;
        for ifindex in removed {
            if self.ifinfos.mark_removed(ifindex) {
                mask |= ChangeMask::IFINFO;
            }
            if self.options.mark_port_removed(ifindex) {
                mask |= ChangeMask::OPTION;
            }
        }
        mask
    }

    /// Dispatch handlers for a finished cycle, then free tombstones.
    fn finish_cycle(&mut self, cycle: ChangeMask) {
        if !cycle.is_empty() {
            if self.log_enabled(Level::DEBUG) {
                debug!(mask = %cycle, "dispatching change handlers");
            }
            // The registry is moved out so handlers can borrow the handle;
            // registering or unregistering from inside a handler is
            // forbidden by contract.
            let mut handlers = mem::take(&mut self.handlers);
            handlers.dispatch(self, cycle);
            self.handlers = handlers;
        }

        self.ports.purge_removed();
        self.ifinfos.purge_removed();
        self.options.purge_removed();
    }

    // ------------------------------------------------------------------
    // Options
    // ------------------------------------------------------------------

    /// Look up a device-global option.
    pub fn option(&self, name: &str) -> Result<&TeamOption> {
        self.options.resolve(name, OptionScope::Global)
    }

    /// Look up a per-port option.
    pub fn port_option(&self, name: &str, port_ifindex: u32) -> Result<&TeamOption> {
        self.options.resolve(name, OptionScope::Port(port_ifindex))
    }

    /// Look up an option by name alone, whatever its scope.
    pub fn option_by_name(&self, name: &str) -> Option<&TeamOption> {
        self.options.get_by_name(name)
    }

    /// Get a global u32 option value.
    pub fn option_u32(&self, name: &str) -> Result<u32> {
        self.option(name)?.value_u32()
    }

    /// Get a global string option value.
    pub fn option_str(&self, name: &str) -> Result<&str> {
        self.option(name)?.value_str()
    }

    /// Get a global binary option value.
    pub fn option_bin(&self, name: &str) -> Result<&[u8]> {
        self.option(name)?.value_bin()
    }

    /// Get a global bool option value.
    pub fn option_bool(&self, name: &str) -> Result<bool> {
        self.option(name)?.value_bool()
    }

    /// Get a per-port u32 option value.
    pub fn port_option_u32(&self, name: &str, port_ifindex: u32) -> Result<u32> {
        self.port_option(name, port_ifindex)?.value_u32()
    }

    /// Get a per-port string option value.
    pub fn port_option_str(&self, name: &str, port_ifindex: u32) -> Result<&str> {
        self.port_option(name, port_ifindex)?.value_str()
    }

    /// Get a per-port binary option value.
    pub fn port_option_bin(&self, name: &str, port_ifindex: u32) -> Result<&[u8]> {
        self.port_option(name, port_ifindex)?.value_bin()
    }

    /// Get a per-port bool option value.
    pub fn port_option_bool(&self, name: &str, port_ifindex: u32) -> Result<bool> {
        self.port_option(name, port_ifindex)?.value_bool()
    }

    /// Set a global u32 option.
    pub fn set_option_u32(&mut self, name: &str, value: u32) -> Result<()> {
        self.set_option(name, OptionScope::Global, OptionValue::U32(value))
    }

    /// Set a global string option.
    pub fn set_option_str(&mut self, name: &str, value: &str) -> Result<()> {
        self.set_option(name, OptionScope::Global, OptionValue::Str(value.to_string()))
    }

    /// Set a global binary option.
    pub fn set_option_bin(&mut self, name: &str, value: &[u8]) -> Result<()> {
        self.set_option(name, OptionScope::Global, OptionValue::Bin(value.to_vec()))
    }

    /// Set a global bool option.
    pub fn set_option_bool(&mut self, name: &str, value: bool) -> Result<()> {
        self.set_option(name, OptionScope::Global, OptionValue::Bool(value))
    }

    /// Set a per-port u32 option.
    pub fn set_port_option_u32(&mut self, name: &str, port_ifindex: u32, value: u32) -> Result<()> {
        self.set_option(name, OptionScope::Port(port_ifindex), OptionValue::U32(value))
    }

    /// Set a per-port string option.
    pub fn set_port_option_str(&mut self, name: &str, port_ifindex: u32, value: &str) -> Result<()> {
        self.set_option(
            name,
            OptionScope::Port(port_ifindex),
            OptionValue::Str(value.to_string()),
        )
    }

    /// Set a per-port binary option.
    pub fn set_port_option_bin(&mut self, name: &str, port_ifindex: u32, value: &[u8]) -> Result<()> {
        self.set_option(
            name,
            OptionScope::Port(port_ifindex),
            OptionValue::Bin(value.to_vec()),
        )
    }

    /// Set a per-port bool option.
    pub fn set_port_option_bool(&mut self, name: &str, port_ifindex: u32, value: bool) -> Result<()> {
        self.set_option(name, OptionScope::Port(port_ifindex), OptionValue::Bool(value))
    }

    /// Send one option to the kernel.
    ///
    /// The option must already exist in the cache (the kernel owns the
    /// option namespace), with the same scope and value type. Any state
    /// echoed in the reply is folded into the pending mask; the definitive
    /// change notification arrives on the event plane and is observed at
    /// the next `check_events`.
    pub fn set_option(&mut self, name: &str, scope: OptionScope, value: OptionValue) -> Result<()> {
        let ifindex = self.require_bound()?;
        let existing = self.options.resolve(name, scope)?;
        if existing.option_type() != value.kind() {
            return Err(TeamError::OptionTypeMismatch {
                name: name.to_string(),
            });
        }

        let family = self.session.family_id();
        let builder = codec::options_set_request(family, ifindex, name, scope, &value);
        let replies = self.session.request(builder)?;

        let mut pending = ChangeMask::NONE;
        for datagram in replies {
            for event in codec::decode_team_datagram(family, &datagram, Provenance::Delta) {
                pending |= self.apply_team_event(event);
            }
        }
        self.pending |= pending;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Well-known options
    // ------------------------------------------------------------------

    /// Current runtime mode name ("roundrobin", "activebackup", ...).
    pub fn mode(&self) -> Result<&str> {
        self.option_str(OPT_MODE)
    }

    /// Switch the runtime mode.
    pub fn set_mode(&mut self, mode: &str) -> Result<()> {
        self.set_option_str(OPT_MODE, mode)
    }

    /// Interface index of the active port (activebackup mode).
    pub fn active_port(&self) -> Result<u32> {
        self.option_u32(OPT_ACTIVE_PORT)
    }

    /// Select the active port (activebackup mode).
    pub fn set_active_port(&mut self, port_ifindex: u32) -> Result<()> {
        self.set_option_u32(OPT_ACTIVE_PORT, port_ifindex)
    }

    /// Current hash classifier program (loadbalance mode).
    pub fn bpf_hash_func(&self) -> Result<SockFprog> {
        SockFprog::from_bytes(self.option_bin(OPT_BPF_HASH_FUNC)?)
    }

    /// Install a hash classifier program (loadbalance mode).
    pub fn set_bpf_hash_func(&mut self, prog: &SockFprog) -> Result<()> {
        self.set_option_bin(OPT_BPF_HASH_FUNC, &prog.to_bytes())
    }

    // ------------------------------------------------------------------
    // Ports and link info
    // ------------------------------------------------------------------

    /// Iterate cached ports in insertion order.
    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter()
    }

    /// Look up a cached port.
    pub fn port(&self, ifindex: u32) -> Option<&Port> {
        self.ports.get(ifindex)
    }

    /// Iterate cached link-info records in insertion order.
    pub fn ifinfos(&self) -> impl Iterator<Item = &Ifinfo> {
        self.ifinfos.iter()
    }

    /// Link-info record for one interface.
    pub fn ifinfo(&self, ifindex: u32) -> Option<&Ifinfo> {
        self.ifinfos.get(ifindex)
    }

    /// Link-info record associated with a cached port.
    pub fn port_ifinfo(&self, port_ifindex: u32) -> Option<&Ifinfo> {
        self.ports.get(port_ifindex)?;
        self.ifinfos.get(port_ifindex)
    }

    /// Iterate cached options in insertion order.
    pub fn options(&self) -> impl Iterator<Item = &TeamOption> {
        self.options.iter()
    }

    /// Enslave an interface as a port of the bound device.
    pub fn port_add(&mut self, port_ifindex: u32) -> Result<()> {
        let ifindex = self.require_bound()?;
        self.session.rtnl().set_master(port_ifindex, ifindex)
    }

    /// Release a port from the bound device.
    pub fn port_remove(&mut self, port_ifindex: u32) -> Result<()> {
        self.require_bound()?;
        self.session.rtnl().unset_master(port_ifindex)
    }

    /// Hardware address of an interface, from the cache when available.
    pub fn hwaddr(&mut self, ifindex: u32) -> Result<Vec<u8>> {
        if let Some(info) = self.ifinfos.get(ifindex) {
            return Ok(info.hwaddr().to_vec());
        }
        Ok(self.session.rtnl().link_attrs(ifindex)?.hwaddr)
    }

    /// Hardware address length of an interface.
    pub fn hwaddr_len(&mut self, ifindex: u32) -> Result<usize> {
        Ok(self.hwaddr(ifindex)?.len())
    }

    /// Set the hardware address of an interface.
    pub fn set_hwaddr(&mut self, ifindex: u32, addr: &[u8]) -> Result<()> {
        self.session.rtnl().set_hwaddr(ifindex, addr)
    }

    /// Resolve an interface name to its index.
    pub fn ifname_to_index(&mut self, name: &str) -> Result<u32> {
        self.session.rtnl().link_index(name)
    }

    /// Resolve an interface index to its name.
    pub fn index_to_ifname(&mut self, ifindex: u32) -> Result<String> {
        self.session.rtnl().link_name(ifindex)
    }

    // ------------------------------------------------------------------
    // Change handlers and external fds
    // ------------------------------------------------------------------

    /// Register a change handler for the given categories. Handlers run in
    /// registration order; each sees only categories it subscribed to.
    pub fn change_handler_register<F>(&mut self, mask: ChangeMask, callback: F) -> HandlerId
    where
        F: FnMut(&TeamHandle, ChangeMask) + 'static,
    {
        self.handlers.register(mask, Box::new(callback))
    }

    /// Unregister a change handler. Returns true if it was registered.
    pub fn change_handler_unregister(&mut self, id: HandlerId) -> bool {
        self.handlers.unregister(id)
    }

    /// Register an auxiliary descriptor for the application's event loop.
    pub fn eventfd_register<F>(&mut self, fd: RawFd, callback: F)
    where
        F: FnMut() + 'static,
    {
        self.eventfds.register(fd, Box::new(callback));
    }

    /// Unregister an auxiliary descriptor. Returns true if it was
    /// registered.
    pub fn eventfd_unregister(&mut self, fd: RawFd) -> bool {
        self.eventfds.unregister(fd)
    }

    /// Iterate registered auxiliary descriptors in registration order.
    pub fn eventfds(&self) -> impl Iterator<Item = &Eventfd> {
        self.eventfds.iter()
    }

    /// Invoke the callback paired with a readable auxiliary descriptor.
    /// Returns false if the descriptor is not registered.
    pub fn call_eventfd_handler(&mut self, fd: RawFd) -> bool {
        self.eventfds.call(fd)
    }

    /// Raw fd of the team event socket (watch for readability, then pump).
    pub fn event_fd(&self) -> RawFd {
        self.session.event_fd()
    }

    /// Raw fd of the link notification socket.
    pub fn rtnl_event_fd(&self) -> RawFd {
        self.session.rtnl_event_fd()
    }

    // ------------------------------------------------------------------
    // Logging and user context
    // ------------------------------------------------------------------

    /// Verbosity ceiling for this handle's own log points.
    pub fn log_level(&self) -> Level {
        self.log_level
    }

    /// Set the verbosity ceiling. Emission is still subject to the global
    /// `tracing` subscriber filter.
    pub fn set_log_level(&mut self, level: Level) {
        self.log_level = level;
    }

    fn log_enabled(&self, level: Level) -> bool {
        level <= self.log_level
    }

    /// Attach arbitrary consumer state to the handle.
    pub fn set_user_data(&mut self, data: Box<dyn Any>) {
        self.user_data = Some(data);
    }

    /// Shared access to the attached consumer state.
    pub fn user_data(&self) -> Option<&dyn Any> {
        self.user_data.as_deref()
    }

    /// Exclusive access to the attached consumer state.
    pub fn user_data_mut(&mut self) -> Option<&mut dyn Any> {
        self.user_data.as_deref_mut()
    }

    /// Detach and return the attached consumer state.
    pub fn take_user_data(&mut self) -> Option<Box<dyn Any>> {
        self.user_data.take()
    }
}
