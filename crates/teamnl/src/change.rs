//! Change categories, the change-handler registry, and the external
//! event-fd registry.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::unix::io::RawFd;

/// Set of change categories accumulated over one pump cycle.
///
/// Categories combine with `|` and intersect with `&`, preserving the
/// bitmask semantics of the wire-level interface while keeping the set
/// closed over the three known categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeMask(u32);

impl ChangeMask {
    /// No categories.
    pub const NONE: ChangeMask = ChangeMask(0);
    /// Port list membership or port fields changed.
    pub const PORT: ChangeMask = ChangeMask(0x1);
    /// Option list membership or option values changed.
    pub const OPTION: ChangeMask = ChangeMask(0x2);
    /// Link-info records (hwaddr, name) changed.
    pub const IFINFO: ChangeMask = ChangeMask(0x4);
    /// All categories.
    pub const ANY: ChangeMask = ChangeMask(0x7);

    /// Check whether no category is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Check whether every category in `other` is set in `self`.
    pub fn contains(self, other: ChangeMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check whether `self` and `other` share any category.
    pub fn intersects(self, other: ChangeMask) -> bool {
        self.0 & other.0 != 0
    }

    /// Raw bit representation (interface-boundary compatibility).
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Construct from raw bits, keeping only known categories.
    pub fn from_bits(bits: u32) -> ChangeMask {
        ChangeMask(bits & Self::ANY.0)
    }
}

impl BitOr for ChangeMask {
    type Output = ChangeMask;
    fn bitor(self, rhs: ChangeMask) -> ChangeMask {
        ChangeMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for ChangeMask {
    fn bitor_assign(&mut self, rhs: ChangeMask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ChangeMask {
    type Output = ChangeMask;
    fn bitand(self, rhs: ChangeMask) -> ChangeMask {
        ChangeMask(self.0 & rhs.0)
    }
}

impl fmt::Display for ChangeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (bit, name) in [
            (Self::PORT, "port"),
            (Self::OPTION, "option"),
            (Self::IFINFO, "ifinfo"),
        ] {
            if self.contains(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// Identifier of a registered change handler, returned by registration
/// and used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

/// A registered change handler: callback plus subscribed categories.
struct HandlerEntry<Ctx> {
    id: HandlerId,
    subscribed: ChangeMask,
    callback: Box<dyn FnMut(&Ctx, ChangeMask)>,
}

/// Registry of change handlers, dispatched in registration order.
///
/// Generic over the context passed to callbacks so the dispatch logic can
/// be exercised without a live handle.
pub struct ChangeRegistry<Ctx> {
    entries: Vec<HandlerEntry<Ctx>>,
    next_id: u64,
}

impl<Ctx> Default for ChangeRegistry<Ctx> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }
}

impl<Ctx> ChangeRegistry<Ctx> {
    /// Register a handler for the given categories.
    pub fn register(
        &mut self,
        subscribed: ChangeMask,
        callback: Box<dyn FnMut(&Ctx, ChangeMask)>,
    ) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.entries.push(HandlerEntry {
            id,
            subscribed,
            callback,
        });
        id
    }

    /// Unregister a handler. Returns true if it was registered.
    pub fn unregister(&mut self, id: HandlerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Subscribed masks in registration order.
    pub fn subscriptions(&self) -> impl Iterator<Item = (HandlerId, ChangeMask)> + '_ {
        self.entries.iter().map(|e| (e.id, e.subscribed))
    }

    /// Invoke every handler whose subscription intersects `cycle`, in
    /// registration order, with the intersection of its subscription and
    /// what actually changed. Handlers never observe a zero mask.
    ///
    /// Handlers must not re-enter the pump or mutate this registry during
    /// their own invocation; that is a caller obligation, not an enforced
    /// lock.
    pub fn dispatch(&mut self, ctx: &Ctx, cycle: ChangeMask) {
        if cycle.is_empty() {
            return;
        }
        for entry in &mut self.entries {
            let effective = cycle & entry.subscribed;
            if !effective.is_empty() {
                (entry.callback)(ctx, effective);
            }
        }
    }
}

/// A registered external file descriptor with its invocation callback.
///
/// The registry owns the record, not the descriptor.
pub struct Eventfd {
    fd: RawFd,
    callback: Box<dyn FnMut()>,
}

impl Eventfd {
    /// The watched file descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

/// Registry of auxiliary file descriptors the consumer's event loop
/// watches alongside the primary event sockets.
#[derive(Default)]
pub struct EventfdRegistry {
    entries: Vec<Eventfd>,
}

impl EventfdRegistry {
    /// Add a watched descriptor with its callback.
    pub fn register(&mut self, fd: RawFd, callback: Box<dyn FnMut()>) {
        self.entries.push(Eventfd { fd, callback });
    }

    /// Remove a watched descriptor. Returns true if it was registered.
    pub fn unregister(&mut self, fd: RawFd) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.fd != fd);
        self.entries.len() != before
    }

    /// Iterate registered descriptors in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Eventfd> {
        self.entries.iter()
    }

    /// Invoke the callback paired with `fd` exactly once.
    ///
    /// Returns false if the descriptor is not registered.
    pub fn call(&mut self, fd: RawFd) -> bool {
        match self.entries.iter_mut().find(|e| e.fd == fd) {
            Some(entry) => {
                (entry.callback)();
                true
            }
            None => false,
        }
    }
}
