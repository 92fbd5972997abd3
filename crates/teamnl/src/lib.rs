//! Client library for kernel "team" network aggregation devices.
//!
//! The team driver exposes its control surface as a generic netlink family;
//! device lifecycle and port enslavement go through route netlink. This
//! crate speaks both, keeps local caches of ports, link-info records, and
//! named options consistent with asynchronous kernel notifications, and
//! delivers precise incremental change events to registered handlers.
//!
//! The library is single-threaded and caller-pumped: it never spawns
//! threads and never blocks outside an explicit request round trip. The
//! application watches the raw event fds ([`TeamHandle::event_fd`],
//! [`TeamHandle::rtnl_event_fd`]) in its own poll loop and calls
//! [`TeamHandle::check_events`] when one becomes readable.
//!
//! ```no_run
//! use teamnl::{ChangeMask, TeamHandle};
//!
//! fn main() -> teamnl::Result<()> {
//!     let mut team = TeamHandle::new()?;
//!     team.create("team0")?;
//!     let ifindex = team.ifname_to_index("team0")?;
//!
//!     team.change_handler_register(ChangeMask::PORT, |handle, _mask| {
//!         for port in handle.ports() {
//!             println!("port {}: up={}", port.ifindex(), port.is_link_up());
//!         }
//!     });
//!
//!     team.init(ifindex)?;
//!     team.set_mode("activebackup")?;
//!
//!     loop {
//!         // poll(team.event_fd(), team.rtnl_event_fd()) here
//!         team.check_events()?;
//!     }
//! }
//! ```

pub mod bpf;
pub mod change;
pub mod codec;
pub mod error;
pub mod handle;
pub mod ifinfo;
pub mod netlink;
pub mod options;
pub mod port;
pub mod rtnl;
pub mod session;

pub use bpf::{SockFilter, SockFprog};
pub use change::{ChangeMask, Eventfd, HandlerId};
pub use error::{Result, TeamError};
pub use handle::TeamHandle;
pub use ifinfo::Ifinfo;
pub use options::{OptionScope, OptionType, OptionValue, TeamOption};
pub use port::{Duplex, Port, Provenance};
