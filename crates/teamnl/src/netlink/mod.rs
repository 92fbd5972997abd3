//! Netlink wire substrate: message framing, attributes, request building,
//! socket operations, and generic netlink family resolution.

pub mod attr;
pub mod builder;
pub mod genl;
pub mod message;
pub mod socket;

pub use builder::MessageBuilder;
pub use socket::{NetlinkSocket, Protocol};
