//! DNS message codec with mDNS extensions (RFC 1035, RFC 6762 §18).
//!
//! Pure functions over byte buffers: no I/O and no state beyond the name
//! compression table of a single encode pass.

mod buffer;
mod message;
mod name;
mod record;

use std::net::{Ipv4Addr, Ipv6Addr};

pub use message::{Header, Message};
pub use name::Name;
pub use record::{
    parse_txt, txt_strings, Question, RecordData, RecordType, ResourceRecord, TxtProperty,
};

/// The well-known mDNS port.
pub const MDNS_PORT: u16 = 5353;

/// IPv4 link-local mDNS group.
pub const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// IPv6 link-local mDNS group.
pub const MDNS_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

/// Jumbo-frame ceiling from RFC 6762 §17 minus IP and UDP headers.
pub const MAX_MESSAGE_SIZE: usize = 8972;

pub const CLASS_IN: u16 = 1;
pub const CLASS_ANY: u16 = 255;

/// Top bit of the question class: unicast response requested.
pub const UNICAST_RESPONSE: u16 = 0x8000;

/// Top bit of the record class: replace rather than merge cached copies.
pub const CACHE_FLUSH: u16 = 0x8000;

pub const FLAGS_QR_RESPONSE: u16 = 0x8000;
pub const FLAGS_AA: u16 = 0x0400;
pub const FLAGS_TC: u16 = 0x0200;
const FLAGS_OPCODE_MASK: u16 = 0x7800;
const FLAGS_RCODE_MASK: u16 = 0x000F;
