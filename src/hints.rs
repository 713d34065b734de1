//! The built-in root hints.

use std::net::{IpAddr, Ipv4Addr};

/// TTL applied to the built-in root hints: six days, in seconds.
pub const ROOT_HINTS_TTL: u32 = 518_400;

/// The 13 root servers.
pub(crate) const ROOT_HINTS: &[(&str, Ipv4Addr)] = &[
    ("a.root-servers.net.", Ipv4Addr::new(198, 41, 0, 4)),
    ("b.root-servers.net.", Ipv4Addr::new(199, 9, 14, 201)),
    ("c.root-servers.net.", Ipv4Addr::new(192, 33, 4, 12)),
    ("d.root-servers.net.", Ipv4Addr::new(199, 7, 91, 13)),
    ("e.root-servers.net.", Ipv4Addr::new(192, 203, 230, 10)),
    ("f.root-servers.net.", Ipv4Addr::new(192, 5, 5, 241)),
    ("g.root-servers.net.", Ipv4Addr::new(192, 112, 36, 4)),
    ("h.root-servers.net.", Ipv4Addr::new(198, 97, 190, 53)),
    ("i.root-servers.net.", Ipv4Addr::new(192, 36, 148, 17)),
    ("j.root-servers.net.", Ipv4Addr::new(192, 58, 128, 30)),
    ("k.root-servers.net.", Ipv4Addr::new(193, 0, 14, 129)),
    ("l.root-servers.net.", Ipv4Addr::new(199, 7, 83, 42)),
    ("m.root-servers.net.", Ipv4Addr::new(202, 12, 27, 33)),
];

/// The built-in hints as `(ns name, address)` pairs.
pub(crate) fn builtin_root_hints() -> impl Iterator<Item = (&'static str, IpAddr)> {
    ROOT_HINTS
        .iter()
        .map(|(name, addr)| (*name, IpAddr::V4(*addr)))
}
