use std::collections::HashMap;

use ipfilter_common::Family;

use crate::cidr::Address;

// Protocol numbers the compiler knows by name without asking a resolver.
const PROTOCOLS: &[(&str, u8)] = &[
    ("ip", 0),
    ("icmp", 1),
    ("igmp", 2),
    ("ggp", 3),
    ("ipencap", 4),
    ("tcp", 6),
    ("egp", 8),
    ("udp", 17),
    ("ipv6", 41),
    ("ipv6-route", 43),
    ("ipv6-frag", 44),
    ("rsvp", 46),
    ("gre", 47),
    ("esp", 50),
    ("ah", 51),
    ("ipv6-icmp", 58),
    ("icmp6", 58),
    ("ipv6-nonxt", 59),
    ("ipv6-opts", 60),
    ("ospf", 89),
    ("pim", 103),
    ("vrrp", 112),
    ("sctp", 132),
];

pub fn well_known_proto(name: &str) -> Option<u8> {
    PROTOCOLS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, num)| *num)
}

/// Canonical name for a protocol number, if it has one.
pub fn proto_name(num: u8) -> Option<&'static str> {
    PROTOCOLS
        .iter()
        .find(|(_, n)| *n == num)
        .map(|(name, _)| *name)
}

/// Name and service lookups the rule compiler delegates.
///
/// Numeric literals never reach a resolver.
pub trait Resolver: Send + Sync {
    fn resolve_host(&self, name: &str, family: Family) -> Option<Address>;

    /// `proto` is the protocol name when the rule already named one.
    fn resolve_port(&self, name: &str, proto: Option<&str>) -> Option<u16>;

    fn resolve_proto(&self, name: &str) -> Option<u8> {
        well_known_proto(name)
    }
}

/// Resolves nothing but the built-in protocol table.
#[derive(Debug, Default, Clone, Copy)]
pub struct LiteralResolver;

impl Resolver for LiteralResolver {
    fn resolve_host(&self, _name: &str, _family: Family) -> Option<Address> {
        None
    }

    fn resolve_port(&self, _name: &str, _proto: Option<&str>) -> Option<u16> {
        None
    }
}

/// In-memory host and service tables.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    hosts: HashMap<String, Address>,
    services: HashMap<String, Vec<(Option<String>, u16)>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, name: impl Into<String>, addr: impl Into<Address>) -> Self {
        self.hosts.insert(name.into(), addr.into());
        self
    }

    /// Registers a service. A `None` protocol answers for any protocol.
    pub fn with_service(mut self, name: impl Into<String>, proto: Option<&str>, port: u16) -> Self {
        self.services
            .entry(name.into())
            .or_default()
            .push((proto.map(str::to_string), port));
        self
    }
}

impl Resolver for StaticResolver {
    fn resolve_host(&self, name: &str, family: Family) -> Option<Address> {
        self.hosts
            .get(name)
            .copied()
            .filter(|a| a.family() == family)
    }

    fn resolve_port(&self, name: &str, proto: Option<&str>) -> Option<u16> {
        let entries = self.services.get(name)?;
        entries
            .iter()
            .find(|(p, _)| p.is_some() && p.as_deref() == proto)
            .or_else(|| entries.iter().find(|(p, _)| p.is_none() || proto.is_none()))
            .map(|(_, port)| *port)
    }
}
