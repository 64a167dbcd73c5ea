use ipfilter_common::{Family, MatchBlock, FI_TCPUDP, IPPROTO_TCP, IPPROTO_UDP};
use serde::Serialize;

use crate::cidr::Address;

/// ICMP header fields of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct IcmpInfo {
    pub ty: u8,
    pub code: u8,
    pub id: u16,
    pub seq: u16,
}

impl IcmpInfo {
    /// `type << 8 | code`, the form ICMP rules compare against.
    pub fn type_code(&self) -> u16 {
        (self.ty as u16) << 8 | self.code as u16
    }
}

/// Header fields of one packet, as the classifier sees them.
///
/// Fields the packet does not carry stay `None`; any rule predicate on them
/// evaluates false.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketSummary {
    src: Address,
    dst: Address,
    proto: u8,
    sport: Option<u16>,
    dport: Option<u16>,
    tcp_flags: Option<u8>,
    icmp: Option<IcmpInfo>,
    tos: u8,
    ttl: u8,
    options: u32,
    security: u8,
    flags: u32,
    in_if: Option<String>,
    out_if: Option<String>,
    len: u64,
}

impl PacketSummary {
    pub fn new(src: impl Into<Address>, dst: impl Into<Address>) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            proto: 0,
            sport: None,
            dport: None,
            tcp_flags: None,
            icmp: None,
            tos: 0,
            ttl: 64,
            options: 0,
            security: 0,
            flags: 0,
            in_if: None,
            out_if: None,
            len: 0,
        }
    }

    pub fn with_proto(self, proto: u8) -> Self {
        Self { proto, ..self }
    }

    pub fn with_ports(self, sport: u16, dport: u16) -> Self {
        Self {
            sport: Some(sport),
            dport: Some(dport),
            ..self
        }
    }

    pub fn with_tcp_flags(self, flags: u8) -> Self {
        Self {
            tcp_flags: Some(flags),
            ..self
        }
    }

    pub fn with_icmp(self, icmp: IcmpInfo) -> Self {
        Self {
            icmp: Some(icmp),
            ..self
        }
    }

    pub fn with_tos(self, tos: u8) -> Self {
        Self { tos, ..self }
    }

    pub fn with_ttl(self, ttl: u8) -> Self {
        Self { ttl, ..self }
    }

    /// IP option bitmap.
    pub fn with_options(self, options: u32) -> Self {
        Self { options, ..self }
    }

    /// Security class bitmap.
    pub fn with_security(self, security: u8) -> Self {
        Self { security, ..self }
    }

    /// Packet flags (`FI_*`), e.g. fragment or short.
    pub fn with_flags(self, flags: u32) -> Self {
        Self { flags, ..self }
    }

    pub fn with_in_if(self, ifname: impl Into<String>) -> Self {
        Self {
            in_if: Some(ifname.into()),
            ..self
        }
    }

    pub fn with_out_if(self, ifname: impl Into<String>) -> Self {
        Self {
            out_if: Some(ifname.into()),
            ..self
        }
    }

    /// Length in bytes, for the byte counters.
    pub fn with_len(self, len: u64) -> Self {
        Self { len, ..self }
    }

    pub fn family(&self) -> Family {
        self.src.family()
    }

    pub fn src(&self) -> Address {
        self.src
    }

    pub fn dst(&self) -> Address {
        self.dst
    }

    pub fn proto(&self) -> u8 {
        self.proto
    }

    pub fn sport(&self) -> Option<u16> {
        self.sport
    }

    pub fn dport(&self) -> Option<u16> {
        self.dport
    }

    pub fn tcp_flags(&self) -> Option<u8> {
        self.tcp_flags
    }

    pub fn icmp(&self) -> Option<IcmpInfo> {
        self.icmp
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn in_if(&self) -> Option<&str> {
        self.in_if.as_deref()
    }

    pub fn out_if(&self) -> Option<&str> {
        self.out_if.as_deref()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_tcp(&self) -> bool {
        self.proto == IPPROTO_TCP
    }

    /// Packed header words for the coarse compare.
    pub fn match_block(&self) -> MatchBlock {
        let mut flags = self.flags;
        if self.proto == IPPROTO_TCP || self.proto == IPPROTO_UDP {
            flags |= FI_TCPUDP;
        }
        MatchBlock::new()
            .with_header(self.family().version(), self.tos, self.ttl, self.proto)
            .with_options(self.options)
            .with_security(self.security)
            .with_flags(flags)
    }
}
