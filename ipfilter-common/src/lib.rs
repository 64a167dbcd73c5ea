#![cfg_attr(not(feature = "user"), no_std)]
mod match_block;
mod port_cmp;

pub use match_block::{
    CoarseMatch, MatchBlock, FI_BAD, FI_BROADCAST, FI_FRAG, FI_MBCAST, FI_MULTICAST, FI_OOW,
    FI_OPTIONS, FI_SHORT, FI_TCPUDP,
};
pub use port_cmp::{PortCmp, PortOp};
pub use strum::EnumCount;

#[cfg(feature = "user")]
pub use port_cmp::PortCmpError;
use strum_macros::EnumCount;

pub const TH_FIN: u8 = 0x01;
pub const TH_SYN: u8 = 0x02;
pub const TH_RST: u8 = 0x04;
pub const TH_PUSH: u8 = 0x08;
pub const TH_ACK: u8 = 0x10;
pub const TH_URG: u8 = 0x20;
pub const TH_ECN: u8 = 0x40;
pub const TH_CWR: u8 = 0x80;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

// 0xFF is reserved so this should work forever....
// Stands for "tcp or udp" wherever a protocol number is expected.
pub const GENERIC_PROTO: u8 = 0xFF;

/// Which way a packet is travelling relative to the filtering host.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, EnumCount)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "user", serde(rename_all = "lowercase"))]
pub enum Direction {
    In = 0,
    Out = 1,
}

impl Direction {
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

/// Address family of a rule list or packet.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, EnumCount)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum Family {
    #[default]
    #[cfg_attr(feature = "user", serde(rename = "inet"))]
    V4 = 0,
    #[cfg_attr(feature = "user", serde(rename = "inet6"))]
    V6 = 1,
}

impl Family {
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// IP header version number.
    pub const fn version(self) -> u8 {
        match self {
            Family::V4 => 4,
            Family::V6 => 6,
        }
    }

    /// Width of an address in bits.
    pub const fn bits(self) -> u32 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Family::V4 => "inet",
            Family::V6 => "inet6",
        }
    }
}
