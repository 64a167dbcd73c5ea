//! Field encoders: rule text segments to typed match values.
//!
//! All of these are pure; the compiler attaches line numbers to the
//! [FieldError]s they return.

use std::{
    net::{IpAddr, Ipv4Addr},
    str::FromStr,
};

use ipfilter_common::{Family, PortCmp, PortOp, GENERIC_PROTO, TH_CWR, TH_ECN, TH_SYN};
use ipnet::IpNet;

use crate::{
    cidr::{Address, HostMatch},
    error::FieldError,
    resolve::Resolver,
    token::Tokens,
};

type Result<T> = std::result::Result<T, FieldError>;

/// Mask covering the type byte of an ICMP value.
pub const ICMP_TYPE_MASK: u16 = 0xff00;
/// Mask covering type and code.
pub const ICMP_TYPE_CODE_MASK: u16 = 0xffff;

const TCP_FLAG_LETTERS: &[u8; 8] = b"FSRPAUEC";

const ICMP_TYPES: &[(&str, u8)] = &[
    ("echorep", 0),
    ("unreach", 3),
    ("squench", 4),
    ("redir", 5),
    ("echo", 8),
    ("routerad", 9),
    ("routersol", 10),
    ("timex", 11),
    ("paramprob", 12),
    ("timest", 13),
    ("timestrep", 14),
    ("inforeq", 15),
    ("inforep", 16),
    ("maskreq", 17),
    ("maskrep", 18),
];

const ICMP_CODES: &[(&str, u8)] = &[
    ("net-unr", 0),
    ("host-unr", 1),
    ("proto-unr", 2),
    ("port-unr", 3),
    ("needfrag", 4),
    ("srcfail", 5),
    ("net-unk", 6),
    ("host-unk", 7),
    ("isolate", 8),
    ("net-prohib", 9),
    ("host-prohib", 10),
    ("net-tos", 11),
    ("host-tos", 12),
    ("filter-prohib", 13),
    ("host-preced", 14),
    ("cutoff-preced", 15),
];

const IP_OPTIONS: &[(&str, u32)] = &[
    ("nop", 0x000001),
    ("rr", 0x000002),
    ("zsu", 0x000004),
    ("mtup", 0x000008),
    ("mtur", 0x000010),
    ("encode", 0x000020),
    ("ts", 0x000040),
    ("tr", 0x000080),
    ("sec", 0x000100),
    ("lsrr", 0x000200),
    ("e-sec", 0x000400),
    ("cipso", 0x000800),
    ("satid", 0x001000),
    ("ssrr", 0x002000),
    ("addext", 0x004000),
    ("visa", 0x008000),
    ("imitd", 0x010000),
    ("eip", 0x020000),
    ("finn", 0x040000),
];

const SECURITY_CLASSES: &[(&str, u8)] = &[
    ("reserv-4", 0x01),
    ("topsecret", 0x02),
    ("secret", 0x04),
    ("reserv-3", 0x08),
    ("confid", 0x10),
    ("unclass", 0x20),
    ("reserv-2", 0x40),
    ("reserv-1", 0x80),
];

fn lookup<T: Copy>(table: &[(&str, T)], name: &str) -> Option<T> {
    table.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
}

fn parse_hex(text: &str) -> Option<u32> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))?;
    u32::from_str_radix(digits, 16).ok()
}

fn parse_u8(text: &str) -> Option<u8> {
    match parse_hex(text) {
        Some(v) => u8::try_from(v).ok(),
        None => text.parse().ok(),
    }
}

/// Parses a mask: an address literal, a `0x` hex word (IPv4 only) or a bit count.
pub fn parse_mask(text: &str, family: Family) -> Result<Address> {
    let err = || FieldError::Mask(text.to_string());
    if text.contains(|c| c == '.' || c == ':') {
        let addr = Address::from(IpAddr::from_str(text).map_err(|_| err())?);
        return if addr.family() == family {
            Ok(addr)
        } else {
            Err(err())
        };
    }
    if let Some(word) = parse_hex(text) {
        return match family {
            Family::V4 => Ok(Address::V4(word)),
            Family::V6 => Err(err()),
        };
    }
    let bits: i64 = text.parse().map_err(|_| err())?;
    let bits = u32::try_from(bits).map_err(|_| err())?;
    Address::from_prefix(family, bits).ok_or_else(err)
}

/// A host literal (v4, v6 or IPv4 hex) or a name for `resolver`.
pub fn parse_host(text: &str, family: Family, resolver: &dyn Resolver) -> Result<Address> {
    if let Ok(ip) = IpAddr::from_str(text) {
        return Ok(ip.into());
    }
    if let Some(word) = parse_hex(text) {
        return Ok(Ipv4Addr::from(word).into());
    }
    resolver
        .resolve_host(text, family)
        .ok_or_else(|| FieldError::Host(text.to_string()))
}

/// Reads `[!] (any | host[/mask] | host mask M)` from `tokens`.
///
/// `family` is only a hint: literals carry their own family and names are
/// resolved in it. A bare non-zero host gets an all-ones mask, the zero
/// address gets a zero mask.
pub fn parse_host_and_mask(
    tokens: &mut Tokens,
    family: Family,
    resolver: &dyn Resolver,
) -> Result<HostMatch> {
    let mut negate = tokens.next_if("!");
    let mut text = tokens
        .next()
        .ok_or_else(|| FieldError::Host(String::new()))?;
    if let Some(rest) = text.strip_prefix('!') {
        negate = !negate;
        text = rest;
    }

    let host = if text == "any" {
        HostMatch::any(family)
    } else if let Some((host, mask)) = text.split_once('/') {
        match IpNet::from_str(text) {
            Ok(net) => {
                let addr = Address::from(net.addr());
                let mask = Address::from_prefix(addr.family(), net.prefix_len() as u32)
                    .ok_or_else(|| FieldError::Mask(mask.to_string()))?;
                HostMatch::new(addr, mask, false).ok_or_else(|| FieldError::Mask(text.to_string()))?
            }
            Err(_) => {
                let addr = parse_host(host, family, resolver)?;
                let mask = parse_mask(mask, addr.family())?;
                HostMatch::new(addr, mask, false).ok_or_else(|| FieldError::Mask(text.to_string()))?
            }
        }
    } else {
        let addr = parse_host(text, family, resolver)?;
        let mask = if tokens.next_if("mask") {
            let m = tokens
                .next()
                .ok_or_else(|| FieldError::Mask(String::new()))?;
            parse_mask(m, addr.family())?
        } else if addr.is_zero() {
            Address::zero(addr.family())
        } else {
            Address::all_ones(addr.family())
        };
        HostMatch::new(addr, mask, false).ok_or_else(|| FieldError::Mask(text.to_string()))?
    };

    Ok(if negate { host.negate() } else { host })
}

fn port_op(text: &str) -> Option<PortOp> {
    Some(match text {
        "=" | "eq" => PortOp::Eq,
        "!=" | "ne" => PortOp::Ne,
        "<" | "lt" => PortOp::Lt,
        ">" | "gt" => PortOp::Gt,
        "<=" | "le" => PortOp::Le,
        ">=" | "ge" => PortOp::Ge,
        "<>" => PortOp::OutRange,
        "><" => PortOp::ExRange,
        ":" => PortOp::InRange,
        _ => return None,
    })
}

fn port_value(text: &str, proto: Option<&str>, resolver: &dyn Resolver) -> Result<u16> {
    text.parse()
        .ok()
        .or_else(|| resolver.resolve_port(text, proto))
        .ok_or_else(|| FieldError::PortSyntax(text.to_string()))
}

/// Reads `port <op> v`, `port a <> b`, `port a >< b` or `port a:b`.
///
/// The leading `port` keyword is consumed if present. `proto` is handed to the
/// resolver for service names.
pub fn parse_ports(
    tokens: &mut Tokens,
    proto: Option<&str>,
    resolver: &dyn Resolver,
) -> Result<PortCmp> {
    tokens.next_if("port");
    let first = tokens
        .next()
        .ok_or_else(|| FieldError::PortSyntax("port".to_string()))?;

    if let Some(op) = port_op(first).filter(|op| !op.is_range()) {
        let value = tokens
            .next()
            .ok_or_else(|| FieldError::PortSyntax(first.to_string()))?;
        let port = port_value(value, proto, resolver)?;
        return PortCmp::single(op, port).ok_or_else(|| FieldError::PortSyntax(first.to_string()));
    }

    let (low, op, high) = match first.split_once(':') {
        Some((low, high)) if !low.is_empty() && !high.is_empty() => (low, PortOp::InRange, high),
        _ => {
            let op_text = tokens
                .next()
                .ok_or_else(|| FieldError::PortSyntax(first.to_string()))?;
            let op = port_op(op_text)
                .filter(|op| op.is_range())
                .ok_or_else(|| FieldError::PortSyntax(op_text.to_string()))?;
            let high = tokens
                .next()
                .ok_or_else(|| FieldError::PortSyntax(format!("{first} {op_text}")))?;
            (first, op, high)
        }
    };
    let low = port_value(low, proto, resolver)?;
    let high = port_value(high, proto, resolver)?;
    PortCmp::range(op, low, high).map_err(|e| FieldError::PortSyntax(e.to_string()))
}

fn tcp_flag_bits(text: &str) -> Result<u8> {
    if let Some(v) = parse_hex(text) {
        return u8::try_from(v).map_err(|_| FieldError::Syntax(text.to_string()));
    }
    text.bytes().try_fold(0u8, |acc, c| {
        TCP_FLAG_LETTERS
            .iter()
            .position(|l| *l == c)
            .map(|bit| acc | (1 << bit))
            .ok_or_else(|| FieldError::Syntax(text.to_string()))
    })
}

/// Parses `F[/M]` over the alphabet `FSRPAUEC`, or the hex form `0xNN[/0xNN]`.
///
/// Without an explicit mask, a lone SYN is compared over everything but ECN
/// and CWR; any other flag set is compared over everything but ECN.
pub fn parse_tcp_flags(text: &str) -> Result<(u8, u8)> {
    let (flags, mask) = match text.split_once('/') {
        Some((f, m)) => (tcp_flag_bits(f)?, Some(tcp_flag_bits(m)?)),
        None => (tcp_flag_bits(text)?, None),
    };
    let mask = mask.unwrap_or(if flags == TH_SYN {
        0xff & !(TH_ECN | TH_CWR)
    } else {
        0xff & !TH_ECN
    });
    Ok((flags, mask))
}

fn tcp_flag_letters(bits: u8) -> String {
    TCP_FLAG_LETTERS
        .iter()
        .enumerate()
        .filter(|(i, _)| bits & (1 << i) != 0)
        .map(|(_, c)| *c as char)
        .collect()
}

/// Canonical `flags` text, always with an explicit mask.
pub fn flags_to_text(flags: u8, mask: u8) -> String {
    if flags == 0 || mask == 0 {
        format!("{flags:#04x}/{mask:#04x}")
    } else {
        format!("{}/{}", tcp_flag_letters(flags), tcp_flag_letters(mask))
    }
}

pub fn parse_icmp_type(text: &str) -> Result<u8> {
    lookup(ICMP_TYPES, text)
        .or_else(|| parse_u8(text))
        .ok_or_else(|| FieldError::Syntax(text.to_string()))
}

pub fn parse_icmp_code(text: &str) -> Result<u8> {
    lookup(ICMP_CODES, text)
        .or_else(|| parse_u8(text))
        .ok_or_else(|| FieldError::Syntax(text.to_string()))
}

/// Encodes an ICMP type and optional code as `type << 8 | code` with its mask.
pub fn parse_icmp(type_text: &str, code_text: Option<&str>) -> Result<(u16, u16)> {
    let ty = (parse_icmp_type(type_text)? as u16) << 8;
    match code_text {
        Some(code) => Ok((ty | parse_icmp_code(code)? as u16, ICMP_TYPE_CODE_MASK)),
        None => Ok((ty, ICMP_TYPE_MASK)),
    }
}

/// Comma separated IP option names (or one hex word) to the option bitmap.
pub fn parse_ipopts(list: &str) -> Result<u32> {
    if let Some(v) = parse_hex(list) {
        return Ok(v);
    }
    list.split(',').try_fold(0, |acc, name| {
        lookup(IP_OPTIONS, name)
            .map(|bit| acc | bit)
            .ok_or_else(|| FieldError::Syntax(name.to_string()))
    })
}

pub fn ipopts_to_text(bits: u32) -> String {
    let known = IP_OPTIONS.iter().fold(0, |acc, (_, b)| acc | b);
    if bits & !known != 0 {
        return format!("{bits:#x}");
    }
    IP_OPTIONS
        .iter()
        .filter(|(_, b)| bits & b != 0)
        .map(|(n, _)| *n)
        .collect::<Vec<_>>()
        .join(",")
}

/// Comma separated security class names to the class bitmap.
pub fn parse_secclass(list: &str) -> Result<u8> {
    list.split(',').try_fold(0, |acc, name| {
        lookup(SECURITY_CLASSES, name)
            .map(|bit| acc | bit)
            .ok_or_else(|| FieldError::Syntax(name.to_string()))
    })
}

pub fn secclass_to_text(bits: u8) -> String {
    SECURITY_CLASSES
        .iter()
        .filter(|(_, b)| bits & b != 0)
        .map(|(n, _)| *n)
        .collect::<Vec<_>>()
        .join(",")
}

/// Protocol name or number. `tcp/udp` yields [GENERIC_PROTO].
pub fn parse_proto(text: &str, resolver: &dyn Resolver) -> Result<u8> {
    if text == "tcp/udp" || text == "tcp-udp" {
        return Ok(GENERIC_PROTO);
    }
    text.parse::<u8>()
        .ok()
        .filter(|p| *p != GENERIC_PROTO)
        .or_else(|| resolver.resolve_proto(text))
        .ok_or_else(|| FieldError::Syntax(text.to_string()))
}
