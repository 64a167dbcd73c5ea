use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    ops::{BitAnd, Not},
};

use ipfilter_common::Family;

/// An IPv4 or IPv6 address (or mask) as host-order words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    V4(u32),
    V6([u32; 4]),
}

pub trait AsNum {
    type Num: BitAnd<Output = Self::Num> + CheckedShr + Not<Output = Self::Num> + Default;
    fn max() -> Self::Num;
}

pub trait CheckedShr
where
    Self: Sized,
{
    fn checked_shr(self, rhs: u32) -> Option<Self>;
}

impl CheckedShr for u32 {
    fn checked_shr(self, rhs: u32) -> Option<Self> {
        u32::checked_shr(self, rhs)
    }
}

impl CheckedShr for u128 {
    fn checked_shr(self, rhs: u32) -> Option<Self> {
        u128::checked_shr(self, rhs)
    }
}

impl AsNum for Ipv4Addr {
    type Num = u32;

    fn max() -> Self::Num {
        u32::MAX
    }
}

impl AsNum for Ipv6Addr {
    type Num = u128;

    fn max() -> Self::Num {
        u128::MAX
    }
}

fn mask_prefix<T: AsNum>(prefix: u32) -> T::Num {
    !(T::max().checked_shr(prefix).unwrap_or_default())
}

fn words(v: u128) -> [u32; 4] {
    [
        (v >> 96) as u32,
        (v >> 64) as u32,
        (v >> 32) as u32,
        v as u32,
    ]
}

fn join(w: [u32; 4]) -> u128 {
    ((w[0] as u128) << 96) | ((w[1] as u128) << 64) | ((w[2] as u128) << 32) | w[3] as u128
}

impl Address {
    pub fn zero(family: Family) -> Self {
        match family {
            Family::V4 => Address::V4(0),
            Family::V6 => Address::V6([0; 4]),
        }
    }

    pub fn all_ones(family: Family) -> Self {
        match family {
            Family::V4 => Address::V4(u32::MAX),
            Family::V6 => Address::V6([u32::MAX; 4]),
        }
    }

    /// Mask with the top `prefix` bits set. `None` if `prefix` is wider than the family.
    pub fn from_prefix(family: Family, prefix: u32) -> Option<Self> {
        if prefix > family.bits() {
            return None;
        }
        Some(match family {
            Family::V4 => Address::V4(mask_prefix::<Ipv4Addr>(prefix)),
            Family::V6 => Address::V6(words(mask_prefix::<Ipv6Addr>(prefix))),
        })
    }

    pub fn family(&self) -> Family {
        match self {
            Address::V4(_) => Family::V4,
            Address::V6(_) => Family::V6,
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Address::V4(a) => *a == 0,
            Address::V6(a) => a.iter().all(|w| *w == 0),
        }
    }

    /// Number of leading one bits, when the mask is contiguous.
    pub fn prefix_len(&self) -> Option<u32> {
        let (ones, count) = match self {
            Address::V4(m) => (m.leading_ones(), m.count_ones()),
            Address::V6(m) => {
                let m = join(*m);
                (m.leading_ones(), m.count_ones())
            }
        };
        (ones == count).then_some(ones)
    }

    /// Bitwise and of two addresses of the same family.
    pub fn and(&self, other: &Address) -> Option<Address> {
        match (self, other) {
            (Address::V4(a), Address::V4(b)) => Some(Address::V4(a & b)),
            (Address::V6(a), Address::V6(b)) => Some(Address::V6([
                a[0] & b[0],
                a[1] & b[1],
                a[2] & b[2],
                a[3] & b[3],
            ])),
            _ => None,
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(ip) => Address::V4(u32::from(ip)),
            IpAddr::V6(ip) => Address::V6(words(u128::from(ip))),
        }
    }
}

impl From<Ipv4Addr> for Address {
    fn from(ip: Ipv4Addr) -> Self {
        Address::V4(u32::from(ip))
    }
}

impl From<Ipv6Addr> for Address {
    fn from(ip: Ipv6Addr) -> Self {
        Address::V6(words(u128::from(ip)))
    }
}

impl From<Address> for IpAddr {
    fn from(addr: Address) -> Self {
        match addr {
            Address::V4(a) => IpAddr::V4(Ipv4Addr::from(a)),
            Address::V6(a) => IpAddr::V6(Ipv6Addr::from(join(a))),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", IpAddr::from(*self))
    }
}

/// Address criterion of a rule: `(packet & mask) == addr`, optionally inverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostMatch {
    addr: Address,
    mask: Address,
    negate: bool,
}

impl HostMatch {
    /// The host is stored pre-masked, so only the bits under `mask` are kept.
    pub fn new(addr: Address, mask: Address, negate: bool) -> Option<Self> {
        Some(Self {
            addr: addr.and(&mask)?,
            mask,
            negate,
        })
    }

    pub fn any(family: Family) -> Self {
        Self {
            addr: Address::zero(family),
            mask: Address::zero(family),
            negate: false,
        }
    }

    pub fn addr(&self) -> Address {
        self.addr
    }

    pub fn mask(&self) -> Address {
        self.mask
    }

    pub fn negated(&self) -> bool {
        self.negate
    }

    pub fn family(&self) -> Family {
        self.addr.family()
    }

    pub fn is_any(&self) -> bool {
        self.mask.is_zero() && !self.negate
    }

    pub(crate) fn negate(self) -> Self {
        Self {
            negate: !self.negate,
            ..self
        }
    }

    /// A packet of another family never matches, negated or not.
    #[inline]
    pub fn matches(&self, packet: &Address) -> bool {
        match packet.and(&self.mask) {
            Some(masked) => (masked == self.addr) ^ self.negate,
            None => false,
        }
    }
}

impl fmt::Display for HostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negate {
            write!(f, "! ")?;
        }
        if self.mask.is_zero() {
            return write!(f, "any");
        }
        match self.mask.prefix_len() {
            Some(bits) if bits == self.family().bits() => write!(f, "{}", self.addr),
            Some(bits) => write!(f, "{}/{}", self.addr, bits),
            None => write!(f, "{} mask {}", self.addr, self.mask),
        }
    }
}
