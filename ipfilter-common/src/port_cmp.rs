mod test;
mod user;

#[cfg(feature = "user")]
pub use user::PortCmpError;

/// Comparison applied between a packet's port and the bound(s) of a [PortCmp].
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum PortOp {
    /// No constraint on the port.
    #[default]
    Any = 0,
    Eq = 1,
    Ne = 2,
    Lt = 3,
    Gt = 4,
    Le = 5,
    Ge = 6,
    /// `low:high`, both bounds included.
    InRange = 7,
    /// `low <> high`, anything outside the bounds.
    OutRange = 8,
    /// `low >< high`, strictly between the bounds.
    ExRange = 9,
}

impl PortOp {
    pub const fn is_range(self) -> bool {
        matches!(self, PortOp::InRange | PortOp::OutRange | PortOp::ExRange)
    }

    /// Operator as written in rule text, for the single-bound kinds.
    pub const fn symbol(self) -> &'static str {
        match self {
            PortOp::Any => "",
            PortOp::Eq => "=",
            PortOp::Ne => "!=",
            PortOp::Lt => "<",
            PortOp::Gt => ">",
            PortOp::Le => "<=",
            PortOp::Ge => ">=",
            PortOp::InRange => ":",
            PortOp::OutRange => "<>",
            PortOp::ExRange => "><",
        }
    }
}

/// Port comparator: an operator, the port and, for range kinds, the top bound.
///
/// For every range kind `port <= top` holds; single-bound kinds leave `top` at 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct PortCmp {
    op: PortOp,
    port: u16,
    top: u16,
}

impl PortCmp {
    pub const ANY: PortCmp = PortCmp {
        op: PortOp::Any,
        port: 0,
        top: 0,
    };

    /// Comparator with a single bound. Range kinds are rejected by returning `None`.
    pub const fn single(op: PortOp, port: u16) -> Option<Self> {
        if op.is_range() {
            return None;
        }
        Some(Self { op, port, top: 0 })
    }

    #[inline]
    pub const fn op(&self) -> PortOp {
        self.op
    }

    #[inline]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[inline]
    pub const fn top(&self) -> u16 {
        self.top
    }

    #[inline]
    pub const fn is_any(&self) -> bool {
        matches!(self.op, PortOp::Any)
    }

    #[inline]
    pub fn matches(&self, val: u16) -> bool {
        let (po, top) = (self.port, self.top);
        match self.op {
            PortOp::Any => true,
            PortOp::Eq => val == po,
            PortOp::Ne => val != po,
            PortOp::Lt => val < po,
            PortOp::Gt => val > po,
            PortOp::Le => val <= po,
            PortOp::Ge => val >= po,
            PortOp::InRange => po <= val && val <= top,
            PortOp::OutRange => val < po || val > top,
            PortOp::ExRange => po < val && val < top,
        }
    }
}
