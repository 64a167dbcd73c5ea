#![cfg(feature = "user")]

use crate::port_cmp::{PortCmp, PortOp};
use thiserror::Error;

impl PortCmp {
    /// Builds a range comparator, enforcing `low <= high`.
    pub fn range(op: PortOp, low: u16, high: u16) -> Result<Self, PortCmpError> {
        if !op.is_range() {
            return Err(PortCmpError::NotARange(op));
        }
        if low > high {
            return Err(PortCmpError::Inverted { low, high });
        }
        Ok(Self {
            op,
            port: low,
            top: high,
        })
    }
}

#[non_exhaustive]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortCmpError {
    #[error("port range {low}..{high} has its bounds inverted")]
    Inverted { low: u16, high: u16 },
    #[error("{0:?} is not a range comparison")]
    NotARange(PortOp),
}
