#![cfg(test)]

use crate::{PortCmp, PortCmpError, PortOp};
use test_case::test_case;

fn explicit(op: PortOp, low: u16, high: u16, port: u16) -> bool {
    match op {
        PortOp::Any => true,
        PortOp::Eq => port == low,
        PortOp::Ne => port != low,
        PortOp::Lt => port < low,
        PortOp::Gt => port > low,
        PortOp::Le => port <= low,
        PortOp::Ge => port >= low,
        PortOp::InRange => low <= port && port <= high,
        PortOp::OutRange => port < low || port > high,
        PortOp::ExRange => low < port && port < high,
    }
}

#[test_case(PortOp::Eq)]
#[test_case(PortOp::Ne)]
#[test_case(PortOp::Lt)]
#[test_case(PortOp::Gt)]
#[test_case(PortOp::Le)]
#[test_case(PortOp::Ge)]
fn single_bound_agrees_with_definition(op: PortOp) {
    for bound in [0u16, 1, 80, 1023, 65535] {
        let cmp = PortCmp::single(op, bound).unwrap();
        for port in [0u16, 1, 79, 80, 81, 1023, 1024, 65534, 65535] {
            assert_eq!(
                cmp.matches(port),
                explicit(op, bound, 0, port),
                "{op:?} {bound} on {port}"
            );
        }
    }
}

#[test_case(PortOp::InRange, 10, 20)]
#[test_case(PortOp::OutRange, 10, 20)]
#[test_case(PortOp::ExRange, 10, 20)]
#[test_case(PortOp::InRange, 80, 80)]
#[test_case(PortOp::OutRange, 0, 65535)]
#[test_case(PortOp::ExRange, 6000, 6001)]
fn range_agrees_with_definition(op: PortOp, low: u16, high: u16) {
    let cmp = PortCmp::range(op, low, high).unwrap();
    for port in [0u16, 9, 10, 11, 15, 19, 20, 21, 80, 6000, 6001, 65535] {
        assert_eq!(
            cmp.matches(port),
            explicit(op, low, high, port),
            "{op:?} {low}..{high} on {port}"
        );
    }
}

#[test]
fn any_matches_everything() {
    assert!((0..=u16::MAX).all(|p| PortCmp::ANY.matches(p)));
}

#[test]
fn range_rejects_inverted_bounds() {
    assert_eq!(
        PortCmp::range(PortOp::InRange, 20, 10),
        Err(PortCmpError::Inverted { low: 20, high: 10 })
    );
}

#[test]
fn single_rejects_range_kinds() {
    assert!(PortCmp::single(PortOp::OutRange, 1).is_none());
    assert_eq!(
        PortCmp::range(PortOp::Eq, 1, 2),
        Err(PortCmpError::NotARange(PortOp::Eq))
    );
}
