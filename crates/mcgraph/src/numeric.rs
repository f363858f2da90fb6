//! Scalar helpers shared by every device and the host reference interpreter.
//!
//! The C backend emits textual equivalents of these functions into each module prelude, so
//! any change here must be mirrored in `mcgraph-backend-c`'s prelude.

use std::f64::consts::{FRAC_1_SQRT_2, PI};

use crate::ir::OpCode;

/// Relative tolerance used by `close_enough`: `42 * 2^-52`.
pub const CLOSE_ENOUGH_TOLERANCE: f64 = 42.0 * f64::EPSILON;

pub fn close_enough(x: f64, y: f64) -> bool {
    let diff = (x - y).abs();
    if x == 0.0 || y == 0.0 {
        return diff < CLOSE_ENOUGH_TOLERANCE * CLOSE_ENOUGH_TOLERANCE;
    }
    diff <= CLOSE_ENOUGH_TOLERANCE * x.abs() || diff <= CLOSE_ENOUGH_TOLERANCE * y.abs()
}

/// A filter entry selects a path when it is close to one.
#[inline]
pub fn selected(filter: f64) -> bool {
    close_enough(filter, 1.0)
}

pub fn indicator_eq(x: f64, y: f64) -> f64 {
    if close_enough(x, y) {
        1.0
    } else {
        0.0
    }
}

pub fn indicator_gt(x: f64, y: f64) -> f64 {
    if x > y && !close_enough(x, y) {
        1.0
    } else {
        0.0
    }
}

pub fn indicator_geq(x: f64, y: f64) -> f64 {
    if x > y || close_enough(x, y) {
        1.0
    } else {
        0.0
    }
}

pub fn normal_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * PI).sqrt()
}

pub fn normal_cdf(x: f64) -> f64 {
    0.5 * libm::erfc(-x * FRAC_1_SQRT_2)
}

/// Evaluates one elementwise opcode on already-resolved scalar arguments.
///
/// Returns `None` for structural opcodes, which have no pointwise meaning.
pub fn apply_elementwise(op: OpCode, args: &[f64]) -> Option<f64> {
    let value = match op {
        OpCode::None | OpCode::Add => args.iter().sum(),
        OpCode::Subtract => args[0] - args[1],
        OpCode::Negative => -args[0],
        OpCode::Mult => args[0] * args[1],
        OpCode::Div => args[0] / args[1],
        OpCode::IndicatorEq => indicator_eq(args[0], args[1]),
        OpCode::IndicatorGt => indicator_gt(args[0], args[1]),
        OpCode::IndicatorGeq => indicator_geq(args[0], args[1]),
        OpCode::Min => args[0].min(args[1]),
        OpCode::Max => args[0].max(args[1]),
        OpCode::Abs => args[0].abs(),
        OpCode::Exp => args[0].exp(),
        OpCode::Sqrt => args[0].sqrt(),
        OpCode::Log => args[0].ln(),
        OpCode::Pow => args[0].powf(args[1]),
        OpCode::NormalCdf => normal_cdf(args[0]),
        OpCode::NormalPdf => normal_pdf(args[0]),
        OpCode::ConditionalExpectation => return None,
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn close_enough_uses_absolute_band_at_zero() {
        assert!(close_enough(0.0, 1e-300));
        assert!(!close_enough(0.0, 1e-20));
        assert!(close_enough(1.0, 1.0 + 10.0 * f64::EPSILON));
        assert!(!close_enough(1.0, 1.0 + 1e-12));
    }

    #[test]
    fn indicators_respect_tolerance() {
        let nearly_one = 1.0 + 4.0 * f64::EPSILON;
        assert_eq!(indicator_eq(1.0, nearly_one), 1.0);
        assert_eq!(indicator_gt(nearly_one, 1.0), 0.0);
        assert_eq!(indicator_geq(1.0, nearly_one), 1.0);
        assert_eq!(indicator_gt(2.0, 1.0), 1.0);
        assert_eq!(indicator_geq(0.5, 1.0), 0.0);
    }

    #[test]
    fn normal_helpers_match_known_values() {
        assert_abs_diff_eq!(normal_cdf(0.0), 0.5, epsilon = 1e-15);
        assert_abs_diff_eq!(normal_cdf(1.959963984540054), 0.975, epsilon = 1e-12);
        assert_abs_diff_eq!(normal_pdf(0.0), 0.3989422804014327, epsilon = 1e-15);
    }

    #[test]
    fn none_copies_its_single_argument() {
        assert_eq!(apply_elementwise(OpCode::None, &[3.5]), Some(3.5));
        assert_eq!(apply_elementwise(OpCode::Add, &[1.0, 2.0, 3.0]), Some(6.0));
        assert_eq!(apply_elementwise(OpCode::ConditionalExpectation, &[1.0, 1.0]), None);
    }
}
