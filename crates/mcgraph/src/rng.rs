//! Standard-normal variates from MT19937 through the inverse cumulative normal.
//!
//! Draws are produced in whole blocks of [`MT_BLOCK`] words, one generator twist each. The
//! variate pool relies on this so that growing the pool continues the sequence exactly where
//! the previous allocation stopped.

use rand_mt::Mt;

pub const MT_BLOCK: usize = 624;

/// MT19937 stream mapped to standard-normal variates.
#[derive(Clone)]
pub struct NormalGenerator {
    mt: Mt,
}

impl NormalGenerator {
    pub fn new(seed: u32) -> Self {
        Self { mt: Mt::new(seed) }
    }

    /// Fills `out` with the next block of standard-normal variates.
    pub fn next_normal_block(&mut self, out: &mut [f64]) {
        debug_assert_eq!(out.len(), MT_BLOCK);
        for dst in out.iter_mut() {
            *dst = inverse_cumulative_normal_u32(self.mt.next_u32());
        }
    }
}

/// Standard-normal draws for `seed`, generated block by block.
///
/// Equivalent to the contents of a variate pool of capacity `count` rounded up to a whole block.
pub fn normal_variates(seed: u32, count: usize) -> Vec<f64> {
    let blocks = count.div_ceil(MT_BLOCK);
    let mut out = vec![0.0; blocks * MT_BLOCK];
    let mut rng = NormalGenerator::new(seed);
    for chunk in out.chunks_exact_mut(MT_BLOCK) {
        rng.next_normal_block(chunk);
    }
    out.truncate(count);
    out
}

const A: [f64; 6] = [
    -3.969683028665376e+01,
    2.209460984245205e+02,
    -2.759285104469687e+02,
    1.383577518672690e+02,
    -3.066479806614716e+01,
    2.506628277459239e+00,
];
const B: [f64; 5] = [
    -5.447609879822406e+01,
    1.615858368580409e+02,
    -1.556989798598866e+02,
    6.680131188771972e+01,
    -1.328068155288572e+01,
];
const C: [f64; 6] = [
    -7.784894002430293e-03,
    -3.223964580411365e-01,
    -2.400758277161838e+00,
    -2.549732539343734e+00,
    4.374664141464968e+00,
    2.938163982698783e+00,
];
const D: [f64; 4] = [
    7.784695709041462e-03,
    3.224671290700398e-01,
    2.445134137142996e+00,
    3.754408661907416e+00,
];
const X_LOW: f64 = 0.02425;
const X_HIGH: f64 = 1.0 - X_LOW;

/// Acklam's rational approximation of the inverse standard-normal CDF on `(0, 1)`.
pub fn inverse_cumulative_normal(x: f64) -> f64 {
    if x < X_LOW || X_HIGH < x {
        let tail = |q: f64| {
            (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
                / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
        };
        if x < X_LOW {
            tail((-2.0 * x.ln()).sqrt())
        } else {
            -tail((-2.0 * (1.0 - x).ln()).sqrt())
        }
    } else {
        let z = x - 0.5;
        let r = z * z;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * z
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    }
}

/// Maps a raw 32-bit draw to the open unit interval, then through the inverse normal.
/// The two extreme words saturate to the largest finite magnitudes.
pub fn inverse_cumulative_normal_u32(word: u32) -> f64 {
    match word {
        0 => -f64::MAX,
        u32::MAX => f64::MAX,
        _ => inverse_cumulative_normal((word as f64 + 0.5) / 4_294_967_296.0),
    }
}
