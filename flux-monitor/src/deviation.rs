// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Decides whether a freshly fetched answer deviates enough from the
//! on-chain one to be worth a submission.

use bigdecimal::{BigDecimal, RoundingMode};
use num_bigint::BigInt;
use num_traits::Zero;

/// Relative (percent) and absolute thresholds, passed by value into every
/// polling decision.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DeviationThresholds {
    /// Relative deviation in percent.
    pub rel: f64,
    /// Absolute deviation in scaled integer units.
    pub abs: f64,
}

/// Returns whether `next` deviates from `cur` by at least one of the
/// thresholds.
///
/// The absolute gate runs first and must be strictly exceeded; the relative
/// check is inclusive. Both thresholds at zero means "always submit".
/// A zero `cur` with a nonzero `next` always counts as deviating, so the
/// relative check never divides by zero.
pub fn outside_deviation(
    cur: &BigDecimal,
    next: &BigDecimal,
    thresholds: DeviationThresholds,
) -> bool {
    if thresholds.rel == 0.0 && thresholds.abs == 0.0 {
        return true;
    }
    let diff = (cur - next).abs();
    // Non-finite thresholds cannot gate anything; treat them as zero.
    let abs_threshold = BigDecimal::try_from(thresholds.abs).unwrap_or_default();
    if diff <= abs_threshold {
        return false;
    }
    if cur.is_zero() {
        return !next.is_zero();
    }
    let percent = diff / cur.abs() * BigDecimal::from(100);
    let rel_threshold = BigDecimal::try_from(thresholds.rel).unwrap_or_default();
    percent >= rel_threshold
}

/// Scales a fetched decimal to an integer answer as `value * 10^precision`,
/// rounding half to even.
pub fn scale_answer(value: &BigDecimal, precision: u32) -> BigInt {
    let factor = BigDecimal::new(BigInt::from(1), -i64::from(precision));
    let (scaled, _) = (value * factor)
        .with_scale_round(0, RoundingMode::HalfEven)
        .into_bigint_and_exponent();
    scaled
}
