//! Fixed-precision decimal helpers
//!
//! All amounts are `rust_decimal::Decimal`. Arithmetic on live aggregates
//! saturates instead of overflowing, and every persisted value is clamped to
//! `[min_value(), max_value()]` (the range of the `DECIMAL(42,18)` columns).

use rust_decimal::Decimal;

/// Largest integer part the persistence columns can hold
const BOUND_UNITS: i128 = 999_999_999_999_999_999_999_999;

pub fn max_value() -> Decimal {
    Decimal::from_i128_with_scale(BOUND_UNITS, 0)
}

pub fn min_value() -> Decimal {
    Decimal::from_i128_with_scale(-BOUND_UNITS, 0)
}

/// Clamp a value into the persistable range
pub fn clamp(value: Decimal) -> Decimal {
    let max = max_value();
    let min = min_value();
    if value > max {
        max
    } else if value < min {
        min
    } else {
        value
    }
}

pub fn saturating_add(a: Decimal, b: Decimal) -> Decimal {
    a.checked_add(b).unwrap_or(if b.is_sign_negative() {
        Decimal::MIN
    } else {
        Decimal::MAX
    })
}

/// Running max/min of a balance
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceRanker {
    max: Decimal,
    min: Decimal,
}

impl BalanceRanker {
    pub fn new(initial: Decimal) -> Self {
        Self {
            max: initial,
            min: initial,
        }
    }

    pub fn rank(&mut self, value: Decimal) {
        if value > self.max {
            self.max = value;
        }
        if value < self.min {
            self.min = value;
        }
    }

    pub fn max(&self) -> Decimal {
        self.max
    }

    pub fn min(&self) -> Decimal {
        self.min
    }
}

impl Default for BalanceRanker {
    fn default() -> Self {
        Self::new(Decimal::ZERO)
    }
}
