//! # The Cost Algebra
//!
//! Costs are scaled integers with a reserved top sentinel. Input files may
//! declare decimal costs under a fixed precision (number of fractional
//! digits); those are scaled to integers at parse time. All arithmetic
//! saturates at [`Cost::TOP`], the "forbidden" sentinel.

use std::{fmt, iter::Sum, ops};

use thiserror::Error;

/// The medium-cost multiplier. Costs that reach the current upper bound while
/// parsing are scaled up by this factor when the headroom allows it, so that
/// locally prohibitive costs stay above the bound after later projections
/// without being confused with [`Cost::TOP`].
pub const MEDIUM_MULT: i64 = 3;

/// Type representing costs of a weighted CSP. Costs are non-negative integers
/// once stored in a network, but may transiently be negative while parsing,
/// before the initial cost shift moves the table minimum into the network's
/// negative-cost shift. The memory representation of costs is `i64`.
#[derive(Hash, Eq, PartialEq, PartialOrd, Clone, Copy, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(transparent)]
pub struct Cost {
    cost: i64,
}

impl Cost {
    /// The zero cost
    pub const ZERO: Cost = Cost { cost: 0 };
    /// The smallest non-zero cost
    pub const UNIT: Cost = Cost { cost: 1 };
    /// The reserved top sentinel meaning "forbidden". A quarter of
    /// `i64::MAX`, so that any two sub-top costs sum without wrapping and a
    /// sub-top cost survives multiplication by [`MEDIUM_MULT`].
    pub const TOP: Cost = Cost {
        cost: i64::MAX >> 2,
    };

    /// Creates a new cost from a raw integer
    #[must_use]
    pub const fn new(cost: i64) -> Cost {
        Cost { cost }
    }

    /// Returns the raw integer of the cost
    #[inline]
    #[must_use]
    pub const fn raw(self) -> i64 {
        self.cost
    }

    /// Checks whether the cost is the top sentinel (or beyond)
    #[inline]
    #[must_use]
    pub const fn is_top(self) -> bool {
        self.cost >= Cost::TOP.cost
    }

    /// Checks whether the cost reaches a given (strict) upper bound
    #[inline]
    #[must_use]
    pub const fn cuts(self, ub: Cost) -> bool {
        self.cost >= ub.cost
    }

    /// Adds two costs, saturating at [`Cost::TOP`]
    #[must_use]
    pub fn saturating_add(self, rhs: Cost) -> Cost {
        if self.is_top() || rhs.is_top() {
            return Cost::TOP;
        }
        let sum = self.cost + rhs.cost;
        if sum >= Cost::TOP.cost {
            Cost::TOP
        } else {
            Cost { cost: sum }
        }
    }

    /// Subtracts a finite cost, leaving [`Cost::TOP`] untouched
    #[must_use]
    pub fn saturating_sub(self, rhs: Cost) -> Cost {
        debug_assert!(!rhs.is_top(), "cannot subtract the top sentinel");
        if self.is_top() {
            return Cost::TOP;
        }
        Cost {
            cost: self.cost - rhs.cost,
        }
    }

    /// Multiplies the cost by an integer factor
    ///
    /// # Errors
    ///
    /// [`CostError::Overflow`] if the product does not fit the representable
    /// cost range.
    pub fn checked_mul(self, factor: i64) -> Result<Cost, CostError> {
        if self.is_top() {
            return Ok(Cost::TOP);
        }
        match self.cost.checked_mul(factor) {
            Some(cost) if cost < Cost::TOP.cost && cost > -Cost::TOP.cost => Ok(Cost { cost }),
            _ => Err(CostError::Overflow(self.cost, factor as f64)),
        }
    }

    /// Applies the global cost multiplier. For the common `1.0` and `-1.0`
    /// multipliers the result is exact; other multipliers round to the
    /// nearest integer.
    ///
    /// # Errors
    ///
    /// [`CostError::Overflow`] if the product does not fit the representable
    /// cost range.
    #[allow(clippy::float_cmp)]
    pub fn apply_multiplier(self, multiplier: f64) -> Result<Cost, CostError> {
        if multiplier == 1.0 {
            return Ok(self);
        }
        if multiplier == -1.0 {
            return Ok(Cost { cost: -self.cost });
        }
        let prod = (self.cost as f64 * multiplier).round();
        if prod >= Cost::TOP.cost as f64 || prod <= -(Cost::TOP.cost as f64) {
            return Err(CostError::Overflow(self.cost, multiplier));
        }
        #[allow(clippy::cast_possible_truncation)]
        Ok(Cost { cost: prod as i64 })
    }

    /// Applies the medium-cost rule against the given upper bound: a cost
    /// that reaches `ub` is scaled by [`MEDIUM_MULT`] if it stays below
    /// `MEDIUM_MULT * ub` and `ub` leaves the headroom.
    #[must_use]
    pub fn medium_scaled(self, ub: Cost) -> Cost {
        if self.cuts(ub)
            && self.cost < MEDIUM_MULT * ub.cost
            && ub.cost < Cost::TOP.cost / MEDIUM_MULT
        {
            Cost {
                cost: self.cost * MEDIUM_MULT,
            }
        } else {
            self
        }
    }

    /// Parses a decimal string (e.g. `-12.05`) into a cost scaled by
    /// `10^precision`. A missing fractional part is padded, a fractional
    /// part shorter than the precision is scaled up.
    ///
    /// # Errors
    ///
    /// - [`CostError::InvalidDecimal`] on malformed input
    /// - [`CostError::TooPrecise`] if the fractional part has more digits
    ///   than the declared precision
    /// - [`CostError::Overflow`] if the scaled value does not fit the
    ///   representable cost range
    pub fn parse_decimal(token: &str, precision: u32) -> Result<Cost, CostError> {
        let invalid = || CostError::InvalidDecimal(String::from(token));
        let (sign, digits) = match token.strip_prefix('-') {
            Some(rest) => (-1_i64, rest),
            None => (1_i64, token.strip_prefix('+').unwrap_or(token)),
        };
        let (int_part, frac_part) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }
        let frac_digits = u32::try_from(frac_part.len()).map_err(|_| invalid())?;
        if frac_digits > precision {
            return Err(CostError::TooPrecise(String::from(token), precision));
        }
        let scale = 10_i64
            .checked_pow(precision)
            .ok_or_else(|| CostError::Overflow(0, 1.0))?;
        let int_val: i64 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| invalid())?
        };
        let frac_val: i64 = if frac_part.is_empty() {
            0
        } else {
            frac_part.parse().map_err(|_| invalid())?
        };
        let frac_scaled = frac_val * 10_i64.pow(precision - frac_digits);
        let cost = int_val
            .checked_mul(scale)
            .and_then(|c| c.checked_add(frac_scaled))
            .and_then(|c| c.checked_mul(sign))
            .ok_or_else(|| CostError::Overflow(int_val, 1.0))?;
        if cost >= Cost::TOP.cost || cost <= -Cost::TOP.cost {
            return Err(CostError::Overflow(cost, 1.0));
        }
        Ok(Cost { cost })
    }

    /// Writes the cost back as a decimal string under the given precision
    #[must_use]
    pub fn to_decimal(self, precision: u32) -> String {
        if precision == 0 {
            return format!("{}", self.cost);
        }
        let scale = 10_i64.pow(precision);
        let sign = if self.cost < 0 { "-" } else { "" };
        let abs = self.cost.unsigned_abs();
        let int_part = abs / scale.unsigned_abs();
        let frac_part = abs % scale.unsigned_abs();
        format!(
            "{sign}{int_part}.{frac_part:0width$}",
            width = precision as usize
        )
    }
}

impl ops::Add for Cost {
    type Output = Cost;

    fn add(self, rhs: Cost) -> Cost {
        self.saturating_add(rhs)
    }
}

impl ops::AddAssign for Cost {
    fn add_assign(&mut self, rhs: Cost) {
        *self = self.saturating_add(rhs);
    }
}

impl ops::Sub for Cost {
    type Output = Cost;

    fn sub(self, rhs: Cost) -> Cost {
        self.saturating_sub(rhs)
    }
}

impl ops::SubAssign for Cost {
    fn sub_assign(&mut self, rhs: Cost) {
        *self = self.saturating_sub(rhs);
    }
}

impl ops::Neg for Cost {
    type Output = Cost;

    fn neg(self) -> Cost {
        debug_assert!(!self.is_top(), "cannot negate the top sentinel");
        Cost { cost: -self.cost }
    }
}

impl Sum for Cost {
    fn sum<I: Iterator<Item = Cost>>(iter: I) -> Cost {
        iter.fold(Cost::ZERO, Cost::saturating_add)
    }
}

impl From<i64> for Cost {
    fn from(cost: i64) -> Self {
        Cost { cost }
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_top() {
            write!(f, "top")
        } else {
            write!(f, "{}", self.cost)
        }
    }
}

impl fmt::Debug for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Errors related to cost arithmetic and parsing
#[derive(Error, Debug, PartialEq)]
pub enum CostError {
    /// A string could not be parsed as a decimal cost
    #[error("'{0}' is not a valid decimal cost")]
    InvalidDecimal(String),
    /// A decimal cost has more fractional digits than the declared precision
    #[error("'{0}' has more fractional digits than the declared precision {1}")]
    TooPrecise(String, u32),
    /// A cost operation left the representable range
    #[error("cost {0} with multiplier {1} overflows the representable cost range")]
    Overflow(i64, f64),
}

#[cfg(test)]
mod tests {
    use super::{Cost, CostError, MEDIUM_MULT};

    #[test]
    fn saturation() {
        assert_eq!(Cost::TOP + Cost::UNIT, Cost::TOP);
        assert_eq!(Cost::new(5) + Cost::new(7), Cost::new(12));
        assert_eq!(Cost::TOP - Cost::new(42), Cost::TOP);
        let almost = Cost::new(Cost::TOP.raw() - 1);
        assert_eq!(almost + almost, Cost::TOP);
    }

    #[test]
    fn parse_decimal_pass() {
        assert_eq!(Cost::parse_decimal("12", 0), Ok(Cost::new(12)));
        assert_eq!(Cost::parse_decimal("12.5", 1), Ok(Cost::new(125)));
        assert_eq!(Cost::parse_decimal("12.5", 3), Ok(Cost::new(12500)));
        assert_eq!(Cost::parse_decimal("-0.25", 2), Ok(Cost::new(-25)));
        assert_eq!(Cost::parse_decimal("+3", 2), Ok(Cost::new(300)));
        assert_eq!(Cost::parse_decimal(".5", 1), Ok(Cost::new(5)));
    }

    #[test]
    fn parse_decimal_fail() {
        assert_eq!(
            Cost::parse_decimal("1.25", 1),
            Err(CostError::TooPrecise(String::from("1.25"), 1))
        );
        assert!(matches!(
            Cost::parse_decimal("abc", 0),
            Err(CostError::InvalidDecimal(_))
        ));
        assert!(matches!(
            Cost::parse_decimal("9999999999999", 6),
            Err(CostError::Overflow(..))
        ));
        assert!(matches!(
            Cost::parse_decimal("", 0),
            Err(CostError::InvalidDecimal(_))
        ));
    }

    #[test]
    fn decimal_round_trip() {
        let cost = Cost::parse_decimal("12.05", 2).unwrap();
        assert_eq!(cost.to_decimal(2), "12.05");
        let cost = Cost::parse_decimal("-3.5", 2).unwrap();
        assert_eq!(cost.to_decimal(2), "-3.50");
        assert_eq!(Cost::new(42).to_decimal(0), "42");
    }

    #[test]
    fn multiplier() {
        assert_eq!(Cost::new(5).apply_multiplier(-1.0), Ok(Cost::new(-5)));
        assert_eq!(Cost::new(5).apply_multiplier(1.0), Ok(Cost::new(5)));
        assert_eq!(Cost::new(5).apply_multiplier(2.5), Ok(Cost::new(13)));
        assert!(Cost::new(Cost::TOP.raw() - 1)
            .apply_multiplier(2.0)
            .is_err());
    }

    #[test]
    fn medium_rule() {
        let ub = Cost::new(10);
        // below the bound: untouched
        assert_eq!(Cost::new(9).medium_scaled(ub), Cost::new(9));
        // cutting the bound with headroom: scaled
        assert_eq!(Cost::new(10).medium_scaled(ub), Cost::new(30));
        assert_eq!(Cost::new(29).medium_scaled(ub), Cost::new(87));
        // already far above the bound: untouched
        assert_eq!(
            Cost::new(10 * MEDIUM_MULT).medium_scaled(ub),
            Cost::new(30)
        );
        // no headroom left: untouched
        assert_eq!(Cost::TOP.medium_scaled(Cost::TOP), Cost::TOP);
    }
}
