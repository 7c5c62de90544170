//! Minor-unit money arithmetic.
//!
//! Amounts are integer minor units (1/100 of the major unit) end to end;
//! no binary floating point is used for comparison or summation. The
//! splitting helpers guarantee the shares always sum back to the original
//! amount, which the split calculator and drawer math rely on.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// A monetary amount in minor units.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_minor(minor: i64) -> Money {
        Money(minor)
    }

    pub const fn minor(self) -> i64 {
        self.0
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Parse a decimal string ("280", "280.5", "-3.50") into minor units.
    /// Rejects more than two fractional digits and non-numeric input.
    pub fn parse(input: &str) -> EngineResult<Money> {
        let s = input.trim();
        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (whole, frac) = match body.split_once('.') {
            Some((w, f)) => (w, f),
            None => (body, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(EngineError::validation(format!("invalid amount: {input:?}")));
        }
        if frac.len() > 2 {
            return Err(EngineError::validation(format!(
                "amount {input:?} has more than two decimal places"
            )));
        }
        if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(EngineError::validation(format!("invalid amount: {input:?}")));
        }
        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| EngineError::validation(format!("amount {input:?} out of range")))?
        };
        let frac_minor: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().unwrap_or(0) * 10,
            _ => frac.parse::<i64>().unwrap_or(0),
        };
        let minor = whole
            .checked_mul(100)
            .and_then(|v| v.checked_add(frac_minor))
            .ok_or_else(|| EngineError::validation(format!("amount {input:?} out of range")))?;
        Ok(Money(if negative { -minor } else { minor }))
    }

    /// Format as major units with exactly two decimals ("280.00", "-3.50").
    pub fn format_major(self) -> String {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        format!("{sign}{}.{:02}", abs / 100, abs % 100)
    }

    /// Split into `n` shares, remainder one minor unit at a time to the
    /// first shares. The shares always sum back to `self`.
    pub fn split_even(self, n: usize) -> Vec<Money> {
        if n == 0 {
            return Vec::new();
        }
        let n = n as i64;
        let base = self.0.div_euclid(n);
        let rem = self.0.rem_euclid(n);
        (0..n)
            .map(|i| Money(if i < rem { base + 1 } else { base }))
            .collect()
    }

    /// Half-up share for `bps` basis points (10_000 = 100%). Computed in
    /// i128 so large totals cannot overflow the intermediate product.
    pub fn percent_bps(self, bps: i64) -> Money {
        let scaled = i128::from(self.0) * i128::from(bps);
        let half = if scaled >= 0 { 5_000 } else { -5_000 };
        Money(((scaled + half) / 10_000) as i64)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format_major())
    }
}

impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Money) {
        self.0 -= rhs.0;
    }
}

impl Neg for Money {
    type Output = Money;
    fn neg(self) -> Money {
        Money(-self.0)
    }
}

impl Mul<i64> for Money {
    type Output = Money;
    fn mul(self, rhs: i64) -> Money {
        Money(self.0 * rhs)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + *m)
    }
}

impl ToSql for Money {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for Money {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(Money)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_whole_and_decimals() {
        assert_eq!(Money::parse("280").unwrap(), Money::from_minor(28000));
        assert_eq!(Money::parse("280.5").unwrap(), Money::from_minor(28050));
        assert_eq!(Money::parse("280.00").unwrap(), Money::from_minor(28000));
        assert_eq!(Money::parse(".50").unwrap(), Money::from_minor(50));
        assert_eq!(Money::parse("-3.50").unwrap(), Money::from_minor(-350));
        assert_eq!(Money::parse(" 12.34 ").unwrap(), Money::from_minor(1234));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Money::parse("280.123").is_err());
        assert!(Money::parse("abc").is_err());
        assert!(Money::parse("12,50").is_err());
        assert!(Money::parse("").is_err());
        assert!(Money::parse("-").is_err());
        assert!(Money::parse("99999999999999999999").is_err());
    }

    #[test]
    fn test_format_major() {
        assert_eq!(Money::from_minor(28000).format_major(), "280.00");
        assert_eq!(Money::from_minor(5).format_major(), "0.05");
        assert_eq!(Money::from_minor(-350).format_major(), "-3.50");
        assert_eq!(Money::ZERO.format_major(), "0.00");
        assert_eq!(Money::from_minor(75050).to_string(), "750.50");
    }

    #[test]
    fn test_split_even_remainder_to_first() {
        assert_eq!(
            Money::from_minor(30000).split_even(2),
            vec![Money::from_minor(15000), Money::from_minor(15000)]
        );
        assert_eq!(
            Money::from_minor(30100).split_even(2),
            vec![Money::from_minor(15100), Money::from_minor(15000)]
        );
        assert_eq!(
            Money::from_minor(100).split_even(3),
            vec![
                Money::from_minor(34),
                Money::from_minor(33),
                Money::from_minor(33)
            ]
        );
        assert!(Money::from_minor(100).split_even(0).is_empty());
    }

    #[test]
    fn test_split_even_sums_exactly_for_all_n() {
        let totals = [0i64, 1, 7, 99, 100, 101, 999, 5000, 30100, 123_456_789];
        for n in 1..=50usize {
            for &t in &totals {
                let total = Money::from_minor(t);
                let shares = total.split_even(n);
                assert_eq!(shares.len(), n);
                assert_eq!(shares.iter().sum::<Money>(), total, "n={n} t={t}");
                let max = shares.iter().max().unwrap().minor();
                let min = shares.iter().min().unwrap().minor();
                assert!(max - min <= 1, "shares must differ by at most one unit");
                // Larger shares come first
                for pair in shares.windows(2) {
                    assert!(pair[0] >= pair[1]);
                }
            }
        }
    }

    #[test]
    fn test_split_even_negative_total_still_sums() {
        let total = Money::from_minor(-301);
        let shares = total.split_even(2);
        assert_eq!(shares.iter().sum::<Money>(), total);
    }

    #[test]
    fn test_percent_bps_half_up() {
        assert_eq!(
            Money::from_minor(28000).percent_bps(5000),
            Money::from_minor(14000)
        );
        // 101 * 50% = 50.5, rounds up
        assert_eq!(Money::from_minor(101).percent_bps(5000), Money::from_minor(51));
        assert_eq!(Money::from_minor(100).percent_bps(3333), Money::from_minor(33));
        assert_eq!(Money::ZERO.percent_bps(10000), Money::ZERO);
    }

    #[test]
    fn test_arithmetic() {
        let a = Money::from_minor(750);
        let b = Money::from_minor(250);
        assert_eq!(a + b, Money::from_minor(1000));
        assert_eq!(a - b, Money::from_minor(500));
        assert_eq!(-a, Money::from_minor(-750));
        assert_eq!(a * 2, Money::from_minor(1500));
        let mut c = a;
        c += b;
        c -= Money::from_minor(100);
        assert_eq!(c, Money::from_minor(900));
    }
}
