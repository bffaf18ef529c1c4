//! Money value object.

use serde::{Deserialize, Serialize};

/// Money amount represented in cents to avoid floating point issues.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Money {
    /// Amount in cents (e.g., 1000 = $10.00)
    cents: i64,
}

impl Money {
    /// Creates a new Money amount from cents.
    pub fn from_cents(cents: i64) -> Self {
        Self { cents }
    }

    /// Creates a new Money amount from a whole-unit value.
    pub fn from_dollars(dollars: i64) -> Self {
        Self {
            cents: dollars * 100,
        }
    }

    /// Creates a Money amount from a decimal value, rounding to the nearest cent.
    pub fn from_decimal(value: f64) -> Self {
        Self {
            cents: (value * 100.0).round() as i64,
        }
    }

    /// Parses a price as written by humans.
    ///
    /// Accepts plain decimals (`"1200.50"`), US grouping (`"1,200.50"`),
    /// European grouping (`"1.200,50"`) and currency decorations
    /// (`"R$ 1.200,50"`). When only one separator kind appears once and is
    /// followed by exactly three digits it is read as a grouping separator.
    pub fn parse_amount(input: &str) -> Option<Self> {
        let negative = input.trim_start().starts_with('-');
        let cleaned: String = input
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
            .collect();
        if !cleaned.chars().any(|c| c.is_ascii_digit()) {
            return None;
        }

        let last_dot = cleaned.rfind('.');
        let last_comma = cleaned.rfind(',');
        let decimal_at = match (last_dot, last_comma) {
            (Some(dot), Some(comma)) => Some(dot.max(comma)),
            (Some(pos), None) | (None, Some(pos)) => {
                let separator = cleaned.as_bytes()[pos] as char;
                let occurrences = cleaned.matches(separator).count();
                let digits_after = cleaned.len() - pos - 1;
                if occurrences > 1 || digits_after == 3 {
                    None
                } else {
                    Some(pos)
                }
            }
            (None, None) => None,
        };

        let (whole, fraction) = match decimal_at {
            Some(pos) => (&cleaned[..pos], &cleaned[pos + 1..]),
            None => (cleaned.as_str(), ""),
        };

        let whole_digits: String = whole.chars().filter(char::is_ascii_digit).collect();
        let whole_value: i64 = if whole_digits.is_empty() {
            0
        } else {
            whole_digits.parse().ok()?
        };

        let mut fraction_digits = fraction.chars().filter(char::is_ascii_digit);
        let tens = fraction_digits.next().and_then(|c| c.to_digit(10)).unwrap_or(0) as i64;
        let units = fraction_digits.next().and_then(|c| c.to_digit(10)).unwrap_or(0) as i64;
        let round_up = fraction_digits
            .next()
            .and_then(|c| c.to_digit(10))
            .is_some_and(|d| d >= 5);

        let mut cents = whole_value.checked_mul(100)?.checked_add(tens * 10 + units)?;
        if round_up {
            cents += 1;
        }
        if negative {
            cents = -cents;
        }
        Some(Self { cents })
    }

    /// Returns zero money.
    pub fn zero() -> Self {
        Self { cents: 0 }
    }

    /// Returns the amount in cents.
    pub fn cents(&self) -> i64 {
        self.cents
    }

    /// Returns the whole-unit portion.
    pub fn dollars(&self) -> i64 {
        self.cents / 100
    }

    /// Returns the cents portion (remainder after dollars).
    pub fn cents_part(&self) -> i64 {
        self.cents.abs() % 100
    }

    /// Returns the amount as a decimal value.
    pub fn as_decimal(&self) -> f64 {
        self.cents as f64 / 100.0
    }

    /// Returns true if the amount is positive.
    pub fn is_positive(&self) -> bool {
        self.cents > 0
    }

    /// Returns true if the amount is zero.
    pub fn is_zero(&self) -> bool {
        self.cents == 0
    }

    /// Returns true if the amount is negative.
    pub fn is_negative(&self) -> bool {
        self.cents < 0
    }

    /// Returns true if `other` is within `epsilon` of this amount.
    pub fn within(&self, other: Money, epsilon: Money) -> bool {
        self.cents.abs_diff(other.cents) <= epsilon.cents.unsigned_abs()
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.cents < 0 {
            write!(f, "-${}.{:02}", self.dollars().abs(), self.cents_part())
        } else {
            write!(f, "${}.{:02}", self.dollars(), self.cents_part())
        }
    }
}

impl std::ops::Add for Money {
    type Output = Money;

    fn add(self, rhs: Self) -> Self::Output {
        Money {
            cents: self.cents + rhs.cents,
        }
    }
}

impl std::ops::Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Self) -> Self::Output {
        Money {
            cents: self.cents - rhs.cents,
        }
    }
}

impl std::ops::AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.cents += rhs.cents;
    }
}

impl std::ops::SubAssign for Money {
    fn sub_assign(&mut self, rhs: Self) {
        self.cents -= rhs.cents;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_money_from_cents() {
        let money = Money::from_cents(1234);
        assert_eq!(money.cents(), 1234);
        assert_eq!(money.dollars(), 12);
        assert_eq!(money.cents_part(), 34);
    }

    #[test]
    fn test_money_from_decimal_rounds_to_cent() {
        assert_eq!(Money::from_decimal(1200.5).cents(), 120050);
        assert_eq!(Money::from_decimal(0.1 + 0.2).cents(), 30);
    }

    #[test]
    fn test_money_display() {
        assert_eq!(Money::from_cents(1234).to_string(), "$12.34");
        assert_eq!(Money::from_cents(5).to_string(), "$0.05");
        assert_eq!(Money::from_cents(-1234).to_string(), "-$12.34");
    }

    #[test]
    fn test_money_arithmetic() {
        let mut a = Money::from_cents(1000);
        let b = Money::from_cents(500);
        assert_eq!((a + b).cents(), 1500);
        assert_eq!((a - b).cents(), 500);
        a += b;
        assert_eq!(a.cents(), 1500);
        a -= b;
        assert_eq!(a.cents(), 1000);
    }

    #[test]
    fn test_parse_european_grouping() {
        assert_eq!(Money::parse_amount("1.200,50"), Some(Money::from_cents(120050)));
        assert_eq!(Money::parse_amount("R$ 1.200,50"), Some(Money::from_cents(120050)));
        assert_eq!(Money::parse_amount("12.345.678,9"), Some(Money::from_cents(1234567890)));
    }

    #[test]
    fn test_parse_us_grouping() {
        assert_eq!(Money::parse_amount("1,200.50"), Some(Money::from_cents(120050)));
        assert_eq!(Money::parse_amount("$1,200"), Some(Money::from_cents(120000)));
    }

    #[test]
    fn test_parse_single_separator() {
        assert_eq!(Money::parse_amount("1200.50"), Some(Money::from_cents(120050)));
        assert_eq!(Money::parse_amount("1200,5"), Some(Money::from_cents(120050)));
        assert_eq!(Money::parse_amount("1.200"), Some(Money::from_cents(120000)));
        assert_eq!(Money::parse_amount("99"), Some(Money::from_cents(9900)));
        assert_eq!(Money::parse_amount("10.005"), Some(Money::from_cents(1000500)));
        assert_eq!(Money::parse_amount("10.0049"), Some(Money::from_cents(1000)));
        assert_eq!(Money::parse_amount("10.0051"), Some(Money::from_cents(1001)));
    }

    #[test]
    fn test_parse_rejects_non_numeric() {
        assert_eq!(Money::parse_amount(""), None);
        assert_eq!(Money::parse_amount("free"), None);
        assert_eq!(Money::parse_amount(",."), None);
    }

    #[test]
    fn test_within_epsilon() {
        let price = Money::from_cents(120050);
        assert!(price.within(Money::from_cents(120051), Money::from_cents(1)));
        assert!(!price.within(Money::from_cents(120052), Money::from_cents(1)));
    }

    #[test]
    fn test_within_extreme_amounts() {
        let min = Money::from_cents(i64::MIN);
        let max = Money::from_cents(i64::MAX);
        assert!(!min.within(max, Money::from_cents(1)));
        assert!(!min.within(max, min));
        assert!(min.within(Money::from_cents(-1), min));
        assert!(min.within(min, Money::zero()));
    }
}
