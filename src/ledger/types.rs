//! Ledger records and money

use serde::{Serialize, Serializer};
use serde_json::value::RawValue;
use std::fmt;
use std::ops::Sub;
use std::str::FromStr;

/// 1-based position of an order in the ledger
pub type OrderId = u64;

/// Check that `id` can be written as a log field
///
/// Log records are comma separated, one per line, so ids may not contain a
/// comma or a line break.
pub fn check_id(what: &str, id: &str) -> crate::error::Result<()> {
    if id.contains([',', '\r', '\n']) {
        return Err(crate::error::Error::BadRequest(format!(
            "{} {:?} contains a field or record separator",
            what, id
        )));
    }
    Ok(())
}

/// Monetary amount in minor units (cents)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(i64);

impl Money {
    /// Zero
    pub const ZERO: Money = Money(0);

    /// Amount from minor units
    pub const fn from_minor(minor: i64) -> Self {
        Money(minor)
    }

    /// Amount in minor units
    pub const fn minor(self) -> i64 {
        self.0
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

/// Decimal text that is not a non-negative amount
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid amount {0:?}")]
pub struct ParseMoneyError(String);

impl FromStr for Money {
    type Err = ParseMoneyError;

    /// Parses `123`, `123.4` or `123.456`; digits past the cents are dropped
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseMoneyError(text.to_string());
        let trimmed = text.trim();
        let (whole, frac) = trimmed.split_once('.').unwrap_or((trimmed, ""));

        let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
        if (whole.is_empty() && frac.is_empty()) || !all_digits(whole) || !all_digits(frac) {
            return Err(invalid());
        }

        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let mut cents = 0;
        for (i, digit) in frac.bytes().take(2).enumerate() {
            cents += i64::from(digit - b'0') * if i == 0 { 10 } else { 1 };
        }

        whole
            .checked_mul(100)
            .and_then(|minor| minor.checked_add(cents))
            .map(Money)
            .ok_or_else(invalid)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

/// Serialized as a bare JSON number with exactly two decimals
impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let raw = RawValue::from_string(self.to_string()).map_err(serde::ser::Error::custom)?;
        raw.serialize(serializer)
    }
}

/// A user account
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Account {
    /// Display name
    pub name: String,
    /// Never negative
    pub balance: Money,
}

/// A commodity on sale
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Item {
    /// Display name
    pub name: String,
    /// Units left in stock
    pub quantity: i64,
    /// Price of one unit
    pub unit_price: Money,
}

/// An admitted order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Order {
    /// Buyer
    pub user_id: String,
    /// What was bought
    pub commodity_id: String,
    /// Seconds since the Unix epoch
    pub timestamp: i64,
}

/// Outcome of an admission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Stock and balance were taken; the order got this id
    Accepted(OrderId),
    /// Out of stock or insufficient balance; nothing changed
    Rejected,
}

impl Admission {
    /// Whether the order went through
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted(_))
    }

    /// Order id, or -1 for a rejection
    pub fn order_id(&self) -> i64 {
        match *self {
            Admission::Accepted(id) => i64::try_from(id).unwrap_or(i64::MAX),
            Admission::Rejected => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn money(text: &str) -> i64 {
        text.parse::<Money>().unwrap().minor()
    }

    #[test]
    fn test_money_parse_is_exact() {
        assert_eq!(money("500"), 50_000);
        assert_eq!(money("12.3"), 1_230);
        assert_eq!(money("12.34"), 1_234);
        assert_eq!(money("0.29"), 29);
        // float parsing would give 28 here
        assert_eq!(money("1.15"), 115);
        assert_eq!(money("9.999"), 999);
        assert_eq!(money(".5"), 50);
        assert_eq!(money(" 7. "), 700);
    }

    #[test]
    fn test_money_parse_rejects_garbage() {
        for bad in ["", ".", "-1", "1e3", "1.2.3", "abc", "99999999999999999999"] {
            assert!(bad.parse::<Money>().is_err(), "{bad:?} parsed");
        }
    }

    #[test]
    fn test_money_display() {
        assert_eq!(Money::from_minor(1_234).to_string(), "12.34");
        assert_eq!(Money::from_minor(5).to_string(), "0.05");
        assert_eq!(Money::from_minor(20_000).to_string(), "200.00");
        assert_eq!(Money::from_minor(-150).to_string(), "-1.50");
    }

    #[test]
    fn test_money_serializes_as_number() {
        let json = serde_json::to_string(&vec![Money::from_minor(20_000), Money::ZERO]).unwrap();
        assert_eq!(json, "[200.00,0.00]");
    }

    #[test]
    fn test_admission_order_id() {
        assert_eq!(Admission::Accepted(3).order_id(), 3);
        assert_eq!(Admission::Rejected.order_id(), -1);
        assert!(!Admission::Rejected.is_accepted());
    }

    #[test]
    fn test_check_id_rejects_separators() {
        assert!(check_id("user_id", "u1").is_ok());
        assert!(check_id("user_id", "").is_ok());
        for bad in ["a,b", "a\nb", "a\r", ","] {
            assert!(matches!(check_id("user_id", bad), Err(crate::Error::BadRequest(_))), "{bad:?}");
        }
    }
}
