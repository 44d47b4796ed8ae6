//! Monetary types for the router core.
//!
//! All amounts on the auction path are integer micros of a single currency.
//! `rust_decimal` appears only at the edges: parsing configuration strings
//! like `"100000USD/1M"` and rendering amounts for humans. Nothing in this
//! module (or anywhere downstream of it) does monetary math in `f64`.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when parsing monetary strings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyParseError {
    #[error("empty money string")]
    Empty,

    #[error("no currency code in {0:?}")]
    MissingCurrency(String),

    #[error("unknown currency code {0:?}")]
    UnknownCurrency(String),

    #[error("invalid amount {0:?}")]
    InvalidAmount(String),

    #[error("amount {0:?} does not fit in micros")]
    Overflow(String),

    #[error("unknown rate period {0:?}")]
    UnknownPeriod(String),
}

/// ISO-4217 currency codes the router understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CurrencyCode {
    Usd,
    Eur,
    Gbp,
    Cad,
    Aud,
    Jpy,
}

impl CurrencyCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CurrencyCode::Usd => "USD",
            CurrencyCode::Eur => "EUR",
            CurrencyCode::Gbp => "GBP",
            CurrencyCode::Cad => "CAD",
            CurrencyCode::Aud => "AUD",
            CurrencyCode::Jpy => "JPY",
        }
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CurrencyCode {
    type Err = MoneyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "USD" => Ok(CurrencyCode::Usd),
            "EUR" => Ok(CurrencyCode::Eur),
            "GBP" => Ok(CurrencyCode::Gbp),
            "CAD" => Ok(CurrencyCode::Cad),
            "AUD" => Ok(CurrencyCode::Aud),
            "JPY" => Ok(CurrencyCode::Jpy),
            _ => Err(MoneyParseError::UnknownCurrency(s.to_string())),
        }
    }
}

/// An amount in millionths of a currency unit.
///
/// Signed so that releases and corrections can be expressed, but the budget
/// pool invariants keep observable balances non-negative.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Micros(pub i64);

impl Micros {
    pub const ZERO: Micros = Micros(0);

    /// One whole currency unit.
    pub const UNIT: Micros = Micros(1_000_000);

    /// Build from whole currency units.
    pub fn from_units(units: i64) -> Self {
        Micros(units * 1_000_000)
    }

    /// Convert a decimal amount of whole units to micros, rejecting values
    /// that lose precision past the sixth decimal place.
    pub fn from_decimal(amount: Decimal) -> Option<Self> {
        let scaled = amount.checked_mul(Decimal::from(1_000_000))?;
        if scaled.fract() != Decimal::ZERO {
            return None;
        }
        scaled.to_i64().map(Micros)
    }

    /// Render as a decimal number of whole units.
    pub fn to_decimal(self) -> Decimal {
        Decimal::new(self.0, 6).normalize()
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, rhs: Micros) -> Micros {
        Micros(self.0.saturating_sub(rhs.0))
    }

    pub fn min(self, rhs: Micros) -> Micros {
        Micros(self.0.min(rhs.0))
    }
}

impl Add for Micros {
    type Output = Micros;
    fn add(self, rhs: Micros) -> Micros {
        Micros(self.0 + rhs.0)
    }
}

impl AddAssign for Micros {
    fn add_assign(&mut self, rhs: Micros) {
        self.0 += rhs.0;
    }
}

impl Sub for Micros {
    type Output = Micros;
    fn sub(self, rhs: Micros) -> Micros {
        Micros(self.0 - rhs.0)
    }
}

impl SubAssign for Micros {
    fn sub_assign(&mut self, rhs: Micros) {
        self.0 -= rhs.0;
    }
}

impl Neg for Micros {
    type Output = Micros;
    fn neg(self) -> Micros {
        Micros(-self.0)
    }
}

impl Sum for Micros {
    fn sum<I: Iterator<Item = Micros>>(iter: I) -> Micros {
        Micros(iter.map(|m| m.0).sum())
    }
}

impl fmt::Display for Micros {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal())
    }
}

/// A currency-qualified amount, e.g. `2USD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Amount {
    pub value: Micros,
    pub currency: CurrencyCode,
}

impl Amount {
    pub fn new(value: Micros, currency: CurrencyCode) -> Self {
        Self { value, currency }
    }

    pub fn zero(currency: CurrencyCode) -> Self {
        Self {
            value: Micros::ZERO,
            currency,
        }
    }

    /// Add amounts of the same currency; `None` on a currency mismatch.
    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        if self.currency != rhs.currency {
            return None;
        }
        Some(Amount::new(self.value + rhs.value, self.currency))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value.to_decimal(), self.currency)
    }
}

impl FromStr for Amount {
    type Err = MoneyParseError;

    /// Parse `"<decimal><CURRENCY>"`, e.g. `"100000USD"` or `"0.25EUR"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(MoneyParseError::Empty);
        }
        let split = s
            .find(|c: char| c.is_ascii_alphabetic())
            .ok_or_else(|| MoneyParseError::MissingCurrency(s.to_string()))?;
        let (num, code) = s.split_at(split);
        let currency = code.parse::<CurrencyCode>()?;
        let amount = Decimal::from_str(num)
            .map_err(|_| MoneyParseError::InvalidAmount(num.to_string()))?;
        let value =
            Micros::from_decimal(amount).ok_or_else(|| MoneyParseError::Overflow(s.to_string()))?;
        Ok(Amount::new(value, currency))
    }
}

/// The denominator of a [`MoneyRate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RatePeriod {
    /// Per second of wall-clock time.
    Second,
    /// Per minute of wall-clock time.
    Minute,
    /// Per hour of wall-clock time.
    Hour,
    /// Per one million bid requests.
    MillionRequests,
}

impl RatePeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RatePeriod::Second => "1s",
            RatePeriod::Minute => "1m",
            RatePeriod::Hour => "1h",
            RatePeriod::MillionRequests => "1M",
        }
    }

    /// Length in seconds for time-based periods.
    pub fn seconds(&self) -> Option<u64> {
        match self {
            RatePeriod::Second => Some(1),
            RatePeriod::Minute => Some(60),
            RatePeriod::Hour => Some(3600),
            RatePeriod::MillionRequests => None,
        }
    }
}

impl fmt::Display for RatePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RatePeriod {
    type Err = MoneyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Case matters: "1m" is a minute, "1M" is a million requests.
        match s.trim() {
            "1s" => Ok(RatePeriod::Second),
            "1m" => Ok(RatePeriod::Minute),
            "1h" => Ok(RatePeriod::Hour),
            "1M" => Ok(RatePeriod::MillionRequests),
            other => Err(MoneyParseError::UnknownPeriod(other.to_string())),
        }
    }
}

/// A spend rate such as `"100000USD/1M"` (100 000 USD per million requests)
/// or `"10USD/1s"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MoneyRate {
    pub amount: Amount,
    pub period: RatePeriod,
}

impl MoneyRate {
    pub fn new(amount: Amount, period: RatePeriod) -> Self {
        Self { amount, period }
    }

    /// The rate normalized to micros per second, for time-based periods.
    pub fn micros_per_second(&self) -> Option<Micros> {
        let secs = self.period.seconds()? as i64;
        Some(Micros(self.amount.value.0 / secs))
    }
}

impl fmt::Display for MoneyRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.amount, self.period)
    }
}

impl FromStr for MoneyRate {
    type Err = MoneyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (amount, period) = s
            .split_once('/')
            .ok_or_else(|| MoneyParseError::UnknownPeriod(s.to_string()))?;
        Ok(MoneyRate {
            amount: amount.parse()?,
            period: period.parse()?,
        })
    }
}

impl TryFrom<String> for MoneyRate {
    type Error = MoneyParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MoneyRate> for String {
    fn from(rate: MoneyRate) -> String {
        rate.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_micros_from_units() {
        assert_eq!(Micros::from_units(2), Micros(2_000_000));
        assert_eq!(Micros::from_units(0), Micros::ZERO);
    }

    #[test]
    fn test_micros_from_decimal() {
        assert_eq!(Micros::from_decimal(dec!(1.5)), Some(Micros(1_500_000)));
        assert_eq!(Micros::from_decimal(dec!(0.000001)), Some(Micros(1)));
        // Sub-micro precision is rejected, not rounded.
        assert_eq!(Micros::from_decimal(dec!(0.0000001)), None);
    }

    #[test]
    fn test_micros_display() {
        assert_eq!(Micros(2_500_000).to_string(), "2.5");
        assert_eq!(Micros(1).to_string(), "0.000001");
    }

    #[test]
    fn test_micros_arithmetic() {
        let mut m = Micros::from_units(3);
        m += Micros::from_units(2);
        assert_eq!(m, Micros::from_units(5));
        m -= Micros::from_units(1);
        assert_eq!(m, Micros::from_units(4));
        assert_eq!(-m, Micros::from_units(-4));
        assert_eq!(Micros(3).saturating_sub(Micros(i64::MIN)), Micros(i64::MAX));
    }

    #[test]
    fn test_amount_parse() {
        let a: Amount = "100000USD".parse().unwrap();
        assert_eq!(a.currency, CurrencyCode::Usd);
        assert_eq!(a.value, Micros::from_units(100_000));

        let b: Amount = "0.25EUR".parse().unwrap();
        assert_eq!(b.value, Micros(250_000));
    }

    #[test]
    fn test_amount_parse_errors() {
        assert_eq!("".parse::<Amount>(), Err(MoneyParseError::Empty));
        assert!(matches!(
            "100".parse::<Amount>(),
            Err(MoneyParseError::MissingCurrency(_))
        ));
        assert!(matches!(
            "100XYZ".parse::<Amount>(),
            Err(MoneyParseError::UnknownCurrency(_))
        ));
        assert!(matches!(
            "1.2.3USD".parse::<Amount>(),
            Err(MoneyParseError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_amount_checked_add() {
        let a: Amount = "1USD".parse().unwrap();
        let b: Amount = "2USD".parse().unwrap();
        let c: Amount = "2EUR".parse().unwrap();
        assert_eq!(a.checked_add(b).unwrap().value, Micros::from_units(3));
        assert!(a.checked_add(c).is_none());
    }

    #[test]
    fn test_amount_display_roundtrip() {
        for s in ["2USD", "0.25EUR", "100000USD"] {
            let a: Amount = s.parse().unwrap();
            assert_eq!(a.to_string(), s);
        }
    }

    #[test]
    fn test_money_rate_parse() {
        let r: MoneyRate = "100000USD/1M".parse().unwrap();
        assert_eq!(r.amount.value, Micros::from_units(100_000));
        assert_eq!(r.period, RatePeriod::MillionRequests);
        assert_eq!(r.micros_per_second(), None);

        let r: MoneyRate = "60USD/1m".parse().unwrap();
        assert_eq!(r.period, RatePeriod::Minute);
        assert_eq!(r.micros_per_second(), Some(Micros::from_units(1)));
    }

    #[test]
    fn test_money_rate_display_roundtrip() {
        for s in ["100000USD/1M", "10USD/1s", "60EUR/1m"] {
            let r: MoneyRate = s.parse().unwrap();
            assert_eq!(r.to_string(), s);
        }
    }

    #[test]
    fn test_money_rate_serde() {
        let r: MoneyRate = "100000USD/1M".parse().unwrap();
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, "\"100000USD/1M\"");
        let back: MoneyRate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
