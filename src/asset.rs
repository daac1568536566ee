//! Fixed-point token amounts.
//!
//! Amounts travel over RPC as `"<decimal> <SYMBOL>"` strings. Every comparison
//! and every piece of arithmetic is done on integer minor units so that
//! `"97.5321 SYS" + "0.0100 SYS"` is exactly `"97.5421 SYS"`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::{HarnessError, HarnessResult};

const MAX_PRECISION: u8 = 18;

/// Token symbol together with its fixed number of fractional digits.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Symbol {
    precision: u8,
    code: String,
}

impl Symbol {
    pub fn new(code: impl Into<String>, precision: u8) -> HarnessResult<Self> {
        let code = code.into();
        if code.is_empty() || code.len() > 7 || !code.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(HarnessError::Config(format!(
                "symbol code {code:?} must be 1-7 uppercase letters"
            )));
        }
        if precision > MAX_PRECISION {
            return Err(HarnessError::Config(format!(
                "symbol precision {precision} exceeds {MAX_PRECISION}"
            )));
        }
        Ok(Self { precision, code })
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn precision(&self) -> u8 {
        self.precision
    }

    /// Number of minor units in one whole token.
    pub fn scale(&self) -> i64 {
        10_i64.pow(u32::from(self.precision))
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.precision, self.code)
    }
}

/// A token quantity held as signed integer minor units.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Asset {
    units: i64,
    symbol: Symbol,
}

impl Asset {
    pub fn from_units(units: i64, symbol: Symbol) -> Self {
        Self { units, symbol }
    }

    pub fn zero(symbol: Symbol) -> Self {
        Self::from_units(0, symbol)
    }

    /// Whole tokens, e.g. `Asset::whole(100, sys)` is `100.0000 SYS`.
    pub fn whole(tokens: i64, symbol: Symbol) -> HarnessResult<Self> {
        let units = tokens.checked_mul(symbol.scale()).ok_or_else(|| {
            HarnessError::Config(format!("{tokens} {} overflows minor units", symbol.code))
        })?;
        Ok(Self::from_units(units, symbol))
    }

    pub fn parse(input: &str) -> HarnessResult<Self> {
        let invalid = |reason: &str| HarnessError::Config(format!("invalid asset {input:?}: {reason}"));
        let mut parts = input.split_whitespace();
        let amount = parts.next().ok_or_else(|| invalid("empty"))?;
        let code = parts.next().ok_or_else(|| invalid("missing symbol"))?;
        if parts.next().is_some() {
            return Err(invalid("trailing data"));
        }

        let (negative, digits) = match amount.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, amount),
        };
        let (whole, fraction) = match digits.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (digits, ""),
        };
        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("malformed integer part"));
        }
        if digits.contains('.') && fraction.is_empty() {
            return Err(invalid("empty fractional part"));
        }
        if !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("malformed fractional part"));
        }
        let precision = u8::try_from(fraction.len()).map_err(|_| invalid("too many digits"))?;
        let symbol = Symbol::new(code, precision)?;

        let whole: i64 = whole.parse().map_err(|_| invalid("integer part overflows"))?;
        let fraction: i64 = if fraction.is_empty() {
            0
        } else {
            fraction.parse().map_err(|_| invalid("fraction overflows"))?
        };
        let magnitude = whole
            .checked_mul(symbol.scale())
            .and_then(|value| value.checked_add(fraction))
            .ok_or_else(|| invalid("amount overflows"))?;
        let units = if negative { -magnitude } else { magnitude };
        Ok(Self { units, symbol })
    }

    pub fn units(&self) -> i64 {
        self.units
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn is_negative(&self) -> bool {
        self.units < 0
    }

    pub fn checked_add(&self, other: &Asset) -> HarnessResult<Asset> {
        self.ensure_same_symbol(other)?;
        let units = self.units.checked_add(other.units).ok_or_else(|| {
            HarnessError::Config(format!("{self} + {other} overflows"))
        })?;
        Ok(Self::from_units(units, self.symbol.clone()))
    }

    pub fn checked_sub(&self, other: &Asset) -> HarnessResult<Asset> {
        self.ensure_same_symbol(other)?;
        let units = self.units.checked_sub(other.units).ok_or_else(|| {
            HarnessError::Config(format!("{self} - {other} overflows"))
        })?;
        Ok(Self::from_units(units, self.symbol.clone()))
    }

    fn ensure_same_symbol(&self, other: &Asset) -> HarnessResult<()> {
        if self.symbol != other.symbol {
            return Err(HarnessError::Config(format!(
                "symbol mismatch: {} vs {}",
                self.symbol, other.symbol
            )));
        }
        Ok(())
    }
}

impl PartialOrd for Asset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.symbol == other.symbol {
            Some(self.units.cmp(&other.units))
        } else {
            None
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.units < 0 { "-" } else { "" };
        let magnitude = self.units.unsigned_abs();
        let scale = self.symbol.scale().unsigned_abs();
        let whole = magnitude / scale;
        if self.symbol.precision == 0 {
            write!(f, "{sign}{whole} {}", self.symbol.code)
        } else {
            let fraction = magnitude % scale;
            write!(
                f,
                "{sign}{whole}.{fraction:0width$} {}",
                self.symbol.code,
                width = usize::from(self.symbol.precision)
            )
        }
    }
}

impl FromStr for Asset {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Asset::parse(s)
    }
}

impl Serialize for Asset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Asset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Asset::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sys() -> Symbol {
        Symbol::new("SYS", 4).expect("symbol")
    }

    #[test]
    fn parses_into_minor_units() {
        let asset = Asset::parse("97.5311 SYS").expect("asset");
        assert_eq!(asset.units(), 975_311);
        assert_eq!(asset.symbol(), &sys());
    }

    #[test]
    fn formatting_keeps_fixed_precision() {
        assert_eq!(Asset::from_units(5_000, sys()).to_string(), "0.5000 SYS");
        assert_eq!(Asset::from_units(-100, sys()).to_string(), "-0.0100 SYS");
        assert_eq!(Asset::whole(1_000, sys()).expect("whole").to_string(), "1000.0000 SYS");
    }

    #[test]
    fn integer_arithmetic_has_no_drift() {
        let first = Asset::parse("97.5321 SYS").expect("first");
        let second = Asset::parse("0.0100 SYS").expect("second");
        let total = first.checked_add(&second).expect("sum");
        assert_eq!(total.to_string(), "97.5421 SYS");

        let deposit = Asset::from_units(5_000, sys());
        let received = Asset::parse("97.5311 SYS").expect("received");
        assert_eq!(
            deposit.checked_add(&received).expect("sum").to_string(),
            "98.0311 SYS"
        );
    }

    #[test]
    fn mismatched_symbols_are_rejected() {
        let a = Asset::parse("1.0000 SYS").expect("a");
        let b = Asset::parse("1.00 SYS").expect("b");
        assert!(a.checked_add(&b).is_err());
        assert!(a.partial_cmp(&b).is_none());
    }

    #[test]
    fn malformed_amounts_fail() {
        for input in ["", "1.0000", "abc SYS", "1. SYS", "1.0000 sys", "1.0000 SYS extra"] {
            assert!(Asset::parse(input).is_err(), "{input:?} should be rejected");
        }
    }
}
