use crate::error::PaymentError;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A strictly positive monetary amount in minor currency units (cents, kobo, ...).
///
/// Amounts never travel through the core as floating point. Provider wire formats
/// that expect major units go through [`Amount::to_major`] / [`Amount::from_major`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct Amount(u64);

impl Amount {
    pub fn new(minor_units: u64) -> Result<Self, PaymentError> {
        if minor_units > 0 {
            Ok(Self(minor_units))
        } else {
            Err(PaymentError::Validation(
                "Amount must be positive".to_string(),
            ))
        }
    }

    pub fn minor_units(&self) -> u64 {
        self.0
    }

    /// Renders the amount in major units using the currency exponent.
    pub fn to_major(&self, currency: &Currency) -> Decimal {
        Decimal::from_i128_with_scale(i128::from(self.0), currency.exponent())
    }

    /// Parses a major-unit decimal, rejecting values with sub-minor precision.
    pub fn from_major(value: Decimal, currency: &Currency) -> Result<Self, PaymentError> {
        let scaled = value
            .checked_mul(Decimal::from(10u64.pow(currency.exponent())))
            .ok_or_else(|| PaymentError::Validation(format!("Amount {value} is out of range")))?;
        if !scaled.fract().is_zero() {
            return Err(PaymentError::Validation(format!(
                "Amount {value} has more precision than {currency} allows"
            )));
        }
        let minor = scaled.to_u64().ok_or_else(|| {
            PaymentError::Validation(format!("Amount {value} is out of range"))
        })?;
        Self::new(minor)
    }
}

impl TryFrom<u64> for Amount {
    type Error = PaymentError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for u64 {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ISO-4217 alphabetic currency code, stored upper-case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    pub fn new(code: &str) -> Result<Self, PaymentError> {
        let code = code.trim();
        if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
            Ok(Self(code.to_ascii_uppercase()))
        } else {
            Err(PaymentError::Validation(format!(
                "Invalid currency code: {code:?}"
            )))
        }
    }

    pub fn code(&self) -> &str {
        &self.0
    }

    /// Number of minor-unit digits.
    pub fn exponent(&self) -> u32 {
        match self.0.as_str() {
            "BIF" | "CLP" | "DJF" | "GNF" | "ISK" | "JPY" | "KMF" | "KRW" | "PYG" | "RWF"
            | "UGX" | "VND" | "VUV" | "XAF" | "XOF" | "XPF" => 0,
            "BHD" | "IQD" | "JOD" | "KWD" | "LYD" | "OMR" | "TND" => 3,
            _ => 2,
        }
    }
}

impl TryFrom<String> for Currency {
    type Error = PaymentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
