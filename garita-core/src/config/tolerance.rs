//! Grace periods written as `"amount/unit"`, e.g. `"30/minute"` or `"1/h"`.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToleranceError {
    #[error("tolerance must look like \"amount/unit\", got {0:?}")]
    Malformed(String),
    #[error("invalid tolerance amount {0:?}")]
    InvalidAmount(String),
    #[error("unknown tolerance unit {0:?}")]
    UnknownUnit(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToleranceUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    /// Thirty days.
    Month,
    /// 365 days.
    Year,
}

impl ToleranceUnit {
    fn parse(unit: &str) -> Option<Self> {
        // `M` is a month and `m` a minute, so only the long forms are
        // matched case-insensitively.
        let unit = unit.trim();
        match unit {
            "ms" => return Some(Self::Millisecond),
            "s" => return Some(Self::Second),
            "m" => return Some(Self::Minute),
            "h" => return Some(Self::Hour),
            "d" => return Some(Self::Day),
            "w" => return Some(Self::Week),
            "M" => return Some(Self::Month),
            "y" => return Some(Self::Year),
            _ => {}
        }
        let lower = unit.to_ascii_lowercase();
        let singular = lower.strip_suffix('s').unwrap_or(&lower);
        match singular {
            "millisecond" => Some(Self::Millisecond),
            "second" => Some(Self::Second),
            "minute" => Some(Self::Minute),
            "hour" => Some(Self::Hour),
            "day" => Some(Self::Day),
            "week" => Some(Self::Week),
            "month" => Some(Self::Month),
            "year" => Some(Self::Year),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Millisecond => "millisecond",
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }

    fn duration(self, amount: i64) -> time::Duration {
        match self {
            Self::Millisecond => time::Duration::milliseconds(amount),
            Self::Second => time::Duration::seconds(amount),
            Self::Minute => time::Duration::minutes(amount),
            Self::Hour => time::Duration::hours(amount),
            Self::Day => time::Duration::days(amount),
            Self::Week => time::Duration::weeks(amount),
            Self::Month => time::Duration::days(amount.saturating_mul(30)),
            Self::Year => time::Duration::days(amount.saturating_mul(365)),
        }
    }
}

/// A configured grace period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tolerance {
    pub amount: u32,
    pub unit: ToleranceUnit,
}

impl Tolerance {
    pub const fn new(amount: u32, unit: ToleranceUnit) -> Self {
        Self { amount, unit }
    }

    pub fn duration(&self) -> time::Duration {
        self.unit.duration(i64::from(self.amount))
    }
}

impl FromStr for Tolerance {
    type Err = ToleranceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (amount, unit) = s
            .split_once('/')
            .ok_or_else(|| ToleranceError::Malformed(s.to_string()))?;
        let amount: u32 = amount
            .trim()
            .parse()
            .map_err(|_| ToleranceError::InvalidAmount(amount.to_string()))?;
        let unit =
            ToleranceUnit::parse(unit).ok_or_else(|| ToleranceError::UnknownUnit(unit.to_string()))?;
        Ok(Self { amount, unit })
    }
}

impl TryFrom<String> for Tolerance {
    type Error = ToleranceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Tolerance> for String {
    fn from(value: Tolerance) -> String {
        value.to_string()
    }
}

impl fmt::Display for Tolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.amount, self.unit.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_and_short_units() {
        let t: Tolerance = "30/minute".parse().unwrap();
        assert_eq!(t.duration(), time::Duration::minutes(30));
        let t: Tolerance = "1/hours".parse().unwrap();
        assert_eq!(t.duration(), time::Duration::hours(1));
        let t: Tolerance = "1/m".parse().unwrap();
        assert_eq!(t.duration(), time::Duration::minutes(1));
        let t: Tolerance = "2/M".parse().unwrap();
        assert_eq!(t.duration(), time::Duration::days(60));
        let t: Tolerance = " 15 / Second ".parse().unwrap();
        assert_eq!(t.duration(), time::Duration::seconds(15));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(matches!(
            "30 minutes".parse::<Tolerance>(),
            Err(ToleranceError::Malformed(_))
        ));
        assert!(matches!(
            "-1/hour".parse::<Tolerance>(),
            Err(ToleranceError::InvalidAmount(_))
        ));
        assert!(matches!(
            "1/fortnight".parse::<Tolerance>(),
            Err(ToleranceError::UnknownUnit(_))
        ));
    }

    #[test]
    fn test_display_is_canonical() {
        let t: Tolerance = "30/m".parse().unwrap();
        assert_eq!(t.to_string(), "30/minute");
    }
}
