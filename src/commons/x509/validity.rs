use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

//------------ ValidityUnit --------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidityUnit {
    Year,
    Day,
    Hour,
    Minute,
}

impl ValidityUnit {
    fn approx_minutes(self) -> i64 {
        match self {
            ValidityUnit::Year => 365 * 24 * 60,
            ValidityUnit::Day => 24 * 60,
            ValidityUnit::Hour => 60,
            ValidityUnit::Minute => 1,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            ValidityUnit::Year => "y",
            ValidityUnit::Day => "d",
            ValidityUnit::Hour => "h",
            ValidityUnit::Minute => "m",
        }
    }
}

//------------ CertValidity --------------------------------------------------

/// A validity period such as `5y`, `180d`, `12h` or `30m`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CertValidity {
    value: u32,
    unit: ValidityUnit,
}

impl CertValidity {
    pub fn new(value: u32, unit: ValidityUnit) -> Self {
        CertValidity { value, unit }
    }

    pub fn days(value: u32) -> Self {
        Self::new(value, ValidityUnit::Day)
    }

    pub fn years(value: u32) -> Self {
        Self::new(value, ValidityUnit::Year)
    }

    /// Adds this period to the given time.
    ///
    /// Years are calendar years. A result beyond the representable range is
    /// clamped to the maximum certificate time.
    pub fn add_to(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        let added = match self.unit {
            ValidityUnit::Year => from.checked_add_months(Months::new(self.value.saturating_mul(12))),
            _ => from.checked_add_signed(self.duration_approx()),
        };
        added.unwrap_or_else(super::max_cert_time).min(super::max_cert_time())
    }

    /// Subtracts this period from the given time.
    pub fn subtract_from(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        let subtracted = match self.unit {
            ValidityUnit::Year => from.checked_sub_months(Months::new(self.value.saturating_mul(12))),
            _ => from.checked_sub_signed(self.duration_approx()),
        };
        subtracted.unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// The length of the period, counting a year as 365 days.
    pub fn duration_approx(&self) -> Duration {
        Duration::minutes(self.value as i64 * self.unit.approx_minutes())
    }
}

impl PartialOrd for CertValidity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CertValidity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.duration_approx().cmp(&other.duration_approx())
    }
}

impl fmt::Display for CertValidity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}", self.value, self.unit.suffix())
    }
}

impl FromStr for CertValidity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit in validity '{s}'"))?;
        let (number, unit) = s.split_at(split);
        let value = u32::from_str(number).map_err(|_| format!("invalid number in validity '{s}'"))?;
        let unit = match unit {
            "y" => ValidityUnit::Year,
            "d" => ValidityUnit::Day,
            "h" => ValidityUnit::Hour,
            "m" => ValidityUnit::Minute,
            _ => return Err(format!("unknown unit '{unit}' in validity '{s}', expected y, d, h or m")),
        };
        Ok(CertValidity { value, unit })
    }
}

impl Serialize for CertValidity {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(s)
    }
}

impl<'de> Deserialize<'de> for CertValidity {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<CertValidity, D::Error> {
        let string = String::deserialize(d)?;
        CertValidity::from_str(&string).map_err(de::Error::custom)
    }
}
