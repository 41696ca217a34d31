use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use super::CertRevocationInfo;
use crate::commons::x509::SerialNumber;

//------------ CrlUpdateMode -------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CrlUpdateMode {
    /// CRLs are generated by the scheduler at interval boundaries.
    Interval,
    /// CRLs are only generated when asked for.
    OnDemand,
}

//------------ InvalidityDateMode --------------------------------------------

/// How the invalidity date of revoked certificates ends up on the CRL.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidityDateMode {
    Forbidden,
    Optional,
    Required,
}

//------------ HourMinute ----------------------------------------------------

/// A time of day in UTC, written as `HH:MM`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HourMinute {
    hour: u8,
    minute: u8,
}

impl HourMinute {
    pub fn new(hour: u8, minute: u8) -> Result<Self, String> {
        if hour > 23 || minute > 59 {
            return Err(format!("invalid time of day {hour:02}:{minute:02}"));
        }
        Ok(HourMinute { hour, minute })
    }

    pub fn hour(self) -> u8 {
        self.hour
    }

    pub fn minute(self) -> u8 {
        self.minute
    }

    pub fn minute_of_day(self) -> i64 {
        self.hour as i64 * 60 + self.minute as i64
    }
}

impl fmt::Display for HourMinute {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for HourMinute {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hour, minute) = s.split_once(':').ok_or_else(|| format!("expected HH:MM, found '{s}'"))?;
        let hour = u8::from_str(hour.trim()).map_err(|_| format!("invalid hour in '{s}'"))?;
        let minute = u8::from_str(minute.trim()).map_err(|_| format!("invalid minute in '{s}'"))?;
        HourMinute::new(hour, minute)
    }
}

impl Serialize for HourMinute {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(s)
    }
}

impl<'de> Deserialize<'de> for HourMinute {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<HourMinute, D::Error> {
        let string = String::deserialize(d)?;
        HourMinute::from_str(&string).map_err(de::Error::custom)
    }
}

//------------ CrlControl ----------------------------------------------------

/// The CRL policy of a CA.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CrlControl {
    #[serde(default = "CrlControl::default_update_mode")]
    pub update_mode: CrlUpdateMode,

    /// Length of an interval in minutes.
    #[serde(default)]
    pub interval_minutes: Option<u32>,

    /// Alternatively, one interval per day at this time.
    #[serde(default)]
    pub interval_day_time: Option<HourMinute>,

    /// A full CRL is generated every this many intervals.
    #[serde(default = "CrlControl::default_full_crl_intervals")]
    pub full_crl_intervals: u32,

    /// A delta CRL is generated every this many intervals, 0 for none.
    #[serde(default)]
    pub delta_crl_intervals: u32,

    #[serde(default = "CrlControl::default_overlap_minutes")]
    pub overlap_minutes: u32,

    /// Let the nextUpdate of full CRLs point at the next full CRL.
    #[serde(default)]
    pub extended_next_update: bool,

    #[serde(default)]
    pub include_expired_certs: bool,

    #[serde(default)]
    pub only_ca_certs: bool,

    #[serde(default)]
    pub only_user_certs: bool,

    /// Replace every reason other than removeFromCRL with unspecified.
    #[serde(default)]
    pub exclude_reason: bool,

    #[serde(default = "CrlControl::default_invalidity_date")]
    pub invalidity_date: InvalidityDateMode,

    /// Add the certificate set extension to full CRLs.
    #[serde(default)]
    pub include_certset: bool,

    #[serde(default)]
    pub certset_include_cert: bool,

    #[serde(default)]
    pub certset_include_profile: bool,
}

impl CrlControl {
    fn default_update_mode() -> CrlUpdateMode {
        CrlUpdateMode::Interval
    }

    fn default_full_crl_intervals() -> u32 {
        1
    }

    fn default_overlap_minutes() -> u32 {
        10
    }

    fn default_invalidity_date() -> InvalidityDateMode {
        InvalidityDateMode::Optional
    }

    /// A control generating a full CRL every `minutes` minutes.
    pub fn interval(minutes: u32) -> Self {
        CrlControl {
            update_mode: CrlUpdateMode::Interval,
            interval_minutes: Some(minutes),
            interval_day_time: None,
            full_crl_intervals: 1,
            delta_crl_intervals: 0,
            overlap_minutes: Self::default_overlap_minutes(),
            extended_next_update: false,
            include_expired_certs: false,
            only_ca_certs: false,
            only_user_certs: false,
            exclude_reason: false,
            invalidity_date: InvalidityDateMode::Optional,
            include_certset: false,
            certset_include_cert: false,
            certset_include_profile: false,
        }
    }

    pub fn on_demand() -> Self {
        CrlControl {
            update_mode: CrlUpdateMode::OnDemand,
            interval_minutes: None,
            ..Self::interval(0)
        }
    }

    pub fn is_interval(&self) -> bool {
        self.update_mode == CrlUpdateMode::Interval
    }

    /// Whether revocations must be remembered for the next delta CRL.
    pub fn uses_delta_crls(&self) -> bool {
        self.is_interval() && self.delta_crl_intervals > 0 && self.delta_crl_intervals < self.full_crl_intervals
    }

    pub fn verify(&self) -> Result<(), String> {
        if self.only_ca_certs && self.only_user_certs {
            return Err("only_ca_certs and only_user_certs cannot both be set".to_string());
        }
        if !self.is_interval() {
            return Ok(());
        }
        if self.full_crl_intervals < 1 {
            return Err("full_crl_intervals must be at least 1".to_string());
        }
        if self.delta_crl_intervals != 0 && self.delta_crl_intervals >= self.full_crl_intervals {
            return Err("delta_crl_intervals must be 0 or less than full_crl_intervals".to_string());
        }
        match (self.interval_minutes, self.interval_day_time) {
            (Some(minutes), None) => {
                if minutes < 60 {
                    return Err(format!("interval_minutes must be at least 60, found {minutes}"));
                }
                Ok(())
            }
            (None, Some(_)) => Ok(()),
            _ => Err("exactly one of interval_minutes and interval_day_time must be set".to_string()),
        }
    }
}

//------------ CrlInfo -------------------------------------------------------

/// A stored CRL.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CrlInfo {
    pub crl_number: u64,
    /// The number of the full CRL a delta CRL is based on.
    pub base_crl_number: Option<u64>,
    pub this_update: DateTime<Utc>,
    pub next_update: Option<DateTime<Utc>>,
    pub der: Vec<u8>,
}

impl CrlInfo {
    pub fn is_delta(&self) -> bool {
        self.base_crl_number.is_some()
    }
}

//------------ RevokedCertEntry ----------------------------------------------

/// A revoked certificate as read for CRL generation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RevokedCertEntry {
    /// Opaque, increasing id used for paging.
    pub id: u64,
    pub serial: SerialNumber,
    pub revocation: CertRevocationInfo,
}

//------------ CertsetEntry --------------------------------------------------

/// A non-expired certificate as listed in the certificate set extension.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CertsetEntry {
    pub id: u64,
    pub serial: SerialNumber,
    pub der: Vec<u8>,
    pub profile: String,
}
