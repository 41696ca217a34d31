use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, TimeZone, Timelike, Utc};
use der::asn1::{GeneralizedTime, UtcTime};
use openssl::asn1::{Asn1Time, Asn1TimeRef};

/// The latest time a certificate may be valid: 9999-12-31T23:59:59Z.
pub fn max_cert_time() -> DateTime<Utc> {
    DateTime::from_timestamp(253_402_300_799, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Drops the sub-second part of a time.
pub fn truncate_to_seconds(time: DateTime<Utc>) -> DateTime<Utc> {
    time.with_nanosecond(0).unwrap_or(time)
}

/// Returns the first midnight in the given zone at or after `time`.
pub fn next_midnight(time: DateTime<Utc>, zone: &FixedOffset) -> DateTime<Utc> {
    let local = time.with_timezone(zone);
    let midnight = local.date_naive().and_time(NaiveTime::MIN);
    let midnight = match zone.from_local_datetime(&midnight).single() {
        Some(midnight) => midnight.with_timezone(&Utc),
        None => return time,
    };
    if midnight == time { midnight } else { midnight + Duration::days(1) }
}

/// Returns 23:59:59 of the day before the day of `time` in the given zone.
pub fn end_of_previous_day(time: DateTime<Utc>, zone: &FixedOffset) -> DateTime<Utc> {
    let local = time.with_timezone(zone);
    let midnight = local.date_naive().and_time(NaiveTime::MIN);
    match zone.from_local_datetime(&midnight).single() {
        Some(midnight) => midnight.with_timezone(&Utc) - Duration::seconds(1),
        None => time,
    }
}

pub fn to_asn1_time(time: DateTime<Utc>) -> Result<Asn1Time, openssl::error::ErrorStack> {
    Asn1Time::from_unix(time.timestamp())
}

pub fn from_asn1_time(time: &Asn1TimeRef) -> Result<DateTime<Utc>, openssl::error::ErrorStack> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let seconds = diff.days as i64 * 86_400 + diff.secs as i64;
    Ok(DateTime::from_timestamp(seconds, 0).unwrap_or(DateTime::<Utc>::MIN_UTC))
}

/// Converts to an X.509 time: UTCTime until 2049, GeneralizedTime after.
pub fn to_x509_time(time: DateTime<Utc>) -> Result<x509_cert::time::Time, der::Error> {
    let seconds = u64::try_from(time.timestamp()).map_err(|_| der::Error::from(der::ErrorKind::DateTime))?;
    let since_epoch = StdDuration::from_secs(seconds);

    if time < utc_time_limit() {
        Ok(x509_cert::time::Time::UtcTime(UtcTime::from_unix_duration(since_epoch)?))
    } else {
        Ok(x509_cert::time::Time::GeneralTime(GeneralizedTime::from_unix_duration(
            since_epoch,
        )?))
    }
}

/// Converts to a GeneralizedTime, as used by the invalidity date.
pub fn to_generalized_time(time: DateTime<Utc>) -> Result<GeneralizedTime, der::Error> {
    let seconds = u64::try_from(time.timestamp()).map_err(|_| der::Error::from(der::ErrorKind::DateTime))?;
    GeneralizedTime::from_unix_duration(StdDuration::from_secs(seconds))
}

fn utc_time_limit() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2050, 1, 1, 0, 0, 0).single().unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    #[test]
    fn midnight_alignment() {
        let zone = FixedOffset::east_opt(0).unwrap();
        assert_eq!(next_midnight(utc(2024, 5, 1, 10, 30, 0), &zone), utc(2024, 5, 2, 0, 0, 0));
        assert_eq!(next_midnight(utc(2024, 5, 1, 0, 0, 0), &zone), utc(2024, 5, 1, 0, 0, 0));
        assert_eq!(
            end_of_previous_day(utc(2024, 5, 2, 0, 0, 0), &zone),
            utc(2024, 5, 1, 23, 59, 59)
        );
    }

    #[test]
    fn midnight_in_other_zone() {
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        // 23:00 UTC is 01:00 of the next day at +02:00
        assert_eq!(
            next_midnight(utc(2024, 5, 1, 23, 0, 0), &plus_two),
            utc(2024, 5, 2, 22, 0, 0)
        );
    }

    #[test]
    fn asn1_time_conversion() {
        let time = utc(2030, 6, 15, 8, 0, 1);
        let asn1 = to_asn1_time(time).unwrap();
        assert_eq!(from_asn1_time(&asn1).unwrap(), time);
    }

    #[test]
    fn x509_time_kind() {
        assert!(matches!(to_x509_time(utc(2049, 12, 31, 23, 59, 59)).unwrap(), x509_cert::time::Time::UtcTime(_)));
        assert!(matches!(to_x509_time(utc(2050, 1, 1, 0, 0, 0)).unwrap(), x509_cert::time::Time::GeneralTime(_)));
        assert_eq!(max_cert_time(), utc(9999, 12, 31, 23, 59, 59));
    }
}
