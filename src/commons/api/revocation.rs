use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::commons::x509::CertValidity;

//------------ CrlReason -----------------------------------------------------

/// Revocation reasons as defined in RFC 5280.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CrlReason {
    Unspecified,
    KeyCompromise,
    CaCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
    CertificateHold,
    RemoveFromCrl,
    PrivilegeWithdrawn,
    AaCompromise,
}

impl CrlReason {
    pub fn code(self) -> u8 {
        match self {
            CrlReason::Unspecified => 0,
            CrlReason::KeyCompromise => 1,
            CrlReason::CaCompromise => 2,
            CrlReason::AffiliationChanged => 3,
            CrlReason::Superseded => 4,
            CrlReason::CessationOfOperation => 5,
            CrlReason::CertificateHold => 6,
            CrlReason::RemoveFromCrl => 8,
            CrlReason::PrivilegeWithdrawn => 9,
            CrlReason::AaCompromise => 10,
        }
    }

    /// Reasons reserved for the CA itself, never accepted in a request to
    /// revoke a single certificate.
    pub fn is_reserved(self) -> bool {
        matches!(
            self,
            CrlReason::CaCompromise | CrlReason::AaCompromise | CrlReason::RemoveFromCrl
        )
    }
}

impl fmt::Display for CrlReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            CrlReason::Unspecified => "unspecified",
            CrlReason::KeyCompromise => "keyCompromise",
            CrlReason::CaCompromise => "cACompromise",
            CrlReason::AffiliationChanged => "affiliationChanged",
            CrlReason::Superseded => "superseded",
            CrlReason::CessationOfOperation => "cessationOfOperation",
            CrlReason::CertificateHold => "certificateHold",
            CrlReason::RemoveFromCrl => "removeFromCRL",
            CrlReason::PrivilegeWithdrawn => "privilegeWithdrawn",
            CrlReason::AaCompromise => "aACompromise",
        };
        f.write_str(s)
    }
}

impl FromStr for CrlReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let reason = match s.to_ascii_lowercase().as_str() {
            "unspecified" => CrlReason::Unspecified,
            "keycompromise" => CrlReason::KeyCompromise,
            "cacompromise" => CrlReason::CaCompromise,
            "affiliationchanged" => CrlReason::AffiliationChanged,
            "superseded" => CrlReason::Superseded,
            "cessationofoperation" => CrlReason::CessationOfOperation,
            "certificatehold" => CrlReason::CertificateHold,
            "removefromcrl" => CrlReason::RemoveFromCrl,
            "privilegewithdrawn" => CrlReason::PrivilegeWithdrawn,
            "aacompromise" => CrlReason::AaCompromise,
            _ => return Err(format!("unknown CRL reason '{s}'")),
        };
        Ok(reason)
    }
}

//------------ CertRevocationInfo --------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CertRevocationInfo {
    pub reason: CrlReason,
    pub revocation_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalidity_time: Option<DateTime<Utc>>,
}

impl CertRevocationInfo {
    pub fn new(reason: CrlReason, revocation_time: DateTime<Utc>, invalidity_time: Option<DateTime<Utc>>) -> Self {
        CertRevocationInfo {
            reason,
            revocation_time,
            invalidity_time,
        }
    }
}

//------------ CertStatus ----------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CertStatus {
    Good,
    Revoked,
    Unknown,
}

//------------ RevokeSuspendedControl ----------------------------------------

/// Revokes certificates that stayed on hold for too long.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RevokeSuspendedControl {
    pub target_reason: CrlReason,
    pub unchanged_since: CertValidity,
}

impl RevokeSuspendedControl {
    pub fn verify(&self) -> Result<(), String> {
        match self.target_reason {
            CrlReason::KeyCompromise
            | CrlReason::CaCompromise
            | CrlReason::AffiliationChanged
            | CrlReason::Superseded
            | CrlReason::CessationOfOperation
            | CrlReason::PrivilegeWithdrawn => Ok(()),
            other => Err(format!("invalid target reason for suspended certificates: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reasons() {
        assert_eq!(CrlReason::from_str("keyCompromise").unwrap(), CrlReason::KeyCompromise);
        assert_eq!(CrlReason::from_str("removeFromCRL").unwrap(), CrlReason::RemoveFromCrl);
        assert!(CrlReason::from_str("bogus").is_err());
        assert_eq!(CrlReason::RemoveFromCrl.code(), 8);
    }

    #[test]
    fn reserved_reasons() {
        assert!(CrlReason::CaCompromise.is_reserved());
        assert!(CrlReason::AaCompromise.is_reserved());
        assert!(CrlReason::RemoveFromCrl.is_reserved());
        assert!(!CrlReason::CertificateHold.is_reserved());
    }

    #[test]
    fn suspended_control_target() {
        let control = RevokeSuspendedControl {
            target_reason: CrlReason::CertificateHold,
            unchanged_since: CertValidity::days(15),
        };
        assert!(control.verify().is_err());
    }
}
