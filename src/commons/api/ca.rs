use std::fmt;

use serde::{Deserialize, Serialize};

//------------ NameId --------------------------------------------------------

/// A numeric id with a name, identifying a CA, profile, publisher or
/// requestor.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct NameId {
    id: u32,
    name: String,
}

impl NameId {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        NameId { id, name: name.into() }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for NameId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.name)
    }
}

//------------ CaStatus ------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaStatus {
    Active,
    Inactive,
}

impl fmt::Display for CaStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CaStatus::Active => f.write_str("active"),
            CaStatus::Inactive => f.write_str("inactive"),
        }
    }
}

//------------ ValidityMode --------------------------------------------------

/// What to do with a certificate that would outlive its CA.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidityMode {
    /// Reject the request.
    Strict,
    /// Issue the certificate anyway.
    Lax,
    /// Cut the validity off at the CA's notAfter.
    Cutoff,
}

//------------ RequestType ---------------------------------------------------

/// The protocol a request came in with, recorded with the certificate.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    Cmp,
    Scep,
    Rest,
    Ca,
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            RequestType::Cmp => "cmp",
            RequestType::Scep => "scep",
            RequestType::Rest => "rest",
            RequestType::Ca => "ca",
        };
        f.write_str(s)
    }
}

//------------ RequestorInfo -------------------------------------------------

/// Who asked for an operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RequestorInfo {
    ident: NameId,
    ra: bool,
}

impl RequestorInfo {
    /// A registration authority, trusted to use RA-only profiles.
    pub fn ra(ident: NameId) -> Self {
        RequestorInfo { ident, ra: true }
    }

    pub fn user(ident: NameId) -> Self {
        RequestorInfo { ident, ra: false }
    }

    pub fn ident(&self) -> &NameId {
        &self.ident
    }

    pub fn is_ra(&self) -> bool {
        self.ra
    }
}
