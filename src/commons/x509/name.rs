//! Subject and issuer names.

use std::fmt;
use std::str::FromStr;

use openssl::nid::Nid;
use openssl::x509::{X509Name, X509NameRef};

use crate::commons::crypto::Fingerprint;

//------------ Rdn -----------------------------------------------------------

/// A single attribute of a distinguished name.
///
/// The attribute type is kept as the short name known to OpenSSL (`CN`,
/// `O`, `serialNumber`, …) or as a dotted object identifier.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Rdn {
    attr: String,
    value: String,
}

impl Rdn {
    pub fn new(attr: impl AsRef<str>, value: impl Into<String>) -> Self {
        Rdn {
            attr: normalize_attr(attr.as_ref()),
            value: value.into(),
        }
    }

    pub fn attr(&self) -> &str {
        &self.attr
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_serial_number(&self) -> bool {
        self.attr == SERIAL_NUMBER
    }

    pub fn is_common_name(&self) -> bool {
        self.attr == COMMON_NAME
    }

    fn is_empty(&self) -> bool {
        self.value.trim().is_empty()
    }
}

const COMMON_NAME: &str = "CN";
const SERIAL_NUMBER: &str = "serialNumber";

fn normalize_attr(attr: &str) -> String {
    let attr = attr.trim();
    match attr.to_ascii_lowercase().as_str() {
        "cn" | "commonname" => COMMON_NAME.to_string(),
        "c" | "countryname" => "C".to_string(),
        "o" | "organizationname" => "O".to_string(),
        "ou" | "organizationalunitname" => "OU".to_string(),
        "l" | "localityname" => "L".to_string(),
        "st" | "stateorprovincename" => "ST".to_string(),
        "street" | "streetaddress" => "street".to_string(),
        "dc" | "domaincomponent" => "DC".to_string(),
        "uid" | "userid" => "UID".to_string(),
        "e" | "email" | "emailaddress" => "emailAddress".to_string(),
        "sn" | "surname" => "SN".to_string(),
        "gn" | "givenname" => "GN".to_string(),
        "title" => "title".to_string(),
        "serialnumber" => SERIAL_NUMBER.to_string(),
        "2.5.4.5" => SERIAL_NUMBER.to_string(),
        "2.5.4.3" => COMMON_NAME.to_string(),
        _ => attr.to_string(),
    }
}

//------------ Subject -------------------------------------------------------

/// A distinguished name as an ordered list of RDNs.
///
/// Multi-valued RDNs are not supported, every RDN holds one attribute.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Subject {
    rdns: Vec<Rdn>,
}

impl Subject {
    pub fn new(rdns: Vec<Rdn>) -> Self {
        Subject { rdns }
    }

    pub fn rdns(&self) -> &[Rdn] {
        &self.rdns
    }

    pub fn is_empty(&self) -> bool {
        self.rdns.is_empty()
    }

    pub fn common_name(&self) -> Option<&str> {
        self.rdns.iter().find(|rdn| rdn.is_common_name()).map(Rdn::value)
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.rdns.iter().find(|rdn| rdn.is_serial_number()).map(Rdn::value)
    }

    pub fn has_serial_number(&self) -> bool {
        self.serial_number().is_some()
    }

    /// Drops all RDNs with an empty value.
    pub fn remove_empty_rdns(&mut self) {
        self.rdns.retain(|rdn| !rdn.is_empty());
    }

    /// Returns a copy of this subject with the given SerialNumber RDN.
    ///
    /// An existing SerialNumber RDN is replaced. Otherwise the new RDN goes
    /// right after the common name, or in front if there is none.
    pub fn with_serial_number(&self, value: &str) -> Subject {
        let mut rdns = self.rdns.clone();
        let new_rdn = Rdn::new(SERIAL_NUMBER, value);

        if let Some(pos) = rdns.iter().position(Rdn::is_serial_number) {
            rdns[pos] = new_rdn;
        } else if let Some(pos) = rdns.iter().position(Rdn::is_common_name) {
            rdns.insert(pos + 1, new_rdn);
        } else {
            rdns.insert(0, new_rdn);
        }

        Subject { rdns }
    }

    /// Returns the canonical text form used for comparing subjects.
    ///
    /// Attribute types and values are lowercased, values are trimmed with
    /// inner whitespace collapsed, and the RDNs are sorted by type. The
    /// relative order of RDNs with the same type is kept.
    pub fn canonicalize(&self) -> String {
        let mut parts: Vec<(String, String)> = self
            .rdns
            .iter()
            .filter(|rdn| !rdn.is_empty())
            .map(|rdn| {
                let value = rdn.value.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
                (rdn.attr.to_lowercase(), escape(&value))
            })
            .collect();
        parts.sort_by(|a, b| a.0.cmp(&b.0));

        parts
            .into_iter()
            .map(|(attr, value)| format!("{attr}={value}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// The fingerprint of the canonical form of this subject.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self.canonicalize().as_bytes())
    }

    pub fn to_x509_name(&self) -> Result<X509Name, openssl::error::ErrorStack> {
        let mut builder = X509Name::builder()?;
        for rdn in &self.rdns {
            builder.append_entry_by_text(&rdn.attr, &rdn.value)?;
        }
        Ok(builder.build())
    }

    pub fn from_x509_name(name: &X509NameRef) -> Result<Self, openssl::error::ErrorStack> {
        let mut rdns = vec![];
        for entry in name.entries() {
            let object = entry.object();
            let nid = object.nid();
            let attr = if nid == Nid::UNDEF {
                object.to_string()
            } else {
                nid.short_name()?.to_string()
            };
            let value = entry.data().as_utf8()?.to_string();
            rdns.push(Rdn::new(attr, value));
        }
        Ok(Subject { rdns })
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace(',', "\\,")
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let parts: Vec<String> = self
            .rdns
            .iter()
            .map(|rdn| format!("{}={}", rdn.attr, escape(&rdn.value)))
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

//------------ SubjectParseError ---------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubjectParseError(String);

impl fmt::Display for SubjectParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid subject: {}", self.0)
    }
}

impl std::error::Error for SubjectParseError {}

impl FromStr for Subject {
    type Err = SubjectParseError;

    /// Parses the text form `CN=foo,O=bar`. A comma inside a value is
    /// escaped with a backslash.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rdns = vec![];
        if s.trim().is_empty() {
            return Ok(Subject { rdns });
        }

        let mut current = String::new();
        let mut parts = vec![];
        let mut chars = s.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(next) => current.push(next),
                    None => return Err(SubjectParseError(format!("dangling escape in '{s}'"))),
                },
                ',' => parts.push(std::mem::take(&mut current)),
                _ => current.push(c),
            }
        }
        parts.push(current);

        for part in parts {
            let Some((attr, value)) = part.split_once('=') else {
                return Err(SubjectParseError(format!("missing '=' in '{part}'")));
            };
            if attr.trim().is_empty() {
                return Err(SubjectParseError(format!("missing attribute type in '{part}'")));
            }
            rdns.push(Rdn::new(attr, value.trim()));
        }

        Ok(Subject { rdns })
    }
}

//------------ Tests ---------------------------------------------------------
