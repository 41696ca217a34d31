//! Certificate profiles.
//!
//! A [`Certprofile`] decides what a certificate of its kind may look like:
//! which keys it accepts, which subject it grants, how long it is valid
//! and which extensions it carries. The engine treats it as an oracle and
//! only enforces the decisions.

use std::fmt;

use chrono::{DateTime, Duration, FixedOffset, Offset, Utc};
use const_oid::ObjectIdentifier;
use const_oid::db::rfc5912::{
    ID_KP_CLIENT_AUTH, ID_KP_CODE_SIGNING, ID_KP_EMAIL_PROTECTION, ID_KP_OCSP_SIGNING, ID_KP_SERVER_AUTH,
    ID_KP_TIME_STAMPING,
};
use der::asn1::{Ia5String, OctetString};
use der::{Decode, Encode};
use flagset::FlagSet;
use serde::Deserialize;
use x509_cert::ext::pkix::crl::dp::DistributionPoint;
use x509_cert::ext::pkix::name::{DistributionPointName, GeneralName};
use x509_cert::ext::pkix::{
    AuthorityKeyIdentifier, BasicConstraints, CrlDistributionPoints, ExtendedKeyUsage, KeyUsage, KeyUsages,
    SubjectKeyIdentifier,
};
use x509_cert::ext::{AsExtension, Extension};
use x509_cert::name::Name;

use crate::commons::api::{NameId, RequestedExtension};
use crate::commons::crypto::{KeyAlgorithm, PublicKeyInfo, SignAlgo};
use crate::commons::x509::{CertValidity, Rdn, Subject};

//------------ ProfileError --------------------------------------------------

#[derive(Debug)]
pub enum ProfileError {
    /// The request does not fit the profile.
    BadCertTemplate(String),

    /// The profile itself failed.
    System(String),
}

impl ProfileError {
    pub fn bad_template(msg: impl fmt::Display) -> Self {
        ProfileError::BadCertTemplate(msg.to_string())
    }

    pub fn system(msg: impl fmt::Display) -> Self {
        ProfileError::System(msg.to_string())
    }
}

impl fmt::Display for ProfileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProfileError::BadCertTemplate(msg) => write!(f, "bad certificate template: {msg}"),
            ProfileError::System(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ProfileError {}

impl From<der::Error> for ProfileError {
    fn from(e: der::Error) -> Self {
        ProfileError::system(format!("cannot encode extension: {e}"))
    }
}

//------------ ExtensionValue ------------------------------------------------

/// An extension granted by a profile, the value being the DER encoding
/// that goes into the extnValue OCTET STRING.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExtensionValue {
    pub oid: ObjectIdentifier,
    pub critical: bool,
    pub value: Vec<u8>,
}

impl From<Extension> for ExtensionValue {
    fn from(ext: Extension) -> Self {
        ExtensionValue {
            oid: ext.extn_id,
            critical: ext.critical,
            value: ext.extn_value.into_bytes(),
        }
    }
}

//------------ ExtensionContext ----------------------------------------------

/// What a profile gets to see when it decides on extensions.
pub struct ExtensionContext<'a> {
    pub subject: &'a Subject,
    pub public_key: &'a PublicKeyInfo,
    pub issuer_key_identifier: &'a [u8],
    pub requested: &'a [RequestedExtension],
}

//------------ SubjectInfo ---------------------------------------------------

#[derive(Clone, Debug)]
pub struct SubjectInfo {
    pub granted: Subject,
    pub warning: Option<String>,
}

//------------ Certprofile ---------------------------------------------------

pub trait Certprofile: Send + Sync {
    fn ident(&self) -> &NameId;

    fn accepts_signature_algorithm(&self, algorithm: SignAlgo) -> bool;

    fn is_only_for_ra(&self) -> bool {
        false
    }

    fn is_serial_number_in_req_permitted(&self) -> bool;

    /// Applies the profile's rule to the notBefore derived from the request.
    fn not_before(&self, requested: DateTime<Utc>) -> DateTime<Utc> {
        requested
    }

    /// Whether notBefore starts at the next midnight in [`Self::time_zone`].
    fn has_midnight_not_before(&self) -> bool {
        false
    }

    fn time_zone(&self) -> FixedOffset {
        Utc.fix()
    }

    fn check_public_key(&self, key: &PublicKeyInfo) -> Result<(), ProfileError>;

    fn get_subject(&self, requested: &Subject) -> Result<SubjectInfo, ProfileError>;

    /// The validity the profile grants, `None` for the CA's maximum.
    fn validity(&self) -> Option<CertValidity>;

    fn get_extensions(&self, ctx: &ExtensionContext) -> Result<Vec<ExtensionValue>, ProfileError>;

    fn supports_serial_number_increment(&self) -> bool {
        false
    }

    /// Returns the SerialNumber RDN value following `current`.
    fn inc_serial_number(&self, current: Option<&str>) -> Result<String, ProfileError> {
        let _ = current;
        Err(ProfileError::system("SerialNumber increments are not supported"))
    }

    fn is_duplicate_key_permitted(&self) -> bool;

    fn is_duplicate_subject_permitted(&self) -> bool;

    fn max_cert_size(&self) -> Option<usize> {
        None
    }
}

//------------ StaticProfileConfig -------------------------------------------

/// The configuration of a [`StaticCertprofile`].
#[derive(Clone, Debug, Deserialize)]
pub struct StaticProfileConfig {
    pub id: u32,
    pub name: String,

    #[serde(default)]
    pub validity: Option<CertValidity>,

    #[serde(default = "StaticProfileConfig::dflt_key_algorithms")]
    pub key_algorithms: Vec<KeyAlgorithm>,

    #[serde(default = "StaticProfileConfig::dflt_min_rsa_bits")]
    pub min_rsa_bits: u32,

    /// Accepted signature algorithms, empty for all.
    #[serde(default)]
    pub signature_algorithms: Vec<SignAlgo>,

    #[serde(default)]
    pub ca: bool,

    #[serde(default)]
    pub path_len: Option<u8>,

    #[serde(default)]
    pub key_usage: Vec<String>,

    #[serde(default)]
    pub extended_key_usage: Vec<String>,

    #[serde(default = "StaticProfileConfig::dflt_true")]
    pub subject_key_identifier: bool,

    #[serde(default = "StaticProfileConfig::dflt_true")]
    pub authority_key_identifier: bool,

    #[serde(default)]
    pub crl_distribution_points: Vec<String>,

    /// OIDs of request extensions copied into the certificate as is.
    #[serde(default)]
    pub copied_request_extensions: Vec<String>,

    /// RDN types that must be present in the subject.
    #[serde(default)]
    pub required_rdns: Vec<String>,

    /// RDN types the subject may contain, empty for all.
    #[serde(default)]
    pub allowed_rdns: Vec<String>,

    #[serde(default = "StaticProfileConfig::dflt_true")]
    pub duplicate_key_permitted: bool,

    #[serde(default = "StaticProfileConfig::dflt_true")]
    pub duplicate_subject_permitted: bool,

    #[serde(default)]
    pub serial_number_in_request: bool,

    #[serde(default)]
    pub increment_serial_number: bool,

    #[serde(default)]
    pub only_for_ra: bool,

    #[serde(default)]
    pub not_before_delay_minutes: u32,

    #[serde(default)]
    pub midnight_not_before: bool,

    #[serde(default)]
    pub utc_offset_hours: i32,

    #[serde(default)]
    pub max_cert_size: Option<usize>,
}

impl StaticProfileConfig {
    fn dflt_key_algorithms() -> Vec<KeyAlgorithm> {
        vec![KeyAlgorithm::Rsa, KeyAlgorithm::Ec, KeyAlgorithm::Ed25519]
    }

    fn dflt_min_rsa_bits() -> u32 {
        2048
    }

    fn dflt_true() -> bool {
        true
    }

    /// A permissive end entity profile.
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        StaticProfileConfig {
            id,
            name: name.into(),
            validity: None,
            key_algorithms: Self::dflt_key_algorithms(),
            min_rsa_bits: Self::dflt_min_rsa_bits(),
            signature_algorithms: vec![],
            ca: false,
            path_len: None,
            key_usage: vec!["digitalSignature".to_string()],
            extended_key_usage: vec![],
            subject_key_identifier: true,
            authority_key_identifier: true,
            crl_distribution_points: vec![],
            copied_request_extensions: vec![],
            required_rdns: vec![],
            allowed_rdns: vec![],
            duplicate_key_permitted: true,
            duplicate_subject_permitted: true,
            serial_number_in_request: false,
            increment_serial_number: false,
            only_for_ra: false,
            not_before_delay_minutes: 0,
            midnight_not_before: false,
            utc_offset_hours: 0,
            max_cert_size: None,
        }
    }
}

//------------ StaticCertprofile ---------------------------------------------

/// A profile that grants the same thing to every request.
pub struct StaticCertprofile {
    ident: NameId,
    config: StaticProfileConfig,
    key_usage: Option<KeyUsage>,
    extended_key_usage: Vec<ObjectIdentifier>,
    crl_distribution_points: Vec<Ia5String>,
    copied_request_extensions: Vec<ObjectIdentifier>,
    time_zone: FixedOffset,
}

impl StaticCertprofile {
    pub fn build(config: StaticProfileConfig) -> Result<Self, ProfileError> {
        let ident = NameId::new(config.id, config.name.clone());

        let key_usage = if config.key_usage.is_empty() {
            None
        } else {
            let mut flags = FlagSet::<KeyUsages>::default();
            for name in &config.key_usage {
                flags |= key_usage_for_name(name)
                    .ok_or_else(|| ProfileError::system(format!("profile {ident}: unknown key usage '{name}'")))?;
            }
            Some(KeyUsage(flags))
        };

        let extended_key_usage = config
            .extended_key_usage
            .iter()
            .map(|name| {
                extended_key_usage_for_name(name)
                    .ok_or_else(|| ProfileError::system(format!("profile {ident}: unknown extended key usage '{name}'")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let crl_distribution_points = config
            .crl_distribution_points
            .iter()
            .map(|uri| {
                Ia5String::new(uri)
                    .map_err(|e| ProfileError::system(format!("profile {ident}: invalid CRL distribution point: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let copied_request_extensions = config
            .copied_request_extensions
            .iter()
            .map(|oid| {
                ObjectIdentifier::new(oid)
                    .map_err(|e| ProfileError::system(format!("profile {ident}: invalid OID '{oid}': {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let time_zone = FixedOffset::east_opt(config.utc_offset_hours * 3600)
            .ok_or_else(|| ProfileError::system(format!("profile {ident}: invalid UTC offset")))?;

        if config.path_len.is_some() && !config.ca {
            return Err(ProfileError::system(format!(
                "profile {ident}: path length given for end entity profile"
            )));
        }

        Ok(StaticCertprofile {
            ident,
            config,
            key_usage,
            extended_key_usage,
            crl_distribution_points,
            copied_request_extensions,
            time_zone,
        })
    }

    pub fn config(&self) -> &StaticProfileConfig {
        &self.config
    }

    fn rdn_allowed(&self, rdn: &Rdn) -> bool {
        self.config.allowed_rdns.is_empty()
            || self
                .config
                .allowed_rdns
                .iter()
                .any(|allowed| Rdn::new(allowed, "").attr() == rdn.attr())
    }
}

fn key_usage_for_name(name: &str) -> Option<KeyUsages> {
    match name {
        "digitalSignature" => Some(KeyUsages::DigitalSignature),
        "nonRepudiation" | "contentCommitment" => Some(KeyUsages::NonRepudiation),
        "keyEncipherment" => Some(KeyUsages::KeyEncipherment),
        "dataEncipherment" => Some(KeyUsages::DataEncipherment),
        "keyAgreement" => Some(KeyUsages::KeyAgreement),
        "keyCertSign" => Some(KeyUsages::KeyCertSign),
        "cRLSign" => Some(KeyUsages::CRLSign),
        "encipherOnly" => Some(KeyUsages::EncipherOnly),
        "decipherOnly" => Some(KeyUsages::DecipherOnly),
        _ => None,
    }
}

fn extended_key_usage_for_name(name: &str) -> Option<ObjectIdentifier> {
    match name {
        "serverAuth" => Some(ID_KP_SERVER_AUTH),
        "clientAuth" => Some(ID_KP_CLIENT_AUTH),
        "codeSigning" => Some(ID_KP_CODE_SIGNING),
        "emailProtection" => Some(ID_KP_EMAIL_PROTECTION),
        "timeStamping" => Some(ID_KP_TIME_STAMPING),
        "OCSPSigning" => Some(ID_KP_OCSP_SIGNING),
        dotted => ObjectIdentifier::new(dotted).ok(),
    }
}

fn x509_name(subject: &Subject) -> Result<Name, ProfileError> {
    let der = subject
        .to_x509_name()
        .and_then(|name| name.to_der())
        .map_err(|e| ProfileError::bad_template(format!("cannot encode subject: {e}")))?;
    Ok(Name::from_der(&der)?)
}

impl Certprofile for StaticCertprofile {
    fn ident(&self) -> &NameId {
        &self.ident
    }

    fn accepts_signature_algorithm(&self, algorithm: SignAlgo) -> bool {
        self.config.signature_algorithms.is_empty() || self.config.signature_algorithms.contains(&algorithm)
    }

    fn is_only_for_ra(&self) -> bool {
        self.config.only_for_ra
    }

    fn is_serial_number_in_req_permitted(&self) -> bool {
        self.config.serial_number_in_request || self.config.increment_serial_number
    }

    fn not_before(&self, requested: DateTime<Utc>) -> DateTime<Utc> {
        requested + Duration::minutes(self.config.not_before_delay_minutes as i64)
    }

    fn has_midnight_not_before(&self) -> bool {
        self.config.midnight_not_before
    }

    fn time_zone(&self) -> FixedOffset {
        self.time_zone
    }

    fn check_public_key(&self, key: &PublicKeyInfo) -> Result<(), ProfileError> {
        let algorithm = key
            .algorithm()
            .ok_or_else(|| ProfileError::bad_template("unsupported public key algorithm"))?;
        if !self.config.key_algorithms.contains(&algorithm) {
            return Err(ProfileError::bad_template(format!(
                "key algorithm {algorithm} not permitted by profile {}",
                self.ident
            )));
        }

        if let Some(bits) = key.rsa_bits() {
            if bits < self.config.min_rsa_bits {
                return Err(ProfileError::bad_template(format!(
                    "RSA modulus of {bits} bits is shorter than {}",
                    self.config.min_rsa_bits
                )));
            }
        }
        Ok(())
    }

    fn get_subject(&self, requested: &Subject) -> Result<SubjectInfo, ProfileError> {
        let mut removed = vec![];
        let rdns: Vec<Rdn> = requested
            .rdns()
            .iter()
            .filter(|rdn| {
                let allowed = self.rdn_allowed(rdn);
                if !allowed {
                    removed.push(rdn.attr().to_string());
                }
                allowed
            })
            .cloned()
            .collect();
        let granted = Subject::new(rdns);

        for required in &self.config.required_rdns {
            let attr = Rdn::new(required, "").attr().to_string();
            if !granted.rdns().iter().any(|rdn| rdn.attr() == attr) {
                return Err(ProfileError::bad_template(format!("required RDN {attr} is missing")));
            }
        }

        let warning = if removed.is_empty() {
            None
        } else {
            Some(format!("subject RDNs removed: {}", removed.join(", ")))
        };
        Ok(SubjectInfo { granted, warning })
    }

    fn validity(&self) -> Option<CertValidity> {
        self.config.validity
    }

    fn get_extensions(&self, ctx: &ExtensionContext) -> Result<Vec<ExtensionValue>, ProfileError> {
        let subject = x509_name(ctx.subject)?;
        let mut extensions: Vec<Extension> = vec![];

        if self.config.ca {
            let bc = BasicConstraints {
                ca: true,
                path_len_constraint: self.config.path_len,
            };
            extensions.push(bc.to_extension(&subject, &extensions)?);
        }

        if let Some(key_usage) = &self.key_usage {
            extensions.push(key_usage.to_extension(&subject, &extensions)?);
        }

        if !self.extended_key_usage.is_empty() {
            let eku = ExtendedKeyUsage(self.extended_key_usage.clone());
            extensions.push(eku.to_extension(&subject, &extensions)?);
        }

        if self.config.subject_key_identifier {
            let key_id = ctx.public_key.key_identifier()?;
            let ski = SubjectKeyIdentifier(OctetString::new(key_id)?);
            extensions.push(ski.to_extension(&subject, &extensions)?);
        }

        if self.config.authority_key_identifier {
            let aki = AuthorityKeyIdentifier {
                key_identifier: Some(OctetString::new(ctx.issuer_key_identifier)?),
                authority_cert_issuer: None,
                authority_cert_serial_number: None,
            };
            extensions.push(aki.to_extension(&subject, &extensions)?);
        }

        if !self.crl_distribution_points.is_empty() {
            let names = self
                .crl_distribution_points
                .iter()
                .cloned()
                .map(GeneralName::UniformResourceIdentifier)
                .collect();
            let dps = CrlDistributionPoints(vec![DistributionPoint {
                distribution_point: Some(DistributionPointName::FullName(names)),
                reasons: None,
                crl_issuer: None,
            }]);
            extensions.push(dps.to_extension(&subject, &extensions)?);
        }

        let mut granted: Vec<ExtensionValue> = extensions.into_iter().map(ExtensionValue::from).collect();

        for requested in ctx.requested {
            let Ok(oid) = ObjectIdentifier::new(&requested.oid) else {
                return Err(ProfileError::bad_template(format!("invalid extension OID '{}'", requested.oid)));
            };
            if !self.copied_request_extensions.contains(&oid) || granted.iter().any(|ext| ext.oid == oid) {
                continue;
            }
            granted.push(ExtensionValue {
                oid,
                critical: requested.critical,
                value: requested.value.clone(),
            });
        }

        Ok(granted)
    }

    fn supports_serial_number_increment(&self) -> bool {
        self.config.increment_serial_number
    }

    fn inc_serial_number(&self, current: Option<&str>) -> Result<String, ProfileError> {
        match current {
            None => Ok("1".to_string()),
            Some(value) => {
                let number: u64 = value.trim().parse().map_err(|_| {
                    ProfileError::bad_template(format!("SerialNumber RDN '{value}' is not a number"))
                })?;
                Ok(number.saturating_add(1).to_string())
            }
        }
    }

    fn is_duplicate_key_permitted(&self) -> bool {
        self.config.duplicate_key_permitted
    }

    fn is_duplicate_subject_permitted(&self) -> bool {
        self.config.duplicate_subject_permitted
    }

    fn max_cert_size(&self) -> Option<usize> {
        self.config.max_cert_size
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use const_oid::db::rfc5912::{
        ID_CE_AUTHORITY_KEY_IDENTIFIER, ID_CE_BASIC_CONSTRAINTS, ID_CE_CRL_DISTRIBUTION_POINTS,
        ID_CE_EXT_KEY_USAGE, ID_CE_KEY_USAGE, ID_CE_SUBJECT_KEY_IDENTIFIER,
    };
    use openssl::ec::{EcGroup, EcKey};
    use openssl::nid::Nid;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;

    use super::*;

    fn ec_key() -> PublicKeyInfo {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();
        PublicKeyInfo::from_der(&key.public_key_to_der().unwrap()).unwrap()
    }

    fn profile(config: StaticProfileConfig) -> StaticCertprofile {
        StaticCertprofile::build(config).unwrap()
    }

    #[test]
    fn parse_config() {
        let toml = r#"
            id = 3
            name = "tls"
            validity = "397d"
            key_usage = ["digitalSignature", "keyEncipherment"]
            extended_key_usage = ["serverAuth", "clientAuth"]
            crl_distribution_points = ["http://crl.example.org/ca1.crl"]
            duplicate_subject_permitted = false
            increment_serial_number = true
        "#;
        let config: StaticProfileConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.validity, Some(CertValidity::days(397)));
        assert_eq!(config.min_rsa_bits, 2048);
        assert!(config.duplicate_key_permitted);
        assert!(!config.duplicate_subject_permitted);

        let profile = profile(config);
        assert!(profile.supports_serial_number_increment());
        assert!(profile.is_serial_number_in_req_permitted());
    }

    #[test]
    fn reject_unknown_key_usage() {
        let mut config = StaticProfileConfig::new(1, "bad");
        config.key_usage = vec!["signEverything".to_string()];
        assert!(StaticCertprofile::build(config).is_err());
    }

    #[test]
    fn check_public_key_sizes() {
        let mut config = StaticProfileConfig::new(1, "rsa-only");
        config.key_algorithms = vec![KeyAlgorithm::Rsa];
        let profile = profile(config);

        let small = PKey::from_rsa(Rsa::generate(1024).unwrap()).unwrap();
        let small = PublicKeyInfo::from_der(&small.public_key_to_der().unwrap()).unwrap();
        assert!(matches!(
            profile.check_public_key(&small),
            Err(ProfileError::BadCertTemplate(_))
        ));

        let large = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let large = PublicKeyInfo::from_der(&large.public_key_to_der().unwrap()).unwrap();
        assert!(profile.check_public_key(&large).is_ok());

        assert!(profile.check_public_key(&ec_key()).is_err());
    }

    #[test]
    fn subject_rules() {
        let mut config = StaticProfileConfig::new(1, "tls");
        config.required_rdns = vec!["CN".to_string()];
        config.allowed_rdns = vec!["CN".to_string(), "O".to_string()];
        let profile = profile(config);

        let info = profile
            .get_subject(&Subject::from_str("CN=host.example.org,OU=Ops,O=Example").unwrap())
            .unwrap();
        assert_eq!(info.granted.to_string(), "CN=host.example.org,O=Example");
        assert_eq!(info.warning.as_deref(), Some("subject RDNs removed: OU"));

        assert!(profile.get_subject(&Subject::from_str("O=Example").unwrap()).is_err());
    }

    #[test]
    fn increments_serial_number() {
        let mut config = StaticProfileConfig::new(1, "inc");
        config.increment_serial_number = true;
        let profile = profile(config);

        assert_eq!(profile.inc_serial_number(None).unwrap(), "1");
        assert_eq!(profile.inc_serial_number(Some("41")).unwrap(), "42");
        assert!(profile.inc_serial_number(Some("abc")).is_err());
    }

    #[test]
    fn end_entity_extensions() {
        let mut config = StaticProfileConfig::new(1, "tls");
        config.key_usage = vec!["digitalSignature".to_string(), "keyEncipherment".to_string()];
        config.extended_key_usage = vec!["serverAuth".to_string()];
        config.crl_distribution_points = vec!["http://crl.example.org/ca.crl".to_string()];
        let profile = profile(config);

        let key = ec_key();
        let subject = Subject::from_str("CN=host.example.org").unwrap();
        let ctx = ExtensionContext {
            subject: &subject,
            public_key: &key,
            issuer_key_identifier: &[1, 2, 3, 4],
            requested: &[],
        };
        let extensions = profile.get_extensions(&ctx).unwrap();
        let oids: Vec<ObjectIdentifier> = extensions.iter().map(|ext| ext.oid).collect();
        assert_eq!(
            oids,
            vec![
                ID_CE_KEY_USAGE,
                ID_CE_EXT_KEY_USAGE,
                ID_CE_SUBJECT_KEY_IDENTIFIER,
                ID_CE_AUTHORITY_KEY_IDENTIFIER,
                ID_CE_CRL_DISTRIBUTION_POINTS
            ]
        );
        assert!(!oids.contains(&ID_CE_BASIC_CONSTRAINTS));

        let ku = extensions.iter().find(|ext| ext.oid == ID_CE_KEY_USAGE).unwrap();
        assert!(ku.critical);
        let ku = KeyUsage::from_der(&ku.value).unwrap();
        assert!(ku.digital_signature());
        assert!(ku.key_encipherment());
        assert!(!ku.key_cert_sign());

        let ski = extensions
            .iter()
            .find(|ext| ext.oid == ID_CE_SUBJECT_KEY_IDENTIFIER)
            .unwrap();
        let ski = SubjectKeyIdentifier::from_der(&ski.value).unwrap();
        assert_eq!(ski.0.as_bytes(), key.key_identifier().unwrap().as_slice());
    }

    #[test]
    fn ca_extensions_and_copied_request_extensions() {
        let mut config = StaticProfileConfig::new(2, "subca");
        config.ca = true;
        config.path_len = Some(0);
        config.key_usage = vec!["keyCertSign".to_string(), "cRLSign".to_string()];
        config.copied_request_extensions = vec!["1.2.3.4".to_string()];
        let profile = profile(config);

        let key = ec_key();
        let subject = Subject::from_str("CN=Sub CA,O=Example").unwrap();
        let requested = vec![
            RequestedExtension {
                oid: "1.2.3.4".to_string(),
                critical: false,
                value: vec![0x05, 0x00],
            },
            RequestedExtension {
                oid: "1.2.3.5".to_string(),
                critical: false,
                value: vec![0x05, 0x00],
            },
        ];
        let ctx = ExtensionContext {
            subject: &subject,
            public_key: &key,
            issuer_key_identifier: &[9; 20],
            requested: &requested,
        };
        let extensions = profile.get_extensions(&ctx).unwrap();

        let bc = extensions.iter().find(|ext| ext.oid == ID_CE_BASIC_CONSTRAINTS).unwrap();
        assert!(bc.critical);
        let bc = BasicConstraints::from_der(&bc.value).unwrap();
        assert!(bc.ca);
        assert_eq!(bc.path_len_constraint, Some(0));

        let copied: Vec<String> = extensions
            .iter()
            .filter(|ext| ext.oid.to_string().starts_with("1.2.3."))
            .map(|ext| ext.oid.to_string())
            .collect();
        assert_eq!(copied, vec!["1.2.3.4".to_string()]);
    }
}
