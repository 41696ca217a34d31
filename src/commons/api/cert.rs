use chrono::{DateTime, Utc};
use openssl::x509::X509;
use serde::{Deserialize, Serialize};

use super::{CertRevocationInfo, CertStatus, NameId, RequestType};
use crate::commons::crypto::PublicKeyInfo;
use crate::commons::x509::{SerialNumber, Subject, from_asn1_time};

//------------ RequestedExtension --------------------------------------------

/// An extension as found in a certificate request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RequestedExtension {
    pub oid: String,
    pub critical: bool,
    pub value: Vec<u8>,
}

//------------ CertTemplateData ----------------------------------------------

/// What a requester asks for.
#[derive(Clone, Debug)]
pub struct CertTemplateData {
    subject: Subject,
    public_key: Vec<u8>,
    not_before: Option<DateTime<Utc>>,
    not_after: Option<DateTime<Utc>>,
    extensions: Vec<RequestedExtension>,
    profile: String,
}

impl CertTemplateData {
    /// Creates a template for a subject and a DER SubjectPublicKeyInfo.
    pub fn new(subject: Subject, public_key: Vec<u8>, profile: impl Into<String>) -> Self {
        CertTemplateData {
            subject,
            public_key,
            not_before: None,
            not_after: None,
            extensions: vec![],
            profile: profile.into(),
        }
    }

    pub fn with_not_before(mut self, not_before: DateTime<Utc>) -> Self {
        self.not_before = Some(not_before);
        self
    }

    pub fn with_not_after(mut self, not_after: DateTime<Utc>) -> Self {
        self.not_after = Some(not_after);
        self
    }

    pub fn with_extension(mut self, extension: RequestedExtension) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn not_before(&self) -> Option<DateTime<Utc>> {
        self.not_before
    }

    pub fn not_after(&self) -> Option<DateTime<Utc>> {
        self.not_after
    }

    pub fn extensions(&self) -> &[RequestedExtension] {
        &self.extensions
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }
}

//------------ CertWithDbId --------------------------------------------------

/// A certificate with the fields the engine keeps looking at, and its row
/// id once stored.
#[derive(Clone, Debug)]
pub struct CertWithDbId {
    cert: X509,
    der: Vec<u8>,
    serial: SerialNumber,
    subject: Subject,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    cert_id: Option<u64>,
}

impl CertWithDbId {
    pub fn new(cert: X509) -> Result<Self, openssl::error::ErrorStack> {
        let der = cert.to_der()?;
        let serial = SerialNumber::from_asn1(cert.serial_number())?;
        let subject = Subject::from_x509_name(cert.subject_name())?;
        let not_before = from_asn1_time(cert.not_before())?;
        let not_after = from_asn1_time(cert.not_after())?;
        Ok(CertWithDbId {
            cert,
            der,
            serial,
            subject,
            not_before,
            not_after,
            cert_id: None,
        })
    }

    pub fn from_der(der: &[u8]) -> Result<Self, openssl::error::ErrorStack> {
        Self::new(X509::from_der(der)?)
    }

    pub fn with_cert_id(mut self, cert_id: u64) -> Self {
        self.cert_id = Some(cert_id);
        self
    }

    pub fn set_cert_id(&mut self, cert_id: u64) {
        self.cert_id = Some(cert_id);
    }

    pub fn cert(&self) -> &X509 {
        &self.cert
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn serial(&self) -> &SerialNumber {
        &self.serial
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn cert_id(&self) -> Option<u64> {
        self.cert_id
    }

    pub fn public_key(&self) -> Result<PublicKeyInfo, openssl::error::ErrorStack> {
        PublicKeyInfo::from_pkey(&self.cert.public_key()?)
    }

    /// Whether this is a CA certificate according to BasicConstraints.
    pub fn is_ca(&self) -> bool {
        crate::commons::x509::is_ca_cert(&self.der)
    }
}

//------------ CertificateInfo -----------------------------------------------

/// An issued certificate with everything recorded about its issuance.
#[derive(Clone, Debug)]
pub struct CertificateInfo {
    cert: CertWithDbId,
    issuer: NameId,
    profile: NameId,
    requestor: NameId,
    public_key: PublicKeyInfo,
    req_type: Option<RequestType>,
    transaction_id: Option<String>,
    requested_subject: Option<Subject>,
    already_issued: bool,
    warning: Option<String>,
    revocation: Option<CertRevocationInfo>,
}

impl CertificateInfo {
    pub fn new(
        cert: CertWithDbId,
        issuer: NameId,
        profile: NameId,
        requestor: NameId,
        public_key: PublicKeyInfo,
    ) -> Self {
        CertificateInfo {
            cert,
            issuer,
            profile,
            requestor,
            public_key,
            req_type: None,
            transaction_id: None,
            requested_subject: None,
            already_issued: false,
            warning: None,
            revocation: None,
        }
    }

    pub fn cert(&self) -> &CertWithDbId {
        &self.cert
    }

    pub fn cert_mut(&mut self) -> &mut CertWithDbId {
        &mut self.cert
    }

    pub fn serial(&self) -> &SerialNumber {
        self.cert.serial()
    }

    pub fn issuer(&self) -> &NameId {
        &self.issuer
    }

    pub fn profile(&self) -> &NameId {
        &self.profile
    }

    pub fn requestor(&self) -> &NameId {
        &self.requestor
    }

    pub fn public_key(&self) -> &PublicKeyInfo {
        &self.public_key
    }

    pub fn req_type(&self) -> Option<RequestType> {
        self.req_type
    }

    pub fn set_req_type(&mut self, req_type: Option<RequestType>) {
        self.req_type = req_type;
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    pub fn set_transaction_id(&mut self, transaction_id: Option<String>) {
        self.transaction_id = transaction_id;
    }

    pub fn requested_subject(&self) -> Option<&Subject> {
        self.requested_subject.as_ref()
    }

    pub fn set_requested_subject(&mut self, subject: Option<Subject>) {
        self.requested_subject = subject;
    }

    /// Set when the same request was processed before and the existing
    /// certificate is returned.
    pub fn is_already_issued(&self) -> bool {
        self.already_issued
    }

    pub fn set_already_issued(&mut self, already_issued: bool) {
        self.already_issued = already_issued;
    }

    pub fn warning(&self) -> Option<&str> {
        self.warning.as_deref()
    }

    pub fn set_warning(&mut self, warning: Option<String>) {
        self.warning = warning;
    }

    pub fn revocation(&self) -> Option<&CertRevocationInfo> {
        self.revocation.as_ref()
    }

    pub fn set_revocation(&mut self, revocation: Option<CertRevocationInfo>) {
        self.revocation = revocation;
    }

    pub fn status(&self) -> CertStatus {
        if self.revocation.is_some() { CertStatus::Revoked } else { CertStatus::Good }
    }
}

//------------ CertWithRevocationInfo ----------------------------------------

#[derive(Clone, Debug)]
pub struct CertWithRevocationInfo {
    pub cert: CertWithDbId,
    pub profile: NameId,
    pub revocation: Option<CertRevocationInfo>,
}

impl CertWithRevocationInfo {
    pub fn status(&self) -> CertStatus {
        if self.revocation.is_some() { CertStatus::Revoked } else { CertStatus::Good }
    }
}

//------------ CertListInfo --------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct CertListInfo {
    pub serial: SerialNumber,
    pub subject: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertListOrderBy {
    Subject,
    NotBefore,
    NotAfter,
    Serial,
}
