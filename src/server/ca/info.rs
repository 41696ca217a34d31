//! The identity and settings of a running CA.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use openssl::x509::X509;
use serde::Deserialize;

use crate::commons::CaResult;
use crate::commons::api::{
    CaStatus, CertRevocationInfo, CertWithDbId, CrlControl, NameId, RevokeSuspendedControl, ValidityMode,
};
use crate::commons::crypto::SignerPool;
use crate::commons::error::Error;
use crate::commons::x509::{CertValidity, SerialNumber, Subject, is_self_signed, subject_key_id};

//------------ CaSettings ----------------------------------------------------

/// The settings of a CA that do not concern its keys.
#[derive(Clone, Debug, Deserialize)]
pub struct CaSettings {
    #[serde(default = "CaSettings::dflt_max_validity")]
    pub max_validity: CertValidity,

    #[serde(default = "CaSettings::dflt_validity_mode")]
    pub validity_mode: ValidityMode,

    /// No certificates are issued in the last days of the CA validity.
    #[serde(default = "CaSettings::dflt_expiration_period_days")]
    pub expiration_period_days: u32,

    /// Expired certificates are removed this many days after expiry, a
    /// negative value keeps them forever.
    #[serde(default = "CaSettings::dflt_keep_expired_cert_days")]
    pub keep_expired_cert_days: i32,

    #[serde(default = "CaSettings::dflt_true")]
    pub duplicate_key_permitted: bool,

    #[serde(default = "CaSettings::dflt_true")]
    pub duplicate_subject_permitted: bool,

    /// Number of full CRLs kept in the store.
    #[serde(default = "CaSettings::dflt_num_crls")]
    pub num_crls: usize,

    /// Start of the first CRL interval, the CA notBefore if missing.
    #[serde(default)]
    pub crl_base_time: Option<DateTime<Utc>>,

    #[serde(default = "CaSettings::dflt_counter")]
    pub next_serial: u64,

    #[serde(default = "CaSettings::dflt_counter")]
    pub next_crl_number: u64,

    /// Where delta CRLs are published, announced in full CRLs.
    #[serde(default)]
    pub delta_crl_uris: Vec<String>,

    #[serde(default)]
    pub crl_control: Option<CrlControl>,

    #[serde(default)]
    pub revoke_suspended: Option<RevokeSuspendedControl>,

    /// Revocation of the CA itself.
    #[serde(default)]
    pub revocation: Option<CertRevocationInfo>,
}

impl CaSettings {
    fn dflt_max_validity() -> CertValidity {
        CertValidity::years(5)
    }

    fn dflt_validity_mode() -> ValidityMode {
        ValidityMode::Strict
    }

    fn dflt_expiration_period_days() -> u32 {
        365
    }

    fn dflt_keep_expired_cert_days() -> i32 {
        -1
    }

    fn dflt_true() -> bool {
        true
    }

    fn dflt_num_crls() -> usize {
        30
    }

    fn dflt_counter() -> u64 {
        1
    }

    pub fn verify(&self) -> Result<(), String> {
        if self.num_crls == 0 {
            return Err("num_crls must be at least 1".to_string());
        }
        if self.next_serial == 0 {
            return Err("next_serial must be at least 1".to_string());
        }
        if let Some(control) = &self.crl_control {
            control.verify()?;
        }
        if let Some(control) = &self.revoke_suspended {
            control.verify()?;
        }
        Ok(())
    }
}

impl Default for CaSettings {
    fn default() -> Self {
        CaSettings {
            max_validity: Self::dflt_max_validity(),
            validity_mode: Self::dflt_validity_mode(),
            expiration_period_days: Self::dflt_expiration_period_days(),
            keep_expired_cert_days: Self::dflt_keep_expired_cert_days(),
            duplicate_key_permitted: true,
            duplicate_subject_permitted: true,
            num_crls: Self::dflt_num_crls(),
            crl_base_time: None,
            next_serial: 1,
            next_crl_number: 1,
            delta_crl_uris: vec![],
            crl_control: None,
            revoke_suspended: None,
            revocation: None,
        }
    }
}

//------------ MonotonicCounter ----------------------------------------------

/// A counter that hands out every value at most once.
///
/// A value is only handed out after the advanced counter was persisted,
/// so a crash can skip values but never reuse them.
#[derive(Debug)]
pub struct MonotonicCounter {
    next: Mutex<u64>,
}

impl MonotonicCounter {
    pub fn new(next: u64) -> Self {
        MonotonicCounter { next: Mutex::new(next) }
    }

    /// The value the next reservation will return.
    pub fn peek(&self) -> u64 {
        *self.next.lock().expect("poisoned lock")
    }

    /// Reserves the next value. `persist` gets the value following it and
    /// must store it durably; if it fails nothing is reserved.
    pub fn reserve<E>(&self, persist: impl FnOnce(u64) -> Result<(), E>) -> Result<u64, E> {
        let mut next = self.next.lock().expect("poisoned lock");
        let value = *next;
        persist(value + 1)?;
        *next = value + 1;
        Ok(value)
    }

    /// Moves the counter forward to `next`. Never moves it back.
    pub fn advance_to(&self, next: u64) {
        let mut current = self.next.lock().expect("poisoned lock");
        if *current < next {
            *current = next;
        }
    }
}

//------------ CrlSigner -----------------------------------------------------

/// Signs the CRLs of a CA, either with the CA key or with a key of its own.
pub struct CrlSigner {
    control: CrlControl,
    signer: Arc<SignerPool>,
    key_identifier: Vec<u8>,
    indirect: bool,
}

impl CrlSigner {
    /// A signer for direct CRLs, using the CA's own signer.
    pub fn direct(control: CrlControl, ca_signer: Arc<SignerPool>, ca_cert: &X509) -> CaResult<Self> {
        Ok(CrlSigner {
            control,
            signer: ca_signer,
            key_identifier: subject_key_id(ca_cert)?,
            indirect: false,
        })
    }

    /// A signer with its own key and certificate, producing indirect CRLs.
    pub fn indirect(control: CrlControl, signer: Arc<SignerPool>) -> CaResult<Self> {
        let cert = signer
            .cert()
            .ok_or_else(|| Error::system_failure(format!("CRL signer '{}' has no certificate", signer.name())))?;
        let key_identifier = subject_key_id(cert)?;
        Ok(CrlSigner {
            control,
            signer,
            key_identifier,
            indirect: true,
        })
    }

    pub fn control(&self) -> &CrlControl {
        &self.control
    }

    pub fn signer(&self) -> &SignerPool {
        &self.signer
    }

    pub fn key_identifier(&self) -> &[u8] {
        &self.key_identifier
    }

    /// Whether the CRLs are signed by someone other than the CA.
    pub fn is_indirect(&self) -> bool {
        self.indirect
    }
}

//------------ CaInfo --------------------------------------------------------

/// What a CA knows about itself.
///
/// The certificate and settings are fixed for the lifetime of the CA,
/// the counters, the revocation state and the status change.
pub struct CaInfo {
    ident: NameId,
    cert: CertWithDbId,
    canonical_subject: String,
    subject_key_id: Vec<u8>,
    self_signed: bool,
    no_new_certificate_after: DateTime<Utc>,
    crl_base_time: DateTime<Utc>,
    settings: CaSettings,

    next_serial: MonotonicCounter,
    next_crl_number: MonotonicCounter,
    revocation: Mutex<Option<CertRevocationInfo>>,
    status: Mutex<CaStatus>,
}

impl CaInfo {
    pub fn new(ident: NameId, cert: X509, settings: CaSettings) -> CaResult<Self> {
        let subject_key_id = subject_key_id(&cert)?;
        let self_signed = is_self_signed(&cert);
        let cert = CertWithDbId::new(cert)?;

        let no_new_certificate_after =
            cert.not_after() - Duration::days(settings.expiration_period_days as i64);
        let crl_base_time = settings.crl_base_time.unwrap_or_else(|| cert.not_before());

        Ok(CaInfo {
            ident,
            canonical_subject: cert.subject().canonicalize(),
            subject_key_id,
            self_signed,
            no_new_certificate_after,
            crl_base_time,
            next_serial: MonotonicCounter::new(settings.next_serial),
            next_crl_number: MonotonicCounter::new(settings.next_crl_number),
            revocation: Mutex::new(settings.revocation.clone()),
            status: Mutex::new(CaStatus::Active),
            settings,
            cert,
        })
    }

    pub fn ident(&self) -> &NameId {
        &self.ident
    }

    pub fn cert(&self) -> &CertWithDbId {
        &self.cert
    }

    pub(super) fn cert_mut(&mut self) -> &mut CertWithDbId {
        &mut self.cert
    }

    pub fn subject(&self) -> &Subject {
        self.cert.subject()
    }

    pub fn canonical_subject(&self) -> &str {
        &self.canonical_subject
    }

    pub fn serial(&self) -> &SerialNumber {
        self.cert.serial()
    }

    pub fn subject_key_id(&self) -> &[u8] {
        &self.subject_key_id
    }

    pub fn is_self_signed(&self) -> bool {
        self.self_signed
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.cert.not_before()
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.cert.not_after()
    }

    pub fn no_new_certificate_after(&self) -> DateTime<Utc> {
        self.no_new_certificate_after
    }

    pub fn crl_base_time(&self) -> DateTime<Utc> {
        self.crl_base_time
    }

    pub fn settings(&self) -> &CaSettings {
        &self.settings
    }

    pub fn max_validity(&self) -> CertValidity {
        self.settings.max_validity
    }

    pub fn validity_mode(&self) -> ValidityMode {
        self.settings.validity_mode
    }

    pub fn next_serial(&self) -> &MonotonicCounter {
        &self.next_serial
    }

    pub fn next_crl_number(&self) -> &MonotonicCounter {
        &self.next_crl_number
    }

    pub fn revocation(&self) -> Option<CertRevocationInfo> {
        self.revocation.lock().expect("poisoned lock").clone()
    }

    pub(super) fn set_revocation(&self, revocation: Option<CertRevocationInfo>) {
        *self.revocation.lock().expect("poisoned lock") = revocation;
    }

    pub fn status(&self) -> CaStatus {
        *self.status.lock().expect("poisoned lock")
    }

    /// Sets the status and returns the previous one.
    pub(super) fn set_status(&self, status: CaStatus) -> CaStatus {
        std::mem::replace(&mut *self.status.lock().expect("poisoned lock"), status)
    }
}

//------------ Tests ---------------------------------------------------------
