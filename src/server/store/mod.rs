//! The certificate store gateway.
//!
//! The engine does not care how certificates, CRLs, revocation state and
//! the publish queue are persisted. It talks to a [`CertStore`], which
//! must make each single call durable before it returns. Paged queries
//! are ordered by an opaque, increasing id: callers pass the last id they
//! saw plus one as the start of the next page.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::commons::api::{
    CertListInfo, CertListOrderBy, CertRevocationInfo, CertStatus, CertWithDbId, CertWithRevocationInfo,
    CertificateInfo, CertsetEntry, CrlInfo, CrlReason, NameId, RevokedCertEntry,
};
use crate::commons::crypto::Fingerprint;
use crate::commons::x509::{SerialNumber, Subject};

mod memory;
pub use self::memory::MemoryCertStore;

//------------ StoreError ----------------------------------------------------

#[derive(Debug)]
pub enum StoreError {
    /// A certificate with this serial number already exists for the CA.
    DuplicateSerial(SerialNumber),

    /// The requested state change is not allowed.
    NotPermitted(String),

    /// The backend cannot be reached.
    Unavailable(String),

    Other(String),
}

impl StoreError {
    pub fn other(msg: impl fmt::Display) -> Self {
        StoreError::Other(msg.to_string())
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoreError::DuplicateSerial(serial) => write!(f, "duplicate serial number {serial}"),
            StoreError::NotPermitted(msg) => write!(f, "not permitted: {msg}"),
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
            StoreError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

pub type StoreResult<T> = Result<T, StoreError>;

//------------ CertListFilter ------------------------------------------------

/// Selects certificates for [`CertStore::list_certificates`].
#[derive(Clone, Debug)]
pub struct CertListFilter {
    /// Pattern over the canonical subject, `*` matches any run of characters.
    /// Matching ignores case.
    pub subject_pattern: Option<String>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
    pub order_by: Option<CertListOrderBy>,
    pub limit: usize,
}

impl Default for CertListFilter {
    fn default() -> Self {
        CertListFilter {
            subject_pattern: None,
            valid_from: None,
            valid_to: None,
            order_by: None,
            limit: 1000,
        }
    }
}

//------------ CertStore -----------------------------------------------------

/// Durable storage of everything a CA issues.
pub trait CertStore: Send + Sync {
    //--- Certificates

    /// Stores a newly issued certificate and returns its id.
    fn add_cert(&self, cert: &CertificateInfo) -> StoreResult<u64>;

    /// Deletes a certificate together with its publish queue entries.
    fn remove_cert(&self, ca: &NameId, serial: &SerialNumber) -> StoreResult<()>;

    fn get_cert_with_revocation_info(
        &self,
        ca: &NameId,
        serial: &SerialNumber,
    ) -> StoreResult<Option<CertWithRevocationInfo>>;

    /// The certificate with the given id and its current revocation state.
    fn get_cert_for_id(&self, cert_id: u64) -> StoreResult<Option<CertificateInfo>>;

    /// Returns ids of the CA's certificates, starting at `start_id`.
    fn get_cert_ids(&self, ca: &NameId, start_id: u64, limit: usize, only_revoked: bool) -> StoreResult<Vec<u64>>;

    fn is_cert_for_subject_issued(&self, ca: &NameId, subject: Fingerprint) -> StoreResult<bool>;

    fn is_cert_for_key_issued(&self, ca: &NameId, key: Fingerprint) -> StoreResult<bool>;

    /// Returns the SerialNumber RDN of the latest certificate whose subject
    /// matches `subject` when SerialNumber RDNs are ignored.
    fn get_latest_serial_number_rdn(&self, ca: &NameId, subject: &Subject) -> StoreResult<Option<String>>;

    /// Good if any certificate for the subject is not revoked.
    fn get_cert_status_for_subject(&self, ca: &NameId, subject: &Subject) -> StoreResult<CertStatus>;

    fn list_certificates(&self, ca: &NameId, filter: &CertListFilter) -> StoreResult<Vec<CertListInfo>>;

    //--- Revocation

    /// Revokes a certificate.
    ///
    /// Returns `None` if the certificate is unknown, or if it is already
    /// revoked and neither `force` is set nor a hold is turned into a
    /// final revocation. A hold that becomes final keeps its revocation
    /// time.
    fn revoke_cert(
        &self,
        ca: &NameId,
        serial: &SerialNumber,
        info: &CertRevocationInfo,
        force: bool,
        publish_to_delta: bool,
    ) -> StoreResult<Option<CertWithRevocationInfo>>;

    /// Turns a hold into a final revocation. `None` unless the certificate
    /// is currently on hold.
    fn revoke_suspended_cert(
        &self,
        ca: &NameId,
        serial: &SerialNumber,
        reason: CrlReason,
        publish_to_delta: bool,
    ) -> StoreResult<Option<CertWithRevocationInfo>>;

    /// Lifts a revocation. `None` if the certificate is unknown or not
    /// revoked; [`StoreError::NotPermitted`] if it is not on hold and
    /// `force` is not set.
    fn unrevoke_cert(
        &self,
        ca: &NameId,
        serial: &SerialNumber,
        force: bool,
        publish_to_delta: bool,
    ) -> StoreResult<Option<CertWithDbId>>;

    /// Serials of certificates that expired before `expired_at`.
    fn get_expired_serial_numbers(
        &self,
        ca: &NameId,
        expired_at: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<SerialNumber>>;

    /// Serials of certificates on hold whose status did not change since
    /// `latest_last_update`.
    fn get_suspended_cert_serials(
        &self,
        ca: &NameId,
        latest_last_update: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<SerialNumber>>;

    //--- CRL content

    /// Revoked certificates, optionally leaving out those that expired
    /// before `not_expired_at`.
    fn get_revoked_certs(
        &self,
        ca: &NameId,
        not_expired_at: Option<DateTime<Utc>>,
        start_id: u64,
        limit: usize,
        only_ca_certs: bool,
        only_user_certs: bool,
    ) -> StoreResult<Vec<RevokedCertEntry>>;

    /// Entries of the delta CRL cache. Certificates that are no longer
    /// revoked are reported with reason `removeFromCRL`.
    fn get_certs_for_delta_crl(
        &self,
        ca: &NameId,
        not_expired_at: Option<DateTime<Utc>>,
        start_id: u64,
        limit: usize,
    ) -> StoreResult<Vec<RevokedCertEntry>>;

    /// All certificates not expired at `not_expired_at`.
    fn get_certset_entries(
        &self,
        ca: &NameId,
        not_expired_at: Option<DateTime<Utc>>,
        start_id: u64,
        limit: usize,
    ) -> StoreResult<Vec<CertsetEntry>>;

    fn get_max_id_of_delta_crl_cache(&self, ca: &NameId) -> StoreResult<u64>;

    /// Removes delta cache entries up to and including `max_id`.
    fn clear_delta_crl_cache(&self, ca: &NameId, max_id: u64) -> StoreResult<()>;

    //--- CRLs

    fn add_crl(&self, ca: &NameId, crl: &CrlInfo) -> StoreResult<()>;

    /// The CRL with the given number, or the latest one.
    fn get_crl(&self, ca: &NameId, crl_number: Option<u64>) -> StoreResult<Option<CrlInfo>>;

    fn has_crl(&self, ca: &NameId) -> StoreResult<bool>;

    fn get_this_update_of_current_crl(&self, ca: &NameId) -> StoreResult<Option<DateTime<Utc>>>;

    fn get_max_crl_number(&self, ca: &NameId) -> StoreResult<Option<u64>>;

    fn get_max_full_crl_number(&self, ca: &NameId) -> StoreResult<Option<u64>>;

    /// Keeps the latest `num_crls` full CRLs and the deltas based on them.
    fn cleanup_crls(&self, ca: &NameId, num_crls: usize) -> StoreResult<usize>;

    //--- Publish queue

    fn add_to_publish_queue(&self, publisher: &NameId, cert_id: u64, ca: &NameId) -> StoreResult<()>;

    fn remove_from_publish_queue(&self, publisher: &NameId, cert_id: u64) -> StoreResult<()>;

    /// Certificate ids queued for the publisher, oldest first.
    fn get_publish_queue_entries(&self, ca: &NameId, publisher: &NameId, limit: usize) -> StoreResult<Vec<u64>>;

    /// Clears the queue of the given publishers, or of all publishers.
    fn clear_publish_queue(&self, ca: &NameId, publisher: Option<&NameId>) -> StoreResult<()>;

    //--- Counters

    fn commit_next_serial(&self, ca: &NameId, next: u64) -> StoreResult<()>;

    /// The last committed next serial, if any.
    fn get_next_serial(&self, ca: &NameId) -> StoreResult<Option<u64>>;

    fn commit_next_crl_number(&self, ca: &NameId, next: u64) -> StoreResult<()>;

    fn get_next_crl_number(&self, ca: &NameId) -> StoreResult<Option<u64>>;

    fn is_healthy(&self) -> bool;
}
