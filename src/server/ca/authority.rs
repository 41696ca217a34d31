//! The CA aggregate and its read side.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use log::{debug, info};
use openssl::x509::{X509Ref, X509Req};

use super::{CaInfo, CrlSigner, InFlightRegistry};
use crate::commons::CaResult;
use crate::commons::api::{
    CaStatus, CertListInfo, CertWithRevocationInfo, CertificateInfo, HealthCheckResult, NameId,
};
use crate::commons::clock::{Clock, SystemClock};
use crate::commons::crypto::{PublicKeyInfo, SignerPool};
use crate::commons::error::Error;
use crate::commons::x509::SerialNumber;
use crate::server::audit::{AuditEvent, AuditSink, LogAuditSink};
use crate::server::ca::inflight::ConcurrentInFlightRegistry;
use crate::server::profile::Certprofile;
use crate::server::publisher::Publisher;
use crate::server::scheduler::{JobHandle, RunFlag};
use crate::server::store::{CertListFilter, CertStore};

/// The name of the pseudo profile under which a self-signed CA
/// certificate is stored.
const CA_PROFILE_NAME: &str = "ca";

//------------ CertAuthority -------------------------------------------------

/// A running CA.
///
/// Issues certificates, keeps track of their revocation, produces CRLs
/// and tells its publishers about every change. Shared as
/// `Arc<CertAuthority>` between callers and background jobs.
pub struct CertAuthority {
    pub(super) info: CaInfo,
    pub(super) signer: Arc<SignerPool>,
    pub(super) crl_signer: Option<CrlSigner>,
    pub(super) store: Arc<dyn CertStore>,
    pub(super) profiles: HashMap<String, Arc<dyn Certprofile>>,
    pub(super) publishers: Vec<Arc<dyn Publisher>>,
    pub(super) inflight: Arc<dyn InFlightRegistry>,
    pub(super) audit: Arc<dyn AuditSink>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) master: bool,

    pub(super) crl_flag: RunFlag,
    pub(super) expired_flag: RunFlag,
    pub(super) suspended_flag: RunFlag,
    pub(super) jobs: Mutex<Vec<JobHandle>>,
}

impl fmt::Debug for CertAuthority {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CertAuthority")
            .field("ident", self.ident())
            .field("status", &self.status())
            .field("master", &self.master)
            .finish_non_exhaustive()
    }
}

impl CertAuthority {
    pub fn builder(info: CaInfo, signer: Arc<SignerPool>, store: Arc<dyn CertStore>) -> CertAuthorityBuilder {
        CertAuthorityBuilder::new(info, signer, store)
    }

    pub fn ident(&self) -> &NameId {
        self.info.ident()
    }

    pub fn info(&self) -> &CaInfo {
        &self.info
    }

    pub fn status(&self) -> CaStatus {
        self.info.status()
    }

    pub fn is_master(&self) -> bool {
        self.master
    }

    pub fn crl_signer(&self) -> Option<&CrlSigner> {
        self.crl_signer.as_ref()
    }

    /// Starts an audit event for this CA, timed by the CA's clock.
    pub(super) fn audit_event(&self, name: &str, msg_id: Option<&str>) -> AuditEvent {
        AuditEvent::new(self.audit.clone(), self.clock.now(), name, self.ident().name(), msg_id)
    }

    pub fn profile_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn publishers(&self) -> &[Arc<dyn Publisher>] {
        &self.publishers
    }

    /// Whether revocations need to go into the delta CRL cache.
    pub(super) fn publish_to_delta(&self) -> bool {
        self.crl_signer
            .as_ref()
            .map(|signer| signer.control().uses_delta_crls())
            .unwrap_or(false)
    }

    pub fn health_check(&self) -> HealthCheckResult {
        let mut children = vec![
            HealthCheckResult::new("signer", self.signer.is_healthy()),
            HealthCheckResult::new("store", self.store.is_healthy()),
        ];
        if let Some(crl_signer) = &self.crl_signer {
            if crl_signer.is_indirect() {
                children.push(HealthCheckResult::new("crl-signer", crl_signer.signer().is_healthy()));
            }
        }
        let publishers = self
            .publishers
            .iter()
            .map(|publisher| HealthCheckResult::new(publisher.ident().name(), publisher.is_healthy()))
            .collect();
        children.push(HealthCheckResult::with_children("publishers", publishers));

        HealthCheckResult::with_children(self.ident().name(), children)
    }

    pub fn get_cert_with_revocation_info(&self, serial: &SerialNumber) -> CaResult<Option<CertWithRevocationInfo>> {
        Ok(self.store.get_cert_with_revocation_info(self.ident(), serial)?)
    }

    /// Whether the certificate was issued by this CA and is in the store.
    pub fn knows_certificate(&self, cert: &X509Ref) -> CaResult<bool> {
        if cert.issuer_name().to_der()? != self.info.cert().cert().subject_name().to_der()? {
            return Ok(false);
        }
        let serial = SerialNumber::from_asn1(cert.serial_number())?;
        match self.store.get_cert_with_revocation_info(self.ident(), &serial)? {
            Some(stored) => Ok(stored.cert.der() == cert.to_der()?.as_slice()),
            None => Ok(false),
        }
    }

    pub fn list_certificates(&self, filter: &CertListFilter) -> CaResult<Vec<CertListInfo>> {
        Ok(self.store.list_certificates(self.ident(), filter)?)
    }

    /// Checks the proof of possession of a PKCS#10 request.
    pub fn check_csr(&self, der: &[u8]) -> CaResult<()> {
        let req = X509Req::from_der(der).map_err(|e| Error::bad_request(format!("invalid CSR: {e}")))?;
        let key = req
            .public_key()
            .map_err(|e| Error::bad_request(format!("invalid public key in CSR: {e}")))?;
        match req.verify(&key) {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::bad_pop("CSR signature does not verify")),
            Err(e) => Err(Error::bad_pop(format!("cannot verify CSR signature: {e}"))),
        }
    }

    pub(super) fn profile(&self, name: &str) -> CaResult<Arc<dyn Certprofile>> {
        self.profiles.get(name).cloned().ok_or_else(|| Error::unknown_profile(name))
    }

    /// Whether a CRL generation or maintenance run is in progress.
    pub fn is_busy(&self) -> bool {
        self.crl_flag.is_running() || self.expired_flag.is_running() || self.suspended_flag.is_running()
    }

    /// Cancels all background jobs of this CA.
    pub fn shutdown(&self) {
        let jobs: Vec<JobHandle> = self.jobs.lock().expect("poisoned lock").drain(..).collect();
        for job in jobs {
            job.cancel();
        }
        info!("CA '{}' stopped", self.ident());
    }
}

//------------ CertAuthorityBuilder ------------------------------------------

pub struct CertAuthorityBuilder {
    info: CaInfo,
    signer: Arc<SignerPool>,
    store: Arc<dyn CertStore>,
    crl_signer: Option<Arc<SignerPool>>,
    profiles: HashMap<String, Arc<dyn Certprofile>>,
    publishers: Vec<Arc<dyn Publisher>>,
    inflight: Option<Arc<dyn InFlightRegistry>>,
    audit: Option<Arc<dyn AuditSink>>,
    clock: Option<Arc<dyn Clock>>,
    master: bool,
}

impl CertAuthorityBuilder {
    fn new(info: CaInfo, signer: Arc<SignerPool>, store: Arc<dyn CertStore>) -> Self {
        CertAuthorityBuilder {
            info,
            signer,
            store,
            crl_signer: None,
            profiles: HashMap::new(),
            publishers: vec![],
            inflight: None,
            audit: None,
            clock: None,
            master: true,
        }
    }

    /// Uses a separate key for CRLs instead of the CA key.
    pub fn crl_signer(mut self, signer: Arc<SignerPool>) -> Self {
        self.crl_signer = Some(signer);
        self
    }

    pub fn profile(mut self, profile: Arc<dyn Certprofile>) -> Self {
        self.profiles.insert(profile.ident().name().to_string(), profile);
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    pub fn inflight(mut self, inflight: Arc<dyn InFlightRegistry>) -> Self {
        self.inflight = Some(inflight);
        self
    }

    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Whether this process may change state shared with other instances.
    pub fn master(mut self, master: bool) -> Self {
        self.master = master;
        self
    }

    pub fn build(self) -> CaResult<CertAuthority> {
        let mut info = self.info;
        let ca = info.ident().clone();

        let ca_key = info.cert().cert().public_key()?;
        if !self.signer.public_key().public_eq(&ca_key) {
            return Err(Error::system_failure(format!(
                "signer '{}' does not match the certificate of CA '{ca}'",
                self.signer.name()
            )));
        }

        let crl_signer = match (info.settings().crl_control.clone(), self.crl_signer) {
            (Some(control), Some(signer)) => Some(CrlSigner::indirect(control, signer)?),
            (Some(control), None) => Some(CrlSigner::direct(control, self.signer.clone(), info.cert().cert())?),
            (None, Some(_)) => {
                return Err(Error::system_failure(format!(
                    "CA '{ca}' has a CRL signer but no CRL control"
                )));
            }
            (None, None) => None,
        };

        // Continue where the previous run left off.
        if let Some(next) = self.store.get_next_serial(&ca)? {
            info.next_serial().advance_to(next);
        }
        let next_crl_number = self
            .store
            .get_next_crl_number(&ca)?
            .into_iter()
            .chain(self.store.get_max_crl_number(&ca)?.map(|max| max + 1))
            .max();
        if let Some(next) = next_crl_number {
            info.next_crl_number().advance_to(next);
        }

        let store = self.store;
        if info.is_self_signed() {
            register_self_signed_cert(&mut info, store.as_ref())?;
        }

        debug!("CA '{ca}' built with {} profiles and {} publishers", self.profiles.len(), self.publishers.len());

        Ok(CertAuthority {
            info,
            signer: self.signer,
            crl_signer,
            store,
            profiles: self.profiles,
            publishers: self.publishers,
            inflight: self
                .inflight
                .unwrap_or_else(|| Arc::new(ConcurrentInFlightRegistry::default())),
            audit: self.audit.unwrap_or_else(|| Arc::new(LogAuditSink)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            master: self.master,
            crl_flag: RunFlag::new(),
            expired_flag: RunFlag::new(),
            suspended_flag: RunFlag::new(),
            jobs: Mutex::new(vec![]),
        })
    }
}

/// Makes sure a self-signed CA certificate is in the store, so that it can
/// be revoked and shows up on CRLs like any other certificate.
fn register_self_signed_cert(info: &mut CaInfo, store: &dyn CertStore) -> CaResult<()> {
    let ca = info.ident().clone();
    if let Some(stored) = store.get_cert_with_revocation_info(&ca, info.serial())? {
        if let Some(cert_id) = stored.cert.cert_id() {
            info.cert_mut().set_cert_id(cert_id);
        }
        return Ok(());
    }

    let ca_key = info.cert().cert().public_key()?;
    let public_key = PublicKeyInfo::from_pkey(&ca_key)?;
    let mut cert_info = CertificateInfo::new(
        info.cert().clone(),
        ca.clone(),
        NameId::new(0, CA_PROFILE_NAME),
        ca.clone(),
        public_key,
    );
    cert_info.set_revocation(info.revocation());
    let cert_id = store.add_cert(&cert_info)?;
    info.cert_mut().set_cert_id(cert_id);
    info!("Registered self-signed certificate of CA '{ca}'");
    Ok(())
}
