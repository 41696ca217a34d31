#![allow(dead_code)] // Different tests use different parts.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{AuthorityKeyIdentifier, BasicConstraints, KeyUsage, SubjectKeyIdentifier};
use openssl::x509::{X509, X509Builder, X509NameBuilder};

use certa::commons::api::{
    CertRevocationInfo, CertTemplateData, CertWithDbId, CertificateInfo, CrlInfo, CrlReason, NameId,
    RequestorInfo,
};
use certa::commons::clock::{Clock, ManualClock};
use certa::commons::crypto::SignerPool;
use certa::commons::x509::{SerialNumber, Subject};
use certa::server::audit::MemoryAuditSink;
use certa::server::ca::InFlightRegistry;
use certa::server::ca::{CaInfo, CaSettings, CertAuthority, ConcurrentInFlightRegistry};
use certa::server::profile::{StaticCertprofile, StaticProfileConfig};
use certa::server::publisher::{PublishResult, Publisher, PublisherError};
use certa::server::scheduler::ManualScheduler;
use certa::server::store::MemoryCertStore;

/// The name of the profile every test CA has.
pub const TLS_PROFILE: &str = "tls";

/// The time test clocks start at.
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

pub fn init_logging() {
    let _ = stderrlog::new().verbosity(3).timestamp(stderrlog::Timestamp::Millisecond).init();
}

//------------ Keys and certificates -----------------------------------------

pub fn new_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

/// A self-signed CA certificate valid from `not_before` for `days`.
pub fn self_signed_ca_cert(cn: &str, key: &PKey<Private>, not_before: DateTime<Utc>, days: i64) -> X509 {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", cn).unwrap();
    name.append_entry_by_text("O", "Certa Test").unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(0x00ca_0001).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(key).unwrap();
    builder
        .set_not_before(&Asn1Time::from_unix(not_before.timestamp()).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::from_unix((not_before + Duration::days(days)).timestamp()).unwrap())
        .unwrap();
    builder
        .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    builder
        .append_extension(KeyUsage::new().critical().key_cert_sign().crl_sign().build().unwrap())
        .unwrap();
    let ski = SubjectKeyIdentifier::new()
        .build(&builder.x509v3_context(None, None))
        .unwrap();
    builder.append_extension(ski).unwrap();
    builder.sign(key, MessageDigest::sha256()).unwrap();
    builder.build()
}

/// A certificate for a separate CRL signer, issued by the CA.
pub fn crl_signer_cert(ca_cert: &X509, ca_key: &PKey<Private>, key: &PKey<Private>) -> X509 {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "CRL Signer").unwrap();
    name.append_entry_by_text("O", "Certa Test").unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(0x00c1_0001).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(ca_cert.subject_name()).unwrap();
    builder.set_pubkey(key).unwrap();
    builder.set_not_before(ca_cert.not_before()).unwrap();
    builder.set_not_after(ca_cert.not_after()).unwrap();
    builder
        .append_extension(KeyUsage::new().critical().crl_sign().build().unwrap())
        .unwrap();
    let ski = SubjectKeyIdentifier::new()
        .build(&builder.x509v3_context(Some(ca_cert), None))
        .unwrap();
    builder.append_extension(ski).unwrap();
    let aki = AuthorityKeyIdentifier::new()
        .keyid(true)
        .build(&builder.x509v3_context(Some(ca_cert), None))
        .unwrap();
    builder.append_extension(aki).unwrap();
    builder.sign(ca_key, MessageDigest::sha256()).unwrap();
    builder.build()
}

/// A template for a fresh key and the given common name.
pub fn template(cn: &str) -> CertTemplateData {
    template_for_key(cn, &new_key())
}

pub fn template_for_key(cn: &str, key: &PKey<Private>) -> CertTemplateData {
    let subject = Subject::from_str(&format!("CN={cn},O=Certa Test")).unwrap();
    CertTemplateData::new(subject, key.public_key_to_der().unwrap(), TLS_PROFILE)
}

pub fn requestor() -> RequestorInfo {
    RequestorInfo::ra(NameId::new(1, "ra"))
}

//------------ TestCa --------------------------------------------------------

/// A CA with everything it talks to, all under test control.
pub struct TestCa {
    pub ca: Arc<CertAuthority>,
    pub key: PKey<Private>,
    pub cert: X509,
    pub store: Arc<MemoryCertStore>,
    pub clock: Arc<ManualClock>,
    pub audit: Arc<MemoryAuditSink>,
    pub scheduler: Arc<ManualScheduler>,
    pub inflight: Arc<ConcurrentInFlightRegistry>,
    settings: CaSettings,
    profiles: Vec<StaticProfileConfig>,
}

impl TestCa {
    pub fn builder(name: &str) -> TestCaBuilder {
        TestCaBuilder::new(name)
    }

    /// A master CA with the TLS profile and the given publishers.
    pub fn with_publishers(publishers: Vec<Arc<dyn Publisher>>) -> Self {
        let mut builder = Self::builder("ca1");
        for publisher in publishers {
            builder = builder.publisher(publisher);
        }
        builder.build()
    }

    pub fn issue(&self, cn: &str) -> CertificateInfo {
        self.ca
            .generate_certificate(&template(cn), &requestor(), None, None)
            .unwrap()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn ident(&self) -> &NameId {
        self.ca.ident()
    }

    /// Builds the CA again on the same store, as after a restart.
    pub fn restart(&self) -> Arc<CertAuthority> {
        let name = self.ident().name();
        let signer = SignerPool::build(name, &self.key, None, Some(self.cert.clone()), 2).unwrap();
        let info = CaInfo::new(self.ident().clone(), self.cert.clone(), self.settings.clone()).unwrap();

        let mut builder = CertAuthority::builder(info, Arc::new(signer), self.store.clone())
            .audit_sink(self.audit.clone())
            .inflight(self.inflight.clone())
            .clock(self.clock.clone());
        for profile in &self.profiles {
            builder = builder.profile(Arc::new(StaticCertprofile::build(profile.clone()).unwrap()));
        }
        Arc::new(builder.build().unwrap())
    }

    /// Whether no issuance of this CA holds a subject or key.
    pub fn nothing_in_flight(&self) -> bool {
        self.inflight.len(self.ident().id()) == 0
    }

    /// Runs the job of this CA with the given suffix, e.g. `crl`.
    pub fn run_job(&self, job: &str) -> usize {
        self.scheduler.run(&format!("{}-{job}", self.ca.ident().name()))
    }
}

pub struct TestCaBuilder {
    name: String,
    settings: CaSettings,
    profiles: Vec<StaticProfileConfig>,
    publishers: Vec<Arc<dyn Publisher>>,
    master: bool,
    ca_validity_days: i64,
    indirect_crls: bool,
    clock: Option<Arc<ManualClock>>,
}

impl TestCaBuilder {
    fn new(name: &str) -> Self {
        TestCaBuilder {
            name: name.to_string(),
            settings: CaSettings::default(),
            profiles: vec![StaticProfileConfig::new(1, TLS_PROFILE)],
            publishers: vec![],
            master: true,
            ca_validity_days: 10 * 365,
            indirect_crls: false,
            clock: None,
        }
    }

    pub fn settings(mut self, update: impl FnOnce(&mut CaSettings)) -> Self {
        update(&mut self.settings);
        self
    }

    /// Changes the TLS profile.
    pub fn tls_profile(mut self, update: impl FnOnce(&mut StaticProfileConfig)) -> Self {
        update(&mut self.profiles[0]);
        self
    }

    pub fn profile(mut self, profile: StaticProfileConfig) -> Self {
        self.profiles.push(profile);
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    pub fn master(mut self, master: bool) -> Self {
        self.master = master;
        self
    }

    pub fn ca_validity_days(mut self, days: i64) -> Self {
        self.ca_validity_days = days;
        self
    }

    pub fn indirect_crls(mut self) -> Self {
        self.indirect_crls = true;
        self
    }

    pub fn clock(mut self, clock: Arc<ManualClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> TestCa {
        let clock = self.clock.unwrap_or_else(|| Arc::new(ManualClock::new(start_time())));
        let store = Arc::new(MemoryCertStore::new(clock.clone()));
        let audit = Arc::new(MemoryAuditSink::default());
        let scheduler = Arc::new(ManualScheduler::new());
        let inflight = Arc::new(ConcurrentInFlightRegistry::default());

        let key = new_key();
        let not_before = clock.now() - Duration::days(1);
        let cert = self_signed_ca_cert(&format!("{} Root", self.name), &key, not_before, self.ca_validity_days);

        let signer = SignerPool::build(&self.name, &key, None, Some(cert.clone()), 2).unwrap();
        let info = CaInfo::new(NameId::new(1, self.name.clone()), cert.clone(), self.settings.clone()).unwrap();

        let mut builder = CertAuthority::builder(info, Arc::new(signer), store.clone())
            .audit_sink(audit.clone())
            .inflight(inflight.clone())
            .clock(clock.clone())
            .master(self.master);

        if self.indirect_crls {
            let crl_key = new_key();
            let crl_cert = crl_signer_cert(&cert, &key, &crl_key);
            let crl_signer = SignerPool::build("crl-signer", &crl_key, None, Some(crl_cert), 1).unwrap();
            builder = builder.crl_signer(Arc::new(crl_signer));
        }
        for profile in &self.profiles {
            builder = builder.profile(Arc::new(StaticCertprofile::build(profile.clone()).unwrap()));
        }
        for publisher in self.publishers {
            builder = builder.publisher(publisher);
        }

        let ca = Arc::new(builder.build().unwrap());
        ca.register_jobs(scheduler.as_ref());

        TestCa {
            ca,
            key,
            cert,
            store,
            clock,
            audit,
            scheduler,
            inflight,
            settings: self.settings,
            profiles: self.profiles,
        }
    }
}

//------------ RecordingPublisher --------------------------------------------

/// What a [`RecordingPublisher`] was told.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Published {
    CaAdded,
    CaRevoked(CrlReason),
    CaUnrevoked,
    CertAdded { serial: SerialNumber, revoked: bool },
    CertRevoked(SerialNumber, CrlReason),
    CertUnrevoked(SerialNumber),
    CertRemoved(SerialNumber),
    CrlAdded { crl_number: u64, delta: bool },
}

/// A publisher that remembers every call and can be made to fail.
pub struct RecordingPublisher {
    ident: NameId,
    asynchronous: bool,
    publish_good_certs: bool,
    failing: AtomicBool,
    published: Mutex<Vec<Published>>,
}

impl RecordingPublisher {
    pub fn new(id: u32, name: &str) -> Arc<Self> {
        Self::build(id, name, false, true)
    }

    pub fn asynchronous(id: u32, name: &str) -> Arc<Self> {
        Self::build(id, name, true, true)
    }

    /// A publisher that only wants revoked certificates.
    pub fn revoked_only(id: u32, name: &str) -> Arc<Self> {
        Self::build(id, name, false, false)
    }

    fn build(id: u32, name: &str, asynchronous: bool, publish_good_certs: bool) -> Arc<Self> {
        Arc::new(RecordingPublisher {
            ident: NameId::new(id, name),
            asynchronous,
            publish_good_certs,
            failing: AtomicBool::new(false),
            published: Mutex::new(vec![]),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.published.lock().unwrap().clear();
    }

    /// Serials of the certificates this publisher was given.
    pub fn added_serials(&self) -> Vec<SerialNumber> {
        self.published()
            .into_iter()
            .filter_map(|published| match published {
                Published::CertAdded { serial, .. } => Some(serial),
                _ => None,
            })
            .collect()
    }

    pub fn crls(&self) -> Vec<(u64, bool)> {
        self.published()
            .into_iter()
            .filter_map(|published| match published {
                Published::CrlAdded { crl_number, delta } => Some((crl_number, delta)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, published: Published) -> PublishResult {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublisherError::Unavailable(format!("{} is down", self.ident)));
        }
        self.published.lock().unwrap().push(published);
        Ok(())
    }
}

impl Publisher for RecordingPublisher {
    fn ident(&self) -> &NameId {
        &self.ident
    }

    fn is_asyn(&self) -> bool {
        self.asynchronous
    }

    fn publishes_good_certs(&self) -> bool {
        self.publish_good_certs
    }

    fn is_healthy(&self) -> bool {
        !self.failing.load(Ordering::SeqCst)
    }

    fn ca_added(&self, _ca_cert: &CertWithDbId) -> PublishResult {
        self.record(Published::CaAdded)
    }

    fn ca_revoked(&self, _ca_cert: &CertWithDbId, revocation: &CertRevocationInfo) -> PublishResult {
        self.record(Published::CaRevoked(revocation.reason))
    }

    fn ca_unrevoked(&self, _ca_cert: &CertWithDbId) -> PublishResult {
        self.record(Published::CaUnrevoked)
    }

    fn certificate_added(&self, cert: &CertificateInfo) -> PublishResult {
        self.record(Published::CertAdded {
            serial: cert.serial().clone(),
            revoked: cert.revocation().is_some(),
        })
    }

    fn certificate_revoked(
        &self,
        _ca_cert: &CertWithDbId,
        cert: &CertWithDbId,
        _profile: &NameId,
        revocation: &CertRevocationInfo,
    ) -> PublishResult {
        self.record(Published::CertRevoked(cert.serial().clone(), revocation.reason))
    }

    fn certificate_unrevoked(&self, _ca_cert: &CertWithDbId, cert: &CertWithDbId) -> PublishResult {
        self.record(Published::CertUnrevoked(cert.serial().clone()))
    }

    fn certificate_removed(&self, _ca_cert: &CertWithDbId, cert: &CertWithDbId) -> PublishResult {
        self.record(Published::CertRemoved(cert.serial().clone()))
    }

    fn crl_added(&self, _ca_cert: &CertWithDbId, crl: &CrlInfo) -> PublishResult {
        self.record(Published::CrlAdded {
            crl_number: crl.crl_number,
            delta: crl.is_delta(),
        })
    }
}
