//! Building CAs from the configuration and managing them by name.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::commons::CaResult;
use crate::commons::api::{
    CertListInfo, CertTemplateData, CertWithDbId, CertWithRevocationInfo, CertificateInfo, CrlInfo, CrlReason,
    HealthCheckResult, NameId, RequestType, RequestorInfo,
};
use crate::commons::clock::Clock;
use crate::commons::crypto::SignerPool;
use crate::commons::error::Error;
use crate::commons::x509::SerialNumber;
use crate::config::{CaConfig, Config, ConfigError};
use crate::constants::CERTA_SERVER_APP;
use crate::server::audit::AuditSink;
use crate::server::ca::{CaInfo, CertAuthority, ConcurrentInFlightRegistry, InFlightRegistry};
use crate::server::profile::{Certprofile, StaticCertprofile};
use crate::server::publisher::Publisher;
use crate::server::scheduler::Scheduler;
use crate::server::store::{CertListFilter, CertStore};

//------------ CaManager -----------------------------------------------------

/// Owns the running CAs and gives access to them by name.
pub struct CaManager {
    cas: BTreeMap<String, Arc<CertAuthority>>,

    // Shared by all CAs.
    store: Arc<dyn CertStore>,
    inflight: Arc<dyn InFlightRegistry>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    master: bool,
}

impl CaManager {
    /// Creates a manager without CAs.
    pub fn new(
        store: Arc<dyn CertStore>,
        scheduler: Arc<dyn Scheduler>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        master: bool,
    ) -> Self {
        CaManager {
            cas: BTreeMap::new(),
            store,
            inflight: Arc::new(ConcurrentInFlightRegistry::default()),
            audit,
            clock,
            scheduler,
            master,
        }
    }

    /// Builds all CAs of the configuration and starts their jobs.
    pub fn build(
        config: &Config,
        store: Arc<dyn CertStore>,
        scheduler: Arc<dyn Scheduler>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> CaResult<Self> {
        let mut manager = Self::new(store, scheduler, audit, clock, config.master);

        let mut profiles: HashMap<&str, Arc<dyn Certprofile>> = HashMap::new();
        for profile in &config.profiles {
            profiles.insert(&profile.name, Arc::new(StaticCertprofile::build(profile.clone())?));
        }
        let publishers: HashMap<&str, Arc<dyn Publisher>> = config
            .publishers
            .iter()
            .map(|publisher| (publisher.name.as_str(), Arc::from(publisher.build())))
            .collect();

        for ca_config in &config.cas {
            let ca = manager.build_ca(ca_config, &profiles, &publishers)?;
            manager.add_ca(ca)?;
        }
        info!("{CERTA_SERVER_APP} started with {} CAs", manager.cas.len());
        Ok(manager)
    }

    fn build_ca(
        &self,
        config: &CaConfig,
        profiles: &HashMap<&str, Arc<dyn Certprofile>>,
        publishers: &HashMap<&str, Arc<dyn Publisher>>,
    ) -> CaResult<CertAuthority> {
        let ca = &config.name;
        let config_err = |e: ConfigError| Error::system_failure(format!("cannot load CA '{ca}': {e}"));

        let cert = config.load_cert().map_err(config_err)?;
        let key = config.load_key().map_err(config_err)?;
        let signer = SignerPool::build(
            ca,
            &key,
            config.signature_algorithm,
            Some(cert.clone()),
            config.signer_pool_size,
        )?;

        let info = CaInfo::new(NameId::new(config.id, ca.clone()), cert, config.settings.clone())?;
        let mut builder = CertAuthority::builder(info, Arc::new(signer), self.store.clone())
            .inflight(self.inflight.clone())
            .audit_sink(self.audit.clone())
            .clock(self.clock.clone())
            .master(self.master);

        if let Some((crl_key, crl_cert)) = config.load_crl_signer().map_err(config_err)? {
            let crl_signer = SignerPool::build(
                &format!("{ca}-crl"),
                &crl_key,
                None,
                Some(crl_cert),
                config.signer_pool_size,
            )?;
            builder = builder.crl_signer(Arc::new(crl_signer));
        }

        for name in &config.profiles {
            let profile = profiles.get(name.as_str()).ok_or_else(|| Error::unknown_profile(name))?;
            builder = builder.profile(profile.clone());
        }
        for name in &config.publishers {
            let publisher = publishers
                .get(name.as_str())
                .ok_or_else(|| Error::bad_request(format!("unknown publisher '{name}' for CA '{ca}'")))?;
            builder = builder.publisher(publisher.clone());
        }

        builder.build()
    }

    /// Takes over a CA: announces it to its publishers and starts its jobs.
    pub fn add_ca(&mut self, ca: CertAuthority) -> CaResult<Arc<CertAuthority>> {
        let name = ca.ident().name().to_string();
        if self.cas.contains_key(&name) {
            return Err(Error::bad_request(format!("CA '{name}' already exists")));
        }

        let ca = Arc::new(ca);
        if self.master {
            announce_ca(&ca);
        }
        ca.register_jobs(self.scheduler.as_ref());

        info!("Started CA '{name}'");
        self.cas.insert(name, ca.clone());
        Ok(ca)
    }

    pub fn ca_names(&self) -> Vec<&str> {
        self.cas.keys().map(String::as_str).collect()
    }

    pub fn get_ca(&self, name: &str) -> CaResult<Arc<CertAuthority>> {
        self.cas
            .get(name)
            .cloned()
            .ok_or_else(|| Error::bad_request(format!("unknown CA '{name}'")))
    }

    pub fn generate_certificates(
        &self,
        ca: &str,
        templates: &[CertTemplateData],
        requestor: &RequestorInfo,
        key_update: bool,
        req_type: Option<RequestType>,
        transaction_id: Option<&str>,
    ) -> CaResult<Vec<CertificateInfo>> {
        self.get_ca(ca)?
            .generate_certificates(templates, requestor, key_update, req_type, transaction_id)
    }

    pub fn gen_crl_on_demand(&self, ca: &str, msg_id: Option<&str>) -> CaResult<CrlInfo> {
        self.get_ca(ca)?.gen_crl_on_demand(msg_id)
    }

    pub fn get_current_crl(&self, ca: &str) -> CaResult<Option<CrlInfo>> {
        self.get_ca(ca)?.get_current_crl()
    }

    pub fn revoke_certificate(
        &self,
        ca: &str,
        serial: &SerialNumber,
        reason: CrlReason,
        invalidity_time: Option<DateTime<Utc>>,
        msg_id: Option<&str>,
    ) -> CaResult<Option<CertWithRevocationInfo>> {
        self.get_ca(ca)?
            .revoke_certificate(serial, reason, invalidity_time, msg_id)
    }

    pub fn unrevoke_certificate(
        &self,
        ca: &str,
        serial: &SerialNumber,
        force: bool,
        msg_id: Option<&str>,
    ) -> CaResult<Option<CertWithDbId>> {
        self.get_ca(ca)?.unrevoke_certificate(serial, force, msg_id)
    }

    pub fn remove_certificate(
        &self,
        ca: &str,
        serial: &SerialNumber,
        msg_id: Option<&str>,
    ) -> CaResult<Option<CertWithDbId>> {
        self.get_ca(ca)?.remove_certificate(serial, msg_id)
    }

    pub fn list_certificates(&self, ca: &str, filter: &CertListFilter) -> CaResult<Vec<CertListInfo>> {
        self.get_ca(ca)?.list_certificates(filter)
    }

    pub async fn republish_certificates(
        &self,
        ca: &str,
        publishers: Option<Vec<String>>,
        num_workers: usize,
    ) -> CaResult<bool> {
        self.get_ca(ca)?
            .republish_certificates(publishers, num_workers)
            .await
    }

    pub fn clear_publish_queue(&self, ca: &str, publishers: Option<&[String]>) -> CaResult<()> {
        self.get_ca(ca)?.clear_publish_queue(publishers)
    }

    /// The health of every CA.
    pub fn health_check(&self) -> HealthCheckResult {
        let cas = self.cas.values().map(|ca| ca.health_check()).collect();
        HealthCheckResult::with_children(CERTA_SERVER_APP, cas)
    }

    /// Stops the background jobs of every CA, then waits up to `grace` for
    /// runs that are still going.
    pub async fn shutdown(&self, grace: Duration) {
        for ca in self.cas.values() {
            ca.shutdown();
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let busy: Vec<&str> = self
                .cas
                .values()
                .filter(|ca| ca.is_busy())
                .map(|ca| ca.ident().name())
                .collect();
            if busy.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("Shutting down while CAs {} are still busy", busy.join(", "));
                break;
            }
            debug!("Waiting for CAs {} to finish", busy.join(", "));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!("All CAs stopped");
    }
}

/// Tells every publisher of the CA that the CA exists, and whether it
/// is revoked.
fn announce_ca(ca: &CertAuthority) {
    let ca_cert = ca.info().cert();
    let revocation = ca.info().revocation();
    for publisher in ca.publishers() {
        let result = publisher.ca_added(ca_cert).and_then(|_| match &revocation {
            Some(revocation) => publisher.ca_revoked(ca_cert, revocation),
            None => Ok(()),
        });
        if let Err(e) = result {
            warn!(
                "Publisher '{}' could not add CA '{}': {e}",
                publisher.ident(),
                ca.ident()
            );
        }
    }
}
