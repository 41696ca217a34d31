//! Telling publishers about changes, now or later through the queue.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

use super::CertAuthority;
use crate::commons::CaResult;
use crate::commons::api::{CaStatus, CertificateInfo};
use crate::commons::error::Error;
use crate::constants::{PUBLISH_QUEUE_PAGE_SIZE, STORE_PAGE_SIZE};
use crate::server::publisher::{PublishResult, Publisher};

//------------ PublishOutcome ------------------------------------------------

/// What happened to a new certificate on its way to the publishers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PublishOutcome {
    /// A replayed request, nothing was stored.
    AlreadyIssued,

    /// Stored and seen by every publisher.
    Published,

    /// Stored, some publishers will get it from the queue.
    Queued,

    /// The certificate could not be stored.
    StoreFailed,

    /// Stored, but a publisher neither got it nor has it queued.
    QueueFailed,
}

//------------ InactiveGuard -------------------------------------------------

/// Keeps a CA inactive while it exists.
struct InactiveGuard<'a> {
    ca: &'a CertAuthority,
    previous: CaStatus,
}

impl<'a> InactiveGuard<'a> {
    fn new(ca: &'a CertAuthority) -> Self {
        let previous = ca.info.set_status(CaStatus::Inactive);
        InactiveGuard { ca, previous }
    }
}

impl Drop for InactiveGuard<'_> {
    fn drop(&mut self) {
        self.ca.info.set_status(self.previous);
    }
}

//------------ CertAuthority: publishing -------------------------------------

impl CertAuthority {
    /// Stores a new certificate and hands it to the publishers.
    pub(super) fn publish_certificate(&self, cert: &mut CertificateInfo) -> PublishOutcome {
        if cert.is_already_issued() {
            return PublishOutcome::AlreadyIssued;
        }

        let cert_id = match self.store.add_cert(cert) {
            Ok(cert_id) => cert_id,
            Err(e) => {
                error!(
                    "Could not save certificate {} of CA '{}': {e}",
                    cert.serial(),
                    self.ident()
                );
                return PublishOutcome::StoreFailed;
            }
        };
        cert.cert_mut().set_cert_id(cert_id);

        let cert: &CertificateInfo = cert;
        self.publish_to_all(Some(cert_id), "certificate", |publisher| {
            publisher.certificate_added(cert)
        })
    }

    /// Calls every synchronous publisher and queues the change for the
    /// asynchronous ones and for those that failed.
    pub(super) fn publish_to_all(
        &self,
        cert_id: Option<u64>,
        what: &str,
        mut deliver: impl FnMut(&dyn Publisher) -> PublishResult,
    ) -> PublishOutcome {
        let ca = self.ident();
        let mut outcome = PublishOutcome::Published;

        for publisher in &self.publishers {
            if !publisher.is_asyn() {
                match deliver(publisher.as_ref()) {
                    Ok(()) => continue,
                    Err(e) => warn!(
                        "Publisher '{}' could not publish {what} of CA '{ca}', queueing: {e}",
                        publisher.ident()
                    ),
                }
            }

            let Some(cert_id) = cert_id else {
                error!(
                    "Cannot queue {what} of CA '{ca}' for publisher '{}' without a certificate id",
                    publisher.ident()
                );
                outcome = PublishOutcome::QueueFailed;
                continue;
            };
            match self.store.add_to_publish_queue(publisher.ident(), cert_id, ca) {
                Ok(()) => {
                    if outcome == PublishOutcome::Published {
                        outcome = PublishOutcome::Queued;
                    }
                }
                Err(e) => {
                    error!(
                        "Could not queue certificate {cert_id} of CA '{ca}' for publisher '{}': {e}",
                        publisher.ident()
                    );
                    outcome = PublishOutcome::QueueFailed;
                }
            }
        }
        outcome
    }

    /// Delivers queued certificates. Returns whether every queue is empty.
    pub fn publish_certs_in_queue(&self) -> CaResult<bool> {
        let mut all_published = true;
        for publisher in &self.publishers {
            if !self.publish_queue_of(publisher.as_ref())? {
                all_published = false;
            }
        }
        Ok(all_published)
    }

    fn publish_queue_of(&self, publisher: &dyn Publisher) -> CaResult<bool> {
        let ca = self.ident();
        loop {
            let cert_ids = self
                .store
                .get_publish_queue_entries(ca, publisher.ident(), PUBLISH_QUEUE_PAGE_SIZE)?;
            if cert_ids.is_empty() {
                return Ok(true);
            }

            for cert_id in cert_ids {
                match self.store.get_cert_for_id(cert_id)? {
                    Some(cert) => {
                        if let Err(e) = publisher.certificate_added(&cert) {
                            warn!(
                                "Publisher '{}' still fails for certificate {} of CA '{ca}': {e}",
                                publisher.ident(),
                                cert.serial()
                            );
                            return Ok(false);
                        }
                        debug!(
                            "Published queued certificate {} of CA '{ca}' to '{}'",
                            cert.serial(),
                            publisher.ident()
                        );
                    }
                    None => {
                        warn!("Dropping queue entry for unknown certificate {cert_id} of CA '{ca}'");
                    }
                }
                self.store.remove_from_publish_queue(publisher.ident(), cert_id)?;
            }
        }
    }

    /// Clears the publish queue of the named publishers, or of all.
    pub fn clear_publish_queue(&self, publishers: Option<&[String]>) -> CaResult<()> {
        let ca = self.ident();
        match publishers {
            None => self.store.clear_publish_queue(ca, None)?,
            Some(names) => {
                for publisher in self.select_publishers(Some(names))? {
                    self.store.clear_publish_queue(ca, Some(publisher.ident()))?;
                }
            }
        }
        info!("Cleared publish queue of CA '{ca}'");
        Ok(())
    }

    fn select_publishers(&self, names: Option<&[String]>) -> CaResult<Vec<Arc<dyn Publisher>>> {
        let Some(names) = names else {
            return Ok(self.publishers.clone());
        };
        names
            .iter()
            .map(|name| {
                self.publishers
                    .iter()
                    .find(|publisher| publisher.ident().name() == name)
                    .cloned()
                    .ok_or_else(|| {
                        Error::bad_request(format!("unknown publisher '{name}' for CA '{}'", self.ident()))
                    })
            })
            .collect()
    }

    /// Pushes all certificates of the CA to the named publishers again.
    ///
    /// The CA does not issue while this runs. Returns whether every
    /// certificate reached every publisher.
    pub async fn republish_certificates(
        self: &Arc<Self>,
        publishers: Option<Vec<String>>,
        num_workers: usize,
    ) -> CaResult<bool> {
        let mut event = self.audit_event("republish", None);
        if let Some(names) = &publishers {
            event.add("publishers", names);
        }
        event.add("num_workers", num_workers);

        let result = self.republish(publishers.as_deref(), num_workers).await;
        if let Ok(all_published) = &result {
            event.add("all_published", all_published);
        }
        event.finish_with(&result);
        result
    }

    async fn republish(self: &Arc<Self>, names: Option<&[String]>, num_workers: usize) -> CaResult<bool> {
        let ca = self.ident();
        let publishers = self.select_publishers(names)?;
        if publishers.is_empty() {
            return Ok(true);
        }

        let _inactive = InactiveGuard::new(self);

        for publisher in &publishers {
            self.store.clear_publish_queue(ca, Some(publisher.ident()))?;
        }

        let ca_cert = self.info.cert();
        let revocation = self.info.revocation();
        for publisher in &publishers {
            publisher.ca_added(ca_cert).map_err(|e| {
                Error::system_failure(format!("publisher '{}' could not add CA '{ca}': {e}", publisher.ident()))
            })?;
            if let Some(revocation) = &revocation {
                publisher.ca_revoked(ca_cert, revocation).map_err(|e| {
                    Error::system_failure(format!(
                        "publisher '{}' could not revoke CA '{ca}': {e}",
                        publisher.ident()
                    ))
                })?;
            }
        }

        let only_revoked = !publishers.iter().any(|publisher| publisher.publishes_good_certs());
        let publishers = Arc::new(publishers);
        let semaphore = Arc::new(Semaphore::new(num_workers.max(1)));
        let mut tasks = JoinSet::new();
        let mut all_published = true;

        let mut start_id = 0;
        loop {
            let cert_ids = self.store.get_cert_ids(ca, start_id, STORE_PAGE_SIZE, only_revoked)?;
            let Some(max_id) = cert_ids.iter().max().copied() else {
                break;
            };
            start_id = max_id + 1;

            for cert_id in cert_ids {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::system_failure(format!("republish worker pool closed: {e}")))?;
                let authority = self.clone();
                let publishers = publishers.clone();
                tasks.spawn_blocking(move || {
                    let _permit = permit;
                    authority.republish_cert(cert_id, &publishers)
                });
            }

            while let Some(res) = tasks.try_join_next() {
                all_published &= republish_succeeded(res);
            }
        }

        while let Some(res) = tasks.join_next().await {
            all_published &= republish_succeeded(res);
        }

        info!("Republished certificates of CA '{ca}', complete: {all_published}");
        Ok(all_published)
    }

    fn republish_cert(&self, cert_id: u64, publishers: &[Arc<dyn Publisher>]) -> bool {
        let cert = match self.store.get_cert_for_id(cert_id) {
            Ok(Some(cert)) => cert,
            Ok(None) => return true,
            Err(e) => {
                warn!("Could not read certificate {cert_id} of CA '{}': {e}", self.ident());
                return false;
            }
        };

        let mut published = true;
        for publisher in publishers {
            if cert.revocation().is_none() && !publisher.publishes_good_certs() {
                continue;
            }
            if let Err(e) = publisher.certificate_added(&cert) {
                warn!(
                    "Publisher '{}' could not republish certificate {}: {e}",
                    publisher.ident(),
                    cert.serial()
                );
                published = false;
            }
        }
        published
    }
}

fn republish_succeeded(res: Result<bool, JoinError>) -> bool {
    match res {
        Ok(published) => published,
        Err(e) => {
            error!("Republish worker failed: {e}");
            false
        }
    }
}
