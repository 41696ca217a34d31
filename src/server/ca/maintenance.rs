//! Housekeeping jobs of a CA.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::Rng;

use super::CertAuthority;
use crate::commons::CaResult;
use crate::commons::api::RevokeSuspendedControl;
use crate::constants::{
    SCHEDULER_CRL_INITIAL_SECONDS, SCHEDULER_CRL_PERIOD, SCHEDULER_EXPIRED_INITIAL_MINUTES, SCHEDULER_EXPIRED_PERIOD,
    SCHEDULER_JITTER, SCHEDULER_PUBLISH_QUEUE_PERIOD, SCHEDULER_SUSPENDED_PERIOD, STORE_PAGE_SIZE,
};
use crate::server::scheduler::{Job, Scheduler};

impl CertAuthority {
    /// Removes certificates that expired longer ago than the CA keeps them.
    ///
    /// Does nothing unless this is the master instance and expired
    /// certificates are not kept forever. Returns the number removed.
    pub fn remove_expired_certs(&self) -> CaResult<usize> {
        let keep_days = self.info.settings().keep_expired_cert_days;
        if keep_days < 0 || !self.master {
            return Ok(0);
        }
        let Some(_running) = self.expired_flag.try_run() else {
            debug!("Removal of expired certificates of CA '{}' is running, skipping", self.ident());
            return Ok(0);
        };

        let mut event = self.audit_event("remove_expired_certs", None);
        let result = self.purge_expired(keep_days);
        if let Ok(removed) = &result {
            event.add("removed", removed);
        }
        event.finish_with(&result);
        result
    }

    fn purge_expired(&self, keep_days: i32) -> CaResult<usize> {
        let ca = self.ident();
        let Some(expired_at) = self
            .clock
            .now()
            .checked_sub_signed(chrono::Duration::days(keep_days as i64 + 1))
        else {
            return Ok(0);
        };

        let mut removed = 0;
        loop {
            let serials = self.store.get_expired_serial_numbers(ca, expired_at, STORE_PAGE_SIZE)?;
            let last_page = serials.len() < STORE_PAGE_SIZE;

            let mut progress = false;
            for serial in serials {
                if &serial == self.info.serial() {
                    continue;
                }
                match self.remove_cert(&serial) {
                    Ok(Some(_)) => {
                        removed += 1;
                        progress = true;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Could not remove expired certificate {serial} of CA '{ca}': {e}"),
                }
            }
            if last_page || !progress {
                break;
            }
        }

        if removed > 0 {
            info!("Removed {removed} expired certificates of CA '{ca}'");
        }
        Ok(removed)
    }

    /// Revokes certificates that stayed on hold for too long.
    ///
    /// Does nothing unless this is the master instance and the CA has a
    /// control for suspended certificates. Returns the number revoked.
    pub fn revoke_suspended_certs(&self) -> CaResult<usize> {
        let Some(control) = self.info.settings().revoke_suspended.clone() else {
            return Ok(0);
        };
        if !self.master {
            return Ok(0);
        }
        let Some(_running) = self.suspended_flag.try_run() else {
            debug!("Revocation of suspended certificates of CA '{}' is running, skipping", self.ident());
            return Ok(0);
        };

        let mut event = self.audit_event("revoke_suspended_certs", None);
        event.add("reason", control.target_reason.to_string());

        let result = self.revoke_long_suspended(&control);
        if let Ok(revoked) = &result {
            event.add("revoked", revoked);
            if *revoked > 0 {
                info!("Revoked {revoked} suspended certificates of CA '{}'", self.ident());
            }
        }
        event.finish_with(&result);
        result
    }

    fn revoke_long_suspended(&self, control: &RevokeSuspendedControl) -> CaResult<usize> {
        let ca = self.ident();
        let latest_last_update = control.unchanged_since.subtract_from(self.clock.now());

        let mut revoked = 0;
        loop {
            let serials = self
                .store
                .get_suspended_cert_serials(ca, latest_last_update, STORE_PAGE_SIZE)?;
            let last_page = serials.len() < STORE_PAGE_SIZE;

            let mut progress = false;
            for serial in serials {
                match self.revoke_suspended_cert(&serial, control.target_reason) {
                    Ok(Some(_)) => {
                        revoked += 1;
                        progress = true;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Could not revoke suspended certificate {serial} of CA '{ca}': {e}"),
                }
            }
            if last_page || !progress {
                break;
            }
        }
        Ok(revoked)
    }

    /// Registers the background jobs of this CA with the scheduler.
    ///
    /// Jobs only hold a weak reference, they stop doing anything once the
    /// CA is dropped. [`CertAuthority::shutdown`] cancels them.
    pub fn register_jobs(self: &Arc<Self>, scheduler: &dyn Scheduler) {
        let ca = self.ident().name();
        let mut rng = rand::rng();
        let mut jobs = vec![];

        let interval_crls = self
            .crl_signer
            .as_ref()
            .map(|signer| signer.control().is_interval())
            .unwrap_or(false);
        if interval_crls {
            let delay = Duration::from_secs(SCHEDULER_CRL_INITIAL_SECONDS + rng.random_range(0..SCHEDULER_JITTER));
            jobs.push(scheduler.schedule(
                &format!("{ca}-crl"),
                delay,
                SCHEDULER_CRL_PERIOD,
                self.job("crl", |ca| ca.gen_crl_on_schedule()),
            ));
        }

        if self.master {
            if self.info.settings().keep_expired_cert_days >= 0 {
                let minutes = SCHEDULER_EXPIRED_INITIAL_MINUTES + rng.random_range(0..SCHEDULER_JITTER);
                jobs.push(scheduler.schedule(
                    &format!("{ca}-remove-expired"),
                    Duration::from_secs(minutes * 60),
                    SCHEDULER_EXPIRED_PERIOD,
                    self.job("remove-expired", |ca| ca.remove_expired_certs()),
                ));
            }

            if self.info.settings().revoke_suspended.is_some() {
                let minutes = rng.random_range(0..SCHEDULER_JITTER);
                jobs.push(scheduler.schedule(
                    &format!("{ca}-revoke-suspended"),
                    Duration::from_secs(minutes * 60),
                    SCHEDULER_SUSPENDED_PERIOD,
                    self.job("revoke-suspended", |ca| ca.revoke_suspended_certs()),
                ));
            }

            jobs.push(scheduler.schedule(
                &format!("{ca}-publish-queue"),
                SCHEDULER_PUBLISH_QUEUE_PERIOD,
                SCHEDULER_PUBLISH_QUEUE_PERIOD,
                self.job("publish-queue", |ca| ca.publish_certs_in_queue()),
            ));
        }

        debug!("Registered {} background jobs for CA '{ca}'", jobs.len());
        self.jobs.lock().expect("poisoned lock").extend(jobs);
    }

    fn job<T>(
        self: &Arc<Self>,
        name: &'static str,
        run: impl Fn(&CertAuthority) -> CaResult<T> + Send + Sync + 'static,
    ) -> Job {
        let ca = Arc::downgrade(self);
        Arc::new(move || {
            let Some(ca) = ca.upgrade() else {
                return;
            };
            if let Err(e) = run(&ca) {
                error!("Background job '{name}' of CA '{}' failed: {e}", ca.ident());
            }
        })
    }
}
