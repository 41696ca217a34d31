//! Revoking, unrevoking and removing certificates, and revoking the CA.

use chrono::{DateTime, Utc};
use log::{debug, info};

use super::CertAuthority;
use crate::commons::CaResult;
use crate::commons::api::{CertRevocationInfo, CertWithDbId, CertWithRevocationInfo, CrlReason};
use crate::commons::error::Error;
use crate::commons::x509::{SerialNumber, truncate_to_seconds};

impl CertAuthority {
    /// Revokes a certificate.
    ///
    /// Returns `None` if the certificate is unknown or already revoked. A
    /// certificate on hold can be revoked for good with another reason.
    pub fn revoke_certificate(
        &self,
        serial: &SerialNumber,
        reason: CrlReason,
        invalidity_time: Option<DateTime<Utc>>,
        msg_id: Option<&str>,
    ) -> CaResult<Option<CertWithRevocationInfo>> {
        let mut event = self.audit_event("revoke_cert", msg_id);
        event.add("serial", serial.to_hex());
        event.add("reason", reason.to_string());
        if let Some(time) = invalidity_time {
            event.add("invalidity_time", time);
        }

        let result = self.revoke_cert(serial, reason, invalidity_time);
        if let Ok(revoked) = &result {
            event.add("changed", revoked.is_some());
        }
        event.finish_with(&result);
        result
    }

    fn revoke_cert(
        &self,
        serial: &SerialNumber,
        reason: CrlReason,
        invalidity_time: Option<DateTime<Utc>>,
    ) -> CaResult<Option<CertWithRevocationInfo>> {
        let ca = self.ident();
        if reason.is_reserved() {
            return Err(Error::not_permitted(format!(
                "reason {reason} is not permitted for certificate {serial}"
            )));
        }
        self.check_not_ca_cert(serial)?;

        let revocation = CertRevocationInfo::new(
            reason,
            truncate_to_seconds(self.clock.now()),
            invalidity_time.map(truncate_to_seconds),
        );
        let Some(revoked) = self
            .store
            .revoke_cert(ca, serial, &revocation, false, self.publish_to_delta())?
        else {
            debug!("Certificate {serial} of CA '{ca}' is unknown or already revoked");
            return Ok(None);
        };

        self.publish_revocation(&revoked);
        info!("Revoked certificate {serial} of CA '{ca}', reason {reason}");
        Ok(Some(revoked))
    }

    /// Turns a hold into a final revocation.
    pub fn revoke_suspended_cert(
        &self,
        serial: &SerialNumber,
        reason: CrlReason,
    ) -> CaResult<Option<CertWithRevocationInfo>> {
        let ca = self.ident();
        let Some(revoked) = self
            .store
            .revoke_suspended_cert(ca, serial, reason, self.publish_to_delta())?
        else {
            return Ok(None);
        };
        self.publish_revocation(&revoked);
        info!("Revoked suspended certificate {serial} of CA '{ca}', reason {reason}");
        Ok(Some(revoked))
    }

    fn publish_revocation(&self, revoked: &CertWithRevocationInfo) {
        let Some(revocation) = &revoked.revocation else {
            return;
        };
        let ca_cert = self.info.cert();
        self.publish_to_all(revoked.cert.cert_id(), "revocation", |publisher| {
            publisher.certificate_revoked(ca_cert, &revoked.cert, &revoked.profile, revocation)
        });
    }

    /// Lifts the revocation of a certificate.
    ///
    /// Only certificates on hold can be unrevoked, unless `force` is set.
    /// Returns `None` if the certificate is unknown or not revoked.
    pub fn unrevoke_certificate(
        &self,
        serial: &SerialNumber,
        force: bool,
        msg_id: Option<&str>,
    ) -> CaResult<Option<CertWithDbId>> {
        let mut event = self.audit_event("unrevoke_cert", msg_id);
        event.add("serial", serial.to_hex());
        event.add("force", force);

        let result = self.unrevoke_cert(serial, force);
        if let Ok(unrevoked) = &result {
            event.add("changed", unrevoked.is_some());
        }
        event.finish_with(&result);
        result
    }

    fn unrevoke_cert(&self, serial: &SerialNumber, force: bool) -> CaResult<Option<CertWithDbId>> {
        let ca = self.ident();
        self.check_not_ca_cert(serial)?;

        let Some(cert) = self
            .store
            .unrevoke_cert(ca, serial, force, self.publish_to_delta())?
        else {
            debug!("Certificate {serial} of CA '{ca}' is unknown or not revoked");
            return Ok(None);
        };

        let ca_cert = self.info.cert();
        self.publish_to_all(cert.cert_id(), "unrevocation", |publisher| {
            publisher.certificate_unrevoked(ca_cert, &cert)
        });
        info!("Unrevoked certificate {serial} of CA '{ca}'");
        Ok(Some(cert))
    }

    /// Deletes a certificate.
    ///
    /// Every publisher must confirm the removal first, otherwise nothing is
    /// deleted. Returns `None` if the certificate is unknown.
    pub fn remove_certificate(&self, serial: &SerialNumber, msg_id: Option<&str>) -> CaResult<Option<CertWithDbId>> {
        let mut event = self.audit_event("remove_cert", msg_id);
        event.add("serial", serial.to_hex());

        let result = self
            .check_not_ca_cert(serial)
            .and_then(|_| self.remove_cert(serial));
        if let Ok(removed) = &result {
            event.add("changed", removed.is_some());
        }
        event.finish_with(&result);
        result
    }

    pub(super) fn remove_cert(&self, serial: &SerialNumber) -> CaResult<Option<CertWithDbId>> {
        let ca = self.ident();
        let Some(stored) = self.store.get_cert_with_revocation_info(ca, serial)? else {
            return Ok(None);
        };

        let ca_cert = self.info.cert();
        for publisher in &self.publishers {
            publisher.certificate_removed(ca_cert, &stored.cert).map_err(|e| {
                Error::system_failure(format!(
                    "publisher '{}' could not remove certificate {serial} of CA '{ca}': {e}",
                    publisher.ident()
                ))
            })?;
        }

        self.store.remove_cert(ca, serial)?;
        info!("Removed certificate {serial} of CA '{ca}'");
        Ok(Some(stored.cert))
    }

    fn check_not_ca_cert(&self, serial: &SerialNumber) -> CaResult<()> {
        if serial == self.info.serial() {
            Err(Error::not_permitted(format!(
                "certificate {serial} is the certificate of CA '{}'",
                self.ident()
            )))
        } else {
            Ok(())
        }
    }

    /// Revokes the CA itself.
    pub fn revoke_ca(
        &self,
        reason: CrlReason,
        invalidity_time: Option<DateTime<Utc>>,
        msg_id: Option<&str>,
    ) -> CaResult<()> {
        let mut event = self.audit_event("revoke_ca", msg_id);
        event.add("reason", reason.to_string());

        let result = self.revoke_self(reason, invalidity_time);
        event.finish_with(&result);
        result
    }

    fn revoke_self(&self, reason: CrlReason, invalidity_time: Option<DateTime<Utc>>) -> CaResult<()> {
        let ca = self.ident();
        if reason == CrlReason::RemoveFromCrl {
            return Err(Error::not_permitted(format!("CA '{ca}' cannot be revoked with reason {reason}")));
        }

        let revocation = CertRevocationInfo::new(
            reason,
            truncate_to_seconds(self.clock.now()),
            invalidity_time.map(truncate_to_seconds),
        );
        if self.info.is_self_signed() {
            self.store
                .revoke_cert(ca, self.info.serial(), &revocation, true, self.publish_to_delta())?;
        }
        self.info.set_revocation(Some(revocation.clone()));

        let ca_cert = self.info.cert();
        for publisher in &self.publishers {
            publisher.ca_revoked(ca_cert, &revocation).map_err(|e| {
                Error::system_failure(format!("publisher '{}' could not revoke CA '{ca}': {e}", publisher.ident()))
            })?;
        }
        info!("CA '{ca}' revoked, reason {reason}");
        Ok(())
    }

    /// Lifts the revocation of the CA.
    pub fn unrevoke_ca(&self, msg_id: Option<&str>) -> CaResult<()> {
        let event = self.audit_event("unrevoke_ca", msg_id);
        let result = self.unrevoke_self();
        event.finish_with(&result);
        result
    }

    fn unrevoke_self(&self) -> CaResult<()> {
        let ca = self.ident();
        if self.info.revocation().is_none() {
            debug!("CA '{ca}' is not revoked");
            return Ok(());
        }
        if self.info.is_self_signed() {
            self.store
                .unrevoke_cert(ca, self.info.serial(), true, self.publish_to_delta())?;
        }
        self.info.set_revocation(None);

        let ca_cert = self.info.cert();
        for publisher in &self.publishers {
            publisher.ca_unrevoked(ca_cert).map_err(|e| {
                Error::system_failure(format!(
                    "publisher '{}' could not unrevoke CA '{ca}': {e}",
                    publisher.ident()
                ))
            })?;
        }
        info!("CA '{ca}' unrevoked");
        Ok(())
    }
}
