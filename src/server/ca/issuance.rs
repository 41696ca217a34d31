//! Turning certificate templates into certificates.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use openssl::asn1::{Asn1Object, Asn1OctetString};
use openssl::x509::{X509, X509Builder, X509Extension};

use super::inflight::{FingerprintKind, InFlightGuard};
use super::{CertAuthority, PublishOutcome};
use crate::commons::CaResult;
use crate::commons::api::{
    CaStatus, CertStatus, CertTemplateData, CertWithDbId, CertificateInfo, RequestType, RequestedExtension,
    RequestorInfo, ValidityMode,
};
use crate::commons::crypto::PublicKeyInfo;
use crate::commons::error::Error;
use crate::commons::x509::{
    SerialNumber, Subject, end_of_previous_day, max_cert_time, next_midnight, to_asn1_time, truncate_to_seconds,
};
use crate::constants::{MAX_SERIAL_NUMBER_INCREMENTS, WARN_NOT_AFTER_EXCEEDS_CA, WARN_NOT_AFTER_MODIFIED};
use crate::server::profile::{Certprofile, ExtensionContext, SubjectInfo};

//------------ GrantedCertTemplate -------------------------------------------

/// What will be certified for one template.
struct GrantedCertTemplate {
    profile: Arc<dyn Certprofile>,
    requested_subject: Subject,
    granted_subject: Subject,
    public_key: PublicKeyInfo,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    extensions: Vec<RequestedExtension>,
    warnings: Vec<String>,
}

impl GrantedCertTemplate {
    fn warning(&self) -> Option<String> {
        if self.warnings.is_empty() {
            None
        } else {
            Some(self.warnings.join(", "))
        }
    }
}

fn add_warning(warnings: &mut Vec<String>, warning: &str) {
    if !warnings.iter().any(|w| w == warning) {
        warnings.push(warning.to_string());
    }
}

//------------ CertAuthority: issuance ---------------------------------------

impl CertAuthority {
    /// Issues a single certificate.
    pub fn generate_certificate(
        &self,
        template: &CertTemplateData,
        requestor: &RequestorInfo,
        req_type: Option<RequestType>,
        transaction_id: Option<&str>,
    ) -> CaResult<CertificateInfo> {
        let mut certs =
            self.generate_certificates(std::slice::from_ref(template), requestor, false, req_type, transaction_id)?;
        certs
            .pop()
            .ok_or_else(|| Error::system_failure("no certificate generated"))
    }

    /// Issues a certificate for every template, or none at all.
    ///
    /// With `key_update` set, every subject must already have a good
    /// certificate. If a template fails, the certificates issued for the
    /// templates before it are removed again and the error names the index
    /// of the failed template.
    pub fn generate_certificates(
        &self,
        templates: &[CertTemplateData],
        requestor: &RequestorInfo,
        key_update: bool,
        req_type: Option<RequestType>,
        transaction_id: Option<&str>,
    ) -> CaResult<Vec<CertificateInfo>> {
        let mut event = self.audit_event("gen_cert", transaction_id);
        event.add("requestor", requestor.ident().name());
        event.add("key_update", key_update);
        event.add("num_templates", templates.len());
        if let Some(req_type) = req_type {
            event.add("req_type", req_type.to_string());
        }

        let result = if templates.is_empty() {
            Err(Error::bad_request("no certificate template given"))
        } else {
            self.issue(templates, requestor, key_update, req_type, transaction_id)
        };

        if let Ok(certs) = &result {
            let serials: Vec<String> = certs.iter().map(|cert| cert.serial().to_hex()).collect();
            event.add("serials", serials);
        }
        event.finish_with(&result);
        result
    }

    fn issue(
        &self,
        templates: &[CertTemplateData],
        requestor: &RequestorInfo,
        key_update: bool,
        req_type: Option<RequestType>,
        transaction_id: Option<&str>,
    ) -> CaResult<Vec<CertificateInfo>> {
        let batch = templates.len() > 1;
        let tag = |index: usize, e: Error| if batch { e.in_batch(index) } else { e };

        let mut grants = Vec::with_capacity(templates.len());
        for (index, template) in templates.iter().enumerate() {
            let grant = self
                .create_grant(template, requestor, key_update)
                .map_err(|e| tag(index, e))?;
            grants.push(grant);
        }

        let mut issued: Vec<CertificateInfo> = Vec::with_capacity(grants.len());
        for (index, grant) in grants.into_iter().enumerate() {
            match self.generate_from_grant(grant, requestor, req_type, transaction_id) {
                Ok(cert) => issued.push(cert),
                Err(e) => {
                    self.roll_back(&issued);
                    return Err(tag(index, e));
                }
            }
        }
        Ok(issued)
    }

    /// Decides what to certify for a template, without touching any state.
    fn create_grant(
        &self,
        template: &CertTemplateData,
        requestor: &RequestorInfo,
        key_update: bool,
    ) -> CaResult<GrantedCertTemplate> {
        let ca = self.ident();
        if self.info.revocation().is_some() {
            return Err(Error::not_permitted(format!("CA '{ca}' is revoked")));
        }
        if self.status() == CaStatus::Inactive {
            return Err(Error::unavailable(format!("CA '{ca}' is inactive")));
        }

        let profile = self.profile(template.profile())?;
        if !profile.accepts_signature_algorithm(self.signer.algorithm()) {
            return Err(Error::system_failure(format!(
                "CA '{ca}' has no signer with an algorithm accepted by certprofile '{}'",
                template.profile()
            )));
        }
        if profile.is_only_for_ra() && !requestor.is_ra() {
            return Err(Error::not_permitted(format!(
                "certprofile '{}' may only be used by an RA",
                template.profile()
            )));
        }

        let mut requested_subject = template.subject().clone();
        requested_subject.remove_empty_rdns();
        if requested_subject.has_serial_number() && !profile.is_serial_number_in_req_permitted() {
            return Err(Error::bad_cert_template(
                "subject must not contain a SerialNumber RDN",
            ));
        }

        let now = truncate_to_seconds(self.clock.now());
        let not_before = self.grant_not_before(profile.as_ref(), template.not_before(), now);
        if not_before > self.info.no_new_certificate_after() {
            return Err(Error::not_permitted(format!(
                "notBefore {not_before} is after the last issuance time {} of CA '{ca}'",
                self.info.no_new_certificate_after()
            )));
        }

        let public_key = PublicKeyInfo::from_der(template.public_key())
            .map_err(|e| Error::bad_cert_template(format!("invalid public key: {e}")))?;
        profile.check_public_key(&public_key)?;
        if public_key.is_roca_vulnerable() {
            return Err(Error::weak_public_key("RSA key is vulnerable to ROCA"));
        }

        let SubjectInfo { granted, warning } = profile.get_subject(&requested_subject)?;
        if granted.is_empty() {
            return Err(Error::bad_cert_template("granted subject is empty"));
        }
        if granted.canonicalize() == self.info.canonical_subject() {
            return Err(Error::already_issued(format!(
                "subject '{granted}' is the subject of CA '{ca}'"
            )));
        }

        if key_update {
            match self.store.get_cert_status_for_subject(ca, &granted)? {
                CertStatus::Good => {}
                CertStatus::Revoked => {
                    return Err(Error::cert_revoked(format!("certificate for '{granted}' is revoked")));
                }
                CertStatus::Unknown => {
                    return Err(Error::unknown_cert(format!("no certificate for '{granted}'")));
                }
            }
        } else {
            let duplicate_key_permitted =
                self.info.settings().duplicate_key_permitted && profile.is_duplicate_key_permitted();
            if !duplicate_key_permitted && self.store.is_cert_for_key_issued(ca, public_key.fingerprint())? {
                return Err(Error::already_issued("certificate for the public key already issued"));
            }
        }

        let mut warnings = vec![];
        if let Some(warning) = warning {
            warnings.push(warning);
        }
        let not_after = self.grant_not_after(profile.as_ref(), template.not_after(), not_before, &mut warnings)?;

        Ok(GrantedCertTemplate {
            profile,
            requested_subject,
            granted_subject: granted,
            public_key,
            not_before,
            not_after,
            extensions: template.extensions().to_vec(),
            warnings,
        })
    }

    fn grant_not_before(
        &self,
        profile: &dyn Certprofile,
        requested: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let requested = requested.map(truncate_to_seconds).filter(|time| *time > now).unwrap_or(now);
        let mut not_before = profile.not_before(requested).max(now);

        let zone = profile.time_zone();
        if profile.has_midnight_not_before() {
            not_before = next_midnight(not_before, &zone);
        }
        if not_before < self.info.not_before() {
            not_before = self.info.not_before();
            if profile.has_midnight_not_before() {
                not_before = next_midnight(not_before, &zone);
            }
        }
        not_before
    }

    fn grant_not_after(
        &self,
        profile: &dyn Certprofile,
        requested: Option<DateTime<Utc>>,
        not_before: DateTime<Utc>,
        warnings: &mut Vec<String>,
    ) -> CaResult<DateTime<Utc>> {
        let ca_max = self.info.max_validity();
        let validity = profile.validity().map(|v| v.min(ca_max)).unwrap_or(ca_max);
        let max_not_after = validity.add_to(not_before).min(max_cert_time());

        let mut not_after = match requested.map(truncate_to_seconds) {
            Some(requested) if requested > max_not_after => {
                add_warning(warnings, WARN_NOT_AFTER_MODIFIED);
                max_not_after
            }
            Some(requested) => requested,
            None => max_not_after,
        };

        let before_ca_check = not_after;
        if not_after > self.info.not_after() {
            match self.info.validity_mode() {
                ValidityMode::Cutoff => {
                    not_after = self.info.not_after();
                    add_warning(warnings, WARN_NOT_AFTER_MODIFIED);
                }
                ValidityMode::Strict => {
                    return Err(Error::not_permitted(format!(
                        "notAfter {not_after} is after the notAfter {} of CA '{}'",
                        self.info.not_after(),
                        self.ident()
                    )));
                }
                ValidityMode::Lax => {
                    warn!(
                        "Certificate of CA '{}' will be valid after the CA expires ({not_after})",
                        self.ident()
                    );
                    add_warning(warnings, WARN_NOT_AFTER_EXCEEDS_CA);
                }
            }
        }

        if profile.has_midnight_not_before() && not_after != before_ca_check {
            not_after = end_of_previous_day(not_after, &profile.time_zone());
        }
        Ok(not_after)
    }

    fn generate_from_grant(
        &self,
        mut grant: GrantedCertTemplate,
        requestor: &RequestorInfo,
        req_type: Option<RequestType>,
        transaction_id: Option<&str>,
    ) -> CaResult<CertificateInfo> {
        let ca = self.ident();
        let settings = self.info.settings();
        let duplicate_subject_permitted =
            settings.duplicate_subject_permitted && grant.profile.is_duplicate_subject_permitted();
        let duplicate_key_permitted = settings.duplicate_key_permitted && grant.profile.is_duplicate_key_permitted();

        if !duplicate_subject_permitted {
            self.adjust_subject(&mut grant)?;
        }

        let mut inflight = InFlightGuard::new(self.inflight.as_ref(), ca.id());
        if !inflight.add(FingerprintKind::PublicKey, grant.public_key.fingerprint()) && !duplicate_key_permitted {
            return Err(Error::already_issued(
                "certificate for the same public key is being issued",
            ));
        }
        if !inflight.add(FingerprintKind::Subject, grant.granted_subject.fingerprint()) && !duplicate_subject_permitted
        {
            return Err(Error::already_issued(format!(
                "certificate for subject '{}' is being issued",
                grant.granted_subject
            )));
        }

        let cert = self.build_certificate(&grant)?;
        let mut info = CertificateInfo::new(
            CertWithDbId::new(cert)?,
            ca.clone(),
            grant.profile.ident().clone(),
            requestor.ident().clone(),
            grant.public_key.clone(),
        );
        info.set_req_type(req_type);
        info.set_transaction_id(transaction_id.map(str::to_string));
        info.set_warning(grant.warning());
        info.set_requested_subject(Some(grant.requested_subject));

        match self.publish_certificate(&mut info) {
            PublishOutcome::StoreFailed => Err(Error::system_failure(format!(
                "could not save certificate {} of CA '{ca}'",
                info.serial()
            ))),
            outcome => {
                info!(
                    "CA '{ca}' issued certificate {} for '{}' ({outcome:?})",
                    info.serial(),
                    info.cert().subject()
                );
                Ok(info)
            }
        }
    }

    /// Finds an unused subject by incrementing its SerialNumber RDN.
    fn adjust_subject(&self, grant: &mut GrantedCertTemplate) -> CaResult<()> {
        let ca = self.ident();
        if !self
            .store
            .is_cert_for_subject_issued(ca, grant.granted_subject.fingerprint())?
        {
            return Ok(());
        }
        if !grant.profile.supports_serial_number_increment() {
            return Err(Error::already_issued(format!(
                "certificate for subject '{}' already issued",
                grant.granted_subject
            )));
        }

        let mut latest = self.store.get_latest_serial_number_rdn(ca, &grant.granted_subject)?;
        for _ in 0..MAX_SERIAL_NUMBER_INCREMENTS {
            let next = grant.profile.inc_serial_number(latest.as_deref())?;
            if latest.as_deref() == Some(next.as_str()) {
                break;
            }
            let candidate = grant.granted_subject.with_serial_number(&next);
            if !self.store.is_cert_for_subject_issued(ca, candidate.fingerprint())? {
                debug!("Subject '{}' adjusted to '{candidate}'", grant.granted_subject);
                grant.granted_subject = candidate;
                return Ok(());
            }
            latest = Some(next);
        }

        Err(Error::already_issued(format!(
            "no unused SerialNumber RDN found for subject '{}'",
            grant.granted_subject
        )))
    }

    fn build_certificate(&self, grant: &GrantedCertTemplate) -> CaResult<X509> {
        let serial = self.reserve_serial()?;
        let extensions = grant.profile.get_extensions(&ExtensionContext {
            subject: &grant.granted_subject,
            public_key: &grant.public_key,
            issuer_key_identifier: self.info.subject_key_id(),
            requested: &grant.extensions,
        })?;

        let serial_number = serial.to_asn1()?;
        let subject = grant.granted_subject.to_x509_name()?;
        let public_key = grant.public_key.pkey()?;
        let not_before = to_asn1_time(grant.not_before)?;
        let not_after = to_asn1_time(grant.not_after)?;

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        builder.set_serial_number(&serial_number)?;
        builder.set_issuer_name(self.info.cert().cert().subject_name())?;
        builder.set_subject_name(&subject)?;
        builder.set_pubkey(&public_key)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        for extension in extensions {
            let oid = Asn1Object::from_str(&extension.oid.to_string())?;
            let value = Asn1OctetString::new_from_bytes(&extension.value)?;
            builder.append_extension(X509Extension::new_from_der(&oid, extension.critical, &value)?)?;
        }

        self.signer.borrow()?.sign_certificate(&mut builder)?;
        let cert = builder.build();

        if !cert.verify(self.signer.public_key())? {
            return Err(Error::system_failure(format!(
                "signature of certificate {serial} of CA '{}' does not verify",
                self.ident()
            )));
        }
        if let Some(max_size) = grant.profile.max_cert_size() {
            let size = cert.to_der()?.len();
            if size > max_size {
                return Err(Error::not_permitted(format!(
                    "certificate of {size} bytes exceeds the maximum of {max_size} bytes"
                )));
            }
        }
        Ok(cert)
    }

    fn reserve_serial(&self) -> CaResult<SerialNumber> {
        loop {
            let value = self
                .info
                .next_serial()
                .reserve(|next| self.store.commit_next_serial(self.ident(), next))?;
            let serial = SerialNumber::from(value);
            if &serial != self.info.serial() {
                return Ok(serial);
            }
            debug!("Skipping serial {serial}, it is used by CA '{}'", self.ident());
        }
    }

    /// Removes certificates of a failed batch.
    fn roll_back(&self, issued: &[CertificateInfo]) {
        let ca = self.ident();
        for cert in issued {
            warn!("Rolling back certificate {} of CA '{ca}'", cert.serial());
            for publisher in &self.publishers {
                if let Err(e) = publisher.certificate_removed(self.info.cert(), cert.cert()) {
                    warn!(
                        "Publisher '{}' could not remove certificate {}: {e}",
                        publisher.ident(),
                        cert.serial()
                    );
                }
            }
            if let Err(e) = self.store.remove_cert(ca, cert.serial()) {
                warn!("Could not remove certificate {} of CA '{ca}': {e}", cert.serial());
            }
        }
    }
}
