//! CRL cadence and generation.

use chrono::{DateTime, Duration, DurationRound, NaiveTime, TimeZone, Utc};
use const_oid::ObjectIdentifier;
use const_oid::db::rfc5912::{
    ID_CE_AUTHORITY_KEY_IDENTIFIER, ID_CE_CERTIFICATE_ISSUER, ID_CE_CRL_NUMBER, ID_CE_CRL_REASONS,
    ID_CE_DELTA_CRL_INDICATOR, ID_CE_FRESHEST_CRL, ID_CE_INVALIDITY_DATE,
    ID_CE_ISSUING_DISTRIBUTION_POINT,
};
use der::asn1::{Any, BitString, Ia5String, OctetString, Uint};
use der::{Decode, Encode, Enumerated, Sequence, Tag};
use log::{debug, info, warn};
use x509_cert::Version;
use x509_cert::crl::{CertificateList, RevokedCert, TbsCertList};
use x509_cert::ext::Extension;
use x509_cert::ext::pkix::crl::dp::DistributionPoint;
use x509_cert::ext::pkix::name::{DistributionPointName, GeneralName};
use x509_cert::ext::pkix::{AuthorityKeyIdentifier, IssuingDistributionPoint};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber as X509Serial;

use super::{CertAuthority, CrlSigner};
use crate::commons::CaResult;
use crate::commons::api::{CrlControl, CrlInfo, CrlReason, InvalidityDateMode, RevokedCertEntry};
use crate::commons::error::Error;
use crate::commons::x509::{to_generalized_time, to_x509_time, truncate_to_seconds};
use crate::constants::{
    CRL_CERTSET_OID, CRL_EXPIRED_GRACE_MINUTES, CRL_MIN_NEXT_UPDATE_MINUTES, CRL_RECENT_GUARD_MINUTES,
    CRL_SIGNING_WINDOW_MINUTES, MINUTES_PER_DAY, STORE_PAGE_SIZE,
};

const ID_CERTSET: ObjectIdentifier = ObjectIdentifier::new_unwrap(CRL_CERTSET_OID);

//------------ CrlPlan -------------------------------------------------------

/// A CRL the scheduler is due to generate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CrlPlan {
    pub delta: bool,

    /// The number of intervals since the CRL base time.
    pub interval: i64,

    pub next_update: DateTime<Utc>,
}

/// Decides whether a CRL is due at `now`.
///
/// A CRL is only due within the signing window after an interval boundary,
/// and not if a CRL was generated shortly before. Delta CRLs need an
/// existing full CRL.
pub fn plan_scheduled_crl(
    control: &CrlControl,
    base_time: DateTime<Utc>,
    now: DateTime<Utc>,
    has_full_crl: bool,
    last_this_update: Option<DateTime<Utc>>,
) -> Option<CrlPlan> {
    if !control.is_interval() {
        return None;
    }

    let (interval, boundary) = current_interval(control, base_time, now)?;
    if interval < 0 || now - boundary > Duration::minutes(CRL_SIGNING_WINDOW_MINUTES) {
        return None;
    }

    let full = control.full_crl_intervals as i64;
    let delta_intervals = control.delta_crl_intervals as i64;
    let delta = if interval % full == 0 {
        false
    } else if delta_intervals > 0 && interval % delta_intervals == 0 {
        true
    } else {
        return None;
    };

    if delta && !has_full_crl {
        return None;
    }
    if let Some(last) = last_this_update {
        if now - last <= Duration::minutes(CRL_RECENT_GUARD_MINUTES) {
            return None;
        }
    }

    let next_update = next_update_after(control, interval, boundary, now, delta)?;
    Some(CrlPlan {
        delta,
        interval,
        next_update,
    })
}

/// The nextUpdate of a CRL generated at `now` outside the schedule.
///
/// `None` unless CRLs are generated at intervals.
pub fn next_crl_update(control: &CrlControl, base_time: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if !control.is_interval() {
        return None;
    }
    let (interval, boundary) = current_interval(control, base_time, now)?;
    next_update_after(control, interval, boundary, now, false)
}

/// Returns the index of the interval containing `now` and its start.
///
/// In daily mode the first interval starts at the first time of day at or
/// after the base time. Before that the index is -1.
fn current_interval(
    control: &CrlControl,
    base_time: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<(i64, DateTime<Utc>)> {
    if now < base_time {
        return None;
    }

    if let Some(day_time) = control.interval_day_time {
        let time = NaiveTime::from_hms_opt(day_time.hour().into(), day_time.minute().into(), 0)?;
        let mut boundary = Utc.from_utc_datetime(&now.date_naive().and_time(time));
        if boundary > now {
            boundary -= Duration::days(1);
        }
        let interval = (boundary - base_time).num_minutes().div_euclid(MINUTES_PER_DAY);
        Some((interval, boundary))
    } else {
        let length = control.interval_minutes.filter(|minutes| *minutes > 0)? as i64;
        let interval = (now - base_time).num_minutes() / length;
        Some((interval, base_time + Duration::minutes(interval * length)))
    }
}

/// The number of intervals until the CRL following one at `interval`.
fn intervals_till_next_crl(control: &CrlControl, interval: i64, delta: bool) -> i64 {
    let full = control.full_crl_intervals.max(1) as i64;
    let delta_intervals = control.delta_crl_intervals as i64;
    let to_next_delta = delta_intervals > 0 && (delta || !control.extended_next_update);

    let mut k = 1;
    loop {
        let next = interval + k;
        if next % full == 0 || (to_next_delta && next % delta_intervals == 0) {
            return k;
        }
        k += 1;
    }
}

fn next_update_after(
    control: &CrlControl,
    interval: i64,
    boundary: DateTime<Utc>,
    now: DateTime<Utc>,
    delta: bool,
) -> Option<DateTime<Utc>> {
    let k = intervals_till_next_crl(control, interval, delta);
    let overlap = Duration::minutes(control.overlap_minutes as i64);

    if control.interval_day_time.is_some() {
        Some(boundary + Duration::days(k) + overlap)
    } else {
        let length = control.interval_minutes? as i64;
        let now = now.duration_trunc(Duration::minutes(1)).ok()?;
        Some(now + Duration::minutes(k * length) + overlap)
    }
}

//------------ ASN.1 helpers -------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq, Enumerated)]
#[repr(u32)]
enum ReasonCode {
    Unspecified = 0,
    KeyCompromise = 1,
    CaCompromise = 2,
    AffiliationChanged = 3,
    Superseded = 4,
    CessationOfOperation = 5,
    CertificateHold = 6,
    RemoveFromCrl = 8,
    PrivilegeWithdrawn = 9,
    AaCompromise = 10,
}

impl From<CrlReason> for ReasonCode {
    fn from(reason: CrlReason) -> Self {
        match reason {
            CrlReason::Unspecified => ReasonCode::Unspecified,
            CrlReason::KeyCompromise => ReasonCode::KeyCompromise,
            CrlReason::CaCompromise => ReasonCode::CaCompromise,
            CrlReason::AffiliationChanged => ReasonCode::AffiliationChanged,
            CrlReason::Superseded => ReasonCode::Superseded,
            CrlReason::CessationOfOperation => ReasonCode::CessationOfOperation,
            CrlReason::CertificateHold => ReasonCode::CertificateHold,
            CrlReason::RemoveFromCrl => ReasonCode::RemoveFromCrl,
            CrlReason::PrivilegeWithdrawn => ReasonCode::PrivilegeWithdrawn,
            CrlReason::AaCompromise => ReasonCode::AaCompromise,
        }
    }
}

/// An entry of the certificate set extension.
#[derive(Clone, Debug, Sequence)]
struct CertsetItem {
    serial: X509Serial,

    #[asn1(context_specific = "0", tag_mode = "EXPLICIT", optional = "true")]
    cert: Option<Any>,

    #[asn1(context_specific = "1", tag_mode = "EXPLICIT", optional = "true")]
    profile: Option<String>,
}

fn extension(oid: ObjectIdentifier, critical: bool, value: &impl Encode) -> Result<Extension, der::Error> {
    Ok(Extension {
        extn_id: oid,
        critical,
        extn_value: OctetString::new(value.to_der()?)?,
    })
}

fn crl_number_extension(value: u64) -> Result<Uint, der::Error> {
    Uint::new(&value.to_be_bytes())
}

//------------ CertAuthority: CRLs -------------------------------------------

impl CertAuthority {
    /// Generates the CRL due at the current time, if any.
    ///
    /// Returns `None` if no CRL is due or another generation is running.
    pub fn gen_crl_on_schedule(&self) -> CaResult<Option<CrlInfo>> {
        let Some(crl_signer) = &self.crl_signer else {
            return Ok(None);
        };
        let control = crl_signer.control();
        if !control.is_interval() {
            return Ok(None);
        }
        let Some(_running) = self.crl_flag.try_run() else {
            debug!("CRL generation of CA '{}' is running, skipping", self.ident());
            return Ok(None);
        };

        let ca = self.ident();
        let now = truncate_to_seconds(self.clock.now());
        let has_full_crl = self.store.get_max_full_crl_number(ca)?.is_some();
        let last_this_update = self.store.get_this_update_of_current_crl(ca)?;
        let Some(plan) = plan_scheduled_crl(control, self.info.crl_base_time(), now, has_full_crl, last_this_update)
        else {
            return Ok(None);
        };

        let mut event = self.audit_event("gen_crl", None);
        event.add("trigger", "schedule");
        event.add("delta", plan.delta);
        event.add("interval", plan.interval);

        let result = self.generate_crl(crl_signer, plan.delta, now, Some(plan.next_update));
        if let Ok(crl) = &result {
            event.add("crl_number", crl.crl_number);
        }
        event.finish_with(&result);
        result.map(Some)
    }

    /// Generates a full CRL now.
    pub fn gen_crl_on_demand(&self, msg_id: Option<&str>) -> CaResult<CrlInfo> {
        let mut event = self.audit_event("gen_crl", msg_id);
        event.add("trigger", "on-demand");
        event.add("delta", false);

        let result = self.crl_on_demand();
        if let Ok(crl) = &result {
            event.add("crl_number", crl.crl_number);
        }
        event.finish_with(&result);
        result
    }

    fn crl_on_demand(&self) -> CaResult<CrlInfo> {
        let ca = self.ident();
        let crl_signer = self
            .crl_signer
            .as_ref()
            .ok_or_else(|| Error::not_permitted(format!("CA '{ca}' does not generate CRLs")))?;
        let _running = self
            .crl_flag
            .try_run()
            .ok_or_else(|| Error::unavailable(format!("a CRL of CA '{ca}' is being generated")))?;

        let now = truncate_to_seconds(self.clock.now());
        let next_update = next_crl_update(crl_signer.control(), self.info.crl_base_time(), now);
        self.generate_crl(crl_signer, false, now, next_update)
    }

    /// The CRL with the given number.
    pub fn get_crl(&self, crl_number: u64) -> CaResult<Option<CrlInfo>> {
        Ok(self.store.get_crl(self.ident(), Some(crl_number))?)
    }

    /// The latest CRL, full or delta.
    pub fn get_current_crl(&self) -> CaResult<Option<CrlInfo>> {
        Ok(self.store.get_crl(self.ident(), None)?)
    }

    fn generate_crl(
        &self,
        crl_signer: &CrlSigner,
        delta: bool,
        this_update: DateTime<Utc>,
        next_update: Option<DateTime<Utc>>,
    ) -> CaResult<CrlInfo> {
        let ca = self.ident();
        let control = crl_signer.control();

        if let Some(next_update) = next_update {
            if next_update - this_update < Duration::minutes(CRL_MIN_NEXT_UPDATE_MINUTES) {
                return Err(Error::crl_failure(format!(
                    "nextUpdate {next_update} is less than {CRL_MIN_NEXT_UPDATE_MINUTES} minutes after thisUpdate"
                )));
            }
        }

        let max_delta_id = self.store.get_max_id_of_delta_crl_cache(ca)?;
        let not_expired_at = if control.include_expired_certs {
            None
        } else {
            Some(this_update - Duration::minutes(CRL_EXPIRED_GRACE_MINUTES))
        };

        let mut entries = self.collect_revoked_certs(control, delta, not_expired_at)?;
        entries.sort_by(|a, b| a.serial.cmp(&b.serial));

        let base_crl_number = if delta {
            let base = self
                .store
                .get_max_full_crl_number(ca)?
                .ok_or_else(|| Error::crl_failure(format!("CA '{ca}' has no full CRL to base a delta CRL on")))?;
            Some(base)
        } else {
            None
        };

        let crl_number = self
            .info
            .next_crl_number()
            .reserve(|next| self.store.commit_next_crl_number(ca, next))?;

        let der = self.build_crl(
            crl_signer,
            crl_number,
            base_crl_number,
            this_update,
            next_update,
            &entries,
            not_expired_at,
        )?;
        let crl = CrlInfo {
            crl_number,
            base_crl_number,
            this_update,
            next_update,
            der,
        };
        self.store.add_crl(ca, &crl)?;

        for publisher in &self.publishers {
            if let Err(e) = publisher.crl_added(self.info.cert(), &crl) {
                warn!(
                    "Publisher '{}' could not publish CRL {crl_number} of CA '{ca}': {e}",
                    publisher.ident()
                );
            }
        }

        if !delta {
            if let Err(e) = self.store.clear_delta_crl_cache(ca, max_delta_id) {
                warn!("Could not clear the delta CRL cache of CA '{ca}': {e}");
            }
            match self.store.cleanup_crls(ca, self.info.settings().num_crls) {
                Ok(0) => {}
                Ok(removed) => debug!("Removed {removed} old CRLs of CA '{ca}'"),
                Err(e) => warn!("Could not remove old CRLs of CA '{ca}': {e}"),
            }
        }

        let kind = if delta { "delta CRL" } else { "full CRL" };
        info!(
            "Generated {kind} {crl_number} for CA '{ca}' with {} entries",
            entries.len()
        );
        Ok(crl)
    }

    fn collect_revoked_certs(
        &self,
        control: &CrlControl,
        delta: bool,
        not_expired_at: Option<DateTime<Utc>>,
    ) -> CaResult<Vec<RevokedCertEntry>> {
        let ca = self.ident();
        let mut entries = vec![];
        let mut start_id = 0;
        loop {
            let page = if delta {
                self.store
                    .get_certs_for_delta_crl(ca, not_expired_at, start_id, STORE_PAGE_SIZE)?
            } else {
                self.store.get_revoked_certs(
                    ca,
                    not_expired_at,
                    start_id,
                    STORE_PAGE_SIZE,
                    control.only_ca_certs,
                    control.only_user_certs,
                )?
            };
            let Some(max_id) = page.iter().map(|entry| entry.id).max() else {
                break;
            };
            start_id = max_id + 1;
            let last_page = page.len() < STORE_PAGE_SIZE;
            entries.extend(page);
            if last_page {
                break;
            }
        }
        Ok(entries)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_crl(
        &self,
        crl_signer: &CrlSigner,
        crl_number: u64,
        base_crl_number: Option<u64>,
        this_update: DateTime<Utc>,
        next_update: Option<DateTime<Utc>>,
        entries: &[RevokedCertEntry],
        not_expired_at: Option<DateTime<Utc>>,
    ) -> CaResult<Vec<u8>> {
        let control = crl_signer.control();
        let indirect = crl_signer.is_indirect();
        let ca_name = Name::from_der(&self.info.cert().cert().subject_name().to_der()?)?;
        let issuer = if indirect {
            let cert = crl_signer
                .signer()
                .cert()
                .ok_or_else(|| Error::crl_failure("indirect CRL signer has no certificate"))?;
            Name::from_der(&cert.subject_name().to_der()?)?
        } else {
            ca_name.clone()
        };

        let mut revoked = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let mut extensions = vec![];

            let mut reason = entry.revocation.reason;
            if control.exclude_reason && reason != CrlReason::RemoveFromCrl {
                reason = CrlReason::Unspecified;
            }
            if reason != CrlReason::Unspecified {
                extensions.push(extension(ID_CE_CRL_REASONS, false, &ReasonCode::from(reason))?);
            }

            let invalidity_time = match control.invalidity_date {
                InvalidityDateMode::Forbidden => None,
                InvalidityDateMode::Optional => entry.revocation.invalidity_time,
                InvalidityDateMode::Required => Some(
                    entry
                        .revocation
                        .invalidity_time
                        .unwrap_or(entry.revocation.revocation_time),
                ),
            };
            if let Some(time) = invalidity_time {
                extensions.push(extension(ID_CE_INVALIDITY_DATE, false, &to_generalized_time(time)?)?);
            }

            if indirect && index == 0 {
                let names = vec![GeneralName::DirectoryName(ca_name.clone())];
                extensions.push(extension(ID_CE_CERTIFICATE_ISSUER, true, &names)?);
            }

            revoked.push(RevokedCert {
                serial_number: X509Serial::new(entry.serial.as_bytes())?,
                revocation_date: to_x509_time(entry.revocation.revocation_time)?,
                crl_entry_extensions: if extensions.is_empty() { None } else { Some(extensions) },
            });
        }

        let aki = AuthorityKeyIdentifier {
            key_identifier: Some(OctetString::new(crl_signer.key_identifier())?),
            authority_cert_issuer: None,
            authority_cert_serial_number: None,
        };
        let mut extensions = vec![
            extension(ID_CE_AUTHORITY_KEY_IDENTIFIER, false, &aki)?,
            extension(ID_CE_CRL_NUMBER, false, &crl_number_extension(crl_number)?)?,
        ];
        if let Some(base) = base_crl_number {
            extensions.push(extension(ID_CE_DELTA_CRL_INDICATOR, true, &crl_number_extension(base)?)?);
        }
        if control.only_ca_certs || control.only_user_certs || indirect {
            let idp = IssuingDistributionPoint {
                distribution_point: None,
                only_contains_user_certs: control.only_user_certs,
                only_contains_ca_certs: control.only_ca_certs,
                only_some_reasons: None,
                indirect_crl: indirect,
                only_contains_attribute_certs: false,
            };
            extensions.push(extension(ID_CE_ISSUING_DISTRIBUTION_POINT, true, &idp)?);
        }
        if base_crl_number.is_none() {
            let delta_crl_uris = &self.info.settings().delta_crl_uris;
            if control.uses_delta_crls() && !delta_crl_uris.is_empty() {
                extensions.push(freshest_crl(delta_crl_uris)?);
            }
            if control.include_certset {
                extensions.push(self.certset_extension(control, not_expired_at)?);
            }
        }

        let algorithm = crl_signer.signer().algorithm().algorithm_identifier();
        let tbs_cert_list = TbsCertList {
            version: Version::V2,
            signature: algorithm.clone(),
            issuer,
            this_update: to_x509_time(this_update)?,
            next_update: next_update.map(to_x509_time).transpose()?,
            revoked_certificates: if revoked.is_empty() { None } else { Some(revoked) },
            crl_extensions: Some(extensions),
        };

        let signature = crl_signer.signer().borrow()?.sign(&tbs_cert_list.to_der()?)?;
        let crl = CertificateList {
            tbs_cert_list,
            signature_algorithm: algorithm,
            signature: BitString::from_bytes(&signature)?,
        };
        Ok(crl.to_der()?)
    }

    /// Lists every certificate that has not expired.
    fn certset_extension(&self, control: &CrlControl, not_expired_at: Option<DateTime<Utc>>) -> CaResult<Extension> {
        let ca = self.ident();
        let mut items: Vec<Vec<u8>> = vec![];
        let mut start_id = 0;
        loop {
            let page = self
                .store
                .get_certset_entries(ca, not_expired_at, start_id, STORE_PAGE_SIZE)?;
            let Some(max_id) = page.iter().map(|entry| entry.id).max() else {
                break;
            };
            start_id = max_id + 1;
            let last_page = page.len() < STORE_PAGE_SIZE;

            for entry in page {
                let cert = if control.certset_include_cert {
                    Some(Any::from_der(&entry.der)?)
                } else {
                    None
                };
                let profile = control.certset_include_profile.then_some(entry.profile);
                let item = CertsetItem {
                    serial: X509Serial::new(entry.serial.as_bytes())?,
                    cert,
                    profile,
                };
                items.push(item.to_der()?);
            }
            if last_page {
                break;
            }
        }

        // DER orders the members of a SET OF by their encoding.
        items.sort();
        let set = Any::new(Tag::Set, items.concat())?;
        Ok(extension(ID_CERTSET, false, &set)?)
    }
}

fn freshest_crl(uris: &[String]) -> CaResult<Extension> {
    let names = uris
        .iter()
        .map(|uri| Ok(GeneralName::UniformResourceIdentifier(Ia5String::new(uri)?)))
        .collect::<Result<Vec<_>, der::Error>>()?;
    let points = vec![DistributionPoint {
        distribution_point: Some(DistributionPointName::FullName(names)),
        reasons: None,
        crl_issuer: None,
    }];
    Ok(extension(ID_CE_FRESHEST_CRL, false, &points)?)
}

//------------ Tests ---------------------------------------------------------
