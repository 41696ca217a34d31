use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use regex::Regex;

use super::{CertListFilter, CertStore, StoreError, StoreResult};
use crate::commons::api::{
    CertListInfo, CertListOrderBy, CertRevocationInfo, CertStatus, CertWithDbId, CertWithRevocationInfo,
    CertificateInfo, CertsetEntry, CrlInfo, CrlReason, NameId, RevokedCertEntry,
};
use crate::commons::clock::Clock;
use crate::commons::crypto::Fingerprint;
use crate::commons::x509::{SerialNumber, Subject};

//------------ MemoryCertStore -----------------------------------------------

/// A certificate store that keeps everything in memory.
///
/// Used for tests and for deployments that do not need to keep state
/// across restarts. Failures can be injected to exercise error paths.
pub struct MemoryCertStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    fail_add_cert: AtomicBool,
    unavailable: AtomicBool,
}

#[derive(Default)]
struct Inner {
    last_id: u64,
    certs: BTreeMap<u64, CertRecord>,
    serials: HashMap<(u32, SerialNumber), u64>,

    last_delta_id: u64,
    delta_cache: BTreeMap<u64, (u32, SerialNumber)>,

    crls: Vec<(u32, CrlInfo)>,

    queue: Vec<QueueEntry>,

    next_serials: HashMap<u32, u64>,
    next_crl_numbers: HashMap<u32, u64>,

    fail_revocation_of: Option<SerialNumber>,
}

struct CertRecord {
    ca: u32,
    info: CertificateInfo,
    subject_fp: Fingerprint,
    key_fp: Fingerprint,
    canonical_subject: String,
    subject_without_sn: String,
    revocation: Option<CertRevocationInfo>,
    last_update: DateTime<Utc>,
}

impl CertRecord {
    fn cert(&self) -> &CertWithDbId {
        self.info.cert()
    }

    fn with_revocation_info(&self) -> CertWithRevocationInfo {
        CertWithRevocationInfo {
            cert: self.cert().clone(),
            profile: self.info.profile().clone(),
            revocation: self.revocation.clone(),
        }
    }

    fn not_expired_at(&self, time: Option<DateTime<Utc>>) -> bool {
        time.map(|t| self.cert().not_after() >= t).unwrap_or(true)
    }
}

#[derive(Clone, Copy, Eq, PartialEq)]
struct QueueEntry {
    ca: u32,
    publisher: u32,
    cert_id: u64,
}

impl MemoryCertStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        MemoryCertStore {
            inner: Mutex::new(Inner::default()),
            clock,
            fail_add_cert: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Makes subsequent calls to `add_cert` fail.
    pub fn set_fail_add_cert(&self, fail: bool) {
        self.fail_add_cert.store(fail, Ordering::SeqCst);
    }

    /// Makes revoking the given certificate fail.
    pub fn set_fail_revocation_of(&self, serial: Option<SerialNumber>) {
        self.inner.lock().expect("poisoned lock").fail_revocation_of = serial;
    }

    /// Makes every call fail as if the backend were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn cert_count(&self, ca: &NameId) -> usize {
        self.lock()
            .map(|inner| inner.certs.values().filter(|rec| rec.ca == ca.id()).count())
            .unwrap_or(0)
    }

    pub fn crl_count(&self, ca: &NameId) -> usize {
        self.lock()
            .map(|inner| inner.crls.iter().filter(|(id, _)| *id == ca.id()).count())
            .unwrap_or(0)
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".to_string()));
        }
        Ok(self.inner.lock().expect("poisoned lock"))
    }
}

impl Inner {
    fn record(&self, ca: &NameId, serial: &SerialNumber) -> Option<&CertRecord> {
        self.serials
            .get(&(ca.id(), serial.clone()))
            .and_then(|id| self.certs.get(id))
    }

    fn record_mut(&mut self, ca: &NameId, serial: &SerialNumber) -> Option<&mut CertRecord> {
        let id = *self.serials.get(&(ca.id(), serial.clone()))?;
        self.certs.get_mut(&id)
    }

    fn check_revocation_allowed(&self, serial: &SerialNumber) -> StoreResult<()> {
        if self.fail_revocation_of.as_ref() == Some(serial) {
            Err(StoreError::other(format!("injected failure revoking certificate {serial}")))
        } else {
            Ok(())
        }
    }

    fn add_to_delta_cache(&mut self, ca: &NameId, serial: &SerialNumber) {
        self.delta_cache
            .retain(|_, (ca_id, cached)| !(*ca_id == ca.id() && cached == serial));
        self.last_delta_id += 1;
        self.delta_cache.insert(self.last_delta_id, (ca.id(), serial.clone()));
    }
}

fn subject_without_serial_number(subject: &Subject) -> String {
    let rdns = subject
        .rdns()
        .iter()
        .filter(|rdn| !rdn.is_serial_number())
        .cloned()
        .collect();
    Subject::new(rdns).canonicalize()
}

/// Turns a pattern where `*` stands for any run of characters into an
/// anchored regular expression.
fn subject_regex(pattern: &str) -> StoreResult<Regex> {
    let parts: Vec<String> = pattern.to_lowercase().split('*').map(regex::escape).collect();
    Regex::new(&format!("^{}$", parts.join(".*")))
        .map_err(|e| StoreError::other(format!("invalid subject pattern '{pattern}': {e}")))
}

impl CertStore for MemoryCertStore {
    fn add_cert(&self, cert: &CertificateInfo) -> StoreResult<u64> {
        if self.fail_add_cert.load(Ordering::SeqCst) {
            return Err(StoreError::other("injected failure adding certificate"));
        }

        let mut inner = self.lock()?;
        let ca = cert.issuer().id();
        let key = (ca, cert.serial().clone());
        if inner.serials.contains_key(&key) {
            return Err(StoreError::DuplicateSerial(cert.serial().clone()));
        }

        inner.last_id += 1;
        let id = inner.last_id;

        let mut info = cert.clone();
        info.cert_mut().set_cert_id(id);
        let subject = info.cert().subject().clone();
        let record = CertRecord {
            ca,
            subject_fp: subject.fingerprint(),
            key_fp: info.public_key().fingerprint(),
            canonical_subject: subject.canonicalize(),
            subject_without_sn: subject_without_serial_number(&subject),
            revocation: info.revocation().cloned(),
            last_update: self.clock.now(),
            info,
        };

        inner.serials.insert(key, id);
        inner.certs.insert(id, record);
        Ok(id)
    }

    fn remove_cert(&self, ca: &NameId, serial: &SerialNumber) -> StoreResult<()> {
        let mut inner = self.lock()?;
        if let Some(id) = inner.serials.remove(&(ca.id(), serial.clone())) {
            inner.certs.remove(&id);
            inner.queue.retain(|entry| entry.cert_id != id);
        }
        Ok(())
    }

    fn get_cert_with_revocation_info(
        &self,
        ca: &NameId,
        serial: &SerialNumber,
    ) -> StoreResult<Option<CertWithRevocationInfo>> {
        let inner = self.lock()?;
        Ok(inner.record(ca, serial).map(CertRecord::with_revocation_info))
    }

    fn get_cert_for_id(&self, cert_id: u64) -> StoreResult<Option<CertificateInfo>> {
        let inner = self.lock()?;
        Ok(inner.certs.get(&cert_id).map(|rec| {
            let mut info = rec.info.clone();
            info.set_revocation(rec.revocation.clone());
            info
        }))
    }

    fn get_cert_ids(&self, ca: &NameId, start_id: u64, limit: usize, only_revoked: bool) -> StoreResult<Vec<u64>> {
        let inner = self.lock()?;
        Ok(inner
            .certs
            .range(start_id..)
            .filter(|(_, rec)| rec.ca == ca.id() && (!only_revoked || rec.revocation.is_some()))
            .map(|(id, _)| *id)
            .take(limit)
            .collect())
    }

    fn is_cert_for_subject_issued(&self, ca: &NameId, subject: Fingerprint) -> StoreResult<bool> {
        let inner = self.lock()?;
        Ok(inner.certs.values().any(|rec| rec.ca == ca.id() && rec.subject_fp == subject))
    }

    fn is_cert_for_key_issued(&self, ca: &NameId, key: Fingerprint) -> StoreResult<bool> {
        let inner = self.lock()?;
        Ok(inner.certs.values().any(|rec| rec.ca == ca.id() && rec.key_fp == key))
    }

    fn get_latest_serial_number_rdn(&self, ca: &NameId, subject: &Subject) -> StoreResult<Option<String>> {
        let wanted = subject_without_serial_number(subject);
        let inner = self.lock()?;
        Ok(inner
            .certs
            .values()
            .rev()
            .filter(|rec| rec.ca == ca.id() && rec.subject_without_sn == wanted)
            .find_map(|rec| rec.cert().subject().serial_number().map(str::to_string)))
    }

    fn get_cert_status_for_subject(&self, ca: &NameId, subject: &Subject) -> StoreResult<CertStatus> {
        let wanted = subject.canonicalize();
        let inner = self.lock()?;
        let mut status = CertStatus::Unknown;
        for rec in inner.certs.values() {
            if rec.ca != ca.id() || rec.canonical_subject != wanted {
                continue;
            }
            if rec.revocation.is_none() {
                return Ok(CertStatus::Good);
            }
            status = CertStatus::Revoked;
        }
        Ok(status)
    }

    fn list_certificates(&self, ca: &NameId, filter: &CertListFilter) -> StoreResult<Vec<CertListInfo>> {
        let pattern = filter.subject_pattern.as_deref().map(subject_regex).transpose()?;
        let inner = self.lock()?;

        let mut list: Vec<CertListInfo> = inner
            .certs
            .values()
            .filter(|rec| rec.ca == ca.id())
            .filter(|rec| {
                pattern
                    .as_ref()
                    .map(|re| re.is_match(&rec.canonical_subject))
                    .unwrap_or(true)
            })
            .filter(|rec| filter.valid_from.map(|t| rec.cert().not_before() >= t).unwrap_or(true))
            .filter(|rec| filter.valid_to.map(|t| rec.cert().not_after() <= t).unwrap_or(true))
            .map(|rec| CertListInfo {
                serial: rec.cert().serial().clone(),
                subject: rec.cert().subject().to_string(),
                not_before: rec.cert().not_before(),
                not_after: rec.cert().not_after(),
            })
            .collect();

        match filter.order_by {
            Some(CertListOrderBy::Subject) => list.sort_by(|a, b| a.subject.cmp(&b.subject)),
            Some(CertListOrderBy::NotBefore) => list.sort_by_key(|c| c.not_before),
            Some(CertListOrderBy::NotAfter) => list.sort_by_key(|c| c.not_after),
            Some(CertListOrderBy::Serial) => list.sort_by(|a, b| a.serial.cmp(&b.serial)),
            None => {}
        }
        list.truncate(filter.limit);
        Ok(list)
    }

    fn revoke_cert(
        &self,
        ca: &NameId,
        serial: &SerialNumber,
        info: &CertRevocationInfo,
        force: bool,
        publish_to_delta: bool,
    ) -> StoreResult<Option<CertWithRevocationInfo>> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        inner.check_revocation_allowed(serial)?;
        let Some(rec) = inner.record_mut(ca, serial) else {
            return Ok(None);
        };

        let new_revocation = match &rec.revocation {
            None => info.clone(),
            Some(_) if force => info.clone(),
            Some(current) if current.reason == CrlReason::CertificateHold && info.reason != CrlReason::CertificateHold => {
                CertRevocationInfo::new(info.reason, current.revocation_time, info.invalidity_time)
            }
            Some(_) => return Ok(None),
        };

        rec.revocation = Some(new_revocation);
        rec.last_update = now;
        let result = rec.with_revocation_info();

        if publish_to_delta {
            inner.add_to_delta_cache(ca, serial);
        }
        Ok(Some(result))
    }

    fn revoke_suspended_cert(
        &self,
        ca: &NameId,
        serial: &SerialNumber,
        reason: CrlReason,
        publish_to_delta: bool,
    ) -> StoreResult<Option<CertWithRevocationInfo>> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        inner.check_revocation_allowed(serial)?;
        let Some(rec) = inner.record_mut(ca, serial) else {
            return Ok(None);
        };

        match &mut rec.revocation {
            Some(current) if current.reason == CrlReason::CertificateHold => current.reason = reason,
            _ => return Ok(None),
        }
        rec.last_update = now;
        let result = rec.with_revocation_info();

        if publish_to_delta {
            inner.add_to_delta_cache(ca, serial);
        }
        Ok(Some(result))
    }

    fn unrevoke_cert(
        &self,
        ca: &NameId,
        serial: &SerialNumber,
        force: bool,
        publish_to_delta: bool,
    ) -> StoreResult<Option<CertWithDbId>> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        let Some(rec) = inner.record_mut(ca, serial) else {
            return Ok(None);
        };

        match &rec.revocation {
            None => return Ok(None),
            Some(current) if current.reason != CrlReason::CertificateHold && !force => {
                return Err(StoreError::NotPermitted(format!(
                    "certificate {serial} is revoked with reason {}, not {}",
                    current.reason,
                    CrlReason::CertificateHold
                )));
            }
            Some(_) => {}
        }

        rec.revocation = None;
        rec.last_update = now;
        let cert = rec.cert().clone();

        if publish_to_delta {
            inner.add_to_delta_cache(ca, serial);
        }
        Ok(Some(cert))
    }

    fn get_expired_serial_numbers(
        &self,
        ca: &NameId,
        expired_at: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<SerialNumber>> {
        let inner = self.lock()?;
        Ok(inner
            .certs
            .values()
            .filter(|rec| rec.ca == ca.id() && rec.cert().not_after() < expired_at)
            .map(|rec| rec.cert().serial().clone())
            .take(limit)
            .collect())
    }

    fn get_suspended_cert_serials(
        &self,
        ca: &NameId,
        latest_last_update: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<SerialNumber>> {
        let inner = self.lock()?;
        Ok(inner
            .certs
            .values()
            .filter(|rec| rec.ca == ca.id() && rec.last_update < latest_last_update)
            .filter(|rec| {
                rec.revocation
                    .as_ref()
                    .map(|r| r.reason == CrlReason::CertificateHold)
                    .unwrap_or(false)
            })
            .map(|rec| rec.cert().serial().clone())
            .take(limit)
            .collect())
    }

    fn get_revoked_certs(
        &self,
        ca: &NameId,
        not_expired_at: Option<DateTime<Utc>>,
        start_id: u64,
        limit: usize,
        only_ca_certs: bool,
        only_user_certs: bool,
    ) -> StoreResult<Vec<RevokedCertEntry>> {
        let inner = self.lock()?;
        Ok(inner
            .certs
            .range(start_id..)
            .filter(|(_, rec)| rec.ca == ca.id() && rec.not_expired_at(not_expired_at))
            .filter(|(_, rec)| !only_ca_certs || rec.cert().is_ca())
            .filter(|(_, rec)| !only_user_certs || !rec.cert().is_ca())
            .filter_map(|(id, rec)| {
                rec.revocation.as_ref().map(|revocation| RevokedCertEntry {
                    id: *id,
                    serial: rec.cert().serial().clone(),
                    revocation: revocation.clone(),
                })
            })
            .take(limit)
            .collect())
    }

    fn get_certs_for_delta_crl(
        &self,
        ca: &NameId,
        not_expired_at: Option<DateTime<Utc>>,
        start_id: u64,
        limit: usize,
    ) -> StoreResult<Vec<RevokedCertEntry>> {
        let inner = self.lock()?;
        Ok(inner
            .delta_cache
            .range(start_id..)
            .filter(|(_, (ca_id, _))| *ca_id == ca.id())
            .filter_map(|(id, (_, serial))| {
                let rec = inner.record(ca, serial)?;
                if !rec.not_expired_at(not_expired_at) {
                    return None;
                }
                let revocation = rec
                    .revocation
                    .clone()
                    .unwrap_or_else(|| CertRevocationInfo::new(CrlReason::RemoveFromCrl, rec.last_update, None));
                Some(RevokedCertEntry {
                    id: *id,
                    serial: serial.clone(),
                    revocation,
                })
            })
            .take(limit)
            .collect())
    }

    fn get_certset_entries(
        &self,
        ca: &NameId,
        not_expired_at: Option<DateTime<Utc>>,
        start_id: u64,
        limit: usize,
    ) -> StoreResult<Vec<CertsetEntry>> {
        let inner = self.lock()?;
        Ok(inner
            .certs
            .range(start_id..)
            .filter(|(_, rec)| rec.ca == ca.id() && rec.not_expired_at(not_expired_at))
            .map(|(id, rec)| CertsetEntry {
                id: *id,
                serial: rec.cert().serial().clone(),
                der: rec.cert().der().to_vec(),
                profile: rec.info.profile().name().to_string(),
            })
            .take(limit)
            .collect())
    }

    fn get_max_id_of_delta_crl_cache(&self, ca: &NameId) -> StoreResult<u64> {
        let inner = self.lock()?;
        Ok(inner
            .delta_cache
            .iter()
            .filter(|(_, (ca_id, _))| *ca_id == ca.id())
            .map(|(id, _)| *id)
            .max()
            .unwrap_or(0))
    }

    fn clear_delta_crl_cache(&self, ca: &NameId, max_id: u64) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner
            .delta_cache
            .retain(|id, (ca_id, _)| !(*ca_id == ca.id() && *id <= max_id));
        Ok(())
    }

    fn add_crl(&self, ca: &NameId, crl: &CrlInfo) -> StoreResult<()> {
        let mut inner = self.lock()?;
        if inner
            .crls
            .iter()
            .any(|(id, existing)| *id == ca.id() && existing.crl_number == crl.crl_number)
        {
            return Err(StoreError::other(format!("CRL number {} already used", crl.crl_number)));
        }
        inner.crls.push((ca.id(), crl.clone()));
        Ok(())
    }

    fn get_crl(&self, ca: &NameId, crl_number: Option<u64>) -> StoreResult<Option<CrlInfo>> {
        let inner = self.lock()?;
        let crls = inner.crls.iter().filter(|(id, _)| *id == ca.id()).map(|(_, crl)| crl);
        Ok(match crl_number {
            Some(number) => crls.into_iter().find(|crl| crl.crl_number == number).cloned(),
            None => crls.max_by_key(|crl| crl.crl_number).cloned(),
        })
    }

    fn has_crl(&self, ca: &NameId) -> StoreResult<bool> {
        let inner = self.lock()?;
        Ok(inner.crls.iter().any(|(id, _)| *id == ca.id()))
    }

    fn get_this_update_of_current_crl(&self, ca: &NameId) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self.get_crl(ca, None)?.map(|crl| crl.this_update))
    }

    fn get_max_crl_number(&self, ca: &NameId) -> StoreResult<Option<u64>> {
        let inner = self.lock()?;
        Ok(inner
            .crls
            .iter()
            .filter(|(id, _)| *id == ca.id())
            .map(|(_, crl)| crl.crl_number)
            .max())
    }

    fn get_max_full_crl_number(&self, ca: &NameId) -> StoreResult<Option<u64>> {
        let inner = self.lock()?;
        Ok(inner
            .crls
            .iter()
            .filter(|(id, crl)| *id == ca.id() && !crl.is_delta())
            .map(|(_, crl)| crl.crl_number)
            .max())
    }

    fn cleanup_crls(&self, ca: &NameId, num_crls: usize) -> StoreResult<usize> {
        let mut inner = self.lock()?;
        let mut full: Vec<u64> = inner
            .crls
            .iter()
            .filter(|(id, crl)| *id == ca.id() && !crl.is_delta())
            .map(|(_, crl)| crl.crl_number)
            .collect();
        if num_crls == 0 || full.len() <= num_crls {
            return Ok(0);
        }

        full.sort_unstable_by(|a, b| b.cmp(a));
        let oldest_kept = full[num_crls - 1];

        let before = inner.crls.len();
        inner.crls.retain(|(id, crl)| {
            if *id != ca.id() {
                return true;
            }
            match crl.base_crl_number {
                Some(base) => base >= oldest_kept,
                None => crl.crl_number >= oldest_kept,
            }
        });
        Ok(before - inner.crls.len())
    }

    fn add_to_publish_queue(&self, publisher: &NameId, cert_id: u64, ca: &NameId) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let entry = QueueEntry {
            ca: ca.id(),
            publisher: publisher.id(),
            cert_id,
        };
        if !inner.queue.contains(&entry) {
            inner.queue.push(entry);
        }
        Ok(())
    }

    fn remove_from_publish_queue(&self, publisher: &NameId, cert_id: u64) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner
            .queue
            .retain(|entry| !(entry.publisher == publisher.id() && entry.cert_id == cert_id));
        Ok(())
    }

    fn get_publish_queue_entries(&self, ca: &NameId, publisher: &NameId, limit: usize) -> StoreResult<Vec<u64>> {
        let inner = self.lock()?;
        Ok(inner
            .queue
            .iter()
            .filter(|entry| entry.ca == ca.id() && entry.publisher == publisher.id())
            .map(|entry| entry.cert_id)
            .take(limit)
            .collect())
    }

    fn clear_publish_queue(&self, ca: &NameId, publisher: Option<&NameId>) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.queue.retain(|entry| {
            entry.ca != ca.id() || publisher.map(|p| p.id() != entry.publisher).unwrap_or(false)
        });
        Ok(())
    }

    fn commit_next_serial(&self, ca: &NameId, next: u64) -> StoreResult<()> {
        self.lock()?.next_serials.insert(ca.id(), next);
        Ok(())
    }

    fn get_next_serial(&self, ca: &NameId) -> StoreResult<Option<u64>> {
        Ok(self.lock()?.next_serials.get(&ca.id()).copied())
    }

    fn commit_next_crl_number(&self, ca: &NameId, next: u64) -> StoreResult<()> {
        self.lock()?.next_crl_numbers.insert(ca.id(), next);
        Ok(())
    }

    fn get_next_crl_number(&self, ca: &NameId) -> StoreResult<Option<u64>> {
        Ok(self.lock()?.next_crl_numbers.get(&ca.id()).copied())
    }

    fn is_healthy(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }
}

//------------ Tests ---------------------------------------------------------
