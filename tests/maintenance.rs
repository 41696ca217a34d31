//! Background jobs: removing expired and revoking suspended certificates.

use std::time::Duration as StdDuration;

use chrono::Duration;

use certa::commons::api::{CertStatus, CertTemplateData, CrlControl, CrlReason, RevokeSuspendedControl};
use certa::commons::x509::{CertValidity, SerialNumber};
use certa::server::profile::StaticProfileConfig;

mod common;
use common::*;

fn long_lived(ca: &TestCa, cn: &str) -> certa::commons::api::CertificateInfo {
    let tpl = template(cn);
    let tpl = CertTemplateData::new(tpl.subject().clone(), tpl.public_key().to_vec(), "long");
    ca.ca.generate_certificate(&tpl, &requestor(), None, None).unwrap()
}

fn expiring_ca(keep_days: i32, publisher: Option<std::sync::Arc<RecordingPublisher>>) -> TestCa {
    let mut builder = TestCa::builder("ca1")
        .settings(|settings| settings.keep_expired_cert_days = keep_days)
        .tls_profile(|profile| profile.validity = Some(CertValidity::days(1)))
        .profile(StaticProfileConfig::new(2, "long"));
    if let Some(publisher) = publisher {
        builder = builder.publisher(publisher);
    }
    builder.build()
}

#[test]
fn expired_certificates_are_removed() {
    init_logging();
    let publisher = RecordingPublisher::new(1, "recorder");
    let ca = expiring_ca(0, Some(publisher.clone()));

    let short = ca.issue("short.example.org");
    let long = long_lived(&ca, "long.example.org");
    let count = ca.store.cert_count(ca.ident());

    // Expired, but not for a full day yet.
    ca.clock.advance(Duration::hours(36));
    assert_eq!(ca.run_job("remove-expired"), 1);
    assert_eq!(ca.store.cert_count(ca.ident()), count);

    ca.clock.advance(Duration::days(1));
    ca.run_job("remove-expired");
    assert_eq!(ca.store.cert_count(ca.ident()), count - 1);
    assert!(ca.ca.get_cert_with_revocation_info(short.serial()).unwrap().is_none());
    assert!(ca.ca.get_cert_with_revocation_info(long.serial()).unwrap().is_some());
    assert_eq!(publisher.published().last(), Some(&Published::CertRemoved(short.serial().clone())));

    let records = ca.audit.records_named("remove_expired_certs");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].get("removed").unwrap(), 0);
    assert_eq!(records[1].get("removed").unwrap(), 1);
    assert_eq!(records[1].started, ca.now());
}

#[test]
fn expired_certificates_are_kept_for_the_configured_days() {
    let ca = expiring_ca(5, None);
    let short = ca.issue("short.example.org");

    ca.clock.advance(Duration::days(4));
    assert_eq!(ca.ca.remove_expired_certs().unwrap(), 0);

    ca.clock.advance(Duration::days(4));
    assert_eq!(ca.ca.remove_expired_certs().unwrap(), 1);
    assert!(ca.ca.get_cert_with_revocation_info(short.serial()).unwrap().is_none());
}

#[test]
fn expired_certificates_are_kept_forever_by_default() {
    let ca = TestCa::builder("ca1")
        .tls_profile(|profile| profile.validity = Some(CertValidity::days(1)))
        .build();
    ca.issue("short.example.org");

    ca.clock.advance(Duration::days(400));
    assert_eq!(ca.run_job("remove-expired"), 0);
    assert_eq!(ca.ca.remove_expired_certs().unwrap(), 0);
    assert_eq!(ca.store.cert_count(ca.ident()), 2);
}

#[test]
fn expired_certificates_can_be_kept_for_very_long() {
    let ca = expiring_ca(i32::MAX, None);
    ca.issue("short.example.org");

    ca.clock.advance(Duration::days(400));
    assert_eq!(ca.ca.remove_expired_certs().unwrap(), 0);
    assert_eq!(ca.store.cert_count(ca.ident()), 2);
}

#[test]
fn expired_certificate_stays_if_a_publisher_objects() {
    let publisher = RecordingPublisher::new(1, "recorder");
    let ca = expiring_ca(0, Some(publisher.clone()));
    let short = ca.issue("short.example.org");

    ca.clock.advance(Duration::days(3));
    publisher.set_failing(true);
    assert_eq!(ca.ca.remove_expired_certs().unwrap(), 0);
    assert!(ca.ca.get_cert_with_revocation_info(short.serial()).unwrap().is_some());

    publisher.set_failing(false);
    assert_eq!(ca.ca.remove_expired_certs().unwrap(), 1);
}

#[test]
fn long_suspended_certificates_are_revoked() {
    let ca = TestCa::builder("ca1")
        .settings(|settings| {
            settings.revoke_suspended = Some(RevokeSuspendedControl {
                target_reason: CrlReason::CessationOfOperation,
                unchanged_since: CertValidity::days(2),
            });
        })
        .build();

    let held = ca.issue("held.example.org");
    let good = ca.issue("good.example.org");
    ca.ca
        .revoke_certificate(held.serial(), CrlReason::CertificateHold, None, None)
        .unwrap();
    let held_since = ca.now();

    ca.clock.advance(Duration::days(1));
    assert_eq!(ca.run_job("revoke-suspended"), 1);
    let stored = ca.ca.get_cert_with_revocation_info(held.serial()).unwrap().unwrap();
    assert_eq!(stored.revocation.unwrap().reason, CrlReason::CertificateHold);

    ca.clock.advance(Duration::days(2));
    ca.run_job("revoke-suspended");
    let stored = ca.ca.get_cert_with_revocation_info(held.serial()).unwrap().unwrap();
    let revocation = stored.revocation.unwrap();
    assert_eq!(revocation.reason, CrlReason::CessationOfOperation);
    assert_eq!(revocation.revocation_time, held_since);

    let stored = ca.ca.get_cert_with_revocation_info(good.serial()).unwrap().unwrap();
    assert_eq!(stored.status(), CertStatus::Good);

    let records = ca.audit.records_named("revoke_suspended_certs");
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].get("revoked").unwrap(), 1);
    assert_eq!(records[1].get("reason").unwrap(), "cessationOfOperation");
}

#[test]
fn suspended_revocation_carries_on_after_a_failure() {
    let ca = TestCa::builder("ca1")
        .settings(|settings| {
            settings.revoke_suspended = Some(RevokeSuspendedControl {
                target_reason: CrlReason::Superseded,
                unchanged_since: CertValidity::days(1),
            });
        })
        .build();

    let first = ca.issue("first.example.org");
    let second = ca.issue("second.example.org");
    for cert in [&first, &second] {
        ca.ca
            .revoke_certificate(cert.serial(), CrlReason::CertificateHold, None, None)
            .unwrap();
    }

    ca.clock.advance(Duration::days(2));
    ca.store.set_fail_revocation_of(Some(first.serial().clone()));
    assert_eq!(ca.ca.revoke_suspended_certs().unwrap(), 1);

    let reason = |serial: &SerialNumber| {
        let stored = ca.ca.get_cert_with_revocation_info(serial).unwrap().unwrap();
        stored.revocation.unwrap().reason
    };
    assert_eq!(reason(first.serial()), CrlReason::CertificateHold);
    assert_eq!(reason(second.serial()), CrlReason::Superseded);

    // The next run picks up what was left.
    ca.store.set_fail_revocation_of(None);
    assert_eq!(ca.ca.revoke_suspended_certs().unwrap(), 1);
    assert_eq!(reason(first.serial()), CrlReason::Superseded);
}

#[test]
fn master_registers_all_jobs() {
    let ca = TestCa::builder("ca1")
        .settings(|settings| {
            settings.crl_control = Some(CrlControl::interval(60));
            settings.keep_expired_cert_days = 10;
            settings.revoke_suspended = Some(RevokeSuspendedControl {
                target_reason: CrlReason::Superseded,
                unchanged_since: CertValidity::days(30),
            });
        })
        .build();

    let mut names = ca.scheduler.job_names();
    names.sort();
    assert_eq!(
        names,
        vec!["ca1-crl", "ca1-publish-queue", "ca1-remove-expired", "ca1-revoke-suspended"]
    );

    let (delay, period) = ca.scheduler.timing("ca1-crl").unwrap();
    assert_eq!(period, StdDuration::from_secs(60));
    assert!(delay >= StdDuration::from_secs(60) && delay < StdDuration::from_secs(120));

    let (delay, period) = ca.scheduler.timing("ca1-remove-expired").unwrap();
    assert_eq!(period, StdDuration::from_secs(24 * 3600));
    assert!(delay >= StdDuration::from_secs(24 * 3600) && delay < StdDuration::from_secs(25 * 3600));

    let (delay, period) = ca.scheduler.timing("ca1-revoke-suspended").unwrap();
    assert_eq!(period, StdDuration::from_secs(3600));
    assert!(delay < StdDuration::from_secs(3600));

    let (delay, period) = ca.scheduler.timing("ca1-publish-queue").unwrap();
    assert_eq!(delay, StdDuration::from_secs(300));
    assert_eq!(period, StdDuration::from_secs(300));
}

#[test]
fn non_master_only_generates_crls() {
    let ca = TestCa::builder("ca1")
        .master(false)
        .settings(|settings| {
            settings.crl_control = Some(CrlControl::interval(60));
            settings.keep_expired_cert_days = 0;
        })
        .tls_profile(|profile| profile.validity = Some(CertValidity::days(1)))
        .build();
    assert_eq!(ca.scheduler.job_names(), vec!["ca1-crl"]);

    ca.issue("short.example.org");
    ca.clock.advance(Duration::days(3));
    assert_eq!(ca.ca.remove_expired_certs().unwrap(), 0);
    assert_eq!(ca.store.cert_count(ca.ident()), 2);
}

#[test]
fn on_demand_crls_have_no_job() {
    let ca = TestCa::builder("ca1")
        .settings(|settings| settings.crl_control = Some(CrlControl::on_demand()))
        .build();
    assert_eq!(ca.scheduler.job_names(), vec!["ca1-publish-queue"]);
}

#[test]
fn shutdown_cancels_jobs() {
    let ca = TestCa::builder("ca1")
        .settings(|settings| settings.crl_control = Some(CrlControl::interval(60)))
        .build();
    assert_eq!(ca.scheduler.job_names().len(), 2);

    ca.ca.shutdown();
    assert!(ca.scheduler.job_names().is_empty());
    assert_eq!(ca.run_job("crl"), 0);
    assert!(!ca.ca.is_busy());
}

#[test]
fn jobs_of_dropped_ca_do_nothing() {
    let ca = TestCa::builder("ca1")
        .settings(|settings| settings.crl_control = Some(CrlControl::interval(60)))
        .build();
    let scheduler = ca.scheduler.clone();
    let store = ca.store.clone();
    let ident = ca.ident().clone();
    drop(ca);

    assert_eq!(scheduler.run("ca1-crl"), 1);
    assert_eq!(store.crl_count(&ident), 0);
}
