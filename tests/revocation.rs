//! Revoking, unrevoking and removing certificates.

use chrono::Duration;

use certa::commons::api::{CertStatus, CrlReason};
use certa::commons::error::ErrorCode;
use certa::commons::x509::SerialNumber;
use certa::server::audit::AuditStatus;

mod common;
use common::*;

#[test]
fn revocation_is_idempotent() {
    init_logging();
    let publisher = RecordingPublisher::new(1, "recorder");
    let ca = TestCa::with_publishers(vec![publisher.clone()]);
    let cert = ca.issue("a.example.org");
    publisher.clear();

    let revoked = ca
        .ca
        .revoke_certificate(cert.serial(), CrlReason::KeyCompromise, None, Some("msg-1"))
        .unwrap()
        .unwrap();
    assert_eq!(revoked.status(), CertStatus::Revoked);
    let revocation = revoked.revocation.unwrap();
    assert_eq!(revocation.reason, CrlReason::KeyCompromise);
    assert_eq!(revocation.revocation_time, ca.now());

    // Revoking again changes nothing and tells nobody.
    ca.clock.advance(Duration::hours(1));
    assert!(
        ca.ca
            .revoke_certificate(cert.serial(), CrlReason::Superseded, None, None)
            .unwrap()
            .is_none()
    );
    let stored = ca.ca.get_cert_with_revocation_info(cert.serial()).unwrap().unwrap();
    assert_eq!(stored.revocation.unwrap().reason, CrlReason::KeyCompromise);
    assert_eq!(
        publisher.published(),
        vec![Published::CertRevoked(cert.serial().clone(), CrlReason::KeyCompromise)]
    );

    let records = ca.audit.records_named("revoke_cert");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].msg_id, "msg-1");
    assert_eq!(records[0].get("changed").unwrap(), true);
    assert_eq!(records[1].get("changed").unwrap(), false);
}

#[test]
fn unknown_certificate_is_not_revoked() {
    let ca = TestCa::builder("ca1").build();
    let unknown = SerialNumber::from(4711u64);
    assert!(
        ca.ca
            .revoke_certificate(&unknown, CrlReason::KeyCompromise, None, None)
            .unwrap()
            .is_none()
    );
    assert!(ca.ca.unrevoke_certificate(&unknown, false, None).unwrap().is_none());
    assert!(ca.ca.remove_certificate(&unknown, None).unwrap().is_none());
}

#[test]
fn hold_can_become_final() {
    let ca = TestCa::builder("ca1").build();
    let cert = ca.issue("a.example.org");

    ca.ca
        .revoke_certificate(cert.serial(), CrlReason::CertificateHold, None, None)
        .unwrap()
        .unwrap();
    let held_since = ca.now();

    ca.clock.advance(Duration::days(2));
    let invalid_since = ca.now() - Duration::days(5);
    let revoked = ca
        .ca
        .revoke_certificate(cert.serial(), CrlReason::KeyCompromise, Some(invalid_since), None)
        .unwrap()
        .unwrap();
    let revocation = revoked.revocation.unwrap();
    assert_eq!(revocation.reason, CrlReason::KeyCompromise);
    assert_eq!(revocation.revocation_time, held_since);
    assert_eq!(revocation.invalidity_time, Some(invalid_since));

    // A final revocation cannot be lifted.
    let err = ca.ca.unrevoke_certificate(cert.serial(), false, None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotPermitted);

    // Unless forced.
    ca.ca.unrevoke_certificate(cert.serial(), true, None).unwrap().unwrap();
    let stored = ca.ca.get_cert_with_revocation_info(cert.serial()).unwrap().unwrap();
    assert_eq!(stored.status(), CertStatus::Good);
}

#[test]
fn hold_can_be_lifted() {
    let publisher = RecordingPublisher::new(1, "recorder");
    let ca = TestCa::with_publishers(vec![publisher.clone()]);
    let cert = ca.issue("a.example.org");
    publisher.clear();

    ca.ca
        .revoke_certificate(cert.serial(), CrlReason::CertificateHold, None, None)
        .unwrap();
    let unrevoked = ca.ca.unrevoke_certificate(cert.serial(), false, None).unwrap().unwrap();
    assert_eq!(unrevoked.serial(), cert.serial());

    // Not revoked anymore, so nothing to lift.
    assert!(ca.ca.unrevoke_certificate(cert.serial(), false, None).unwrap().is_none());

    assert_eq!(
        publisher.published(),
        vec![
            Published::CertRevoked(cert.serial().clone(), CrlReason::CertificateHold),
            Published::CertUnrevoked(cert.serial().clone()),
        ]
    );
}

#[test]
fn reserved_reasons_are_refused() {
    let ca = TestCa::builder("ca1").build();
    let cert = ca.issue("a.example.org");
    for reason in [CrlReason::CaCompromise, CrlReason::AaCompromise, CrlReason::RemoveFromCrl] {
        let err = ca
            .ca
            .revoke_certificate(cert.serial(), reason, None, None)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotPermitted);
    }
    let stored = ca.ca.get_cert_with_revocation_info(cert.serial()).unwrap().unwrap();
    assert!(stored.revocation.is_none());
}

#[test]
fn ca_certificate_is_not_touched_as_a_certificate() {
    let ca = TestCa::builder("ca1").build();
    let serial = ca.ca.info().serial().clone();

    let err = ca
        .ca
        .revoke_certificate(&serial, CrlReason::KeyCompromise, None, None)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotPermitted);
    let err = ca.ca.unrevoke_certificate(&serial, true, None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotPermitted);
    let err = ca.ca.remove_certificate(&serial, None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotPermitted);

    let records = ca.audit.records_named("remove_cert");
    assert_eq!(records[0].status, AuditStatus::Failed);
}

#[test]
fn removal_needs_every_publisher() {
    let good = RecordingPublisher::new(1, "good");
    let flaky = RecordingPublisher::new(2, "flaky");
    let ca = TestCa::with_publishers(vec![good.clone(), flaky.clone()]);
    let cert = ca.issue("a.example.org");
    let count = ca.store.cert_count(ca.ident());

    flaky.set_failing(true);
    let err = ca.ca.remove_certificate(cert.serial(), None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::SystemFailure);
    assert_eq!(ca.store.cert_count(ca.ident()), count);
    assert!(ca.ca.get_cert_with_revocation_info(cert.serial()).unwrap().is_some());

    flaky.set_failing(false);
    let removed = ca.ca.remove_certificate(cert.serial(), None).unwrap().unwrap();
    assert_eq!(removed.serial(), cert.serial());
    assert_eq!(ca.store.cert_count(ca.ident()), count - 1);
    assert!(ca.ca.get_cert_with_revocation_info(cert.serial()).unwrap().is_none());
    assert_eq!(flaky.published().last(), Some(&Published::CertRemoved(cert.serial().clone())));
}

#[test]
fn failed_revocation_delivery_is_queued() {
    let publisher = RecordingPublisher::new(1, "recorder");
    let ca = TestCa::with_publishers(vec![publisher.clone()]);
    let cert = ca.issue("a.example.org");
    publisher.clear();

    publisher.set_failing(true);
    ca.ca
        .revoke_certificate(cert.serial(), CrlReason::KeyCompromise, None, None)
        .unwrap()
        .unwrap();

    // The revocation itself is done, delivery waits in the queue.
    let stored = ca.ca.get_cert_with_revocation_info(cert.serial()).unwrap().unwrap();
    assert_eq!(stored.status(), CertStatus::Revoked);
    assert!(publisher.published().is_empty());

    publisher.set_failing(false);
    assert!(ca.ca.publish_certs_in_queue().unwrap());
    assert_eq!(
        publisher.published(),
        vec![Published::CertAdded {
            serial: cert.serial().clone(),
            revoked: true
        }]
    );
}

#[test]
fn ca_revocation_round_trip() {
    let publisher = RecordingPublisher::new(1, "recorder");
    let ca = TestCa::with_publishers(vec![publisher.clone()]);
    let ca_serial = ca.ca.info().serial().clone();

    assert_eq!(
        ca.ca.revoke_ca(CrlReason::RemoveFromCrl, None, None).unwrap_err().code(),
        ErrorCode::NotPermitted
    );

    ca.ca.revoke_ca(CrlReason::CaCompromise, None, None).unwrap();
    let revocation = ca.ca.info().revocation().unwrap();
    assert_eq!(revocation.reason, CrlReason::CaCompromise);
    let stored = ca.ca.get_cert_with_revocation_info(&ca_serial).unwrap().unwrap();
    assert_eq!(stored.status(), CertStatus::Revoked);

    ca.ca.unrevoke_ca(None).unwrap();
    assert!(ca.ca.info().revocation().is_none());
    let stored = ca.ca.get_cert_with_revocation_info(&ca_serial).unwrap().unwrap();
    assert_eq!(stored.status(), CertStatus::Good);

    // Unrevoking a CA that is not revoked is fine and tells nobody.
    ca.ca.unrevoke_ca(None).unwrap();
    assert_eq!(
        publisher.published(),
        vec![Published::CaRevoked(CrlReason::CaCompromise), Published::CaUnrevoked]
    );
}

#[test]
fn ca_revocation_fails_if_a_publisher_does() {
    let publisher = RecordingPublisher::new(1, "recorder");
    let ca = TestCa::with_publishers(vec![publisher.clone()]);

    publisher.set_failing(true);
    let err = ca.ca.revoke_ca(CrlReason::KeyCompromise, None, None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::SystemFailure);

    // The store has the revocation, so the CA counts as revoked.
    assert_eq!(ca.ca.info().revocation().unwrap().reason, CrlReason::KeyCompromise);

    let records = ca.audit.records_named("revoke_ca");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, AuditStatus::Failed);
    assert_eq!(records[0].get("code").unwrap(), "SYSTEM_FAILURE");
}

#[test]
fn ca_stays_unrevoked_if_the_store_fails() {
    let publisher = RecordingPublisher::new(1, "recorder");
    let ca = TestCa::with_publishers(vec![publisher.clone()]);
    let ca_serial = ca.ca.info().serial().clone();

    ca.store.set_fail_revocation_of(Some(ca_serial.clone()));
    let err = ca.ca.revoke_ca(CrlReason::KeyCompromise, None, None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::SystemFailure);
    assert!(ca.ca.info().revocation().is_none());
    assert!(publisher.published().is_empty());
    let stored = ca.ca.get_cert_with_revocation_info(&ca_serial).unwrap().unwrap();
    assert_eq!(stored.status(), CertStatus::Good);

    // Still issuing.
    ca.issue("a.example.org");
}
