//! Issuing certificates: serials, subjects, validity and batches.

use std::collections::HashSet;
use std::str::FromStr;

use chrono::Duration;
use openssl::hash::MessageDigest;
use openssl::x509::{X509NameBuilder, X509ReqBuilder};

use certa::commons::api::{
    CertStatus, CertTemplateData, CrlReason, NameId, RequestType, RequestorInfo, ValidityMode,
};
use certa::commons::error::ErrorCode;
use certa::commons::x509::{CertValidity, Subject};
use certa::constants::{WARN_NOT_AFTER_EXCEEDS_CA, WARN_NOT_AFTER_MODIFIED};
use certa::server::audit::AuditStatus;
use certa::server::profile::StaticProfileConfig;
use certa::server::store::CertStore;

mod common;
use common::*;

#[test]
fn serials_are_unique_and_committed_before_use() {
    init_logging();
    let ca = TestCa::builder("ca1").build();

    let mut serials = HashSet::new();
    for i in 0..20 {
        let cert = ca.issue(&format!("host{i}.example.org"));
        assert_ne!(cert.serial(), ca.ca.info().serial());
        assert!(serials.insert(cert.serial().clone()), "serial {} issued twice", cert.serial());
    }

    // Serials 1..=20 were handed out, the store knows the next one.
    assert_eq!(ca.store.get_next_serial(ca.ident()).unwrap(), Some(21));

    // The self-signed CA certificate is stored too.
    assert_eq!(ca.store.cert_count(ca.ident()), 21);
}

#[test]
fn issued_certificate_is_stored_and_verifiable() {
    let ca = TestCa::builder("ca1").build();
    let cert = ca
        .ca
        .generate_certificate(&template("www.example.org"), &requestor(), Some(RequestType::Rest), Some("tx-1"))
        .unwrap();

    assert!(cert.cert().cert().verify(&ca.key).unwrap());
    assert_eq!(cert.cert().subject().common_name(), Some("www.example.org"));
    assert_eq!(cert.req_type(), Some(RequestType::Rest));
    assert_eq!(cert.transaction_id(), Some("tx-1"));
    assert_eq!(cert.status(), CertStatus::Good);
    assert!(cert.warning().is_none());

    assert!(ca.ca.knows_certificate(cert.cert().cert()).unwrap());
    let stored = ca.ca.get_cert_with_revocation_info(cert.serial()).unwrap().unwrap();
    assert_eq!(stored.cert.der(), cert.cert().der());
    assert_eq!(stored.profile.name(), TLS_PROFILE);

    let records = ca.audit.records_named("gen_cert");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, AuditStatus::Successful);
    assert_eq!(records[0].msg_id, "tx-1");
    assert_eq!(records[0].get("serials").unwrap()[0], cert.serial().to_hex());
}

#[test]
fn validity_is_capped_by_the_profile() {
    let ca = TestCa::builder("ca1")
        .tls_profile(|profile| profile.validity = Some(CertValidity::days(30)))
        .build();

    let requested = ca.now() + Duration::days(90);
    let cert = ca
        .ca
        .generate_certificate(&template("a.example.org").with_not_after(requested), &requestor(), None, None)
        .unwrap();

    assert_eq!(cert.cert().not_after(), ca.now() + Duration::days(30));
    assert_eq!(cert.warning(), Some(WARN_NOT_AFTER_MODIFIED));

    // A shorter request is granted as is.
    let requested = ca.now() + Duration::days(10);
    let cert = ca
        .ca
        .generate_certificate(&template("b.example.org").with_not_after(requested), &requestor(), None, None)
        .unwrap();
    assert_eq!(cert.cert().not_after(), requested);
    assert!(cert.warning().is_none());
}

fn short_lived_ca(mode: ValidityMode) -> TestCa {
    TestCa::builder("ca1")
        .ca_validity_days(2 * 365)
        .settings(|settings| {
            settings.validity_mode = mode;
            settings.expiration_period_days = 0;
        })
        .build()
}

#[test]
fn strict_mode_refuses_certificates_outliving_the_ca() {
    let ca = short_lived_ca(ValidityMode::Strict);
    let err = ca
        .ca
        .generate_certificate(&template("a.example.org"), &requestor(), None, None)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotPermitted);
}

#[test]
fn cutoff_mode_ends_certificates_with_the_ca() {
    let ca = short_lived_ca(ValidityMode::Cutoff);
    let cert = ca.issue("a.example.org");
    assert_eq!(cert.cert().not_after(), ca.ca.info().not_after());
    assert_eq!(cert.warning(), Some(WARN_NOT_AFTER_MODIFIED));
}

#[test]
fn lax_mode_lets_certificates_outlive_the_ca() {
    let ca = short_lived_ca(ValidityMode::Lax);
    let cert = ca.issue("a.example.org");
    assert!(cert.cert().not_after() > ca.ca.info().not_after());
    assert_eq!(cert.warning(), Some(WARN_NOT_AFTER_EXCEEDS_CA));
}

#[test]
fn no_issuance_in_the_expiration_period() {
    // The CA has 100 days left but stops issuing a year before it expires.
    let ca = TestCa::builder("ca1")
        .ca_validity_days(101)
        .settings(|settings| settings.expiration_period_days = 365)
        .build();
    let err = ca
        .ca
        .generate_certificate(&template("a.example.org"), &requestor(), None, None)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotPermitted);
}

#[test]
fn duplicate_subject_gets_incremented_serial_number_rdn() {
    let ca = TestCa::builder("ca1")
        .tls_profile(|profile| {
            profile.duplicate_subject_permitted = false;
            profile.increment_serial_number = true;
        })
        .build();

    let first = ca.issue("dup.example.org");
    let second = ca.issue("dup.example.org");
    let third = ca.issue("dup.example.org");

    assert_eq!(first.cert().subject().serial_number(), None);
    assert_eq!(second.cert().subject().serial_number(), Some("1"));
    assert_eq!(third.cert().subject().serial_number(), Some("2"));

    // What was asked for is kept along with what was granted.
    let requested = Subject::from_str("CN=dup.example.org,O=Certa Test").unwrap();
    assert_eq!(third.requested_subject(), Some(&requested));
}

#[test]
fn duplicate_subject_without_increment_is_refused() {
    let ca = TestCa::builder("ca1")
        .settings(|settings| settings.duplicate_subject_permitted = false)
        .build();

    ca.issue("dup.example.org");
    let err = ca
        .ca
        .generate_certificate(&template("dup.example.org"), &requestor(), None, None)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::AlreadyIssued);
}

#[test]
fn duplicate_key_is_refused_unless_permitted() {
    let key = new_key();

    let strict = TestCa::builder("ca1")
        .settings(|settings| settings.duplicate_key_permitted = false)
        .build();
    strict
        .ca
        .generate_certificate(&template_for_key("a.example.org", &key), &requestor(), None, None)
        .unwrap();
    let err = strict
        .ca
        .generate_certificate(&template_for_key("b.example.org", &key), &requestor(), None, None)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::AlreadyIssued);

    let relaxed = TestCa::builder("ca2").build();
    relaxed
        .ca
        .generate_certificate(&template_for_key("a.example.org", &key), &requestor(), None, None)
        .unwrap();
    relaxed
        .ca
        .generate_certificate(&template_for_key("b.example.org", &key), &requestor(), None, None)
        .unwrap();
}

#[test]
fn bad_templates_are_refused() {
    let ca = TestCa::builder("ca1")
        .profile({
            let mut profile = StaticProfileConfig::new(2, "ra-only");
            profile.only_for_ra = true;
            profile
        })
        .build();

    // Unknown profile.
    let tpl = template("a.example.org");
    let tpl = CertTemplateData::new(tpl.subject().clone(), tpl.public_key().to_vec(), "nope");
    let err = ca.ca.generate_certificate(&tpl, &requestor(), None, None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnknownCertProfile);

    // Profile reserved for RAs.
    let tpl = template("b.example.org");
    let tpl = CertTemplateData::new(tpl.subject().clone(), tpl.public_key().to_vec(), "ra-only");
    let user = RequestorInfo::user(NameId::new(7, "alice"));
    let err = ca.ca.generate_certificate(&tpl, &user, None, None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotPermitted);
    ca.ca.generate_certificate(&tpl, &requestor(), None, None).unwrap();

    // Garbage instead of a public key.
    let tpl = CertTemplateData::new(
        Subject::from_str("CN=c.example.org").unwrap(),
        vec![1, 2, 3],
        TLS_PROFILE,
    );
    let err = ca.ca.generate_certificate(&tpl, &requestor(), None, None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadCertTemplate);

    // The subject of the CA itself.
    let tpl = template("ca1 Root");
    let err = ca.ca.generate_certificate(&tpl, &requestor(), None, None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::AlreadyIssued);

    // No templates at all.
    let err = ca
        .ca
        .generate_certificates(&[], &requestor(), false, None, None)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadRequest);

    let failed: Vec<_> = ca
        .audit
        .records_named("gen_cert")
        .into_iter()
        .filter(|record| record.status == AuditStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 5);
}

#[test]
fn key_update_needs_a_good_certificate() {
    let ca = TestCa::builder("ca1").build();

    let err = ca
        .ca
        .generate_certificates(&[template("new.example.org")], &requestor(), true, None, None)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnknownCert);

    let cert = ca.issue("old.example.org");
    ca.ca
        .generate_certificates(&[template("old.example.org")], &requestor(), true, None, None)
        .unwrap();

    ca.ca
        .revoke_certificate(cert.serial(), CrlReason::KeyCompromise, None, None)
        .unwrap();

    // The key update above left a good certificate for the subject.
    ca.ca
        .generate_certificates(&[template("old.example.org")], &requestor(), true, None, None)
        .unwrap();

    let revoked = ca.issue("gone.example.org");
    ca.ca
        .revoke_certificate(revoked.serial(), CrlReason::Superseded, None, None)
        .unwrap();
    let err = ca
        .ca
        .generate_certificates(&[template("gone.example.org")], &requestor(), true, None, None)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::CertRevoked);
}

#[test]
fn batch_is_all_or_nothing() {
    let publisher = RecordingPublisher::new(1, "recorder");
    let ca = TestCa::builder("ca1")
        .settings(|settings| settings.duplicate_subject_permitted = false)
        .publisher(publisher.clone())
        .build();
    let before = ca.store.cert_count(ca.ident());

    // The second template asks for the subject the first one just got.
    let templates = vec![
        template("a.example.org"),
        template("a.example.org"),
        template("c.example.org"),
    ];
    let err = ca
        .ca
        .generate_certificates(&templates, &requestor(), false, None, None)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::AlreadyIssued);
    assert_eq!(err.batch_index(), Some(1));
    assert_eq!(ca.store.cert_count(ca.ident()), before);

    // The publisher saw the first certificate come and go.
    let published = publisher.published();
    assert_eq!(published.len(), 2);
    let serial = match &published[0] {
        Published::CertAdded { serial, .. } => serial.clone(),
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(published[1], Published::CertRemoved(serial));

    // Rolling back released every subject and key, they can be used again.
    assert!(ca.nothing_in_flight());
    let retry = vec![templates[0].clone(), templates[2].clone()];
    let certs = ca
        .ca
        .generate_certificates(&retry, &requestor(), false, None, None)
        .unwrap();
    assert_eq!(certs.len(), 2);
    assert!(ca.nothing_in_flight());

    // A failing template found before issuing anything also names its index.
    let templates = vec![template("x.example.org"), {
        let tpl = template("y.example.org");
        CertTemplateData::new(tpl.subject().clone(), tpl.public_key().to_vec(), "nope")
    }];
    let err = ca
        .ca
        .generate_certificates(&templates, &requestor(), false, None, None)
        .unwrap_err();
    assert_eq!(err.batch_index(), Some(1));
    assert_eq!(err.code(), ErrorCode::UnknownCertProfile);
    assert_eq!(ca.store.cert_count(ca.ident()), before);

    // A good batch is issued in order.
    let templates = vec![template("p.example.org"), template("q.example.org")];
    let certs = ca
        .ca
        .generate_certificates(&templates, &requestor(), false, None, None)
        .unwrap();
    assert_eq!(certs.len(), 2);
    assert_eq!(certs[0].cert().subject().common_name(), Some("p.example.org"));
    assert_eq!(certs[1].cert().subject().common_name(), Some("q.example.org"));
    assert!(certs[0].serial() < certs[1].serial());
}

#[test]
fn store_failure_is_a_system_failure() {
    let ca = TestCa::builder("ca1")
        .settings(|settings| {
            settings.duplicate_subject_permitted = false;
            settings.duplicate_key_permitted = false;
        })
        .build();
    let tpl = template("a.example.org");
    ca.store.set_fail_add_cert(true);
    let err = ca
        .ca
        .generate_certificate(&tpl, &requestor(), None, None)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::SystemFailure);
    assert!(ca.nothing_in_flight());

    // The same subject and key go through once the store is back.
    ca.store.set_fail_add_cert(false);
    ca.ca.generate_certificate(&tpl, &requestor(), None, None).unwrap();
    assert!(ca.nothing_in_flight());
}

#[test]
fn revoked_ca_does_not_issue() {
    let publisher = RecordingPublisher::new(1, "recorder");
    let ca = TestCa::with_publishers(vec![publisher.clone()]);

    ca.ca.revoke_ca(CrlReason::KeyCompromise, None, None).unwrap();
    assert_eq!(publisher.published(), vec![Published::CaRevoked(CrlReason::KeyCompromise)]);

    let err = ca
        .ca
        .generate_certificate(&template("a.example.org"), &requestor(), None, None)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotPermitted);

    ca.ca.unrevoke_ca(None).unwrap();
    assert_eq!(publisher.published().last(), Some(&Published::CaUnrevoked));
    ca.issue("a.example.org");
}

#[test]
fn csr_proof_of_possession() {
    let ca = TestCa::builder("ca1").build();
    let key = new_key();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "csr.example.org").unwrap();
    let name = name.build();

    let mut builder = X509ReqBuilder::new().unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    let der = builder.build().to_der().unwrap();
    ca.ca.check_csr(&der).unwrap();

    // Signed by someone else.
    let mut builder = X509ReqBuilder::new().unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.sign(&new_key(), MessageDigest::sha256()).unwrap();
    let der = builder.build().to_der().unwrap();
    assert_eq!(ca.ca.check_csr(&der).unwrap_err().code(), ErrorCode::BadPop);

    assert_eq!(ca.ca.check_csr(b"not a csr").unwrap_err().code(), ErrorCode::BadRequest);
}

#[test]
fn parallel_issuance_keeps_serials_unique() {
    let ca = TestCa::builder("ca1").build();
    let authority = ca.ca.clone();
    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let authority = authority.clone();
            std::thread::spawn(move || {
                (0..10)
                    .map(|i| {
                        authority
                            .generate_certificate(
                                &template(&format!("w{worker}-{i}.example.org")),
                                &requestor(),
                                None,
                                None,
                            )
                            .unwrap()
                            .serial()
                            .clone()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut serials = HashSet::new();
    for handle in handles {
        for serial in handle.join().unwrap() {
            assert!(serials.insert(serial));
        }
    }
    assert_eq!(serials.len(), 40);
}
