use const_oid::db::rfc5912::ID_CE_BASIC_CONSTRAINTS;
use der::Decode;
use openssl::x509::X509Ref;
use x509_cert::Certificate;
use x509_cert::ext::pkix::BasicConstraints;

/// Whether the DER encoded certificate has BasicConstraints with `cA` set.
pub fn is_ca_cert(der: &[u8]) -> bool {
    let Ok(cert) = Certificate::from_der(der) else {
        return false;
    };
    cert.tbs_certificate
        .extensions
        .iter()
        .flatten()
        .filter(|ext| ext.extn_id == ID_CE_BASIC_CONSTRAINTS)
        .filter_map(|ext| BasicConstraints::from_der(ext.extn_value.as_bytes()).ok())
        .any(|bc| bc.ca)
}

/// The SubjectKeyIdentifier of a certificate, or the SHA-1 hash of its
/// public key when it has none.
pub fn subject_key_id(cert: &X509Ref) -> Result<Vec<u8>, openssl::error::ErrorStack> {
    if let Some(ski) = cert.subject_key_id() {
        return Ok(ski.as_slice().to_vec());
    }
    let key = cert.public_key()?.public_key_to_der()?;
    Ok(openssl::sha::sha1(&key).to_vec())
}

/// Whether the certificate is issued by its own subject with its own key.
pub fn is_self_signed(cert: &X509Ref) -> bool {
    let same_name = match (cert.subject_name().to_der(), cert.issuer_name().to_der()) {
        (Ok(subject), Ok(issuer)) => subject == issuer,
        _ => false,
    };
    same_name
        && cert
            .public_key()
            .and_then(|key| cert.verify(&key))
            .unwrap_or(false)
}
