//! Publishers are told about every change a CA makes.
//!
//! A publisher may be synchronous, in which case the CA calls it while
//! handling the change and queues the change only if the call fails, or
//! asynchronous, in which case changes always go through the publish queue.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::{debug, info, log_enabled};
use serde::Deserialize;

use crate::commons::api::{CertRevocationInfo, CertWithDbId, CertificateInfo, CrlInfo, NameId};

//------------ PublisherError ------------------------------------------------

#[derive(Debug)]
pub enum PublisherError {
    /// The target could not be reached, the change can be retried.
    Unavailable(String),

    /// The target refused the change.
    Rejected(String),
}

impl fmt::Display for PublisherError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PublisherError::Unavailable(msg) => write!(f, "publisher unavailable: {msg}"),
            PublisherError::Rejected(msg) => write!(f, "publication rejected: {msg}"),
        }
    }
}

impl std::error::Error for PublisherError {}

pub type PublishResult = Result<(), PublisherError>;

//------------ Publisher -----------------------------------------------------

pub trait Publisher: Send + Sync {
    fn ident(&self) -> &NameId;

    /// Asynchronous publishers only ever receive changes from the queue.
    fn is_asyn(&self) -> bool;

    /// Whether the publisher wants certificates that are not revoked.
    fn publishes_good_certs(&self) -> bool {
        true
    }

    fn is_healthy(&self) -> bool;

    fn ca_added(&self, ca_cert: &CertWithDbId) -> PublishResult;

    fn ca_revoked(&self, ca_cert: &CertWithDbId, revocation: &CertRevocationInfo) -> PublishResult;

    fn ca_unrevoked(&self, ca_cert: &CertWithDbId) -> PublishResult;

    fn certificate_added(&self, cert: &CertificateInfo) -> PublishResult;

    fn certificate_revoked(
        &self,
        ca_cert: &CertWithDbId,
        cert: &CertWithDbId,
        profile: &NameId,
        revocation: &CertRevocationInfo,
    ) -> PublishResult;

    fn certificate_unrevoked(&self, ca_cert: &CertWithDbId, cert: &CertWithDbId) -> PublishResult;

    fn certificate_removed(&self, ca_cert: &CertWithDbId, cert: &CertWithDbId) -> PublishResult;

    fn crl_added(&self, ca_cert: &CertWithDbId, crl: &CrlInfo) -> PublishResult;
}

//------------ PublisherConfig -----------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct PublisherConfig {
    pub id: u32,
    pub name: String,

    #[serde(rename = "type", default)]
    pub publisher_type: PublisherType,

    #[serde(default)]
    pub asynchronous: bool,

    #[serde(default = "PublisherConfig::dflt_publish_good_certs")]
    pub publish_good_certs: bool,
}

impl PublisherConfig {
    fn dflt_publish_good_certs() -> bool {
        true
    }

    pub fn build(&self) -> Box<dyn Publisher> {
        match self.publisher_type {
            PublisherType::Log => Box::new(LogPublisher::new(
                NameId::new(self.id, self.name.clone()),
                self.asynchronous,
                self.publish_good_certs,
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PublisherType {
    #[default]
    Log,
}

//------------ LogPublisher --------------------------------------------------

/// A publisher that writes every change to the log.
pub struct LogPublisher {
    ident: NameId,
    asynchronous: bool,
    publish_good_certs: bool,
}

impl LogPublisher {
    pub fn new(ident: NameId, asynchronous: bool, publish_good_certs: bool) -> Self {
        LogPublisher {
            ident,
            asynchronous,
            publish_good_certs,
        }
    }
}

impl Publisher for LogPublisher {
    fn ident(&self) -> &NameId {
        &self.ident
    }

    fn is_asyn(&self) -> bool {
        self.asynchronous
    }

    fn publishes_good_certs(&self) -> bool {
        self.publish_good_certs
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn ca_added(&self, ca_cert: &CertWithDbId) -> PublishResult {
        info!("[{}] CA added: {}", self.ident, ca_cert.subject());
        Ok(())
    }

    fn ca_revoked(&self, ca_cert: &CertWithDbId, revocation: &CertRevocationInfo) -> PublishResult {
        info!(
            "[{}] CA revoked: {}, reason {}",
            self.ident,
            ca_cert.subject(),
            revocation.reason
        );
        Ok(())
    }

    fn ca_unrevoked(&self, ca_cert: &CertWithDbId) -> PublishResult {
        info!("[{}] CA unrevoked: {}", self.ident, ca_cert.subject());
        Ok(())
    }

    fn certificate_added(&self, cert: &CertificateInfo) -> PublishResult {
        if cert.revocation().is_none() && !self.publish_good_certs {
            return Ok(());
        }
        info!(
            "[{}] certificate added: serial {}, subject {}, profile {}",
            self.ident,
            cert.serial(),
            cert.cert().subject(),
            cert.profile().name()
        );
        if log_enabled!(log::Level::Debug) {
            debug!("[{}] certificate {}: {}", self.ident, cert.serial(), BASE64.encode(cert.cert().der()));
        }
        Ok(())
    }

    fn certificate_revoked(
        &self,
        _ca_cert: &CertWithDbId,
        cert: &CertWithDbId,
        _profile: &NameId,
        revocation: &CertRevocationInfo,
    ) -> PublishResult {
        info!(
            "[{}] certificate revoked: serial {}, reason {}",
            self.ident,
            cert.serial(),
            revocation.reason
        );
        Ok(())
    }

    fn certificate_unrevoked(&self, _ca_cert: &CertWithDbId, cert: &CertWithDbId) -> PublishResult {
        info!("[{}] certificate unrevoked: serial {}", self.ident, cert.serial());
        Ok(())
    }

    fn certificate_removed(&self, _ca_cert: &CertWithDbId, cert: &CertWithDbId) -> PublishResult {
        info!("[{}] certificate removed: serial {}", self.ident, cert.serial());
        Ok(())
    }

    fn crl_added(&self, _ca_cert: &CertWithDbId, crl: &CrlInfo) -> PublishResult {
        let kind = if crl.is_delta() { "delta CRL" } else { "CRL" };
        info!("[{}] {kind} added: number {}", self.ident, crl.crl_number);
        if log_enabled!(log::Level::Debug) {
            debug!("[{}] {kind} {}: {}", self.ident, crl.crl_number, BASE64.encode(&crl.der));
        }
        Ok(())
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_publisher_config() {
        let config: PublisherConfig = toml::from_str(
            r#"
            id = 1
            name = "ocsp-feed"
            type = "log"
            asynchronous = true
            "#,
        )
        .unwrap();
        assert_eq!(config.publisher_type, PublisherType::Log);
        assert!(config.asynchronous);
        assert!(config.publish_good_certs);

        let publisher = config.build();
        assert_eq!(publisher.ident().name(), "ocsp-feed");
        assert!(publisher.is_asyn());
        assert!(publisher.is_healthy());
    }

    #[test]
    fn unknown_publisher_type() {
        let res: Result<PublisherConfig, _> = toml::from_str(
            r#"
            id = 1
            name = "x"
            type = "ldap"
            "#,
        );
        assert!(res.is_err());
    }
}
