use std::fmt;

use log::warn;
use openssl::pkey::{PKey, PKeyRef, Private, Public};
use openssl::sign::Signer;
use openssl::x509::{X509, X509Builder};
use r2d2::PooledConnection;

use super::SignAlgo;
use crate::constants::SIGNER_POOL_BUILD_TIMEOUT;

//------------ SignerError ---------------------------------------------------

#[derive(Debug)]
pub enum SignerError {
    /// All signing contexts of the named signer are in use.
    NoIdleSigner(String),
    Pool(String),
    UnsupportedKey(String),
    Openssl(openssl::error::ErrorStack),
}

impl SignerError {
    pub fn is_no_idle_signer(&self) -> bool {
        matches!(self, SignerError::NoIdleSigner(_))
    }
}

impl fmt::Display for SignerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SignerError::NoIdleSigner(name) => write!(f, "no idle signing context for signer '{name}'"),
            SignerError::Pool(e) => write!(f, "signer pool error: {e}"),
            SignerError::UnsupportedKey(e) => write!(f, "unsupported key: {e}"),
            SignerError::Openssl(e) => write!(f, "openssl error: {e}"),
        }
    }
}

impl std::error::Error for SignerError {}

impl From<openssl::error::ErrorStack> for SignerError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        SignerError::Openssl(e)
    }
}

impl From<r2d2::Error> for SignerError {
    fn from(e: r2d2::Error) -> Self {
        SignerError::Pool(e.to_string())
    }
}

//------------ SigningContext ------------------------------------------------

/// One signing context of a signer pool.
///
/// Every context owns its own copy of the private key.
pub struct SigningContext {
    key: PKey<Private>,
    algorithm: SignAlgo,
}

impl SigningContext {
    pub fn algorithm(&self) -> SignAlgo {
        self.algorithm
    }

    /// Signs the given data, e.g. the DER encoding of a TBSCertList.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SignerError> {
        if self.algorithm.is_digest_less() {
            let mut signer = Signer::new_without_digest(&self.key)?;
            Ok(signer.sign_oneshot_to_vec(data)?)
        } else {
            let mut signer = Signer::new(self.algorithm.digest(), &self.key)?;
            signer.update(data)?;
            Ok(signer.sign_to_vec()?)
        }
    }

    pub fn sign_certificate(&self, builder: &mut X509Builder) -> Result<(), SignerError> {
        builder.sign(&self.key, self.algorithm.digest())?;
        Ok(())
    }
}

//------------ SigningContextManager -----------------------------------------

struct SigningContextManager {
    name: String,
    key_pkcs8: Vec<u8>,
    algorithm: SignAlgo,
}

impl fmt::Debug for SigningContextManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SigningContextManager({}, {})", self.name, self.algorithm)
    }
}

impl r2d2::ManageConnection for SigningContextManager {
    type Connection = SigningContext;
    type Error = SignerError;

    fn connect(&self) -> Result<SigningContext, SignerError> {
        let key = PKey::private_key_from_pkcs8(&self.key_pkcs8)?;
        Ok(SigningContext {
            key,
            algorithm: self.algorithm,
        })
    }

    fn is_valid(&self, _ctx: &mut SigningContext) -> Result<(), SignerError> {
        Ok(())
    }

    fn has_broken(&self, _ctx: &mut SigningContext) -> bool {
        false
    }
}

//------------ PooledSigner --------------------------------------------------

/// A borrowed signing context, handed back to its pool when dropped.
pub struct PooledSigner(PooledConnection<SigningContextManager>);

impl std::ops::Deref for PooledSigner {
    type Target = SigningContext;

    fn deref(&self) -> &SigningContext {
        &self.0
    }
}

//------------ SignerPool ----------------------------------------------------

/// A bounded pool of signing contexts for one key.
///
/// Borrowing does not wait: when all contexts are in use the caller gets
/// [`SignerError::NoIdleSigner`] and may retry later.
pub struct SignerPool {
    name: String,
    algorithm: SignAlgo,
    public_key: PKey<Public>,
    cert: Option<X509>,
    pool: r2d2::Pool<SigningContextManager>,
}

impl SignerPool {
    pub fn build(
        name: &str,
        key: &PKeyRef<Private>,
        algorithm: Option<SignAlgo>,
        cert: Option<X509>,
        size: u32,
    ) -> Result<Self, SignerError> {
        let algorithm = match algorithm {
            Some(algorithm) => algorithm,
            None => SignAlgo::default_for(key)
                .ok_or_else(|| SignerError::UnsupportedKey(format!("no signature algorithm for key of {name}")))?,
        };

        let public_key = PKey::public_key_from_der(&key.public_key_to_der()?)?;
        if let Some(cert) = &cert {
            if !cert.public_key()?.public_eq(&public_key) {
                return Err(SignerError::UnsupportedKey(format!(
                    "certificate of signer '{name}' does not match its key"
                )));
            }
        }

        let manager = SigningContextManager {
            name: name.to_string(),
            key_pkcs8: key.private_key_to_pkcs8()?,
            algorithm,
        };

        let size = size.max(1);
        let pool = r2d2::Pool::builder()
            .max_size(size)
            .min_idle(Some(size))
            .connection_timeout(SIGNER_POOL_BUILD_TIMEOUT)
            .build(manager)?;

        Ok(SignerPool {
            name: name.to_string(),
            algorithm,
            public_key,
            cert,
            pool,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn algorithm(&self) -> SignAlgo {
        self.algorithm
    }

    pub fn public_key(&self) -> &PKey<Public> {
        &self.public_key
    }

    /// The certificate of the signer, if it has one of its own.
    pub fn cert(&self) -> Option<&X509> {
        self.cert.as_ref()
    }

    /// Borrows a signing context without waiting.
    pub fn borrow(&self) -> Result<PooledSigner, SignerError> {
        self.pool
            .try_get()
            .map(PooledSigner)
            .ok_or_else(|| SignerError::NoIdleSigner(self.name.clone()))
    }

    /// Signs a probe with an idle context. A pool without idle contexts is
    /// busy rather than broken.
    pub fn is_healthy(&self) -> bool {
        match self.borrow() {
            Ok(ctx) => match ctx.sign(b"health check") {
                Ok(_) => true,
                Err(e) => {
                    warn!("Signer '{}' failed health check: {e}", self.name);
                    false
                }
            },
            Err(_) => self.pool.state().connections > 0,
        }
    }
}

impl fmt::Debug for SignerPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SignerPool({}, {})", self.name, self.algorithm)
    }
}
