use std::fmt;

use const_oid::ObjectIdentifier;
use const_oid::db::{rfc5912, rfc8410};
use der::asn1::{Any, AnyRef};
use openssl::hash::MessageDigest;
use openssl::pkey::{HasPublic, Id, PKeyRef};
use serde::{Deserialize, Serialize};
use spki::AlgorithmIdentifierOwned;

//------------ KeyAlgorithm --------------------------------------------------

/// The algorithm family of a key.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    Rsa,
    Ec,
    Ed25519,
}

impl KeyAlgorithm {
    pub fn of<T: HasPublic>(key: &PKeyRef<T>) -> Option<Self> {
        match key.id() {
            Id::RSA => Some(KeyAlgorithm::Rsa),
            Id::EC => Some(KeyAlgorithm::Ec),
            Id::ED25519 => Some(KeyAlgorithm::Ed25519),
            _ => None,
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            KeyAlgorithm::Rsa => "rsa",
            KeyAlgorithm::Ec => "ec",
            KeyAlgorithm::Ed25519 => "ed25519",
        };
        f.write_str(s)
    }
}

//------------ SignAlgo ------------------------------------------------------

/// A signature algorithm used for certificates and CRLs.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignAlgo {
    Sha256WithRsa,
    Sha384WithRsa,
    Sha512WithRsa,
    EcdsaWithSha256,
    EcdsaWithSha384,
    EcdsaWithSha512,
    Ed25519,
}

impl SignAlgo {
    /// The default algorithm for a key.
    pub fn default_for<T: HasPublic>(key: &PKeyRef<T>) -> Option<Self> {
        KeyAlgorithm::of(key).map(|alg| match alg {
            KeyAlgorithm::Rsa => SignAlgo::Sha256WithRsa,
            KeyAlgorithm::Ec => SignAlgo::EcdsaWithSha256,
            KeyAlgorithm::Ed25519 => SignAlgo::Ed25519,
        })
    }

    pub fn key_algorithm(self) -> KeyAlgorithm {
        match self {
            SignAlgo::Sha256WithRsa | SignAlgo::Sha384WithRsa | SignAlgo::Sha512WithRsa => KeyAlgorithm::Rsa,
            SignAlgo::EcdsaWithSha256 | SignAlgo::EcdsaWithSha384 | SignAlgo::EcdsaWithSha512 => KeyAlgorithm::Ec,
            SignAlgo::Ed25519 => KeyAlgorithm::Ed25519,
        }
    }

    /// The digest to hand to OpenSSL, the null digest for Ed25519.
    pub fn digest(self) -> MessageDigest {
        match self {
            SignAlgo::Sha256WithRsa | SignAlgo::EcdsaWithSha256 => MessageDigest::sha256(),
            SignAlgo::Sha384WithRsa | SignAlgo::EcdsaWithSha384 => MessageDigest::sha384(),
            SignAlgo::Sha512WithRsa | SignAlgo::EcdsaWithSha512 => MessageDigest::sha512(),
            SignAlgo::Ed25519 => MessageDigest::null(),
        }
    }

    pub fn is_digest_less(self) -> bool {
        matches!(self, SignAlgo::Ed25519)
    }

    pub fn oid(self) -> ObjectIdentifier {
        match self {
            SignAlgo::Sha256WithRsa => rfc5912::SHA_256_WITH_RSA_ENCRYPTION,
            SignAlgo::Sha384WithRsa => rfc5912::SHA_384_WITH_RSA_ENCRYPTION,
            SignAlgo::Sha512WithRsa => rfc5912::SHA_512_WITH_RSA_ENCRYPTION,
            SignAlgo::EcdsaWithSha256 => rfc5912::ECDSA_WITH_SHA_256,
            SignAlgo::EcdsaWithSha384 => rfc5912::ECDSA_WITH_SHA_384,
            SignAlgo::EcdsaWithSha512 => rfc5912::ECDSA_WITH_SHA_512,
            SignAlgo::Ed25519 => rfc8410::ID_ED_25519,
        }
    }

    /// The AlgorithmIdentifier, with NULL parameters for RSA and absent
    /// parameters otherwise (RFC 5754, RFC 8410).
    pub fn algorithm_identifier(self) -> AlgorithmIdentifierOwned {
        let parameters = match self.key_algorithm() {
            KeyAlgorithm::Rsa => Some(Any::from(AnyRef::NULL)),
            KeyAlgorithm::Ec | KeyAlgorithm::Ed25519 => None,
        };
        AlgorithmIdentifierOwned {
            oid: self.oid(),
            parameters,
        }
    }
}

impl fmt::Display for SignAlgo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            SignAlgo::Sha256WithRsa => "SHA256withRSA",
            SignAlgo::Sha384WithRsa => "SHA384withRSA",
            SignAlgo::Sha512WithRsa => "SHA512withRSA",
            SignAlgo::EcdsaWithSha256 => "SHA256withECDSA",
            SignAlgo::EcdsaWithSha384 => "SHA384withECDSA",
            SignAlgo::EcdsaWithSha512 => "SHA512withECDSA",
            SignAlgo::Ed25519 => "Ed25519",
        };
        f.write_str(s)
    }
}
