use std::fmt;

use der::Decode;
use openssl::bn::BigNumRef;
use openssl::pkey::{PKey, Public};
use serde::{Serialize, Serializer};
use spki::SubjectPublicKeyInfoRef;

use super::KeyAlgorithm;

//------------ Fingerprint ---------------------------------------------------

/// A short fingerprint of a canonical subject or public key.
///
/// The first eight bytes of the SHA-1 hash, used for duplicate detection
/// and lookups.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub fn of(data: &[u8]) -> Self {
        let digest = openssl::sha::sha1(data);
        let mut first = [0u8; 8];
        first.copy_from_slice(&digest[..8]);
        Fingerprint(u64::from_be_bytes(first))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(s)
    }
}

//------------ PublicKeyInfo -------------------------------------------------

/// A public key in its canonical SubjectPublicKeyInfo DER encoding.
#[derive(Clone, Eq, PartialEq)]
pub struct PublicKeyInfo {
    der: Vec<u8>,
}

impl PublicKeyInfo {
    /// Parses a SubjectPublicKeyInfo and re-encodes it canonically.
    pub fn from_der(der: &[u8]) -> Result<Self, openssl::error::ErrorStack> {
        let key = PKey::public_key_from_der(der)?;
        Self::from_pkey(&key)
    }

    pub fn from_pkey(key: &PKey<Public>) -> Result<Self, openssl::error::ErrorStack> {
        Ok(PublicKeyInfo {
            der: key.public_key_to_der()?,
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn pkey(&self) -> Result<PKey<Public>, openssl::error::ErrorStack> {
        PKey::public_key_from_der(&self.der)
    }

    pub fn algorithm(&self) -> Option<KeyAlgorithm> {
        self.pkey().ok().and_then(|key| KeyAlgorithm::of(&key))
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.der)
    }

    /// The SHA-1 hash of the subjectPublicKey bits, as used for key
    /// identifier extensions.
    pub fn key_identifier(&self) -> Result<Vec<u8>, der::Error> {
        let spki = SubjectPublicKeyInfoRef::from_der(&self.der)?;
        Ok(openssl::sha::sha1(spki.subject_public_key.raw_bytes()).to_vec())
    }

    /// The modulus size for RSA keys.
    pub fn rsa_bits(&self) -> Option<u32> {
        let key = self.pkey().ok()?;
        key.rsa().ok().map(|rsa| rsa.n().num_bits() as u32)
    }

    /// Whether this is an RSA key generated by a library with the ROCA
    /// weakness (CVE-2017-15361).
    pub fn is_roca_vulnerable(&self) -> bool {
        let Ok(key) = self.pkey() else {
            return false;
        };
        let Ok(rsa) = key.rsa() else {
            return false;
        };
        is_roca_modulus(rsa.n())
    }
}

impl fmt::Debug for PublicKeyInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PublicKeyInfo({})", self.fingerprint())
    }
}

//------------ ROCA detection ------------------------------------------------

const ROCA_GENERATOR: u64 = 65537;

const ROCA_PRIMES: &[u64] = &[
    3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89, 97, 101, 103, 107, 109,
    113, 127, 131, 137, 139, 149, 151, 157, 163, 167,
];

/// Affected moduli have the form `k * M + (65537^a mod M)` where `M` is
/// the product of small primes. Their residue modulo each of these primes
/// therefore lies in the subgroup generated by 65537.
pub fn is_roca_modulus(n: &BigNumRef) -> bool {
    for prime in ROCA_PRIMES {
        let Ok(residue) = n.mod_word(*prime as u32) else {
            return false;
        };
        if !in_generated_subgroup(residue as u64, *prime) {
            return false;
        }
    }
    true
}

fn in_generated_subgroup(residue: u64, prime: u64) -> bool {
    let generator = ROCA_GENERATOR % prime;
    let mut element = 1;
    loop {
        if element == residue {
            return true;
        }
        element = element * generator % prime;
        if element == 1 {
            return false;
        }
    }
}
