//! Keeps track of public keys and subjects currently being certified.

use dashmap::DashSet;

use crate::commons::crypto::Fingerprint;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FingerprintKind {
    PublicKey,
    Subject,
}

/// A set of fingerprints with an issuance in progress, per CA.
pub trait InFlightRegistry: Send + Sync {
    /// Adds a fingerprint. Returns `false` if it was present already.
    fn add(&self, ca: u32, kind: FingerprintKind, fingerprint: Fingerprint) -> bool;

    fn remove(&self, ca: u32, kind: FingerprintKind, fingerprint: Fingerprint);

    fn contains(&self, ca: u32, kind: FingerprintKind, fingerprint: Fingerprint) -> bool;

    /// The number of fingerprints of the CA currently in flight.
    fn len(&self, ca: u32) -> usize;
}

//------------ ConcurrentInFlightRegistry ------------------------------------

#[derive(Debug, Default)]
pub struct ConcurrentInFlightRegistry {
    entries: DashSet<(u32, FingerprintKind, Fingerprint)>,
}

impl InFlightRegistry for ConcurrentInFlightRegistry {
    fn add(&self, ca: u32, kind: FingerprintKind, fingerprint: Fingerprint) -> bool {
        self.entries.insert((ca, kind, fingerprint))
    }

    fn remove(&self, ca: u32, kind: FingerprintKind, fingerprint: Fingerprint) {
        self.entries.remove(&(ca, kind, fingerprint));
    }

    fn contains(&self, ca: u32, kind: FingerprintKind, fingerprint: Fingerprint) -> bool {
        self.entries.contains(&(ca, kind, fingerprint))
    }

    fn len(&self, ca: u32) -> usize {
        self.entries.iter().filter(|entry| entry.0 == ca).count()
    }
}

//------------ InFlightGuard -------------------------------------------------

/// Removes the fingerprints it added when dropped.
///
/// Only fingerprints this guard actually inserted are removed, so an entry
/// held by a concurrent issuance is left alone.
pub struct InFlightGuard<'a> {
    registry: &'a dyn InFlightRegistry,
    ca: u32,
    added: Vec<(FingerprintKind, Fingerprint)>,
}

impl<'a> InFlightGuard<'a> {
    pub fn new(registry: &'a dyn InFlightRegistry, ca: u32) -> Self {
        InFlightGuard {
            registry,
            ca,
            added: vec![],
        }
    }

    /// Adds a fingerprint, returns `false` if it is in flight elsewhere.
    pub fn add(&mut self, kind: FingerprintKind, fingerprint: Fingerprint) -> bool {
        if self.registry.add(self.ca, kind, fingerprint) {
            self.added.push((kind, fingerprint));
            true
        } else {
            false
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        for (kind, fingerprint) in self.added.drain(..) {
            self.registry.remove(self.ca, kind, fingerprint);
        }
    }
}
