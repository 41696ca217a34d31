//! The _Certa_ library crate.
//!
//! Certa is the issuing engine of an X.509 certificate authority. It turns
//! certificate requests into certificates according to a certificate
//! profile, keeps track of revocations, produces full and delta CRLs on a
//! schedule and propagates every change to a set of publishers.

pub mod commons;
pub mod config;
pub mod constants;
pub mod server;
