//! Certificate authorities.

mod authority;
pub use self::authority::*;

mod crl;
pub use self::crl::*;

pub mod inflight;
pub use self::inflight::{ConcurrentInFlightRegistry, FingerprintKind, InFlightGuard, InFlightRegistry};

mod info;
pub use self::info::*;

mod issuance;

mod maintenance;

mod publish;
pub use self::publish::*;

mod revocation;
