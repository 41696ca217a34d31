//! Data structures exchanged with the engine.

mod ca;
pub use self::ca::*;

mod cert;
pub use self::cert::*;

mod crl;
pub use self::crl::*;

mod health;
pub use self::health::*;

mod revocation;
pub use self::revocation::*;
