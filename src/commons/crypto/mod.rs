//! Signature algorithms, signer pools and public keys.

mod algorithm;
pub use self::algorithm::*;

mod keys;
pub use self::keys::*;

mod signer;
pub use self::signer::*;
