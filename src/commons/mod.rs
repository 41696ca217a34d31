//! Common types used by the various Certa components.

pub mod api;
pub mod clock;
pub mod crypto;
pub mod error;
pub mod x509;

//------------ Response Aliases ----------------------------------------------

pub type CaResult<T> = std::result::Result<T, error::Error>;
